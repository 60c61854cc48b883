//! Helpers for building chains in tests.

use crate::U256;
use crate::chain::{ShareChain, ThinkConfig};
use crate::forest::ForestItem;
use crate::pack::VarStr;
use crate::params::NetworkParams;
use crate::sha256::Hash;
use crate::types::{
    BlockHeader, FloatingInteger, Script, Share, ShareContents, ShareData, StaleInfo,
    generate_share_transaction,
};
use crate::util::{MerkleLink, now};
use std::sync::Arc;

/// Minimal forest item: identity derived from `id`, one unit of work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestItem {
    hash: Hash,
    previous: Hash,
}

impl TestItem {
    pub fn new(id: u32, previous: Hash) -> Self {
        TestItem {
            hash: Hash::hash256(&id.to_le_bytes()),
            previous,
        }
    }
}

impl ForestItem for TestItem {
    fn hash(&self) -> Hash {
        self.hash
    }
    fn previous_hash(&self) -> Hash {
        self.previous
    }
    fn work(&self) -> U256 {
        U256::one()
    }
    fn min_work(&self) -> U256 {
        U256::one()
    }
}

/// Small chain with trivially easy shares.
pub fn test_params() -> NetworkParams {
    NetworkParams {
        name: "test".to_string(),
        identifier: 0x1122_3344_5566_7788,
        prefix: 0x99aa_bbcc_ddee_ff00,
        chain_length: 20,
        real_chain_length: 20,
        target_lookbehind: 5,
        share_period: 10,
        spread: 3,
        min_target: U256::zero(),
        max_target: U256::MAX,
        donation_script: Script(vec![0x51]),
        p2p_port: 0,
        ..NetworkParams::default()
    }
}

/// Mines valid shares on top of its own [`ShareChain`].
pub struct ChainBuilder {
    pub chain: ShareChain,
    pub previous_block: Hash,
    pub block_bits: FloatingInteger,
    pub subsidy: u64,
    /// target asked of new shares, clipped by retargeting
    pub desired_target: U256,
    pub donation: u16,
    counter: u64,
    base_timestamp: u32,
}

impl ChainBuilder {
    pub fn new(net: NetworkParams) -> Self {
        ChainBuilder {
            chain: ShareChain::new(Arc::new(net), ThinkConfig::default()),
            previous_block: Hash::hash256(b"upstream tip"),
            block_bits: FloatingInteger(0x1d00_ffff),
            subsidy: 50_0000_0000,
            desired_target: U256::MAX,
            donation: 0,
            counter: 0,
            base_timestamp: (now() - 20_000) as u32,
        }
    }

    /// Pay-to-pubkey-hash style script unique to `n`.
    pub fn script(n: u8) -> Script {
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend([n; 20]);
        script.extend([0x88, 0xac]);
        Script(script)
    }

    /// Contents of a new share on `previous`, not yet meeting its target.
    pub fn contents(&mut self, previous: Hash, payout_script: Script) -> ShareContents {
        self.counter += 1;
        let timestamp = match self.chain.get(&previous) {
            Some(parent) => parent.timestamp() + self.chain.net.share_period as u32,
            None => self.base_timestamp,
        };
        let mut coinbase = vec![0x08];
        coinbase.extend(self.counter.to_le_bytes());
        let share_data = ShareData {
            previous_share_hash: previous,
            coinbase: VarStr(coinbase),
            nonce: VarStr(self.counter.to_le_bytes().to_vec()),
            payout_script,
            subsidy: self.subsidy,
            donation: self.donation,
            stale_info: StaleInfo::Fresh,
        };
        let (share_info, gentx) = generate_share_transaction(
            &mut self.chain,
            share_data,
            self.block_bits.target(),
            timestamp,
            self.desired_target,
            self.counter,
        )
        .expect("parent is known to the builder");
        ShareContents {
            header: BlockHeader {
                version: 1,
                previous_block: self.previous_block,
                merkle_root: gentx.hash(),
                timestamp,
                bits: self.block_bits,
                nonce: 0,
            },
            share_info,
            merkle_link: MerkleLink::default(),
            last_txout_nonce: self.counter,
            other_txs: Some(Vec::new()),
        }
    }

    /// Searches header nonces until the share meets its own target.
    pub fn grind(mut contents: ShareContents) -> ShareContents {
        let target = contents.share_info.bits.target();
        while !contents.header.hash().matches_target(target) {
            contents.header.nonce += 1;
        }
        contents
    }

    /// Mines a share on `previous` and adds it to the builder's chain.
    pub fn mine(&mut self, previous: Hash, payout_script: Script) -> Arc<Share> {
        let contents = Self::grind(self.contents(previous, payout_script));
        let share = Share::new(contents, &self.chain.net, None).expect("mined share is well formed");
        self.chain.add_share(share).expect("mined share is new")
    }

    pub fn mine_line(&mut self, previous: Hash, count: usize, payout_script: Script) -> Vec<Arc<Share>> {
        let mut shares = Vec::with_capacity(count);
        let mut previous = previous;
        for _ in 0..count {
            let share = self.mine(previous, payout_script.clone());
            previous = share.hash;
            shares.push(share);
        }
        shares
    }
}
