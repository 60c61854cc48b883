//! Work handed to miners, and the way their shares come back in.

use crate::Node;
use rand::Rng;
use sharelib::U256;
use sharelib::error::{PoolError, Result};
use sharelib::pack::VarStr;
use sharelib::sha256::Hash;
use sharelib::types::{
    BlockHeader, Script, Share, ShareContents, ShareData, ShareInfo, StaleInfo, Transaction,
    generate_share_transaction,
};
use sharelib::util::{MerkleLink, calculate_merkle_link, check_merkle_link};
use std::collections::HashMap;
use tracing::info;

/// Snapshot of the share chain for status displays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainState {
    pub best_share: Option<Hash>,
    /// known shares from the best share down to its tail
    pub best_length: u64,
    pub shares: usize,
    pub verified: usize,
    pub heads: usize,
    pub peers: usize,
    pub desired: usize,
    pub pool_attempts_per_second: Option<U256>,
}

/// Everything needed to mine one share. Only the header nonce is left for
/// the miner to vary.
#[derive(Clone, Debug)]
pub struct WorkTemplate {
    pub share_info: ShareInfo,
    pub gentx: Transaction,
    pub merkle_link: MerkleLink,
    pub header: BlockHeader,
    pub share_target: U256,
    pub block_target: U256,
    pub other_txs: Vec<Transaction>,
    pub last_txout_nonce: u64,
}

impl WorkTemplate {
    pub fn contents(&self, nonce: u32) -> ShareContents {
        let mut header = self.header.clone();
        header.nonce = nonce;
        ShareContents {
            header,
            share_info: self.share_info.clone(),
            merkle_link: self.merkle_link.clone(),
            last_txout_nonce: self.last_txout_nonce,
            other_txs: Some(self.other_txs.clone()),
        }
    }

    /// Whether `nonce` produces a share (and possibly a block).
    pub fn check_nonce(&self, nonce: u32) -> (bool, bool) {
        let mut header = self.header.clone();
        header.nonce = nonce;
        let hash = header.hash();
        (
            hash.matches_target(self.share_target),
            hash.matches_target(self.block_target),
        )
    }
}

/// Coinbase script: the upstream height followed by random extra bytes.
fn coinbase_script(height: i64) -> VarStr {
    let height = height.clamp(0, i64::from(u32::MAX)) as u32;
    let mut script = vec![0x04];
    script.extend(height.to_le_bytes());
    script.push(0x08);
    script.extend(rand::thread_rng().r#gen::<[u8; 8]>());
    VarStr(script)
}

impl Node {
    pub async fn chain_state(&self) -> ChainState {
        let best_share = self.best_share();
        let mut chain = self.chain.lock().await;
        let (best_length, pool_attempts_per_second) = match best_share {
            Some(best) => {
                let length = chain.items.get_length(&best);
                let rate = if length >= 2 {
                    let dist = length.min(self.net.target_lookbehind).max(2);
                    chain.pool_attempts_per_second(&best, dist, false).ok()
                } else {
                    None
                };
                (length, rate)
            }
            None => (0, None),
        };
        ChainState {
            best_share,
            best_length,
            shares: chain.items.len(),
            verified: chain.verified.len(),
            heads: chain.items.heads().len(),
            peers: self.peers.len(),
            desired: self.desired.borrow().len(),
            pool_attempts_per_second,
        }
    }

    /// Builds a share on top of the current best share, paying the share's
    /// part of the block reward to `payout_script`.
    pub async fn build_work_template(
        &self,
        payout_script: Script,
        donation: u16,
        desired_target: U256,
    ) -> Result<WorkTemplate> {
        if payout_script.len() > self.net.limits.max_payout_script_len {
            return Err(PoolError::MalformedShare(format!(
                "payout script is {} bytes",
                payout_script.len()
            )));
        }
        let work = self.upstream.current_work();
        let previous_share_hash = self.best_share().unwrap_or_default();
        let (nonce, last_txout_nonce) = {
            let mut rng = rand::thread_rng();
            (rng.r#gen::<[u8; 4]>(), rng.r#gen::<u64>())
        };
        let share_data = ShareData {
            previous_share_hash,
            coinbase: coinbase_script(work.height),
            nonce: VarStr(nonce.to_vec()),
            payout_script,
            subsidy: work.subsidy,
            donation,
            stale_info: StaleInfo::Fresh,
        };
        let block_target = work.bits.target();
        let timestamp = sharelib::util::now().clamp(0, i64::from(u32::MAX)) as u32;
        let (share_info, gentx) = {
            let mut chain = self.chain.lock().await;
            generate_share_transaction(
                &mut chain,
                share_data,
                block_target,
                timestamp,
                desired_target,
                last_txout_nonce,
            )?
        };

        let leaves: Vec<Hash> = std::iter::once(Hash::zero())
            .chain(work.transactions.iter().map(Transaction::hash))
            .collect();
        let merkle_link = calculate_merkle_link(&leaves, 0);
        let merkle_root = check_merkle_link(gentx.hash(), &merkle_link).ok_or_else(|| {
            PoolError::InvalidShare("merkle link does not resolve".to_string())
        })?;
        let header = BlockHeader {
            version: work.version,
            previous_block: work.previous_block,
            merkle_root,
            timestamp: share_info.timestamp,
            bits: work.bits,
            nonce: 0,
        };
        Ok(WorkTemplate {
            share_target: share_info.bits.target(),
            block_target,
            share_info,
            gentx,
            merkle_link,
            header,
            other_txs: work.transactions,
            last_txout_nonce,
        })
    }

    /// What each payout script would get if the next block were found on
    /// the current best share.
    pub async fn expected_payouts(&self) -> Result<HashMap<Script, u64>> {
        let Some(best) = self.best_share() else {
            return Ok(HashMap::new());
        };
        let work = self.upstream.current_work();
        self.chain
            .lock()
            .await
            .get_expected_payouts(&best, work.bits.target(), work.subsidy)
    }

    /// Takes in a share mined locally from a [`WorkTemplate`].
    pub async fn admit_mined_share(&self, contents: ShareContents) -> Result<Hash> {
        let share = Share::new(contents, &self.net, None)?;
        let hash = share.hash;
        {
            let mut chain = self.chain.lock().await;
            if chain.contains(&hash) {
                return Err(PoolError::DuplicateShare(hash));
            }
            chain.add_share(share)?;
        }
        info!("mined share {hash}");
        self.set_best_share().await;
        Ok(hash)
    }
}
