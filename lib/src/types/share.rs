use super::{
    Block, BlockHeader, FloatingInteger, OutPoint, Script, Transaction, TxIn, TxOut,
    average_attempts_to_target, sigop_count, target_to_average_attempts,
};
use crate::chain::ShareChain;
use crate::error::{PoolError, Result};
use crate::forest::ForestItem;
use crate::pack::{Pack, VarInt, VarStr};
use crate::params::NetworkParams;
use crate::sha256::Hash;
use crate::util::{self, MerkleLink, calculate_merkle_link, check_merkle_link};
use crate::weights::{compute_payouts, payout_outputs};
use crate::{
    DONATION_SCALE, FAR_SHARE_DISTANCE, MAX_FUTURE_TIMESTAMP, SHARE_TYPE, U256, impl_pack,
    impl_pack_enum,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaleInfo {
    Fresh,
    Orphan,
    DeadOnArrival,
}
impl_pack_enum!(StaleInfo as u8 {
    Fresh = 0,
    Orphan = 253,
    DeadOnArrival = 254,
});

/// Data chosen by the miner of a share.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShareData {
    /// `Hash::zero()` for the root of the chain
    pub previous_share_hash: Hash,
    pub coinbase: VarStr,
    pub nonce: VarStr,
    pub payout_script: Script,
    pub subsidy: u64,
    /// fraction of this share's weight given away, out of 65535
    pub donation: u16,
    pub stale_info: StaleInfo,
}
impl_pack!(ShareData {
    previous_share_hash,
    coinbase,
    nonce,
    payout_script,
    subsidy,
    donation,
    stale_info,
});

/// Everything a share commits to; fully determined by `share_data` and the
/// ancestry it names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShareInfo {
    pub share_data: ShareData,
    pub far_share_hash: Hash,
    pub max_bits: FloatingInteger,
    pub bits: FloatingInteger,
    pub timestamp: u32,
    pub absheight: u32,
    pub abswork: u128,
}
impl_pack!(ShareInfo {
    share_data,
    far_share_hash,
    max_bits,
    bits,
    timestamp,
    absheight,
    abswork,
});

/// Wire form of a share.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShareContents {
    pub header: BlockHeader,
    pub share_info: ShareInfo,
    /// path from the generation transaction to `header.merkle_root`
    pub merkle_link: MerkleLink,
    pub last_txout_nonce: u64,
    pub other_txs: Option<Vec<Transaction>>,
}
impl_pack!(ShareContents {
    header,
    share_info,
    merkle_link,
    last_txout_nonce,
    other_txs,
});

/// Versioned envelope; peers skip types they do not understand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawShare {
    pub share_type: VarInt,
    pub contents: VarStr,
}
impl_pack!(RawShare {
    share_type,
    contents
});

/// Result of comparing a share against the current upstream work.
/// Ordered from most to least preferred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Punishment {
    BlockSolution,
    None,
    BlockStale,
}

#[derive(Clone, Debug)]
pub struct Share {
    pub contents: ShareContents,
    pub hash: Hash,
    pub target: U256,
    pub max_target: U256,
    /// `None` for shares produced locally
    pub peer_addr: Option<SocketAddr>,
    pub time_seen: i64,
}

fn malformed(reason: String) -> PoolError {
    PoolError::MalformedShare(reason)
}

impl Share {
    /// Decodes and applies the field limits of `net`.
    pub fn new(
        contents: ShareContents,
        net: &NetworkParams,
        peer_addr: Option<SocketAddr>,
    ) -> Result<Self> {
        let limits = &net.limits;
        let data = &contents.share_info.share_data;
        if data.payout_script.len() > limits.max_payout_script_len {
            return Err(malformed(format!(
                "payout script is {} bytes, limit {}",
                data.payout_script.len(),
                limits.max_payout_script_len
            )));
        }
        if !(limits.min_coinbase_len..=limits.max_coinbase_len).contains(&data.coinbase.len()) {
            return Err(malformed(format!(
                "coinbase is {} bytes, allowed {}..={}",
                data.coinbase.len(),
                limits.min_coinbase_len,
                limits.max_coinbase_len
            )));
        }
        if data.nonce.len() > limits.max_nonce_len {
            return Err(malformed(format!("nonce is {} bytes", data.nonce.len())));
        }
        if contents.merkle_link.branch.len() > limits.max_merkle_branch {
            return Err(malformed(format!(
                "merkle branch has {} entries",
                contents.merkle_link.branch.len()
            )));
        }
        let sigops = sigop_count(data.coinbase.as_ref()) + data.payout_script.sigop_count();
        if sigops > limits.max_sigops {
            return Err(malformed(format!("{sigops} signature operations")));
        }

        let hash = contents.header.hash();
        let target = contents.share_info.bits.target();
        let max_target = contents.share_info.max_bits.target();
        if target > net.max_target {
            return Err(malformed("share target above network maximum".to_string()));
        }
        if !hash.matches_target(target) {
            return Err(malformed(format!("share {hash} does not meet its target")));
        }
        Ok(Share {
            contents,
            hash,
            target,
            max_target,
            peer_addr,
            time_seen: util::now(),
        })
    }

    /// `Ok(None)` for share types this build does not know.
    pub fn from_raw(
        raw: &RawShare,
        net: &NetworkParams,
        peer_addr: Option<SocketAddr>,
    ) -> Result<Option<Self>> {
        if raw.share_type.0 != SHARE_TYPE {
            return Ok(None);
        }
        let contents = ShareContents::unpack(raw.contents.as_ref())
            .map_err(|e| malformed(format!("undecodable share: {e}")))?;
        Self::new(contents, net, peer_addr).map(Some)
    }

    pub fn to_raw(&self) -> RawShare {
        RawShare {
            share_type: VarInt(SHARE_TYPE),
            contents: VarStr(self.contents.pack()),
        }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.contents.header
    }
    pub fn share_info(&self) -> &ShareInfo {
        &self.contents.share_info
    }
    pub fn share_data(&self) -> &ShareData {
        &self.contents.share_info.share_data
    }
    pub fn previous_share_hash(&self) -> Hash {
        self.share_data().previous_share_hash
    }
    pub fn timestamp(&self) -> u32 {
        self.share_info().timestamp
    }
    pub fn payout_script(&self) -> &Script {
        &self.share_data().payout_script
    }
    pub fn is_block_solution(&self) -> bool {
        self.hash.matches_target(self.header().bits.target())
    }

    /// Regenerates what this share must contain given its ancestry and
    /// returns the generation transaction on success.
    pub fn check(&self, chain: &mut ShareChain) -> Result<Transaction> {
        let previous = self.previous_share_hash();
        if !previous.is_zero() && !chain.items.contains(&previous) {
            return Err(PoolError::MissingAncestor(previous));
        }
        if i64::from(self.timestamp()) > util::now() + MAX_FUTURE_TIMESTAMP {
            return Err(PoolError::InvalidShare(format!(
                "share {} timestamp is too far in the future",
                self.hash
            )));
        }

        let (share_info, gentx) = generate_share_transaction(
            chain,
            self.share_data().clone(),
            self.header().bits.target(),
            self.timestamp(),
            self.target,
            self.contents.last_txout_nonce,
        )?;
        if share_info != self.contents.share_info {
            return Err(PoolError::InvalidShare(format!(
                "share {} info does not match its ancestry",
                self.hash
            )));
        }
        if check_merkle_link(gentx.hash(), &self.contents.merkle_link)
            != Some(self.header().merkle_root)
        {
            return Err(PoolError::InvalidShare(format!(
                "share {} merkle root does not commit to its generation transaction",
                self.hash
            )));
        }
        if let Some(other_txs) = &self.contents.other_txs {
            let hashes: Vec<Hash> = std::iter::once(Hash::zero())
                .chain(other_txs.iter().map(Transaction::hash))
                .collect();
            if calculate_merkle_link(&hashes, 0) != self.contents.merkle_link {
                return Err(PoolError::InvalidShare(format!(
                    "share {} merkle link does not match its transactions",
                    self.hash
                )));
            }
        }
        Ok(gentx)
    }

    pub fn should_punish(&self, previous_block: &Hash, bits: FloatingInteger) -> Punishment {
        let header = self.header();
        let stale = header.previous_block != *previous_block || header.bits != bits;
        if stale && self.hash != *previous_block && self.peer_addr.is_some() {
            return Punishment::BlockStale;
        }
        if self.is_block_solution() {
            return Punishment::BlockSolution;
        }
        Punishment::None
    }

    /// Full block, when the transactions behind the merkle link are known.
    pub fn as_block(&self, gentx: Transaction) -> Option<Block> {
        let other_txs = self.contents.other_txs.as_ref()?;
        let mut transactions = Vec::with_capacity(other_txs.len() + 1);
        transactions.push(gentx);
        transactions.extend(other_txs.iter().cloned());
        Some(Block::new(self.header().clone(), transactions))
    }
}

impl ForestItem for Share {
    fn hash(&self) -> Hash {
        self.hash
    }
    fn previous_hash(&self) -> Hash {
        self.previous_share_hash()
    }
    fn work(&self) -> U256 {
        target_to_average_attempts(self.target)
    }
    fn min_work(&self) -> U256 {
        target_to_average_attempts(self.max_target)
    }
}

/// Commitment of a share's info, bound to the network identifier.
pub fn ref_hash(net: &NetworkParams, share_info: &ShareInfo) -> Hash {
    let mut data = net.identifier_bytes().to_vec();
    share_info.write(&mut data);
    Hash::hash256(&data)
}

fn commitment_script(commitment: Hash, last_txout_nonce: u64) -> Script {
    // OP_RETURN <40 bytes>
    let mut script = vec![0x6a, 0x28];
    script.extend_from_slice(commitment.as_bytes());
    script.extend_from_slice(&last_txout_nonce.to_le_bytes());
    Script(script)
}

fn clip<T: Ord>(value: T, low: T, high: T) -> T {
    if value < low {
        low
    } else if value > high {
        high
    } else {
        value
    }
}

/// Builds the share info and generation transaction for a share extending
/// `share_data.previous_share_hash`.
pub fn generate_share_transaction(
    chain: &mut ShareChain,
    share_data: ShareData,
    block_target: U256,
    desired_timestamp: u32,
    desired_target: U256,
    last_txout_nonce: u64,
) -> Result<(ShareInfo, Transaction)> {
    let net = chain.net.clone();
    let previous_hash = share_data.previous_share_hash;
    let previous: Option<Arc<Share>> = if previous_hash.is_zero() {
        None
    } else {
        Some(
            chain
                .items
                .get(&previous_hash)
                .cloned()
                .ok_or(PoolError::MissingAncestor(previous_hash))?,
        )
    };
    let (length, last) = chain.items.get_length_and_last(&previous_hash);
    if length < net.real_chain_length && !last.is_zero() {
        return Err(PoolError::MissingAncestor(last));
    }

    let pre_target = match &previous {
        Some(previous) if length >= net.target_lookbehind => {
            let rate = chain.pool_attempts_per_second(&previous_hash, net.target_lookbehind, true)?;
            let raw = if rate.is_zero() {
                U256::MAX
            } else {
                average_attempts_to_target(rate.saturating_mul(U256::from(net.share_period)))
            };
            let low = previous.max_target / 10 * 9;
            let high = (previous.max_target / 10)
                .checked_mul(U256::from(11u64))
                .unwrap_or(U256::MAX);
            clip(clip(raw, low, high), net.min_target, net.max_target)
        }
        _ => net.max_target,
    };
    let max_bits = FloatingInteger::from_target_upper_bound(pre_target);
    let bits = FloatingInteger::from_target_upper_bound(clip(
        desired_target,
        pre_target / 30,
        pre_target,
    ));

    let far_share_hash = if length >= FAR_SHARE_DISTANCE {
        chain.items.get_nth_parent_hash(&previous_hash, FAR_SHARE_DISTANCE)?
    } else if last.is_zero() {
        Hash::zero()
    } else {
        return Err(PoolError::MissingAncestor(last));
    };

    let timestamp = match &previous {
        Some(previous) => clip(
            desired_timestamp,
            previous.timestamp().saturating_add(1),
            previous
                .timestamp()
                .saturating_add((2 * net.share_period).saturating_sub(1) as u32),
        ),
        None => desired_timestamp,
    };
    let absheight = previous
        .as_ref()
        .map_or(0, |p| p.share_info().absheight)
        .wrapping_add(1);
    let abswork = previous
        .as_ref()
        .map_or(0, |p| p.share_info().abswork)
        .wrapping_add(target_to_average_attempts(bits.target()).low_u128());

    let window_start = previous
        .as_ref()
        .map_or(Hash::zero(), |p| p.previous_share_hash());
    let max_shares = length.min(net.real_chain_length).saturating_sub(1);
    let scale = U256::from(DONATION_SCALE * net.spread.max(1));
    let desired_weight = target_to_average_attempts(block_target).min(U256::MAX / scale) * scale;
    let (weights, total_weight, donation_weight) =
        chain.get_cumulative_weights(&window_start, max_shares, desired_weight)?;
    debug_assert_eq!(
        total_weight,
        weights
            .values()
            .fold(donation_weight, |acc, weight| acc + *weight)
    );
    let amounts = compute_payouts(
        &weights,
        total_weight,
        share_data.subsidy,
        &share_data.payout_script,
        &net.donation_script,
    );

    let share_info = ShareInfo {
        share_data,
        far_share_hash,
        max_bits,
        bits,
        timestamp,
        absheight,
        abswork,
    };
    let mut tx_outs: Vec<TxOut> = payout_outputs(&amounts, &net.donation_script);
    tx_outs.push(TxOut {
        value: 0,
        script: commitment_script(ref_hash(&net, &share_info), last_txout_nonce),
    });
    let gentx = Transaction {
        version: 1,
        tx_ins: vec![TxIn {
            previous_output: OutPoint::null(),
            script: Script(share_info.share_data.coinbase.0.clone()),
            sequence: u32::MAX,
        }],
        tx_outs,
        lock_time: 0,
    };
    Ok((share_info, gentx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ChainBuilder, test_params};

    #[test]
    fn contents_round_trip() {
        let mut builder = ChainBuilder::new(test_params());
        let root = builder.mine(Hash::zero(), ChainBuilder::script(1));
        let child = builder.mine(root.hash, ChainBuilder::script(2));
        for share in [root, child] {
            let raw = share.to_raw();
            assert_eq!(RawShare::unpack(&raw.pack()).unwrap(), raw);
            let decoded = Share::from_raw(&raw, &builder.chain.net, None).unwrap().unwrap();
            assert_eq!(decoded.contents, share.contents);
            assert_eq!(decoded.hash, share.hash);
        }
    }

    #[test]
    fn unknown_share_type_is_skipped() {
        let raw = RawShare {
            share_type: VarInt(SHARE_TYPE + 1),
            contents: VarStr(vec![1, 2, 3]),
        };
        assert!(Share::from_raw(&raw, &test_params(), None).unwrap().is_none());
    }

    #[test]
    fn field_limits_are_enforced_on_decode() {
        let net = test_params();
        let mut builder = ChainBuilder::new(net.clone());
        let share = builder.mine(Hash::zero(), ChainBuilder::script(1));

        let mut contents = share.contents.clone();
        contents.share_info.share_data.payout_script =
            Script(vec![0x51; net.limits.max_payout_script_len + 1]);
        assert!(matches!(
            Share::new(contents, &net, None),
            Err(PoolError::MalformedShare(_))
        ));

        let mut contents = share.contents.clone();
        contents.share_info.share_data.coinbase = VarStr(vec![1]);
        assert!(matches!(
            Share::new(contents, &net, None),
            Err(PoolError::MalformedShare(_))
        ));

        let mut contents = share.contents.clone();
        contents.share_info.share_data.coinbase = VarStr(vec![0xae, 0xae]);
        assert!(matches!(
            Share::new(contents, &net, None),
            Err(PoolError::MalformedShare(_))
        ));
    }

    #[test]
    fn check_accepts_mined_shares() {
        let mut builder = ChainBuilder::new(test_params());
        let shares = builder.mine_line(Hash::zero(), 30, ChainBuilder::script(3));
        for share in &shares {
            let gentx = share.check(&mut builder.chain).unwrap();
            assert!(gentx.is_coinbase());
            assert_eq!(gentx.total_output(), share.share_data().subsidy);
        }
        assert_eq!(shares[29].share_info().absheight, 30);
        assert_eq!(shares[29].share_info().far_share_hash, Hash::zero());
    }

    #[test]
    fn check_rejects_tampered_share_info() {
        let net = test_params();
        let mut builder = ChainBuilder::new(net.clone());
        let root = builder.mine(Hash::zero(), ChainBuilder::script(1));
        let child = builder.mine(root.hash, ChainBuilder::script(2));

        // same header, different claimed payout
        let mut contents = child.contents.clone();
        contents.share_info.share_data.subsidy += 1;
        let forged = Share::new(contents, &net, None).unwrap();
        assert!(matches!(
            forged.check(&mut builder.chain),
            Err(PoolError::InvalidShare(_))
        ));
    }

    #[test]
    fn check_reports_missing_parent() {
        let net = test_params();
        let mut builder = ChainBuilder::new(net.clone());
        let root = builder.mine(Hash::zero(), ChainBuilder::script(1));
        let child = builder.mine(root.hash, ChainBuilder::script(2));
        let mut other = ChainBuilder::new(net);
        assert!(matches!(
            child.check(&mut other.chain),
            Err(PoolError::MissingAncestor(h)) if h == root.hash
        ));
    }

    #[test]
    fn punishment_prefers_current_upstream_block() {
        let mut builder = ChainBuilder::new(test_params());
        let mut share = (*builder.mine(Hash::zero(), ChainBuilder::script(1))).clone();
        let bits = builder.block_bits;
        assert_eq!(share.should_punish(&builder.previous_block, bits), Punishment::None);
        // locally mined shares are never stale
        assert_eq!(share.should_punish(&Hash::hash256(b"next"), bits), Punishment::None);
        share.peer_addr = Some("127.0.0.1:9333".parse().unwrap());
        assert_eq!(
            share.should_punish(&Hash::hash256(b"next"), bits),
            Punishment::BlockStale
        );
        assert!(Punishment::BlockSolution < Punishment::None);
    }
}
