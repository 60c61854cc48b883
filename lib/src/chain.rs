//! The share chain: every known share, the verified subset, and the logic
//! choosing which head to mine on.

use crate::error::{PoolError, Result};
use crate::forest::Tracker;
use crate::params::NetworkParams;
use crate::sha256::Hash;
use crate::skiplist::SkipList;
use crate::types::{FloatingInteger, Punishment, Script, Share, Transaction, target_to_average_attempts};
use crate::weights::{Weights, WeightsSkipList};
use crate::{DONATION_SCALE, MAX_SHARES_PER_REQUEST, U256};
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tuning of [`ShareChain::think`] and [`ShareChain::prune`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ThinkConfig {
    /// best-ranked heads never pruned
    pub keep_top_heads: usize,
    /// heads seen more recently than this are kept (seconds)
    pub recent_head_secs: i64,
    /// unverified branches whose bottom arrived this recently are kept
    pub pending_tail_secs: i64,
    pub max_prune_iterations: usize,
    /// a tail is dropped once all its heads are this many chain lengths above it...
    pub tail_drop_multiple: u64,
    /// ...plus this many shares
    pub tail_drop_margin: u64,
    /// desired shares older than the best share by more than this are not fetched
    pub desired_max_age: i64,
    /// same, when there is no best share yet
    pub idle_desired_max_age: i64,
}

impl Default for ThinkConfig {
    fn default() -> Self {
        ThinkConfig {
            keep_top_heads: 5,
            recent_head_secs: 300,
            pending_tail_secs: 120,
            max_prune_iterations: 1000,
            tail_drop_multiple: 2,
            tail_drop_margin: 10,
            desired_max_age: 60 * 60,
            idle_desired_max_age: 24 * 60 * 60,
        }
    }
}

/// Approximate lower bound on the hash rate behind a verified tail.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TailScore {
    /// verified length, capped at the chain length
    pub length: u64,
    /// attempts per second, known once the chain is long enough
    pub rate: Option<U256>,
}

/// Ranking of a head within the best tail; larger is better.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct HeadScore {
    pub punishment: Reverse<Punishment>,
    /// work up to the head's 5th ancestor
    pub work: U256,
    pub timestamp: u32,
}

/// A share we lack and the peer most likely to have it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Desired {
    pub peer_addr: Option<SocketAddr>,
    pub hash: Hash,
}

#[derive(Clone, Debug, Default)]
pub struct ThinkResult {
    pub best: Option<Hash>,
    pub desired: Vec<Desired>,
    /// ascending, best last
    pub decorated_heads: Vec<(HeadScore, Hash)>,
    pub bad_peer_addresses: HashSet<SocketAddr>,
}

pub struct ShareChain {
    pub net: Arc<NetworkParams>,
    pub config: ThinkConfig,
    pub items: Tracker<Arc<Share>>,
    pub verified: Tracker<Arc<Share>>,
    weights: SkipList<WeightsSkipList>,
    block_solutions: Vec<(Arc<Share>, Transaction)>,
}

struct DesiredCandidate {
    desired: Desired,
    /// newest timestamp among the shares just above the gap
    timestamp: u32,
    /// hardest target among the same shares
    target: U256,
}

/// Targets easier than twice what the best tail would need for one share
/// per share period are not worth downloading ancestors for.
fn desired_target_cutoff(share_period: u64, rate: Option<U256>) -> U256 {
    match rate {
        Some(rate) => {
            let attempts = rate.saturating_mul(U256::from(share_period)).saturating_add(U256::one());
            (U256::MAX / attempts).saturating_mul(U256::from(2u8))
        }
        None => U256::MAX,
    }
}

impl ShareChain {
    pub fn new(net: Arc<NetworkParams>, config: ThinkConfig) -> Self {
        ShareChain {
            net,
            config,
            items: Tracker::new(),
            verified: Tracker::new(),
            weights: SkipList::new(WeightsSkipList),
            block_solutions: Vec::new(),
        }
    }

    pub fn get(&self, hash: &Hash) -> Option<&Arc<Share>> {
        self.items.get(hash)
    }
    pub fn contains(&self, hash: &Hash) -> bool {
        self.items.contains(hash)
    }

    pub fn add_share(&mut self, share: Share) -> Result<Arc<Share>> {
        let share = Arc::new(share);
        self.items.add(share.clone())?;
        Ok(share)
    }

    /// Marks a share as verified without checking it, for shares whose
    /// verification was persisted.
    pub fn mark_verified(&mut self, hash: &Hash) -> bool {
        match self.items.get(hash).cloned() {
            Some(share) if !self.verified.contains(hash) => self.verified.add(share).is_ok(),
            _ => false,
        }
    }

    /// Removes a head or tail-most share from both trackers.
    pub fn remove_share(&mut self, hash: &Hash) -> Result<Arc<Share>> {
        if !self.items.can_remove(hash) {
            return Err(if self.items.contains(hash) {
                PoolError::NotRemovable(*hash)
            } else {
                PoolError::UnknownShare(*hash)
            });
        }
        if self.verified.contains(hash) {
            self.verified.remove(hash)?;
        }
        let share = self.items.remove(hash)?;
        self.weights.forget(hash);
        Ok(share)
    }

    /// Verified shares whose proof of work also solves an upstream block.
    pub fn take_block_solutions(&mut self) -> Vec<(Arc<Share>, Transaction)> {
        std::mem::take(&mut self.block_solutions)
    }

    pub fn attempt_verify(&mut self, share: &Arc<Share>) -> Result<()> {
        if self.verified.contains(&share.hash) {
            return Ok(());
        }
        let (length, last) = self.items.get_length_and_last(&share.hash);
        if length <= self.net.chain_length && !last.is_zero() {
            return Err(PoolError::MissingAncestor(last));
        }
        let gentx = share.check(self)?;
        self.verified.add(share.clone())?;
        if share.is_block_solution() {
            info!("share {} solves an upstream block", share.hash);
            self.block_solutions.push((share.clone(), gentx));
        }
        Ok(())
    }

    /// Payout weights of up to `max_shares` shares starting at `start`,
    /// stopping once `desired_weight` is reached.
    pub fn get_cumulative_weights(
        &mut self,
        start: &Hash,
        max_shares: u64,
        desired_weight: U256,
    ) -> Result<(Weights, U256, U256)> {
        self.weights
            .query(self.items.items(), *start, &(max_shares, desired_weight))
    }

    /// Attempts per second over the `dist` shares ending at `hash`.
    pub fn pool_attempts_per_second(&mut self, hash: &Hash, dist: u64, min_work: bool) -> Result<U256> {
        assert!(dist >= 2, "need two shares to measure a rate");
        let near = self
            .items
            .get(hash)
            .cloned()
            .ok_or(PoolError::UnknownShare(*hash))?;
        let far_hash = self.items.get_nth_parent_hash(hash, dist - 1)?;
        let far = self
            .items
            .get(&far_hash)
            .cloned()
            .ok_or(PoolError::UnknownShare(far_hash))?;
        let delta = self.items.get_delta(hash, &far_hash);
        let attempts = if min_work { delta.min_work } else { delta.work };
        let elapsed = i64::from(near.timestamp()) - i64::from(far.timestamp());
        Ok(attempts / U256::from(elapsed.max(1) as u64))
    }

    fn peer_of_child(tracker: &Tracker<Arc<Share>>, hash: &Hash) -> Option<SocketAddr> {
        let child = tracker
            .children(hash)?
            .iter()
            .choose(&mut rand::thread_rng())?;
        tracker.get(child)?.peer_addr
    }

    fn chain_summary(&mut self, head: &Hash) -> (u32, U256) {
        let length = self.items.get_length(head).min(5);
        let Ok(chain) = self.items.get_chain(head, length) else {
            return (0, U256::MAX);
        };
        chain.fold((0, U256::MAX), |(timestamp, target), share| {
            (timestamp.max(share.timestamp()), target.min(share.target))
        })
    }

    fn collect(&mut self, hash: &Hash, length: u64) -> Vec<Arc<Share>> {
        self.items
            .get_chain(hash, length)
            .map(|chain| chain.cloned().collect())
            .unwrap_or_default()
    }

    /// Verifies what can be verified, then picks the best head.
    ///
    /// `block_rel_height` maps an upstream block hash to its height relative
    /// to the upstream tip (0 for the tip, negative below it).
    pub fn think(
        &mut self,
        block_rel_height: &dyn Fn(&Hash) -> i64,
        previous_block: &Hash,
        bits: FloatingInteger,
        now: i64,
    ) -> ThinkResult {
        let chain_length = self.net.chain_length;
        let mut desired: Vec<DesiredCandidate> = Vec::new();
        let mut bad_peer_addresses = HashSet::new();

        // verify unverified heads, walking down until something verifies
        let mut unverified: Vec<Hash> = self
            .items
            .heads()
            .keys()
            .filter(|head| !self.verified.heads().contains_key(head))
            .copied()
            .collect();
        unverified.sort();
        let mut bads = Vec::new();
        for head in unverified {
            let (length, last) = self.items.get_length_and_last(&head);
            let walk = if last.is_zero() {
                length
            } else {
                length.saturating_sub(chain_length).min(5)
            };
            let mut verified_any = false;
            for share in self.collect(&head, walk) {
                match self.attempt_verify(&share) {
                    Ok(()) => {
                        verified_any = true;
                        break;
                    }
                    Err(PoolError::MissingAncestor(hash)) => {
                        debug!("cannot verify {} yet, missing {hash}", share.hash);
                        break;
                    }
                    Err(e) => {
                        warn!("share {} failed verification: {e}", share.hash);
                        bads.push(share.hash);
                    }
                }
            }
            if !verified_any && !last.is_zero() {
                let (timestamp, target) = self.chain_summary(&head);
                desired.push(DesiredCandidate {
                    desired: Desired {
                        peer_addr: Self::peer_of_child(&self.items, &last),
                        hash: last,
                    },
                    timestamp,
                    target,
                });
            }
        }
        for bad in bads {
            debug_assert!(!self.verified.contains(&bad));
            if let Some(addr) = self.items.get(&bad).and_then(|share| share.peer_addr) {
                bad_peer_addresses.insert(addr);
            }
            match self.remove_share(&bad) {
                Ok(_) | Err(PoolError::NotRemovable(_)) | Err(PoolError::UnknownShare(_)) => {}
                Err(e) => warn!("dropping invalid share {bad}: {e}"),
            }
        }

        // extend verified heads down to the chain length
        let mut verified_heads: Vec<Hash> = self.verified.heads().keys().copied().collect();
        verified_heads.sort();
        for head in verified_heads {
            let (head_length, last_hash) = self.verified.get_length_and_last(&head);
            let (last_length, last_last) = self.items.get_length_and_last(&last_hash);
            let want = chain_length.saturating_sub(head_length);
            let can = if last_last.is_zero() {
                last_length
            } else {
                last_length.saturating_sub(chain_length + 1)
            };
            for share in self.collect(&last_hash, want.min(can)) {
                if let Err(e) = self.attempt_verify(&share) {
                    debug!("stopped extending {head} at {}: {e}", share.hash);
                    break;
                }
            }
            if head_length < chain_length && !last_last.is_zero() {
                let (timestamp, target) = self.chain_summary(&head);
                desired.push(DesiredCandidate {
                    desired: Desired {
                        peer_addr: Self::peer_of_child(&self.verified, &last_hash)
                            .or_else(|| Self::peer_of_child(&self.items, &last_last)),
                        hash: last_last,
                    },
                    timestamp,
                    target,
                });
            }
        }

        // best tail, scored by its heaviest head
        let tails: Vec<(Hash, Vec<Hash>)> = self
            .verified
            .tails()
            .iter()
            .map(|(tail, heads)| (*tail, heads.iter().copied().collect()))
            .collect();
        let mut decorated_tails = Vec::with_capacity(tails.len());
        for (tail, heads) in tails {
            let heaviest = heads
                .into_iter()
                .map(|head| (self.verified.get_work(&head), head))
                .max();
            if let Some((_, head)) = heaviest {
                decorated_tails.push((self.score(&head, block_rel_height), tail));
            }
        }
        decorated_tails.sort();
        let best_tail = decorated_tails.last().map(|(_, tail)| *tail);
        let best_tail_rate = decorated_tails.last().and_then(|(score, _)| score.rate);

        // best head within that tail
        let mut decorated_heads = Vec::new();
        if let Some(tail) = best_tail {
            let heads: Vec<Hash> = self
                .verified
                .tails()
                .get(&tail)
                .map(|heads| heads.iter().copied().collect())
                .unwrap_or_default();
            for head in heads {
                let Some(share) = self.items.get(&head).cloned() else {
                    continue;
                };
                let length = self.verified.get_length(&head);
                let work = match self.verified.get_nth_parent_hash(&head, length.min(5)) {
                    Ok(anchor) => self.verified.get_work(&anchor),
                    Err(_) => U256::zero(),
                };
                let score = HeadScore {
                    punishment: Reverse(share.should_punish(previous_block, bits)),
                    work,
                    timestamp: share.timestamp(),
                };
                decorated_heads.push((score, head));
            }
        }
        decorated_heads.sort();

        let mut best = decorated_heads.last().map(|(_, head)| *head);
        let best_share = best.and_then(|hash| self.items.get(&hash).cloned());
        let (timestamp_cutoff, target_cutoff) = match best_share {
            Some(best_share) => {
                if best_share.should_punish(previous_block, bits) == Punishment::BlockStale {
                    let parent = best_share.previous_share_hash();
                    info!(
                        "best share {} is block-stale, falling back to {parent}",
                        best_share.hash
                    );
                    best = (!parent.is_zero()).then_some(parent);
                }
                (
                    now.min(i64::from(best_share.timestamp())) - self.config.desired_max_age,
                    desired_target_cutoff(self.net.share_period, best_tail_rate),
                )
            }
            None => (now - self.config.idle_desired_max_age, U256::MAX),
        };

        let mut seen = HashSet::new();
        let desired = desired
            .into_iter()
            .filter(|candidate| {
                i64::from(candidate.timestamp) >= timestamp_cutoff && candidate.target <= target_cutoff
            })
            .map(|candidate| candidate.desired)
            .filter(|d| seen.insert(*d))
            .collect();

        ThinkResult {
            best,
            desired,
            decorated_heads,
            bad_peer_addresses,
        }
    }

    pub fn score(&mut self, head: &Hash, block_rel_height: &dyn Fn(&Hash) -> i64) -> TailScore {
        let chain_length = self.net.chain_length;
        let length = self.verified.get_length(head);
        if length < chain_length {
            return TailScore { length, rate: None };
        }
        let Ok(end_point) = self.verified.get_nth_parent_hash(head, chain_length * 15 / 16) else {
            return TailScore { length, rate: None };
        };
        let block_height = self
            .verified
            .get_chain(&end_point, chain_length / 16)
            .ok()
            .and_then(|chain| {
                chain
                    .map(|share| block_rel_height(&share.header().previous_block))
                    .max()
            })
            .unwrap_or(0);
        let work = self.verified.get_delta(head, &end_point).work;
        let seconds = (1 - block_height).max(1) as u64 * self.net.block_period.max(1);
        TailScore {
            length: chain_length,
            rate: Some(work / U256::from(seconds)),
        }
    }

    /// Drops stale heads and tails far below every head. Returns how many
    /// shares were removed.
    pub fn prune(&mut self, decorated_heads: &[(HeadScore, Hash)], now: i64) -> usize {
        let mut removed = 0;
        let keep: HashSet<Hash> = decorated_heads
            .iter()
            .rev()
            .take(self.config.keep_top_heads)
            .map(|(_, head)| *head)
            .collect();

        if !decorated_heads.is_empty() {
            for _ in 0..self.config.max_prune_iterations {
                let mut to_remove = Vec::new();
                for (head, tail) in self.items.heads() {
                    if keep.contains(head) {
                        continue;
                    }
                    let Some(share) = self.items.get(head) else {
                        continue;
                    };
                    if share.time_seen > now - self.config.recent_head_secs {
                        continue;
                    }
                    if !self.verified.contains(head) {
                        let bottom_seen = self
                            .items
                            .children(tail)
                            .into_iter()
                            .flatten()
                            .filter_map(|hash| self.items.get(hash))
                            .map(|share| share.time_seen)
                            .max();
                        if bottom_seen.is_some_and(|seen| seen > now - self.config.pending_tail_secs) {
                            continue;
                        }
                    }
                    to_remove.push(*head);
                }
                if to_remove.is_empty() {
                    break;
                }
                for hash in to_remove {
                    if self.remove_share(&hash).is_ok() {
                        removed += 1;
                    }
                }
            }
        }

        let threshold = self.config.tail_drop_multiple * self.net.chain_length + self.config.tail_drop_margin;
        for _ in 0..self.config.max_prune_iterations {
            let tails: Vec<(Hash, Vec<Hash>)> = self
                .items
                .tails()
                .iter()
                .map(|(tail, heads)| (*tail, heads.iter().copied().collect()))
                .collect();
            let mut to_remove = Vec::new();
            for (tail, heads) in tails {
                let shortest = heads
                    .iter()
                    .map(|head| self.items.get_length(head))
                    .min()
                    .unwrap_or(0);
                if shortest < threshold {
                    continue;
                }
                to_remove.extend(self.items.children(&tail).into_iter().flatten().copied());
            }
            if to_remove.is_empty() {
                break;
            }
            for hash in to_remove {
                match self.remove_share(&hash) {
                    Ok(_) => removed += 1,
                    Err(e) => debug!("kept {hash} while dropping tails: {e}"),
                }
            }
        }
        if removed > 0 {
            debug!("pruned {removed} shares, {} remain", self.items.len());
        }
        removed
    }

    /// Shares answering a request: up to `parents` ancestors of each hash,
    /// stopping at any hash in `stops`.
    pub fn handle_get_shares(&mut self, hashes: &[Hash], parents: u64, stops: &[Hash]) -> Vec<Arc<Share>> {
        if hashes.is_empty() {
            return Vec::new();
        }
        let parents = parents.min(MAX_SHARES_PER_REQUEST / hashes.len() as u64);
        let stops: HashSet<&Hash> = stops.iter().collect();
        let mut shares = Vec::new();
        for hash in hashes {
            let length = (parents + 1).min(self.items.get_length(hash));
            for share in self.collect(hash, length) {
                if stops.contains(&share.hash) {
                    break;
                }
                shares.push(share);
            }
        }
        shares
    }

    /// What each payout script would receive if a block were found on top
    /// of `best` right now.
    pub fn get_expected_payouts(
        &mut self,
        best: &Hash,
        block_target: U256,
        subsidy: u64,
    ) -> Result<HashMap<Script, u64>> {
        let length = self.items.get_length(best).min(self.net.real_chain_length);
        let scale = U256::from(DONATION_SCALE * self.net.spread.max(1));
        let desired_weight = target_to_average_attempts(block_target).min(U256::MAX / scale) * scale;
        let (weights, total_weight, _) = self.get_cumulative_weights(best, length, desired_weight)?;
        let mut amounts: HashMap<Script, u64> = HashMap::new();
        if !total_weight.is_zero() {
            for (script, weight) in weights {
                let amount = crate::U512::from(subsidy) * crate::U512::from(weight)
                    / crate::U512::from(total_weight);
                amounts.insert(script, amount.low_u64());
            }
        }
        let distributed: u64 = amounts.values().sum();
        *amounts.entry(self.net.donation_script.clone()).or_default() += subsidy - distributed;
        Ok(amounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ChainBuilder, test_params};

    fn at_tip(_: &Hash) -> i64 {
        0
    }

    fn think(builder: &mut ChainBuilder, now: i64) -> ThinkResult {
        let previous_block = builder.previous_block;
        let bits = builder.block_bits;
        builder.chain.think(&at_tip, &previous_block, bits, now)
    }

    #[test]
    fn longer_fork_wins() {
        let mut net = test_params();
        net.chain_length = 200;
        net.real_chain_length = 200;
        let mut builder = ChainBuilder::new(net);
        let trunk = builder.mine_line(Hash::zero(), 10, ChainBuilder::script(1));
        let fork = trunk[9].hash;
        let short = builder.mine_line(fork, 50, ChainBuilder::script(2));
        let long = builder.mine_line(fork, 52, ChainBuilder::script(3));

        let result = think(&mut builder, crate::util::now());
        assert_eq!(result.best, Some(long[51].hash));
        assert_eq!(builder.chain.verified.len(), 112);
        assert!(result.desired.is_empty());
        assert!(result.bad_peer_addresses.is_empty());
        let heads: Vec<Hash> = result.decorated_heads.iter().map(|(_, h)| *h).collect();
        assert_eq!(heads, vec![short[49].hash, long[51].hash]);
    }

    #[test]
    fn selection_ignores_arrival_order() {
        let mut net = test_params();
        net.chain_length = 100;
        net.real_chain_length = 100;
        let mut builder = ChainBuilder::new(net.clone());
        let trunk = builder.mine_line(Hash::zero(), 5, ChainBuilder::script(1));
        builder.mine_line(trunk[4].hash, 7, ChainBuilder::script(2));
        builder.mine_line(trunk[4].hash, 7, ChainBuilder::script(3));
        let expected = think(&mut builder, crate::util::now()).best;
        assert!(expected.is_some());

        let mut shares: Vec<Arc<Share>> = builder.chain.items.items().values().cloned().collect();
        for seed in 0..4u64 {
            use rand::SeedableRng;
            use rand::seq::SliceRandom;
            shares.shuffle(&mut rand::rngs::StdRng::seed_from_u64(seed));
            let mut other = ShareChain::new(Arc::new(net.clone()), ThinkConfig::default());
            for share in &shares {
                other.add_share((**share).clone()).unwrap();
            }
            let result = other.think(&at_tip, &builder.previous_block, builder.block_bits, crate::util::now());
            assert_eq!(result.best, expected);
        }
    }

    #[test]
    fn missing_ancestor_is_desired_not_bad() {
        let net = test_params();
        let mut builder = ChainBuilder::new(net.clone());
        let shares = builder.mine_line(Hash::zero(), 30, ChainBuilder::script(1));

        let mut partial = ShareChain::new(Arc::new(net), ThinkConfig::default());
        let peer: SocketAddr = "10.0.0.1:9333".parse().unwrap();
        for share in &shares[10..] {
            let mut share = (**share).clone();
            share.peer_addr = Some(peer);
            partial.add_share(share).unwrap();
        }
        let result = partial.think(&at_tip, &builder.previous_block, builder.block_bits, crate::util::now());
        assert_eq!(result.best, None);
        assert!(result.bad_peer_addresses.is_empty());
        assert_eq!(
            result.desired,
            vec![Desired {
                peer_addr: Some(peer),
                hash: shares[9].hash
            }]
        );
        assert_eq!(partial.items.len(), 20);
    }

    #[test]
    fn easy_forks_are_not_worth_downloading() {
        let mut hard_net = test_params();
        hard_net.max_target = U256::MAX >> 8;
        let mut builder = ChainBuilder::new(hard_net.clone());
        let trunk = builder.mine_line(Hash::zero(), 22, ChainBuilder::script(1));

        // forks whose first share is unknown to the chain
        let mut easy = ChainBuilder::new(test_params()).mine_line(Hash::zero(), 3, ChainBuilder::script(2));
        let mut hard = ChainBuilder::new(hard_net).mine_line(Hash::zero(), 3, ChainBuilder::script(3));
        for share in easy.drain(1..).chain(hard.drain(1..)) {
            builder.chain.add_share((*share).clone()).unwrap();
        }

        let result = think(&mut builder, crate::util::now());
        assert_eq!(result.best, Some(trunk[21].hash));
        assert_eq!(
            result.desired,
            vec![Desired {
                peer_addr: None,
                hash: hard[0].hash
            }]
        );
        assert!(!result.desired.iter().any(|d| d.hash == easy[0].hash));
    }

    #[test]
    fn target_cutoff_scales_with_the_best_tail_rate() {
        assert_eq!(desired_target_cutoff(10, None), U256::MAX);
        assert_eq!(desired_target_cutoff(10, Some(U256::zero())), U256::MAX);
        let fast = desired_target_cutoff(10, Some(U256::from(1000u64)));
        let slow = desired_target_cutoff(10, Some(U256::from(10u64)));
        assert!(fast < slow);
        assert_eq!(fast, U256::MAX / U256::from(10_001u64) * U256::from(2u8));
    }

    #[test]
    fn invalid_share_blames_its_peer() {
        let net = test_params();
        let mut builder = ChainBuilder::new(net.clone());
        let root = builder.mine(Hash::zero(), ChainBuilder::script(1));
        let mut contents = builder.contents(root.hash, ChainBuilder::script(2));
        contents.share_info.share_data.subsidy += 7;
        let contents = ChainBuilder::grind(contents);
        let peer: SocketAddr = "10.0.0.2:9333".parse().unwrap();
        let forged = Share::new(contents, &net, Some(peer)).unwrap();
        let forged_hash = forged.hash;
        builder.chain.add_share(forged).unwrap();

        let result = think(&mut builder, crate::util::now());
        assert_eq!(result.best, Some(root.hash));
        assert!(result.bad_peer_addresses.contains(&peer));
        assert!(!builder.chain.contains(&forged_hash));
    }

    #[test]
    fn handle_get_shares_respects_stops_and_caps() {
        let mut builder = ChainBuilder::new(test_params());
        let shares = builder.mine_line(Hash::zero(), 12, ChainBuilder::script(1));
        let head = shares[11].hash;

        let served = builder.chain.handle_get_shares(&[head], 3, &[]);
        let hashes: Vec<Hash> = served.iter().map(|s| s.hash).collect();
        assert_eq!(hashes, vec![shares[11].hash, shares[10].hash, shares[9].hash, shares[8].hash]);

        let served = builder.chain.handle_get_shares(&[head], 100, &[shares[6].hash]);
        assert_eq!(served.len(), 5);

        assert!(builder.chain.handle_get_shares(&[Hash::hash256(b"unknown")], 10, &[]).is_empty());
        assert!(builder.chain.handle_get_shares(&[], 10, &[]).is_empty());
    }

    #[test]
    fn expected_payouts_sum_to_subsidy() {
        let mut builder = ChainBuilder::new(test_params());
        let shares = builder.mine_line(Hash::zero(), 8, ChainBuilder::script(1));
        let more = builder.mine_line(shares[7].hash, 8, ChainBuilder::script(2));
        let target = builder.block_bits.target();
        let payouts = builder
            .chain
            .get_expected_payouts(&more[7].hash, target, 1_000_000)
            .unwrap();
        assert_eq!(payouts.values().sum::<u64>(), 1_000_000);
        assert_eq!(payouts[&ChainBuilder::script(1)], payouts[&ChainBuilder::script(2)]);
    }

    #[test]
    fn payout_window_sums_for_every_length() {
        let mut builder = ChainBuilder::new(test_params());
        let shares = builder.mine_line(Hash::zero(), 15, ChainBuilder::script(1));
        let donation = builder.chain.net.donation_script.clone();
        let head = shares[14].hash;
        for n in 0..=15 {
            let desired = U256::from(DONATION_SCALE) * U256::from(1000u64);
            let (weights, total, donated) = builder.chain.get_cumulative_weights(&head, n, desired).unwrap();
            let sum = weights.values().fold(donated, |acc, w| acc + *w);
            assert_eq!(sum, total);
            let amounts = crate::weights::compute_payouts(&weights, total, 123_456_789, &ChainBuilder::script(9), &donation);
            assert_eq!(amounts.values().sum::<u64>(), 123_456_789);
        }
    }

    #[test]
    fn prune_drops_old_side_heads_and_far_tails() {
        let mut net = test_params();
        net.chain_length = 5;
        net.real_chain_length = 5;
        let mut builder = ChainBuilder::new(net);
        let trunk = builder.mine_line(Hash::zero(), 30, ChainBuilder::script(1));
        let side = builder.mine(trunk[27].hash, ChainBuilder::script(2));
        let now = crate::util::now();
        let result = think(&mut builder, now);
        assert_eq!(result.best, Some(trunk[29].hash));

        // nothing is old yet
        assert_eq!(builder.chain.prune(&result.decorated_heads, now), 10);
        assert!(builder.chain.contains(&side.hash));

        let mut config = builder.chain.config.clone();
        config.keep_top_heads = 1;
        builder.chain.config = config;
        let later = now + 1000;
        let result = think(&mut builder, later);
        builder.chain.prune(&result.decorated_heads, later);
        assert!(!builder.chain.contains(&side.hash));
        assert!(builder.chain.contains(&trunk[29].hash));
        assert_eq!(builder.chain.items.get_length(&trunk[29].hash), 19);
    }
}
