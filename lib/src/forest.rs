//! In-memory index of a forest of items linked by previous-hash.
//!
//! Every connected component is described by its heads (items without a
//! known child) and its tail (the first ancestor hash that is not present).
//! Heights and cumulative work are cached per item as a delta to a shared
//! ref; a ref holds the delta from its anchor to the component's current
//! tail, so extending or trimming the bottom of a component only touches
//! one ref instead of every cached item.

use crate::U256;
use crate::error::{PoolError, Result};
use crate::event::Event;
use crate::sha256::Hash;
use crate::skiplist::{DistanceSkipList, SkipList};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub trait ForestItem: Clone {
    fn hash(&self) -> Hash;
    /// `Hash::zero()` for a root.
    fn previous_hash(&self) -> Hash;
    fn work(&self) -> U256 {
        U256::zero()
    }
    fn min_work(&self) -> U256 {
        U256::zero()
    }
}

impl<T: ForestItem> ForestItem for Arc<T> {
    fn hash(&self) -> Hash {
        (**self).hash()
    }
    fn previous_hash(&self) -> Hash {
        (**self).previous_hash()
    }
    fn work(&self) -> U256 {
        (**self).work()
    }
    fn min_work(&self) -> U256 {
        (**self).min_work()
    }
}

/// Aggregate over the span `head ..= tail` exclusive of `tail`.
///
/// Ref deltas may describe negative spans, so all arithmetic wraps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delta {
    pub head: Hash,
    pub tail: Hash,
    pub height: u64,
    pub work: U256,
    pub min_work: U256,
}

impl Delta {
    pub fn none(hash: Hash) -> Self {
        Delta {
            head: hash,
            tail: hash,
            height: 0,
            work: U256::zero(),
            min_work: U256::zero(),
        }
    }
    pub fn from_item<T: ForestItem>(item: &T) -> Self {
        Delta {
            head: item.hash(),
            tail: item.previous_hash(),
            height: 1,
            work: item.work(),
            min_work: item.min_work(),
        }
    }
    /// Concatenates `self` (nearer the heads) with `other`.
    pub fn add(&self, other: &Delta) -> Delta {
        debug_assert_eq!(self.tail, other.head);
        Delta {
            head: self.head,
            tail: other.tail,
            height: self.height.wrapping_add(other.height),
            work: self.work.overflowing_add(other.work).0,
            min_work: self.min_work.overflowing_add(other.min_work).0,
        }
    }
    /// Removes a span sharing either end with `self`.
    pub fn sub(&self, other: &Delta) -> Delta {
        let (head, tail) = if self.head == other.head {
            (other.tail, self.tail)
        } else {
            assert_eq!(self.tail, other.tail, "deltas share no endpoint");
            (self.head, other.head)
        };
        Delta {
            head,
            tail,
            height: self.height.wrapping_sub(other.height),
            work: self.work.overflowing_sub(other.work).0,
            min_work: self.min_work.overflowing_sub(other.min_work).0,
        }
    }
}

type RefId = u64;

pub struct Tracker<T: ForestItem> {
    items: HashMap<Hash, T>,
    reverse: HashMap<Hash, HashSet<Hash>>,
    heads: HashMap<Hash, Hash>,
    tails: HashMap<Hash, HashSet<Hash>>,
    pub added: Event<T>,
    pub removed: Event<T>,
    distance: SkipList<DistanceSkipList<T>>,
    deltas: HashMap<Hash, (Delta, RefId)>,
    reverse_deltas: HashMap<RefId, HashSet<Hash>>,
    delta_refs: HashMap<RefId, Delta>,
    reverse_delta_refs: HashMap<Hash, RefId>,
    next_ref: RefId,
}

impl<T: ForestItem> Default for Tracker<T> {
    fn default() -> Self {
        Tracker {
            items: HashMap::new(),
            reverse: HashMap::new(),
            heads: HashMap::new(),
            tails: HashMap::new(),
            added: Event::new(),
            removed: Event::new(),
            distance: SkipList::new(DistanceSkipList::default()),
            deltas: HashMap::new(),
            reverse_deltas: HashMap::new(),
            delta_refs: HashMap::new(),
            reverse_delta_refs: HashMap::new(),
            next_ref: 0,
        }
    }
}

/// Walks `remaining` items towards the root. Cloning restarts the walk.
#[derive(Clone)]
pub struct Chain<'a, T> {
    items: &'a HashMap<Hash, T>,
    next: Hash,
    remaining: u64,
}

impl<'a, T: ForestItem> Iterator for Chain<'a, T> {
    type Item = &'a T;
    fn next(&mut self) -> Option<&'a T> {
        if self.remaining == 0 {
            return None;
        }
        let item = self.items.get(&self.next)?;
        self.next = item.previous_hash();
        self.remaining -= 1;
        Some(item)
    }
}

impl<T: ForestItem> Tracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: &Hash) -> Option<&T> {
        self.items.get(hash)
    }
    pub fn contains(&self, hash: &Hash) -> bool {
        self.items.contains_key(hash)
    }
    pub fn len(&self) -> usize {
        self.items.len()
    }
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
    pub fn items(&self) -> &HashMap<Hash, T> {
        &self.items
    }
    /// head -> tail
    pub fn heads(&self) -> &HashMap<Hash, Hash> {
        &self.heads
    }
    /// tail -> heads above it
    pub fn tails(&self) -> &HashMap<Hash, HashSet<Hash>> {
        &self.tails
    }
    pub fn children(&self, hash: &Hash) -> Option<&HashSet<Hash>> {
        self.reverse.get(hash)
    }

    pub fn add(&mut self, item: T) -> Result<()> {
        let delta = Delta::from_item(&item);
        if self.items.contains_key(&delta.head) {
            return Err(PoolError::DuplicateShare(delta.head));
        }
        assert_ne!(delta.head, delta.tail, "item {} names itself as parent", delta.head);

        let heads = self
            .tails
            .remove(&delta.head)
            .unwrap_or_else(|| HashSet::from([delta.head]));
        let tail = match self.heads.remove(&delta.tail) {
            Some(tail) => tail,
            None => self.get_last(&delta.tail),
        };

        self.items.insert(delta.head, item.clone());
        self.reverse.entry(delta.tail).or_default().insert(delta.head);
        let tail_heads = self.tails.entry(tail).or_default();
        tail_heads.extend(heads.iter().copied());
        tail_heads.remove(&delta.tail);
        for head in heads {
            self.heads.insert(head, tail);
        }

        self.added.happened(&item);
        Ok(())
    }

    /// Whether [`Tracker::remove`] would accept `hash`.
    pub fn can_remove(&self, hash: &Hash) -> bool {
        match self.items.get(hash) {
            Some(item) => {
                self.heads.contains_key(hash) || self.tails.contains_key(&item.previous_hash())
            }
            None => false,
        }
    }

    /// Removes a head, or an item whose parent is a tail. Interior items
    /// are refused with `NotRemovable`.
    pub fn remove(&mut self, hash: &Hash) -> Result<T> {
        let item = self
            .items
            .get(hash)
            .cloned()
            .ok_or(PoolError::UnknownShare(*hash))?;
        let delta = Delta::from_item(&item);
        let siblings = self.reverse.get(&delta.tail).map_or(0, HashSet::len);

        if self.heads.contains_key(&delta.head) && self.tails.contains_key(&delta.tail) {
            self.heads.remove(&delta.head);
            self.detach_head(&delta.tail, &delta.head);
        } else if let Some(tail) = self.heads.remove(&delta.head) {
            self.detach_head(&tail, &delta.head);
            if siblings == 1 {
                self.tails.entry(tail).or_default().insert(delta.tail);
                self.heads.insert(delta.tail, tail);
            }
        } else if self.tails.contains_key(&delta.tail) && siblings <= 1 {
            let heads = self.tails.remove(&delta.tail).unwrap_or_default();
            for head in &heads {
                self.heads.insert(*head, delta.head);
            }
            self.tails.insert(delta.head, heads);
            self.reanchor_below(&item);
        } else if self.tails.contains_key(&delta.tail) {
            let candidates: Vec<Hash> = self
                .tails
                .get(&delta.tail)
                .map(|heads| heads.iter().copied().collect())
                .unwrap_or_default();
            let mut heads = HashSet::new();
            for head in candidates {
                if self.is_child_of(&delta.head, &head) == Some(true) {
                    heads.insert(head);
                }
            }
            for head in &heads {
                self.detach_head(&delta.tail, head);
                self.heads.insert(*head, delta.head);
            }
            debug_assert!(!self.tails.contains_key(&delta.head));
            self.tails.insert(delta.head, heads);
            self.drop_ref_at(&delta.tail);
        } else {
            return Err(PoolError::NotRemovable(*hash));
        }

        self.items.remove(&delta.head);
        if let Some(children) = self.reverse.get_mut(&delta.tail) {
            children.remove(&delta.head);
            if children.is_empty() {
                self.reverse.remove(&delta.tail);
            }
        }
        self.forget_cached(&delta.head);
        self.distance.forget(&delta.head);
        self.removed.happened(&item);
        Ok(item)
    }

    fn detach_head(&mut self, tail: &Hash, head: &Hash) {
        if let Some(heads) = self.tails.get_mut(tail) {
            heads.remove(head);
            if heads.is_empty() {
                self.tails.remove(tail);
            }
        }
    }

    pub fn get_nth_parent_hash(&mut self, hash: &Hash, n: u64) -> Result<Hash> {
        self.distance.query(&self.items, *hash, &n)
    }

    /// Number of items from `hash` down to the tail, inclusive.
    pub fn get_length(&mut self, hash: &Hash) -> u64 {
        self.get_delta_to_last(hash).height
    }
    pub fn get_length_and_last(&mut self, hash: &Hash) -> (u64, Hash) {
        let delta = self.get_delta_to_last(hash);
        (delta.height, delta.tail)
    }
    /// Number of known ancestors of `hash`.
    pub fn get_height(&mut self, hash: &Hash) -> u64 {
        self.get_length(hash).saturating_sub(1)
    }
    pub fn get_height_and_last(&mut self, hash: &Hash) -> (u64, Hash) {
        let (length, last) = self.get_length_and_last(hash);
        (length.saturating_sub(1), last)
    }
    pub fn get_last(&mut self, hash: &Hash) -> Hash {
        self.get_delta_to_last(hash).tail
    }
    /// Work of `hash` and all its known ancestors.
    pub fn get_work(&mut self, hash: &Hash) -> U256 {
        self.get_delta_to_last(hash).work
    }

    pub fn get_chain(&mut self, hash: &Hash, length: u64) -> Result<Chain<'_, T>> {
        let available = self.get_length(hash);
        if length > available {
            return Err(PoolError::ChainTooShort {
                start: *hash,
                requested: length,
                available,
            });
        }
        Ok(Chain {
            items: &self.items,
            next: *hash,
            remaining: length,
        })
    }

    /// `None` when the two hashes are in different components.
    pub fn is_child_of(&mut self, hash: &Hash, possible_child: &Hash) -> Option<bool> {
        let (length, last) = self.get_length_and_last(hash);
        let (child_length, child_last) = self.get_length_and_last(possible_child);
        if last != child_last {
            return None;
        }
        if child_length < length {
            return Some(false);
        }
        let nth = self.get_nth_parent_hash(possible_child, child_length - length);
        Some(nth.is_ok_and(|h| h == *hash))
    }

    /// Aggregate from `hash` down to, but excluding, `ancestor`.
    pub fn get_delta(&mut self, hash: &Hash, ancestor: &Hash) -> Delta {
        debug_assert_eq!(self.is_child_of(ancestor, hash), Some(true));
        let to_last = self.get_delta_to_last(hash);
        to_last.sub(&self.get_delta_to_last(ancestor))
    }

    pub fn get_delta_to_last(&mut self, hash: &Hash) -> Delta {
        let mut delta = Delta::none(*hash);
        let mut updates = Vec::new();
        while let Some(step) = self.cached_delta(&delta.tail) {
            updates.push((delta.tail, delta.clone()));
            delta = delta.add(&step);
        }
        for (update_hash, delta_then) in updates {
            self.set_delta(update_hash, delta.sub(&delta_then));
        }
        delta
    }

    fn cached_delta(&self, hash: &Hash) -> Option<Delta> {
        let item = self.items.get(hash)?;
        let cached = self
            .deltas
            .get(hash)
            .and_then(|(delta, r)| self.delta_refs.get(r).map(|ref_delta| delta.add(ref_delta)));
        Some(cached.unwrap_or_else(|| Delta::from_item(item)))
    }

    fn set_delta(&mut self, hash: Hash, delta: Delta) {
        let anchor = delta.tail;
        let r = match self.reverse_delta_refs.get(&anchor) {
            Some(r) => *r,
            None => {
                let r = self.next_ref;
                self.next_ref += 1;
                self.delta_refs.insert(r, Delta::none(anchor));
                self.reverse_delta_refs.insert(anchor, r);
                r
            }
        };
        let Some(ref_delta) = self.delta_refs.get(&r).cloned() else {
            return;
        };
        debug_assert_eq!(ref_delta.tail, anchor);

        if let Some((_, previous_ref)) = self.deltas.get(&hash) {
            let previous_ref = *previous_ref;
            let now_empty = match self.reverse_deltas.get_mut(&previous_ref) {
                Some(members) => {
                    members.remove(&hash);
                    members.is_empty()
                }
                None => false,
            };
            if now_empty && previous_ref != r {
                self.reverse_deltas.remove(&previous_ref);
                if let Some(old) = self.delta_refs.remove(&previous_ref) {
                    self.reverse_delta_refs.remove(&old.tail);
                }
            }
        }
        self.deltas.insert(hash, (delta.sub(&ref_delta), r));
        self.reverse_deltas.entry(r).or_default().insert(hash);
    }

    /// The tail-most `item` is leaving: pull every cached span that ended at
    /// it down to its parent, then move that ref up so it ends at `item`.
    fn reanchor_below(&mut self, item: &T) {
        let delta = Delta::from_item(item);
        if !self.reverse_delta_refs.contains_key(&delta.tail) {
            return;
        }
        let members: Vec<Hash> = self
            .reverse_delta_refs
            .get(&delta.head)
            .and_then(|r| self.reverse_deltas.get(r))
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        for member in members {
            self.get_last(&member);
        }
        debug_assert!(!self.reverse_delta_refs.contains_key(&delta.head));
        let Some(r) = self.reverse_delta_refs.remove(&delta.tail) else {
            return;
        };
        if let Some(current) = self.delta_refs.get(&r).cloned() {
            let moved = current.sub(&delta);
            debug_assert_eq!(moved.tail, delta.head);
            self.delta_refs.insert(r, moved);
        }
        self.reverse_delta_refs.insert(delta.head, r);
    }

    /// Drops every cached span ending at `tail`; they are rebuilt lazily.
    fn drop_ref_at(&mut self, tail: &Hash) {
        let Some(r) = self.reverse_delta_refs.remove(tail) else {
            return;
        };
        self.delta_refs.remove(&r);
        for member in self.reverse_deltas.remove(&r).unwrap_or_default() {
            self.deltas.remove(&member);
        }
    }

    fn forget_cached(&mut self, hash: &Hash) {
        let Some((_, r)) = self.deltas.remove(hash) else {
            return;
        };
        let now_empty = match self.reverse_deltas.get_mut(&r) {
            Some(members) => {
                members.remove(hash);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.reverse_deltas.remove(&r);
            if let Some(ref_delta) = self.delta_refs.remove(&r) {
                self.reverse_delta_refs.remove(&ref_delta.tail);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestItem;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::sync::Mutex;

    fn naive_length_and_last(tracker: &Tracker<TestItem>, hash: &Hash) -> (u64, Hash) {
        let mut length = 0;
        let mut pos = *hash;
        while let Some(item) = tracker.get(&pos) {
            length += 1;
            pos = item.previous_hash();
        }
        (length, pos)
    }

    fn assert_consistent(tracker: &mut Tracker<TestItem>) {
        let hashes: Vec<Hash> = tracker.items().keys().copied().collect();
        let mut expected_tails: HashMap<Hash, HashSet<Hash>> = HashMap::new();
        for hash in &hashes {
            let (length, last) = naive_length_and_last(tracker, hash);
            assert_eq!(tracker.get_length_and_last(hash), (length, last));
            assert_eq!(tracker.get_height(hash), length - 1);
            let is_head = tracker.children(hash).is_none_or(|c| c.is_empty());
            assert_eq!(tracker.heads().contains_key(hash), is_head);
            if is_head {
                assert_eq!(tracker.heads()[hash], last);
                expected_tails.entry(last).or_default().insert(*hash);
            }
        }
        assert_eq!(tracker.tails(), &expected_tails);
    }

    fn line(tracker: &mut Tracker<TestItem>, from: u32, count: u32, parent: Hash) -> Vec<Hash> {
        let mut hashes = Vec::new();
        let mut previous = parent;
        for id in from..from + count {
            let item = TestItem::new(id, previous);
            previous = item.hash();
            hashes.push(previous);
            tracker.add(item).unwrap();
        }
        hashes
    }

    #[test]
    fn straight_line_tail_removal() {
        let mut tracker = Tracker::new();
        let hashes = line(&mut tracker, 1, 200, Hash::zero());
        let head = hashes[199];
        assert_eq!(tracker.get_height(&head), 199);
        assert_eq!(tracker.get_height_and_last(&head), (199, Hash::zero()));

        tracker.remove(&hashes[0]).unwrap();
        assert_eq!(tracker.get_height(&hashes[1]), 0);
        assert_eq!(tracker.get_height_and_last(&head), (198, hashes[0]));
        assert_eq!(tracker.tails().len(), 1);
        assert!(tracker.tails().contains_key(&hashes[0]));
        assert_consistent(&mut tracker);
    }

    #[test]
    fn interior_items_are_not_removable() {
        let mut tracker = Tracker::new();
        let hashes = line(&mut tracker, 1, 5, Hash::zero());
        assert!(matches!(
            tracker.remove(&hashes[2]),
            Err(PoolError::NotRemovable(h)) if h == hashes[2]
        ));
        assert_eq!(tracker.len(), 5);
        tracker.remove(&hashes[4]).unwrap();
        assert_eq!(tracker.heads().keys().copied().collect::<Vec<_>>(), vec![hashes[3]]);
        assert_consistent(&mut tracker);
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let mut tracker = Tracker::new();
        tracker.add(TestItem::new(1, Hash::zero())).unwrap();
        assert!(matches!(
            tracker.add(TestItem::new(1, Hash::zero())),
            Err(PoolError::DuplicateShare(_))
        ));
    }

    #[test]
    fn out_of_order_insertion_joins_components() {
        let mut tracker = Tracker::new();
        let a = TestItem::new(1, Hash::zero());
        let b = TestItem::new(2, a.hash());
        let c = TestItem::new(3, b.hash());
        tracker.add(c.clone()).unwrap();
        tracker.add(a.clone()).unwrap();
        assert_eq!(tracker.heads().len(), 2);
        assert_eq!(tracker.get_length_and_last(&c.hash()), (1, b.hash()));
        tracker.add(b.clone()).unwrap();
        assert_eq!(tracker.heads().len(), 1);
        assert_eq!(tracker.get_height_and_last(&c.hash()), (2, Hash::zero()));
        assert_eq!(tracker.is_child_of(&a.hash(), &c.hash()), Some(true));
        assert_eq!(tracker.is_child_of(&c.hash(), &a.hash()), Some(false));
        assert_consistent(&mut tracker);
    }

    #[test]
    fn is_child_of_across_components_is_undetermined() {
        let mut tracker = Tracker::new();
        let left = line(&mut tracker, 1, 3, Hash::zero());
        let right = line(&mut tracker, 100, 3, Hash::hash256(b"elsewhere"));
        assert_eq!(tracker.is_child_of(&left[0], &right[2]), None);
    }

    #[test]
    fn removing_root_with_forked_children() {
        let mut tracker = Tracker::new();
        let trunk = line(&mut tracker, 1, 3, Hash::zero());
        let fork_a = line(&mut tracker, 10, 4, trunk[2]);
        let fork_b = line(&mut tracker, 20, 2, trunk[2]);
        // a second root under the same tail
        let other = line(&mut tracker, 30, 2, Hash::zero());
        assert_eq!(tracker.tails()[&Hash::zero()].len(), 3);

        tracker.remove(&trunk[0]).unwrap();
        assert_eq!(tracker.tails()[&trunk[0]].len(), 2);
        assert_eq!(tracker.tails()[&Hash::zero()].len(), 1);
        assert_eq!(tracker.get_height_and_last(&fork_a[3]), (5, trunk[0]));
        assert_eq!(tracker.get_height_and_last(&fork_b[1]), (3, trunk[0]));
        assert_eq!(tracker.get_height(&other[1]), 1);
        assert_consistent(&mut tracker);
    }

    #[test]
    fn get_delta_and_work() {
        let mut tracker = Tracker::new();
        let hashes = line(&mut tracker, 1, 10, Hash::zero());
        let delta = tracker.get_delta(&hashes[9], &hashes[4]);
        assert_eq!((delta.head, delta.tail, delta.height), (hashes[9], hashes[4], 5));
        assert_eq!(delta.work, U256::from(5u64));
        assert_eq!(tracker.get_work(&hashes[9]), U256::from(10u64));
        let tail_delta = tracker.get_delta(&hashes[9], &Hash::zero());
        assert_eq!(tail_delta.height, 10);
    }

    #[test]
    fn get_chain_is_bounded_and_restartable() {
        let mut tracker = Tracker::new();
        let hashes = line(&mut tracker, 1, 6, Hash::zero());
        let chain = tracker.get_chain(&hashes[5], 4).unwrap();
        let first: Vec<Hash> = chain.clone().map(|i| i.hash()).collect();
        let second: Vec<Hash> = chain.map(|i| i.hash()).collect();
        assert_eq!(first, vec![hashes[5], hashes[4], hashes[3], hashes[2]]);
        assert_eq!(first, second);
        assert!(matches!(
            tracker.get_chain(&hashes[5], 7),
            Err(PoolError::ChainTooShort { available: 6, .. })
        ));
    }

    #[test]
    fn events_fire_until_unsubscribed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tracker = Tracker::new();
        let sink = log.clone();
        let id = tracker
            .added
            .subscribe(move |item: &TestItem| sink.lock().unwrap().push(("add", item.hash())));
        let sink = log.clone();
        tracker
            .removed
            .subscribe(move |item: &TestItem| sink.lock().unwrap().push(("remove", item.hash())));
        let item = TestItem::new(1, Hash::zero());
        tracker.add(item.clone()).unwrap();
        tracker.added.unsubscribe(id);
        tracker.add(TestItem::new(2, item.hash())).unwrap();
        tracker.remove(&TestItem::new(2, item.hash()).hash()).unwrap();
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0], ("add", item.hash()));
        assert_eq!(log[1].0, "remove");
    }

    #[test]
    fn random_adds_and_removals_match_naive_walk() {
        let mut rng = StdRng::seed_from_u64(42);
        for round in 0..5 {
            let mut generated: Vec<TestItem> = Vec::new();
            for id in 0..120u32 {
                let parent = if generated.is_empty() || rng.gen_bool(0.05) {
                    Hash::hash256(&[round as u8, id as u8, 0xee])
                } else {
                    let lookback = rng.gen_range(1..=generated.len().min(4));
                    generated[generated.len() - lookback].hash()
                };
                generated.push(TestItem::new(round * 1000 + id + 1, parent));
            }
            let mut pending = generated.clone();
            pending.shuffle(&mut rng);

            let mut tracker = Tracker::new();
            while !pending.is_empty() || !tracker.is_empty() {
                if !pending.is_empty() && rng.gen_bool(0.7) {
                    tracker.add(pending.pop().unwrap()).unwrap();
                } else if !tracker.is_empty() {
                    let hashes: Vec<Hash> = tracker.items().keys().copied().collect();
                    let target = *hashes.choose(&mut rng).unwrap();
                    let parent_present = tracker.contains(&tracker.get(&target).unwrap().previous_hash());
                    let has_children = tracker.children(&target).is_some_and(|c| !c.is_empty());
                    match tracker.remove(&target) {
                        Ok(_) => assert!(!(has_children && parent_present)),
                        Err(PoolError::NotRemovable(_)) => assert!(has_children && parent_present),
                        Err(e) => panic!("unexpected {e}"),
                    }
                } else {
                    continue;
                }
                assert_consistent(&mut tracker);
                if let Some(hash) = tracker.items().keys().next().copied() {
                    let (length, _) = naive_length_and_last(&tracker, &hash);
                    let n = rng.gen_range(0..=length);
                    let mut expected = hash;
                    for _ in 0..n {
                        expected = tracker.get(&expected).unwrap().previous_hash();
                    }
                    assert_eq!(tracker.get_nth_parent_hash(&hash, n).unwrap(), expected);
                    let walked: Vec<Hash> = tracker.get_chain(&hash, n).unwrap().map(|i| i.hash()).collect();
                    assert_eq!(walked.len() as u64, n);
                }
            }
        }
    }
}
