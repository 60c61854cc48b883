//! Memoized jump pointers over the linear ancestry of a forest.
//!
//! A query starts at some hash and repeatedly applies deltas going towards
//! the root until the strategy judges it has arrived. Every visited element
//! gets a skip vector of geometric length; entry `i` of that vector covers a
//! span ending at the next visited element whose own vector is longer than
//! `i`, so later queries can cross long stretches in one step.

use crate::error::{PoolError, Result};
use crate::forest::ForestItem;
use crate::sha256::Hash;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::marker::PhantomData;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Judgement {
    Before,
    At,
    After,
}

impl From<Ordering> for Judgement {
    fn from(ordering: Ordering) -> Self {
        match ordering {
            Ordering::Less => Judgement::Before,
            Ordering::Equal => Judgement::At,
            Ordering::Greater => Judgement::After,
        }
    }
}

pub trait SkipListStrategy {
    type Item: ForestItem;
    type Delta: Clone;
    type Solution: Clone;
    type Args;
    type Output;

    fn get_delta(&self, item: &Self::Item) -> Self::Delta;
    fn combine_deltas(&self, first: &Self::Delta, second: &Self::Delta) -> Self::Delta;
    fn initial_solution(&self, start: &Hash, args: &Self::Args) -> Self::Solution;
    fn apply_delta(
        &self,
        solution: &Self::Solution,
        delta: &Self::Delta,
        args: &Self::Args,
    ) -> Self::Solution;
    fn judge(&self, solution: &Self::Solution, args: &Self::Args) -> Judgement;
    fn finalize(&self, solution: Self::Solution, args: &Self::Args) -> Self::Output;
}

type Skip<D> = (usize, Vec<(Hash, D)>);

pub struct SkipList<S: SkipListStrategy> {
    strategy: S,
    skips: HashMap<Hash, Skip<S::Delta>>,
    p: f64,
    rng: StdRng,
}

impl<S: SkipListStrategy> SkipList<S> {
    pub fn new(strategy: S) -> Self {
        SkipList {
            strategy,
            skips: HashMap::new(),
            p: 0.5,
            rng: StdRng::from_entropy(),
        }
    }
    pub fn with_seed(strategy: S, seed: u64) -> Self {
        SkipList {
            rng: StdRng::seed_from_u64(seed),
            ..Self::new(strategy)
        }
    }
    pub fn strategy(&self) -> &S {
        &self.strategy
    }
    /// Drops the skip vector anchored at `hash`.
    pub fn forget(&mut self, hash: &Hash) {
        self.skips.remove(hash);
    }
    pub fn len(&self) -> usize {
        self.skips.len()
    }
    pub fn is_empty(&self) -> bool {
        self.skips.is_empty()
    }

    fn geometric(&mut self) -> usize {
        let u: f64 = self.rng.r#gen();
        ((1.0 - u).ln() / (1.0 - self.p).ln()) as usize + 1
    }

    /// Walks from `start` towards the root. Fails when the walk needs an
    /// element that is not in `items`, or when even the shortest jump from
    /// some element lands past the answer.
    pub fn query(
        &mut self,
        items: &HashMap<Hash, S::Item>,
        start: Hash,
        args: &S::Args,
    ) -> Result<S::Output> {
        let mut updates: HashMap<usize, (Hash, Option<S::Delta>)> = HashMap::new();
        let mut pos = start;
        let mut solution = self.strategy.initial_solution(&start, args);
        if self.strategy.judge(&solution, args) == Judgement::At {
            return Ok(self.strategy.finalize(solution, args));
        }
        loop {
            if !self.skips.contains_key(&pos) {
                let item = items.get(&pos).ok_or(PoolError::UnknownShare(pos))?;
                let length = self.geometric();
                let first = (item.previous_hash(), self.strategy.get_delta(item));
                self.skips.insert(pos, (length, vec![first]));
            }
            let (skip_length, skip) = match self.skips.get(&pos) {
                Some((length, skip)) => (*length, skip.clone()),
                None => return Err(PoolError::UnknownShare(pos)),
            };

            // pending anchors whose next entry ends here
            for i in 0..skip_length {
                if let Some((anchor, Some(delta))) = updates.remove(&i) {
                    if let Some((_, entries)) = self.skips.get_mut(&anchor) {
                        if entries.len() == i {
                            entries.push((pos, delta));
                        }
                    }
                }
            }
            for i in skip.len()..skip_length {
                updates.insert(i, (pos, None));
            }

            let mut step = None;
            for (jump, delta) in skip.iter().rev() {
                let candidate = self.strategy.apply_delta(&solution, delta, args);
                match self.strategy.judge(&candidate, args) {
                    Judgement::At => return Ok(self.strategy.finalize(candidate, args)),
                    Judgement::Before => {
                        step = Some((*jump, delta.clone(), candidate));
                        break;
                    }
                    Judgement::After => {}
                }
            }
            let Some((jump, delta, candidate)) = step else {
                return Err(PoolError::Overshoot(pos));
            };
            solution = candidate;
            pos = jump;
            for (_, pending) in updates.values_mut() {
                *pending = Some(match pending.take() {
                    Some(previous) => self.strategy.combine_deltas(&previous, &delta),
                    None => delta.clone(),
                });
            }
        }
    }
}

/// Answers "hash of the nth ancestor".
pub struct DistanceSkipList<T>(PhantomData<fn() -> T>);

impl<T> Default for DistanceSkipList<T> {
    fn default() -> Self {
        DistanceSkipList(PhantomData)
    }
}

impl<T: ForestItem> SkipListStrategy for DistanceSkipList<T> {
    type Item = T;
    // (from, steps, to)
    type Delta = (Hash, u64, Hash);
    type Solution = (u64, Hash);
    type Args = u64;
    type Output = Hash;

    fn get_delta(&self, item: &T) -> Self::Delta {
        (item.hash(), 1, item.previous_hash())
    }
    fn combine_deltas(&self, first: &Self::Delta, second: &Self::Delta) -> Self::Delta {
        debug_assert_eq!(first.2, second.0);
        (first.0, first.1 + second.1, second.2)
    }
    fn initial_solution(&self, start: &Hash, _n: &u64) -> Self::Solution {
        (0, *start)
    }
    fn apply_delta(&self, solution: &Self::Solution, delta: &Self::Delta, _n: &u64) -> Self::Solution {
        debug_assert_eq!(solution.1, delta.0);
        (solution.0 + delta.1, delta.2)
    }
    fn judge(&self, solution: &Self::Solution, n: &u64) -> Judgement {
        solution.0.cmp(n).into()
    }
    fn finalize(&self, solution: Self::Solution, _n: &u64) -> Hash {
        solution.1
    }
}
