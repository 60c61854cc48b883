//! Payout weights over a window of shares.

use crate::skiplist::{Judgement, SkipListStrategy};
use crate::types::{Script, Share, TxOut, target_to_average_attempts};
use crate::sha256::Hash;
use crate::{DONATION_SCALE, U256, U512};
use std::collections::HashMap;
use std::sync::Arc;

pub type Weights = HashMap<Script, U256>;

/// Outputs kept in a generation transaction, largest amounts first.
pub const MAX_PAYOUT_OUTPUTS: usize = 4000;

#[derive(Clone, Debug)]
pub struct WeightsDelta {
    pub count: u64,
    pub weights: Arc<Weights>,
    pub total: U256,
    pub donation: U256,
}

/// Singly linked list of weight maps; merged only once a query finishes.
#[derive(Debug)]
pub struct WeightsLink {
    weights: Arc<Weights>,
    rest: Option<Arc<WeightsLink>>,
}

#[derive(Clone, Debug)]
pub struct WeightsSolution {
    count: u64,
    weights: Option<Arc<WeightsLink>>,
    total: U256,
    donation: U256,
}

/// (max_shares, desired_weight)
pub type WeightsArgs = (u64, U256);

#[derive(Default)]
pub struct WeightsSkipList;

fn add_weights(into: &mut Weights, from: &Weights) {
    for (script, weight) in from {
        let entry = into.entry(script.clone()).or_default();
        *entry = entry.saturating_add(*weight);
    }
}

impl SkipListStrategy for WeightsSkipList {
    type Item = Arc<Share>;
    type Delta = WeightsDelta;
    type Solution = WeightsSolution;
    type Args = WeightsArgs;
    type Output = (Weights, U256, U256);

    fn get_delta(&self, share: &Arc<Share>) -> WeightsDelta {
        let attempts = target_to_average_attempts(share.target);
        let donation = U256::from(share.share_data().donation);
        let scale = U256::from(DONATION_SCALE);
        WeightsDelta {
            count: 1,
            weights: Arc::new(HashMap::from([(
                share.payout_script().clone(),
                attempts.saturating_mul(scale - donation),
            )])),
            total: attempts.saturating_mul(scale),
            donation: attempts.saturating_mul(donation),
        }
    }

    fn combine_deltas(&self, first: &WeightsDelta, second: &WeightsDelta) -> WeightsDelta {
        let mut weights = (*first.weights).clone();
        add_weights(&mut weights, &second.weights);
        WeightsDelta {
            count: first.count + second.count,
            weights: Arc::new(weights),
            total: first.total.saturating_add(second.total),
            donation: first.donation.saturating_add(second.donation),
        }
    }

    fn initial_solution(&self, _start: &Hash, args: &WeightsArgs) -> WeightsSolution {
        debug_assert!((args.1 % U256::from(DONATION_SCALE)).is_zero());
        WeightsSolution {
            count: 0,
            weights: None,
            total: U256::zero(),
            donation: U256::zero(),
        }
    }

    fn apply_delta(
        &self,
        solution: &WeightsSolution,
        delta: &WeightsDelta,
        &(_, desired_weight): &WeightsArgs,
    ) -> WeightsSolution {
        let combined = solution.total.saturating_add(delta.total);
        if combined > desired_weight && delta.count == 1 {
            // only part of this share fits; scale it to land exactly on the target
            let scale = U256::from(DONATION_SCALE);
            let remaining = (desired_weight - solution.total) / scale;
            let attempts = delta.total / scale;
            let weights: Weights = delta
                .weights
                .iter()
                .map(|(script, weight)| (script.clone(), remaining * *weight / attempts))
                .collect();
            return WeightsSolution {
                count: solution.count + 1,
                weights: Some(Arc::new(WeightsLink {
                    weights: Arc::new(weights),
                    rest: solution.weights.clone(),
                })),
                total: desired_weight,
                donation: solution.donation + remaining * delta.donation / attempts,
            };
        }
        WeightsSolution {
            count: solution.count + delta.count,
            weights: Some(Arc::new(WeightsLink {
                weights: delta.weights.clone(),
                rest: solution.weights.clone(),
            })),
            total: combined,
            donation: solution.donation.saturating_add(delta.donation),
        }
    }

    fn judge(&self, solution: &WeightsSolution, &(max_shares, desired_weight): &WeightsArgs) -> Judgement {
        if solution.count > max_shares || solution.total > desired_weight {
            Judgement::After
        } else if solution.count == max_shares || solution.total == desired_weight {
            Judgement::At
        } else {
            Judgement::Before
        }
    }

    fn finalize(&self, solution: WeightsSolution, _args: &WeightsArgs) -> (Weights, U256, U256) {
        let mut weights = Weights::new();
        let mut link = solution.weights;
        while let Some(node) = link {
            add_weights(&mut weights, &node.weights);
            link = node.rest.clone();
        }
        (weights, solution.total, solution.donation)
    }
}

/// Splits `subsidy` between the scripts in `weights`: 199/200 by weight,
/// 1/200 to the finder and whatever rounding leaves to the donation script.
pub fn compute_payouts(
    weights: &Weights,
    total_weight: U256,
    subsidy: u64,
    finder: &Script,
    donation_script: &Script,
) -> HashMap<Script, u64> {
    let mut amounts: HashMap<Script, u64> = HashMap::new();
    if !total_weight.is_zero() {
        let numerator = U512::from(subsidy) * U512::from(199u64);
        let denominator = U512::from(total_weight) * U512::from(200u64);
        for (script, weight) in weights {
            let amount = (numerator * U512::from(*weight) / denominator).low_u64();
            amounts.insert(script.clone(), amount);
        }
    }
    *amounts.entry(finder.clone()).or_default() += subsidy / 200;
    let distributed: u64 = amounts.values().sum();
    *amounts.entry(donation_script.clone()).or_default() += subsidy - distributed;
    amounts
}

/// Orders payouts the way every node must: donation last, then by amount
/// and script, keeping only the largest [`MAX_PAYOUT_OUTPUTS`].
pub fn payout_outputs(amounts: &HashMap<Script, u64>, donation_script: &Script) -> Vec<TxOut> {
    let mut scripts: Vec<&Script> = amounts
        .keys()
        .filter(|script| *script != donation_script)
        .collect();
    scripts.sort_by(|a, b| amounts[*a].cmp(&amounts[*b]).then_with(|| a.cmp(b)));
    scripts.push(donation_script);
    let keep = scripts.len().saturating_sub(MAX_PAYOUT_OUTPUTS);
    scripts
        .into_iter()
        .skip(keep)
        .filter_map(|script| {
            let value = amounts.get(script).copied().unwrap_or(0);
            (value > 0 || script == donation_script).then(|| TxOut {
                value,
                script: script.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skiplist::SkipList;
    use crate::testing::{ChainBuilder, test_params};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn script(byte: u8) -> Script {
        Script(vec![0x51, byte])
    }

    #[test]
    fn payouts_sum_to_subsidy() {
        let weights = Weights::from([
            (script(1), U256::from(3 * 65535u64)),
            (script(2), U256::from(65535u64)),
        ]);
        let total = U256::from(4 * 65535u64);
        let donation = script(0);
        let amounts = compute_payouts(&weights, total, 5_000_000_000, &script(2), &donation);
        assert_eq!(amounts.values().sum::<u64>(), 5_000_000_000);
        assert_eq!(amounts[&script(1)], 5_000_000_000 * 199 * 3 / 800);
        assert_eq!(
            amounts[&script(2)],
            5_000_000_000 * 199 / 800 + 5_000_000_000 / 200
        );
        assert!(amounts.contains_key(&donation));
    }

    #[test]
    fn boundary_inside_a_share_is_split_proportionally() {
        let strategy = WeightsSkipList;
        let scale = U256::from(DONATION_SCALE);
        let delta = WeightsDelta {
            count: 1,
            weights: Arc::new(Weights::from([(script(1), U256::from(4u64) * (scale - 100))])),
            total: U256::from(4u64) * scale,
            donation: U256::from(400u64),
        };
        let args = (10, U256::from(2u64) * scale);
        let start = strategy.initial_solution(&Hash::zero(), &args);
        let split = strategy.apply_delta(&start, &delta, &args);
        assert_eq!(strategy.judge(&split, &args), Judgement::At);
        let (weights, total, donation) = strategy.finalize(split, &args);
        assert_eq!(total, args.1);
        assert_eq!(weights[&script(1)], U256::from(2u64) * (scale - 100));
        assert_eq!(donation, U256::from(200u64));
        assert_eq!(weights[&script(1)] + donation, total);
    }

    #[test]
    fn empty_window_pays_finder_and_donation() {
        let donation = script(0);
        let amounts = compute_payouts(&Weights::new(), U256::zero(), 1000, &script(7), &donation);
        assert_eq!(amounts[&script(7)], 5);
        assert_eq!(amounts[&donation], 995);
    }

    #[test]
    fn outputs_are_ordered_with_donation_last() {
        let donation = script(0);
        let amounts = HashMap::from([
            (script(3), 10),
            (script(1), 30),
            (script(2), 10),
            (script(4), 0),
            (donation.clone(), 0),
        ]);
        let outputs = payout_outputs(&amounts, &donation);
        let order: Vec<Script> = outputs.iter().map(|out| out.script.clone()).collect();
        assert_eq!(order, vec![script(2), script(3), script(1), donation]);
        assert_eq!(outputs.last().map(|out| out.value), Some(0));
    }

    /// Share by share from `start`, splitting the last share when it
    /// crosses `desired`.
    fn walk(
        items: &HashMap<Hash, Arc<Share>>,
        mut hash: Hash,
        max_shares: u64,
        desired: U256,
    ) -> (Weights, U256, U256) {
        let scale = U256::from(DONATION_SCALE);
        let mut weights = Weights::new();
        let (mut total, mut donation, mut count) = (U256::zero(), U256::zero(), 0);
        while count < max_shares && total < desired {
            let share = &items[&hash];
            let attempts = target_to_average_attempts(share.target);
            let donated = U256::from(share.share_data().donation);
            let (mut weight, mut share_donation) = (attempts * (scale - donated), attempts * donated);
            if total + attempts * scale > desired {
                let remaining = (desired - total) / scale;
                weight = remaining * weight / attempts;
                share_donation = remaining * share_donation / attempts;
                total = desired;
            } else {
                total = total + attempts * scale;
            }
            *weights.entry(share.payout_script().clone()).or_default() += weight;
            donation = donation + share_donation;
            count += 1;
            hash = share.previous_share_hash();
        }
        (weights, total, donation)
    }

    #[test]
    fn skip_list_weights_match_a_plain_walk() {
        let mut builder = ChainBuilder::new(test_params());
        let mut rng = StdRng::seed_from_u64(11);
        let mut hashes = Vec::new();
        let mut previous = Hash::zero();
        for _ in 0..40 {
            builder.desired_target = U256::MAX / U256::from(rng.gen_range(1..20u64));
            builder.donation = rng.gen_range(0..=1000);
            let share = builder.mine(previous, ChainBuilder::script(rng.gen_range(1..5)));
            previous = share.hash;
            hashes.push(share.hash);
        }
        let items = builder.chain.items.items().clone();
        let scale = U256::from(DONATION_SCALE);

        let mut warm = SkipList::with_seed(WeightsSkipList, 1);
        for _ in 0..300 {
            let index = rng.gen_range(0..hashes.len());
            let start = hashes[index];
            let max_shares = rng.gen_range(0..=index as u64 + 1);
            let desired = scale * U256::from(rng.gen_range(0..400u64));
            let args = (max_shares, desired);
            let expected = walk(&items, start, max_shares, desired);

            assert_eq!(warm.query(&items, start, &args).unwrap(), expected);
            // again, now crossing the jumps the first query laid down
            assert_eq!(warm.query(&items, start, &args).unwrap(), expected);
            let mut cold = SkipList::with_seed(WeightsSkipList, rng.r#gen());
            assert_eq!(cold.query(&items, start, &args).unwrap(), expected);
        }
        assert!(!warm.is_empty());
    }
}
