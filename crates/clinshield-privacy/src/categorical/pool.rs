//! Noised value pools, utility scores and dummy injection.

use super::extract::PoolValue;
use crate::mechanisms::laplace_noise;
use clinshield_core::{Result, PLACEHOLDER};
use rand::Rng;
use std::collections::BTreeMap;

/// Share of dummy mass relative to the average original count.
const DUMMY_SHARE: f64 = 0.1;
/// Growth of the dummy entry on every later injection.
const DUMMY_GROWTH: u64 = 4;

/// Utility of a value: its share of the total count.
pub fn utility_scores(counts: &BTreeMap<PoolValue, u64>) -> BTreeMap<PoolValue, f64> {
    let total: u64 = counts.values().sum();
    counts
        .iter()
        .map(|(value, &count)| {
            let share = if total == 0 {
                0.0
            } else {
                count as f64 / total as f64
            };
            (value.clone(), share)
        })
        .collect()
}

/// Pool for one iteration: every count gets `Laplace(0, 1/epsilon)` noise
/// and is floored at 1. A shortfall against the original total is spread
/// back over the keys by original share before rounding.
pub fn noised_counters<R: Rng + ?Sized>(
    counts: &BTreeMap<PoolValue, u64>,
    epsilon: f64,
    rng: &mut R,
) -> Result<BTreeMap<PoolValue, u64>> {
    let original_total: u64 = counts.values().sum();
    let mut noised = BTreeMap::new();
    for (value, &count) in counts {
        let noisy = (count as f64 + laplace_noise(1.0 / epsilon, rng)?).max(1.0);
        noised.insert(value, noisy);
    }

    let deficit = original_total as f64 - noised.values().sum::<f64>();
    if deficit > 0.0 && original_total > 0 {
        for (value, noisy) in noised.iter_mut() {
            let share = counts.get(*value).copied().unwrap_or(0) as f64 / original_total as f64;
            *noisy += deficit * share;
        }
    }

    Ok(noised
        .into_iter()
        .map(|(value, noisy)| (value.clone(), noisy.round() as u64))
        .collect())
}

/// The dummy value of an attribute with `arity` fields.
pub fn dummy_value(arity: usize) -> PoolValue {
    vec![PLACEHOLDER.to_string(); arity.max(1)]
}

/// Adds synthetic placeholder mass to `counts`.
///
/// The first injection adds `ceil(0.1 * average count)`, later ones
/// quadruple the existing dummy entry. Returns the dummy count afterwards.
pub fn inject_dummy(counts: &mut BTreeMap<PoolValue, u64>, arity: usize, first: bool) -> u64 {
    let dummy = dummy_value(arity);
    if first || !counts.contains_key(&dummy) {
        let average = if counts.is_empty() {
            0.0
        } else {
            counts.values().sum::<u64>() as f64 / counts.len() as f64
        };
        let added = ((DUMMY_SHARE * average).ceil() as u64).max(1);
        let entry = counts.entry(dummy).or_insert(0);
        *entry += added;
        *entry
    } else {
        let entry = counts.entry(dummy).or_insert(1);
        *entry = entry.saturating_mul(DUMMY_GROWTH);
        *entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn key(s: &str) -> PoolValue {
        vec![s.to_string()]
    }

    fn gender() -> BTreeMap<PoolValue, u64> {
        BTreeMap::from([(key("M"), 60), (key("F"), 40)])
    }

    #[test]
    fn test_utility_is_share_of_total() {
        let utility = utility_scores(&gender());
        assert_eq!(utility[&key("M")], 0.6);
        assert_eq!(utility[&key("F")], 0.4);
        assert!(utility_scores(&BTreeMap::new()).is_empty());
    }

    #[test]
    fn test_noised_counters_are_positive_and_keep_keys() {
        let mut rng = StdRng::seed_from_u64(21);
        for epsilon in [0.0001, 0.01, 0.5, 1.0] {
            let pool = noised_counters(&gender(), epsilon, &mut rng).unwrap();
            assert_eq!(pool.len(), 2);
            assert!(pool.values().all(|&c| c >= 1));
        }
    }

    #[test]
    fn test_deficit_is_redistributed() {
        let mut rng = StdRng::seed_from_u64(4);
        // noise this large floors most counts at 1 before redistribution
        for _ in 0..50 {
            let pool = noised_counters(&gender(), 0.0001, &mut rng).unwrap();
            let total: u64 = pool.values().sum();
            assert!(total >= 99, "total {}", total);
        }
    }

    #[test]
    fn test_dummy_injection_sizes() {
        let mut counts = gender();
        assert_eq!(inject_dummy(&mut counts, 1, true), 5);
        assert_eq!(counts[&key(PLACEHOLDER)], 5);
        assert_eq!(inject_dummy(&mut counts, 1, false), 20);
        assert_eq!(counts.len(), 3);

        let mut pairs = BTreeMap::from([(vec!["a".to_string(), "b".to_string()], 7u64)]);
        inject_dummy(&mut pairs, 2, true);
        assert_eq!(pairs[&dummy_value(2)], 1);
    }
}
