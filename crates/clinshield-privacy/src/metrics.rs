//! Distances between original and perturbed data.

use crate::dates::DateValue;
use clinshield_core::{AnonError, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Total variation distance between two count maps.
///
/// Both maps are normalized over the union of their keys. An empty map (or
/// one whose counts sum to zero) yields 0.
pub fn total_variation_distance<K: Ord>(
    original: &BTreeMap<K, u64>,
    perturbed: &BTreeMap<K, u64>,
) -> f64 {
    let original_total: u64 = original.values().sum();
    let perturbed_total: u64 = perturbed.values().sum();
    if original_total == 0 || perturbed_total == 0 {
        return 0.0;
    }

    let keys: BTreeSet<&K> = original.keys().chain(perturbed.keys()).collect();
    let distance: f64 = keys
        .into_iter()
        .map(|key| {
            let p = original.get(key).copied().unwrap_or(0) as f64 / original_total as f64;
            let q = perturbed.get(key).copied().unwrap_or(0) as f64 / perturbed_total as f64;
            (p - q).abs()
        })
        .sum();
    (0.5 * distance).clamp(0.0, 1.0)
}

/// Attribute name of an occurrence key such as `birthDate_3`.
pub fn attribute_of(key: &str) -> &str {
    match key.rsplit_once('_') {
        Some((name, index)) if !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => key,
    }
}

/// Root-mean-square error per attribute over positional occurrence keys.
///
/// Both maps must have exactly the same keys.
pub fn rmse_by_attribute<V>(
    original: &BTreeMap<String, V>,
    perturbed: &BTreeMap<String, V>,
    difference: impl Fn(&V, &V) -> f64,
) -> Result<BTreeMap<String, f64>> {
    if original.len() != perturbed.len() || !original.keys().all(|k| perturbed.contains_key(k)) {
        return Err(AnonError::Metric(
            "original and perturbed values cover different keys".to_string(),
        ));
    }

    let mut squares: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for (key, before) in original {
        if let Some(after) = perturbed.get(key) {
            let diff = difference(before, after);
            let entry = squares.entry(attribute_of(key)).or_insert((0.0, 0));
            entry.0 += diff * diff;
            entry.1 += 1;
        }
    }
    Ok(squares
        .into_iter()
        .map(|(name, (sum, n))| (name.to_string(), (sum / n as f64).sqrt()))
        .collect())
}

/// RMSE in days.
pub fn rmse_dates(
    original: &BTreeMap<String, DateValue>,
    perturbed: &BTreeMap<String, DateValue>,
) -> Result<BTreeMap<String, f64>> {
    rmse_by_attribute(original, perturbed, |before, after| after.days_since(before))
}

pub fn rmse_decimals(
    original: &BTreeMap<String, f64>,
    perturbed: &BTreeMap<String, f64>,
) -> Result<BTreeMap<String, f64>> {
    rmse_by_attribute(original, perturbed, |before, after| after - before)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_tvd_identity_and_bounds() {
        let counts = BTreeMap::from([("M", 60u64), ("F", 40)]);
        assert_eq!(total_variation_distance(&counts, &counts), 0.0);

        let disjoint = BTreeMap::from([("X", 5u64)]);
        assert_relative_eq!(total_variation_distance(&counts, &disjoint), 1.0, epsilon = 1e-12);

        let shifted = BTreeMap::from([("M", 40u64), ("F", 60)]);
        assert_relative_eq!(total_variation_distance(&counts, &shifted), 0.2, epsilon = 1e-12);

        let empty: BTreeMap<&str, u64> = BTreeMap::new();
        assert_eq!(total_variation_distance(&counts, &empty), 0.0);
    }

    #[test]
    fn test_tvd_stays_in_unit_interval() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let a: BTreeMap<u8, u64> = (0..5).map(|k| (k, rng.random_range(0..50))).collect();
            let b: BTreeMap<u8, u64> = (2..8).map(|k| (k, rng.random_range(0..50))).collect();
            let tvd = total_variation_distance(&a, &b);
            assert!((0.0..=1.0).contains(&tvd));
        }
    }

    #[test]
    fn test_attribute_of_strips_positional_suffix() {
        assert_eq!(attribute_of("birthDate_12"), "birthDate");
        assert_eq!(attribute_of("period_start_0"), "period_start");
        assert_eq!(attribute_of("plain"), "plain");
        assert_eq!(attribute_of("name_x"), "name_x");
    }

    #[test]
    fn test_rmse_groups_by_attribute() {
        let original = BTreeMap::from([
            ("a_0".to_string(), 1.0),
            ("a_1".to_string(), 2.0),
            ("b_0".to_string(), 10.0),
        ]);
        let perturbed = BTreeMap::from([
            ("a_0".to_string(), 4.0),
            ("a_1".to_string(), -2.0),
            ("b_0".to_string(), 10.0),
        ]);
        let rmse = rmse_decimals(&original, &perturbed).unwrap();
        assert_relative_eq!(rmse["a"], (12.5f64).sqrt());
        assert_eq!(rmse["b"], 0.0);

        let mut missing = perturbed.clone();
        missing.remove("b_0");
        assert!(rmse_decimals(&original, &missing).is_err());
    }

    #[test]
    fn test_rmse_dates_in_days() {
        let original = BTreeMap::from([(
            "birthDate_0".to_string(),
            DateValue::parse("2000-01-01").unwrap(),
        )]);
        let perturbed = BTreeMap::from([(
            "birthDate_0".to_string(),
            DateValue::parse("1999-12-29").unwrap(),
        )]);
        let rmse = rmse_dates(&original, &perturbed).unwrap();
        assert_relative_eq!(rmse["birthDate"], 3.0);
        assert!(rmse["birthDate"] >= 0.0);
    }
}
