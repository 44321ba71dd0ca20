//! Noise primitives.
//!
//! Every function takes the random source explicitly so that a seeded
//! `StdRng` reproduces a run exactly.

use clinshield_core::{AnonError, Result};
use rand::distr::weighted::WeightedIndex;
use rand::Rng;
use rand_distr::{Distribution, Exp, Normal};
use std::collections::BTreeMap;

fn check_epsilon(epsilon: f64) -> Result<()> {
    if epsilon.is_finite() && epsilon > 0.0 {
        Ok(())
    } else {
        Err(AnonError::Domain(format!(
            "epsilon must be positive and finite, got {}",
            epsilon
        )))
    }
}

fn check_sensitivity(sensitivity: f64) -> Result<()> {
    if sensitivity.is_finite() && sensitivity >= 0.0 {
        Ok(())
    } else {
        Err(AnonError::Domain(format!(
            "sensitivity must be non-negative and finite, got {}",
            sensitivity
        )))
    }
}

/// Sample from Laplace(0, scale) as the difference of two exponentials.
pub fn laplace_noise<R: Rng + ?Sized>(scale: f64, rng: &mut R) -> Result<f64> {
    if scale == 0.0 {
        return Ok(0.0);
    }
    let exp = Exp::new(1.0 / scale)
        .map_err(|e| AnonError::Domain(format!("invalid Laplace scale {}: {}", scale, e)))?;
    Ok(exp.sample(rng) - exp.sample(rng))
}

/// `value + Laplace(0, sensitivity / epsilon)`
pub fn laplace<R: Rng + ?Sized>(
    value: f64,
    epsilon: f64,
    sensitivity: f64,
    rng: &mut R,
) -> Result<f64> {
    check_epsilon(epsilon)?;
    check_sensitivity(sensitivity)?;
    Ok(value + laplace_noise(sensitivity / epsilon, rng)?)
}

/// Standard deviation of the analytic Gaussian mechanism.
pub fn gaussian_sigma(epsilon: f64, sensitivity: f64, delta: f64) -> Result<f64> {
    check_epsilon(epsilon)?;
    check_sensitivity(sensitivity)?;
    if !(delta > 0.0 && delta < 1.0) {
        return Err(AnonError::Domain(format!(
            "delta must lie in (0, 1), got {}",
            delta
        )));
    }
    Ok(sensitivity * (2.0 * (1.25 / delta).ln()).sqrt() / epsilon)
}

/// `value + Normal(0, sensitivity * sqrt(2 ln(1.25 / delta)) / epsilon)`
pub fn gaussian<R: Rng + ?Sized>(
    value: f64,
    epsilon: f64,
    sensitivity: f64,
    delta: f64,
    rng: &mut R,
) -> Result<f64> {
    let sigma = gaussian_sigma(epsilon, sensitivity, delta)?;
    if sigma == 0.0 {
        return Ok(value);
    }
    let normal = Normal::new(0.0, sigma)
        .map_err(|e| AnonError::Domain(format!("invalid Gaussian sigma {}: {}", sigma, e)))?;
    Ok(value + normal.sample(rng))
}

/// Exponential mechanism over a depleting pool.
///
/// Picks a key with remaining count > 0 with probability proportional to
/// `exp(epsilon * utility / 2)`, decrements its count and removes the entry
/// once it reaches zero. Keys without a utility score are scored 0.
pub fn exponential_select<K, R>(
    utility: &BTreeMap<K, f64>,
    pool: &mut BTreeMap<K, u64>,
    epsilon: f64,
    rng: &mut R,
) -> Result<K>
where
    K: Ord + Clone,
    R: Rng + ?Sized,
{
    check_epsilon(epsilon)?;
    let candidates: Vec<(&K, f64)> = pool
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(key, _)| (key, epsilon * utility.get(key).copied().unwrap_or(0.0) / 2.0))
        .collect();
    if candidates.is_empty() {
        return Err(AnonError::EmptyPool);
    }

    // shift exponents so the largest weight is 1
    let max_exponent = candidates
        .iter()
        .map(|(_, e)| *e)
        .fold(f64::NEG_INFINITY, f64::max);
    let weights: Vec<f64> = candidates
        .iter()
        .map(|(_, e)| (e - max_exponent).exp())
        .collect();
    let index = WeightedIndex::new(&weights)
        .map_err(|e| AnonError::Domain(format!("invalid selection weights: {}", e)))?;
    let chosen = candidates[index.sample(rng)].0.clone();

    if let Some(count) = pool.get_mut(&chosen) {
        *count -= 1;
        if *count == 0 {
            pool.remove(&chosen);
        }
    }
    Ok(chosen)
}
