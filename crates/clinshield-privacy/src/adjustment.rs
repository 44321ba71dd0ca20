//! Momentum-smoothed retuning of noise parameters.

use clinshield_core::{BandPosition, Mechanism, ValueRange};
use serde::Serialize;

/// Lowest epsilon any controller produces.
pub const EPSILON_FLOOR: f64 = 0.0001;
/// Highest epsilon of the categorical controller.
pub const EPSILON_CEILING: f64 = 1.0;
const MAX_RATE: f64 = 2.0;
const MIN_SHRINK: f64 = 0.5;
const MAX_SECONDARY_RATE: f64 = 0.5;
const DELTA_CEILING: f64 = 0.99;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NoiseParameters {
    pub epsilon: f64,
    pub sensitivity: f64,
    pub delta: f64,
}

/// Exponential moving average over adjustment signals.
#[derive(Debug, Clone)]
pub struct MomentumController {
    momentum: f64,
    last_adjustment: f64,
}

impl MomentumController {
    pub fn new(momentum: f64) -> Self {
        Self {
            momentum,
            last_adjustment: 0.0,
        }
    }

    pub fn last_adjustment(&self) -> f64 {
        self.last_adjustment
    }

    fn smooth(&mut self, signal: f64) -> f64 {
        let adjustment = self.momentum * self.last_adjustment + (1.0 - self.momentum) * signal;
        self.last_adjustment = adjustment;
        adjustment
    }

    /// Retunes numeric noise after measuring `rmse` against `band`.
    ///
    /// Too much error raises epsilon, too little lowers it (floored). Once
    /// epsilon reaches the sensitivity, the sensitivity is inflated. Gaussian
    /// delta follows epsilon's direction.
    pub fn adjust_for_rmse(
        &mut self,
        params: &mut NoiseParameters,
        mechanism: Mechanism,
        rmse: f64,
        band: &ValueRange,
    ) -> BandPosition {
        let position = band.position(rmse);
        let boundary = match position {
            BandPosition::Within => return position,
            BandPosition::Above => band.max,
            BandPosition::Below => band.min,
        };
        let deviation = band.deviation(rmse);
        let rate = if boundary > 0.0 {
            (deviation / boundary).min(MAX_RATE)
        } else {
            MAX_RATE
        };
        let adjustment = self.smooth(rate);

        match position {
            BandPosition::Above => params.epsilon *= 1.0 + adjustment,
            _ => {
                params.epsilon =
                    (params.epsilon * (1.0 - adjustment).max(MIN_SHRINK)).max(EPSILON_FLOOR)
            }
        }

        if params.epsilon >= params.sensitivity {
            params.sensitivity *= 1.0 + rate.min(MAX_SECONDARY_RATE);
        }

        if mechanism == Mechanism::Gaussian {
            params.delta = match position {
                BandPosition::Above => params.delta * (1.0 + rate.min(MAX_SECONDARY_RATE)),
                _ => params.delta * (1.0 - rate).max(MIN_SHRINK),
            }
            .min(DELTA_CEILING);
        }

        position
    }

    /// Retunes a categorical epsilon after measuring `tvd` against `band`.
    ///
    /// Large misses relative to the band midpoint are weighted up. The result
    /// is clamped to `[EPSILON_FLOOR, EPSILON_CEILING]`.
    pub fn adjust_for_tvd(&mut self, epsilon: f64, tvd: f64, band: &ValueRange) -> f64 {
        let position = band.position(tvd);
        if position == BandPosition::Within {
            return epsilon.clamp(EPSILON_FLOOR, EPSILON_CEILING);
        }

        let deviation = band.deviation(tvd);
        let target = band.midpoint().abs();
        let relative = if target > 0.0 {
            deviation / target
        } else {
            deviation
        };
        let rate = relative.min(MAX_RATE);
        let weight = if deviation > target * 0.5 {
            1.0 + relative
        } else {
            1.0
        };
        let adjustment = self.smooth(rate * weight);

        let epsilon = match position {
            BandPosition::Above => epsilon * (1.0 + adjustment),
            _ => (epsilon * (1.0 - adjustment).max(MIN_SHRINK)).max(EPSILON_FLOOR),
        };
        epsilon.clamp(EPSILON_FLOOR, EPSILON_CEILING)
    }
}
