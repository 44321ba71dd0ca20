//! Closed-loop calibration of enumerated fields against a TVD band.
//!
//! Every iteration builds a fresh noised pool per attribute from the
//! original counts and redraws each occurrence from it with the exponential
//! mechanism. The distance between original and redrawn counts then retunes
//! epsilon. When epsilon collapses, placeholder mass is injected into the
//! pool so the attribute can keep moving.

pub mod extract;
pub mod pool;

pub use extract::{extract_counts, locate, PoolValue, Slot};
pub use pool::{dummy_value, inject_dummy, noised_counters, utility_scores};

use crate::adjustment::MomentumController;
use crate::mechanisms::exponential_select;
use crate::metrics::total_variation_distance;
use crate::report::{AttributeOutcome, CategoricalReport};
use clinshield_core::{
    AnonError, AnonymizerConfig, BandPosition, CalibrationConfig, CategoricalAttribute, Record,
    RecordBatch, Result, SeedSource,
};
use rand::Rng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Epsilon at or below which dummy mass is injected.
pub const DUMMY_THRESHOLD: f64 = 0.0002;
/// Epsilon an attribute restarts from after an injection.
pub const DUMMY_RESET_EPSILON: f64 = 0.5;

/// What one calibration pass over an attribute did.
#[derive(Debug, Clone, PartialEq)]
pub struct PassOutcome {
    /// Dummy count after an injection at the start of the pass.
    pub injected: Option<u64>,
    /// Epsilon the pass drew with.
    pub epsilon: f64,
    /// Occurrences actually redrawn.
    pub replaced: usize,
    pub tvd: f64,
    pub position: BandPosition,
}

/// Mutable calibration state of one categorical attribute.
#[derive(Debug, Clone)]
pub struct AttributeCalibration {
    name: String,
    attribute: CategoricalAttribute,
    original: BTreeMap<PoolValue, u64>,
    utility: BTreeMap<PoolValue, f64>,
    slots: Vec<Slot>,
    epsilon: f64,
    controller: MomentumController,
    active: bool,
    converged: bool,
    dummy_injections: u32,
    iterations: usize,
    tvd: f64,
}

impl AttributeCalibration {
    pub fn new(
        name: impl Into<String>,
        attribute: &CategoricalAttribute,
        records: &[Record],
        settings: &CalibrationConfig,
    ) -> Self {
        let original = extract_counts(records, &attribute.kind);
        Self {
            name: name.into(),
            attribute: attribute.clone(),
            utility: utility_scores(&original),
            original,
            slots: locate(records, &attribute.kind),
            epsilon: settings.initial_epsilon,
            controller: MomentumController::new(settings.momentum),
            active: true,
            converged: false,
            dummy_injections: 0,
            iterations: 0,
            tvd: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Original counts, including any injected dummy mass.
    pub fn original_counts(&self) -> &BTreeMap<PoolValue, u64> {
        &self.original
    }

    pub fn has_values(&self) -> bool {
        !self.original.is_empty()
    }

    /// Injects dummy mass if epsilon has collapsed, redraws every slot and
    /// retunes epsilon from the resulting TVD.
    pub fn pass<R: Rng + ?Sized>(
        &mut self,
        records: &mut [Record],
        rng: &mut R,
    ) -> Result<PassOutcome> {
        let injected = (self.epsilon <= DUMMY_THRESHOLD).then(|| self.inject_dummy());
        let epsilon = self.epsilon;

        let mut pool = noised_counters(&self.original, epsilon, rng)?;
        let mut replaced = 0;
        for slot in &self.slots {
            match exponential_select(&self.utility, &mut pool, epsilon, rng) {
                Ok(value) => {
                    extract::write(records, slot, &value);
                    replaced += 1;
                }
                // the rest keep their current values this iteration
                Err(AnonError::EmptyPool) => break,
                Err(e) => return Err(e),
            }
        }

        let perturbed = extract_counts(records, &self.attribute.kind);
        self.tvd = total_variation_distance(&self.original, &perturbed);
        self.iterations += 1;
        let position = self.attribute.tvd_range.position(self.tvd);
        if position == BandPosition::Within {
            self.active = false;
            self.converged = true;
        } else {
            self.epsilon = self
                .controller
                .adjust_for_tvd(self.epsilon, self.tvd, &self.attribute.tvd_range);
        }

        Ok(PassOutcome {
            injected,
            epsilon,
            replaced,
            tvd: self.tvd,
            position,
        })
    }

    fn inject_dummy(&mut self) -> u64 {
        let first = self.dummy_injections == 0;
        let count = inject_dummy(&mut self.original, self.attribute.kind.arity(), first);
        self.utility = utility_scores(&self.original);
        self.dummy_injections += 1;
        self.epsilon = DUMMY_RESET_EPSILON;
        info!(
            attribute = %self.name,
            dummy_count = count,
            injections = self.dummy_injections,
            "Epsilon collapsed, injected placeholder values"
        );
        count
    }

    pub fn outcome(&self) -> AttributeOutcome {
        AttributeOutcome {
            converged: self.converged,
            skipped: false,
            metric: self.tvd,
            epsilon: self.epsilon,
            sensitivity: None,
            delta: None,
            iterations: self.iterations,
            occurrences: self.slots.len(),
            dummy_injections: self.dummy_injections,
        }
    }
}

/// Calibrates all categorical attributes of one resource type.
pub struct CategoricalCalibrator {
    settings: CalibrationConfig,
}

impl CategoricalCalibrator {
    pub fn new(settings: &CalibrationConfig) -> Self {
        Self {
            settings: settings.clone(),
        }
    }

    pub fn calibrate<R: Rng + ?Sized>(
        &self,
        resource_type: &str,
        records: &mut [Record],
        attributes: &BTreeMap<String, CategoricalAttribute>,
        rng: &mut R,
    ) -> Result<CategoricalReport> {
        let mut outcomes = BTreeMap::new();
        let mut states = Vec::new();
        for (name, attribute) in attributes {
            let state = AttributeCalibration::new(name, attribute, records, &self.settings);
            if state.has_values() {
                states.push(state);
            } else {
                debug!(resource = %resource_type, attribute = %name, "No values observed, skipping");
                outcomes.insert(name.clone(), AttributeOutcome::skipped());
            }
        }

        let mut iterations = 0;
        while iterations < self.settings.max_iterations && states.iter().any(|s| s.is_active()) {
            iterations += 1;
            for state in states.iter_mut().filter(|s| s.is_active()) {
                let pass = state.pass(records, rng)?;
                debug!(
                    resource = %resource_type,
                    attribute = %state.name(),
                    iteration = iterations,
                    epsilon = pass.epsilon,
                    tvd = pass.tvd,
                    replaced = pass.replaced,
                    "Measured categorical distortion"
                );
                if pass.position == BandPosition::Within {
                    info!(
                        resource = %resource_type,
                        attribute = %state.name(),
                        iterations = iterations,
                        tvd = pass.tvd,
                        "Categorical attribute converged"
                    );
                }
            }
        }

        for state in states {
            if state.is_active() {
                warn!(
                    resource = %resource_type,
                    attribute = %state.name(),
                    iterations = iterations,
                    tvd = state.tvd,
                    "Iteration budget exhausted, keeping last perturbation"
                );
            }
            outcomes.insert(state.name().to_string(), state.outcome());
        }

        Ok(CategoricalReport {
            resource_type: resource_type.to_string(),
            attributes: outcomes,
            iterations,
        })
    }
}

/// Runs one calibrator per resource type in parallel. The records of all
/// batches sharing a type are calibrated together.
pub fn calibrate_resources(
    batches: &mut [RecordBatch],
    config: &AnonymizerConfig,
    seeds: &SeedSource,
) -> Vec<CategoricalReport> {
    let mut groups: BTreeMap<String, Vec<&mut RecordBatch>> = BTreeMap::new();
    for batch in batches.iter_mut() {
        if config.categorical.contains_key(&batch.resource_type) {
            groups
                .entry(batch.resource_type.clone())
                .or_default()
                .push(batch);
        }
    }

    let calibrator = CategoricalCalibrator::new(&config.calibration);
    groups
        .into_par_iter()
        .filter_map(|(resource_type, mut group)| {
            let attributes = config.categorical.get(&resource_type)?;
            let lengths: Vec<usize> = group.iter().map(|b| b.records.len()).collect();
            let mut records: Vec<Record> = group
                .iter_mut()
                .flat_map(|b| std::mem::take(&mut b.records))
                .collect();

            let mut rng = seeds.rng_for(&format!("categorical:{}", resource_type));
            let result = calibrator.calibrate(&resource_type, &mut records, attributes, &mut rng);

            let mut remaining = records.into_iter();
            for (batch, len) in group.iter_mut().zip(lengths) {
                batch.records = remaining.by_ref().take(len).collect();
            }

            match result {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(resource = %resource_type, error = %e, "Categorical calibration failed");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinshield_core::{AttributeKind, ValueRange};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn patients(genders: &[(&str, usize)]) -> Vec<Record> {
        let mut records = Vec::new();
        for (gender, count) in genders {
            for _ in 0..*count {
                let id = format!("p{}", records.len());
                records.push(
                    Record::from_json(&json!({
                        "resourceType": "Patient",
                        "id": id,
                        "gender": gender,
                    }))
                    .unwrap(),
                );
            }
        }
        records
    }

    fn gender(range: ValueRange) -> CategoricalAttribute {
        CategoricalAttribute {
            kind: AttributeKind::Simple {
                path: ".//gender".parse().unwrap(),
            },
            tvd_range: range,
        }
    }

    #[test]
    fn test_pass_replaces_every_slot_and_measures() {
        let mut records = patients(&[("male", 6), ("female", 4)]);
        let attribute = gender(ValueRange::new(0.0, 1.0).unwrap());
        let mut state =
            AttributeCalibration::new("gender", &attribute, &records, &CalibrationConfig::default());
        let mut rng = StdRng::seed_from_u64(8);

        let pass = state.pass(&mut records, &mut rng).unwrap();
        assert_eq!(pass.injected, None);
        assert_eq!(pass.epsilon, 0.5);
        assert!(pass.replaced <= 10);
        assert_eq!(pass.position, BandPosition::Within);
        assert!(!state.is_active());
        let values: u64 = extract_counts(&records, &attribute.kind).values().sum();
        assert_eq!(values, 10);
    }

    #[test]
    fn test_attribute_without_values_is_skipped() {
        let mut records = patients(&[("male", 3)]);
        let attributes = BTreeMap::from([(
            "maritalStatus".to_string(),
            CategoricalAttribute {
                kind: AttributeKind::Simple {
                    path: ".//maritalStatus/text".parse().unwrap(),
                },
                tvd_range: ValueRange::new(0.1, 0.2).unwrap(),
            },
        )]);
        let calibrator = CategoricalCalibrator::new(&CalibrationConfig::default());
        let mut rng = StdRng::seed_from_u64(0);
        let report = calibrator
            .calibrate("Patient", &mut records, &attributes, &mut rng)
            .unwrap();
        assert!(report.attributes["maritalStatus"].skipped);
        assert_eq!(report.iterations, 0);
    }

    #[test]
    fn test_resources_are_split_back_into_batches() {
        let mut config = AnonymizerConfig::default();
        config.categorical.insert(
            "Patient".to_string(),
            BTreeMap::from([("gender".to_string(), gender(ValueRange::new(0.0, 1.0).unwrap()))]),
        );
        let mut batches = vec![
            RecordBatch::new("a.json", "Patient", patients(&[("male", 3)])),
            RecordBatch::new("b.json", "Patient", patients(&[("female", 5)])),
        ];
        let ids_before: Vec<Vec<String>> = batches
            .iter()
            .map(|b| b.records.iter().filter_map(|r| r.id().map(String::from)).collect())
            .collect();

        let reports = calibrate_resources(&mut batches, &config, &SeedSource::new(1));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].attributes["gender"].occurrences, 8);
        let ids_after: Vec<Vec<String>> = batches
            .iter()
            .map(|b| b.records.iter().filter_map(|r| r.id().map(String::from)).collect())
            .collect();
        assert_eq!(ids_before, ids_after);
    }
}
