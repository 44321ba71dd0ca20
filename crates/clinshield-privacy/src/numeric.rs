//! Closed-loop noise calibration of date and decimal fields against an RMSE band.

use crate::adjustment::{MomentumController, NoiseParameters};
use crate::dates::DateValue;
use crate::mechanisms;
use crate::metrics::rmse_by_attribute;
use crate::report::{AttributeOutcome, NumericReport};
use clinshield_core::{
    AnonError, AnonymizerConfig, BandPosition, CalibrationConfig, GeneralizationRule, Mechanism,
    NumericAttribute, RecordBatch, Result, Route, SeedSource, ValueKind,
};
use rand::Rng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
enum NumericValue {
    Date(DateValue),
    Decimal { value: f64, decimals: usize },
}

impl NumericValue {
    fn parse(text: &str, kind: ValueKind) -> Result<Self> {
        match kind {
            ValueKind::Date => DateValue::parse(text).map(NumericValue::Date),
            ValueKind::Decimal => {
                let text = text.trim();
                let value: f64 = text.parse().map_err(|e| {
                    AnonError::Parse(format!("invalid decimal '{}': {}", text, e))
                })?;
                if !value.is_finite() {
                    return Err(AnonError::Parse(format!("non-finite decimal '{}'", text)));
                }
                let decimals = text.split_once('.').map_or(0, |(_, fraction)| fraction.len());
                Ok(NumericValue::Decimal { value, decimals })
            }
        }
    }

    fn as_scalar(&self) -> f64 {
        match self {
            NumericValue::Date(date) => date.to_day_offset(),
            NumericValue::Decimal { value, .. } => *value,
        }
    }

    /// Text for a perturbed scalar, written in the shape of `self`.
    fn render(&self, scalar: f64) -> Result<String> {
        match self {
            NumericValue::Date(date) => Ok(DateValue::from_day_offset(scalar, date)?.format()),
            NumericValue::Decimal { decimals, .. } => Ok(format!("{:.*}", decimals, scalar)),
        }
    }

    fn difference(before: &NumericValue, after: &NumericValue) -> f64 {
        match (before, after) {
            (NumericValue::Date(a), NumericValue::Date(b)) => b.days_since(a),
            (NumericValue::Decimal { value: a, .. }, NumericValue::Decimal { value: b, .. }) => b - a,
            _ => 0.0,
        }
    }
}

struct Occurrence {
    record: usize,
    route: Route,
    original: NumericValue,
    text: String,
}

struct AttributeState<'a> {
    name: &'a str,
    attribute: &'a NumericAttribute,
    kind: ValueKind,
    occurrences: Vec<Occurrence>,
    params: NoiseParameters,
    controller: MomentumController,
    active: bool,
    converged: bool,
    iterations: usize,
    rmse: f64,
}

/// Calibrates every numeric attribute of one batch.
pub struct NumericCalibrator {
    max_iterations: usize,
    momentum: f64,
}

impl NumericCalibrator {
    pub fn new(settings: &CalibrationConfig) -> Self {
        Self {
            max_iterations: settings.max_iterations,
            momentum: settings.momentum,
        }
    }

    pub fn calibrate<R: Rng + ?Sized>(
        &self,
        batch: &mut RecordBatch,
        attributes: &BTreeMap<String, NumericAttribute>,
        rng: &mut R,
    ) -> Result<NumericReport> {
        let mut outcomes = BTreeMap::new();
        let mut states = Vec::new();

        for (name, attribute) in attributes {
            let Some(kind) = attribute.value_kind(name) else {
                warn!(
                    file = %batch.name,
                    attribute = %name,
                    "Cannot tell whether attribute holds dates or decimals, skipping"
                );
                outcomes.insert(name.clone(), AttributeOutcome::skipped());
                continue;
            };
            let occurrences = collect_occurrences(batch, name, attribute, kind);
            if occurrences.is_empty() {
                debug!(file = %batch.name, attribute = %name, "No occurrences found");
                outcomes.insert(name.clone(), AttributeOutcome::skipped());
                continue;
            }
            states.push(AttributeState {
                name,
                attribute,
                kind,
                occurrences,
                params: NoiseParameters {
                    epsilon: attribute.epsilon,
                    sensitivity: attribute.sensitivity,
                    delta: attribute.delta,
                },
                controller: MomentumController::new(self.momentum),
                active: true,
                converged: false,
                iterations: 0,
                rmse: 0.0,
            });
        }

        let mut iterations = 0;
        while iterations < self.max_iterations && states.iter().any(|s| s.active) {
            iterations += 1;
            for state in states.iter_mut().filter(|s| s.active) {
                state.rmse = perturb(batch, state, rng)?;
                state.iterations += 1;

                let position = state.controller.adjust_for_rmse(
                    &mut state.params,
                    state.attribute.mechanism,
                    state.rmse,
                    &state.attribute.rmse_range,
                );
                debug!(
                    file = %batch.name,
                    attribute = %state.name,
                    iteration = iterations,
                    rmse = state.rmse,
                    epsilon = state.params.epsilon,
                    sensitivity = state.params.sensitivity,
                    "Measured numeric distortion"
                );
                if position == BandPosition::Within {
                    state.active = false;
                    state.converged = true;
                    info!(
                        file = %batch.name,
                        attribute = %state.name,
                        iterations = state.iterations,
                        rmse = state.rmse,
                        "Numeric attribute converged"
                    );
                }
            }
        }

        for state in states {
            if state.active {
                warn!(
                    file = %batch.name,
                    attribute = %state.name,
                    iterations = state.iterations,
                    rmse = state.rmse,
                    "Iteration budget exhausted, keeping last perturbation"
                );
            }
            let outcome = AttributeOutcome {
                converged: state.converged,
                skipped: false,
                metric: state.rmse,
                epsilon: state.params.epsilon,
                sensitivity: None,
                delta: None,
                iterations: state.iterations,
                occurrences: state.occurrences.len(),
                dummy_injections: 0,
            }
            .with_parameters(
                &state.params,
                state.attribute.mechanism == Mechanism::Gaussian,
            );
            outcomes.insert(state.name.to_string(), outcome);
        }

        Ok(NumericReport {
            file: batch.name.clone(),
            resource_type: batch.resource_type.clone(),
            generalized: 0,
            attributes: outcomes,
            iterations,
        })
    }
}

fn collect_occurrences(
    batch: &RecordBatch,
    name: &str,
    attribute: &NumericAttribute,
    kind: ValueKind,
) -> Vec<Occurrence> {
    let mut occurrences = Vec::new();
    for (index, record) in batch.records.iter().enumerate() {
        for route in record.root().select(&attribute.path) {
            let Some(text) = record.root().get(&route).and_then(|e| e.value()) else {
                continue;
            };
            match NumericValue::parse(text, kind) {
                Ok(original) => occurrences.push(Occurrence {
                    record: index,
                    route,
                    original,
                    text: text.to_string(),
                }),
                Err(e) => warn!(
                    file = %batch.name,
                    attribute = %name,
                    record = ?record.id(),
                    error = %e,
                    "Skipping unparsable value"
                ),
            }
        }
    }
    occurrences
}

/// Noises every occurrence from its original value, writes it back and
/// returns the resulting RMSE. An occurrence whose noised value cannot be
/// written in its original format keeps its original text for this round and
/// is left out of the measurement.
fn perturb<R: Rng + ?Sized>(
    batch: &mut RecordBatch,
    state: &AttributeState<'_>,
    rng: &mut R,
) -> Result<f64> {
    let mut original = BTreeMap::new();
    let mut perturbed = BTreeMap::new();
    let mut texts = Vec::with_capacity(state.occurrences.len());

    // draw everything first so a mechanism error leaves the batch untouched
    for (n, occurrence) in state.occurrences.iter().enumerate() {
        let scalar = occurrence.original.as_scalar();
        let noised = match state.attribute.mechanism {
            Mechanism::Laplace => mechanisms::laplace(
                scalar,
                state.params.epsilon,
                state.params.sensitivity,
                rng,
            )?,
            Mechanism::Gaussian => mechanisms::gaussian(
                scalar,
                state.params.epsilon,
                state.params.sensitivity,
                state.params.delta,
                rng,
            )?,
        };
        // measure what is actually written
        let rendered = occurrence
            .original
            .render(noised)
            .and_then(|text| NumericValue::parse(&text, state.kind).map(|written| (text, written)));
        match rendered {
            Ok((text, written)) => {
                let key = format!("{}_{}", state.name, n);
                original.insert(key.clone(), occurrence.original);
                perturbed.insert(key, written);
                texts.push(text);
            }
            Err(e) => {
                warn!(
                    file = %batch.name,
                    attribute = %state.name,
                    value = %occurrence.text,
                    error = %e,
                    "Noised value not representable, keeping original"
                );
                texts.push(occurrence.text.clone());
            }
        }
    }

    for (occurrence, text) in state.occurrences.iter().zip(texts) {
        if let Some(element) = batch
            .records
            .get_mut(occurrence.record)
            .and_then(|record| record.root_mut().get_mut(&occurrence.route))
        {
            element.set_text(text);
        }
    }

    let rmse = rmse_by_attribute(&original, &perturbed, NumericValue::difference)?;
    Ok(rmse.values().next().copied().unwrap_or(0.0))
}

/// Coarsens the configured date fields of a batch. Returns the number of
/// values rewritten.
pub fn generalize_batch(
    batch: &mut RecordBatch,
    rules: &BTreeMap<String, GeneralizationRule>,
) -> usize {
    let mut rewritten = 0;
    for (name, rule) in rules {
        for record in &mut batch.records {
            for route in record.root().select(&rule.path) {
                let Some(element) = record.root_mut().get_mut(&route) else {
                    continue;
                };
                let Some(text) = element.value() else {
                    continue;
                };
                match crate::dates::generalize_text(text, rule.grouping) {
                    Some(generalized) => {
                        element.set_text(generalized);
                        rewritten += 1;
                    }
                    None => debug!(attribute = %name, value = %text, "Left ungeneralized"),
                }
            }
        }
    }
    rewritten
}

/// Generalizes and calibrates every batch in parallel. Each batch draws from
/// its own generator derived from the batch name.
pub fn calibrate_batches(
    batches: &mut [RecordBatch],
    config: &AnonymizerConfig,
    seeds: &SeedSource,
) -> Vec<NumericReport> {
    let calibrator = NumericCalibrator::new(&config.calibration);
    batches
        .par_iter_mut()
        .filter_map(|batch| {
            let generalized = config
                .generalization
                .get(&batch.resource_type)
                .map_or(0, |rules| generalize_batch(batch, rules));
            let attributes = config.numeric.get(&batch.resource_type)?;
            let mut rng = seeds.rng_for(&format!("numeric:{}", batch.name));
            match calibrator.calibrate(batch, attributes, &mut rng) {
                Ok(mut report) => {
                    report.generalized = generalized;
                    Some(report)
                }
                Err(e) => {
                    warn!(file = %batch.name, error = %e, "Numeric calibration failed, file skipped");
                    None
                }
            }
        })
        .collect()
}
