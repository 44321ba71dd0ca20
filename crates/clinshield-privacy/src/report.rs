use crate::adjustment::NoiseParameters;
use serde::Serialize;
use std::collections::BTreeMap;

/// Final state of one calibrated attribute.
#[derive(Debug, Clone, Serialize)]
pub struct AttributeOutcome {
    pub converged: bool,
    /// No occurrences were found, so the attribute was never iterated.
    pub skipped: bool,
    /// Last measured RMSE or TVD.
    pub metric: f64,
    pub epsilon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    pub iterations: usize,
    pub occurrences: usize,
    pub dummy_injections: u32,
}

impl AttributeOutcome {
    pub fn skipped() -> Self {
        Self {
            converged: false,
            skipped: true,
            metric: 0.0,
            epsilon: 0.0,
            sensitivity: None,
            delta: None,
            iterations: 0,
            occurrences: 0,
            dummy_injections: 0,
        }
    }

    pub(crate) fn with_parameters(mut self, params: &NoiseParameters, gaussian: bool) -> Self {
        self.epsilon = params.epsilon;
        self.sensitivity = Some(params.sensitivity);
        self.delta = gaussian.then_some(params.delta);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NumericReport {
    pub file: String,
    pub resource_type: String,
    pub generalized: usize,
    pub attributes: BTreeMap<String, AttributeOutcome>,
    pub iterations: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoricalReport {
    pub resource_type: String,
    pub attributes: BTreeMap<String, AttributeOutcome>,
    pub iterations: usize,
}

impl NumericReport {
    pub fn converged(&self) -> bool {
        self.attributes.values().all(|a| a.converged || a.skipped)
    }
}

impl CategoricalReport {
    pub fn converged(&self) -> bool {
        self.attributes.values().all(|a| a.converged || a.skipped)
    }
}
