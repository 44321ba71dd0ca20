//! Descriptors of protected attributes.

use crate::{FieldPath, ValueRange};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a categorical attribute is located inside a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttributeKind {
    /// A single field.
    Simple { path: FieldPath },
    /// Several fields read position by position as one tuple.
    Combination { paths: Vec<FieldPath> },
    /// One field inside the items of `path` whose `url` matches the filter.
    Nested { path: FieldPath, filter: NestedFilter },
    /// Several fields inside the items of `path` whose `url` matches the filter.
    NestedCombination {
        path: FieldPath,
        filter: NestedCombinationFilter,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedFilter {
    pub url: String,
    pub value_path: FieldPath,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedCombinationFilter {
    pub url: String,
    pub value_paths: Vec<FieldPath>,
}

impl AttributeKind {
    /// Number of fields in one extracted value.
    pub fn arity(&self) -> usize {
        match self {
            AttributeKind::Simple { .. } | AttributeKind::Nested { .. } => 1,
            AttributeKind::Combination { paths } => paths.len(),
            AttributeKind::NestedCombination { filter, .. } => filter.value_paths.len(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AttributeKind::Simple { .. } => "simple",
            AttributeKind::Combination { .. } => "combination",
            AttributeKind::Nested { .. } => "nested",
            AttributeKind::NestedCombination { .. } => "nested_combination",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalAttribute {
    #[serde(flatten)]
    pub kind: AttributeKind,
    pub tvd_range: ValueRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mechanism {
    #[default]
    Laplace,
    Gaussian,
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mechanism::Laplace => write!(f, "laplace"),
            Mechanism::Gaussian => write!(f, "gaussian"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Date,
    Decimal,
}

impl ValueKind {
    /// Guess the kind from an attribute name, e.g. `birthDate` or `valueDecimal`.
    /// Hints are matched against whole camelCase or separator-delimited
    /// words, so `gender` or `weekend` infer nothing.
    pub fn infer(name: &str) -> Option<Self> {
        let words = name_words(name);
        let has = |hint: &str| words.iter().any(|w| w == hint);
        if ["date", "start", "end", "issued"].into_iter().any(has) {
            Some(ValueKind::Date)
        } else if has("decimal") {
            Some(ValueKind::Decimal)
        } else {
            None
        }
    }
}

/// Lowercase words of an identifier: `periodEnd` -> `period`, `end`.
fn name_words(name: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    for c in name.chars() {
        if !c.is_ascii_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }
        if c.is_ascii_uppercase() && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        current.push(c.to_ascii_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericAttribute {
    pub path: FieldPath,
    #[serde(default)]
    pub mechanism: Mechanism,
    /// Explicit value kind; inferred from the attribute name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ValueKind>,
    pub rmse_range: ValueRange,
    #[serde(default = "default_initial_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    #[serde(default = "default_delta")]
    pub delta: f64,
}

impl NumericAttribute {
    pub fn value_kind(&self, name: &str) -> Option<ValueKind> {
        self.value.or_else(|| ValueKind::infer(name))
    }
}

/// Coarsening applied to date fields before noise calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateGrouping {
    Decade,
    Quarter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralizationRule {
    pub path: FieldPath,
    pub grouping: DateGrouping,
}

pub(crate) fn default_initial_epsilon() -> f64 {
    0.5
}
fn default_sensitivity() -> f64 {
    1.0
}
fn default_delta() -> f64 {
    1e-5
}
