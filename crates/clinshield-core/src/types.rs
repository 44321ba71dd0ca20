use crate::{AnonError, Record, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Resource type tag such as `Patient` or `Encounter`.
pub type ResourceType = String;

/// Identifier of a record or display-name entity.
pub type NodeId = String;

/// Target part of a reference string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReferenceTarget {
    /// `Type/id`
    Id(String),
    /// `Type?query`, used for conditional references to external entities.
    Query(String),
}

/// Parsed `Type/id` or `Type?query` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    pub resource_type: ResourceType,
    pub target: ReferenceTarget,
}

impl Reference {
    pub fn to_id(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            target: ReferenceTarget::Id(id.into()),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match &self.target {
            ReferenceTarget::Id(id) => Some(id),
            ReferenceTarget::Query(_) => None,
        }
    }
}

impl FromStr for Reference {
    type Err = AnonError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s
            .find(['/', '?'])
            .ok_or_else(|| AnonError::Parse(format!("not a reference: '{}'", s)))?;
        let (resource_type, rest) = s.split_at(split);
        let valid_type = resource_type
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_uppercase())
            && resource_type.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid_type || rest.len() < 2 {
            return Err(AnonError::Parse(format!("not a reference: '{}'", s)));
        }
        let target = match rest.split_at(1) {
            ("/", id) => ReferenceTarget::Id(id.split('/').next().unwrap_or(id).to_string()),
            (_, query) => ReferenceTarget::Query(query.to_string()),
        };
        Ok(Self {
            resource_type: resource_type.to_string(),
            target,
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            ReferenceTarget::Id(id) => write!(f, "{}/{}", self.resource_type, id),
            ReferenceTarget::Query(query) => write!(f, "{}?{}", self.resource_type, query),
        }
    }
}

/// Closed accuracy band `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 2]", into = "[f64; 2]")]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Result<Self> {
        if !(min.is_finite() && max.is_finite()) || min > max || min < 0.0 {
            return Err(AnonError::Config(format!(
                "invalid range [{}, {}]: bounds must be finite, non-negative and ordered",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// Band centred on `target`. Bounds may be negative.
    pub fn around(target: f64, tolerance: f64) -> Self {
        Self {
            min: target - tolerance,
            max: target + tolerance,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Distance from the band, zero inside it.
    pub fn deviation(&self, value: f64) -> f64 {
        if value < self.min {
            self.min - value
        } else if value > self.max {
            value - self.max
        } else {
            0.0
        }
    }

    pub fn midpoint(&self) -> f64 {
        (self.min + self.max) / 2.0
    }

    pub fn position(&self, value: f64) -> BandPosition {
        if value < self.min {
            BandPosition::Below
        } else if value > self.max {
            BandPosition::Above
        } else {
            BandPosition::Within
        }
    }
}

impl TryFrom<[f64; 2]> for ValueRange {
    type Error = AnonError;

    fn try_from([min, max]: [f64; 2]) -> Result<Self> {
        Self::new(min, max)
    }
}

impl From<ValueRange> for [f64; 2] {
    fn from(range: ValueRange) -> Self {
        [range.min, range.max]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandPosition {
    Below,
    Within,
    Above,
}

/// One unit of input, typically the records of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordBatch {
    pub name: String,
    pub resource_type: ResourceType,
    pub records: Vec<Record>,
}

impl RecordBatch {
    pub fn new(
        name: impl Into<String>,
        resource_type: impl Into<String>,
        records: Vec<Record>,
    ) -> Self {
        Self {
            name: name.into(),
            resource_type: resource_type.into(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_parsing() {
        let r: Reference = "Patient/123".parse().unwrap();
        assert_eq!(r.resource_type, "Patient");
        assert_eq!(r.id(), Some("123"));
        assert_eq!(r.to_string(), "Patient/123");

        let q: Reference = "Practitioner?identifier=npi|9".parse().unwrap();
        assert_eq!(q.target, ReferenceTarget::Query("identifier=npi|9".into()));
        assert_eq!(q.to_string(), "Practitioner?identifier=npi|9");

        assert!("urn:uuid:1234".parse::<Reference>().is_err());
        assert!("Patient/".parse::<Reference>().is_err());
    }

    #[test]
    fn test_range_deviation() {
        let range = ValueRange::new(0.1, 0.4).unwrap();
        assert_eq!(range.deviation(0.2), 0.0);
        assert!((range.deviation(0.5) - 0.1).abs() < 1e-12);
        assert_eq!(range.position(0.05), BandPosition::Below);
        assert!(ValueRange::new(0.5, 0.1).is_err());
        assert!(ValueRange::new(-1.0, 0.1).is_err());
    }
}
