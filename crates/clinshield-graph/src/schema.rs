//! Which resource types may reference which.

use crate::graph::ReferenceGraph;
use clinshield_core::{Record, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// `type -> {referenced type -> label}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaGraph {
    links: BTreeMap<ResourceType, BTreeMap<ResourceType, String>>,
}

impl SchemaGraph {
    pub fn new(links: BTreeMap<ResourceType, BTreeMap<ResourceType, String>>) -> Self {
        Self { links }
    }

    /// Scans the first `sample_size` records of each type for outbound
    /// reference targets.
    pub fn derive<'a>(
        records: impl IntoIterator<Item = &'a Record>,
        sample_size: usize,
        display_types: &[String],
    ) -> Self {
        let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
        let mut links: BTreeMap<ResourceType, BTreeMap<ResourceType, String>> = BTreeMap::new();
        for record in records {
            let count = seen.entry(record.resource_type()).or_insert(0);
            if *count >= sample_size {
                continue;
            }
            *count += 1;

            let targets = links.entry(record.resource_type().to_string()).or_default();
            for (_, reference) in record.references() {
                let label = if display_types.contains(&reference.resource_type) {
                    reference.resource_type.clone()
                } else {
                    format!("references to {}", reference.resource_type)
                };
                targets.entry(reference.resource_type).or_insert(label);
            }
        }
        links.retain(|_, targets| !targets.is_empty());
        debug!(types = links.len(), "Derived schema graph");
        Self { links }
    }

    pub fn links(&self) -> &BTreeMap<ResourceType, BTreeMap<ResourceType, String>> {
        &self.links
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Whether records of `source` are expected to reference `target`.
    pub fn governs(&self, source: &str, target: &str) -> bool {
        self.links
            .get(source)
            .is_some_and(|targets| targets.contains_key(target))
    }

    /// An edge between the two types is allowed in either direction.
    pub fn allows(&self, a: &str, b: &str) -> bool {
        self.governs(a, b) || self.governs(b, a)
    }

    /// Every type named anywhere in the schema.
    pub fn types(&self) -> BTreeSet<&str> {
        self.links
            .iter()
            .flat_map(|(source, targets)| {
                std::iter::once(source.as_str()).chain(targets.keys().map(String::as_str))
            })
            .collect()
    }

    /// Types that may connect to every one of `anchors`.
    pub fn compatible_types(&self, anchors: &[&str]) -> Vec<&str> {
        self.types()
            .into_iter()
            .filter(|candidate| anchors.iter().all(|anchor| self.allows(candidate, anchor)))
            .collect()
    }

    /// Whether an edge between nodes `a` and `b` of `graph` is allowed.
    pub fn is_valid_connection(&self, graph: &ReferenceGraph, a: &str, b: &str) -> bool {
        if a == b {
            return false;
        }
        match (graph.resource_type(a), graph.resource_type(b)) {
            (Some(type_a), Some(type_b)) => self.allows(type_a, type_b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_derive_labels_and_sampling() {
        let displays = vec!["Practitioner".to_string()];
        let mut records = vec![Record::from_json(&json!({
            "resourceType": "Encounter",
            "id": "e0",
            "subject": { "reference": "Patient/p1" },
            "participant": [{ "individual": { "reference": "Practitioner/x", "display": "Dr" } }]
        }))
        .unwrap()];
        // beyond the sample, never scanned
        records.push(
            Record::from_json(&json!({
                "resourceType": "Encounter",
                "id": "e1",
                "location": [{ "location": { "reference": "Location/l1" } }]
            }))
            .unwrap(),
        );

        let schema = SchemaGraph::derive(&records, 1, &displays);
        let encounter = &schema.links()["Encounter"];
        assert_eq!(encounter["Patient"], "references to Patient");
        assert_eq!(encounter["Practitioner"], "Practitioner");
        assert!(!schema.governs("Encounter", "Location"));
        assert!(schema.allows("Patient", "Encounter"));
        assert!(!schema.governs("Patient", "Encounter"));
        assert_eq!(schema.compatible_types(&["Patient"]), vec!["Encounter"]);
    }
}
