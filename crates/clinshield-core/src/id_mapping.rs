use crate::{Element, Record, Reference, ReferenceTarget, REFERENCE_TAG};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Builder;

/// Random v4 UUID that `is_taken` does not reject.
pub fn generate_unique_id<R: Rng + ?Sized>(rng: &mut R, is_taken: impl Fn(&str) -> bool) -> String {
    loop {
        let id = Builder::from_random_bytes(rng.random())
            .into_uuid()
            .to_string();
        if !is_taken(&id) {
            return id;
        }
    }
}

/// Bijective table from original identifiers to fresh ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdMapping {
    forward: BTreeMap<String, String>,
    reverse: BTreeMap<String, String>,
}

impl IdMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mapped id for `original`, issuing a fresh one on first sight.
    pub fn map_id<R: Rng + ?Sized>(&mut self, original: &str, rng: &mut R) -> &str {
        if !self.forward.contains_key(original) {
            let fresh = generate_unique_id(rng, |candidate| {
                self.reverse.contains_key(candidate) || self.forward.contains_key(candidate)
            });
            self.reverse.insert(fresh.clone(), original.to_string());
            self.forward.insert(original.to_string(), fresh);
        }
        self.forward
            .get(original)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn get(&self, original: &str) -> Option<&str> {
        self.forward.get(original).map(String::as_str)
    }

    pub fn original_of(&self, mapped: &str) -> Option<&str> {
        self.reverse.get(mapped).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Rewrites the record's own id wherever it appears in the record and
    /// the id part of `Type/id` references. Other texts are left alone even
    /// when they equal some other record's id. Returns the number of
    /// rewritten elements.
    pub fn apply(&self, record: &mut Record) -> usize {
        let own = record
            .id()
            .and_then(|id| self.get(id).map(|mapped| (id.to_string(), mapped.to_string())));
        self.rewrite(record.root_mut(), own.as_ref())
    }

    fn rewrite(&self, element: &mut Element, own: Option<&(String, String)>) -> usize {
        let mut rewritten = 0;
        if let Some(replacement) = self.replacement_for(element, own) {
            element.set_text(replacement);
            rewritten += 1;
        }
        for child in &mut element.children {
            rewritten += self.rewrite(child, own);
        }
        rewritten
    }

    fn replacement_for(&self, element: &Element, own: Option<&(String, String)>) -> Option<String> {
        let text = element.value()?;
        if element.tag == REFERENCE_TAG {
            let reference: Reference = text.parse().ok()?;
            return match &reference.target {
                ReferenceTarget::Id(id) => self.get(id).map(|mapped| {
                    Reference::to_id(reference.resource_type.clone(), mapped).to_string()
                }),
                ReferenceTarget::Query(_) => None,
            };
        }
        let (original, mapped) = own?;
        (text == original).then(|| mapped.clone())
    }
}
