use crate::{Element, Record, ResourceType, REFERENCE_TAG, ROOT_TAG};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fields never filled with placeholders; identity and links are set separately.
const RESERVED_FIELDS: [&str; 3] = ["resourceType", "id", REFERENCE_TAG];

/// Field tree of a resource type. A shape without fields is a leaf.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldShape {
    pub fields: BTreeMap<String, FieldShape>,
}

impl FieldShape {
    pub fn leaf() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, shape: FieldShape) -> Self {
        self.fields.insert(name.into(), shape);
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.fields.is_empty()
    }

    /// Shape of `element`; array items are merged into a single `item` entry.
    pub fn from_element(element: &Element) -> Self {
        let mut shape = Self::leaf();
        for child in &element.children {
            let child_shape = Self::from_element(child);
            shape
                .fields
                .entry(child.tag.clone())
                .or_default()
                .merge(child_shape);
        }
        shape
    }

    fn merge(&mut self, other: FieldShape) {
        for (name, shape) in other.fields {
            self.fields.entry(name).or_default().merge(shape);
        }
    }

    /// Builds a record of this shape with every leaf set to `placeholder`.
    pub fn placeholder_record(
        &self,
        resource_type: &str,
        id: &str,
        placeholder: &str,
    ) -> Record {
        let mut record = Record::new(resource_type, id);
        let root = record.root_mut();
        for (name, shape) in &self.fields {
            if RESERVED_FIELDS.contains(&name.as_str()) {
                continue;
            }
            if let Some(element) = shape.placeholder_element(name, placeholder) {
                root.children.push(element);
            }
        }
        record
    }

    fn placeholder_element(&self, name: &str, placeholder: &str) -> Option<Element> {
        if self.is_leaf() {
            return Some(Element::leaf(name, placeholder));
        }
        let children: Vec<Element> = self
            .fields
            .iter()
            .filter(|(field, _)| !RESERVED_FIELDS.contains(&field.as_str()))
            .filter_map(|(field, shape)| shape.placeholder_element(field, placeholder))
            .collect();
        (!children.is_empty()).then(|| Element {
            children,
            ..Element::new(name)
        })
    }
}

/// Derives one shape per resource type from the first record of each type.
pub fn derive_node_shapes<'a>(
    records: impl IntoIterator<Item = &'a Record>,
) -> BTreeMap<ResourceType, FieldShape> {
    let mut shapes = BTreeMap::new();
    for record in records {
        if record.root().tag != ROOT_TAG {
            continue;
        }
        shapes
            .entry(record.resource_type().to_string())
            .or_insert_with(|| FieldShape::from_element(record.root()));
    }
    shapes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ITEM_TAG;
    use serde_json::json;

    #[test]
    fn test_placeholder_record_skips_reserved_fields() {
        let record = Record::from_json(&json!({
            "resourceType": "Encounter",
            "id": "e1",
            "status": "finished",
            "subject": { "reference": "Patient/p1" },
            "type": [ { "text": "checkup" }, { "text": "follow-up", "code": "x" } ]
        }))
        .unwrap();
        let shapes = derive_node_shapes([&record]);
        let shape = &shapes["Encounter"];
        assert!(shape.fields["type"].fields.contains_key(ITEM_TAG));
        assert_eq!(shape.fields["type"].fields["item"].fields.len(), 2);

        let dummy = shape.placeholder_record("Encounter", "d1", "unspecified");
        assert_eq!(dummy.id(), Some("d1"));
        assert_eq!(dummy.root().child_text("status"), Some("unspecified"));
        // subject only held a reference
        assert!(dummy.root().child("subject").is_none());
        assert!(dummy.references().is_empty());
    }
}
