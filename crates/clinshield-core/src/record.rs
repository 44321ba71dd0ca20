//! Record tree and the path language used to address protected fields.
//!
//! A [`Record`] is a tree of [`Element`]s. JSON resources map onto it as
//! follows: object members become child elements named after their key,
//! arrays become a wrapper element with one `item` child per entry and
//! scalars become element text.

use crate::{AnonError, Reference, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Tag used for array entries.
pub const ITEM_TAG: &str = "item";
/// Tag of the root element of every record.
pub const ROOT_TAG: &str = "record";
pub const REFERENCE_TAG: &str = "reference";
pub const DISPLAY_TAG: &str = "display";

/// Child-index path from a root element to one of its descendants.
pub type Route = Vec<usize>;

/// JSON type a leaf was read from. Text is always stored as a string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    #[default]
    Text,
    Number,
    Bool,
}

impl ScalarKind {
    fn is_text(&self) -> bool {
        *self == ScalarKind::Text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "ScalarKind::is_text")]
    pub kind: ScalarKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            text: None,
            kind: ScalarKind::Text,
            children: Vec::new(),
        }
    }

    pub fn leaf(tag: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            text: Some(text.into()),
            kind: ScalarKind::Text,
            children: Vec::new(),
        }
    }

    fn scalar(tag: &str, text: String, kind: ScalarKind) -> Self {
        Self {
            kind,
            ..Element::leaf(tag, text)
        }
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn child(&self, tag: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.tag == tag)
    }

    pub fn child_text(&self, tag: &str) -> Option<&str> {
        self.child(tag).and_then(Element::value)
    }

    /// Trimmed text, `None` when absent or blank.
    pub fn value(&self) -> Option<&str> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Replaces the text; the scalar kind read from JSON is kept.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = Some(text.into());
    }

    /// Leaf without any meaningful text.
    pub fn is_empty_leaf(&self) -> bool {
        self.children.is_empty() && self.value().is_none()
    }

    pub fn get(&self, route: &[usize]) -> Option<&Element> {
        let mut current = self;
        for &index in route {
            current = current.children.get(index)?;
        }
        Some(current)
    }

    pub fn get_mut(&mut self, route: &[usize]) -> Option<&mut Element> {
        let mut current = self;
        for &index in route {
            current = current.children.get_mut(index)?;
        }
        Some(current)
    }

    /// Detaches the element at `route`. The root itself cannot be removed.
    pub fn remove(&mut self, route: &[usize]) -> Option<Element> {
        let (&last, parent_route) = route.split_last()?;
        let parent = self.get_mut(parent_route)?;
        (last < parent.children.len()).then(|| parent.children.remove(last))
    }

    /// Inserts `child` under the element at `parent_route`, clamping `index`.
    pub fn insert(&mut self, parent_route: &[usize], index: usize, child: Element) -> bool {
        match self.get_mut(parent_route) {
            Some(parent) => {
                let index = index.min(parent.children.len());
                parent.children.insert(index, child);
                true
            }
            None => false,
        }
    }

    /// Routes of every element matched by `path`, in document order.
    pub fn select(&self, path: &FieldPath) -> Vec<Route> {
        let mut current: Vec<Route> = vec![Vec::new()];
        for step in &path.steps {
            let mut next = Vec::new();
            for route in &current {
                let Some(base) = self.get(route) else {
                    continue;
                };
                match step.axis {
                    Axis::Child => {
                        for (i, child) in base.children.iter().enumerate() {
                            if child.tag == step.tag {
                                let mut r = route.clone();
                                r.push(i);
                                next.push(r);
                            }
                        }
                    }
                    Axis::Descendant => base.collect_descendants(&step.tag, route, &mut next),
                }
            }
            // lexicographic order on routes is pre-order document order
            next.sort();
            next.dedup();
            current = next;
        }
        current
    }

    pub fn find(&self, path: &FieldPath) -> Option<&Element> {
        self.select(path).first().and_then(|r| self.get(r))
    }

    pub fn find_all(&self, path: &FieldPath) -> Vec<&Element> {
        self.select(path)
            .iter()
            .filter_map(|r| self.get(r))
            .collect()
    }

    fn collect_descendants(&self, tag: &str, route: &[usize], out: &mut Vec<Route>) {
        for (i, child) in self.children.iter().enumerate() {
            let mut r = route.to_vec();
            r.push(i);
            if child.tag == tag {
                out.push(r.clone());
            }
            child.collect_descendants(tag, &r, out);
        }
    }

    /// Routes of all descendants with the given tag, in document order.
    pub fn descendants_tagged(&self, tag: &str) -> Vec<Route> {
        let mut out = Vec::new();
        self.collect_descendants(tag, &[], &mut out);
        out
    }

    pub fn from_json(tag: &str, value: &Value) -> Element {
        match value {
            Value::Object(map) => Element {
                children: map
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| Element::from_json(k, v))
                    .collect(),
                ..Element::new(tag)
            },
            Value::Array(items) => Element {
                children: items
                    .iter()
                    .map(|v| Element::from_json(ITEM_TAG, v))
                    .collect(),
                ..Element::new(tag)
            },
            Value::String(s) => Element::leaf(tag, s.clone()),
            Value::Number(n) => Element::scalar(tag, n.to_string(), ScalarKind::Number),
            Value::Bool(b) => Element::scalar(tag, b.to_string(), ScalarKind::Bool),
            Value::Null => Element::new(tag),
        }
    }

    pub fn to_json(&self) -> Value {
        if self.children.is_empty() {
            return match self.text.as_deref() {
                Some(text) => scalar_value(text, self.kind),
                None => Value::Null,
            };
        }
        if self.children.iter().all(|c| c.tag == ITEM_TAG) {
            return Value::Array(self.children.iter().map(Element::to_json).collect());
        }
        let mut map = Map::new();
        for child in &self.children {
            let value = child.to_json();
            if repeated(&self.children, &child.tag) {
                if let Value::Array(values) = map
                    .entry(child.tag.clone())
                    .or_insert_with(|| Value::Array(Vec::new()))
                {
                    values.push(value);
                }
            } else {
                map.insert(child.tag.clone(), value);
            }
        }
        Value::Object(map)
    }
}

fn repeated(children: &[Element], tag: &str) -> bool {
    children.iter().filter(|c| c.tag == tag).count() > 1
}

/// Text converted back to its source JSON type. Text that no longer fits
/// that type, such as a placeholder in a numeric field, stays a string.
fn scalar_value(text: &str, kind: ScalarKind) -> Value {
    match kind {
        ScalarKind::Text => Value::String(text.to_string()),
        ScalarKind::Number => text
            .trim()
            .parse::<serde_json::Number>()
            .map(Value::Number)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        ScalarKind::Bool => match text.trim() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(text.to_string()),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Child,
    Descendant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub axis: Axis,
    pub tag: String,
}

/// Declarative path such as `.//extension/item/valueCoding/code`.
///
/// A step preceded by `//` matches at any depth below the current set,
/// any other step matches direct children only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    raw: String,
    steps: Vec<Step>,
}

impl PartialEq for FieldPath {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for FieldPath {}

impl FieldPath {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Last step's tag.
    pub fn leaf_tag(&self) -> Option<&str> {
        self.steps.last().map(|s| s.tag.as_str())
    }
}

impl FromStr for FieldPath {
    type Err = AnonError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim();
        let (mut axis, mut rest) = if let Some(r) = raw.strip_prefix(".//") {
            (Axis::Descendant, r)
        } else if let Some(r) = raw.strip_prefix("//") {
            (Axis::Descendant, r)
        } else if let Some(r) = raw.strip_prefix("./") {
            (Axis::Child, r)
        } else {
            (Axis::Child, raw)
        };

        let mut steps = Vec::new();
        loop {
            let (tag, remainder) = match rest.find('/') {
                Some(i) => (&rest[..i], Some(&rest[i..])),
                None => (rest, None),
            };
            if tag.is_empty() || tag == "." {
                return Err(AnonError::Parse(format!("invalid field path '{}'", raw)));
            }
            steps.push(Step {
                axis,
                tag: tag.to_string(),
            });
            match remainder {
                None => break,
                Some(r) => {
                    if let Some(r) = r.strip_prefix("//") {
                        axis = Axis::Descendant;
                        rest = r;
                    } else {
                        axis = Axis::Child;
                        rest = &r[1..];
                    }
                }
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            steps,
        })
    }
}

impl TryFrom<String> for FieldPath {
    type Error = AnonError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.raw
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One clinical document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    resource_type: String,
    root: Element,
}

impl Record {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        let resource_type = resource_type.into();
        let root = Element::new(ROOT_TAG)
            .with_child(Element::leaf("resourceType", resource_type.clone()))
            .with_child(Element::leaf("id", id));
        Self {
            resource_type,
            root,
        }
    }

    pub fn from_element(root: Element) -> Result<Self> {
        let resource_type = root
            .child_text("resourceType")
            .ok_or_else(|| AnonError::Parse("record without resourceType".to_string()))?
            .to_string();
        Ok(Self {
            resource_type,
            root,
        })
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        if !value.is_object() {
            return Err(AnonError::Parse("resource is not a JSON object".to_string()));
        }
        let record = Self::from_element(Element::from_json(ROOT_TAG, value))?;
        if record.id().is_none() {
            return Err(AnonError::Parse(format!(
                "{} resource without id",
                record.resource_type
            )));
        }
        Ok(record)
    }

    pub fn to_json(&self) -> Value {
        self.root.to_json()
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn id(&self) -> Option<&str> {
        self.root.child_text("id")
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        match self.root.children.iter_mut().find(|c| c.tag == "id") {
            Some(element) => element.set_text(id),
            None => self.root.children.push(Element::leaf("id", id)),
        }
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Element {
        &mut self.root
    }

    /// Every parseable outbound reference with its route.
    pub fn references(&self) -> Vec<(Route, Reference)> {
        self.root
            .descendants_tagged(REFERENCE_TAG)
            .into_iter()
            .filter_map(|route| {
                let reference = self.root.get(&route)?.value()?.parse().ok()?;
                Some((route, reference))
            })
            .collect()
    }

    /// Text of the `display` sibling of the element at `route`.
    pub fn sibling_display(&self, route: &[usize]) -> Option<&str> {
        let (_, parent) = route.split_last()?;
        self.root.get(parent)?.child_text(DISPLAY_TAG)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encounter() -> Record {
        Record::from_json(&json!({
            "resourceType": "Encounter",
            "id": "enc-1",
            "subject": { "reference": "Patient/p-1", "display": "Jane Doe" },
            "participant": [
                { "individual": { "reference": "Practitioner?identifier=npi|42", "display": "Dr. Who" } }
            ],
            "period": { "start": "2020-01-01T10:00:00+02:00" },
            "length": 3
        }))
        .unwrap()
    }

    #[test]
    fn test_path_parsing() {
        let path: FieldPath = ".//extension/item//code".parse().unwrap();
        let axes: Vec<Axis> = path.steps().iter().map(|s| s.axis).collect();
        assert_eq!(axes, vec![Axis::Descendant, Axis::Child, Axis::Descendant]);
        assert_eq!(path.leaf_tag(), Some("code"));
        assert!("".parse::<FieldPath>().is_err());
        assert!(".//a//".parse::<FieldPath>().is_err());
    }

    #[test]
    fn test_select_descendants_and_children() {
        let record = encounter();
        let refs: FieldPath = ".//reference".parse().unwrap();
        let texts: Vec<&str> = record
            .root()
            .find_all(&refs)
            .into_iter()
            .filter_map(Element::value)
            .collect();
        assert_eq!(texts, vec!["Practitioner?identifier=npi|42", "Patient/p-1"]);

        let start: FieldPath = "period/start".parse().unwrap();
        assert_eq!(
            record.root().find(&start).and_then(Element::value),
            Some("2020-01-01T10:00:00+02:00")
        );
        let missing: FieldPath = "start".parse().unwrap();
        assert!(record.root().find(&missing).is_none());
    }

    #[test]
    fn test_references_and_display() {
        let record = encounter();
        let refs = record.references();
        assert_eq!(refs.len(), 2);
        let (route, reference) = &refs[1];
        assert_eq!(reference.resource_type, "Patient");
        assert_eq!(record.sibling_display(route), Some("Jane Doe"));
    }

    #[test]
    fn test_json_round_trip_keeps_scalars_and_arrays() {
        let record = encounter();
        let back = record.to_json();
        assert_eq!(back["length"], json!(3));
        assert!(back["participant"].is_array());
        assert_eq!(back["subject"]["reference"], json!("Patient/p-1"));
        assert_eq!(Record::from_json(&back).unwrap(), record);
    }

    #[test]
    fn test_json_round_trip_keeps_string_scalars() {
        let source = json!({
            "resourceType": "Patient",
            "id": "1001",
            "active": true,
            "multipleBirthInteger": 2,
            "address": [{ "postalCode": "12345" }],
            "name": [{ "text": "true" }]
        });
        let record = Record::from_json(&source).unwrap();
        assert_eq!(record.to_json(), source);
    }

    #[test]
    fn test_rewritten_leaves_keep_their_type() {
        let mut record = Record::from_json(&json!({
            "resourceType": "Observation",
            "id": "o1",
            "valueQuantity": { "value": 4.5, "code": "7" },
            "effectiveDateTime": "2020-01-01"
        }))
        .unwrap();
        for (path, text) in [
            ("valueQuantity/value", "5.25"),
            ("valueQuantity/code", "8"),
            ("effectiveDateTime", "2020-03-04"),
        ] {
            let route = record.root().select(&path.parse().unwrap())[0].clone();
            record.root_mut().get_mut(&route).unwrap().set_text(text);
        }
        let back = record.to_json();
        assert_eq!(back["valueQuantity"]["value"], json!(5.25));
        assert_eq!(back["valueQuantity"]["code"], json!("8"));
        assert_eq!(back["effectiveDateTime"], json!("2020-03-04"));

        let route = record.root().select(&"valueQuantity/value".parse().unwrap())[0].clone();
        record.root_mut().get_mut(&route).unwrap().set_text("unspecified");
        assert_eq!(record.to_json()["valueQuantity"]["value"], json!("unspecified"));
    }

    #[test]
    fn test_remove_and_insert() {
        let mut record = encounter();
        let route = record.root().select(&"subject".parse().unwrap())[0].clone();
        let removed = record.root_mut().remove(&route).unwrap();
        assert_eq!(removed.tag, "subject");
        assert!(record.root_mut().insert(&[], 0, removed));
        assert_eq!(record.root().children[0].tag, "subject");
        assert!(record.root_mut().remove(&[]).is_none());
    }

    #[test]
    fn test_record_requires_id() {
        let err = Record::from_json(&json!({"resourceType": "Patient"}));
        assert!(err.is_err());
        let mut record = Record::new("Patient", "a");
        record.set_id("b");
        assert_eq!(record.id(), Some("b"));
    }
}
