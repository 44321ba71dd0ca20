//! Locating categorical values inside records.

use clinshield_core::{AttributeKind, Element, FieldPath, Record, Route};
use std::collections::BTreeMap;

/// One extracted value. Single-field kinds hold exactly one entry,
/// combination kinds one entry per path.
pub type PoolValue = Vec<String>;

/// Where one value (or value-tuple) lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub record: usize,
    pub routes: Vec<Route>,
}

/// The item's own `url` child, or the first `url` below it.
fn item_url(item: &Element) -> Option<&str> {
    item.child_text("url").or_else(|| {
        let route = item.descendants_tagged("url").into_iter().next()?;
        item.get(&route).and_then(Element::value)
    })
}

fn with_prefix(prefix: &[usize], route: &[usize]) -> Route {
    prefix.iter().chain(route).copied().collect()
}

fn nested_slots(
    record: &Record,
    index: usize,
    path: &FieldPath,
    url: &str,
    values: &[FieldPath],
) -> Vec<Slot> {
    let root = record.root();
    root.select(path)
        .into_iter()
        .filter_map(|item_route| {
            let item = root.get(&item_route)?;
            if item_url(item)? != url {
                return None;
            }
            let routes = values
                .iter()
                .map(|value_path| {
                    let inner = item.select(value_path).into_iter().next()?;
                    Some(with_prefix(&item_route, &inner))
                })
                .collect::<Option<Vec<_>>>()?;
            Some(Slot {
                record: index,
                routes,
            })
        })
        .collect()
}

/// Every slot of `kind` across `records`, in record then document order.
///
/// Combination paths are zipped per record: the n-th match of every path
/// forms the n-th tuple.
pub fn locate(records: &[Record], kind: &AttributeKind) -> Vec<Slot> {
    let mut slots = Vec::new();
    for (index, record) in records.iter().enumerate() {
        let root = record.root();
        match kind {
            AttributeKind::Simple { path } => {
                slots.extend(root.select(path).into_iter().map(|route| Slot {
                    record: index,
                    routes: vec![route],
                }));
            }
            AttributeKind::Combination { paths } => {
                let selections: Vec<Vec<Route>> = paths.iter().map(|p| root.select(p)).collect();
                let count = selections.iter().map(Vec::len).min().unwrap_or(0);
                for n in 0..count {
                    slots.push(Slot {
                        record: index,
                        routes: selections.iter().map(|s| s[n].clone()).collect(),
                    });
                }
            }
            AttributeKind::Nested { path, filter } => {
                slots.extend(nested_slots(
                    record,
                    index,
                    path,
                    &filter.url,
                    std::slice::from_ref(&filter.value_path),
                ));
            }
            AttributeKind::NestedCombination { path, filter } => {
                slots.extend(nested_slots(record, index, path, &filter.url, &filter.value_paths));
            }
        }
    }
    slots.retain(|slot| read(records, slot).is_some());
    slots
}

/// Value stored at `slot`, `None` if any field is missing or blank.
pub fn read(records: &[Record], slot: &Slot) -> Option<PoolValue> {
    let root = records.get(slot.record)?.root();
    slot.routes
        .iter()
        .map(|route| root.get(route).and_then(Element::value).map(str::to_string))
        .collect()
}

pub fn write(records: &mut [Record], slot: &Slot, value: &[String]) {
    let Some(record) = records.get_mut(slot.record) else {
        return;
    };
    for (route, text) in slot.routes.iter().zip(value) {
        if let Some(element) = record.root_mut().get_mut(route) {
            element.set_text(text.clone());
        }
    }
}

/// Occurrence counts of every value of `kind`.
pub fn extract_counts(records: &[Record], kind: &AttributeKind) -> BTreeMap<PoolValue, u64> {
    let mut counts = BTreeMap::new();
    for slot in locate(records, kind) {
        if let Some(value) = read(records, &slot) {
            *counts.entry(value).or_insert(0) += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinshield_core::{NestedCombinationFilter, NestedFilter};
    use serde_json::json;

    fn patient(id: &str, gender: &str, race: &str, ethnicity: &str) -> Record {
        Record::from_json(&json!({
            "resourceType": "Patient",
            "id": id,
            "gender": gender,
            "name": [{ "family": "Doe", "given": ["Jane"] }],
            "extension": [
                {
                    "url": "http://example.org/race",
                    "extension": [{ "url": "ombCategory", "valueCoding": { "code": race, "display": race } }]
                },
                {
                    "url": "http://example.org/ethnicity",
                    "valueString": ethnicity
                }
            ]
        }))
        .unwrap()
    }

    fn records() -> Vec<Record> {
        vec![
            patient("a", "male", "2106-3", "hispanic"),
            patient("b", "female", "2054-5", "other"),
            patient("c", "female", "2106-3", "hispanic"),
        ]
    }

    #[test]
    fn test_simple_counts() {
        let kind = AttributeKind::Simple {
            path: ".//gender".parse().unwrap(),
        };
        let counts = extract_counts(&records(), &kind);
        assert_eq!(counts[&vec!["female".to_string()]], 2);
        assert_eq!(counts[&vec!["male".to_string()]], 1);
    }

    #[test]
    fn test_combination_zips_per_record() {
        let kind = AttributeKind::Combination {
            paths: vec![".//family".parse().unwrap(), ".//given/item".parse().unwrap()],
        };
        let counts = extract_counts(&records(), &kind);
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[&vec!["Doe".to_string(), "Jane".to_string()]], 3);
    }

    #[test]
    fn test_nested_filter_uses_own_url() {
        let kind = AttributeKind::Nested {
            path: ".//extension/item".parse().unwrap(),
            filter: NestedFilter {
                url: "http://example.org/ethnicity".to_string(),
                value_path: "valueString".parse().unwrap(),
            },
        };
        let counts = extract_counts(&records(), &kind);
        assert_eq!(counts[&vec!["hispanic".to_string()]], 2);
        assert_eq!(counts[&vec!["other".to_string()]], 1);
    }

    #[test]
    fn test_nested_combination_and_write() {
        let kind = AttributeKind::NestedCombination {
            path: "extension/item".parse().unwrap(),
            filter: NestedCombinationFilter {
                url: "http://example.org/race".to_string(),
                value_paths: vec![".//code".parse().unwrap(), ".//display".parse().unwrap()],
            },
        };
        let mut records = records();
        let slots = locate(&records, &kind);
        assert_eq!(slots.len(), 3);

        let value = vec!["2028-9".to_string(), "Asian".to_string()];
        write(&mut records, &slots[1], &value);
        assert_eq!(read(&records, &slots[1]), Some(value.clone()));
        let counts = extract_counts(&records, &kind);
        assert_eq!(counts[&value], 1);
        assert_eq!(counts[&vec!["2106-3".to_string(), "2106-3".to_string()]], 2);
    }
}
