//! Brings record payloads back in line with the graph after calibration.
//!
//! Each node's payload ends up holding exactly one reference per governed
//! edge: references whose edge was removed are dropped together with their
//! `display` sibling, and edges without a reference get one inserted.

use crate::graph::{display_node_id, record_node_id, ReferenceGraph};
use crate::schema::SchemaGraph;
use clinshield_core::{Element, NodeId, Record, ResourceType, Route, DISPLAY_TAG, REFERENCE_TAG};
use serde::Serialize;
use std::collections::BTreeSet;
use std::ops::AddAssign;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairSummary {
    pub references_removed: usize,
    pub references_added: usize,
    pub elements_pruned: usize,
}

impl RepairSummary {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

impl AddAssign for RepairSummary {
    fn add_assign(&mut self, other: Self) {
        self.references_removed += other.references_removed;
        self.references_added += other.references_added;
        self.elements_pruned += other.elements_pruned;
    }
}

/// What a reference points at, as far as the graph can tell.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Link {
    Record(ResourceType, String),
    Display(ResourceType, String),
}

impl Link {
    fn resource_type(&self) -> &str {
        match self {
            Link::Record(t, _) | Link::Display(t, _) => t,
        }
    }

    fn reference_text(&self) -> String {
        match self {
            Link::Record(t, id) => record_node_id(t, id),
            Link::Display(t, name) => display_node_id(t, name),
        }
    }

    fn element(&self, tag: &str) -> Element {
        let container =
            Element::new(tag).with_child(Element::leaf(REFERENCE_TAG, self.reference_text()));
        match self {
            Link::Record(..) => container,
            Link::Display(_, name) => container.with_child(Element::leaf(DISPLAY_TAG, name.clone())),
        }
    }
}

/// Repairs the payload of every node in `graph`.
pub fn repair(graph: &mut ReferenceGraph, schema: &SchemaGraph, display_types: &[String]) -> RepairSummary {
    let with_payload: Vec<NodeId> = graph
        .nodes()
        .filter(|(_, data)| data.payload.is_some())
        .map(|(id, _)| id.clone())
        .collect();

    let mut summary = RepairSummary::default();
    for id in with_payload {
        let expected = expected_links(graph, &id, schema, display_types);
        let Some(record) = graph.node_mut(&id).and_then(|data| data.payload.as_mut()) else {
            continue;
        };
        let node_summary = repair_record(record, &expected, schema, display_types);
        if !node_summary.is_clean() {
            debug!(node = %id, ?node_summary, "Repaired payload");
        }
        summary += node_summary;
    }
    info!(
        removed = summary.references_removed,
        added = summary.references_added,
        pruned = summary.elements_pruned,
        "Consistency repair finished"
    );
    summary
}

/// Links implied by the edges of `id` that its own type is expected to hold.
fn expected_links(
    graph: &ReferenceGraph,
    id: &str,
    schema: &SchemaGraph,
    display_types: &[String],
) -> BTreeSet<Link> {
    let Some(own_type) = graph.resource_type(id) else {
        return BTreeSet::new();
    };
    graph
        .neighbors(id)
        .filter_map(|neighbor| graph.node(neighbor))
        .filter(|data| schema.governs(own_type, &data.resource_type))
        .filter_map(|data| {
            let is_display_type = display_types.contains(&data.resource_type);
            match (is_display_type, data.display) {
                (true, true) => Some(Link::Display(data.resource_type.clone(), data.key.clone())),
                (false, false) => Some(Link::Record(data.resource_type.clone(), data.key.clone())),
                _ => None,
            }
        })
        .collect()
}

/// The link a serialized reference stands for, if the graph could hold it.
fn link_of(
    record: &Record,
    route: &[usize],
    resource_type: &str,
    id: Option<&str>,
    display_types: &[String],
) -> Option<Link> {
    if display_types.iter().any(|t| t == resource_type) {
        let name = record.sibling_display(route)?;
        Some(Link::Display(resource_type.to_string(), name.to_string()))
    } else {
        Some(Link::Record(resource_type.to_string(), id?.to_string()))
    }
}

fn repair_record(
    record: &mut Record,
    expected: &BTreeSet<Link>,
    schema: &SchemaGraph,
    display_types: &[String],
) -> RepairSummary {
    let own_type = record.resource_type().to_string();
    let mut summary = RepairSummary::default();
    let mut present = BTreeSet::new();
    let mut doomed: BTreeSet<Route> = BTreeSet::new();

    for (route, reference) in record.references() {
        if !schema.governs(&own_type, &reference.resource_type) {
            continue;
        }
        let Some(link) = link_of(
            record,
            &route,
            &reference.resource_type,
            reference.id(),
            display_types,
        ) else {
            continue;
        };
        if expected.contains(&link) {
            present.insert(link);
            continue;
        }
        summary.references_removed += 1;
        if let Some((_, parent)) = route.split_last() {
            let display = record.root().get(parent).and_then(|p| {
                p.children.iter().position(|c| c.tag == DISPLAY_TAG)
            });
            if let Some(index) = display {
                let mut display_route = parent.to_vec();
                display_route.push(index);
                doomed.insert(display_route);
            }
        }
        doomed.insert(route);
    }

    summary.elements_pruned = remove_and_prune(record.root_mut(), &doomed);

    for link in expected.difference(&present) {
        insert_link(record, link);
        summary.references_added += 1;
    }
    summary
}

/// Removes `routes` back to front so earlier routes stay valid, then drops
/// every ancestor left empty. Returns the number of pruned ancestors.
fn remove_and_prune(root: &mut Element, routes: &BTreeSet<Route>) -> usize {
    let mut pruned: Vec<Route> = Vec::new();
    for route in routes.iter().rev() {
        if pruned.iter().any(|p| route.starts_with(p)) {
            continue;
        }
        root.remove(route);
        let mut parent = route[..route.len().saturating_sub(1)].to_vec();
        while !parent.is_empty() && root.get(&parent).is_some_and(Element::is_empty_leaf) {
            root.remove(&parent);
            pruned.push(parent.clone());
            parent.pop();
        }
    }
    pruned.len()
}

/// Inserts `link` next to the first reference container of the same type,
/// or in a new container at the root when there is none.
fn insert_link(record: &mut Record, link: &Link) {
    let sibling = record
        .references()
        .into_iter()
        .find(|(_, reference)| reference.resource_type == link.resource_type())
        .and_then(|(route, _)| {
            let (_, container) = route.split_last()?;
            let (&index, parent) = container.split_last()?;
            let tag = record.root().get(container)?.tag.clone();
            Some((parent.to_vec(), index + 1, tag))
        });

    let root = record.root_mut();
    match sibling {
        Some((parent, index, tag)) => {
            root.insert(&parent, index, link.element(&tag));
        }
        None => {
            let tag = link.resource_type().to_lowercase();
            let end = root.children.len();
            root.insert(&[], end, link.element(&tag));
        }
    }
}
