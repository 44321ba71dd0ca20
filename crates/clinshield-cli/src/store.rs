//! Reading and writing directories of JSON resources.

use clinshield_core::{Record, RecordBatch, RecordSink, RecordSource, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Directory of `*.json` files, each holding a resource array, a single
/// resource or a `Bundle`.
pub struct JsonDirectoryStore {
    root: PathBuf,
}

impl JsonDirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn json_files(&self) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file() && path.extension().is_some_and(|ext| ext == "json")
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Parses one file into batches, one per resource type it contains.
    fn load_file(path: &Path) -> Result<Vec<RecordBatch>> {
        let content = fs::read_to_string(path)?;
        let document: Value = serde_json::from_str(&content)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut by_type: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for resource in resources(&document) {
            match Record::from_json(resource) {
                Ok(record) => by_type
                    .entry(record.resource_type().to_string())
                    .or_default()
                    .push(record),
                Err(e) => warn!(file = %file_name, error = %e, "Skipping resource"),
            }
        }

        let single = by_type.len() == 1;
        Ok(by_type
            .into_iter()
            .map(|(resource_type, records)| {
                let name = if single {
                    file_name.clone()
                } else {
                    format!("{}#{}", file_name, resource_type)
                };
                RecordBatch::new(name, resource_type, records)
            })
            .collect())
    }
}

/// Resources held by a document: array entries, bundle entries or the
/// document itself.
fn resources(document: &Value) -> Vec<&Value> {
    match document {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) if map.get("resourceType").and_then(Value::as_str) == Some("Bundle") => {
            map.get("entry")
                .and_then(Value::as_array)
                .map(|entries| entries.iter().filter_map(|e| e.get("resource")).collect())
                .unwrap_or_default()
        }
        other => vec![other],
    }
}

impl RecordSource for JsonDirectoryStore {
    fn load(&self) -> Result<Vec<RecordBatch>> {
        let mut batches = Vec::new();
        for path in self.json_files()? {
            match Self::load_file(&path) {
                Ok(loaded) => {
                    debug!(file = %path.display(), batches = loaded.len(), "Loaded file");
                    batches.extend(loaded);
                }
                Err(e) => warn!(file = %path.display(), error = %e, "Skipping unreadable file"),
            }
        }
        info!(
            dir = %self.root.display(),
            batches = batches.len(),
            records = batches.iter().map(RecordBatch::len).sum::<usize>(),
            "Loaded input records"
        );
        Ok(batches)
    }
}

impl RecordSink for JsonDirectoryStore {
    /// Writes one `<ResourceType>.json` array per resource type.
    fn store(&self, batches: &[RecordBatch]) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let mut by_type: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
        for batch in batches {
            by_type
                .entry(batch.resource_type.as_str())
                .or_default()
                .extend(batch.records.iter().map(Record::to_json));
        }
        for (resource_type, resources) in by_type {
            let path = self.root.join(format!("{}.json", resource_type));
            fs::write(&path, serde_json::to_string_pretty(&resources)?)?;
            debug!(file = %path.display(), records = resources.len(), "Wrote output file");
        }
        Ok(())
    }
}
