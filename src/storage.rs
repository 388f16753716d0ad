//! Persisted state layout (spec §6 "Persisted state layout"): per-tree
//! records, per-(tree, deploy-path) deploy records, and an opaque
//! per-deploy key–value map (at minimum holding the dependency-graph blob).
//!
//! The real store is an external collaborator per spec §1 — out of scope
//! for this crate. [`StorageBackend`] is the interface boundary; the
//! default [`JsonFileStorageBackend`] is the fallback spec §4.3 describes
//! for `PathTree`: "a JSON file at the tree root when no external store is
//! configured."

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeRecord {
    pub last_deploy_path: Option<PathBuf>,
}

/// `{deployPath, deployBranch, lastRevision}` (spec §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployRecord {
    pub deploy_path: PathBuf,
    pub deploy_branch: Option<String>,
    pub last_revision: Option<String>,
}

pub trait StorageBackend: Send + Sync {
    fn get_tree_record(&self, tree_path: &str) -> Result<Option<TreeRecord>>;
    fn write_tree_record(&mut self, tree_path: &str, record: TreeRecord) -> Result<()>;

    fn get_deploy_record(&self, tree_path: &str, deploy_path: &str) -> Result<Option<DeployRecord>>;
    fn write_deploy_record(&mut self, tree_path: &str, deploy_path: &str, record: DeployRecord) -> Result<()>;

    /// `deploy_path = None` reads/writes a tree-scoped (not deploy-specific)
    /// blob; `Some(..)` scopes it to one deploy target. Spec §4.3 treats
    /// `deploySpecific` as advisory for the underlying store.
    fn get_value(&self, tree_path: &str, deploy_path: Option<&str>, key: &str) -> Result<Option<Vec<u8>>>;
    fn write_value(&mut self, tree_path: &str, deploy_path: Option<&str>, key: &str, value: Vec<u8>) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JsonFileDocument {
    tree_records: HashMap<String, TreeRecord>,
    deploy_records: HashMap<String, DeployRecord>,
    values: HashMap<String, HashMap<String, Vec<u8>>>,
}

/// A single JSON file at the tree root holding all storage state. Read/write
/// of the *dependency-graph* write path is fatal on failure per spec §7
/// (`StorageError`); reads are logged and treated as empty.
pub struct JsonFileStorageBackend {
    path: PathBuf,
    doc: JsonFileDocument,
}

impl JsonFileStorageBackend {
    /// A read failure (missing file or malformed JSON) is logged and treated
    /// as an empty store rather than propagated (spec §7: "StorageError ...
    /// Log and continue for reads").
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let doc = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "storage file unreadable, starting from empty state");
                JsonFileDocument::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => JsonFileDocument::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "storage file unreadable, starting from empty state");
                JsonFileDocument::default()
            }
        };
        Self { path, doc }
    }

    fn flush(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.doc)?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }

    fn scope_key(deploy_path: Option<&str>, key: &str) -> String {
        match deploy_path {
            Some(d) => format!("{d}::{key}"),
            None => format!("::{key}"),
        }
    }
}

impl StorageBackend for JsonFileStorageBackend {
    fn get_tree_record(&self, tree_path: &str) -> Result<Option<TreeRecord>> {
        Ok(self.doc.tree_records.get(tree_path).cloned())
    }

    fn write_tree_record(&mut self, tree_path: &str, record: TreeRecord) -> Result<()> {
        self.doc.tree_records.insert(tree_path.to_string(), record);
        self.flush()
    }

    fn get_deploy_record(&self, tree_path: &str, deploy_path: &str) -> Result<Option<DeployRecord>> {
        let key = format!("{tree_path}::{deploy_path}");
        Ok(self.doc.deploy_records.get(&key).cloned())
    }

    fn write_deploy_record(&mut self, tree_path: &str, deploy_path: &str, record: DeployRecord) -> Result<()> {
        let key = format!("{tree_path}::{deploy_path}");
        self.doc.deploy_records.insert(key, record);
        self.flush()
    }

    fn get_value(&self, tree_path: &str, deploy_path: Option<&str>, key: &str) -> Result<Option<Vec<u8>>> {
        let scope = self.doc.values.get(tree_path);
        Ok(scope.and_then(|m| m.get(&Self::scope_key(deploy_path, key)).cloned()))
    }

    fn write_value(&mut self, tree_path: &str, deploy_path: Option<&str>, key: &str, value: Vec<u8>) -> Result<()> {
        self.doc
            .values
            .entry(tree_path.to_string())
            .or_default()
            .insert(Self::scope_key(deploy_path, key), value);
        self.flush()
    }
}

/// Default location for the JSON fallback store, relative to a tree root.
pub fn default_storage_path(tree_root: &Path) -> PathBuf {
    tree_root.join(".kiln-storage.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_values() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.json");
        let mut backend = JsonFileStorageBackend::open(&path);
        backend.write_value("tree1", None, "depends", b"{\"map\":{}}".to_vec()).unwrap();

        let reopened = JsonFileStorageBackend::open(&path);
        let value = reopened.get_value("tree1", None, "depends").unwrap().unwrap();
        assert_eq!(value, b"{\"map\":{}}");
    }

    #[test]
    fn deploy_specific_values_are_scoped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.json");
        let mut backend = JsonFileStorageBackend::open(&path);
        backend.write_value("tree1", Some("/out"), "k", b"a".to_vec()).unwrap();
        backend.write_value("tree1", None, "k", b"b".to_vec()).unwrap();

        assert_eq!(backend.get_value("tree1", Some("/out"), "k").unwrap().unwrap(), b"a");
        assert_eq!(backend.get_value("tree1", None, "k").unwrap().unwrap(), b"b");
    }
}
