//! `PathTree` — a live filesystem directory as a [`Tree`] (spec §4.3).
//!
//! Grounded on the teacher's `package::fhs::validate`, which walks a
//! directory with `walkdir` and reasons about tree-relative paths the same
//! way this module's `walk`/`is_blob_modified` do.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde_json::Value;
use walkdir::WalkDir;

use crate::error::{KilnError, Result};
use crate::project_config::{self, ProjectConfig};
use crate::storage::{self, DeployRecord, JsonFileStorageBackend, StorageBackend};
use crate::target::DelayedTarget;

use super::{Tree, WalkOptions};

pub struct PathTree {
    root: PathBuf,
    mtime_cache: RefCell<HashMap<PathBuf, i64>>,
    storage: Box<dyn StorageBackend>,
    project_config: Option<ProjectConfig>,
    deploy_context: Option<String>,
}

impl PathTree {
    pub fn new(root: PathBuf) -> Self {
        let storage_path = storage::default_storage_path(&root);
        Self {
            root,
            mtime_cache: RefCell::new(HashMap::new()),
            storage: Box::new(JsonFileStorageBackend::open(storage_path)),
            project_config: None,
            deploy_context: None,
        }
    }

    pub fn with_storage(root: PathBuf, storage: Box<dyn StorageBackend>) -> Self {
        Self {
            root,
            mtime_cache: RefCell::new(HashMap::new()),
            storage,
            project_config: None,
            deploy_context: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Loads and caches the project config from the tree root (spec §4.4).
    pub fn load_project_config(&mut self) -> Result<&ProjectConfig> {
        if self.project_config.is_none() {
            self.project_config = Some(project_config::load_from_tree(&*self)?);
        }
        Ok(self.project_config.as_ref().unwrap())
    }

    pub fn project_config(&self) -> Option<&ProjectConfig> {
        self.project_config.as_ref()
    }

    /// Scopes `getDeployConfig`/`writeDeployConfig`/deploy-specific storage
    /// reads to a given deploy path, as the Kernel does once it knows which
    /// deploy is being run.
    pub fn set_deploy_context(&mut self, deploy_path: impl Into<String>) {
        self.deploy_context = Some(deploy_path.into());
    }

    fn absolute(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }

    fn fs_mtime(&self, rel: &Path) -> Result<i64> {
        if let Some(&cached) = self.mtime_cache.borrow().get(rel) {
            return Ok(cached);
        }
        let meta = std::fs::metadata(self.absolute(rel))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.mtime_cache.borrow_mut().insert(rel.to_path_buf(), mtime);
        Ok(mtime)
    }
}

impl Tree for PathTree {
    fn get_path(&self) -> Option<String> {
        Some(self.root.display().to_string())
    }

    fn get_blob(&self, blob_path: &Path) -> Result<Box<dyn std::io::Read + Send>> {
        let file = File::open(self.absolute(blob_path))
            .map_err(|e| KilnError::TreeIoError(format!("{}: {}", blob_path.display(), e)))?;
        Ok(Box::new(file))
    }

    fn walk(&self, options: &WalkOptions, callback: &mut dyn FnMut(DelayedTarget)) -> Result<()> {
        let start = match &options.base_path {
            Some(p) => self.absolute(p),
            None => self.root.clone(),
        };
        if !start.exists() {
            return Ok(());
        }

        let root = self.root.clone();
        let filter = options.filter;
        let walker = WalkDir::new(&start).into_iter().filter_entry(move |entry| {
            if !entry.file_type().is_dir() {
                return true;
            }
            match filter {
                Some(f) => {
                    let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                    f(rel)
                }
                None => true,
            }
        });

        for entry in walker {
            let entry = entry.map_err(|e| KilnError::TreeIoError(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&self.root).unwrap_or(entry.path()).to_path_buf();
            let dir = rel.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
            let name = rel.file_name().unwrap().to_string_lossy().to_string();
            let abs_path = entry.path().to_path_buf();
            callback(DelayedTarget::new(dir, name, move || {
                let file = File::open(&abs_path)
                    .map_err(|e| KilnError::TreeIoError(format!("{}: {}", abs_path.display(), e)))?;
                Ok(Box::new(file) as Box<dyn std::io::Read + Send>)
            }));
        }
        Ok(())
    }

    fn walk_extraneous(&self, _callback: &mut dyn FnMut(PathBuf, bool)) -> Result<()> {
        // PathTree has no "previous snapshot" distinct from the live
        // filesystem, so it always yields an empty walk (spec §4.3).
        Ok(())
    }

    fn is_blob_modified(&self, path: &Path, mtime: Option<i64>) -> Result<bool> {
        let mtime = match mtime {
            None => return Ok(true),
            Some(m) => m,
        };
        Ok(self.fs_mtime(path)? > mtime)
    }

    fn get_mtime(&self, path: &Path) -> Result<i64> {
        self.fs_mtime(path)
    }

    fn get_target_config(&self, param: &str) -> Option<Value> {
        let cfg = self.project_config.as_ref()?;
        match param {
            "basePath" => cfg.base_path.as_ref().map(|p| Value::String(p.display().to_string())),
            "includes" => serde_json::to_value(&cfg.includes).ok(),
            "build" => serde_json::to_value(&cfg.build).ok(),
            "deploy" => serde_json::to_value(&cfg.deploy).ok(),
            _ => None,
        }
    }

    fn get_deploy_config(&self, param: &str) -> Result<Option<Value>> {
        let tree_path = self.get_path().unwrap_or_default();
        let deploy_path = self.deploy_context.clone().unwrap_or_default();
        let record = self.storage.get_deploy_record(&tree_path, &deploy_path)?;
        Ok(record.and_then(|r| match param {
            "deployPath" => Some(Value::String(r.deploy_path.display().to_string())),
            "deployBranch" => r.deploy_branch.map(Value::String),
            "lastRevision" => r.last_revision.map(Value::String),
            _ => None,
        }))
    }

    fn write_deploy_config(&mut self, param: &str, value: Value) -> Result<()> {
        let tree_path = self.get_path().unwrap_or_default();
        let deploy_path = self.deploy_context.clone().unwrap_or_default();
        let mut record = self
            .storage
            .get_deploy_record(&tree_path, &deploy_path)?
            .unwrap_or_default();
        match param {
            "deployPath" => record.deploy_path = PathBuf::from(value.as_str().unwrap_or_default()),
            "deployBranch" => record.deploy_branch = value.as_str().map(String::from),
            "lastRevision" => record.last_revision = value.as_str().map(String::from),
            _ => {}
        }
        self.storage.write_deploy_record(&tree_path, &deploy_path, record)
    }

    fn get_storage_config(&self, key: &str, deploy_specific: bool) -> Result<Option<Vec<u8>>> {
        let tree_path = self.get_path().unwrap_or_default();
        let scope = if deploy_specific { self.deploy_context.as_deref() } else { None };
        self.storage.get_value(&tree_path, scope, key)
    }

    fn write_storage_config(&mut self, key: &str, deploy_specific: bool, value: Vec<u8>) -> Result<()> {
        let tree_path = self.get_path().unwrap_or_default();
        let scope = if deploy_specific { self.deploy_context.clone() } else { None };
        self.storage.write_value(&tree_path, scope.as_deref(), key, value)
    }

    fn finalize(&mut self) -> Result<()> {
        // The JSON-backed storage flushes on every write; nothing dirty to
        // flush at finalize time beyond what writes already persisted.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn walk_visits_all_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/a.js"), b"x").unwrap();
        std::fs::write(tmp.path().join("src/b.js"), b"y").unwrap();

        let tree = PathTree::new(tmp.path().to_path_buf());
        let mut seen = Vec::new();
        tree.walk(&WalkOptions::default(), &mut |d| seen.push(d.candidate_path())).unwrap();
        seen.sort();
        assert_eq!(seen, vec![PathBuf::from("src/a.js"), PathBuf::from("src/b.js")]);
    }

    #[test]
    fn walk_filter_prunes_directories() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join(".git/HEAD"), b"x").unwrap();
        std::fs::write(tmp.path().join("a.js"), b"y").unwrap();

        let tree = PathTree::new(tmp.path().to_path_buf());
        let filter = |p: &Path| !p.file_name().map(|n| n == ".git").unwrap_or(false);
        let opts = WalkOptions { base_path: None, filter: Some(&filter) };
        let mut seen = Vec::new();
        tree.walk(&opts, &mut |d| seen.push(d.candidate_path())).unwrap();
        assert_eq!(seen, vec![PathBuf::from("a.js")]);
    }

    #[test]
    fn no_mtime_means_modified() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.js"), b"x").unwrap();
        let tree = PathTree::new(tmp.path().to_path_buf());
        assert!(tree.is_blob_modified(Path::new("a.js"), None).unwrap());
    }

    #[test]
    fn deploy_config_round_trips() {
        let tmp = TempDir::new().unwrap();
        let mut tree = PathTree::new(tmp.path().to_path_buf());
        tree.set_deploy_context("/out");
        tree.write_deploy_config("lastRevision", Value::String("abc123".to_string())).unwrap();
        assert_eq!(
            tree.get_deploy_config("lastRevision").unwrap(),
            Some(Value::String("abc123".to_string()))
        );
    }
}
