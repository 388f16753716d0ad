//! `RepoTree` — a snapshot of a VCS commit as a [`Tree`] (spec §4.3).
//!
//! The teacher crate depends on `git2` (vendored) but never calls it; this
//! is its one real job here: resolve a "deploy commit", diff it against the
//! "previous deploy commit" to answer `isBlobModified`/`walkExtraneous`, and
//! read blobs out of the commit's tree.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use git2::{Oid, Repository};
use serde_json::Value;

use crate::error::{KilnError, Result};
use crate::project_config::{self, ProjectConfig};
use crate::storage::{self, JsonFileStorageBackend, StorageBackend};
use crate::target::DelayedTarget;

use super::{Tree, WalkOptions};

/// The git-config namespace repo-scoped settings live under (spec §4.3:
/// "reads and writes repo-scoped config keys under a `webdeploy.*`
/// namespace" — renamed to this crate's own prefix).
const CONFIG_NAMESPACE: &str = "kiln";

pub struct RepoTree {
    repo: Repository,
    repo_path: PathBuf,
    deploy_commit: Oid,
    previous_commit: Option<Oid>,
    storage: Box<dyn StorageBackend>,
    project_config: Option<ProjectConfig>,
    deploy_context: Option<String>,
}

impl RepoTree {
    /// Selects the deploy commit via, in order: an explicit `branch`, an
    /// explicit `tag` (mutually exclusive with `branch`), or a persisted
    /// branch name read from `kiln.branch` in the repo's own git config
    /// (spec §4.3).
    pub fn open(repo_path: &Path, branch: Option<&str>, tag: Option<&str>) -> Result<Self> {
        if branch.is_some() && tag.is_some() {
            return Err(KilnError::ConfigMalformed(
                "branch and tag options are mutually exclusive".to_string(),
            ));
        }

        let repo = Repository::open(repo_path)?;
        let config = repo.config()?;
        let persisted_branch = config.get_string(&format!("{CONFIG_NAMESPACE}.branch")).ok();

        let deploy_commit = if let Some(tag) = tag {
            resolve_commit(&repo, &format!("refs/tags/{tag}"))?
        } else {
            let branch_name = branch
                .map(String::from)
                .or(persisted_branch)
                .unwrap_or_else(|| "main".to_string());
            resolve_commit(&repo, &format!("refs/heads/{branch_name}"))?
        };

        let previous_commit = config
            .get_string(&format!("{CONFIG_NAMESPACE}.lastRevision"))
            .ok()
            .and_then(|s| Oid::from_str(&s).ok());

        let storage_path = storage::default_storage_path(repo_path);
        Ok(Self {
            repo,
            repo_path: repo_path.to_path_buf(),
            deploy_commit,
            previous_commit,
            storage: Box::new(JsonFileStorageBackend::open(storage_path)),
            project_config: None,
            deploy_context: None,
        })
    }

    pub fn load_project_config(&mut self) -> Result<&ProjectConfig> {
        if self.project_config.is_none() {
            self.project_config = Some(project_config::load_from_tree(&*self)?);
        }
        Ok(self.project_config.as_ref().unwrap())
    }

    pub fn set_deploy_context(&mut self, deploy_path: impl Into<String>) {
        self.deploy_context = Some(deploy_path.into());
    }

    fn blob_oid_at(&self, commit: Oid, path: &Path) -> Result<Option<Oid>> {
        let commit = self.repo.find_commit(commit)?;
        let tree = commit.tree()?;
        match tree.get_path(path) {
            Ok(entry) => Ok(Some(entry.id())),
            Err(_) => Ok(None),
        }
    }

    fn list_blobs(&self, commit: Oid) -> Result<Vec<PathBuf>> {
        let commit = self.repo.find_commit(commit)?;
        let tree = commit.tree()?;
        let mut paths = Vec::new();
        tree.walk(git2::TreeWalkMode::PreOrder, |dir, entry| {
            if entry.kind() == Some(git2::ObjectType::Blob) {
                let name = entry.name().unwrap_or_default();
                paths.push(PathBuf::from(dir).join(name));
            }
            git2::TreeWalkResult::Ok
        })?;
        Ok(paths)
    }

    /// Records `commit` as the now-current deploy commit in the repo's own
    /// git config, used on the *next* run to select `previous_commit`
    /// (spec §4.3).
    fn persist_last_revision(&mut self, commit: Oid) -> Result<()> {
        let mut config = self.repo.config()?;
        config.set_str(&format!("{CONFIG_NAMESPACE}.lastRevision"), &commit.to_string())?;
        self.previous_commit = Some(commit);
        Ok(())
    }
}

fn resolve_commit(repo: &Repository, refname: &str) -> Result<Oid> {
    let reference = repo.find_reference(refname)?;
    let commit = reference.peel_to_commit()?;
    Ok(commit.id())
}

impl Tree for RepoTree {
    fn get_path(&self) -> Option<String> {
        Some(format!("{}@{}", self.repo_path.display(), self.deploy_commit))
    }

    fn get_blob(&self, blob_path: &Path) -> Result<Box<dyn std::io::Read + Send>> {
        let oid = self
            .blob_oid_at(self.deploy_commit, blob_path)?
            .ok_or_else(|| KilnError::TreeIoError(format!("no such blob: {}", blob_path.display())))?;
        let blob = self.repo.find_blob(oid)?;
        Ok(Box::new(std::io::Cursor::new(blob.content().to_vec())))
    }

    fn walk(&self, options: &WalkOptions, callback: &mut dyn FnMut(DelayedTarget)) -> Result<()> {
        let base = options.base_path.clone().unwrap_or_default();
        for path in self.list_blobs(self.deploy_commit)? {
            if !path.starts_with(&base) {
                continue;
            }
            if let Some(filter) = options.filter {
                if let Some(parent) = path.parent() {
                    if !filter(parent) {
                        continue;
                    }
                }
            }
            let dir = path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            let repo_path = self.repo_path.clone();
            let commit = self.deploy_commit;
            let blob_path = path.clone();
            callback(DelayedTarget::new(dir, name, move || {
                let repo = Repository::open(&repo_path)?;
                let commit = repo.find_commit(commit)?;
                let tree = commit.tree()?;
                let entry = tree
                    .get_path(&blob_path)
                    .map_err(|e| KilnError::TreeIoError(e.to_string()))?;
                let blob = repo.find_blob(entry.id())?;
                Ok(Box::new(std::io::Cursor::new(blob.content().to_vec())) as Box<dyn std::io::Read + Send>)
            }));
        }
        Ok(())
    }

    /// Files removed between `previous_commit` and `deploy_commit` are
    /// reported first, then directories that are now fully empty-or-missing
    /// as a result — the order the built-in `write` deploy plugin's `rmdir`
    /// call depends on (spec §9 Open Question).
    fn walk_extraneous(&self, callback: &mut dyn FnMut(PathBuf, bool)) -> Result<()> {
        let Some(previous) = self.previous_commit else {
            return Ok(());
        };
        let previous_blobs: HashSet<PathBuf> = self.list_blobs(previous)?.into_iter().collect();
        let current_blobs: HashSet<PathBuf> = self.list_blobs(self.deploy_commit)?.into_iter().collect();

        let mut removed_files: Vec<PathBuf> = previous_blobs.difference(&current_blobs).cloned().collect();
        removed_files.sort();
        for file in &removed_files {
            callback(file.clone(), false);
        }

        // A directory is reported as removed once none of its descendants
        // remain in the current tree.
        let mut removed_dirs: Vec<PathBuf> = removed_files
            .iter()
            .filter_map(|p| p.parent().map(PathBuf::from))
            .filter(|d| !d.as_os_str().is_empty())
            .collect();
        removed_dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
        removed_dirs.dedup();
        for dir in removed_dirs {
            let still_present = current_blobs.iter().any(|p| p.starts_with(&dir));
            if !still_present {
                callback(dir, true);
            }
        }
        Ok(())
    }

    fn is_blob_modified(&self, path: &Path, _mtime: Option<i64>) -> Result<bool> {
        let current = self.blob_oid_at(self.deploy_commit, path)?;
        let Some(current) = current else {
            // Missing from the current snapshot: not "modified", it's removed.
            return Ok(false);
        };
        let Some(previous) = self.previous_commit else {
            return Ok(true);
        };
        let previous_oid = self.blob_oid_at(previous, path)?;
        Ok(previous_oid != Some(current))
    }

    fn get_mtime(&self, _path: &Path) -> Result<i64> {
        Ok(0)
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
        Ok(())
    }

    fn record_deploy(&mut self) -> Result<()> {
        let commit = self.deploy_commit;
        self.persist_last_revision(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_repo_with_commit(dir: &Path, file: &str, content: &[u8]) -> Oid {
        let repo = Repository::init(dir).unwrap();
        std::fs::write(dir.join(file), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(file)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("tester", "tester@example.com").unwrap();
        let parents: Vec<git2::Commit> = match repo.head().ok().and_then(|h| h.peel_to_commit().ok()) {
            Some(c) => vec![c],
            None => vec![],
        };
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, "commit", &tree, &parent_refs).unwrap()
    }

    #[test]
    fn resolves_deploy_commit_from_branch() {
        let tmp = TempDir::new().unwrap();
        let oid = init_repo_with_commit(tmp.path(), "a.js", b"X");
        // git2 defaults the initial branch name to "master" unless configured.
        let repo = Repository::open(tmp.path()).unwrap();
        let branch_name = repo.head().unwrap().shorthand().unwrap().to_string();

        let tree = RepoTree::open(tmp.path(), Some(&branch_name), None).unwrap();
        assert_eq!(tree.deploy_commit, oid);
    }

    #[test]
    fn branch_and_tag_are_mutually_exclusive() {
        let tmp = TempDir::new().unwrap();
        init_repo_with_commit(tmp.path(), "a.js", b"X");
        let err = RepoTree::open(tmp.path(), Some("main"), Some("v1")).unwrap_err();
        assert!(matches!(err, KilnError::ConfigMalformed(_)));
    }

    #[test]
    fn get_blob_reads_commit_content() {
        let tmp = TempDir::new().unwrap();
        init_repo_with_commit(tmp.path(), "a.js", b"hello");
        let repo = Repository::open(tmp.path()).unwrap();
        let branch_name = repo.head().unwrap().shorthand().unwrap().to_string();
        let tree = RepoTree::open(tmp.path(), Some(&branch_name), None).unwrap();

        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut tree.get_blob(Path::new("a.js")).unwrap(), &mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }
}
