//! The pluggable Tree abstraction (spec §3, §4.3): the source of input
//! targets and target-tree configuration. Two variants ship: [`path_tree`]
//! (a live filesystem directory) and [`repo_tree`] (a VCS-repository
//! snapshot).
//!
//! Tree I/O is modeled as synchronous, blocking calls — matching the
//! teacher's universal use of `std::fs`/`walkdir` rather than an async
//! filesystem layer. The spec lists tree operations among the engine's
//! suspension points because a plugin's own I/O may suspend; in this
//! implementation the suspension the spec cares about (many plugin
//! invocations in flight at once) is served by the Builder's async
//! execution loop, not by the Tree trait itself. This is recorded as an
//! Open Question resolution in DESIGN.md.

pub mod path_tree;
pub mod repo_tree;

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::Result;
use crate::target::DelayedTarget;

/// Options controlling a tree walk (spec §4.3 `walk(callback, options)`).
#[derive(Default)]
pub struct WalkOptions<'a> {
    pub base_path: Option<PathBuf>,
    /// Prunes directories for which this returns `false`.
    pub filter: Option<&'a dyn Fn(&Path) -> bool>,
}

/// Shared contract of `PathTree` and `RepoTree` (spec §4.3).
pub trait Tree: Send + Sync {
    /// A stable identifier: the base directory for `PathTree`, any
    /// stable repository-unique identifier for `RepoTree`.
    fn get_path(&self) -> Option<String>;

    /// Opens a readable stream over a file interpreted relative to the
    /// tree's configured target-tree base.
    fn get_blob(&self, blob_path: &Path) -> Result<Box<dyn std::io::Read + Send>>;

    /// Enumerates all file entries reachable from `options.base_path` (or
    /// the root), invoking `callback` for each. Directories for which
    /// `options.filter` returns `false` are pruned.
    fn walk(&self, options: &WalkOptions, callback: &mut dyn FnMut(DelayedTarget)) -> Result<()>;

    /// Enumerates entries present in the previous deployment snapshot but
    /// absent from the current one: files via `callback(path, false)`,
    /// then empty-then-missing directories via `callback(path, true)` —
    /// directories are only reported once their contained blobs have
    /// already been reported removed, so a caller's `rmdir` on them is safe
    /// (spec §9 Open Question). `PathTree` always yields an empty walk.
    fn walk_extraneous(&self, callback: &mut dyn FnMut(PathBuf, bool)) -> Result<()>;

    /// `PathTree`: true iff the filesystem mtime exceeds `mtime` (true if
    /// `mtime` is `None`). `RepoTree`: true iff the blob's object-id in the
    /// previous deploy commit differs from the current one (true if there
    /// is no previous entry; false if the current entry is missing).
    fn is_blob_modified(&self, path: &Path, mtime: Option<i64>) -> Result<bool>;

    /// Filesystem mtime (`PathTree`) or `0` (`RepoTree` — snapshots have no
    /// meaningful mtime).
    fn get_mtime(&self, path: &Path) -> Result<i64>;

    fn get_target_config(&self, param: &str) -> Option<Value>;

    fn get_deploy_config(&self, param: &str) -> Result<Option<Value>>;

    fn write_deploy_config(&mut self, param: &str, value: Value) -> Result<()>;

    fn get_storage_config(&self, key: &str, deploy_specific: bool) -> Result<Option<Vec<u8>>>;

    fn write_storage_config(&mut self, key: &str, deploy_specific: bool, value: Vec<u8>) -> Result<()>;

    /// Persists any dirty records.
    fn finalize(&mut self) -> Result<()>;

    /// Records that a deploy against the tree's current snapshot just
    /// succeeded, so the *next* run's `is_blob_modified`/`walk_extraneous`
    /// have a previous snapshot to diff against (spec §4.3). `PathTree` has
    /// no notion of a "previous snapshot" beyond mtimes and does nothing
    /// here; `RepoTree` persists the current deploy commit as the next
    /// run's `previous_commit`.
    fn record_deploy(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Key under which the dependency-graph blob is stored (spec §9 Kernel step 2).
pub const DEPENDS_CONFIG_KEY: &str = "depends";
