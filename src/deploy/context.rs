//! Mutable accounting surface passed to deploy plugins (spec §4.7
//! "DeployContext").
//!
//! Grounded on the teacher's `builder::orchestrator::BuildContext` for the
//! "single struct threading the mutable accumulator plus read-only handles
//! through a chain of steps" shape. Build and deploy execution never run
//! concurrently in this engine (spec §4.9 step 6 completes before step 8
//! begins), so `targets` is owned outright rather than shared behind a
//! lock — the Builder hands its accumulated output targets over by value
//! via [`crate::builder::Builder::take_output_targets`]. `graph` remains
//! behind a `std::sync::Mutex` because the same graph handle is threaded
//! through both the Builder and the DeployContext and mutated by plain
//! synchronous calls on either side.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::cancel::CancellationToken;
use crate::error::{KilnError, Result};
use crate::graph::DependencyGraph;
use crate::plugin::registry::PluginRegistry;
use crate::plugin::DeployPlugin;
use crate::target::Target;
use crate::tree::Tree;

pub struct DeployContext {
    deploy_path: PathBuf,
    targets: Vec<Target>,
    graph: Arc<Mutex<DependencyGraph>>,
    prev_graph: Arc<DependencyGraph>,
    tree: Arc<AsyncMutex<dyn Tree>>,
    registry: Arc<PluginRegistry>,
    cancel: CancellationToken,
}

impl DeployContext {
    pub fn new(
        deploy_path: PathBuf,
        targets: Vec<Target>,
        graph: Arc<Mutex<DependencyGraph>>,
        prev_graph: Arc<DependencyGraph>,
        tree: Arc<AsyncMutex<dyn Tree>>,
        registry: Arc<PluginRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self { deploy_path, targets, graph, prev_graph, tree, registry, cancel }
    }

    pub fn deploy_path(&self) -> &Path {
        &self.deploy_path
    }

    pub fn make_deploy_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.deploy_path.join(rel)
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn targets_mut(&mut self) -> &mut [Target] {
        &mut self.targets
    }

    pub fn prev_graph(&self) -> &DependencyGraph {
        &self.prev_graph
    }

    pub fn tree(&self) -> Arc<AsyncMutex<dyn Tree>> {
        self.tree.clone()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// `map` lookup by `(sourcePath, targetName)` (spec §4.7 `map`).
    pub fn lookup_target(&self, source_target_path: &Path) -> Option<&Target> {
        self.targets.iter().find(|t| t.source_target_path() == source_target_path)
    }

    pub fn lookup_target_mut(&mut self, source_target_path: &Path) -> Option<&mut Target> {
        self.targets.iter_mut().find(|t| t.source_target_path() == source_target_path)
    }

    /// Drops the named targets from `targets` and returns them (spec §4.7
    /// `removeTargets`).
    pub fn remove_targets(&mut self, source_target_paths: &[PathBuf]) -> Vec<Target> {
        let mut removed = Vec::new();
        let mut kept = Vec::new();
        for target in self.targets.drain(..) {
            if source_target_paths.iter().any(|p| *p == target.source_target_path()) {
                removed.push(target);
            } else {
                kept.push(target);
            }
        }
        self.targets = kept;
        removed
    }

    /// Allocates a new empty Target at `new_path`, records a graph edge from
    /// each parent's source path to it, and (if `is_output_target`) appends
    /// it to `targets` with its deploy path already set (spec §4.7
    /// `createTarget`).
    pub fn create_target(&mut self, new_path: PathBuf, parents: &[&Target], is_output_target: bool) -> Result<()> {
        let name = new_path
            .file_name()
            .ok_or_else(|| KilnError::PathInvalid(new_path.clone()))?
            .to_string_lossy()
            .into_owned();
        let dir = new_path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        let mut target = Target::from_bytes(dir, name, Vec::new())?;

        {
            let mut graph = self.graph.lock().expect("graph mutex poisoned");
            for parent in parents {
                graph.add_connection(parent.source_target_path(), target.source_target_path());
            }
        }

        target.set_deploy_path(&self.deploy_path);
        if is_output_target {
            self.targets.push(target);
        }
        Ok(())
    }

    /// Removes `remove` then, if `new_path` is given, creates a fresh target
    /// there whose parents are exactly the removed set (spec §4.7
    /// `resolveTargets`).
    pub fn resolve_targets(&mut self, new_path: Option<PathBuf>, remove: &[PathBuf]) -> Result<Vec<Target>> {
        let removed = self.remove_targets(remove);
        if let Some(new_path) = new_path {
            let parents: Vec<&Target> = removed.iter().collect();
            self.create_target(new_path, &parents, true)?;
        }
        Ok(removed)
    }

    /// Assigns `deployPath` to every target lacking one, or to all of them
    /// when `force` (spec §4.7 `setTargetsDeployPath`).
    pub fn set_targets_deploy_path(&mut self, force: bool) {
        let base = self.deploy_path.clone();
        for target in &mut self.targets {
            if force || !target.has_deploy_path() {
                target.set_deploy_path(&base);
            }
        }
    }

    /// Invokes a live deploy plugin object against this context (spec §4.7
    /// `chain` — the live-object branch; the descriptor-resolving branch is
    /// handled by [`crate::deploy::config::DeployConfig::execute`] itself,
    /// which already holds the registry needed to resolve a descriptor).
    pub async fn chain(&mut self, plugin: Arc<dyn DeployPlugin>, settings: &Value) -> Result<()> {
        plugin.exec(self, settings).await
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }
}
