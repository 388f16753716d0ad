//! The Kernel: top-level orchestrator composing config, auditor, Builder
//! and Deployer into a single run (spec §4.9).
//!
//! Grounded on the teacher's `builder::orchestrator::Orchestrator::run` for
//! the "load config, resolve dependencies, execute, persist" top-level
//! shape — the same sequencing, transplanted onto build/deploy plugins
//! instead of package installation steps.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::builder::{Builder, BuilderOptions, BuilderType, NewTargetCallback};
use crate::cancel::CancellationToken;
use crate::deploy::config::DeployConfig;
use crate::deploy::Deployer;
use crate::error::Result;
use crate::graph::{DependencyGraph, GraphStorageRepr};
use crate::plugin::auditor::Auditor;
use crate::plugin::registry::PluginRegistry;
use crate::project_config::{self, ProjectConfig};
use crate::tree::{Tree, WalkOptions, DEPENDS_CONFIG_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Build,
    Deploy,
}

impl From<RunKind> for BuilderType {
    fn from(kind: RunKind) -> Self {
        match kind {
            RunKind::Build => BuilderType::Build,
            RunKind::Deploy => BuilderType::Deploy,
        }
    }
}

pub struct KernelOptions {
    pub kind: RunKind,
    pub dev: bool,
    pub force: bool,
    pub deploy_path: PathBuf,
    pub plugin_dirs: Vec<PathBuf>,
    /// Fired after each plugin invocation during the build phase (spec §4.6
    /// `callbacks.newTarget`) — the CLI uses this to drive a progress bar.
    pub on_new_target: Option<NewTargetCallback>,
}

/// Summary of what a Kernel run did, for the CLI to report (spec §4.9 steps
/// 7–8: "up-to-date" / "no targets" / ran the deploy chain).
#[derive(Debug)]
pub enum RunOutcome {
    UpToDate,
    NoTargets,
    Deployed { output_target_count: usize },
}

/// Runs the full build-and-deploy pipeline once against `tree` (spec §4.9,
/// steps 1–9).
pub async fn run(tree: Arc<AsyncMutex<dyn Tree>>, options: KernelOptions) -> Result<RunOutcome> {
    let cancel = CancellationToken::new();

    let config = {
        let guard = tree.lock().await;
        project_config::load_from_tree(&*guard)?
    };

    let (graph, prev_graph) = load_graph(&tree).await?;
    let graph_was_loaded = graph.is_loaded();
    let graph = Arc::new(Mutex::new(graph));
    let prev_graph = Arc::new(prev_graph);
    if options.force {
        graph.lock().expect("graph mutex poisoned").reset();
    }

    let mut registry = PluginRegistry::new(options.plugin_dirs.clone());
    let mut auditor = Auditor::new();

    // `config` (just loaded above) is already the authoritative parsed
    // project config; reading `basePath` back out through
    // `Tree::get_target_config` would require the Kernel to first stash it
    // onto the tree object, which buys nothing here.
    let base_path = config.base_path.clone().unwrap_or_default();

    let mut builder = Builder::new(
        tree.clone(),
        BuilderOptions { kind: options.kind.into(), dev: options.dev },
        graph.clone(),
        cancel.clone(),
    );
    builder.push_includes(&config.includes)?;
    if let Some(callback) = options.on_new_target {
        builder.set_new_target_callback(callback);
    }
    builder.finalize(&mut auditor)?;

    let top_level_descriptor = match options.kind {
        RunKind::Build => &config.build,
        RunKind::Deploy => &config.deploy,
    };
    let deploy_config = DeployConfig::from_descriptor(top_level_descriptor);
    let mut deployer = Deployer::new(deploy_config);
    deployer.finalize(&mut auditor)?;

    auditor.audit(&mut registry).await?;
    let registry = Arc::new(registry);

    let ignore_sources = if graph_was_loaded {
        let guard = tree.lock().await;
        graph.lock().expect("graph mutex poisoned").get_ignore_sources(&*guard)?
    } else {
        HashSet::new()
    };

    admit_tree(&tree, &mut builder, &config, &graph, graph_was_loaded, &ignore_sources, options.force, &base_path)
        .await?;

    builder.execute(registry.clone()).await?;

    let output_targets = builder.take_output_targets();
    let outcome = if output_targets.is_empty() {
        if ignore_sources.is_empty() {
            RunOutcome::NoTargets
        } else {
            RunOutcome::UpToDate
        }
    } else {
        let output_target_count = output_targets.len();
        deployer
            .execute(
                options.deploy_path.clone(),
                output_targets,
                graph.clone(),
                prev_graph,
                tree.clone(),
                registry,
                cancel,
            )
            .await?;
        tree.lock().await.record_deploy()?;
        RunOutcome::Deployed { output_target_count }
    };

    {
        let mut g = graph.lock().expect("graph mutex poisoned");
        g.resolve();
        let repr = g.get_storage_repr();
        let bytes = serde_json::to_vec(&repr)?;
        let mut guard = tree.lock().await;
        guard.write_storage_config(DEPENDS_CONFIG_KEY, false, bytes)?;
        guard.finalize()?;
    }

    info!(?outcome, "kernel run complete");
    Ok(outcome)
}

async fn load_graph(tree: &Arc<AsyncMutex<dyn Tree>>) -> Result<(DependencyGraph, DependencyGraph)> {
    let blob = {
        let guard = tree.lock().await;
        guard.get_storage_config(DEPENDS_CONFIG_KEY, false)?
    };
    match blob {
        Some(bytes) => {
            let repr: GraphStorageRepr = serde_json::from_slice(&bytes)?;
            let mut graph = DependencyGraph::from_storage(repr.clone());
            graph.resolve();
            let mut prev = DependencyGraph::from_storage(repr);
            prev.resolve();
            Ok((graph, prev))
        }
        None => Ok((DependencyGraph::new(), DependencyGraph::new())),
    }
}

/// Walks the tree under `base_path`, skipping hidden directories, and
/// admits each file as an initial target unless it can be safely ignored
/// (spec §4.9 step 5).
async fn admit_tree(
    tree: &Arc<AsyncMutex<dyn Tree>>,
    builder: &mut Builder,
    _config: &ProjectConfig,
    graph: &Arc<Mutex<DependencyGraph>>,
    graph_was_loaded: bool,
    ignore_sources: &HashSet<PathBuf>,
    force: bool,
    base_path: &Path,
) -> Result<()> {
    let guard = tree.lock().await;
    let mut candidates = Vec::new();
    let filter = |dir: &Path| !dir.file_name().map(|n| n.to_string_lossy().starts_with('.')).unwrap_or(false);
    let walk_options = WalkOptions { base_path: Some(base_path.to_path_buf()), filter: Some(&filter) };
    guard.walk(&walk_options, &mut |delayed| candidates.push(delayed))?;

    for delayed in candidates {
        let candidate_path = delayed.candidate_path();
        if ignore_sources.contains(&candidate_path) {
            debug!(path = %candidate_path.display(), "ignored (only up-to-date products depend on it)");
            continue;
        }

        let has_product = graph.lock().expect("graph mutex poisoned").has_product_for_source(&candidate_path);
        if graph_was_loaded && !has_product && !force {
            let modified = guard.is_blob_modified(&candidate_path, None)?;
            if !modified {
                debug!(path = %candidate_path.display(), "ignored (pass-through source unmodified)");
                continue;
            }
        }

        let admitted = builder.push_initial_target_delayed(delayed, false)?;
        if admitted {
            debug!(path = %candidate_path.display(), "admitted");
        } else {
            debug!(path = %candidate_path.display(), "skipped (no matching include)");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::path_tree::PathTree;
    use tempfile::TempDir;

    fn tree_of(dir: &std::path::Path) -> Arc<AsyncMutex<dyn Tree>> {
        Arc::new(AsyncMutex::new(PathTree::new(dir.to_path_buf())))
    }

    fn options(deploy_path: PathBuf, dev: bool, force: bool) -> KernelOptions {
        KernelOptions { kind: RunKind::Build, dev, force, deploy_path, plugin_dirs: Vec::new(), on_new_target: None }
    }

    /// S1 — pass-through: a plain `pass` handler round-trips a file's bytes
    /// to the deploy path unchanged; a second run with no source change
    /// reports up-to-date and leaves the deployed file untouched.
    #[tokio::test]
    async fn s1_pass_through_and_up_to_date() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("src")).unwrap();
        std::fs::write(src.path().join("src/a.js"), b"X").unwrap();
        std::fs::write(
            src.path().join("kiln.config.json"),
            r#"{"build":"write","deploy":"write","includes":[
                {"pattern":"^src/.*\\.js$","handlers":["pass"]}
            ]}"#,
        )
        .unwrap();

        let tree = tree_of(src.path());
        let outcome = run(tree.clone(), options(out.path().to_path_buf(), false, false)).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Deployed { output_target_count: 1 }));
        assert_eq!(std::fs::read(out.path().join("src/a.js")).unwrap(), b"X");

        let outcome2 = run(tree, options(out.path().to_path_buf(), false, false)).await.unwrap();
        assert!(matches!(outcome2, RunOutcome::UpToDate));
        assert_eq!(std::fs::read(out.path().join("src/a.js")).unwrap(), b"X");
    }

    /// S2 — rename: an external `rename` handler rewrites the deployed
    /// file's extension and the dependency graph records the edge.
    #[tokio::test]
    async fn s2_rename_rewrites_extension_and_records_edge() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("src")).unwrap();
        std::fs::write(src.path().join("src/a.js"), b"X").unwrap();
        std::fs::write(
            src.path().join("kiln.config.json"),
            r#"{"build":"write","deploy":"write","includes":[
                {"pattern":"^src/.*\\.js$","handlers":[
                    {"id":"rename","match":"\\.js$","replace":".mjs"}
                ]}
            ]}"#,
        )
        .unwrap();

        let tree = tree_of(src.path());
        run(tree, options(out.path().to_path_buf(), false, false)).await.unwrap();

        assert_eq!(std::fs::read(out.path().join("src/a.mjs")).unwrap(), b"X");
        assert!(!out.path().join("src/a.js").exists());
    }

    /// S4 — an `exclude` glob takes precedence over a `match` glob.
    #[tokio::test]
    async fn s4_exclude_takes_precedence_over_match() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("src")).unwrap();
        std::fs::write(src.path().join("src/a.js"), b"A").unwrap();
        std::fs::write(src.path().join("src/skip.js"), b"B").unwrap();
        std::fs::write(
            src.path().join("kiln.config.json"),
            r#"{"build":"write","deploy":"write","includes":[
                {"match":"src/*.js","exclude":"src/skip.js","handlers":["pass"]}
            ]}"#,
        )
        .unwrap();

        let tree = tree_of(src.path());
        let outcome = run(tree, options(out.path().to_path_buf(), false, false)).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Deployed { output_target_count: 1 }));
        assert!(out.path().join("src/a.js").exists());
        assert!(!out.path().join("src/skip.js").exists());
    }

    /// S5 — a `dev:false` handler executes on a prod build and is skipped
    /// on a dev build, where the untouched stream still flows through.
    #[tokio::test]
    async fn s5_dev_gating_skips_handler_on_dev_run() {
        let src = TempDir::new().unwrap();
        let out_prod = TempDir::new().unwrap();
        let out_dev = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("src")).unwrap();
        std::fs::write(src.path().join("src/a.js"), b"X").unwrap();
        std::fs::write(
            src.path().join("kiln.config.json"),
            r#"{"build":"write","deploy":"write","includes":[
                {"pattern":"^src/.*\\.js$","handlers":[
                    {"id":"rename","dev":false,"build":true,"match":"\\.js$","replace":".min.js"}
                ]}
            ]}"#,
        )
        .unwrap();

        let tree_prod = tree_of(src.path());
        run(tree_prod, options(out_prod.path().to_path_buf(), false, false)).await.unwrap();
        assert!(out_prod.path().join("src/a.min.js").exists());

        let tree_dev = tree_of(src.path());
        run(tree_dev, options(out_dev.path().to_path_buf(), true, false)).await.unwrap();
        assert!(out_dev.path().join("src/a.js").exists());
        assert!(!out_dev.path().join("src/a.min.js").exists());
    }
}
