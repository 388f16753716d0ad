//! `kiln` — CLI front end for the build-and-deploy engine (spec §6 "CLI
//! surface", SPEC_FULL §2 A4).
//!
//! Grounded on the teacher's `src/bin/wright.rs`: a `clap` derive `Cli` with
//! one subcommand per top-level verb, `anyhow::Context` at the edge around
//! calls into the library's `thiserror` types, and a non-zero exit code on
//! any `Err` (spec §7 "Propagation").

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use tokio::sync::Mutex as AsyncMutex;

use kiln::builder::NewTargetCallback;
use kiln::kernel::{self, KernelOptions, RunKind, RunOutcome};
use kiln::settings::KilnSettings;
use kiln::tree::path_tree::PathTree;
use kiln::tree::repo_tree::RepoTree;
use kiln::tree::Tree;

#[derive(Parser)]
#[command(name = "kiln", about = "incremental build-and-deploy engine for file-tree projects")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to kiln.toml (engine-level settings); defaults to ./kiln.toml
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the build pipeline against a local tree, writing products under
    /// a staging deploy path (spec §6 "build [path]").
    Build {
        /// Project tree root (default: current directory)
        path: Option<PathBuf>,

        /// Directory build products are written under
        #[arg(long = "out", default_value = "build")]
        out: PathBuf,

        /// Run handlers gated `dev:true` instead of the prod set
        #[arg(long)]
        dev: bool,

        /// Ignore the dependency graph and rebuild everything
        #[arg(long)]
        force: bool,
    },
    /// Run the deploy pipeline against a local tree or a repository
    /// snapshot (spec §6 "deploy [path]").
    Deploy {
        /// Project tree root (default: current directory)
        path: Option<PathBuf>,

        /// Destination path build products are written under
        #[arg(long = "to")]
        to: PathBuf,

        /// Deploy from this branch's snapshot (repository trees only)
        #[arg(long)]
        branch: Option<String>,

        /// Deploy from this tag's snapshot (repository trees only; mutually
        /// exclusive with `--branch`)
        #[arg(long)]
        tag: Option<String>,

        /// Ignore the dependency graph and redeploy everything
        #[arg(long)]
        force: bool,
    },
    /// Read or write the persisted deploy record for a tree/deploy-path pair
    /// (spec §6 "config/info family").
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print one of `deployPath` / `deployBranch` / `lastRevision`.
    Get {
        path: PathBuf,
        #[arg(long = "deploy-path")]
        deploy_path: String,
        key: String,
    },
    /// Overwrite one of `deployPath` / `deployBranch` / `lastRevision`.
    Set {
        path: PathBuf,
        #[arg(long = "deploy-path")]
        deploy_path: String,
        key: String,
        value: String,
    },
}

fn main() {
    let cli = Cli::parse();
    let settings = KilnSettings::load(cli.settings.as_deref());

    // `RUST_LOG` always wins when set; otherwise fall back to the
    // engine-level `log_filter` setting (spec §2 A2/A3) rather than a
    // hardcoded default.
    let default_filter = settings.as_ref().map(|s| s.log_filter.as_str()).unwrap_or("info").to_string();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if let Err(err) = run(cli, settings) {
        let colored = use_color();
        if colored {
            eprintln!("{} {err:#}", "error:".red().bold());
        } else {
            eprintln!("error: {err:#}");
        }
        std::process::exit(1);
    }
}

/// Disables color when stdout isn't a terminal, matching the teacher's
/// progress-bar code which only renders its template for interactive runs.
fn use_color() -> bool {
    unsafe { libc::isatty(libc::STDOUT_FILENO) != 0 }
}

fn run(cli: Cli, settings: kiln::Result<KilnSettings>) -> Result<()> {
    let settings = settings.context("failed to load kiln.toml")?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(async move {
        match cli.command {
            Commands::Build { path, out, dev, force } => run_build(path, out, dev, force, &settings).await,
            Commands::Deploy { path, to, branch, tag, force } => {
                run_deploy(path, to, branch, tag, force, &settings).await
            }
            Commands::Config { action } => run_config(action).await,
        }
    })
}

/// Opens `path` as a `RepoTree` if it looks like a git repository (a `.git`
/// entry is present), otherwise as a `PathTree` — the "detection" spec §6's
/// CLI surface leaves to the implementer.
fn open_tree(path: &Path, branch: Option<&str>, tag: Option<&str>) -> Result<Arc<AsyncMutex<dyn Tree>>> {
    if path.join(".git").exists() {
        let tree = RepoTree::open(path, branch, tag).context("failed to open repository tree")?;
        Ok(Arc::new(AsyncMutex::new(tree)))
    } else {
        Ok(Arc::new(AsyncMutex::new(PathTree::new(path.to_path_buf()))))
    }
}

fn progress_callback(colored: bool) -> Result<(NewTargetCallback, indicatif::ProgressBar)> {
    let bar = indicatif::ProgressBar::new_spinner();
    let template = if colored {
        "{spinner:.green} [{elapsed_precise}] {pos} targets processed"
    } else {
        "[{elapsed_precise}] {pos} targets processed"
    };
    let style = indicatif::ProgressStyle::default_spinner()
        .template(template)
        .context("invalid progress bar template")?;
    bar.set_style(style);
    let bar_handle = bar.clone();
    let callback: NewTargetCallback = Box::new(move |_parent, _handler, _children| {
        bar_handle.inc(1);
    });
    Ok((callback, bar))
}

async fn run_build(path: Option<PathBuf>, out: PathBuf, dev: bool, force: bool, settings: &KilnSettings) -> Result<()> {
    let path = path.unwrap_or_else(|| PathBuf::from("."));
    let colored = use_color();
    let tree = open_tree(&path, None, None)?;

    let (callback, bar) = progress_callback(colored)?;
    let options = KernelOptions {
        kind: RunKind::Build,
        dev,
        force,
        deploy_path: out.clone(),
        plugin_dirs: settings.plugin_dirs.clone(),
        on_new_target: Some(callback),
    };

    let outcome = kernel::run(tree, options).await.context("build run failed")?;
    bar.finish_and_clear();
    report_outcome(&outcome, &out, colored);
    Ok(())
}

async fn run_deploy(
    path: Option<PathBuf>,
    to: PathBuf,
    branch: Option<String>,
    tag: Option<String>,
    force: bool,
    settings: &KilnSettings,
) -> Result<()> {
    let path = path.unwrap_or_else(|| PathBuf::from("."));
    let colored = use_color();
    let tree = open_tree(&path, branch.as_deref(), tag.as_deref())?;

    let (callback, bar) = progress_callback(colored)?;
    let options = KernelOptions {
        kind: RunKind::Deploy,
        dev: false,
        force,
        deploy_path: to.clone(),
        plugin_dirs: settings.plugin_dirs.clone(),
        on_new_target: Some(callback),
    };

    let outcome = kernel::run(tree, options).await.context("deploy run failed")?;
    bar.finish_and_clear();
    report_outcome(&outcome, &to, colored);
    Ok(())
}

fn report_outcome(outcome: &RunOutcome, deploy_path: &Path, colored: bool) {
    let timestamp = chrono::Utc::now().to_rfc3339();
    let message = match outcome {
        RunOutcome::UpToDate => format!("up-to-date — nothing to do ({timestamp})"),
        RunOutcome::NoTargets => format!("no targets matched any include ({timestamp})"),
        RunOutcome::Deployed { output_target_count } => format!(
            "deployed {output_target_count} target(s) to {} ({timestamp})",
            deploy_path.display()
        ),
    };

    if colored {
        println!("{} {}", "ok:".green().bold(), message);
    } else {
        println!("ok: {message}");
    }

    if let Some((width, _)) = terminal_size::terminal_size() {
        println!("{}", "-".repeat(width.0 as usize).dimmed());
    }
}

/// `set_deploy_context` scopes `get_deploy_config`/`write_deploy_config` to
/// a deploy path; it lives on the concrete tree types rather than the
/// `Tree` trait (spec §4.3), so `config` operates on them directly instead
/// of going through `open_tree`'s trait object.
async fn run_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Get { path, deploy_path, key } => {
            let value = if path.join(".git").exists() {
                let mut tree = RepoTree::open(&path, None, None).context("failed to open repository tree")?;
                tree.set_deploy_context(deploy_path);
                tree.get_deploy_config(&key).context("failed to read deploy record")?
            } else {
                let mut tree = PathTree::new(path);
                tree.set_deploy_context(deploy_path);
                tree.get_deploy_config(&key).context("failed to read deploy record")?
            };
            match value {
                Some(value) => println!("{value}"),
                None => println!("(unset)"),
            }
        }
        ConfigAction::Set { path, deploy_path, key, value } => {
            if path.join(".git").exists() {
                let mut tree = RepoTree::open(&path, None, None).context("failed to open repository tree")?;
                tree.set_deploy_context(deploy_path);
                tree.write_deploy_config(&key, serde_json::Value::String(value))
                    .context("failed to write deploy record")?;
                tree.finalize().context("failed to persist deploy record")?;
            } else {
                let mut tree = PathTree::new(path);
                tree.set_deploy_context(deploy_path);
                tree.write_deploy_config(&key, serde_json::Value::String(value))
                    .context("failed to write deploy record")?;
                tree.finalize().context("failed to persist deploy record")?;
            }
            println!("{}", "ok: updated".green());
        }
    }
    Ok(())
}
