//! Built-in plugins (spec §4.5): `pass`/`rename` (build), `exclude`/`write`
//! (deploy), plus the supplemented `combine` (deploy — see DESIGN.md for why
//! it's implemented despite spec §1 listing concrete file-combiners as
//! out of scope: scenario S6 exercises its wire contract directly).
//!
//! `ExternalCommandBuildPlugin` is grounded on the teacher's
//! `builder::executor::execute_script`: a plugin is a command invoked with
//! the target's bytes on stdin and its settings JSON-encoded in an
//! environment variable, its stdout bytes becoming the sole output target.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;

use crate::deploy::context::DeployContext;
use crate::error::{KilnError, Result};
use crate::project_config::{HandlerDescriptor, InlineHandler};
use crate::target::Target;

use super::{BuildPlugin, DeployPlugin};

/// Dispatches an inline handler directly, bypassing the registry entirely —
/// inline rules carry no id and never enter the plugin namespace (DESIGN.md
/// Open Question: this makes the legacy "inline vs external collision" case
/// moot in this design).
pub fn exec_inline(inline: &InlineHandler, target: Target) -> Result<Vec<Target>> {
    match inline {
        InlineHandler::Pass => Ok(vec![target]),
        InlineHandler::Rename { pattern, replace } => {
            let new_name = pattern.replace(target.name(), replace.as_str()).into_owned();
            Ok(vec![target.pass(Some(new_name), None)])
        }
    }
}

pub struct PassPlugin;

#[async_trait]
impl BuildPlugin for PassPlugin {
    async fn exec(&self, target: Target, _settings: &HandlerDescriptor) -> Result<Vec<Target>> {
        Ok(vec![target])
    }
}

pub struct RenamePlugin;

#[async_trait]
impl BuildPlugin for RenamePlugin {
    async fn exec(&self, target: Target, settings: &HandlerDescriptor) -> Result<Vec<Target>> {
        let pattern = settings
            .settings
            .get("match")
            .and_then(Value::as_str)
            .ok_or_else(|| KilnError::ConfigMalformed("rename plugin requires a `match` setting".to_string()))?;
        let replace = settings.settings.get("replace").and_then(Value::as_str).unwrap_or("");
        let re = regex::Regex::new(pattern)?;
        let new_name = re.replace(target.name(), replace).into_owned();
        Ok(vec![target.pass(Some(new_name), None)])
    }
}

pub struct ExcludePlugin;

#[async_trait]
impl DeployPlugin for ExcludePlugin {
    async fn exec(&self, context: &mut DeployContext, _settings: &Value) -> Result<()> {
        let all: Vec<PathBuf> = context.targets().iter().map(|t| t.source_target_path()).collect();
        context.remove_targets(&all);
        Ok(())
    }
}

/// Materializes every remaining target to disk under the deploy path.
#[derive(Default)]
pub struct WritePlugin;

#[async_trait]
impl DeployPlugin for WritePlugin {
    async fn exec(&self, context: &mut DeployContext, _settings: &Value) -> Result<()> {
        {
            let tree = context.tree();
            let guard = tree.lock().await;
            let deploy_path = context.deploy_path().to_path_buf();
            let mut removals = Vec::new();
            guard.walk_extraneous(&mut |path, is_dir| removals.push((path, is_dir)))?;
            drop(guard);
            for (path, is_dir) in removals {
                let absolute = deploy_path.join(&path);
                if is_dir {
                    let _ = std::fs::remove_dir(&absolute);
                } else {
                    let _ = std::fs::remove_file(&absolute);
                }
            }
        }

        let deploy_path = context.deploy_path().to_path_buf();
        for target in context.targets_mut() {
            let rel = target.get_deploy_target_path()?.to_path_buf();
            let absolute = deploy_path.join(&rel);
            if let Some(parent) = absolute.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let content = target.load_content()?.to_vec();
            std::fs::write(&absolute, content)?;
        }
        Ok(())
    }
}

/// Concatenates the removed targets' content in `settings.ordering` order
/// (falling back to the order they were removed in), emitting a single
/// combined output target.
pub struct CombinePlugin;

#[async_trait]
impl DeployPlugin for CombinePlugin {
    async fn exec(&self, context: &mut DeployContext, settings: &Value) -> Result<()> {
        let output_name = settings
            .get("output")
            .and_then(Value::as_str)
            .ok_or_else(|| KilnError::ConfigMalformed("combine plugin requires an `output` setting".to_string()))?;

        let ordering: Vec<PathBuf> = settings
            .get("ordering")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_str).map(PathBuf::from).collect())
            .unwrap_or_default();

        let all: Vec<PathBuf> = context.targets().iter().map(|t| t.source_target_path()).collect();
        let mut removed = context.remove_targets(&all);

        removed.sort_by_key(|t| {
            let key = t.source_target_path();
            ordering.iter().position(|p| p == &key).unwrap_or(usize::MAX)
        });

        let mut combined = Vec::new();
        for target in &mut removed {
            combined.extend_from_slice(target.load_content()?);
        }

        let parents: Vec<&Target> = removed.iter().collect();
        context.create_target(PathBuf::from(output_name), &parents, true)?;
        if let Some(out) = context.lookup_target_mut(&PathBuf::from(output_name)) {
            out.replace_content(combined);
        }
        Ok(())
    }
}

/// A build plugin backed by an external command (spec §9): the target's
/// bytes go to stdin, its settings go in the `KILN_SETTINGS` env var as
/// JSON, and stdout becomes the sole output target's content.
pub struct ExternalCommandBuildPlugin {
    command: String,
    args: Vec<String>,
}

impl ExternalCommandBuildPlugin {
    pub fn new(command: String, args: Vec<String>) -> Self {
        Self { command, args }
    }
}

#[async_trait]
impl BuildPlugin for ExternalCommandBuildPlugin {
    async fn exec(&self, mut target: Target, settings: &HandlerDescriptor) -> Result<Vec<Target>> {
        let content = target.load_content()?.to_vec();
        let settings_json = serde_json::to_string(&settings.settings)?;
        let source_path = target.source_path().to_path_buf();
        let name = target.name().to_string();
        let command = self.command.clone();
        let args = self.args.clone();

        let output = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut child = std::process::Command::new(&command)
                .args(&args)
                .env("KILN_SETTINGS", settings_json)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;
            child.stdin.take().unwrap().write_all(&content)?;
            let output = child.wait_with_output()?;
            if !output.status.success() {
                return Err(KilnError::PluginExecFailure {
                    plugin: command.clone(),
                    message: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
            Ok(output.stdout)
        })
        .await
        .map_err(|e| KilnError::PluginExecFailure {
            plugin: self.command.clone(),
            message: e.to_string(),
        })??;

        Ok(vec![Target::from_bytes(source_path, name, output)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project_config::{HandlerSpec, InlineHandler as IH};

    fn descriptor(settings: Value) -> HandlerDescriptor {
        HandlerDescriptor {
            spec: HandlerSpec::External { id: "rename".to_string(), version: None },
            dev: false,
            build: true,
            settings,
        }
    }

    #[tokio::test]
    async fn pass_plugin_returns_target_unchanged() {
        let target = Target::from_bytes("src", "a.js", b"x".to_vec()).unwrap();
        let settings = descriptor(Value::Null);
        let result = PassPlugin.exec(target, &settings).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name(), "a.js");
    }

    #[tokio::test]
    async fn rename_plugin_rewrites_extension() {
        let target = Target::from_bytes("src", "a.js", b"x".to_vec()).unwrap();
        let settings = descriptor(serde_json::json!({"match": r"\.js$", "replace": ".mjs"}));
        let result = RenamePlugin.exec(target, &settings).await.unwrap();
        assert_eq!(result[0].name(), "a.mjs");
    }

    #[test]
    fn inline_rename_matches_registry_rename() {
        let target = Target::from_bytes("src", "a.js", b"x".to_vec()).unwrap();
        let inline = IH::Rename { pattern: regex::Regex::new(r"\.js$").unwrap(), replace: ".mjs".to_string() };
        let result = exec_inline(&inline, target).unwrap();
        assert_eq!(result[0].name(), "a.mjs");
    }
}
