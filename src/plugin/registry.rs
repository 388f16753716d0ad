//! Resolves plugin identifiers to executable plugin objects (spec §4.5).
//!
//! Grounded on `builder::executor::ExecutorRegistry`: a small built-in table
//! plus a `load_from_dir`-style scan of configured search directories for
//! externally-provided plugins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{KilnError, Result};

use super::builtin::{CombinePlugin, ExcludePlugin, ExternalCommandBuildPlugin, PassPlugin, RenamePlugin, WritePlugin};
use super::{BuildPlugin, DeployPlugin, PluginKind};

/// `{ plugin: { id, kind, command, args } }` — an external plugin
/// discovered in a search directory, backed by a shell command (spec §9
/// stand-in for concrete plugin bodies, grounded on
/// `builder::executor::ExecutorConfig`).
#[derive(Debug, Clone, Deserialize)]
struct PluginManifestFile {
    plugin: PluginManifest,
}

#[derive(Debug, Clone, Deserialize)]
struct PluginManifest {
    id: String,
    kind: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

pub struct PluginRegistry {
    search_dirs: Vec<PathBuf>,
    build_plugins: HashMap<String, Arc<dyn BuildPlugin>>,
    deploy_plugins: HashMap<String, Arc<dyn DeployPlugin>>,
}

impl PluginRegistry {
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        let mut registry = Self {
            search_dirs,
            build_plugins: HashMap::new(),
            deploy_plugins: HashMap::new(),
        };
        registry.register_builtins();
        registry
    }

    fn register_builtins(&mut self) {
        self.build_plugins.insert("pass".to_string(), Arc::new(PassPlugin));
        self.build_plugins.insert("rename".to_string(), Arc::new(RenamePlugin));
        self.deploy_plugins.insert("exclude".to_string(), Arc::new(ExcludePlugin));
        self.deploy_plugins.insert("write".to_string(), Arc::new(WritePlugin::default()));
        self.deploy_plugins.insert("combine".to_string(), Arc::new(CombinePlugin));
    }

    pub fn get_build(&self, fq_id: &str) -> Option<Arc<dyn BuildPlugin>> {
        self.build_plugins.get(fq_id).cloned()
    }

    pub fn get_deploy(&self, fq_id: &str) -> Option<Arc<dyn DeployPlugin>> {
        self.deploy_plugins.get(fq_id).cloned()
    }

    /// Registers a plugin object directly — used for inline-on-the-fly
    /// plugin registration (spec §4.6 `finalize`) and for test fixtures.
    pub fn register_build(&mut self, fq_id: impl Into<String>, plugin: Arc<dyn BuildPlugin>) -> Result<()> {
        let fq_id = fq_id.into();
        if self.build_plugins.contains_key(&fq_id) {
            return Err(KilnError::ConfigMalformed(format!(
                "inline handler collides with already-registered plugin '{fq_id}'"
            )));
        }
        self.build_plugins.insert(fq_id, plugin);
        Ok(())
    }

    /// Resolution order for an id not already registered: probe each
    /// configured search directory for `<fq_id>/plugin.toml`. External
    /// plugins are only supported for the build kind (spec §9 scope
    /// decision); an external deploy plugin manifest is a hard error. No
    /// network installer is implemented — spec §1 keeps remote package
    /// fetching out of scope, so a manifest absent from every search
    /// directory is simply not found.
    pub fn resolve_external(&mut self, fq_id: &str, kind: PluginKind) -> Result<()> {
        match kind {
            PluginKind::Build if self.build_plugins.contains_key(fq_id) => return Ok(()),
            PluginKind::Deploy if self.deploy_plugins.contains_key(fq_id) => return Ok(()),
            _ => {}
        }

        for dir in self.search_dirs.clone() {
            let manifest_path = dir.join(fq_id).join("plugin.toml");
            if !manifest_path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(&manifest_path)?;
            let parsed: PluginManifestFile = toml::from_str(&text)?;
            let manifest = parsed.plugin;
            if manifest.kind != kind.as_str() {
                return Err(KilnError::PluginInterfaceInvalid {
                    id: fq_id.to_string(),
                    kind: kind.as_str(),
                });
            }
            return match kind {
                PluginKind::Build => {
                    let plugin = ExternalCommandBuildPlugin::new(manifest.command.clone(), manifest.args.clone());
                    self.build_plugins.insert(fq_id.to_string(), Arc::new(plugin));
                    Ok(())
                }
                PluginKind::Deploy => Err(KilnError::PluginInterfaceInvalid {
                    id: fq_id.to_string(),
                    kind: "deploy",
                }),
            };
        }

        Err(KilnError::PluginNotFound(fq_id.to_string()))
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Checks a manifest exists for `fq_id` without constructing anything —
    /// used by the auditor's pre-pass to fail fast on a clearly-missing
    /// plugin before any installer hook runs.
    pub fn manifest_exists(&self, fq_id: &str) -> bool {
        self.search_dirs.iter().any(|dir| dir.join(fq_id).join("plugin.toml").exists())
    }
}

pub fn manifest_path(dir: &Path, fq_id: &str) -> PathBuf {
    dir.join(fq_id).join("plugin.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_preregistered() {
        let registry = PluginRegistry::new(Vec::new());
        assert!(registry.get_build("pass").is_some());
        assert!(registry.get_build("rename").is_some());
        assert!(registry.get_deploy("exclude").is_some());
        assert!(registry.get_deploy("write").is_some());
    }

    #[test]
    fn unknown_plugin_with_no_search_dirs_is_not_found() {
        let mut registry = PluginRegistry::new(Vec::new());
        let err = registry.resolve_external("minify", PluginKind::Build).unwrap_err();
        assert!(matches!(err, KilnError::PluginNotFound(_)));
    }

    #[test]
    fn resolves_external_command_plugin_from_search_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let plugin_dir = tmp.path().join("uppercase");
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(
            plugin_dir.join("plugin.toml"),
            "[plugin]\nid = \"uppercase\"\nkind = \"build\"\ncommand = \"tr\"\nargs = [\"a-z\", \"A-Z\"]\n",
        )
        .unwrap();

        let mut registry = PluginRegistry::new(vec![tmp.path().to_path_buf()]);
        registry.resolve_external("uppercase", PluginKind::Build).unwrap();
        assert!(registry.get_build("uppercase").is_some());
    }
}
