//! Plugin registry, auditor, and built-in plugins (spec §4.5 "Plugin
//! registry & auditor").
//!
//! Grounded on the teacher's `builder::executor::ExecutorRegistry` for the
//! "small built-in table plus load-from-search-dirs" registry shape, and on
//! `builder::executor::execute_script` for the external-command plugin form
//! (§9 notes that concrete plugin bodies like minifiers are out of scope;
//! the one external plugin kind this crate implements — a shell command
//! receiving a target's bytes on stdin and settings as a `KILN_SETTINGS`
//! JSON env var — stands in for that class without pretending to implement
//! any specific one).

pub mod auditor;
pub mod builtin;
pub mod registry;

use async_trait::async_trait;
use serde_json::Value;

use crate::deploy::context::DeployContext;
use crate::error::Result;
use crate::project_config::HandlerDescriptor;
use crate::target::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginKind {
    Build,
    Deploy,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Build => "build",
            PluginKind::Deploy => "deploy",
        }
    }
}

/// `pluginId` if version is `"latest"`/absent/empty; else `pluginId@pluginVersion`
/// (spec §4.5 "Fully-qualified id").
pub fn format_fq_id(id: &str, version: Option<&str>) -> String {
    match version {
        Some(v) if !v.is_empty() && v != "latest" => format!("{id}@{v}"),
        _ => id.to_string(),
    }
}

/// Symmetric with [`format_fq_id`].
pub fn parse_fq_id(fq: &str) -> (String, Option<String>) {
    match fq.split_once('@') {
        Some((id, version)) => (id.to_string(), Some(version.to_string())),
        None => (fq.to_string(), None),
    }
}

/// A build plugin consumes a single target and may emit zero or more new
/// targets (spec GLOSSARY "Build plugin").
#[async_trait]
pub trait BuildPlugin: Send + Sync {
    async fn exec(&self, target: Target, settings: &HandlerDescriptor) -> Result<Vec<Target>>;

    /// Plugin-provided audit hook (spec §4.5: "if the plugin exposes its own
    /// `audit(context, settings)`... invoke it and await completion"). Called
    /// once per plugin id with every settings value accumulated across the
    /// includes that reference it (spec §4.5 `addOrders`: "Build orders for
    /// the same plugin id accumulate settings into a single list").
    async fn audit(&self, _settings: &[Value]) -> Result<()> {
        Ok(())
    }

    /// Plugins this plugin requires be loaded too (spec §4.5 `requires`).
    fn requires(&self) -> (Vec<String>, Vec<String>) {
        (Vec::new(), Vec::new())
    }
}

/// A deploy plugin consumes the [`DeployContext`] and may chain to other
/// deploy plugins (spec GLOSSARY "Deploy plugin").
#[async_trait]
pub trait DeployPlugin: Send + Sync {
    async fn exec(&self, context: &mut DeployContext, settings: &Value) -> Result<()>;

    async fn audit(&self, _settings: &Value) -> Result<()> {
        Ok(())
    }

    fn requires(&self) -> (Vec<String>, Vec<String>) {
        (Vec::new(), Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fq_id_omits_latest_and_empty_versions() {
        assert_eq!(format_fq_id("pass", None), "pass");
        assert_eq!(format_fq_id("pass", Some("latest")), "pass");
        assert_eq!(format_fq_id("pass", Some("")), "pass");
        assert_eq!(format_fq_id("pass", Some("1.2.0")), "pass@1.2.0");
    }

    #[test]
    fn parse_is_symmetric_with_format() {
        let (id, version) = parse_fq_id("rename@2.0.0");
        assert_eq!(id, "rename");
        assert_eq!(version.as_deref(), Some("2.0.0"));
        assert_eq!(format_fq_id(&id, version.as_deref()), "rename@2.0.0");
    }
}
