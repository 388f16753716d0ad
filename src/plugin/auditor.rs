//! Batches the transitive closure of plugin requirements before any build
//! or deploy execution begins (spec §4.5 "Plugin registry & auditor").
//!
//! Grounded on the teacher's `resolver::topo` queue-draining shape (a work
//! list processed to exhaustion, each step able to enqueue more work) —
//! here the work is "resolve a plugin, run its self-audit hook, enqueue
//! whatever it `requires`" rather than "visit a dependency's dependencies".

use std::collections::{HashSet, VecDeque};

use serde_json::Value;

use crate::error::{KilnError, Result};

use super::{format_fq_id, parse_fq_id, PluginKind, PluginRegistry};

/// A plugin reference carrying the kind it must resolve as (spec §4.5
/// plugin descriptor: `{pluginId, pluginVersion, pluginKind}`).
#[derive(Debug, Clone)]
pub struct PluginRef {
    pub id: String,
    pub version: Option<String>,
    pub kind: PluginKind,
}

/// `{plugin: descriptor, settings}` (spec §4.5 `addOrders`).
#[derive(Debug, Clone)]
pub struct AuditOrder {
    pub plugin: PluginRef,
    pub settings: Value,
}

/// Processes a queue of [`AuditOrder`]s to exhaustion, resolving every
/// referenced plugin (built-in, search-dir, or bust) before handing control
/// back to the caller. No Builder or Deployer execution may start until
/// [`Auditor::audit`] returns `Ok`.
#[derive(Default)]
pub struct Auditor {
    queue: VecDeque<AuditOrder>,
    /// `"{kind}:{fq_id}"` of plugins already processed this audit, so a
    /// plugin's `requires` chain can't cause it to be probed or
    /// self-audited twice.
    processed: HashSet<String>,
    /// Settings accumulated per build-plugin fq id across every include
    /// that references it, handed to the plugin's own `audit` hook as one
    /// batch (spec §4.5 `addOrders`: "Build orders for the same plugin id
    /// accumulate settings into a single list").
    build_settings: std::collections::HashMap<String, Vec<Value>>,
}

impl Auditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_orders(&mut self, orders: Vec<AuditOrder>) {
        for order in orders {
            self.add_order(order);
        }
    }

    fn add_order(&mut self, order: AuditOrder) {
        if order.plugin.kind == PluginKind::Build {
            let fq = format_fq_id(&order.plugin.id, order.plugin.version.as_deref());
            self.build_settings.entry(fq).or_default().push(order.settings.clone());
        }
        self.queue.push_back(order);
    }

    /// Drains the queue. A hard error on any plugin cancels all pending
    /// work and is the sole error reported (spec §4.5: "Any hard error
    /// cancels all pending work and reports exactly one error").
    pub async fn audit(&mut self, registry: &mut PluginRegistry) -> Result<()> {
        while let Some(order) = self.queue.pop_front() {
            let fq = format_fq_id(&order.plugin.id, order.plugin.version.as_deref());
            let dedupe_key = format!("{:?}:{fq}", order.plugin.kind);
            if !self.processed.insert(dedupe_key) {
                continue;
            }

            if !matches!(order.plugin.kind, PluginKind::Build) || !registry_has_build_builtin(registry, &fq) {
                registry.resolve_external(&fq, order.plugin.kind)?;
            }

            let (requires_build, requires_deploy) = match order.plugin.kind {
                PluginKind::Build => {
                    let plugin = registry
                        .get_build(&fq)
                        .ok_or_else(|| KilnError::PluginNotFound(fq.clone()))?;
                    let batch = self.build_settings.remove(&fq).unwrap_or_default();
                    plugin.audit(&batch).await?;
                    plugin.requires()
                }
                PluginKind::Deploy => {
                    let plugin = registry
                        .get_deploy(&fq)
                        .ok_or_else(|| KilnError::PluginNotFound(fq.clone()))?;
                    plugin.audit(&order.settings).await?;
                    plugin.requires()
                }
            };

            self.enqueue_fq_ids(requires_build, PluginKind::Build);
            self.enqueue_fq_ids(requires_deploy, PluginKind::Deploy);
        }
        Ok(())
    }

    fn enqueue_fq_ids(&mut self, fq_ids: Vec<String>, kind: PluginKind) {
        for fq in fq_ids {
            let (id, version) = parse_fq_id(&fq);
            self.add_order(AuditOrder { plugin: PluginRef { id, version, kind }, settings: Value::Null });
        }
    }
}

/// `resolve_external` already no-ops when a build-in is already registered,
/// but probing the registry first avoids the `Deploy` arm of
/// `resolve_external` (which never supports external plugins) rejecting a
/// built-in deploy plugin before we even check whether it's built in.
fn registry_has_build_builtin(registry: &PluginRegistry, fq: &str) -> bool {
    registry.get_build(fq).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builtin_plugins_audit_without_search_dirs() {
        let mut registry = PluginRegistry::new(Vec::new());
        let mut auditor = Auditor::new();
        auditor.add_orders(vec![
            AuditOrder { plugin: PluginRef { id: "pass".to_string(), version: None, kind: PluginKind::Build }, settings: Value::Null },
            AuditOrder { plugin: PluginRef { id: "write".to_string(), version: None, kind: PluginKind::Deploy }, settings: Value::Null },
        ]);
        auditor.audit(&mut registry).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_build_orders_accumulate_settings() {
        let mut registry = PluginRegistry::new(Vec::new());
        let mut auditor = Auditor::new();
        auditor.add_orders(vec![
            AuditOrder { plugin: PluginRef { id: "pass".to_string(), version: None, kind: PluginKind::Build }, settings: serde_json::json!({"a": 1}) },
            AuditOrder { plugin: PluginRef { id: "pass".to_string(), version: None, kind: PluginKind::Build }, settings: serde_json::json!({"a": 2}) },
        ]);
        assert_eq!(auditor.build_settings.get("pass").unwrap().len(), 2);
        auditor.audit(&mut registry).await.unwrap();
    }

    #[tokio::test]
    async fn missing_plugin_is_a_hard_error() {
        let mut registry = PluginRegistry::new(Vec::new());
        let mut auditor = Auditor::new();
        auditor.add_orders(vec![AuditOrder {
            plugin: PluginRef { id: "minify".to_string(), version: None, kind: PluginKind::Build },
            settings: Value::Null,
        }]);
        let err = auditor.audit(&mut registry).await.unwrap_err();
        assert!(matches!(err, KilnError::PluginNotFound(_)));
    }
}
