//! `DeployConfig`: a normalized deploy-plugin descriptor with its
//! `predeploy`/`postdeploy` chains and required plugins (spec §4.8).
//!
//! Grounded on the teacher's `builder::lifecycle` recursive step-execution
//! shape (`predeploy → self → postdeploy`, each awaited in order).

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::deploy::context::DeployContext;
use crate::error::{KilnError, Result};
use crate::plugin::auditor::{AuditOrder, PluginRef};
use crate::plugin::{format_fq_id, PluginKind};
use crate::project_config::{DeployDescriptorSpec, PluginDescriptor};

#[derive(Debug, Clone, Default)]
pub struct DeployChain {
    pub predeploy: Vec<DeployConfig>,
    pub postdeploy: Vec<DeployConfig>,
}

/// `{id, version, chain:{predeploy, postdeploy}, requires:{build, deploy}}`
/// (spec §3 "DeployConfig").
#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub id: String,
    pub version: Option<String>,
    pub chain: DeployChain,
    pub requires_build: Vec<String>,
    pub requires_deploy: Vec<String>,
    /// The descriptor's own plugin-specific settings — handed to
    /// `plugin.exec` verbatim as `this` (spec §4.8: "invoke `this.plugin.exec`").
    pub settings: Value,
}

impl DeployConfig {
    pub fn from_descriptor(descriptor: &PluginDescriptor) -> Self {
        match descriptor {
            PluginDescriptor::Id(id) => DeployConfig {
                id: id.clone(),
                version: None,
                chain: DeployChain::default(),
                requires_build: Vec::new(),
                requires_deploy: Vec::new(),
                settings: Value::Null,
            },
            PluginDescriptor::Full(spec) => Self::from_spec(spec),
        }
    }

    fn from_spec(spec: &DeployDescriptorSpec) -> Self {
        let predeploy = spec.chain.predeploy.iter().map(Self::from_descriptor).collect();
        let postdeploy = spec.chain.postdeploy.iter().map(Self::from_descriptor).collect();
        let requires_build = spec.requires.build.iter().map(|d| format_fq_id(d.id(), d.version())).collect();
        let requires_deploy = spec.requires.deploy.iter().map(|d| format_fq_id(d.id(), d.version())).collect();
        let settings = serde_json::to_value(&spec.extra).unwrap_or(Value::Null);
        DeployConfig {
            id: spec.id.clone(),
            version: spec.version.clone(),
            chain: DeployChain { predeploy, postdeploy },
            requires_build,
            requires_deploy,
            settings,
        }
    }

    pub fn fq_id(&self) -> String {
        format_fq_id(&self.id, self.version.as_deref())
    }

    /// Flat audit request covering this plugin, its `requires.build`/`deploy`,
    /// and recursively every predeploy/postdeploy DeployConfig (spec §4.8
    /// `getAuditOrders`).
    ///
    /// The legacy `resolve(pluginObject)` back-pointer that memoizes a
    /// DeployConfig's own plugin handle is replaced here by a plain
    /// post-audit registry lookup in [`DeployConfig::execute`] — once
    /// `Auditor::audit` has returned successfully every fq id referenced
    /// here is guaranteed present in the registry, so there is nothing left
    /// to memoize (see DESIGN.md).
    pub fn get_audit_orders(&self) -> Vec<AuditOrder> {
        let mut orders = vec![AuditOrder {
            plugin: PluginRef { id: self.id.clone(), version: self.version.clone(), kind: PluginKind::Deploy },
            settings: self.settings.clone(),
        }];
        for fq in &self.requires_build {
            let (id, version) = crate::plugin::parse_fq_id(fq);
            orders.push(AuditOrder { plugin: PluginRef { id, version, kind: PluginKind::Build }, settings: Value::Null });
        }
        for fq in &self.requires_deploy {
            let (id, version) = crate::plugin::parse_fq_id(fq);
            orders.push(AuditOrder { plugin: PluginRef { id, version, kind: PluginKind::Deploy }, settings: Value::Null });
        }
        for dc in self.chain.predeploy.iter().chain(self.chain.postdeploy.iter()) {
            orders.extend(dc.get_audit_orders());
        }
        orders
    }

    /// `predeploy → self → postdeploy`, each step awaited before the next
    /// (spec §4.8 `execute`). Boxed because chain steps recurse into this
    /// same method, which would otherwise give the future an infinite size.
    pub fn execute<'a>(&'a self, context: &'a mut DeployContext, as_chain: bool) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for step in &self.chain.predeploy {
                step.execute(context, true).await?;
            }

            let fq = self.fq_id();
            let plugin = context
                .registry()
                .get_deploy(&fq)
                .ok_or_else(|| KilnError::PluginNotFound(fq.clone()))?;
            if as_chain {
                context.chain(plugin, &self.settings).await?;
            } else {
                plugin.exec(context, &self.settings).await?;
            }

            for step in &self.chain.postdeploy {
                step.execute(context, true).await?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project_config::RequiresSpec;

    #[test]
    fn simple_id_descriptor_has_no_chain_or_requires() {
        let descriptor = PluginDescriptor::Id("write".to_string());
        let config = DeployConfig::from_descriptor(&descriptor);
        assert_eq!(config.fq_id(), "write");
        assert!(config.chain.predeploy.is_empty());
        assert!(config.requires_build.is_empty());
    }

    #[test]
    fn full_descriptor_collects_chain_and_requires_into_audit_orders() {
        let descriptor = PluginDescriptor::Full(DeployDescriptorSpec {
            id: "combine".to_string(),
            version: None,
            chain: crate::project_config::ChainSpec {
                predeploy: vec![],
                postdeploy: vec![PluginDescriptor::Id("write".to_string())],
            },
            requires: RequiresSpec { build: vec![], deploy: vec![PluginDescriptor::Id("exclude".to_string())] },
            extra: Default::default(),
        });
        let config = DeployConfig::from_descriptor(&descriptor);
        let orders = config.get_audit_orders();
        // self + requires.deploy + postdeploy's own order = 3
        assert_eq!(orders.len(), 3);
        assert_eq!(orders[0].plugin.id, "combine");
    }
}
