//! The Deployer: resolves a single deploy plugin plus its chains and
//! required plugins, then drives execution against a fresh DeployContext
//! (spec §4.8 "Deployer states").

pub mod config;
pub mod context;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

use crate::cancel::CancellationToken;
use crate::error::{KilnError, Result};
use crate::graph::DependencyGraph;
use crate::plugin::auditor::Auditor;
use crate::plugin::registry::PluginRegistry;
use crate::target::Target;
use crate::tree::Tree;

use config::DeployConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeployerState {
    Initial,
    Finalized,
}

/// `INITIAL → FINALIZED` (spec §4.8 "Deployer states"). `finalize` and
/// `execute` are programming errors outside their documented state.
pub struct Deployer {
    config: DeployConfig,
    state: DeployerState,
}

impl Deployer {
    pub fn new(config: DeployConfig) -> Self {
        Self { config, state: DeployerState::Initial }
    }

    /// Submits `deployConfig.getAuditOrders()` to the auditor. Per the
    /// simplification recorded in DESIGN.md, the Kernel runs a single
    /// `auditor.audit()` pass covering both the Builder's and the
    /// Deployer's orders together, so this method only enqueues and
    /// transitions state — it does not itself await audit completion.
    pub fn finalize(&mut self, auditor: &mut Auditor) -> Result<()> {
        if self.state != DeployerState::Initial {
            return Err(KilnError::StateViolation("Deployer::finalize called outside INITIAL".to_string()));
        }
        auditor.add_orders(self.config.get_audit_orders());
        self.state = DeployerState::Finalized;
        Ok(())
    }

    /// Constructs a fresh DeployContext over `output_targets` and drives
    /// `deployConfig.execute(context)` (spec §4.8 `execute(builder)`).
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        deploy_path: PathBuf,
        output_targets: Vec<Target>,
        graph: Arc<Mutex<DependencyGraph>>,
        prev_graph: Arc<DependencyGraph>,
        tree: Arc<AsyncMutex<dyn Tree>>,
        registry: Arc<PluginRegistry>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if self.state != DeployerState::Finalized {
            return Err(KilnError::StateViolation("Deployer::execute called before finalize".to_string()));
        }
        let mut context =
            context::DeployContext::new(deploy_path, output_targets, graph, prev_graph, tree, registry, cancel);
        context.set_targets_deploy_path(false);
        self.config.execute(&mut context, false).await
    }
}
