//! Volume trim

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{FleetOperation, FleetOptions};
use crate::cluster::ClusterApi;
use crate::consts;
use crate::descriptor::AgentVolume;
use crate::error::{CleanupError, FleetError, Result};
use crate::session::Session;
use crate::supervisor::{Condition, PatienceBudget};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimVolumeOptions {
    pub volume_name: String,
    pub longhorn_namespace: String,
}

impl Default for TrimVolumeOptions {
    fn default() -> Self {
        Self {
            volume_name: String::new(),
            longhorn_namespace: consts::DEFAULT_LONGHORN_NAMESPACE.to_string(),
        }
    }
}

impl TrimVolumeOptions {
    pub fn validate(&self) -> Result<()> {
        if self.longhorn_namespace.is_empty() {
            return Err(FleetError::config(
                "Longhorn namespace (--longhorn-namespace) is required",
            ));
        }
        if self.volume_name.is_empty() {
            return Err(FleetError::config("Longhorn volume name (--name) is required"));
        }
        Ok(())
    }
}

/// `trim volume`
///
/// Runs in the Longhorn namespace under the Longhorn service account so
/// the agent can reach the volume's engine.
pub struct VolumeTrimmer {
    session: Session,
    volume_name: String,
}

impl VolumeTrimmer {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        fleet: &FleetOptions,
        options: &TrimVolumeOptions,
    ) -> Result<Self> {
        options.validate()?;

        let descriptor = fleet
            .descriptor(consts::APP_VOLUME_TRIMMER)
            .namespace(options.longhorn_namespace.as_str())
            .command([consts::CMD_LOCAL_AGENT, consts::SUBCMD_TRIM, consts::SUBCMD_VOLUME])
            .env(consts::ENV_LOG_LEVEL, fleet.log_level.as_str())
            .env(consts::ENV_VOLUME_NAME, options.volume_name.as_str())
            .env(consts::ENV_LONGHORN_NAMESPACE, options.longhorn_namespace.as_str())
            .node_identity()
            .volume(AgentVolume::host(false))
            .privileged(true)
            .service_account(consts::LONGHORN_SERVICE_ACCOUNT)
            .run_to_completion(false)
            .build()?;

        let session = Session::new(cluster, descriptor)
            .with_patience(PatienceBudget::medium())
            .with_monitor_config(fleet.monitor.clone());

        Ok(Self {
            session,
            volume_name: options.volume_name.clone(),
        })
    }
}

#[async_trait]
impl FleetOperation for VolumeTrimmer {
    type Output = ();

    fn name(&self) -> &str {
        consts::APP_VOLUME_TRIMMER
    }

    fn is_long_running(&self) -> bool {
        false
    }

    async fn prepare(&mut self) -> Result<()> {
        self.session.remove_stale().await
    }

    async fn run(&mut self) -> Result<()> {
        self.session.start().await?;
        self.session.wait_for_work(Condition::ContainersExited).await?;
        info!(volume = %self.volume_name, "Trimmed volume filesystem");
        Ok(())
    }

    async fn cleanup(&mut self) -> std::result::Result<(), CleanupError> {
        self.session.cleanup().await
    }
}
