//! Fleet operations
//!
//! Each operation owns one [`Session`](crate::session::Session) and walks it
//! through `prepare` → `run` → `cleanup`. Run-to-completion operations are
//! always cleaned up. Long-running operations stay up after a successful run
//! until they are stopped.

pub mod preflight;
pub mod replica;
pub mod volume;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::cleaner::{LifecycleCleaner, SessionResources};
use crate::cluster::ClusterApi;
use crate::consts;
use crate::descriptor::AgentDescriptorBuilder;
use crate::error::{CleanupError, Result};
use crate::supervisor::MonitorConfig;

pub use preflight::{
    CheckOptions, InstallOptions, OperatingSystem, PreflightChecker, PreflightInstaller,
    PreflightReport,
};
pub use replica::{
    volume_name_from_replica_dir, ExportReplicaOptions, GetReplicaOptions, ReplicaExporter,
    ReplicaGetter,
};
pub use volume::{TrimVolumeOptions, VolumeTrimmer};

/// Options shared by every fleet command
#[derive(Debug, Clone)]
pub struct FleetOptions {
    /// Namespace of the session objects
    pub namespace: String,
    pub log_level: String,
    pub image: String,
    pub image_registry: String,
    pub image_pull_secret: Option<String>,
    pub node_selector: BTreeMap<String, String>,
    pub monitor: MonitorConfig,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            namespace: consts::DEFAULT_NAMESPACE.to_string(),
            log_level: "info".to_string(),
            image: consts::IMAGE_CLI.to_string(),
            image_registry: String::new(),
            image_pull_secret: None,
            node_selector: BTreeMap::new(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl FleetOptions {
    /// Descriptor builder carrying the namespace, image and scheduling
    /// options
    pub(crate) fn descriptor(&self, name: &str) -> AgentDescriptorBuilder {
        AgentDescriptorBuilder::new(name)
            .namespace(self.namespace.clone())
            .image(self.image.clone())
            .image_registry(self.image_registry.clone())
            .image_pull_secret(self.image_pull_secret.clone())
            .node_selector(self.node_selector.clone())
    }
}

#[async_trait]
pub trait FleetOperation: Send {
    type Output: Send;

    /// Name of the session workload
    fn name(&self) -> &str;

    /// Whether the workload is meant to outlive a successful run
    fn is_long_running(&self) -> bool;

    async fn prepare(&mut self) -> Result<()>;

    async fn run(&mut self) -> Result<Self::Output>;

    async fn cleanup(&mut self) -> std::result::Result<(), CleanupError>;
}

/// Result of a completed operation
#[derive(Debug)]
pub struct Execution<T> {
    pub output: T,
    /// Cleanup failure after a successful run; never changes the verdict
    pub cleanup_error: Option<CleanupError>,
}

/// Run an operation to its verdict
///
/// A cleanup failure after a failed run is logged and the run failure is
/// returned.
pub async fn execute<O: FleetOperation>(operation: &mut O) -> Result<Execution<O::Output>> {
    info!(operation = operation.name(), "Starting");

    operation.prepare().await?;

    let outcome = operation.run().await;
    let needs_cleanup = outcome.is_err() || !operation.is_long_running();
    let cleanup_error = if needs_cleanup {
        operation.cleanup().await.err()
    } else {
        None
    };

    match outcome {
        Ok(output) => {
            info!(operation = operation.name(), "Completed");
            Ok(Execution {
                output,
                cleanup_error,
            })
        }
        Err(e) => {
            if let Some(cleanup_error) = cleanup_error {
                warn!(operation = operation.name(), error = %cleanup_error, "Cleanup after failure was incomplete");
            }
            Err(e)
        }
    }
}

/// Remove the objects a long-running operation left behind
pub async fn stop(
    cluster: Arc<dyn ClusterApi>,
    resources: &SessionResources,
) -> std::result::Result<(), CleanupError> {
    LifecycleCleaner::new(cluster).clean(resources).await
}
