//! Command implementations

pub mod preflight;
pub mod replica;
pub mod volume;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_lib::{execute, ClusterApi, Execution, FleetOperation, FleetOptions, KubeCluster};

use crate::config;
use crate::output::{self, OutputFormat};

/// Options and connection settings shared by every fleet command
pub struct Fleet {
    pub options: FleetOptions,
    pub format: OutputFormat,
    kube_config: Option<PathBuf>,
}

impl Fleet {
    pub fn new(options: FleetOptions, format: OutputFormat, kube_config: Option<PathBuf>) -> Self {
        Self {
            options,
            format,
            kube_config,
        }
    }

    /// Connect to the cluster
    pub async fn cluster(&self) -> Result<Arc<dyn ClusterApi>> {
        let client = config::kube_client(self.kube_config.as_deref()).await?;
        Ok(Arc::new(KubeCluster::new(client)))
    }
}

/// Run an operation to its verdict
///
/// Incomplete cleanup after a successful run is reported as a warning.
async fn run<O: FleetOperation>(operation: &mut O, label: &str) -> Result<O::Output> {
    let Execution {
        output,
        cleanup_error,
    } = execute(operation)
        .await
        .with_context(|| format!("Failed to run {label}"))?;

    if let Some(cleanup_error) = cleanup_error {
        output::print_warning(&format!("Failed to clean up {label}: {cleanup_error}"));
    }
    Ok(output)
}
