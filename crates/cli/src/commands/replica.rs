//! Replica commands

use std::path::Path;

use anyhow::{Context, Result};
use fleet_lib::consts;
use fleet_lib::operations::{
    stop, volume_name_from_replica_dir, ExportReplicaOptions, GetReplicaOptions, ReplicaExporter,
    ReplicaGetter,
};
use tracing::info;

use super::{run, Fleet};
use crate::output;

/// `get replica`
pub async fn get(fleet: &Fleet, options: GetReplicaOptions, output_file: Option<&Path>) -> Result<()> {
    info!("Initializing replica getter");
    let cluster = fleet.cluster().await?;
    let mut getter = ReplicaGetter::new(cluster, &fleet.options, &options)
        .context("Failed to initialize replica getter")?;

    info!("Running replica getter");
    let collection = run(&mut getter, "replica getter").await?;

    info!(replicas = collection.replicas.len(), "Retrieved replica information");
    output::write_report(&collection, fleet.format, output_file)?;

    info!("Completed replica getter");
    Ok(())
}

/// `export replica`
///
/// Options are checked before connecting so a bad invocation fails fast.
pub async fn export(
    fleet: &Fleet,
    options: ExportReplicaOptions,
    output_file: Option<&Path>,
) -> Result<()> {
    options.validate()?;
    let volume = volume_name_from_replica_dir(&options.replica_name)?;

    info!(volume = %volume, "Initializing replica exporter");
    let cluster = fleet.cluster().await?;
    let mut exporter = ReplicaExporter::new(cluster, &fleet.options, &options)
        .context("Failed to initialize replica exporter")?;

    info!("Running replica exporter");
    let collection = run(&mut exporter, "replica exporter").await?;

    info!(volume = exporter.volume_name(), "Exported replica");
    output::write_report(&collection, fleet.format, output_file)?;

    output::print_info(&format!(
        "Completed replica exporter. Use '{} {} {} {}' to stop exporting replica.",
        consts::CMD_REMOTE,
        consts::SUBCMD_EXPORT,
        consts::SUBCMD_REPLICA,
        consts::SUBCMD_STOP
    ));
    Ok(())
}

/// `export replica stop`
pub async fn stop_export(fleet: &Fleet) -> Result<()> {
    info!("Stopping replica exporter");
    let cluster = fleet.cluster().await?;

    stop(cluster, &ReplicaExporter::stop_resources())
        .await
        .context("Failed to stop replica exporter")?;

    output::print_success("Successfully stopped exporting replica");
    Ok(())
}
