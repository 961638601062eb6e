//! Volume commands

use anyhow::{Context, Result};
use fleet_lib::operations::{TrimVolumeOptions, VolumeTrimmer};
use tracing::info;

use super::{run, Fleet};
use crate::output;

/// `trim volume`
pub async fn trim(fleet: &Fleet, options: TrimVolumeOptions) -> Result<()> {
    options.validate()?;

    info!(volume = %options.volume_name, "Initializing volume trimmer");
    let cluster = fleet.cluster().await?;
    let mut trimmer = VolumeTrimmer::new(cluster, &fleet.options, &options)
        .with_context(|| format!("Failed to initialize volume trimmer for volume {}", options.volume_name))?;

    info!(volume = %options.volume_name, "Running volume trimmer");
    run(&mut trimmer, "volume trimmer")
        .await
        .with_context(|| format!("Failed to trim volume {}", options.volume_name))?;

    output::print_success(&format!("Completed volume trimmer for volume {}", options.volume_name));
    Ok(())
}
