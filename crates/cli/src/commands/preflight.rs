//! Preflight commands

use anyhow::{Context, Result};
use fleet_lib::consts;
use fleet_lib::operations::{
    stop, CheckOptions, InstallOptions, OperatingSystem, PreflightChecker, PreflightInstaller,
};
use tracing::info;

use super::{run, Fleet};
use crate::output;

/// `check preflight`
pub async fn check(fleet: &Fleet, options: CheckOptions) -> Result<()> {
    info!("Initializing preflight checker");
    let cluster = fleet.cluster().await?;
    let mut checker = PreflightChecker::new(cluster, &fleet.options, &options)
        .context("Failed to initialize preflight checker")?;

    info!("Running preflight checker");
    let report = run(&mut checker, "preflight checker").await?;

    info!(nodes = report.len(), "Retrieved preflight checker result");
    output::write_report(&report, fleet.format, None)?;

    info!("Completed preflight checker");
    Ok(())
}

/// `install preflight`
pub async fn install(fleet: &Fleet, options: InstallOptions) -> Result<()> {
    info!(operating_system = ?options.operating_system, "Initializing preflight installer");
    let cluster = fleet.cluster().await?;
    let mut installer = PreflightInstaller::new(cluster, &fleet.options, &options)
        .context("Failed to initialize preflight installer")?;

    info!("Running preflight installer");
    let report = run(&mut installer, "preflight installer").await?;

    match options.operating_system {
        OperatingSystem::PackageManager => {
            output::write_report(&report, fleet.format, None)?;
            info!("Completed preflight installer");
        }
        OperatingSystem::ContainerOptimized => {
            info!("Preflight node agent is running");
        }
    }

    output::print_info(&format!(
        "Completed preflight installer. Use '{} {} {}' to check the result.",
        consts::CMD_REMOTE,
        consts::SUBCMD_CHECK,
        consts::SUBCMD_PREFLIGHT
    ));
    if options.operating_system == OperatingSystem::ContainerOptimized {
        output::print_info(&format!(
            "The node agent keeps running. Use '{} {} {} --operating-system cos {}' to remove it.",
            consts::CMD_REMOTE,
            consts::SUBCMD_INSTALL,
            consts::SUBCMD_PREFLIGHT,
            consts::SUBCMD_STOP
        ));
    }
    Ok(())
}

/// `install preflight stop`
pub async fn stop_install(fleet: &Fleet, operating_system: OperatingSystem) -> Result<()> {
    info!("Stopping preflight installer");
    let cluster = fleet.cluster().await?;
    let resources = PreflightInstaller::stop_resources(&fleet.options.namespace, operating_system);

    stop(cluster, &resources)
        .await
        .context("Failed to stop preflight installer")?;

    output::print_success("Successfully stopped preflight installer");
    Ok(())
}
