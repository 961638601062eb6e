//! Longhorn fleet CLI
//!
//! Runs Longhorn node agents across the cluster as DaemonSets to check and
//! prepare nodes, inspect and export replicas, and trim volumes.

mod commands;
mod config;
mod output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fleet_lib::operations::{
    CheckOptions, ExportReplicaOptions, GetReplicaOptions, InstallOptions, OperatingSystem,
    TrimVolumeOptions,
};
use fleet_lib::{consts, parse_node_selector, FleetOptions};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use commands::{preflight, replica, volume, Fleet};
use config::{LogLevel, Settings};
use output::OutputFormat;

/// Longhorn fleet CLI
#[derive(Parser)]
#[command(name = "longhornctl")]
#[command(author, version, about = "CLI for running Longhorn node agents across a cluster", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options inherited by every subcommand
#[derive(Args)]
pub struct GlobalArgs {
    /// Log level (RUST_LOG overrides it)
    #[arg(long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Log format
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Report format
    #[arg(long, global = true, value_enum, default_value = "yaml")]
    pub output_format: OutputFormat,

    /// Path to kubeconfig file (uses default if not specified)
    #[arg(long, global = true, env = "KUBECONFIG")]
    pub kube_config: Option<PathBuf>,

    /// Image for the node agents
    #[arg(long, global = true)]
    pub image: Option<String>,

    /// Registry that replaces the registry of every agent image
    #[arg(long, global = true)]
    pub image_registry: Option<String>,

    /// Image pull secret for the node agents
    #[arg(long, global = true)]
    pub image_pull_secret: Option<String>,

    /// Comma-separated key=value pairs selecting the nodes to run on
    #[arg(long, global = true, default_value = "")]
    pub node_selector: String,

    /// Namespace for the agent workloads
    #[arg(long, global = true)]
    pub namespace: Option<String>,

    /// Defaults file (uses ~/.config/longhornctl/config.* if not specified)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines (default)
    #[default]
    Text,
    /// JSON lines
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check Longhorn resources
    #[command(subcommand)]
    Check(CheckCommands),

    /// Install Longhorn resources
    #[command(subcommand)]
    Install(InstallCommands),

    /// Get Longhorn resources
    #[command(subcommand)]
    Get(GetCommands),

    /// Export Longhorn resources
    #[command(subcommand)]
    Export(ExportCommands),

    /// Trim Longhorn resources
    #[command(subcommand)]
    Trim(TrimCommands),

    /// Print the version
    Version,
}

#[derive(Subcommand)]
pub enum CheckCommands {
    /// Check node readiness for Longhorn
    Preflight(CheckPreflightArgs),
}

#[derive(Subcommand)]
pub enum InstallCommands {
    /// Install Longhorn dependencies on the nodes
    Preflight(InstallPreflightCommand),
}

#[derive(Subcommand)]
pub enum GetCommands {
    /// Get replica data directories on the nodes
    Replica(GetReplicaArgs),
}

#[derive(Subcommand)]
pub enum ExportCommands {
    /// Export a replica to a directory on its host
    Replica(ExportReplicaCommand),
}

#[derive(Subcommand)]
pub enum TrimCommands {
    /// Trim the filesystem of a Longhorn volume
    Volume(TrimVolumeArgs),
}

#[derive(Subcommand)]
pub enum StopCommand {
    /// Remove the agents left running
    Stop,
}

#[derive(Args)]
pub struct CheckPreflightArgs {
    /// Check SPDK required packages, modules, and setup
    #[arg(long)]
    pub enable_spdk: bool,

    /// Huge page size in MiB for SPDK
    #[arg(long, default_value_t = 1024)]
    pub huge_page_size: u32,

    /// User space I/O driver for SPDK
    #[arg(long, default_value = "uio_pci_generic")]
    pub userspace_driver: String,
}

impl From<CheckPreflightArgs> for CheckOptions {
    fn from(args: CheckPreflightArgs) -> Self {
        Self {
            enable_spdk: args.enable_spdk,
            huge_page_size: args.huge_page_size,
            userspace_driver: args.userspace_driver,
        }
    }
}

#[derive(Args)]
pub struct InstallPreflightCommand {
    #[command(flatten)]
    pub args: InstallPreflightArgs,

    #[command(subcommand)]
    pub action: Option<StopCommand>,
}

#[derive(Args)]
pub struct InstallPreflightArgs {
    /// Operating system ("", cos); empty uses the node's package manager
    #[arg(long, default_value = "")]
    pub operating_system: String,

    /// Update packages before installing dependencies
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub update_packages: bool,

    /// Install SPDK required packages, modules, and setup
    #[arg(long)]
    pub enable_spdk: bool,

    /// Comma-separated custom options for the SPDK environment
    #[arg(long, default_value = "")]
    pub spdk_options: String,

    /// Huge page size in MiB for SPDK
    #[arg(long, default_value_t = 2048)]
    pub huge_page_size: u32,

    /// Comma-separated allowed PCI devices; all are blocked by default
    #[arg(long, default_value = "none")]
    pub allow_pci: String,

    /// User space driver overriding the default driver for PCI devices
    #[arg(long, default_value = "uio_pci_generic")]
    pub driver_override: String,
}

impl From<InstallPreflightArgs> for InstallOptions {
    fn from(args: InstallPreflightArgs) -> Self {
        Self {
            operating_system: OperatingSystem::from_name(&args.operating_system),
            update_packages: args.update_packages,
            enable_spdk: args.enable_spdk,
            spdk_options: args.spdk_options,
            huge_page_size: args.huge_page_size,
            allow_pci: args.allow_pci,
            driver_override: args.driver_override,
        }
    }
}

#[derive(Args)]
pub struct GetReplicaArgs {
    /// Replica data directory name; all replicas if not specified
    #[arg(long, default_value = "")]
    pub name: String,

    /// Volume whose replicas to list
    #[arg(long, default_value = "")]
    pub volume_name: String,

    /// Longhorn data directory
    #[arg(long, default_value = consts::DEFAULT_DATA_DIRECTORY)]
    pub data_dir: String,

    /// Write the report to this file instead of stdout
    #[arg(long)]
    pub output_file: Option<PathBuf>,
}

impl GetReplicaArgs {
    fn options(&self) -> GetReplicaOptions {
        GetReplicaOptions {
            replica_name: self.name.clone(),
            volume_name: self.volume_name.clone(),
            data_directory: self.data_dir.clone(),
        }
    }
}

#[derive(Args)]
pub struct ExportReplicaCommand {
    #[command(flatten)]
    pub args: ExportReplicaArgs,

    #[command(subcommand)]
    pub action: Option<StopCommand>,
}

#[derive(Args)]
pub struct ExportReplicaArgs {
    /// Replica data directory name to export (see 'longhornctl get replica')
    #[arg(long, default_value = "")]
    pub name: String,

    /// Engine image used to serve the replica
    #[arg(long, default_value = consts::IMAGE_ENGINE)]
    pub engine_image: String,

    /// Directory on the host where the exported data is mounted
    #[arg(long, default_value = "")]
    pub target_dir: String,

    /// Longhorn data directory
    #[arg(long, default_value = consts::DEFAULT_DATA_DIRECTORY)]
    pub data_dir: String,

    /// Write the report to this file instead of stdout
    #[arg(long)]
    pub output_file: Option<PathBuf>,
}

impl ExportReplicaArgs {
    fn options(&self) -> ExportReplicaOptions {
        ExportReplicaOptions {
            replica_name: self.name.clone(),
            engine_image: self.engine_image.clone(),
            target_dir: self.target_dir.clone(),
            data_directory: self.data_dir.clone(),
        }
    }
}

#[derive(Args)]
pub struct TrimVolumeArgs {
    /// Name of the Longhorn volume to trim
    #[arg(long, default_value = "")]
    pub name: String,

    /// Namespace where Longhorn is deployed
    #[arg(long, default_value = consts::DEFAULT_LONGHORN_NAMESPACE)]
    pub longhorn_namespace: String,
}

impl From<TrimVolumeArgs> for TrimVolumeOptions {
    fn from(args: TrimVolumeArgs) -> Self {
        Self {
            volume_name: args.name,
            longhorn_namespace: args.longhorn_namespace,
        }
    }
}

fn init_tracing(level: LogLevel, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

/// Resolve flags over the defaults file over the built-in defaults
fn fleet_options(global: &GlobalArgs, settings: Settings, log_level: LogLevel) -> Result<FleetOptions> {
    let defaults = FleetOptions::default();
    let node_selector =
        parse_node_selector(&global.node_selector).context("Invalid node selector")?;

    Ok(FleetOptions {
        namespace: global
            .namespace
            .clone()
            .or(settings.namespace)
            .unwrap_or(defaults.namespace),
        log_level: log_level.as_str().to_string(),
        image: global.image.clone().or(settings.image).unwrap_or(defaults.image),
        image_registry: global
            .image_registry
            .clone()
            .or(settings.image_registry)
            .unwrap_or(defaults.image_registry),
        image_pull_secret: global
            .image_pull_secret
            .clone()
            .or(settings.image_pull_secret)
            .filter(|secret| !secret.is_empty()),
        node_selector,
        monitor: defaults.monitor,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("{} v{}", consts::CMD_REMOTE, env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let settings = Settings::load(cli.global.config.as_deref())?;
    let log_level = match cli.global.log_level {
        Some(level) => level,
        None => settings.log_level()?.unwrap_or_default(),
    };
    init_tracing(log_level, cli.global.log_format);

    let options = fleet_options(&cli.global, settings, log_level)?;
    let fleet = Fleet::new(options, cli.global.output_format, cli.global.kube_config.clone());

    let result = match cli.command {
        Commands::Check(CheckCommands::Preflight(args)) => {
            preflight::check(&fleet, args.into()).await
        }
        Commands::Install(InstallCommands::Preflight(cmd)) => match cmd.action {
            Some(StopCommand::Stop) => {
                let operating_system = OperatingSystem::from_name(&cmd.args.operating_system);
                preflight::stop_install(&fleet, operating_system).await
            }
            None => preflight::install(&fleet, cmd.args.into()).await,
        },
        Commands::Get(GetCommands::Replica(args)) => {
            replica::get(&fleet, args.options(), args.output_file.as_deref()).await
        }
        Commands::Export(ExportCommands::Replica(cmd)) => match cmd.action {
            Some(StopCommand::Stop) => replica::stop_export(&fleet).await,
            None => {
                replica::export(&fleet, cmd.args.options(), cmd.args.output_file.as_deref()).await
            }
        },
        Commands::Trim(TrimCommands::Volume(args)) => volume::trim(&fleet, args.into()).await,
        Commands::Version => Ok(()),
    };

    if let Err(e) = result {
        output::print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("longhornctl").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags_override_settings() {
        let cli = parse(&["--image", "example.com/cli:dev", "check", "preflight"]);
        let settings = Settings {
            image: Some("example.com/cli:config".to_string()),
            namespace: Some("longhorn-ops".to_string()),
            image_pull_secret: Some(String::new()),
            ..Default::default()
        };

        let options = fleet_options(&cli.global, settings, LogLevel::Debug).unwrap();

        assert_eq!(options.image, "example.com/cli:dev");
        assert_eq!(options.namespace, "longhorn-ops");
        assert_eq!(options.image_pull_secret, None);
        assert_eq!(options.log_level, "debug");
    }

    #[test]
    fn test_builtin_defaults() {
        let cli = parse(&["check", "preflight"]);
        let options = fleet_options(&cli.global, Settings::default(), LogLevel::Info).unwrap();

        assert_eq!(options.namespace, consts::DEFAULT_NAMESPACE);
        assert_eq!(options.image, consts::IMAGE_CLI);
        assert!(options.node_selector.is_empty());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = parse(&["get", "replica", "--node-selector", "disk=ssd,zone=a"]);
        let options = fleet_options(&cli.global, Settings::default(), LogLevel::Info).unwrap();

        assert_eq!(options.node_selector.get("disk").map(String::as_str), Some("ssd"));
        assert_eq!(options.node_selector.get("zone").map(String::as_str), Some("a"));
    }

    #[test]
    fn test_install_options_from_flags() {
        let cli = parse(&[
            "install",
            "preflight",
            "--operating-system",
            "cos",
            "--update-packages",
            "false",
        ]);
        let Commands::Install(InstallCommands::Preflight(cmd)) = cli.command else {
            panic!("expected install preflight");
        };
        assert!(cmd.action.is_none());

        let options: InstallOptions = cmd.args.into();
        assert_eq!(options.operating_system, OperatingSystem::ContainerOptimized);
        assert!(!options.update_packages);
        assert_eq!(options.huge_page_size, 2048);
    }

    #[test]
    fn test_export_stop_accepts_parent_options() {
        let cli = parse(&[
            "export",
            "replica",
            "--name",
            "pvc-48a6457d-585e-423b-b530-bbc68a5f948a-0e2603a7",
            "--target-dir",
            "/tmp/export",
            "stop",
        ]);
        let Commands::Export(ExportCommands::Replica(cmd)) = cli.command else {
            panic!("expected export replica");
        };
        assert!(matches!(cmd.action, Some(StopCommand::Stop)));
    }
}
