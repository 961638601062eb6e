//! Preflight check and install
//!
//! Both run the local agent on every selected node to inspect or prepare it
//! for Longhorn. The check and the package-manager install report per-node
//! messages. On Container-Optimized OS the install runs a long-lived node
//! agent instead, since iscsid has to keep running in a container there.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{FleetOperation, FleetOptions};
use crate::access::AccessRule;
use crate::cleaner::SessionResources;
use crate::cluster::ClusterApi;
use crate::collector::CollectOptions;
use crate::consts;
use crate::descriptor::{AgentVolume, LongRunningSpec, ProbeSpec};
use crate::error::{CleanupError, Result};
use crate::models::{LogCollection, NodeCollection, NodeResult};
use crate::report::{aggregate, ClusterReport};
use crate::session::Session;
use crate::supervisor::{Condition, PatienceBudget};

const COS_ENTRYPOINT: &str = include_str!("../../scripts/cos-node-agent.sh");
const COS_KUBERNETES_ROOTFS: &str = "/home/kubernetes/containerized_mounter/rootfs";
const COS_PROBE: &str = "nsenter --mount=${HOST_MOUNT_DIR}/proc/1/ns/mnt pgrep -x iscsid && nsenter --mount=${HOST_MOUNT_DIR}/proc/1/ns/mnt lsmod | grep -q iscsi_tcp";
const COS_PROBE_DELAY_SECONDS: i32 = 30;

/// Per-node preflight messages keyed by node name
pub type PreflightReport = ClusterReport<LogCollection>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOptions {
    pub enable_spdk: bool,
    /// Huge page size in MiB
    pub huge_page_size: u32,
    pub userspace_driver: String,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            enable_spdk: false,
            huge_page_size: 1024,
            userspace_driver: "uio_pci_generic".to_string(),
        }
    }
}

/// How node dependencies get installed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OperatingSystem {
    /// The node's own package manager
    #[default]
    PackageManager,
    /// Google Container-Optimized OS
    ContainerOptimized,
}

impl OperatingSystem {
    /// `cos` selects Container-Optimized OS, anything else the package
    /// manager
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "cos" => Self::ContainerOptimized,
            _ => Self::PackageManager,
        }
    }

    fn app_name(self) -> &'static str {
        match self {
            Self::PackageManager => consts::APP_PREFLIGHT_INSTALLER,
            Self::ContainerOptimized => consts::APP_PREFLIGHT_COS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    pub operating_system: OperatingSystem,
    pub update_packages: bool,
    pub enable_spdk: bool,
    pub spdk_options: String,
    /// Huge page size in MiB
    pub huge_page_size: u32,
    pub allow_pci: String,
    pub driver_override: String,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            operating_system: OperatingSystem::PackageManager,
            update_packages: true,
            enable_spdk: false,
            spdk_options: String::new(),
            huge_page_size: 2048,
            allow_pci: "none".to_string(),
            driver_override: "uio_pci_generic".to_string(),
        }
    }
}

fn checker_access_rules() -> Vec<AccessRule> {
    vec![
        AccessRule::new("apps", &["daemonsets", "deployments"], &["get", "list"]),
        AccessRule::new("", &["nodes", "nodes/status"], &["get"]),
    ]
}

fn merge_node_logs(report: &mut PreflightReport, result: &NodeResult, payload: NodeCollection) {
    if let Some(log) = payload.log {
        report.push(result.node_name.clone(), log);
    }
}

/// Wait for the work and output phases, then aggregate the node documents
async fn collect_node_logs(session: &Session) -> Result<PreflightReport> {
    session.wait_for_work(Condition::ContainersExited).await?;
    session
        .wait_for(
            consts::CONTAINER_OUTPUT,
            Condition::ContainersExited,
            PatienceBudget::short(),
        )
        .await?;

    let results = session
        .collect(consts::CONTAINER_OUTPUT, &CollectOptions::default())
        .await?;
    aggregate(&results, merge_node_logs)
}

/// `check preflight`
pub struct PreflightChecker {
    session: Session,
}

impl PreflightChecker {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        fleet: &FleetOptions,
        options: &CheckOptions,
    ) -> Result<Self> {
        let descriptor = fleet
            .descriptor(consts::APP_PREFLIGHT_CHECKER)
            .command([consts::CMD_LOCAL_AGENT, consts::SUBCMD_CHECK, consts::SUBCMD_PREFLIGHT])
            .env(consts::ENV_LOG_LEVEL, fleet.log_level.as_str())
            .env(consts::ENV_OUTPUT_FILE_PATH, consts::output_file_path())
            .env(consts::ENV_ENABLE_SPDK, options.enable_spdk.to_string())
            .env(consts::ENV_HUGE_PAGE_SIZE, options.huge_page_size.to_string())
            .env(consts::ENV_UIO_DRIVER, options.userspace_driver.as_str())
            .node_identity()
            .volume(AgentVolume::host(true))
            .volume(AgentVolume::shared())
            .privileged(true)
            .host_pid(true)
            .service_account(consts::APP_PREFLIGHT_CHECKER)
            .run_to_completion(true)
            .build()?;

        let session = Session::new(cluster, descriptor)
            .with_access(checker_access_rules())
            .with_patience(PatienceBudget::medium())
            .with_monitor_config(fleet.monitor.clone());

        Ok(Self { session })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

#[async_trait]
impl FleetOperation for PreflightChecker {
    type Output = PreflightReport;

    fn name(&self) -> &str {
        consts::APP_PREFLIGHT_CHECKER
    }

    fn is_long_running(&self) -> bool {
        false
    }

    async fn prepare(&mut self) -> Result<()> {
        self.session.remove_stale().await
    }

    async fn run(&mut self) -> Result<PreflightReport> {
        self.session.start().await?;
        collect_node_logs(&self.session).await
    }

    async fn cleanup(&mut self) -> std::result::Result<(), CleanupError> {
        self.session.cleanup().await
    }
}

/// `install preflight`
pub struct PreflightInstaller {
    session: Session,
    operating_system: OperatingSystem,
}

impl PreflightInstaller {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        fleet: &FleetOptions,
        options: &InstallOptions,
    ) -> Result<Self> {
        let operating_system = options.operating_system;
        let builder = fleet.descriptor(operating_system.app_name());

        let (builder, patience) = match operating_system {
            OperatingSystem::PackageManager => {
                let builder = builder
                    .command([consts::CMD_LOCAL_AGENT, consts::SUBCMD_INSTALL, consts::SUBCMD_PREFLIGHT])
                    .env(consts::ENV_LOG_LEVEL, fleet.log_level.as_str())
                    .env(consts::ENV_OUTPUT_FILE_PATH, consts::output_file_path())
                    .env(consts::ENV_UPDATE_PACKAGE_LIST, options.update_packages.to_string())
                    .env(consts::ENV_ENABLE_SPDK, options.enable_spdk.to_string())
                    .env(consts::ENV_SPDK_OPTIONS, options.spdk_options.as_str())
                    .env(consts::ENV_HUGE_PAGE_SIZE, options.huge_page_size.to_string())
                    .env(consts::ENV_PCI_ALLOWED, options.allow_pci.as_str())
                    .env(consts::ENV_DRIVER_OVERRIDE, options.driver_override.as_str())
                    .volume(AgentVolume::host(false))
                    .volume(AgentVolume::shared())
                    .host_pid(true)
                    .run_to_completion(true);
                (builder, PatienceBudget::long())
            }
            OperatingSystem::ContainerOptimized => {
                let entrypoint = format!("{}/{}", consts::VOLUME_ENTRYPOINT_DIR, consts::FILE_ENTRYPOINT);
                let builder = builder
                    .image(consts::IMAGE_BCI_BASE)
                    .command([entrypoint])
                    .env("HOST_MOUNT_DIR", consts::VOLUME_HOST_DIR)
                    .env("KUBERNETES_ROOTFS", COS_KUBERNETES_ROOTFS)
                    .env("LONGHORN_DATA_PATHS", consts::DEFAULT_DATA_DIRECTORY)
                    .volume(AgentVolume::host(false))
                    .volume(AgentVolume::entrypoint())
                    .entrypoint_script(COS_ENTRYPOINT)
                    .long_running(LongRunningSpec {
                        container: consts::CONTAINER_COS_AGENT.to_string(),
                        readiness_probe: Some(ProbeSpec::bash(COS_PROBE, COS_PROBE_DELAY_SECONDS)),
                        liveness_probe: Some(ProbeSpec::bash(COS_PROBE, COS_PROBE_DELAY_SECONDS)),
                        capabilities: vec!["SYS_MODULE".to_string()],
                        ..Default::default()
                    });
                (builder, PatienceBudget::short())
            }
        };

        let descriptor = builder.privileged(true).host_network(true).build()?;
        let session = Session::new(cluster, descriptor)
            .with_patience(patience)
            .with_monitor_config(fleet.monitor.clone());

        Ok(Self {
            session,
            operating_system,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Objects left running by a Container-Optimized OS install
    pub fn stop_resources(namespace: &str, operating_system: OperatingSystem) -> SessionResources {
        let resources = SessionResources::new(namespace, operating_system.app_name());
        match operating_system {
            OperatingSystem::ContainerOptimized => resources.with_config_map(),
            OperatingSystem::PackageManager => resources,
        }
    }
}

#[async_trait]
impl FleetOperation for PreflightInstaller {
    type Output = PreflightReport;

    fn name(&self) -> &str {
        self.operating_system.app_name()
    }

    fn is_long_running(&self) -> bool {
        self.operating_system == OperatingSystem::ContainerOptimized
    }

    async fn prepare(&mut self) -> Result<()> {
        match self.operating_system {
            OperatingSystem::PackageManager => self.session.remove_stale().await,
            OperatingSystem::ContainerOptimized => self.session.ensure_absent().await,
        }
    }

    async fn run(&mut self) -> Result<PreflightReport> {
        match self.operating_system {
            OperatingSystem::PackageManager => {
                info!("Installing dependencies with package manager");
                self.session.start().await?;
                let report = collect_node_logs(&self.session).await?;
                info!("Installed dependencies with package manager");
                Ok(report)
            }
            OperatingSystem::ContainerOptimized => {
                info!("Installing dependencies on Container Optimized OS");
                self.session.start().await?;
                self.session.wait_for_work(Condition::ContainersReady).await?;
                info!("Installed dependencies on Container Optimized OS");
                Ok(PreflightReport::new())
            }
        }
    }

    async fn cleanup(&mut self) -> std::result::Result<(), CleanupError> {
        self.session.cleanup().await
    }
}
