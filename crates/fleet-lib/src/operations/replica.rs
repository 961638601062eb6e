//! Replica get and export

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{FleetOperation, FleetOptions};
use crate::cleaner::SessionResources;
use crate::cluster::ClusterApi;
use crate::collector::CollectOptions;
use crate::consts;
use crate::descriptor::{AgentVolume, EnvMap, EnvValue, LongRunningSpec, PreparePhase, ProbeSpec};
use crate::error::{CleanupError, FleetError, Result};
use crate::models::{NodeResult, ReplicaCollection, ReplicaInfo, VolumeCollection, VolumeInfo};
use crate::report::aggregate;
use crate::session::Session;
use crate::supervisor::{Condition, PatienceBudget};

const EXPORTER_ENTRYPOINT: &str = include_str!("../../scripts/replica-exporter.sh");
const EXPORTER_PROBE: &str = "[[ -d /host-exporter/${VOLUME_NAME}/lost+found ]] || ${PAUSED}";
const EXPORTER_PROBE_DELAY_SECONDS: i32 = 10;
const EXPORTER_LOG_TAIL: i64 = 2;
const REPLICA_SUFFIX_LEN: usize = 8;

/// Volume a replica data directory belongs to
///
/// Replica directories are named `<volume>-<8 hex digits>`.
pub fn volume_name_from_replica_dir(replica: &str) -> Result<String> {
    let invalid = || FleetError::config(format!("invalid replica data directory name {replica:?}"));

    let (volume, suffix) = replica.rsplit_once('-').ok_or_else(invalid)?;
    if volume.is_empty()
        || suffix.len() != REPLICA_SUFFIX_LEN
        || !suffix.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(invalid());
    }
    Ok(volume.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetReplicaOptions {
    /// Replica data directory name; empty lists every replica
    pub replica_name: String,
    pub volume_name: String,
    pub data_directory: String,
}

impl Default for GetReplicaOptions {
    fn default() -> Self {
        Self {
            replica_name: String::new(),
            volume_name: String::new(),
            data_directory: consts::DEFAULT_DATA_DIRECTORY.to_string(),
        }
    }
}

/// `get replica`
pub struct ReplicaGetter {
    session: Session,
}

impl ReplicaGetter {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        fleet: &FleetOptions,
        options: &GetReplicaOptions,
    ) -> Result<Self> {
        let descriptor = fleet
            .descriptor(consts::APP_REPLICA_GETTER)
            .command([consts::CMD_LOCAL_AGENT, consts::SUBCMD_GET, consts::SUBCMD_REPLICA])
            .env(consts::ENV_LOG_LEVEL, fleet.log_level.as_str())
            .env(consts::ENV_OUTPUT_FILE_PATH, consts::output_file_path())
            .env(consts::ENV_VOLUME_NAME, options.volume_name.as_str())
            .env(consts::ENV_REPLICA_NAME, options.replica_name.as_str())
            .env(consts::ENV_DATA_DIRECTORY, options.data_directory.as_str())
            .node_identity()
            .volume(AgentVolume::host(true))
            .volume(AgentVolume::shared())
            .privileged(true)
            .run_to_completion(true)
            .build()?;

        let session = Session::new(cluster, descriptor)
            .with_patience(PatienceBudget::medium())
            .with_monitor_config(fleet.monitor.clone());

        Ok(Self { session })
    }
}

#[async_trait]
impl FleetOperation for ReplicaGetter {
    type Output = ReplicaCollection;

    fn name(&self) -> &str {
        consts::APP_REPLICA_GETTER
    }

    fn is_long_running(&self) -> bool {
        false
    }

    async fn prepare(&mut self) -> Result<()> {
        self.session.remove_stale().await
    }

    async fn run(&mut self) -> Result<ReplicaCollection> {
        self.session.start().await?;
        self.session.wait_for_work(Condition::ContainersExited).await?;
        self.session
            .wait_for(
                consts::CONTAINER_OUTPUT,
                Condition::ContainersExited,
                PatienceBudget::short(),
            )
            .await?;

        let results = self
            .session
            .collect(consts::CONTAINER_OUTPUT, &CollectOptions::default())
            .await?;
        let replicas = aggregate(&results, |report, _, payload: ReplicaCollection| {
            report.merge(payload.replicas)
        })?;

        Ok(ReplicaCollection { replicas })
    }

    async fn cleanup(&mut self) -> std::result::Result<(), CleanupError> {
        self.session.cleanup().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReplicaOptions {
    pub replica_name: String,
    pub engine_image: String,
    /// Host directory the replica filesystem is exported under
    pub target_dir: String,
    pub data_directory: String,
}

impl Default for ExportReplicaOptions {
    fn default() -> Self {
        Self {
            replica_name: String::new(),
            engine_image: consts::IMAGE_ENGINE.to_string(),
            target_dir: String::new(),
            data_directory: consts::DEFAULT_DATA_DIRECTORY.to_string(),
        }
    }
}

impl ExportReplicaOptions {
    pub fn validate(&self) -> Result<()> {
        if self.replica_name.is_empty() {
            return Err(FleetError::config("Replica name (--name) is required"));
        }
        if self.engine_image.is_empty() {
            return Err(FleetError::config("Engine image (--engine-image) is required"));
        }
        if self.target_dir.is_empty() {
            return Err(FleetError::config("Host target directory (--target-dir) is required"));
        }
        Ok(())
    }
}

/// `export replica`
///
/// Runs a single-replica engine on every node holding the replica and
/// mounts its filesystem read-only under the target directory. The engine
/// stays up until `export replica stop`.
pub struct ReplicaExporter {
    session: Session,
    volume_name: String,
    exported_directory: String,
}

impl ReplicaExporter {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        fleet: &FleetOptions,
        options: &ExportReplicaOptions,
    ) -> Result<Self> {
        options.validate()?;
        let volume_name = volume_name_from_replica_dir(&options.replica_name)?;

        let replica_dir = Path::new(&options.data_directory)
            .join("replicas")
            .join(&options.replica_name);
        let exported_directory = Path::new(&options.target_dir).join(&volume_name);

        let prepare_env = EnvMap::from([
            (
                consts::ENV_CURRENT_NODE_ID.to_string(),
                EnvValue::FieldRef(consts::FIELD_NODE_NAME.to_string()),
            ),
            (consts::ENV_LOG_LEVEL.to_string(), fleet.log_level.as_str().into()),
            (consts::ENV_OUTPUT_FILE_PATH.to_string(), consts::output_file_path().into()),
            (consts::ENV_REPLICA_NAME.to_string(), options.replica_name.as_str().into()),
            (consts::ENV_DATA_DIRECTORY.to_string(), options.data_directory.as_str().into()),
        ]);

        let spec = LongRunningSpec {
            container: consts::CONTAINER_ENGINE.to_string(),
            prepare: Some(PreparePhase {
                image: fleet.image.clone(),
                command: vec![
                    consts::CMD_LOCAL_AGENT.to_string(),
                    consts::SUBCMD_GET.to_string(),
                    consts::SUBCMD_REPLICA.to_string(),
                ],
                env: prepare_env,
                mounts: vec![consts::VOLUME_HOST.to_string(), consts::VOLUME_SHARED.to_string()],
            }),
            readiness_probe: Some(ProbeSpec::bash(EXPORTER_PROBE, EXPORTER_PROBE_DELAY_SECONDS)),
            pre_stop: Some(vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                format!("{}/{}", consts::VOLUME_SHARED_DIR, consts::FILE_PRE_STOP_SCRIPT),
            ]),
            ..Default::default()
        };

        let descriptor = fleet
            .descriptor(consts::APP_REPLICA_EXPORTER)
            .namespace(consts::DEFAULT_NAMESPACE)
            .image(options.engine_image.clone())
            .command([format!("{}/{}", consts::VOLUME_ENTRYPOINT_DIR, consts::FILE_ENTRYPOINT)])
            .env(consts::ENV_REPLICA_NAME, options.replica_name.as_str())
            .env(consts::ENV_VOLUME_NAME, volume_name.as_str())
            .volume(AgentVolume::entrypoint())
            .volume(AgentVolume::host(false))
            .volume(AgentVolume::shared())
            .volume(
                AgentVolume::host_path(
                    consts::VOLUME_HOST_EXPORTER,
                    consts::VOLUME_HOST_EXPORTER_DIR,
                    options.target_dir.as_str(),
                )
                .with_bidirectional_propagation(),
            )
            .volume(AgentVolume::host_path(
                consts::VOLUME_REPLICA,
                consts::VOLUME_REPLICA_DIR,
                replica_dir.to_string_lossy(),
            ))
            .entrypoint_script(EXPORTER_ENTRYPOINT)
            .privileged(true)
            .long_running(spec)
            .build()?;

        let session = Session::new(cluster, descriptor)
            .with_patience(PatienceBudget::medium())
            .with_monitor_config(fleet.monitor.clone());

        Ok(Self {
            session,
            volume_name,
            exported_directory: exported_directory.to_string_lossy().into_owned(),
        })
    }

    pub fn volume_name(&self) -> &str {
        &self.volume_name
    }

    /// Objects left running by a successful export
    pub fn stop_resources() -> SessionResources {
        SessionResources::new(consts::DEFAULT_NAMESPACE, consts::APP_REPLICA_EXPORTER)
            .with_config_map()
    }

    fn replica_info(&self, result: &NodeResult) -> ReplicaInfo {
        let mut info = ReplicaInfo {
            node: result.node_name.clone(),
            exported_directory: self.exported_directory.clone(),
            ..Default::default()
        };

        if let Some(error) = result.error.as_deref() {
            warn!(pod = %result.pod_name, node = %result.node_name, error, "Engine log unavailable");
            info.error = error.to_string();
            info.exported_directory.clear();
            return info;
        }

        for line in result.output.lines() {
            if let Some(message) = line.strip_prefix(consts::LOG_PREFIX_WARN) {
                info.warn = message.to_string();
                info.exported_directory.clear();
            } else if let Some(message) = line.strip_prefix(consts::LOG_PREFIX_ERROR) {
                info.error = message.to_string();
                info.exported_directory.clear();
            }
        }
        info
    }
}

#[async_trait]
impl FleetOperation for ReplicaExporter {
    type Output = VolumeCollection;

    fn name(&self) -> &str {
        consts::APP_REPLICA_EXPORTER
    }

    fn is_long_running(&self) -> bool {
        true
    }

    async fn prepare(&mut self) -> Result<()> {
        self.session.ensure_absent().await
    }

    async fn run(&mut self) -> Result<VolumeCollection> {
        self.session.start().await?;
        // prepare phase, then the engine that keeps serving the replica
        self.session
            .wait_for(
                consts::CONTAINER_INIT,
                Condition::ContainersExited,
                PatienceBudget::medium(),
            )
            .await?;
        self.session.wait_for_work(Condition::ContainersReady).await?;

        let results = self
            .session
            .collect(consts::CONTAINER_ENGINE, &CollectOptions::tail(EXPORTER_LOG_TAIL))
            .await?;

        let replicas = results
            .iter()
            .map(|result| {
                debug!(pod = %result.pod_name, node = %result.node_name, "Collecting engine log");
                self.replica_info(result)
            })
            .collect();

        let mut report = VolumeCollection::default();
        report
            .volumes
            .push(self.volume_name.clone(), VolumeInfo { replicas });
        Ok(report)
    }

    async fn cleanup(&mut self) -> std::result::Result<(), CleanupError> {
        self.session.cleanup().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::SupervisionFailure;
    use crate::operations::execute;
    use crate::supervisor::MonitorConfig;
    use crate::testing::{self, FakeCluster};

    const REPLICA: &str = "pvc-0a1b-3c2d1e0f";

    fn fleet() -> FleetOptions {
        FleetOptions {
            monitor: MonitorConfig {
                poll_interval: Duration::from_millis(1),
                hard_deadline: Duration::from_secs(30),
            },
            ..Default::default()
        }
    }

    fn export_options() -> ExportReplicaOptions {
        ExportReplicaOptions {
            replica_name: REPLICA.to_string(),
            target_dir: "/mnt/export".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_volume_name_from_replica_dir() {
        assert_eq!(volume_name_from_replica_dir(REPLICA).unwrap(), "pvc-0a1b");
        assert_eq!(
            volume_name_from_replica_dir("data-volume-ABCDEF12").unwrap(),
            "data-volume"
        );
        assert!(volume_name_from_replica_dir("pvc").is_err());
        assert!(volume_name_from_replica_dir("pvc-xyz12345").is_err());
        assert!(volume_name_from_replica_dir("-3c2d1e0f").is_err());
    }

    #[test]
    fn test_export_validation_messages() {
        let err = ExportReplicaOptions::default().validate().unwrap_err();
        assert!(err.to_string().contains("Replica name (--name) is required"));

        let options = ExportReplicaOptions {
            engine_image: String::new(),
            ..export_options()
        };
        assert!(options
            .validate()
            .unwrap_err()
            .to_string()
            .contains("Engine image (--engine-image) is required"));

        let options = ExportReplicaOptions {
            target_dir: String::new(),
            ..export_options()
        };
        assert!(options
            .validate()
            .unwrap_err()
            .to_string()
            .contains("Host target directory (--target-dir) is required"));
    }

    #[tokio::test]
    async fn test_get_merges_replicas_across_nodes() {
        let cluster = Arc::new(FakeCluster::new());
        let pods = ["getter-a", "getter-b"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                testing::pod(
                    name,
                    &format!("node-{}", i + 1),
                    vec![
                        testing::completed(consts::CONTAINER_INIT),
                        testing::completed(consts::CONTAINER_OUTPUT),
                    ],
                    vec![],
                )
            })
            .collect();
        cluster.script_pods(vec![pods]);
        cluster.set_log(
            "getter-a",
            consts::CONTAINER_OUTPUT,
            r#"{"replicas":{"pvc-0a1b-3c2d1e0f":[{"node":"node-1","volumeName":"pvc-0a1b"}]}}"#,
        );
        cluster.set_log(
            "getter-b",
            consts::CONTAINER_OUTPUT,
            r#"{"replicas":{"pvc-0a1b-3c2d1e0f":[{"node":"node-2","volumeName":"pvc-0a1b","isInUse":true}]}}"#,
        );

        let mut getter =
            ReplicaGetter::new(cluster.clone(), &fleet(), &GetReplicaOptions::default()).unwrap();
        let execution = execute(&mut getter).await.unwrap();

        let replicas = execution.output.replicas.get(REPLICA).unwrap();
        assert_eq!(replicas.len(), 2);
        assert_eq!(replicas[1].is_in_use, Some(true));
        assert!(!cluster.has_object("DaemonSet default/longhorn-replica-getter"));
    }

    #[tokio::test]
    async fn test_export_reports_per_node_outcome() {
        let cluster = Arc::new(FakeCluster::new());
        let pods = ["exporter-a", "exporter-b"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                testing::pod(
                    name,
                    &format!("node-{}", i + 1),
                    vec![testing::completed(consts::CONTAINER_INIT)],
                    vec![testing::ready(consts::CONTAINER_ENGINE)],
                )
            })
            .collect();
        cluster.script_pods(vec![pods]);
        cluster.set_log(
            "exporter-a",
            consts::CONTAINER_ENGINE,
            "Mounting /dev/longhorn/pvc-0a1b\nComplete!\nKeep the container running to export replica\n",
        );
        cluster.set_log(
            "exporter-b",
            consts::CONTAINER_ENGINE,
            "WARN: cannot find replica pvc-0a1b-3c2d1e0f on this node.\nPaused. Attempting to export replica on another node\n",
        );

        let mut exporter = ReplicaExporter::new(cluster.clone(), &fleet(), &export_options()).unwrap();
        let execution = execute(&mut exporter).await.unwrap();

        let volumes = execution.output.volumes.get("pvc-0a1b").unwrap();
        assert_eq!(volumes.len(), 1);
        let replicas = &volumes[0].replicas;
        let exported = replicas.iter().find(|r| r.node == "node-1").unwrap();
        let skipped = replicas.iter().find(|r| r.node == "node-2").unwrap();
        assert_eq!(exported.exported_directory, "/mnt/export/pvc-0a1b");
        assert!(exported.warn.is_empty());
        assert_eq!(skipped.warn, "cannot find replica pvc-0a1b-3c2d1e0f on this node.");
        assert!(skipped.exported_directory.is_empty());

        // left running until stopped
        assert!(cluster.has_object("DaemonSet default/longhorn-replica-exporter"));
        assert!(cluster.has_object("ConfigMap default/longhorn-replica-exporter"));

        let daemon_set = cluster.daemon_set("default", consts::APP_REPLICA_EXPORTER).unwrap();
        let pod_spec = daemon_set.spec.unwrap().template.spec.unwrap();
        let init_containers = pod_spec.init_containers.unwrap();
        let init = &init_containers[0];
        assert_eq!(init.name, consts::CONTAINER_INIT);
        assert_eq!(init.volume_mounts.as_ref().unwrap().len(), 2);
        let engine = &pod_spec.containers[0];
        assert_eq!(engine.image.as_deref(), Some(consts::IMAGE_ENGINE));
        assert!(engine.lifecycle.is_some());
        let volumes = pod_spec.volumes.unwrap();
        let replica_volume = volumes.iter().find(|v| v.name == consts::VOLUME_REPLICA).unwrap();
        assert_eq!(
            replica_volume.host_path.as_ref().unwrap().path,
            "/var/lib/longhorn/replicas/pvc-0a1b-3c2d1e0f"
        );
    }

    #[tokio::test]
    async fn test_export_refuses_existing_config_map() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.insert_object("ConfigMap default/longhorn-replica-exporter");

        let mut exporter = ReplicaExporter::new(cluster.clone(), &fleet(), &export_options()).unwrap();
        let err = execute(&mut exporter).await.unwrap_err();

        assert!(err.to_string().contains("already exists"));
        assert!(cluster.created().is_empty());
        assert!(cluster.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_export_failure_removes_everything() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.script_pods(vec![vec![testing::pod(
            "exporter-a",
            "node-1",
            vec![testing::crash_looping(consts::CONTAINER_INIT)],
            vec![],
        )]]);

        let mut exporter = ReplicaExporter::new(cluster.clone(), &fleet(), &export_options()).unwrap();
        let err = execute(&mut exporter).await.unwrap_err();

        let err = match err {
            FleetError::Supervision(err) => err,
            other => panic!("expected supervision failure, got {other:?}"),
        };
        assert_eq!(err.container, consts::CONTAINER_INIT);
        assert_eq!(
            err.failure,
            SupervisionFailure::CrashLoop {
                namespace: "default".to_string(),
                pod: "exporter-a".to_string(),
                container: consts::CONTAINER_INIT.to_string(),
            }
        );
        assert_eq!(cluster.log_requests(), vec!["exporter-a/init-longhornctl".to_string()]);
        assert_eq!(
            cluster.deleted(),
            vec![
                "DaemonSet default/longhorn-replica-exporter".to_string(),
                "ConfigMap default/longhorn-replica-exporter".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_export_stop_removes_config_map_and_daemon_set() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.insert_object("DaemonSet default/longhorn-replica-exporter");
        cluster.insert_object("ConfigMap default/longhorn-replica-exporter");

        crate::operations::stop(cluster.clone(), &ReplicaExporter::stop_resources())
            .await
            .unwrap();

        assert_eq!(cluster.deleted().len(), 2);
    }
}
