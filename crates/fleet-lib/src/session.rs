//! Orchestration session
//!
//! A session owns the workload built from one descriptor and any temporary
//! access created for it, from creation to cleanup. Everything it creates
//! is named after the descriptor so cleanup needs only the name.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::access::{AccessProvisioner, AccessRule};
use crate::cleaner::{LifecycleCleaner, SessionResources};
use crate::cluster::ClusterApi;
use crate::collector::{CollectOptions, ResultCollector};
use crate::descriptor::AgentDescriptor;
use crate::error::{CleanupError, ClusterError, FleetError, Result};
use crate::models::NodeResult;
use crate::supervisor::{Condition, MonitorConfig, PatienceBudget, WorkloadMonitor};

const KIND_DAEMON_SET: &str = "DaemonSet";

/// Identity of the cluster-wide workload of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRef {
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
    pub label_selector: String,
}

impl WorkloadRef {
    pub fn daemon_set(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: KIND_DAEMON_SET,
            namespace: namespace.into(),
            label_selector: format!("{}={}", crate::consts::LABEL_APP, name),
            name,
        }
    }
}

pub struct Session {
    cluster: Arc<dyn ClusterApi>,
    descriptor: AgentDescriptor,
    workload: WorkloadRef,
    access_rules: Vec<AccessRule>,
    access_provisioned: bool,
    patience: PatienceBudget,
    monitor_config: MonitorConfig,
    started_at: DateTime<Utc>,
    cleaned: bool,
}

impl Session {
    pub fn new(cluster: Arc<dyn ClusterApi>, descriptor: AgentDescriptor) -> Self {
        let workload = WorkloadRef {
            kind: KIND_DAEMON_SET,
            namespace: descriptor.namespace().to_string(),
            name: descriptor.name().to_string(),
            label_selector: descriptor.label_selector(),
        };
        Self {
            cluster,
            descriptor,
            workload,
            access_rules: Vec::new(),
            access_provisioned: false,
            patience: PatienceBudget::medium(),
            monitor_config: MonitorConfig::default(),
            started_at: Utc::now(),
            cleaned: false,
        }
    }

    /// Rules granted to the agent identity; empty means no access objects
    pub fn with_access(mut self, rules: Vec<AccessRule>) -> Self {
        self.access_rules = rules;
        self
    }

    /// Patience of the work container
    pub fn with_patience(mut self, patience: PatienceBudget) -> Self {
        self.patience = patience;
        self
    }

    pub fn with_monitor_config(mut self, config: MonitorConfig) -> Self {
        self.monitor_config = config;
        self
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    pub fn workload(&self) -> &WorkloadRef {
        &self.workload
    }

    pub fn access_provisioned(&self) -> bool {
        self.access_provisioned
    }

    pub fn cluster(&self) -> Arc<dyn ClusterApi> {
        self.cluster.clone()
    }

    /// Everything this session created
    ///
    /// Access objects are included only once this session provisioned
    /// them, so a name collision never removes another session's access.
    pub fn resources(&self) -> SessionResources {
        self.resources_with_access(self.access_provisioned)
    }

    /// Everything an earlier run under the same name may have left behind
    fn stale_resources(&self) -> SessionResources {
        self.resources_with_access(!self.access_rules.is_empty())
    }

    fn resources_with_access(&self, access: bool) -> SessionResources {
        let mut resources =
            SessionResources::new(&self.workload.namespace, &self.workload.name);
        if self.descriptor.has_entrypoint() {
            resources = resources.with_config_map();
        }
        if access {
            resources = resources.with_access();
        }
        resources
    }

    /// Create access objects, the entrypoint ConfigMap and the DaemonSet
    pub async fn start(&mut self) -> Result<()> {
        if !self.access_rules.is_empty() {
            AccessProvisioner::new(self.cluster.clone())
                .provision(&self.workload.name, &self.workload.namespace, &self.access_rules)
                .await
                .map_err(|source| FleetError::Provision {
                    what: format!("access for {}", self.workload.name),
                    source,
                })?;
            self.access_provisioned = true;
        }

        if let Some(config_map) = self.descriptor.to_config_map() {
            self.cluster
                .create_config_map(&config_map)
                .await
                .map_err(|source| FleetError::Provision {
                    what: format!("ConfigMap {}/{}", self.workload.namespace, self.workload.name),
                    source,
                })?;
        }

        self.cluster
            .create_daemon_set(&self.descriptor.to_daemon_set())
            .await
            .map_err(|source| FleetError::Provision {
                what: format!("DaemonSet {}/{}", self.workload.namespace, self.workload.name),
                source,
            })?;

        info!(
            namespace = %self.workload.namespace,
            name = %self.workload.name,
            selector = ?self.descriptor.node_selector(),
            "Created DaemonSet"
        );
        Ok(())
    }

    fn monitor(&self) -> WorkloadMonitor {
        WorkloadMonitor::new(
            self.cluster.clone(),
            self.workload.clone(),
            self.monitor_config.clone(),
        )
    }

    /// Wait for the work container with the session's patience
    pub async fn wait_for_work(&self, condition: Condition) -> Result<()> {
        self.wait_for(self.descriptor.work_container(), condition, self.patience)
            .await
    }

    pub async fn wait_for(
        &self,
        container: &str,
        condition: Condition,
        budget: PatienceBudget,
    ) -> Result<()> {
        self.monitor()
            .wait_for(container, condition, budget)
            .await
            .map_err(FleetError::from)
    }

    pub async fn collect(&self, container: &str, options: &CollectOptions) -> Result<Vec<NodeResult>> {
        ResultCollector::new(self.cluster.clone())
            .collect(&self.workload, container, options)
            .await
            .map_err(FleetError::Collection)
    }

    /// Fail when an object of this session already exists
    pub async fn ensure_absent(&self) -> Result<()> {
        let namespace = &self.workload.namespace;
        let name = &self.workload.name;

        if self.descriptor.has_entrypoint() {
            let existing = self.cluster.get_config_map(namespace, name).await.map(|_| ());
            check_absent("ConfigMap", namespace, name, existing)?;
        }

        let existing = self.cluster.get_daemon_set(namespace, name).await.map(|_| ());
        check_absent(KIND_DAEMON_SET, namespace, name, existing)
    }

    /// Remove leftovers of an earlier interrupted run under the same name
    pub async fn remove_stale(&self) -> Result<()> {
        LifecycleCleaner::new(self.cluster.clone())
            .clean(&self.stale_resources())
            .await
            .map_err(FleetError::Stale)
    }

    /// Delete everything the session created, at most once
    pub async fn cleanup(&mut self) -> std::result::Result<(), CleanupError> {
        if self.cleaned {
            return Ok(());
        }
        self.cleaned = true;
        let outcome = LifecycleCleaner::new(self.cluster.clone())
            .clean(&self.resources())
            .await;
        info!(
            name = %self.workload.name,
            elapsed_ms = (Utc::now() - self.started_at).num_milliseconds(),
            "Session finished"
        );
        outcome
    }
}

fn check_absent(
    kind: &'static str,
    namespace: &str,
    name: &str,
    existing: std::result::Result<(), ClusterError>,
) -> Result<()> {
    let what = format!("{kind} {namespace}/{name}");
    match existing {
        Ok(()) => Err(FleetError::Provision {
            what,
            source: ClusterError::AlreadyExists {
                kind,
                name: name.to_string(),
            },
        }),
        Err(e) if e.is_not_found() => Ok(()),
        Err(source) => Err(FleetError::Provision { what, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts;
    use crate::descriptor::AgentVolume;
    use crate::testing::FakeCluster;

    fn session(cluster: Arc<FakeCluster>) -> Session {
        let descriptor = AgentDescriptor::builder(consts::APP_PREFLIGHT_CHECKER)
            .command([consts::CMD_LOCAL_AGENT, consts::SUBCMD_CHECK, consts::SUBCMD_PREFLIGHT])
            .volume(AgentVolume::shared())
            .run_to_completion(true)
            .build()
            .unwrap();
        Session::new(cluster, descriptor)
            .with_access(vec![AccessRule::new("", &["nodes"], &["get"])])
    }

    #[tokio::test]
    async fn test_cleanup_keeps_access_of_colliding_session() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.insert_object("ServiceAccount default/longhorn-preflight-checker");

        let mut session = session(cluster.clone());
        let err = session.start().await.unwrap_err();
        assert!(matches!(
            err,
            FleetError::Provision {
                source: ClusterError::AlreadyExists { .. },
                ..
            }
        ));
        assert!(!session.access_provisioned());
        assert!(!session.resources().access);

        tokio_test::assert_ok!(session.cleanup().await);

        assert!(cluster.deleted().is_empty());
        assert!(cluster.has_object("ServiceAccount default/longhorn-preflight-checker"));
    }

    #[tokio::test]
    async fn test_cleanup_revokes_provisioned_access() {
        let cluster = Arc::new(FakeCluster::new());
        let mut session = session(cluster.clone());

        session.start().await.unwrap();
        assert!(session.access_provisioned());
        session.cleanup().await.unwrap();

        let deleted = cluster.deleted();
        assert_eq!(deleted[0], "DaemonSet default/longhorn-preflight-checker");
        assert!(deleted.contains(&"ClusterRoleBinding longhorn-preflight-checker".to_string()));
        assert!(deleted.contains(&"ServiceAccount default/longhorn-preflight-checker".to_string()));
    }

    #[tokio::test]
    async fn test_remove_stale_includes_leftover_access() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.insert_object("DaemonSet default/longhorn-preflight-checker");
        cluster.insert_object("ClusterRole longhorn-preflight-checker");

        session(cluster.clone()).remove_stale().await.unwrap();

        assert_eq!(
            cluster.deleted(),
            vec![
                "DaemonSet default/longhorn-preflight-checker".to_string(),
                "ClusterRole longhorn-preflight-checker".to_string(),
            ]
        );
    }
}
