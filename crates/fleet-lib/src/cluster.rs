//! Kubernetes API seam
//!
//! Everything the orchestrator asks of the API server goes through
//! [`ClusterApi`], so supervision and cleanup can be driven by a scripted
//! cluster in tests.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::{DeleteParams, ListParams, LogParams, PostParams};
use kube::{Api, Client};
use tracing::debug;

use crate::error::ClusterError;

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Kubernetes operations used by fleet sessions
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_daemon_set(&self, daemon_set: &DaemonSet) -> ClusterResult<DaemonSet>;

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> ClusterResult<DaemonSet>;

    async fn delete_daemon_set(&self, namespace: &str, name: &str) -> ClusterResult<()>;

    async fn create_config_map(&self, config_map: &ConfigMap) -> ClusterResult<ConfigMap>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> ClusterResult<ConfigMap>;

    async fn delete_config_map(&self, namespace: &str, name: &str) -> ClusterResult<()>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> ClusterResult<Vec<Pod>>;

    /// Full log text of one container, optionally limited to the last lines
    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: Option<i64>,
    ) -> ClusterResult<String>;

    async fn create_service_account(&self, account: &ServiceAccount) -> ClusterResult<()>;

    async fn delete_service_account(&self, namespace: &str, name: &str) -> ClusterResult<()>;

    async fn create_cluster_role(&self, role: &ClusterRole) -> ClusterResult<()>;

    async fn delete_cluster_role(&self, name: &str) -> ClusterResult<()>;

    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> ClusterResult<()>;

    async fn delete_cluster_role_binding(&self, name: &str) -> ClusterResult<()>;
}

/// [`ClusterApi`] backed by a live `kube::Client`
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn object_name<K: kube::Resource>(object: &K) -> String {
    object.meta().name.clone().unwrap_or_default()
}

fn object_namespace<K: kube::Resource>(object: &K) -> String {
    object.meta().namespace.clone().unwrap_or_default()
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create_daemon_set(&self, daemon_set: &DaemonSet) -> ClusterResult<DaemonSet> {
        let name = object_name(daemon_set);
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), &object_namespace(daemon_set));
        debug!(name = %name, "Creating DaemonSet");
        api.create(&PostParams::default(), daemon_set)
            .await
            .map_err(|e| ClusterError::from_kube("DaemonSet", name, e))
    }

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> ClusterResult<DaemonSet> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| ClusterError::from_kube("DaemonSet", name, e))
    }

    async fn delete_daemon_set(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        debug!(namespace, name, "Deleting DaemonSet");
        api.delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube("DaemonSet", name, e))
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> ClusterResult<ConfigMap> {
        let name = object_name(config_map);
        let api: Api<ConfigMap> =
            Api::namespaced(self.client.clone(), &object_namespace(config_map));
        debug!(name = %name, "Creating ConfigMap");
        api.create(&PostParams::default(), config_map)
            .await
            .map_err(|e| ClusterError::from_kube("ConfigMap", name, e))
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> ClusterResult<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| ClusterError::from_kube("ConfigMap", name, e))
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        debug!(namespace, name, "Deleting ConfigMap");
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube("ConfigMap", name, e))
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> ClusterResult<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| ClusterError::from_kube("Pod", label_selector, e))?;
        Ok(pods.items)
    }

    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: Option<i64>,
    ) -> ClusterResult<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            tail_lines,
            ..Default::default()
        };
        api.logs(pod, &params)
            .await
            .map_err(|e| ClusterError::from_kube("Pod", format!("{pod}/{container}"), e))
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> ClusterResult<()> {
        let name = object_name(account);
        let api: Api<ServiceAccount> =
            Api::namespaced(self.client.clone(), &object_namespace(account));
        api.create(&PostParams::default(), account)
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube("ServiceAccount", name, e))
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube("ServiceAccount", name, e))
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> ClusterResult<()> {
        let name = object_name(role);
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        api.create(&PostParams::default(), role)
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube("ClusterRole", name, e))
    }

    async fn delete_cluster_role(&self, name: &str) -> ClusterResult<()> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube("ClusterRole", name, e))
    }

    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> ClusterResult<()> {
        let name = object_name(binding);
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        api.create(&PostParams::default(), binding)
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube("ClusterRoleBinding", name, e))
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> ClusterResult<()> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube("ClusterRoleBinding", name, e))
    }
}
