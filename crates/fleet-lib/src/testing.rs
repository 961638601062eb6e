//! Scripted in-memory cluster and pod builders for tests

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetStatus};
use k8s_openapi::api::core::v1::{
    ConfigMap, ContainerState, ContainerStateRunning, ContainerStateTerminated,
    ContainerStateWaiting, ContainerStatus, Pod, PodSpec, PodStatus, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

use crate::cluster::{ClusterApi, ClusterResult};
use crate::error::ClusterError;

/// Failure injected for an operation key such as `"create DaemonSet"`
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Server,
}

#[derive(Default)]
struct State {
    objects: BTreeSet<String>,
    daemon_sets: BTreeMap<String, DaemonSet>,
    config_maps: BTreeMap<String, ConfigMap>,
    pod_script: VecDeque<Vec<Pod>>,
    desired_script: VecDeque<Option<i32>>,
    last_pod_count: usize,
    logs: BTreeMap<String, String>,
    failures: BTreeMap<String, Failure>,
    created: Vec<String>,
    deleted: Vec<String>,
    log_requests: Vec<String>,
    list_calls: usize,
}

/// In-memory [`ClusterApi`] replaying scripted pod lists per poll tick
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pod lists returned by successive list calls; the last one repeats
    pub fn script_pods(&self, ticks: Vec<Vec<Pod>>) {
        self.state.lock().unwrap().pod_script = ticks.into();
    }

    /// Desired scheduled counts returned by successive gets; the last one
    /// repeats. Without a script the size of the last pod list is used.
    pub fn script_desired(&self, desired: Vec<Option<i32>>) {
        self.state.lock().unwrap().desired_script = desired.into();
    }

    pub fn set_log(&self, pod: &str, container: &str, text: &str) {
        self.state
            .lock()
            .unwrap()
            .logs
            .insert(format!("{pod}/{container}"), text.to_string());
    }

    pub fn fail_on(&self, operation: &str, failure: Failure) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(operation.to_string(), failure);
    }

    /// Pre-populate an object, e.g. `"ConfigMap default/name"`
    pub fn insert_object(&self, object: &str) {
        self.state.lock().unwrap().objects.insert(object.to_string());
    }

    pub fn has_object(&self, object: &str) -> bool {
        self.state.lock().unwrap().objects.contains(object)
    }

    pub fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn log_requests(&self) -> Vec<String> {
        self.state.lock().unwrap().log_requests.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    pub fn daemon_set(&self, namespace: &str, name: &str) -> Option<DaemonSet> {
        self.state
            .lock()
            .unwrap()
            .daemon_sets
            .get(&format!("{namespace}/{name}"))
            .cloned()
    }

    fn check(state: &State, operation: &str, kind: &'static str, name: &str) -> ClusterResult<()> {
        match state.failures.get(operation) {
            None => Ok(()),
            Some(Failure::Server) => Err(ClusterError::Api {
                kind,
                name: name.to_string(),
                source: server_error(),
            }),
        }
    }

    fn create(&self, kind: &'static str, name: &str) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, &format!("create {kind}"), kind, name)?;
        let object = format!("{kind} {name}");
        if !state.objects.insert(object.clone()) {
            return Err(ClusterError::AlreadyExists {
                kind,
                name: name.to_string(),
            });
        }
        state.created.push(object);
        Ok(())
    }

    fn delete(&self, kind: &'static str, name: &str) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, &format!("delete {kind}"), kind, name)?;
        let object = format!("{kind} {name}");
        if !state.objects.remove(&object) {
            return Err(ClusterError::NotFound {
                kind,
                name: name.to_string(),
            });
        }
        state.deleted.push(object);
        Ok(())
    }

    fn get(&self, kind: &'static str, name: &str) -> ClusterResult<()> {
        let state = self.state.lock().unwrap();
        Self::check(&state, &format!("get {kind}"), kind, name)?;
        if state.objects.contains(&format!("{kind} {name}")) {
            Ok(())
        } else {
            Err(ClusterError::NotFound {
                kind,
                name: name.to_string(),
            })
        }
    }
}

fn server_error() -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: "internal error".to_string(),
        reason: "InternalError".to_string(),
        code: 500,
    })
}

fn qualified(meta: &ObjectMeta) -> String {
    format!(
        "{}/{}",
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default()
    )
}

fn pop_or_repeat<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn create_daemon_set(&self, daemon_set: &DaemonSet) -> ClusterResult<DaemonSet> {
        let key = qualified(&daemon_set.metadata);
        self.create("DaemonSet", &key)?;
        let mut stored = daemon_set.clone();
        stored.metadata.generation = Some(1);
        self.state
            .lock()
            .unwrap()
            .daemon_sets
            .insert(key, stored.clone());
        Ok(stored)
    }

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> ClusterResult<DaemonSet> {
        let key = format!("{namespace}/{name}");
        self.get("DaemonSet", &key)?;
        let mut state = self.state.lock().unwrap();
        let desired = match pop_or_repeat(&mut state.desired_script) {
            Some(desired) => desired,
            None => Some(i32::try_from(state.last_pod_count).unwrap()),
        };
        let mut daemon_set = state.daemon_sets.get(&key).cloned().unwrap_or_default();
        daemon_set.status = desired.map(|count| DaemonSetStatus {
            desired_number_scheduled: count,
            observed_generation: Some(1),
            ..Default::default()
        });
        Ok(daemon_set)
    }

    async fn delete_daemon_set(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.delete("DaemonSet", &format!("{namespace}/{name}"))
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> ClusterResult<ConfigMap> {
        let key = qualified(&config_map.metadata);
        self.create("ConfigMap", &key)?;
        self.state
            .lock()
            .unwrap()
            .config_maps
            .insert(key, config_map.clone());
        Ok(config_map.clone())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> ClusterResult<ConfigMap> {
        let key = format!("{namespace}/{name}");
        self.get("ConfigMap", &key)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .config_maps
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.delete("ConfigMap", &format!("{namespace}/{name}"))
    }

    async fn list_pods(&self, _namespace: &str, label_selector: &str) -> ClusterResult<Vec<Pod>> {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        Self::check(&state, "list Pod", "Pod", label_selector)?;
        let pods = pop_or_repeat(&mut state.pod_script).unwrap_or_default();
        state.last_pod_count = pods.len();
        Ok(pods)
    }

    async fn container_logs(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: Option<i64>,
    ) -> ClusterResult<String> {
        let mut state = self.state.lock().unwrap();
        let key = format!("{pod}/{container}");
        state.log_requests.push(key.clone());
        Self::check(&state, "logs", "Pod", &key)?;
        Self::check(&state, &format!("logs {pod}"), "Pod", &key)?;

        let text = state.logs.get(&key).cloned().unwrap_or_default();
        Ok(match tail_lines {
            Some(tail) => {
                let lines: Vec<&str> = text.split_inclusive('\n').collect();
                let skip = lines.len().saturating_sub(usize::try_from(tail).unwrap());
                lines[skip..].concat()
            }
            None => text,
        })
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> ClusterResult<()> {
        self.create("ServiceAccount", &qualified(&account.metadata))
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.delete("ServiceAccount", &format!("{namespace}/{name}"))
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> ClusterResult<()> {
        self.create("ClusterRole", &role.metadata.name.clone().unwrap_or_default())
    }

    async fn delete_cluster_role(&self, name: &str) -> ClusterResult<()> {
        self.delete("ClusterRole", name)
    }

    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> ClusterResult<()> {
        self.create(
            "ClusterRoleBinding",
            &binding.metadata.name.clone().unwrap_or_default(),
        )
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> ClusterResult<()> {
        self.delete("ClusterRoleBinding", name)
    }
}

/// Agent pod scheduled on `node` with the given container statuses
pub fn pod(
    name: &str,
    node: &str,
    init: Vec<ContainerStatus>,
    containers: Vec<ContainerStatus>,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            init_container_statuses: Some(init),
            container_statuses: Some(containers),
            ..Default::default()
        }),
    }
}

pub fn deleting(mut pod: Pod) -> Pod {
    pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    pod
}

fn status(name: &str, ready: bool, state: ContainerState) -> ContainerStatus {
    ContainerStatus {
        name: name.to_string(),
        ready,
        state: Some(state),
        ..Default::default()
    }
}

fn waiting(name: &str, reason: &str) -> ContainerStatus {
    status(
        name,
        false,
        ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some(reason.to_string()),
                message: None,
            }),
            ..Default::default()
        },
    )
}

fn terminated(name: &str, exit_code: i32, reason: &str) -> ContainerStatus {
    status(
        name,
        false,
        ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code,
                reason: Some(reason.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
    )
}

fn started(name: &str, ready: bool) -> ContainerStatus {
    status(
        name,
        ready,
        ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..Default::default()
        },
    )
}

pub fn completed(name: &str) -> ContainerStatus {
    terminated(name, 0, "Completed")
}

pub fn failed(name: &str) -> ContainerStatus {
    terminated(name, 1, "Error")
}

pub fn crash_looping(name: &str) -> ContainerStatus {
    waiting(name, "CrashLoopBackOff")
}

pub fn initializing(name: &str) -> ContainerStatus {
    waiting(name, "PodInitializing")
}

pub fn running(name: &str) -> ContainerStatus {
    started(name, false)
}

pub fn ready(name: &str) -> ContainerStatus {
    started(name, true)
}
