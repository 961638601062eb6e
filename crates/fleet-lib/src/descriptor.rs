//! Agent descriptor builder
//!
//! Translates the parameters of a fleet command into a declarative per-node
//! workload definition. Two container shapes are supported:
//! - run-to-completion: the work runs in an init container that must exit, an
//!   optional output container prints the shared output file, and an inert
//!   pause container keeps the pod alive until logs are collected
//! - long-running: the work runs in a regular container that must become
//!   ready and stays up until the session is stopped

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, ExecAction, HostPathVolumeSource, Lifecycle, LifecycleHandler,
    LocalObjectReference, ObjectFieldSelector, PodSpec, PodTemplateSpec, Probe, SecurityContext,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::consts;
use crate::error::{FleetError, NodeSelectorError, Result};

const ENTRYPOINT_DEFAULT_MODE: i32 = 0o744;

/// Value of an environment variable passed to an agent container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    Literal(String),
    /// Resolved by the platform from a pod field, e.g. `spec.nodeName`
    FieldRef(String),
}

impl From<&str> for EnvValue {
    fn from(value: &str) -> Self {
        Self::Literal(value.to_string())
    }
}

impl From<String> for EnvValue {
    fn from(value: String) -> Self {
        Self::Literal(value)
    }
}

pub type EnvMap = BTreeMap<String, EnvValue>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    HostPath(String),
    EmptyDir,
    /// ConfigMap named after the session carrying the entrypoint script
    Entrypoint,
}

/// A pod volume and where the work container mounts it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentVolume {
    pub name: String,
    pub mount_path: String,
    pub source: VolumeSource,
    pub read_only: bool,
    pub bidirectional: bool,
}

impl AgentVolume {
    /// Root filesystem of the node at `/host`
    pub fn host(read_only: bool) -> Self {
        Self {
            name: consts::VOLUME_HOST.to_string(),
            mount_path: consts::VOLUME_HOST_DIR.to_string(),
            source: VolumeSource::HostPath("/".to_string()),
            read_only,
            bidirectional: false,
        }
    }

    /// Pod-local scratch space shared between phases
    pub fn shared() -> Self {
        Self {
            name: consts::VOLUME_SHARED.to_string(),
            mount_path: consts::VOLUME_SHARED_DIR.to_string(),
            source: VolumeSource::EmptyDir,
            read_only: false,
            bidirectional: false,
        }
    }

    pub fn entrypoint() -> Self {
        Self {
            name: consts::VOLUME_ENTRYPOINT.to_string(),
            mount_path: consts::VOLUME_ENTRYPOINT_DIR.to_string(),
            source: VolumeSource::Entrypoint,
            read_only: false,
            bidirectional: false,
        }
    }

    pub fn host_path(
        name: impl Into<String>,
        mount_path: impl Into<String>,
        host_path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mount_path: mount_path.into(),
            source: VolumeSource::HostPath(host_path.into()),
            read_only: false,
            bidirectional: false,
        }
    }

    pub fn with_bidirectional_propagation(mut self) -> Self {
        self.bidirectional = true;
        self
    }

    fn to_mount(&self) -> VolumeMount {
        VolumeMount {
            name: self.name.clone(),
            mount_path: self.mount_path.clone(),
            read_only: self.read_only.then_some(true),
            mount_propagation: self
                .bidirectional
                .then(|| "Bidirectional".to_string()),
            ..Default::default()
        }
    }

    fn to_volume(&self, config_map_name: &str) -> Volume {
        let mut volume = Volume {
            name: self.name.clone(),
            ..Default::default()
        };
        match &self.source {
            VolumeSource::HostPath(path) => {
                volume.host_path = Some(HostPathVolumeSource {
                    path: path.clone(),
                    type_: None,
                });
            }
            VolumeSource::EmptyDir => {
                volume.empty_dir = Some(EmptyDirVolumeSource::default());
            }
            VolumeSource::Entrypoint => {
                volume.config_map = Some(ConfigMapVolumeSource {
                    name: Some(config_map_name.to_string()),
                    default_mode: Some(ENTRYPOINT_DEFAULT_MODE),
                    ..Default::default()
                });
            }
        }
        volume
    }
}

/// Exec probe with the timings used by every long-running agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    pub command: Vec<String>,
    pub initial_delay_seconds: i32,
}

impl ProbeSpec {
    pub fn bash(script: impl Into<String>, initial_delay_seconds: i32) -> Self {
        Self {
            command: vec!["/bin/bash".to_string(), "-c".to_string(), script.into()],
            initial_delay_seconds,
        }
    }

    fn to_probe(&self) -> Probe {
        Probe {
            exec: Some(ExecAction {
                command: Some(self.command.clone()),
            }),
            initial_delay_seconds: Some(self.initial_delay_seconds),
            period_seconds: Some(10),
            timeout_seconds: Some(5),
            success_threshold: Some(1),
            failure_threshold: Some(3),
            ..Default::default()
        }
    }
}

/// Init container that runs before the long-running container starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparePhase {
    pub image: String,
    pub command: Vec<String>,
    pub env: EnvMap,
    /// Names of pod volumes the phase mounts
    pub mounts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LongRunningSpec {
    pub container: String,
    pub prepare: Option<PreparePhase>,
    pub readiness_probe: Option<ProbeSpec>,
    pub liveness_probe: Option<ProbeSpec>,
    pub pre_stop: Option<Vec<String>>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentShape {
    RunToCompletion { output_phase: bool },
    LongRunning(LongRunningSpec),
}

/// Immutable per-session workload definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDescriptor {
    name: String,
    namespace: String,
    image: String,
    pause_image: String,
    command: Vec<String>,
    args: Vec<String>,
    env: EnvMap,
    node_selector: BTreeMap<String, String>,
    volumes: Vec<AgentVolume>,
    privileged: bool,
    image_pull_secret: Option<String>,
    service_account: Option<String>,
    host_network: bool,
    host_pid: bool,
    entrypoint_script: Option<String>,
    shape: AgentShape,
}

impl AgentDescriptor {
    pub fn builder(name: impl Into<String>) -> AgentDescriptorBuilder {
        AgentDescriptorBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn env(&self) -> &EnvMap {
        &self.env
    }

    pub fn node_selector(&self) -> &BTreeMap<String, String> {
        &self.node_selector
    }

    pub fn shape(&self) -> &AgentShape {
        &self.shape
    }

    pub fn has_entrypoint(&self) -> bool {
        self.entrypoint_script.is_some()
    }

    /// Label selector matching the workload's pods
    pub fn label_selector(&self) -> String {
        format!("{}={}", consts::LABEL_APP, self.name)
    }

    /// Container whose state decides whether the agent did its work
    pub fn work_container(&self) -> &str {
        match &self.shape {
            AgentShape::RunToCompletion { .. } => consts::CONTAINER_INIT,
            AgentShape::LongRunning(spec) => &spec.container,
        }
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(consts::LABEL_APP.to_string(), self.name.clone())])
    }

    fn metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels()),
            ..Default::default()
        }
    }

    /// Entrypoint ConfigMap, present only when a script was supplied
    pub fn to_config_map(&self) -> Option<ConfigMap> {
        let script = self.entrypoint_script.as_ref()?;
        Some(ConfigMap {
            metadata: self.metadata(),
            data: Some(BTreeMap::from([(
                consts::FILE_ENTRYPOINT.to_string(),
                script.clone(),
            )])),
            ..Default::default()
        })
    }

    pub fn to_daemon_set(&self) -> DaemonSet {
        let volumes: Vec<Volume> = self
            .volumes
            .iter()
            .map(|v| v.to_volume(&self.name))
            .collect();

        let mut work = Container {
            name: self.work_container().to_string(),
            image: Some(self.image.clone()),
            command: Some(self.command.clone()),
            args: (!self.args.is_empty()).then(|| self.args.clone()),
            env: Some(to_env_vars(&self.env)),
            volume_mounts: Some(self.volumes.iter().map(AgentVolume::to_mount).collect()),
            security_context: self.privileged.then(|| SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let (init_containers, containers) = match &self.shape {
            AgentShape::RunToCompletion { output_phase } => {
                let mut init = vec![work];
                if *output_phase {
                    init.push(self.output_container());
                }
                let pause = Container {
                    name: consts::CONTAINER_PAUSE.to_string(),
                    image: Some(self.pause_image.clone()),
                    ..Default::default()
                };
                (Some(init), vec![pause])
            }
            AgentShape::LongRunning(spec) => {
                if !spec.capabilities.is_empty() {
                    let context = work.security_context.get_or_insert_with(Default::default);
                    context.capabilities = Some(Capabilities {
                        add: Some(spec.capabilities.clone()),
                        drop: None,
                    });
                }
                work.readiness_probe = spec.readiness_probe.as_ref().map(ProbeSpec::to_probe);
                work.liveness_probe = spec.liveness_probe.as_ref().map(ProbeSpec::to_probe);
                work.lifecycle = spec.pre_stop.as_ref().map(|command| Lifecycle {
                    pre_stop: Some(LifecycleHandler {
                        exec: Some(ExecAction {
                            command: Some(command.clone()),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                let init = spec
                    .prepare
                    .as_ref()
                    .map(|prepare| vec![self.prepare_container(prepare)]);
                (init, vec![work])
            }
        };

        DaemonSet {
            metadata: self.metadata(),
            spec: Some(DaemonSetSpec {
                selector: LabelSelector {
                    match_labels: Some(self.labels()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: self.service_account.clone(),
                        host_network: self.host_network.then_some(true),
                        host_pid: self.host_pid.then_some(true),
                        init_containers,
                        containers,
                        volumes: (!volumes.is_empty()).then_some(volumes),
                        node_selector: (!self.node_selector.is_empty())
                            .then(|| self.node_selector.clone()),
                        image_pull_secrets: image_pull_secrets(self.image_pull_secret.as_deref()),
                        ..Default::default()
                    }),
                },
                update_strategy: Some(DaemonSetUpdateStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn output_container(&self) -> Container {
        Container {
            name: consts::CONTAINER_OUTPUT.to_string(),
            image: Some(self.image.clone()),
            command: Some(vec!["cat".to_string(), consts::output_file_path()]),
            volume_mounts: Some(vec![AgentVolume::shared().to_mount()]),
            ..Default::default()
        }
    }

    fn prepare_container(&self, prepare: &PreparePhase) -> Container {
        let mounts = self
            .volumes
            .iter()
            .filter(|v| prepare.mounts.contains(&v.name))
            .map(AgentVolume::to_mount)
            .collect();
        Container {
            name: consts::CONTAINER_INIT.to_string(),
            image: Some(prepare.image.clone()),
            command: Some(prepare.command.clone()),
            env: Some(to_env_vars(&prepare.env)),
            volume_mounts: Some(mounts),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn to_env_vars(env: &EnvMap) -> Vec<EnvVar> {
    env.iter()
        .map(|(name, value)| match value {
            EnvValue::Literal(value) => EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                value_from: None,
            },
            EnvValue::FieldRef(path) => EnvVar {
                name: name.clone(),
                value: None,
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        api_version: None,
                        field_path: path.clone(),
                    }),
                    ..Default::default()
                }),
            },
        })
        .collect()
}

/// Builder for [`AgentDescriptor`]
pub struct AgentDescriptorBuilder {
    name: String,
    namespace: String,
    image: String,
    image_registry: String,
    pause_image: String,
    command: Vec<String>,
    args: Vec<String>,
    env: EnvMap,
    node_selector: BTreeMap<String, String>,
    volumes: Vec<AgentVolume>,
    privileged: bool,
    image_pull_secret: Option<String>,
    service_account: Option<String>,
    host_network: bool,
    host_pid: bool,
    entrypoint_script: Option<String>,
    shape: AgentShape,
}

impl AgentDescriptorBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: consts::DEFAULT_NAMESPACE.to_string(),
            image: consts::IMAGE_CLI.to_string(),
            image_registry: String::new(),
            pause_image: consts::IMAGE_PAUSE.to_string(),
            command: Vec::new(),
            args: Vec::new(),
            env: EnvMap::new(),
            node_selector: BTreeMap::new(),
            volumes: Vec::new(),
            privileged: false,
            image_pull_secret: None,
            service_account: None,
            host_network: false,
            host_pid: false,
            entrypoint_script: None,
            shape: AgentShape::RunToCompletion { output_phase: false },
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Registry substituted into every image of the workload
    pub fn image_registry(mut self, registry: impl Into<String>) -> Self {
        self.image_registry = registry.into();
        self
    }

    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<EnvValue>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Inject the scheduling node's name into `CURRENT_NODE_ID`
    pub fn node_identity(self) -> Self {
        self.env(
            consts::ENV_CURRENT_NODE_ID,
            EnvValue::FieldRef(consts::FIELD_NODE_NAME.to_string()),
        )
    }

    pub fn node_selector(mut self, selector: BTreeMap<String, String>) -> Self {
        self.node_selector = selector;
        self
    }

    pub fn volume(mut self, volume: AgentVolume) -> Self {
        self.volumes.push(volume);
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn image_pull_secret(mut self, secret: Option<String>) -> Self {
        self.image_pull_secret = secret.filter(|s| !s.is_empty());
        self
    }

    pub fn service_account(mut self, name: impl Into<String>) -> Self {
        self.service_account = Some(name.into());
        self
    }

    pub fn host_network(mut self, enabled: bool) -> Self {
        self.host_network = enabled;
        self
    }

    pub fn host_pid(mut self, enabled: bool) -> Self {
        self.host_pid = enabled;
        self
    }

    pub fn entrypoint_script(mut self, script: impl Into<String>) -> Self {
        self.entrypoint_script = Some(script.into());
        self
    }

    pub fn run_to_completion(mut self, output_phase: bool) -> Self {
        self.shape = AgentShape::RunToCompletion { output_phase };
        self
    }

    pub fn long_running(mut self, spec: LongRunningSpec) -> Self {
        self.shape = AgentShape::LongRunning(spec);
        self
    }

    pub fn build(self) -> Result<AgentDescriptor> {
        if self.name.trim().is_empty() {
            return Err(FleetError::config("workload name is required"));
        }
        if self.namespace.trim().is_empty() {
            return Err(FleetError::config("namespace is required"));
        }
        if self.image.trim().is_empty() {
            return Err(FleetError::config("agent image is required"));
        }
        if self.command.is_empty() {
            return Err(FleetError::config("agent command is required"));
        }

        let has_volume = |source: &VolumeSource| self.volumes.iter().any(|v| &v.source == source);
        if has_volume(&VolumeSource::Entrypoint) != self.entrypoint_script.is_some() {
            return Err(FleetError::config(
                "entrypoint volume and entrypoint script must be set together",
            ));
        }

        let mut shape = self.shape;
        match &mut shape {
            AgentShape::RunToCompletion { output_phase } => {
                if *output_phase && !self.volumes.iter().any(|v| v.name == consts::VOLUME_SHARED) {
                    return Err(FleetError::config(format!(
                        "output phase requires the {:?} volume",
                        consts::VOLUME_SHARED
                    )));
                }
            }
            AgentShape::LongRunning(spec) => {
                if spec.container.trim().is_empty() {
                    return Err(FleetError::config("long-running container name is required"));
                }
                if let Some(prepare) = spec.prepare.as_mut() {
                    prepare.image = build_image_name(&prepare.image, &self.image_registry);
                }
            }
        }

        let mut volumes = self.volumes;
        let mut seen = std::collections::BTreeSet::new();
        volumes.retain(|v| seen.insert(v.name.clone()));

        Ok(AgentDescriptor {
            image: build_image_name(&self.image, &self.image_registry),
            pause_image: build_image_name(&self.pause_image, &self.image_registry),
            name: self.name,
            namespace: self.namespace,
            command: self.command,
            args: self.args,
            env: self.env,
            node_selector: self.node_selector,
            volumes,
            privileged: self.privileged,
            image_pull_secret: self.image_pull_secret,
            service_account: self.service_account,
            host_network: self.host_network,
            host_pid: self.host_pid,
            entrypoint_script: self.entrypoint_script,
            shape,
        })
    }
}

/// Parse `key=value[,key=value...]` into a node selector
///
/// Blank input selects every node.
pub fn parse_node_selector(raw: &str) -> Result<BTreeMap<String, String>, NodeSelectorError> {
    let mut selector = BTreeMap::new();
    if raw.trim().is_empty() {
        return Ok(selector);
    }

    for pair in raw.split(',') {
        let parts: Vec<&str> = pair.split('=').collect();
        if parts.len() != 2 {
            return Err(NodeSelectorError::InvalidPair(pair.to_string()));
        }

        let key = parts[0].trim();
        let value = parts[1].trim();
        if key.is_empty() || value.is_empty() {
            return Err(NodeSelectorError::EmptyKeyOrValue(pair.to_string()));
        }

        selector.insert(key.to_string(), value.to_string());
    }

    Ok(selector)
}

/// Rewrite an image reference to pull from `registry`
///
/// A leading path segment containing a `.` is treated as the original
/// registry and dropped.
pub fn build_image_name(image: &str, registry: &str) -> String {
    if registry.is_empty() {
        return image.to_string();
    }

    let path = match image.split_once('/') {
        Some((first, rest)) if first.contains('.') => rest,
        _ => image,
    };
    format!("{}/{}", registry.trim_end_matches('/'), path)
}

fn image_pull_secrets(secret: Option<&str>) -> Option<Vec<LocalObjectReference>> {
    secret.filter(|s| !s.is_empty()).map(|name| {
        vec![LocalObjectReference {
            name: Some(name.to_string()),
        }]
    })
}
