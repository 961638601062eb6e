//! Payloads written by node agents and the per-node records built from them

use serde::{Deserialize, Serialize};

use crate::report::ClusterReport;

/// Captured output of one agent pod
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeResult {
    pub pod_name: String,
    pub node_name: String,
    /// Raw log text of the collected container
    pub output: String,
    /// Set when the output could not be retrieved for this pod
    pub error: Option<String>,
}

impl NodeResult {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Messages reported by a preflight agent, grouped by severity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCollection {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub info: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warn: Vec<String>,
}

/// Document written by the preflight check and install agents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCollection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogCollection>,
}

/// Contents of a replica's `volume.meta` file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeMeta {
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub head: String,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default)]
    pub rebuilding: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub sector_size: i64,
    #[serde(default)]
    pub backing_file_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_in_use: Option<bool>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub volume_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<VolumeMeta>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub exported_directory: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub warn: String,
}

/// Document written by the replica getter agent, keyed by replica name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaCollection {
    #[serde(default)]
    pub replicas: ClusterReport<ReplicaInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replicas: Vec<ReplicaInfo>,
}

/// Export report keyed by volume name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCollection {
    #[serde(default)]
    pub volumes: ClusterReport<VolumeInfo>,
}
