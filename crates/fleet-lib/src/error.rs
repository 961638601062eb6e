//! Error taxonomy for fleet sessions
//!
//! Configuration errors are raised before anything is created in the
//! cluster. Provisioning, supervision, collection and aggregation errors
//! are fatal for the operation. Cleanup errors are reported on their own
//! and never change the verdict of the operation they follow.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias used across the crate
pub type Result<T, E = FleetError> = std::result::Result<T, E>;

/// A single Kubernetes request failed
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("request for {kind} {name} failed")]
    Api {
        kind: &'static str,
        name: String,
        #[source]
        source: kube::Error,
    },
}

impl ClusterError {
    /// Classify a kube error for the given object
    pub fn from_kube(kind: &'static str, name: impl Into<String>, source: kube::Error) -> Self {
        let name = name.into();
        match &source {
            kube::Error::Api(response) if response.code == 404 => Self::NotFound { kind, name },
            kube::Error::Api(response) if response.code == 409 => {
                Self::AlreadyExists { kind, name }
            }
            _ => Self::Api { kind, name, source },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Message with the API cause appended, for places that flatten the
    /// error into text
    pub fn detail(&self) -> String {
        match self {
            Self::Api { source, .. } => format!("{self}: {source}"),
            other => other.to_string(),
        }
    }
}

/// Why the supervisor stopped without reaching its target condition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisionFailure {
    #[error("pod container is in crash loop. View the logs using \"kubectl -n {namespace} logs {pod} -c {container}\"")]
    CrashLoop {
        namespace: String,
        pod: String,
        container: String,
    },

    #[error("exceeded maximum tolerated condition after {unmet_ticks} unmet poll ticks")]
    PatienceExhausted { unmet_ticks: u32 },

    #[error("timed out after {0:?} waiting for the container condition")]
    HardTimeout(Duration),

    #[error("Kubernetes API request failed: {0}")]
    Api(String),
}

/// The single error class surfaced for every non-satisfied supervision outcome
#[derive(Debug, Clone, Error)]
#[error("failed DaemonSet condition check for container {container} of {namespace}/{workload} after {ticks} poll ticks: {failure}")]
pub struct SupervisionError {
    pub namespace: String,
    pub workload: String,
    pub container: String,
    pub ticks: u32,
    #[source]
    pub failure: SupervisionFailure,
}

/// Malformed `key=value` node selector expression
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeSelectorError {
    #[error("invalid key-value pair: {0:?} (expected format key=value)")]
    InvalidPair(String),

    #[error("key and value must be non-empty in pair: {0:?}")]
    EmptyKeyOrValue(String),
}

/// Top-level error of a fleet operation
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse node selector: {0}")]
    NodeSelector(#[from] NodeSelectorError),

    #[error("failed to provision {what}: {source}")]
    Provision {
        what: String,
        #[source]
        source: ClusterError,
    },

    #[error("failed to remove resources left by a previous run: {0}")]
    Stale(#[source] CleanupError),

    #[error(transparent)]
    Supervision(#[from] SupervisionError),

    #[error("failed to collect agent output: {0}")]
    Collection(#[source] ClusterError),

    #[error("failed to parse agent output from node {node}: {source}")]
    Aggregation {
        node: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to render report: {0}")]
    Render(#[from] serde_yaml::Error),
}

impl FleetError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Typed list of `(item, cause)` pairs rendered as a numbered list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemErrors {
    items: Vec<(String, String)>,
}

impl ItemErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: impl Into<String>, cause: impl fmt::Display) {
        self.items.push((item.into(), cause.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(i, c)| (i.as_str(), c.as_str()))
    }

    pub fn extend(&mut self, other: ItemErrors) {
        self.items.extend(other.items);
    }
}

impl fmt::Display for ItemErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (item, cause)) in self.items.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "{}. {}: {}", index + 1, item, cause)?;
        }
        Ok(())
    }
}

/// One or more resources of a session could not be deleted
#[derive(Debug, Clone, Error)]
#[error("failed to clean up {session} ({} error(s)):\n{errors}", errors.len())]
pub struct CleanupError {
    pub session: String,
    pub errors: ItemErrors,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_cluster_error_classification() {
        assert!(ClusterError::from_kube("DaemonSet", "ds", api_error(404)).is_not_found());
        assert!(matches!(
            ClusterError::from_kube("DaemonSet", "ds", api_error(409)),
            ClusterError::AlreadyExists { .. }
        ));
        assert!(matches!(
            ClusterError::from_kube("DaemonSet", "ds", api_error(500)),
            ClusterError::Api { .. }
        ));
    }

    #[test]
    fn test_cluster_error_cause_is_not_repeated() {
        let err = ClusterError::from_kube("DaemonSet", "default/checker", api_error(500));

        assert_eq!(err.to_string(), "request for DaemonSet default/checker failed");
        assert!(std::error::Error::source(&err).is_some());

        let chain = anyhow::Error::from(err).context("Failed to run preflight checker");
        let rendered = format!("{chain:#}");
        assert!(rendered.starts_with(
            "Failed to run preflight checker: request for DaemonSet default/checker failed: "
        ));
        assert!(rendered.contains("boom"));
    }

    #[test]
    fn test_cluster_error_detail_keeps_cause() {
        let err = ClusterError::from_kube("DaemonSet", "default/checker", api_error(500));
        assert!(err.detail().starts_with("request for DaemonSet default/checker failed: "));
        assert!(err.detail().contains("boom"));

        let err = ClusterError::from_kube("DaemonSet", "default/checker", api_error(404));
        assert_eq!(err.detail(), err.to_string());
    }

    #[test]
    fn test_item_errors_numbered_list() {
        let mut errors = ItemErrors::new();
        errors.push("DaemonSet default/checker", "forbidden");
        errors.push("ClusterRole checker", "timeout");

        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors.to_string(),
            "1. DaemonSet default/checker: forbidden\n2. ClusterRole checker: timeout"
        );
    }

    #[test]
    fn test_cleanup_error_message() {
        let mut errors = ItemErrors::new();
        errors.push("DaemonSet default/trimmer", "forbidden");
        let err = CleanupError {
            session: "longhorn-volume-trimmer".to_string(),
            errors,
        };

        let message = err.to_string();
        assert!(message.starts_with("failed to clean up longhorn-volume-trimmer (1 error(s)):"));
        assert!(message.ends_with("1. DaemonSet default/trimmer: forbidden"));
    }

    #[test]
    fn test_supervision_error_names_workload() {
        let err = SupervisionError {
            namespace: "default".to_string(),
            workload: "longhorn-preflight-checker".to_string(),
            container: "init-longhornctl".to_string(),
            ticks: 301,
            failure: SupervisionFailure::PatienceExhausted { unmet_ticks: 300 },
        };

        let message = err.to_string();
        assert!(message.starts_with("failed DaemonSet condition check"));
        assert!(message.contains("default/longhorn-preflight-checker"));
        assert!(message.contains("after 301 poll ticks"));
        assert!(message.contains("300 unmet poll ticks"));
    }
}
