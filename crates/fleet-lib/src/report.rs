//! Report aggregation
//!
//! Parses each node's captured output as the command's JSON payload, drops
//! payloads that carry nothing, merges the rest into one [`ClusterReport`]
//! and renders it as YAML. A payload that fails to parse aborts the whole
//! aggregation.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FleetError, Result};
use crate::models::{NodeResult, ReplicaCollection, VolumeCollection};

/// Report key mapped to the records reported under it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterReport<T> {
    entries: BTreeMap<String, Vec<T>>,
}

impl<T> Default for ClusterReport<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> ClusterReport<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, record: T) {
        self.entries.entry(key.into()).or_default().push(record);
    }

    pub fn extend(&mut self, key: impl Into<String>, records: impl IntoIterator<Item = T>) {
        self.entries.entry(key.into()).or_default().extend(records);
    }

    /// Append every entry of `other`, keeping per-key order
    pub fn merge(&mut self, other: ClusterReport<T>) {
        for (key, records) in other.entries {
            self.extend(key, records);
        }
    }

    pub fn get(&self, key: &str) -> Option<&[T]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[T])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<T: DeserializeOwned> ClusterReport<T> {
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

/// Serializable final report of a command
pub trait Report: Serialize {
    fn is_empty(&self) -> bool;
}

impl<T: Serialize> Report for ClusterReport<T> {
    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Report for ReplicaCollection {
    fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

impl Report for VolumeCollection {
    fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }
}

/// Render a report as YAML, `None` when it has no entries
pub fn render<R: Report>(report: &R) -> Result<Option<String>> {
    if report.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_yaml::to_string(report)?))
}

/// Parse and merge node payloads into a report
///
/// Nodes whose output could not be collected are skipped with a warning.
/// Payloads equal to their default value are skipped silently.
pub fn aggregate<P, T, F>(results: &[NodeResult], mut merge: F) -> Result<ClusterReport<T>>
where
    P: DeserializeOwned + Default + PartialEq,
    F: FnMut(&mut ClusterReport<T>, &NodeResult, P),
{
    let mut report = ClusterReport::new();

    for result in results {
        if let Some(error) = result.error.as_deref() {
            warn!(pod = %result.pod_name, node = %result.node_name, error, "Skipping node without output");
            continue;
        }

        let payload: P = serde_json::from_str(result.output.trim()).map_err(|source| {
            FleetError::Aggregation {
                node: result.node_name.clone(),
                source,
            }
        })?;

        if payload == P::default() {
            debug!(node = %result.node_name, "Skipping empty payload");
            continue;
        }

        merge(&mut report, result, payload);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LogCollection, NodeCollection, ReplicaInfo};

    fn result(node: &str, output: &str) -> NodeResult {
        NodeResult {
            pod_name: format!("pod-{node}"),
            node_name: node.to_string(),
            output: output.to_string(),
            error: None,
        }
    }

    fn merge_logs(report: &mut ClusterReport<LogCollection>, result: &NodeResult, payload: NodeCollection) {
        if let Some(log) = payload.log {
            report.push(result.node_name.clone(), log);
        }
    }

    #[test]
    fn test_aggregate_all_empty_payloads() {
        let results = vec![result("node-1", "{}"), result("node-2", "{}\n")];

        let report = aggregate(&results, merge_logs).unwrap();

        assert!(report.is_empty());
        assert_eq!(render(&report).unwrap(), None);
    }

    #[test]
    fn test_aggregate_parse_failure_is_fatal() {
        let results = vec![
            result("node-1", r#"{"log":{"info":["ok"]}}"#),
            result("node-2", "not json"),
        ];

        let err = aggregate(&results, merge_logs).unwrap_err();
        match err {
            FleetError::Aggregation { node, .. } => assert_eq!(node, "node-2"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_aggregate_skips_uncollected_nodes() {
        let mut failed = result("node-2", "");
        failed.error = Some("connection reset".to_string());
        let results = vec![result("node-1", r#"{"log":{"warn":["no multipathd"]}}"#), failed];

        let report = aggregate(&results, merge_logs).unwrap();

        assert_eq!(report.len(), 1);
        assert_eq!(report.get("node-1").unwrap()[0].warn, vec!["no multipathd".to_string()]);
    }

    #[test]
    fn test_aggregate_accumulates_under_shared_key() {
        let results = vec![
            result("node-1", r#"{"replicas":{"pvc-1-a1b2c3d4":[{"node":"node-1"}]}}"#),
            result("node-2", r#"{"replicas":{"pvc-1-a1b2c3d4":[{"node":"node-2"}]}}"#),
        ];

        let report: ClusterReport<ReplicaInfo> =
            aggregate(&results, |report, _, payload: ReplicaCollection| {
                report.merge(payload.replicas)
            })
            .unwrap();

        let replicas = report.get("pvc-1-a1b2c3d4").unwrap();
        assert_eq!(replicas.len(), 2);
        assert_eq!(replicas[0].node, "node-1");
        assert_eq!(replicas[1].node, "node-2");
    }

    #[test]
    fn test_report_yaml_round_trip() {
        let mut report = ClusterReport::new();
        report.push(
            "node-1",
            LogCollection {
                error: vec!["iscsid is not running".to_string()],
                info: vec!["nfs4 supported".to_string()],
                warn: vec![],
            },
        );
        report.push("node-1", LogCollection::default());
        report.push(
            "node-2",
            LogCollection {
                warn: vec!["multipathd is running".to_string()],
                ..Default::default()
            },
        );

        let yaml = render(&report).unwrap().unwrap();
        let parsed: ClusterReport<LogCollection> = ClusterReport::from_yaml(&yaml).unwrap();

        assert_eq!(parsed, report);
        assert_eq!(parsed.keys().collect::<Vec<_>>(), vec!["node-1", "node-2"]);
    }
}
