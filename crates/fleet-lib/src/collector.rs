//! Result collection
//!
//! Reads the target container's log of every agent pod and turns it into
//! one [`NodeResult`] per pod. Pods that are being deleted are skipped.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::cluster::ClusterApi;
use crate::error::ClusterError;
use crate::models::NodeResult;
use crate::session::WorkloadRef;
use crate::supervisor::PodObservation;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectOptions {
    /// Prefix every line with `[pod/<pod>/<container>] `
    pub prefix: bool,
    /// Keep output only for pods whose container did not end healthy
    pub only_failed: bool,
    /// Limit the log to its last lines
    pub tail_lines: Option<i64>,
}

impl CollectOptions {
    pub fn tail(lines: i64) -> Self {
        Self {
            tail_lines: Some(lines),
            ..Default::default()
        }
    }
}

pub struct ResultCollector {
    cluster: Arc<dyn ClusterApi>,
}

impl ResultCollector {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Collect `container` output from every live pod of the workload
    ///
    /// A failure to list pods is returned. A failure to read one pod's log
    /// is recorded on that pod's result instead.
    pub async fn collect(
        &self,
        workload: &WorkloadRef,
        container: &str,
        options: &CollectOptions,
    ) -> Result<Vec<NodeResult>, ClusterError> {
        let pods = self
            .cluster
            .list_pods(&workload.namespace, &workload.label_selector)
            .await?;

        let mut results = Vec::with_capacity(pods.len());
        for pod in &pods {
            if pod.metadata.deletion_timestamp.is_some() {
                trace!(pod = ?pod.metadata.name, "Pod is being deleted");
                continue;
            }

            let observation = PodObservation::from_pod(pod);
            let mut result = NodeResult {
                pod_name: observation.pod_name.clone(),
                node_name: observation.node_name.clone(),
                ..Default::default()
            };

            let log = self
                .cluster
                .container_logs(
                    &workload.namespace,
                    &observation.pod_name,
                    container,
                    options.tail_lines,
                )
                .await;

            match log {
                Ok(text) => {
                    if options.only_failed && observation.phase(container).is_healthy() {
                        debug!(pod = %observation.pod_name, container, "Pod container did not fail");
                    } else {
                        result.output = accumulate_lines(
                            &text,
                            options.prefix.then(|| line_prefix(&observation.pod_name, container)),
                        );
                    }
                }
                Err(e) => {
                    warn!(pod = %observation.pod_name, container, error = %e.detail(), "Failed to get pod container log");
                    result.error = Some(e.detail());
                }
            }

            results.push(result);
        }

        Ok(results)
    }
}

fn line_prefix(pod: &str, container: &str) -> String {
    format!("[pod/{pod}/{container}] ")
}

/// Rebuild log text line by line, keeping a final unterminated line
fn accumulate_lines(text: &str, prefix: Option<String>) -> String {
    let Some(prefix) = prefix else {
        return text.to_string();
    };

    let mut accumulated = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        accumulated.push_str(&prefix);
        accumulated.push_str(line);
    }
    accumulated
}
