//! Async driver for the supervision state machine

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use super::{desired_scheduled, Condition, PatienceBudget, PodObservation, Supervision, SupervisorState};
use crate::cluster::ClusterApi;
use crate::collector::{CollectOptions, ResultCollector};
use crate::error::{FleetError, SupervisionError, SupervisionFailure};
use crate::session::WorkloadRef;

/// Timing of the supervision loop
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Delay between poll ticks (default: 1 second)
    pub poll_interval: Duration,
    /// Safety net bounding the whole wait (default: 1 hour)
    pub hard_deadline: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            hard_deadline: Duration::from_secs(60 * 60),
        }
    }
}

/// Waits for a container condition across every pod of one workload
pub struct WorkloadMonitor {
    cluster: Arc<dyn ClusterApi>,
    workload: WorkloadRef,
    config: MonitorConfig,
}

impl WorkloadMonitor {
    pub fn new(cluster: Arc<dyn ClusterApi>, workload: WorkloadRef, config: MonitorConfig) -> Self {
        Self {
            cluster,
            workload,
            config,
        }
    }

    pub fn workload(&self) -> &WorkloadRef {
        &self.workload
    }

    /// Block until `container` satisfies `condition` on every pod
    ///
    /// Polling runs on its own task and reports a single outcome. The
    /// caller races that outcome against the hard deadline. Any failure is
    /// preceded by a dump of the container logs of the failing pods.
    pub async fn wait_for(
        &self,
        container: &str,
        condition: Condition,
        budget: PatienceBudget,
    ) -> Result<(), SupervisionError> {
        info!(
            kind = self.workload.kind,
            namespace = %self.workload.namespace,
            name = %self.workload.name,
            container,
            condition = ?condition,
            patience = budget.ceiling(),
            "Waiting for DaemonSet container condition"
        );

        let supervision = Supervision::new(container, condition, budget);
        let progress = Arc::new(AtomicU32::new(0));
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let task = tokio::spawn(poll_until_terminal(
            self.cluster.clone(),
            self.workload.clone(),
            supervision,
            self.config.poll_interval,
            progress.clone(),
            outcome_tx,
        ));

        let (state, ticks) = tokio::select! {
            outcome = outcome_rx => match outcome {
                Ok(supervision) => (supervision.state().clone(), supervision.ticks()),
                Err(_) => (
                    SupervisorState::ApiError("supervisor task ended without an outcome".to_string()),
                    progress.load(Ordering::SeqCst),
                ),
            },
            _ = sleep(self.config.hard_deadline) => {
                task.abort();
                // joined so no poll is in flight once cleanup starts
                let _ = task.await;
                (SupervisorState::HardTimeout, progress.load(Ordering::SeqCst))
            }
        };

        let failure = match state {
            SupervisorState::Satisfied => {
                info!(
                    name = %self.workload.name,
                    container,
                    ticks,
                    "DaemonSet container condition satisfied"
                );
                return Ok(());
            }
            SupervisorState::CrashLoopDetected { pod } => SupervisionFailure::CrashLoop {
                namespace: self.workload.namespace.clone(),
                pod,
                container: container.to_string(),
            },
            SupervisorState::PatienceExhausted { unmet_ticks } => {
                SupervisionFailure::PatienceExhausted { unmet_ticks }
            }
            SupervisorState::HardTimeout => SupervisionFailure::HardTimeout(self.config.hard_deadline),
            SupervisorState::ApiError(message) => SupervisionFailure::Api(message),
            other => SupervisionFailure::Api(format!("supervisor stopped in state {other:?}")),
        };

        self.log_diagnostics(container).await;

        Err(SupervisionError {
            namespace: self.workload.namespace.clone(),
            workload: self.workload.name.clone(),
            container: container.to_string(),
            ticks,
            failure,
        })
    }

    /// Log the target container output of pods that did not end healthy
    async fn log_diagnostics(&self, container: &str) {
        debug!(name = %self.workload.name, container, "Getting DaemonSet pods container logs");

        let collector = ResultCollector::new(self.cluster.clone());
        let options = CollectOptions {
            prefix: true,
            only_failed: true,
            tail_lines: None,
        };

        let results = match collector.collect(&self.workload, container, &options).await {
            Ok(results) => results,
            Err(e) => {
                warn!(
                    name = %self.workload.name,
                    container,
                    error = %e.detail(),
                    "Failed to get DaemonSet pods container logs"
                );
                return;
            }
        };

        for result in results {
            if let Some(error) = result.error.as_deref() {
                warn!(pod = %result.pod_name, node = %result.node_name, error, "Pod container log unavailable");
                continue;
            }
            if result.output.is_empty() {
                continue;
            }
            warn!(
                pod = %result.pod_name,
                node = %result.node_name,
                container,
                "Pod container log:\n{}",
                result.output.trim_end()
            );
        }
    }
}

async fn poll_until_terminal(
    cluster: Arc<dyn ClusterApi>,
    workload: WorkloadRef,
    mut supervision: Supervision,
    interval: Duration,
    progress: Arc<AtomicU32>,
    outcome_tx: oneshot::Sender<Supervision>,
) {
    loop {
        let pods = match cluster
            .list_pods(&workload.namespace, &workload.label_selector)
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                trace!(error = %e, "Failed to list pods");
                supervision.fail(e.detail());
                break;
            }
        };

        let desired = if supervision.is_scheduled() {
            None
        } else {
            trace!(name = %workload.name, "Waiting for DaemonSet to schedule pods");
            match cluster.get_daemon_set(&workload.namespace, &workload.name).await {
                Ok(daemon_set) => desired_scheduled(&daemon_set),
                Err(e) => {
                    trace!(error = %e, "Failed to get DaemonSet");
                    supervision.fail(e.detail());
                    break;
                }
            }
        };

        let observations: Vec<PodObservation> = pods.iter().map(PodObservation::from_pod).collect();
        let state = supervision.observe(desired, &observations).clone();
        progress.store(supervision.ticks(), Ordering::SeqCst);

        if state.is_terminal() {
            break;
        }

        if state == SupervisorState::WaitingForCondition {
            trace!(
                container = supervision.container(),
                tolerating = supervision.budget().remaining(),
                "Waiting for pod container condition to be met"
            );
        }

        sleep(interval).await;
    }

    let _ = outcome_tx.send(supervision);
}

/// Builder for [`WorkloadMonitor`]
pub struct WorkloadMonitorBuilder {
    cluster: Option<Arc<dyn ClusterApi>>,
    workload: Option<WorkloadRef>,
    config: MonitorConfig,
}

impl WorkloadMonitorBuilder {
    pub fn new() -> Self {
        Self {
            cluster: None,
            workload: None,
            config: MonitorConfig::default(),
        }
    }

    pub fn cluster(mut self, cluster: Arc<dyn ClusterApi>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn workload(mut self, workload: WorkloadRef) -> Self {
        self.workload = Some(workload);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn hard_deadline(mut self, deadline: Duration) -> Self {
        self.config.hard_deadline = deadline;
        self
    }

    pub fn config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<WorkloadMonitor, FleetError> {
        let cluster = self
            .cluster
            .ok_or_else(|| FleetError::config("cluster client is required"))?;
        let workload = self
            .workload
            .ok_or_else(|| FleetError::config("workload is required"))?;

        Ok(WorkloadMonitor::new(cluster, workload, self.config))
    }
}

impl Default for WorkloadMonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
