//! Workload supervision
//!
//! The supervisor is split in two:
//! - a pure state machine ([`Supervision`]) that consumes one poll tick worth
//!   of observations at a time and decides the next state
//! - an async monitor ([`WorkloadMonitor`]) that performs the API calls,
//!   feeds the state machine, and races it against the hard deadline
//!
//! Crash-loop detection takes precedence over the patience budget on every
//! tick, and a workload with zero desired pods is satisfied without the
//! condition ever being evaluated.

mod monitor;


pub use monitor::{MonitorConfig, WorkloadMonitor, WorkloadMonitorBuilder};

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};

const REASON_CRASH_LOOP: &str = "CrashLoopBackOff";
const REASON_POD_INITIALIZING: &str = "PodInitializing";
const REASON_COMPLETED: &str = "Completed";

/// Observed state of one named container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerPhase {
    Pending,
    Initializing,
    Ready,
    Completed,
    CrashLooping,
}

impl ContainerPhase {
    fn from_status(status: &ContainerStatus) -> Self {
        let Some(state) = status.state.as_ref() else {
            return Self::Pending;
        };

        if let Some(waiting) = state.waiting.as_ref() {
            return match waiting.reason.as_deref() {
                Some(REASON_CRASH_LOOP) => Self::CrashLooping,
                Some(REASON_POD_INITIALIZING) => Self::Initializing,
                _ => Self::Pending,
            };
        }

        if let Some(terminated) = state.terminated.as_ref() {
            let completed = terminated.reason.as_deref() == Some(REASON_COMPLETED)
                || terminated.exit_code == 0;
            return if completed { Self::Completed } else { Self::Pending };
        }

        if status.ready && state.running.is_some() {
            return Self::Ready;
        }

        Self::Pending
    }

    /// Healthy terminal phase for the purpose of diagnostic log filtering
    pub fn is_healthy(self) -> bool {
        matches!(self, Self::Ready | Self::Completed)
    }
}

/// Per-tick snapshot of one agent pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodObservation {
    pub pod_name: String,
    pub node_name: String,
    pub containers: BTreeMap<String, ContainerPhase>,
}

impl PodObservation {
    pub fn from_pod(pod: &Pod) -> Self {
        let mut containers = BTreeMap::new();
        if let Some(status) = pod.status.as_ref() {
            let init = status.init_container_statuses.iter().flatten();
            let regular = status.container_statuses.iter().flatten();
            for container in init.chain(regular) {
                containers.insert(container.name.clone(), ContainerPhase::from_status(container));
            }
        }

        Self {
            pod_name: pod.metadata.name.clone().unwrap_or_default(),
            node_name: pod
                .spec
                .as_ref()
                .and_then(|spec| spec.node_name.clone())
                .unwrap_or_default(),
            containers,
        }
    }

    /// Phase of a container, `Pending` when it has no status yet
    pub fn phase(&self, container: &str) -> ContainerPhase {
        self.containers
            .get(container)
            .copied()
            .unwrap_or(ContainerPhase::Pending)
    }
}

/// Predicate the target container must satisfy on every pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    ContainersExited,
    ContainersReady,
}

impl Condition {
    pub fn is_met(self, phase: ContainerPhase) -> bool {
        match self {
            Self::ContainersExited => phase == ContainerPhase::Completed,
            Self::ContainersReady => phase == ContainerPhase::Ready,
        }
    }
}

/// Number of unmet poll ticks tolerated before giving up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatienceBudget {
    ceiling: u32,
    remaining: u32,
}

impl PatienceBudget {
    pub const SHORT: u32 = 60;
    pub const MEDIUM: u32 = 300;
    pub const LONG: u32 = 600;

    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            remaining: ceiling,
        }
    }

    pub fn short() -> Self {
        Self::new(Self::SHORT)
    }

    pub fn medium() -> Self {
        Self::new(Self::MEDIUM)
    }

    pub fn long() -> Self {
        Self::new(Self::LONG)
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Spend one unmet tick. Returns true once the budget is used up.
    pub fn spend(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    Created,
    WaitingForScheduling,
    WaitingForCondition,
    Satisfied,
    CrashLoopDetected { pod: String },
    PatienceExhausted { unmet_ticks: u32 },
    HardTimeout,
    ApiError(String),
}

impl SupervisorState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Self::Created | Self::WaitingForScheduling | Self::WaitingForCondition
        )
    }
}

/// Desired number of scheduled pods, `None` until the controller has
/// observed the current generation
pub fn desired_scheduled(daemon_set: &DaemonSet) -> Option<i32> {
    let status = daemon_set.status.as_ref()?;
    let generation = daemon_set.metadata.generation.unwrap_or_default();
    if status.observed_generation.unwrap_or_default() < generation {
        return None;
    }
    Some(status.desired_number_scheduled)
}

/// State of one supervision run, advanced one poll tick at a time
#[derive(Debug, Clone)]
pub struct Supervision {
    container: String,
    condition: Condition,
    budget: PatienceBudget,
    state: SupervisorState,
    ticks: u32,
    evaluations: u64,
}

impl Supervision {
    pub fn new(container: impl Into<String>, condition: Condition, budget: PatienceBudget) -> Self {
        Self {
            container: container.into(),
            condition,
            budget,
            state: SupervisorState::Created,
            ticks: 0,
            evaluations: 0,
        }
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn budget(&self) -> PatienceBudget {
        self.budget
    }

    /// Poll ticks observed so far
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    /// Number of per-pod predicate evaluations performed so far
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    pub fn is_scheduled(&self) -> bool {
        !matches!(
            self.state,
            SupervisorState::Created | SupervisorState::WaitingForScheduling
        )
    }

    /// Advance by one poll tick
    ///
    /// `desired` is only consulted while waiting for scheduling.
    pub fn observe(&mut self, desired: Option<i32>, pods: &[PodObservation]) -> &SupervisorState {
        if self.state.is_terminal() {
            return &self.state;
        }
        self.ticks += 1;

        if self.state == SupervisorState::Created {
            self.state = SupervisorState::WaitingForScheduling;
        }

        if self.state == SupervisorState::WaitingForScheduling {
            match desired {
                Some(0) => {
                    self.state = SupervisorState::Satisfied;
                    return &self.state;
                }
                Some(count) if usize::try_from(count).ok() == Some(pods.len()) => {
                    self.state = SupervisorState::WaitingForCondition;
                }
                _ => return &self.state,
            }
        }

        if let Some(pod) = pods
            .iter()
            .find(|pod| pod.phase(&self.container) == ContainerPhase::CrashLooping)
        {
            self.state = SupervisorState::CrashLoopDetected {
                pod: pod.pod_name.clone(),
            };
            return &self.state;
        }

        let mut unmet = false;
        for pod in pods {
            self.evaluations += 1;
            if !self.condition.is_met(pod.phase(&self.container)) {
                unmet = true;
                break;
            }
        }

        if !unmet {
            self.state = SupervisorState::Satisfied;
        } else if self.budget.spend() {
            self.state = SupervisorState::PatienceExhausted {
                unmet_ticks: self.budget.ceiling(),
            };
        }

        &self.state
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        if !self.state.is_terminal() {
            self.state = SupervisorState::ApiError(message.into());
        }
    }
}
