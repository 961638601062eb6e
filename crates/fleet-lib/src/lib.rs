//! Fleet agent orchestration for Longhorn node preparation
//!
//! This crate provides the core functionality for:
//! - Building per-node agent workloads from command parameters
//! - Temporary cluster access for agents
//! - Supervising container conditions across every pod of a workload
//! - Collecting and aggregating per-node agent output into reports
//! - Cleaning up everything a session created
//!
//! The fleet commands built on top of these live in [`operations`].

pub mod access;
pub mod cleaner;
pub mod cluster;
pub mod collector;
pub mod consts;
pub mod descriptor;
pub mod error;
pub mod models;
pub mod operations;
pub mod report;
pub mod session;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use cluster::{ClusterApi, KubeCluster};
pub use descriptor::{build_image_name, parse_node_selector, AgentDescriptor};
pub use error::{CleanupError, ClusterError, FleetError, Result, SupervisionError};
pub use models::*;
pub use operations::{execute, Execution, FleetOperation, FleetOptions};
pub use report::{render, ClusterReport, Report};
pub use session::{Session, WorkloadRef};
pub use supervisor::{Condition, MonitorConfig, PatienceBudget};
