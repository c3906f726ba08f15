//! Pod orchestration
//!
//! A pod is one logical processing stage. It is realized as up to three
//! kinds of Kubernetes workloads: an optional head, one or more shards and an
//! optional tail. [`TopologyBuilder`] decides which exist, [`DeploymentUnit`]
//! manages one of them and [`PodOrchestrator`] starts them in order and tears
//! them down in reverse.

pub mod args;
pub mod descriptor;
pub mod exit_stack;
pub mod orchestrator;
pub mod topology;
pub mod unit;

use std::time::Duration;

use thiserror::Error;

use crate::k8s::ControlPlaneError;

pub use args::{PodArgs, PodKind, Polling, UnitArgs, UnitKind, UnitRole, GATEWAY_NAME};
pub use descriptor::TopologyNode;
pub use exit_stack::ExitStack;
pub use orchestrator::{PodOrchestrator, StartOptions, TeardownFailure, TeardownReport, UnitSlot};
pub use topology::{TopologyBuilder, TopologyPlan};
pub use unit::{
    CloseOutcome, DeploymentUnit, UnitContext, UnitPhase, UnitPorts, WaitOptions,
    FIXED_HEAD_PORT_IN, FIXED_TAIL_PORT_OUT,
};

/// Errors that can occur while planning, starting or waiting on a pod
#[derive(Error, Debug)]
pub enum PodError {
    #[error("Invalid topology arguments: {0}")]
    InvalidTopologyArgs(String),

    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Unit '{unit}' not ready after {elapsed:?}")]
    ReadinessTimeout { unit: String, elapsed: Duration },

    #[error("Readiness wait for unit '{unit}' was cancelled")]
    Cancelled { unit: String },
}
