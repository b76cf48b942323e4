//! Typed error hierarchy for the conveyor engine.
//!
//! Five enums cover the five subsystems:
//! - `DagError`: dependency graph construction and state transitions
//! - `IsolationError`: capability negotiation and session lifecycle
//! - `CheckpointError`: checkpoint mutations that violate ordering rules
//! - `PhaseError`: per-phase execution failures
//! - `FleetError`: fleet-level orchestration failures

use crate::dag::NodeStatus;
use thiserror::Error;

/// Errors from the dependency scheduler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DagError {
    #[error("Cycle detected in dependencies. Involved nodes: {nodes:?}")]
    CyclicDependency { nodes: Vec<String> },

    #[error("Unknown dependency '{dependency}' in node '{node}': no node with that id exists")]
    DependencyResolution { node: String, dependency: String },

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Node '{node}' is already {from:?} and cannot be marked {to:?}")]
    InvalidTransition {
        node: String,
        from: NodeStatus,
        to: NodeStatus,
    },
}

/// Errors from isolation negotiation and provider sessions.
#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("Provider '{provider}' cannot satisfy isolation policy: unsupported {}", .mismatches.join(", "))]
    CapabilityMismatch {
        provider: String,
        mismatches: Vec<String>,
    },

    #[error("Unknown isolation session: {0}")]
    UnknownSession(String),

    #[error("Isolation session {0} is not running")]
    SessionNotRunning(String),

    #[error("Failed to execute command in session {session}: {source}")]
    ExecFailed {
        session: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from checkpoint mutations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("Phase {phase} recorded out of order (last recorded phase is {last})")]
    OutOfOrder { phase: u32, last: u32 },

    #[error("No recorded result for phase {phase} to attach a gate result to")]
    NoMatchingPhase { phase: u32 },
}

/// Errors from a single phase execution.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Agent timed out after {timeout_secs}s")]
    AgentTimeout { timeout_secs: u64 },

    #[error("Agent exited with non-zero code {exit_code}: {stderr}")]
    AgentNonZeroExit { exit_code: i32, stderr: String },

    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Token budget exhausted: used {used} of {budget}")]
    BudgetExhausted { used: u64, budget: u64 },

    #[error("No executor registered for phase {phase} ({name})")]
    NoExecutor { phase: u32, name: String },

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Isolation(#[from] IsolationError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the fleet orchestrator.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Invalid issue dependency graph: {0}")]
    InvalidGraph(DagError),

    #[error("Issue scheduler rejected an update: {0}")]
    Scheduler(#[from] DagError),
}
