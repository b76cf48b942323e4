//! Per-issue phase pipeline.
//!
//! An [`IssuePipeline`] walks an issue through its [`PhaseDefinition`]s in id
//! order. For each phase it opens an isolation session when the phase is
//! sandboxed, runs the phase executor under the retry policy, records the
//! result, then runs the registered gates. Outcomes are values, not errors:
//!
//! - `Completed`: every phase succeeded
//! - `CompletedWithFailures`: only non-critical phases failed
//! - `AbortedCritical`: a critical phase failed and the rest were skipped
//! - `Cancelled`: the fleet was interrupted
//!
//! [`PhaseDefinition`]: crate::phase::PhaseDefinition

mod agent;
mod context;
mod machine;
mod tasks;

pub use agent::{
    AgentLauncher, AgentOutput, AgentPhaseExecutor, AgentRequest, CommandLauncher, CommitManager,
    GitCommitManager, PhaseExecutor, parse_pull_request, parse_token_usage,
};
pub use context::{PhaseContext, ProgressWriter, TokenTracker};
pub use machine::{ExecutorRegistry, IsolationRuntime, IssuePipeline, PipelineOutcome};
pub use tasks::TaskPlanExecutor;
