use super::agent::{AgentPhaseExecutor, PhaseExecutor};
use super::context::PhaseContext;
use super::tasks::TaskPlanExecutor;
use crate::checkpoint::{PhaseResult, PipelineStatus};
use crate::errors::PhaseError;
use crate::gates::{GateContext, GateRegistry};
use crate::isolation::{
    IsolationPolicy, IsolationProvider, NegotiationOptions, SessionHandle, negotiate,
};
use crate::phase::PhaseDefinition;
use crate::retry::retry;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Terminal state of one issue pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    CompletedWithFailures { failed_phases: Vec<u32> },
    AbortedCritical { phase: u32, name: String, error: String },
    Cancelled,
}

impl PipelineOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineOutcome::Completed)
    }
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineOutcome::Completed => write!(f, "completed"),
            PipelineOutcome::CompletedWithFailures { failed_phases } => {
                write!(f, "completed with failed phases {:?}", failed_phases)
            }
            PipelineOutcome::AbortedCritical { phase, name, error } => {
                write!(f, "phase {} ({}) failed: {}", phase, name, error)
            }
            PipelineOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Executors by phase id, with an optional fallback for unlisted phases.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<u32, Arc<dyn PhaseExecutor>>,
    fallback: Option<Arc<dyn PhaseExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `executor` for every phase without a specific one.
    pub fn with_default(executor: Arc<dyn PhaseExecutor>) -> Self {
        Self {
            executors: HashMap::new(),
            fallback: Some(executor),
        }
    }

    /// The agent executor for every phase, and the task plan executor for
    /// phases that run one.
    pub fn for_phases(phases: &[PhaseDefinition]) -> Self {
        let mut registry = Self::with_default(Arc::new(AgentPhaseExecutor::new()));
        for phase in phases.iter().filter(|p| p.task_plan) {
            registry = registry.register(phase.id, Arc::new(TaskPlanExecutor::new()));
        }
        registry
    }

    pub fn register(mut self, phase: u32, executor: Arc<dyn PhaseExecutor>) -> Self {
        self.executors.insert(phase, executor);
        self
    }

    pub fn get(&self, phase: u32) -> Option<Arc<dyn PhaseExecutor>> {
        self.executors
            .get(&phase)
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}

/// The provider and policy sandboxed phases run under.
#[derive(Clone)]
pub struct IsolationRuntime {
    pub provider: Arc<dyn IsolationProvider>,
    pub policy: IsolationPolicy,
    pub options: NegotiationOptions,
}

impl IsolationRuntime {
    async fn open_session(&self, working_dir: &std::path::Path) -> Result<SessionHandle, PhaseError> {
        let provider = negotiate(self.provider.clone(), &self.policy, &self.options)?;
        let mut policy = self.policy.clone();
        if policy.working_dir.is_none() {
            policy.working_dir = Some(working_dir.to_path_buf());
        }
        Ok(SessionHandle::start(provider, &policy).await?)
    }
}

/// Drives one issue through its phases.
///
/// Phases run strictly in id order. Every phase outcome is checkpointed before
/// the next phase starts, so a later run resumes after the last recorded phase.
pub struct IssuePipeline {
    phases: Vec<PhaseDefinition>,
    executors: ExecutorRegistry,
    gates: GateRegistry,
    isolation: Option<IsolationRuntime>,
    cancel: CancellationToken,
}

enum PhaseFailure {
    Failed(String),
    Cancelled,
}

impl IssuePipeline {
    pub fn new(phases: Vec<PhaseDefinition>, executors: ExecutorRegistry) -> Self {
        Self {
            phases,
            executors,
            gates: GateRegistry::new(),
            isolation: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_gates(mut self, gates: GateRegistry) -> Self {
        self.gates = gates;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationRuntime) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    fn phase(&self, id: u32) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// Run the remaining phases for the issue in `ctx`.
    ///
    /// Errors are reserved for checkpoint persistence; phase failures are
    /// reported through the outcome.
    pub async fn run(&self, ctx: &PhaseContext) -> Result<PipelineOutcome> {
        let issue = ctx.issue.number;
        self.prepare_resume(ctx).await?;

        let state = ctx.checkpoint.snapshot().await;
        let last_recorded = state.last_phase().map(|r| r.phase).unwrap_or(0);
        let mut failed_phases = state.failed_phases();
        if last_recorded > 0 {
            tracing::info!(issue, last_recorded, "resuming pipeline");
        }

        for phase in self.phases.iter().filter(|p| p.id > last_recorded) {
            if self.cancel.is_cancelled() {
                tracing::info!(issue, phase = phase.id, "cancelled before phase start");
                return Ok(PipelineOutcome::Cancelled);
            }

            ctx.checkpoint
                .set_status(PipelineStatus::Running, phase.id)
                .await?;
            ctx.update_progress(&format!("phase {} ({}) started", phase.id, phase.name));

            let started = Instant::now();
            let tokens_before = ctx.tokens.used();
            let result = self.execute_phase(ctx, phase).await;
            let duration = started.elapsed();
            let tokens = ctx.tokens.used().saturating_sub(tokens_before);

            let failure = match result {
                Ok(artifact) => {
                    ctx.checkpoint
                        .record_phase_result(phase_result(phase, true, duration, tokens, Some(artifact), None))
                        .await?;
                    self.apply_gates(ctx, phase).await?
                }
                Err(PhaseFailure::Cancelled) => {
                    tracing::info!(issue, phase = phase.id, "phase interrupted");
                    return Ok(PipelineOutcome::Cancelled);
                }
                Err(PhaseFailure::Failed(error)) => {
                    ctx.checkpoint
                        .record_phase_result(phase_result(
                            phase,
                            false,
                            duration,
                            tokens,
                            None,
                            Some(error.clone()),
                        ))
                        .await?;
                    Some(error)
                }
            };

            match failure {
                None => {
                    ctx.update_progress(&format!("phase {} ({}) completed", phase.id, phase.name));
                    self.commit_phase(ctx, phase).await;
                }
                Some(error) if phase.critical => {
                    tracing::error!(issue, phase = phase.id, error = %error, "critical phase failed");
                    ctx.checkpoint
                        .set_status(PipelineStatus::Failed, phase.id)
                        .await?;
                    return Ok(PipelineOutcome::AbortedCritical {
                        phase: phase.id,
                        name: phase.name.clone(),
                        error,
                    });
                }
                Some(error) => {
                    tracing::warn!(issue, phase = phase.id, error = %error, "non-critical phase failed, continuing");
                    failed_phases.push(phase.id);
                }
            }
        }

        let final_phase = self.phases.last().map(|p| p.id).unwrap_or(0);
        if failed_phases.is_empty() {
            ctx.checkpoint
                .set_status(PipelineStatus::Completed, final_phase)
                .await?;
            Ok(PipelineOutcome::Completed)
        } else {
            ctx.checkpoint
                .set_status(PipelineStatus::CompletedWithFailures, final_phase)
                .await?;
            Ok(PipelineOutcome::CompletedWithFailures { failed_phases })
        }
    }

    /// Drop a trailing failed critical phase so it runs again.
    async fn prepare_resume(&self, ctx: &PhaseContext) -> Result<()> {
        let state = ctx.checkpoint.snapshot().await;
        if let Some(last) = state.last_phase()
            && !last.success
            && self.phase(last.phase).is_some_and(|p| p.critical)
        {
            tracing::info!(
                issue = ctx.issue.number,
                phase = last.phase,
                "retrying previously failed critical phase"
            );
            ctx.checkpoint.discard_trailing_phase().await?;
        }
        Ok(())
    }

    /// Run one phase's executor, inside an isolation session when the phase is sandboxed.
    async fn execute_phase(
        &self,
        ctx: &PhaseContext,
        phase: &PhaseDefinition,
    ) -> Result<PathBuf, PhaseFailure> {
        if let Err(e) = ctx.check_budget() {
            return Err(PhaseFailure::Failed(e.to_string()));
        }

        let Some(executor) = self.executors.get(phase.id) else {
            let err = PhaseError::NoExecutor {
                phase: phase.id,
                name: phase.name.clone(),
            };
            return Err(PhaseFailure::Failed(err.to_string()));
        };

        let session = match (&self.isolation, phase.sandboxed) {
            (Some(isolation), true) => {
                match isolation.open_session(&ctx.working_checkout_path).await {
                    Ok(session) => {
                        tracing::debug!(
                            issue = ctx.issue.number,
                            phase = phase.id,
                            provider = session.provider_name(),
                            session = session.id(),
                            "isolation session started"
                        );
                        Some(session)
                    }
                    Err(e) => return Err(PhaseFailure::Failed(e.to_string())),
                }
            }
            (None, true) => {
                tracing::debug!(
                    issue = ctx.issue.number,
                    phase = phase.id,
                    "no isolation provider configured, running sandboxed phase on host"
                );
                None
            }
            _ => None,
        };
        ctx.set_session(session).await;

        let issue = ctx.issue.number;
        let phase_id = phase.id;
        let options = ctx.retry.to_options().on_retry(move |attempt, e: &anyhow::Error| {
            tracing::warn!(issue, phase = phase_id, attempt, error = %e, "phase attempt failed, retrying");
        });
        let executor = executor.as_ref();

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PhaseFailure::Cancelled),
            result = retry(|_| executor.execute(ctx, phase), options) => {
                let attempts = result.attempts;
                result.into_result().map_err(|e| {
                    tracing::debug!(issue, phase = phase_id, attempts, "phase attempts exhausted");
                    PhaseFailure::Failed(format!("{:#}", e))
                })
            }
        };

        if let Some(session) = ctx.set_session(None).await
            && let Err(e) = session.destroy().await
        {
            tracing::warn!(issue, phase = phase_id, error = %e, "failed to destroy isolation session");
        }

        outcome
    }

    /// Run the phase's gates and record the result. Returns the failure message
    /// when the gate failed.
    async fn apply_gates(&self, ctx: &PhaseContext, phase: &PhaseDefinition) -> Result<Option<String>> {
        let gate_ctx = GateContext {
            progress_dir: ctx.progress_dir.clone(),
            working_checkout_path: ctx.working_checkout_path.clone(),
            base_revision: ctx.base_revision.clone(),
        };
        let Some(gate) = self.gates.evaluate(phase.id, &gate_ctx).await else {
            return Ok(None);
        };

        for warning in &gate.warnings {
            tracing::warn!(issue = ctx.issue.number, phase = phase.id, "gate warning: {}", warning);
        }

        let failure = gate
            .is_fail()
            .then(|| format!("gate failed: {}", gate.errors.join("; ")));
        ctx.checkpoint.record_gate_result(phase.id, gate).await?;
        if let Some(error) = &failure {
            ctx.checkpoint
                .fail_trailing_phase(phase.id, error.clone())
                .await?;
        }
        Ok(failure)
    }

    async fn commit_phase(&self, ctx: &PhaseContext, phase: &PhaseDefinition) {
        let Some(commit) = &ctx.commit else {
            return;
        };
        let Some(message) = phase.commit_message(ctx.issue.number, &ctx.issue.title) else {
            return;
        };
        if let Err(e) = commit
            .commit(&ctx.working_checkout_path, phase, &message)
            .await
        {
            tracing::warn!(issue = ctx.issue.number, phase = phase.id, error = %e, "commit failed");
        }
    }
}

fn phase_result(
    phase: &PhaseDefinition,
    success: bool,
    duration: Duration,
    token_usage: u64,
    output_path: Option<PathBuf>,
    error: Option<String>,
) -> PhaseResult {
    PhaseResult {
        phase: phase.id,
        phase_name: phase.name.clone(),
        success,
        duration,
        token_usage,
        output_path,
        error,
        gate_result: None,
        completed_at: Utc::now(),
    }
}
