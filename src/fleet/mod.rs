//! Fleet orchestration: many issues, one control loop.
//!
//! The orchestrator owns the issue [`DependencyScheduler`] and is the only code
//! that touches it. Ready issues are spawned as tokio tasks bounded by a
//! semaphore; each task runs an [`IssuePipeline`] and reports back over an mpsc
//! channel. A failed issue blocks every issue that transitively depends on it.
//!
//! Cancellation stops new spawns and interrupts in-flight pipelines, whose
//! fleet records stay `running` so the next run resumes them.

mod events;

pub use events::{FleetEvent, FleetSummary, IssueReport};

use crate::checkpoint::{FleetCheckpoint, FleetIssueRecord, FleetIssueStatus, IssueCheckpoint};
use crate::config::FleetConfig;
use crate::dag::{DependencyScheduler, NodeSpec};
use crate::errors::FleetError;
use crate::gates::GateRegistry;
use crate::issue::Issue;
use crate::phase::PhaseDefinition;
use crate::pipeline::{
    AgentLauncher, CommitManager, ExecutorRegistry, IsolationRuntime, IssuePipeline, PhaseContext,
    PipelineOutcome, TokenTracker,
};
use anyhow::anyhow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Result of one issue task as sent back to the control loop.
struct IssueRun {
    issue: u64,
    outcome: anyhow::Result<PipelineOutcome>,
    tokens: u64,
}

/// Everything an issue task needs, shared by all tasks of one run.
struct IssueRunner {
    config: Arc<FleetConfig>,
    phases: Vec<PhaseDefinition>,
    executors: ExecutorRegistry,
    gates: GateRegistry,
    launcher: Arc<dyn AgentLauncher>,
    isolation: Option<IsolationRuntime>,
    commit: Option<Arc<dyn CommitManager>>,
    cancel: CancellationToken,
}

impl IssueRunner {
    async fn run(&self, issue: Issue) -> IssueRun {
        let number = issue.number;
        let checkpoint = IssueCheckpoint::load(&self.config.state_dir(), number, &issue.title);
        let spent = checkpoint.snapshot().await.total_tokens();
        let tokens = TokenTracker::new(self.config.token_budget()).with_used(spent);

        let mut ctx = PhaseContext::new(
            issue,
            self.config.project_dir.clone(),
            self.config.clone(),
            self.launcher.clone(),
            checkpoint,
        )
        .with_tokens(tokens);
        if let Some(commit) = &self.commit {
            ctx = ctx.with_commit_manager(commit.clone());
        }

        let mut pipeline = IssuePipeline::new(self.phases.clone(), self.executors.clone())
            .with_gates(self.gates.clone())
            .with_cancellation(self.cancel.child_token());
        if let Some(isolation) = &self.isolation {
            pipeline = pipeline.with_isolation(isolation.clone());
        }

        let outcome = pipeline.run(&ctx).await;
        IssueRun {
            issue: number,
            outcome,
            tokens: ctx.tokens.used(),
        }
    }
}

/// Runs a set of issues through their pipelines with bounded parallelism.
pub struct FleetOrchestrator {
    config: Arc<FleetConfig>,
    phases: Vec<PhaseDefinition>,
    executors: ExecutorRegistry,
    gates: GateRegistry,
    launcher: Arc<dyn AgentLauncher>,
    isolation: Option<IsolationRuntime>,
    commit: Option<Arc<dyn CommitManager>>,
    cancel: CancellationToken,
    event_tx: Option<mpsc::Sender<FleetEvent>>,
}

impl FleetOrchestrator {
    /// Create an orchestrator that runs every phase through the agent launcher,
    /// task by task where the phase follows a plan.
    pub fn new(
        config: Arc<FleetConfig>,
        phases: Vec<PhaseDefinition>,
        launcher: Arc<dyn AgentLauncher>,
    ) -> Self {
        let executors = ExecutorRegistry::for_phases(&phases);
        Self {
            config,
            phases,
            executors,
            gates: GateRegistry::new(),
            launcher,
            isolation: None,
            commit: None,
            cancel: CancellationToken::new(),
            event_tx: None,
        }
    }

    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    pub fn with_gates(mut self, gates: GateRegistry) -> Self {
        self.gates = gates;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationRuntime) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn with_commit_manager(mut self, commit: Arc<dyn CommitManager>) -> Self {
        self.commit = Some(commit);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<FleetEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    async fn emit(&self, event: FleetEvent) {
        if let Some(tx) = &self.event_tx {
            tx.send(event).await.ok();
        }
    }

    /// Run `issues` to completion, failure, or interruption.
    ///
    /// Issues already recorded as completed in the fleet checkpoint are not run
    /// again; their dependents may start immediately.
    pub async fn run(&self, issues: Vec<Issue>) -> Result<FleetSummary, FleetError> {
        let started = Instant::now();
        let mut scheduler = DependencyScheduler::from_nodes(
            issues
                .iter()
                .map(|issue| {
                    NodeSpec::new(
                        issue.node_id(),
                        issue.depends_on.iter().map(|d| d.to_string()).collect(),
                    )
                })
                .collect(),
        )
        .map_err(FleetError::InvalidGraph)?;
        let by_id: HashMap<String, Issue> = issues
            .into_iter()
            .map(|issue| (issue.node_id(), issue))
            .collect();

        let fleet = FleetCheckpoint::load(self.config.fleet_checkpoint_path());
        let mut summary = FleetSummary::new(by_id.len());

        for node in scheduler.nodes() {
            let Some(issue) = by_id.get(&node.id) else {
                continue;
            };
            if fleet
                .get(issue.number)
                .await
                .is_some_and(|r| r.status == FleetIssueStatus::Completed)
            {
                scheduler.mark_completed(&node.id)?;
                summary.add(issue.number, IssueReport::AlreadyCompleted);
                tracing::info!(issue = issue.number, "already completed, skipping");
            }
        }

        let waves = scheduler.compute_waves();
        tracing::info!(
            issues = by_id.len(),
            waves = waves.len(),
            max_parallel = self.config.max_parallel_issues(),
            "starting fleet"
        );
        for (i, wave) in waves.iter().enumerate() {
            tracing::debug!(wave = i, issues = ?wave, "execution wave");
        }

        let mut active: HashMap<u64, JoinHandle<()>> = HashMap::new();
        if let Err(e) = self
            .drive(&mut scheduler, &by_id, &fleet, &mut summary, &mut active)
            .await
        {
            tracing::error!(
                error = %e,
                in_flight = active.len(),
                "fleet loop failed, stopping in-flight issues"
            );
            self.cancel.cancel();
            for (_, handle) in active.drain() {
                handle.await.ok();
            }
            return Err(e);
        }

        // Anything still pending was never reached, e.g. after an interrupt.
        if self.cancel.is_cancelled() {
            for node in scheduler.nodes() {
                if let Some(issue) = by_id.get(&node.id)
                    && !summary.issues.contains_key(&issue.number)
                {
                    summary.add(issue.number, IssueReport::Cancelled);
                }
            }
        }

        summary.duration = started.elapsed();
        let counts = scheduler.summary();
        tracing::info!(
            completed = counts.completed,
            failed = counts.failed,
            blocked = counts.blocked,
            pending = counts.pending,
            "fleet finished"
        );
        self.emit(FleetEvent::FleetCompleted {
            summary: summary.clone(),
        })
        .await;
        Ok(summary)
    }

    /// The control loop: spawn ready issues while permits last, then apply
    /// results one at a time until nothing is in flight.
    ///
    /// Every spawned task is tracked in `active` until its result is handled.
    async fn drive(
        &self,
        scheduler: &mut DependencyScheduler,
        by_id: &HashMap<String, Issue>,
        fleet: &FleetCheckpoint,
        summary: &mut FleetSummary,
        active: &mut HashMap<u64, JoinHandle<()>>,
    ) -> Result<(), FleetError> {
        let runner = Arc::new(IssueRunner {
            config: self.config.clone(),
            phases: self.phases.clone(),
            executors: self.executors.clone(),
            gates: self.gates.clone(),
            launcher: self.launcher.clone(),
            isolation: self.isolation.clone(),
            commit: self.commit.clone(),
            cancel: self.cancel.clone(),
        });

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_issues()));
        let (result_tx, mut result_rx) = mpsc::channel::<IssueRun>(by_id.len().max(1));
        let mut interrupt_announced = false;

        loop {
            if self.cancel.is_cancelled() {
                if !interrupt_announced {
                    interrupt_announced = true;
                    let mut in_flight: Vec<u64> = active.keys().copied().collect();
                    in_flight.sort_unstable();
                    tracing::warn!(
                        in_flight = ?in_flight,
                        "interrupt received, not starting new issues"
                    );
                    self.emit(FleetEvent::Interrupted { in_flight }).await;
                }
            } else {
                for id in scheduler.ready_nodes() {
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };
                    let Some(issue) = by_id.get(&id).cloned() else {
                        continue;
                    };
                    let number = issue.number;

                    scheduler.mark_running(&id)?;
                    let prior_tokens = fleet
                        .get(number)
                        .await
                        .map(|r| r.token_usage)
                        .unwrap_or(0);
                    self.record(
                        fleet,
                        number,
                        FleetIssueRecord {
                            status: FleetIssueStatus::Running,
                            worktree_path: Some(self.config.project_dir.clone()),
                            branch_name: Some(issue.branch_name()),
                            token_usage: prior_tokens,
                            issue_title: issue.title.clone(),
                        },
                    )
                    .await;
                    tracing::info!(issue = number, title = %issue.title, "issue started");
                    self.emit(FleetEvent::Started { issue: number }).await;

                    let runner = runner.clone();
                    let result_tx = result_tx.clone();
                    let handle = tokio::spawn(async move {
                        let _permit = permit;
                        let inner = tokio::spawn(async move { runner.run(issue).await });
                        let run = match inner.await {
                            Ok(run) => run,
                            Err(e) => IssueRun {
                                issue: number,
                                outcome: Err(anyhow!("issue task panicked: {}", e)),
                                tokens: 0,
                            },
                        };
                        result_tx.send(run).await.ok();
                    });
                    active.insert(number, handle);
                }
            }

            if active.is_empty() {
                return Ok(());
            }

            let Some(run) = result_rx.recv().await else {
                return Ok(());
            };
            // Joining releases the task's permit before the next spawn pass.
            if let Some(handle) = active.remove(&run.issue) {
                handle.await.ok();
            }
            self.handle_result(run, scheduler, by_id, fleet, summary).await?;
        }
    }

    /// Persist a fleet record. A failed write is logged and the run goes on.
    async fn record(&self, fleet: &FleetCheckpoint, issue: u64, record: FleetIssueRecord) {
        let FleetIssueRecord {
            status,
            worktree_path,
            branch_name,
            token_usage,
            issue_title,
        } = record;
        if let Err(e) = fleet
            .set_issue_status(
                issue,
                status,
                worktree_path,
                branch_name,
                token_usage,
                &issue_title,
            )
            .await
        {
            tracing::warn!(issue, status = %status, error = %e, "failed to update fleet checkpoint");
        }
    }

    /// Apply one issue result to the scheduler and checkpoints.
    async fn handle_result(
        &self,
        run: IssueRun,
        scheduler: &mut DependencyScheduler,
        by_id: &HashMap<String, Issue>,
        fleet: &FleetCheckpoint,
        summary: &mut FleetSummary,
    ) -> Result<(), FleetError> {
        let id = run.issue.to_string();
        let title = by_id.get(&id).map(|i| i.title.clone()).unwrap_or_default();
        let branch = by_id.get(&id).map(|i| i.branch_name());
        let worktree = Some(self.config.project_dir.clone());

        let report = match run.outcome {
            Ok(PipelineOutcome::Completed) => IssueReport::Completed,
            Ok(PipelineOutcome::CompletedWithFailures { failed_phases }) => {
                IssueReport::CompletedWithFailures { failed_phases }
            }
            Ok(outcome @ PipelineOutcome::AbortedCritical { .. }) => IssueReport::Failed {
                error: outcome.to_string(),
            },
            Ok(PipelineOutcome::Cancelled) => IssueReport::Cancelled,
            Err(e) => IssueReport::Failed {
                error: format!("{:#}", e),
            },
        };

        let succeeded = match &report {
            IssueReport::Completed => true,
            IssueReport::CompletedWithFailures { .. } => !self.config.block_on_partial_failure(),
            _ => false,
        };

        let status = if report == IssueReport::Cancelled {
            // Stays `running` so the next run picks it up again.
            tracing::info!(issue = run.issue, "issue interrupted");
            FleetIssueStatus::Running
        } else if succeeded {
            tracing::info!(issue = run.issue, "issue completed");
            scheduler.mark_completed(&id)?;
            FleetIssueStatus::Completed
        } else {
            tracing::warn!(issue = run.issue, report = ?report, "issue failed");
            FleetIssueStatus::Failed
        };
        self.record(
            fleet,
            run.issue,
            FleetIssueRecord {
                status,
                worktree_path: worktree,
                branch_name: branch,
                token_usage: run.tokens,
                issue_title: title,
            },
        )
        .await;

        if status == FleetIssueStatus::Failed {
            let blocked_before: HashSet<String> = scheduler.blocked_nodes().into_iter().collect();
            scheduler.mark_failed(&id)?;
            for blocked in scheduler.blocked_nodes() {
                if blocked_before.contains(&blocked) {
                    continue;
                }
                let Some(issue) = by_id.get(&blocked) else {
                    continue;
                };
                tracing::warn!(issue = issue.number, failed_dependency = run.issue, "issue blocked");
                let prior = fleet.get(issue.number).await;
                self.record(
                    fleet,
                    issue.number,
                    FleetIssueRecord {
                        status: FleetIssueStatus::NotStarted,
                        worktree_path: prior.as_ref().and_then(|r| r.worktree_path.clone()),
                        branch_name: prior.as_ref().and_then(|r| r.branch_name.clone()),
                        token_usage: prior.as_ref().map_or(0, |r| r.token_usage),
                        issue_title: issue.title.clone(),
                    },
                )
                .await;
                summary.add(issue.number, IssueReport::Blocked);
                self.emit(FleetEvent::Blocked {
                    issue: issue.number,
                })
                .await;
            }
        }

        summary.add(run.issue, report.clone());
        self.emit(FleetEvent::Finished {
            issue: run.issue,
            report,
        })
        .await;
        Ok(())
    }
}
