//! Task-by-task execution of an implementation plan.

use super::agent::{AgentPhaseExecutor, AgentRequest, PhaseExecutor, previous_artifact};
use super::context::PhaseContext;
use crate::phase::PhaseDefinition;
use crate::plan::{PlanTask, TaskPlan};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;

/// Runs the task plan published by the previous phase, one agent call per task.
///
/// Without a plan in the previous artifact the phase runs as a single agent
/// call, exactly like [`AgentPhaseExecutor`].
#[derive(Debug, Clone, Default)]
pub struct TaskPlanExecutor {
    whole_phase: AgentPhaseExecutor,
}

impl TaskPlanExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render_task_prompt(
        ctx: &PhaseContext,
        phase: &PhaseDefinition,
        task: &PlanTask,
    ) -> String {
        let mut prompt = format!(
            "# Phase {}: {}, task {}\n\n## Issue #{}: {}\n\n{}\n\n## Task\n\n{}\n",
            phase.id,
            phase.name,
            task.id,
            ctx.issue.number,
            ctx.issue.title,
            ctx.issue.body,
            if task.title.is_empty() { &task.id } else { &task.title }
        );
        if !task.depends_on.is_empty() {
            prompt.push_str(&format!("\nAlready done: {}.\n", task.depends_on.join(", ")));
        }
        prompt.push_str(&format!(
            "\nWork in {}. Do only this task.\n",
            ctx.working_checkout_path.display()
        ));
        prompt
    }
}

#[async_trait]
impl PhaseExecutor for TaskPlanExecutor {
    async fn execute(&self, ctx: &PhaseContext, phase: &PhaseDefinition) -> Result<PathBuf> {
        let Some(source) = previous_artifact(ctx).await else {
            return self.whole_phase.execute(ctx, phase).await;
        };
        let text = tokio::fs::read_to_string(&source)
            .await
            .with_context(|| format!("Failed to read {}", source.display()))?;
        let plan = match TaskPlan::extract(&text) {
            Some(plan) => {
                plan.with_context(|| format!("Invalid task plan in {}", source.display()))?
            }
            None => {
                tracing::debug!(issue = ctx.issue.number, phase = phase.id, "no task plan found");
                return self.whole_phase.execute(ctx, phase).await;
            }
        };
        if plan.tasks.is_empty() {
            return self.whole_phase.execute(ctx, phase).await;
        }

        let waves = plan
            .waves()
            .with_context(|| format!("Invalid task plan in {}", source.display()))?;
        ctx.update_progress(&format!(
            "phase {}: {} task(s) in {} wave(s)",
            phase.id,
            plan.tasks.len(),
            waves.len()
        ));

        let session = ctx.session().await;
        let timeout = Duration::from_secs(ctx.config.agent().timeout_secs);
        let outputs: Mutex<Vec<(String, String)>> = Mutex::new(Vec::new());
        let (session, outputs_ref) = (&session, &outputs);

        let report = plan
            .execute(move |task| async move {
                let request = AgentRequest {
                    working_dir: ctx.working_checkout_path.clone(),
                    prompt: Self::render_task_prompt(ctx, phase, &task),
                    timeout,
                    env: vec![
                        ("CONVEYOR_ISSUE".to_string(), ctx.issue.number.to_string()),
                        ("CONVEYOR_PHASE".to_string(), phase.id.to_string()),
                        ("CONVEYOR_TASK".to_string(), task.id.clone()),
                    ],
                    session: session.clone(),
                };
                let output = ctx.launcher.launch(&request).await?;
                ctx.record_tokens(output.token_usage);
                outputs_ref.lock().await.push((task.id, output.stdout));
                Ok::<(), anyhow::Error>(())
            })
            .await?;

        let mut body = format!("# {} for issue #{}\n", phase.name, ctx.issue.number);
        for (id, stdout) in outputs.into_inner() {
            body.push_str(&format!("\n## Task {}\n\n{}\n", id, stdout.trim_end()));
        }
        tokio::fs::create_dir_all(&ctx.progress_dir)
            .await
            .with_context(|| format!("Failed to create {}", ctx.progress_dir.display()))?;
        let artifact = ctx.progress_dir.join(phase.artifact_file_name());
        tokio::fs::write(&artifact, body)
            .await
            .with_context(|| format!("Failed to write artifact {}", artifact.display()))?;

        report.into_result()?;
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{IssueCheckpoint, PhaseResult};
    use crate::config::FleetConfig;
    use crate::errors::PhaseError;
    use crate::issue::Issue;
    use crate::pipeline::{AgentLauncher, AgentOutput};
    use chrono::Utc;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Answers with the task id found in the environment; fails the listed tasks.
    struct TaskLauncher {
        failing: Vec<&'static str>,
        calls: std::sync::Mutex<Vec<String>>,
    }

    impl TaskLauncher {
        fn new(failing: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                failing: failing.to_vec(),
                calls: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentLauncher for TaskLauncher {
        async fn launch(&self, request: &AgentRequest) -> Result<AgentOutput, PhaseError> {
            let task = request
                .env
                .iter()
                .find(|(k, _)| k == "CONVEYOR_TASK")
                .map(|(_, v)| v.clone())
                .unwrap_or_else(|| "whole-phase".to_string());
            self.calls.lock().unwrap().push(task.clone());
            if self.failing.contains(&task.as_str()) {
                return Err(PhaseError::AgentNonZeroExit {
                    exit_code: 1,
                    stderr: format!("{} broke", task),
                });
            }
            Ok(AgentOutput {
                stdout: format!("did {}\ntokens used: 10\n", task),
                exit_code: 0,
                token_usage: 10,
            })
        }
    }

    async fn context_after_planning(
        dir: &Path,
        launcher: Arc<TaskLauncher>,
        plan: &str,
    ) -> PhaseContext {
        let config = Arc::new(FleetConfig::from_files(dir).unwrap());
        let issue = Issue::new(21, "Add export");
        let checkpoint = IssueCheckpoint::load(&config.state_dir(), 21, &issue.title);
        let ctx = PhaseContext::new(issue, dir.to_path_buf(), config, launcher, checkpoint);

        std::fs::create_dir_all(&ctx.progress_dir).unwrap();
        let planning = ctx.progress_dir.join("02-planning.md");
        std::fs::write(&planning, plan).unwrap();
        ctx.checkpoint
            .record_phase_result(PhaseResult {
                phase: 2,
                phase_name: "Planning".to_string(),
                success: true,
                duration: Duration::from_millis(5),
                token_usage: 0,
                output_path: Some(planning),
                error: None,
                gate_result: None,
                completed_at: Utc::now(),
            })
            .await
            .unwrap();
        ctx
    }

    const DIAMOND: &str = r#"# Planning

```json
{"tasks": [
  {"id": "schema", "title": "Add the export schema"},
  {"id": "api", "depends_on": ["schema"]},
  {"id": "ui", "depends_on": ["schema"]},
  {"id": "docs", "depends_on": ["api", "ui"]}
]}
```
"#;

    fn implementation() -> PhaseDefinition {
        PhaseDefinition::new(3, "Implementation", true).with_task_plan()
    }

    #[tokio::test]
    async fn test_runs_each_task_in_order() {
        let dir = TempDir::new().unwrap();
        let launcher = TaskLauncher::new(&[]);
        let ctx = context_after_planning(dir.path(), launcher.clone(), DIAMOND).await;

        let artifact = TaskPlanExecutor::new()
            .execute(&ctx, &implementation())
            .await
            .unwrap();

        assert_eq!(launcher.calls(), vec!["schema", "api", "ui", "docs"]);
        assert_eq!(ctx.tokens.used(), 40);
        let body = std::fs::read_to_string(&artifact).unwrap();
        assert!(artifact.ends_with("03-implementation.md"));
        assert!(body.contains("## Task schema\n\ndid schema"));
        assert!(body.contains("## Task docs"));
    }

    #[tokio::test]
    async fn test_failed_task_blocks_dependents_and_fails_phase() {
        let dir = TempDir::new().unwrap();
        let launcher = TaskLauncher::new(&["api"]);
        let ctx = context_after_planning(dir.path(), launcher.clone(), DIAMOND).await;

        let err = TaskPlanExecutor::new()
            .execute(&ctx, &implementation())
            .await
            .unwrap_err();

        assert_eq!(launcher.calls(), vec!["schema", "api", "ui"]);
        let message = format!("{:#}", err);
        assert!(message.contains("api: "), "got {message}");
        assert!(message.contains("1 blocked"));
        let partial = ctx.progress_dir.join("03-implementation.md");
        assert!(std::fs::read_to_string(partial).unwrap().contains("## Task ui"));
    }

    #[tokio::test]
    async fn test_cyclic_plan_is_rejected_before_any_task_runs() {
        let dir = TempDir::new().unwrap();
        let launcher = TaskLauncher::new(&[]);
        let plan = "```json\n[{\"id\": \"a\", \"depends_on\": [\"b\"]}, {\"id\": \"b\", \"depends_on\": [\"a\"]}]\n```";
        let ctx = context_after_planning(dir.path(), launcher.clone(), plan).await;

        let err = TaskPlanExecutor::new()
            .execute(&ctx, &implementation())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Invalid task plan"));
        assert!(launcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_without_plan_runs_phase_once() {
        let dir = TempDir::new().unwrap();
        let launcher = TaskLauncher::new(&[]);
        let ctx =
            context_after_planning(dir.path(), launcher.clone(), "# Planning\n\nJust do it.\n").await;

        let artifact = TaskPlanExecutor::new()
            .execute(&ctx, &implementation())
            .await
            .unwrap();

        assert_eq!(launcher.calls(), vec!["whole-phase"]);
        assert!(std::fs::read_to_string(artifact).unwrap().starts_with("did whole-phase"));
    }

    #[tokio::test]
    async fn test_default_registry_plans_only_flagged_phases() {
        let dir = TempDir::new().unwrap();
        let launcher = TaskLauncher::new(&[]);
        let ctx = context_after_planning(dir.path(), launcher.clone(), DIAMOND).await;
        let phases = crate::phase::default_pipeline();
        let registry = crate::pipeline::ExecutorRegistry::for_phases(&phases);

        let verification = phases.iter().find(|p| p.id == 4).unwrap();
        registry.get(4).unwrap().execute(&ctx, verification).await.unwrap();
        assert_eq!(launcher.calls(), vec!["whole-phase"]);

        let implementation = phases.iter().find(|p| p.task_plan).unwrap();
        assert_eq!(implementation.id, 3);
        registry.get(3).unwrap().execute(&ctx, implementation).await.unwrap();
        assert_eq!(launcher.calls().len(), 5);
    }

    #[test]
    fn test_task_prompt_names_task_and_finished_dependencies() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(FleetConfig::from_files(dir.path()).unwrap());
        let issue = Issue::new(21, "Add export");
        let checkpoint = IssueCheckpoint::load(&config.state_dir(), 21, &issue.title);
        let ctx = PhaseContext::new(
            issue,
            dir.path().to_path_buf(),
            config,
            TaskLauncher::new(&[]),
            checkpoint,
        );

        let prompt = TaskPlanExecutor::render_task_prompt(
            &ctx,
            &implementation(),
            &PlanTask::new("docs", &["api", "ui"]),
        );
        assert!(prompt.contains("Phase 3: Implementation, task docs"));
        assert!(prompt.contains("## Task\n\ndocs"));
        assert!(prompt.contains("Already done: api, ui."));
    }
}
