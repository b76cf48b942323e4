//! Task plans: the ordered work list inside one issue's implementation phase.
//!
//! The planning phase may end its output with a fenced `json` block listing
//! tasks and their dependencies. A plan is validated with the same
//! [`DependencyScheduler`] the fleet uses for issues. Task failures never leave
//! the issue: they block dependent tasks and surface as the implementing
//! phase's error.

use crate::dag::{DependencyScheduler, NodeSpec};
use crate::errors::DagError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;

/// One unit of work in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl PlanTask {
    pub fn new(id: &str, depends_on: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            title: String::new(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub tasks: Vec<PlanTask>,
}

/// How a plan run ended, task by task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPlanReport {
    pub completed: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub blocked: Vec<String>,
}

impl TaskPlanReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty()
    }

    /// One-line description of what went wrong, if anything did.
    pub fn failure_message(&self) -> Option<String> {
        if self.is_success() {
            return None;
        }
        let failed: Vec<String> = self
            .failed
            .iter()
            .map(|(id, err)| format!("{}: {}", id, err))
            .collect();
        Some(format!(
            "{} task(s) failed [{}], {} blocked",
            self.failed.len(),
            failed.join("; "),
            self.blocked.len()
        ))
    }

    /// Fail with the summary message when any task failed or was blocked.
    pub fn into_result(self) -> Result<()> {
        match self.failure_message() {
            Some(message) => Err(anyhow::anyhow!(message)),
            None => Ok(()),
        }
    }
}

impl TaskPlan {
    /// Load a plan from a JSON file or from phase output that embeds one.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read task plan {}", path.display()))?;
        Self::extract(&content)
            .unwrap_or_else(|| Self::parse(&content))
            .with_context(|| format!("Failed to parse task plan {}", path.display()))
    }

    /// Find a plan in agent output: the first fenced `json` block, or the
    /// whole text when it is bare JSON. `None` when the text carries no plan.
    pub fn extract(text: &str) -> Option<Result<Self>> {
        if let Some(start) = text.find("```json") {
            let after = &text[start + "```json".len()..];
            let body = after.find("```").map_or(after, |end| &after[..end]);
            return Some(Self::parse(body.trim()));
        }
        let trimmed = text.trim();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            return Some(Self::parse(trimmed));
        }
        None
    }

    /// Accepts either `{"tasks": [...]}` or a bare array.
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim_start().starts_with('[') {
            let tasks: Vec<PlanTask> = serde_json::from_str(content)?;
            return Ok(Self { tasks });
        }
        Ok(serde_json::from_str(content)?)
    }

    /// Build a scheduler over the plan, rejecting unknown ids and cycles.
    pub fn scheduler(&self) -> Result<DependencyScheduler, DagError> {
        DependencyScheduler::from_nodes(
            self.tasks
                .iter()
                .map(|t| NodeSpec::new(t.id.clone(), t.depends_on.clone()))
                .collect(),
        )
    }

    pub fn validate(&self) -> Result<(), DagError> {
        self.scheduler().map(|_| ())
    }

    /// Groups of tasks that may run together once earlier groups finish.
    pub fn waves(&self) -> Result<Vec<Vec<String>>, DagError> {
        Ok(self.scheduler()?.compute_waves())
    }

    /// Run every task in dependency order, one at a time.
    ///
    /// A failing task blocks its dependents; independent tasks still run.
    pub async fn execute<F, Fut>(&self, mut run_task: F) -> Result<TaskPlanReport, DagError>
    where
        F: FnMut(PlanTask) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut scheduler = self.scheduler()?;
        let mut report = TaskPlanReport::default();

        while let Some(id) = scheduler.ready_nodes().into_iter().next() {
            let Some(task) = self.tasks.iter().find(|t| t.id == id).cloned() else {
                return Err(DagError::UnknownNode(id));
            };
            scheduler.mark_running(&id)?;
            tracing::debug!(task = %id, "running plan task");
            match run_task(task).await {
                Ok(()) => {
                    scheduler.mark_completed(&id)?;
                    report.completed.push(id);
                }
                Err(e) => {
                    tracing::warn!(task = %id, error = %e, "plan task failed");
                    scheduler.mark_failed(&id)?;
                    report.failed.push((id, format!("{:#}", e)));
                }
            }
        }

        report.blocked = scheduler.blocked_nodes();
        Ok(report)
    }
}
