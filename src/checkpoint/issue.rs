use super::atomic::{persist_json, read_json_lenient};
use crate::errors::CheckpointError;
use crate::gates::GateResult;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Lifecycle of a single issue's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineStatus {
    #[default]
    NotStarted,
    Running,
    Completed,
    CompletedWithFailures,
    Failed,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStatus::NotStarted => "not-started",
            PipelineStatus::Running => "running",
            PipelineStatus::Completed => "completed",
            PipelineStatus::CompletedWithFailures => "completed-with-failures",
            PipelineStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one phase, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: u32,
    pub phase_name: String,
    pub success: bool,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    #[serde(default)]
    pub token_usage: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_result: Option<GateResult>,
    pub completed_at: DateTime<Utc>,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Persisted checkpoint for one issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub issue_number: u64,
    pub issue_title: String,
    #[serde(default)]
    pub phases: Vec<PhaseResult>,
    #[serde(default)]
    pub current_phase: u32,
    #[serde(default)]
    pub status: PipelineStatus,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointState {
    pub fn fresh(issue_number: u64, issue_title: impl Into<String>) -> Self {
        Self {
            issue_number,
            issue_title: issue_title.into(),
            phases: Vec::new(),
            current_phase: 0,
            status: PipelineStatus::NotStarted,
            updated_at: Utc::now(),
        }
    }

    pub fn last_phase(&self) -> Option<&PhaseResult> {
        self.phases.last()
    }

    /// Ids of recorded phases that did not succeed.
    pub fn failed_phases(&self) -> Vec<u32> {
        self.phases
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.phase)
            .collect()
    }

    pub fn total_tokens(&self) -> u64 {
        self.phases.iter().map(|r| r.token_usage).sum()
    }
}

/// Path of the checkpoint file for `issue` under `state_dir`.
pub fn issue_checkpoint_path(state_dir: &Path, issue: u64) -> PathBuf {
    state_dir.join("issues").join(format!("issue-{}.json", issue))
}

/// Shared handle to one issue's checkpoint.
///
/// Clones share the same state; every mutation persists before it returns and
/// mutations are serialized by the inner mutex.
#[derive(Debug, Clone)]
pub struct IssueCheckpoint {
    path: PathBuf,
    state: Arc<Mutex<CheckpointState>>,
}

impl IssueCheckpoint {
    /// Load the checkpoint for `issue`, or start a fresh one.
    ///
    /// A persisted state for a different issue number is discarded.
    pub fn load(state_dir: &Path, issue: u64, title: &str) -> Self {
        let path = issue_checkpoint_path(state_dir, issue);
        let state = match read_json_lenient::<CheckpointState>(&path) {
            Some(state) if state.issue_number == issue => state,
            Some(state) => {
                tracing::warn!(
                    path = %path.display(),
                    found = state.issue_number,
                    expected = issue,
                    "checkpoint belongs to another issue, starting fresh"
                );
                CheckpointState::fresh(issue, title)
            }
            None => CheckpointState::fresh(issue, title),
        };

        Self {
            path,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> CheckpointState {
        self.state.lock().await.clone()
    }

    /// Persist `next` and only then make it the current state.
    async fn commit(&self, state: &mut CheckpointState, mut next: CheckpointState) -> Result<()> {
        next.updated_at = Utc::now();
        persist_json(&self.path, &next).await?;
        *state = next;
        Ok(())
    }

    /// Append a phase result. Phases must be recorded in ascending order.
    pub async fn record_phase_result(&self, result: PhaseResult) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(last) = state.last_phase()
            && result.phase <= last.phase
        {
            return Err(CheckpointError::OutOfOrder {
                phase: result.phase,
                last: last.phase,
            }
            .into());
        }

        let mut next = state.clone();
        next.current_phase = result.phase;
        next.phases.push(result);
        self.commit(&mut state, next).await
    }

    /// Attach a gate result to the trailing phase result.
    pub async fn record_gate_result(&self, phase: u32, gate: GateResult) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let Some(last) = next.phases.last_mut().filter(|r| r.phase == phase) else {
            return Err(CheckpointError::NoMatchingPhase { phase }.into());
        };

        last.gate_result = Some(gate);
        self.commit(&mut state, next).await
    }

    /// Mark the trailing phase result as failed with `error`.
    pub async fn fail_trailing_phase(&self, phase: u32, error: String) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let Some(last) = next.phases.last_mut().filter(|r| r.phase == phase) else {
            return Err(CheckpointError::NoMatchingPhase { phase }.into());
        };

        last.success = false;
        last.error = Some(error);
        self.commit(&mut state, next).await
    }

    /// Remove the trailing result so its phase can run again.
    pub async fn discard_trailing_phase(&self) -> Result<Option<PhaseResult>> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let Some(removed) = next.phases.pop() else {
            return Ok(None);
        };
        next.current_phase = next.last_phase().map(|r| r.phase).unwrap_or(0);
        self.commit(&mut state, next).await?;
        Ok(Some(removed))
    }

    pub async fn set_status(&self, status: PipelineStatus, current_phase: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.status = status;
        next.current_phase = current_phase;
        self.commit(&mut state, next).await
    }

    /// Clear phase history while keeping the issue identity.
    pub async fn reset(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let fresh = CheckpointState::fresh(state.issue_number, state.issue_title.clone());
        self.commit(&mut state, fresh).await
    }
}
