use super::atomic::{persist_json, read_json_lenient};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Fleet-level view of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FleetIssueStatus {
    #[default]
    NotStarted,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for FleetIssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FleetIssueStatus::NotStarted => "not-started",
            FleetIssueStatus::Running => "running",
            FleetIssueStatus::Completed => "completed",
            FleetIssueStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetIssueRecord {
    pub status: FleetIssueStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub token_usage: u64,
    #[serde(default)]
    pub issue_title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetCheckpointState {
    #[serde(default)]
    pub issues: BTreeMap<u64, FleetIssueRecord>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FleetCheckpointState {
    pub fn fresh() -> Self {
        let now = Utc::now();
        Self {
            issues: BTreeMap::new(),
            started_at: now,
            updated_at: now,
        }
    }

    pub fn count(&self, status: FleetIssueStatus) -> usize {
        self.issues.values().filter(|r| r.status == status).count()
    }
}

/// Path of the fleet checkpoint under `state_dir`.
pub fn fleet_checkpoint_path(state_dir: &Path) -> PathBuf {
    state_dir.join("fleet.json")
}

/// Shared handle to the fleet checkpoint. Every update persists before returning.
#[derive(Debug, Clone)]
pub struct FleetCheckpoint {
    path: PathBuf,
    state: Arc<Mutex<FleetCheckpointState>>,
}

impl FleetCheckpoint {
    /// Load the fleet checkpoint at `path`, or start a fresh one.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = read_json_lenient(&path).unwrap_or_else(FleetCheckpointState::fresh);
        Self {
            path,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `next` and only then make it the current state.
    async fn commit(
        &self,
        state: &mut FleetCheckpointState,
        mut next: FleetCheckpointState,
    ) -> Result<()> {
        next.updated_at = Utc::now();
        persist_json(&self.path, &next).await?;
        *state = next;
        Ok(())
    }

    /// Replace the record for `issue` and persist.
    pub async fn set_issue_status(
        &self,
        issue: u64,
        status: FleetIssueStatus,
        worktree_path: Option<PathBuf>,
        branch_name: Option<String>,
        token_usage: u64,
        issue_title: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.issues.insert(
            issue,
            FleetIssueRecord {
                status,
                worktree_path,
                branch_name,
                token_usage,
                issue_title: issue_title.to_string(),
            },
        );
        self.commit(&mut state, next).await
    }

    pub async fn get(&self, issue: u64) -> Option<FleetIssueRecord> {
        self.state.lock().await.issues.get(&issue).cloned()
    }

    pub async fn snapshot(&self) -> FleetCheckpointState {
        self.state.lock().await.clone()
    }

    /// Issues recorded in the checkpoint that have not completed.
    pub async fn issues_to_resume(&self) -> Vec<u64> {
        self.state
            .lock()
            .await
            .issues
            .iter()
            .filter(|(_, r)| r.status != FleetIssueStatus::Completed)
            .map(|(n, _)| *n)
            .collect()
    }

    /// Drop the record for `issue`. Returns whether one existed.
    pub async fn remove_issue(&self, issue: u64) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.issues.contains_key(&issue) {
            return Ok(false);
        }
        let mut next = state.clone();
        next.issues.remove(&issue);
        self.commit(&mut state, next).await?;
        Ok(true)
    }
}
