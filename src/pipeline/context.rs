use crate::checkpoint::IssueCheckpoint;
use crate::config::FleetConfig;
use crate::errors::PhaseError;
use crate::isolation::SessionHandle;
use crate::issue::Issue;
use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::agent::{AgentLauncher, CommitManager};

/// Running token count for one issue, checked against an optional budget.
#[derive(Debug, Clone, Default)]
pub struct TokenTracker {
    used: Arc<AtomicU64>,
    budget: Option<u64>,
}

impl TokenTracker {
    pub fn new(budget: Option<u64>) -> Self {
        Self {
            used: Arc::new(AtomicU64::new(0)),
            budget,
        }
    }

    /// Start from tokens already spent in earlier runs.
    pub fn with_used(self, used: u64) -> Self {
        self.used.store(used, Ordering::SeqCst);
        self
    }

    /// Add `tokens` and return the new total.
    pub fn record(&self, tokens: u64) -> u64 {
        self.used.fetch_add(tokens, Ordering::SeqCst) + tokens
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn budget(&self) -> Option<u64> {
        self.budget
    }

    pub fn check(&self) -> Result<(), PhaseError> {
        match self.budget {
            Some(budget) if self.used() >= budget => Err(PhaseError::BudgetExhausted {
                used: self.used(),
                budget,
            }),
            _ => Ok(()),
        }
    }
}

/// Appends timestamped progress lines to `progress.log` in the progress directory.
#[derive(Debug, Clone)]
pub struct ProgressWriter {
    log_file: PathBuf,
}

impl ProgressWriter {
    pub fn new(progress_dir: &Path) -> Self {
        Self {
            log_file: progress_dir.join("progress.log"),
        }
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn write(&self, message: &str) -> Result<()> {
        if let Some(parent) = self.log_file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let line = format!("{} {}\n", Utc::now().to_rfc3339(), message);
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .context("Failed to open progress log")?
            .write_all(line.as_bytes())
            .context("Failed to write progress entry")?;
        Ok(())
    }
}

/// Everything a phase executor may use while running one issue.
///
/// One context exists per issue pipeline and is passed by reference to every
/// phase. Nothing in it is global.
pub struct PhaseContext {
    pub issue: Issue,
    pub working_checkout_path: PathBuf,
    pub base_revision: Option<String>,
    pub config: Arc<FleetConfig>,

    pub launcher: Arc<dyn AgentLauncher>,
    pub retry: RetryPolicy,
    pub tokens: TokenTracker,

    pub progress_dir: PathBuf,
    pub progress: ProgressWriter,
    pub checkpoint: IssueCheckpoint,
    pub commit: Option<Arc<dyn CommitManager>>,

    session: Mutex<Option<SessionHandle>>,
    pull_request: Mutex<Option<String>>,
}

impl PhaseContext {
    pub fn new(
        issue: Issue,
        working_checkout_path: PathBuf,
        config: Arc<FleetConfig>,
        launcher: Arc<dyn AgentLauncher>,
        checkpoint: IssueCheckpoint,
    ) -> Self {
        let progress_dir = config.progress_dir(issue.number);
        Self {
            base_revision: config.base_revision(),
            retry: *config.retry(),
            tokens: TokenTracker::new(config.token_budget()),
            progress: ProgressWriter::new(&progress_dir),
            progress_dir,
            issue,
            working_checkout_path,
            config,
            launcher,
            checkpoint,
            commit: None,
            session: Mutex::new(None),
            pull_request: Mutex::new(None),
        }
    }

    pub fn with_commit_manager(mut self, commit: Arc<dyn CommitManager>) -> Self {
        self.commit = Some(commit);
        self
    }

    pub fn with_tokens(mut self, tokens: TokenTracker) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn record_tokens(&self, tokens: u64) -> u64 {
        self.tokens.record(tokens)
    }

    pub fn check_budget(&self) -> Result<(), PhaseError> {
        self.tokens.check()
    }

    /// Log progress and append it to the issue's progress log.
    pub fn update_progress(&self, message: &str) {
        tracing::info!(issue = self.issue.number, "{}", message);
        if let Err(e) = self.progress.write(message) {
            tracing::warn!(issue = self.issue.number, error = %e, "failed to write progress log");
        }
    }

    pub async fn set_pull_request(&self, url: &str) {
        *self.pull_request.lock().await = Some(url.to_string());
        self.update_progress(&format!("pull request: {}", url));
    }

    pub async fn pull_request(&self) -> Option<String> {
        self.pull_request.lock().await.clone()
    }

    /// Isolation session of the phase currently running, if it is sandboxed.
    pub async fn session(&self) -> Option<SessionHandle> {
        self.session.lock().await.clone()
    }

    pub(crate) async fn set_session(&self, session: Option<SessionHandle>) -> Option<SessionHandle> {
        std::mem::replace(&mut *self.session.lock().await, session)
    }
}

impl std::fmt::Debug for PhaseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseContext")
            .field("issue", &self.issue.number)
            .field("working_checkout_path", &self.working_checkout_path)
            .field("progress_dir", &self.progress_dir)
            .field("tokens_used", &self.tokens.used())
            .finish()
    }
}
