//! Boundary to external agent processes and version control.

use super::context::PhaseContext;
use crate::errors::PhaseError;
use crate::isolation::SessionHandle;
use crate::phase::PhaseDefinition;
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

/// One invocation of the agent CLI.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub working_dir: PathBuf,
    pub prompt: String,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
    /// Run inside this isolation session instead of on the host
    pub session: Option<SessionHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutput {
    pub stdout: String,
    pub exit_code: i32,
    pub token_usage: u64,
}

/// Launches an agent and waits for it to finish.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, request: &AgentRequest) -> Result<AgentOutput, PhaseError>;
}

/// Runs a phase and returns the path of its primary artifact.
///
/// Executors never run gates; the state machine does that after they return.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(&self, ctx: &PhaseContext, phase: &PhaseDefinition) -> Result<PathBuf>;
}

/// Commits work after a phase that declares a commit type.
#[async_trait]
pub trait CommitManager: Send + Sync {
    async fn commit(&self, working_dir: &Path, phase: &PhaseDefinition, message: &str) -> Result<()>;
}

static TOKEN_USAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*tokens[ _]used:\s*(\d+)\s*$").expect("valid token usage regex")
});

/// Token count reported by the agent, taken from the last `tokens used: N` line.
pub fn parse_token_usage(stdout: &str) -> u64 {
    TOKEN_USAGE
        .captures_iter(stdout)
        .last()
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0)
}

static PULL_REQUEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*pull[ _]request:\s*(\S+)\s*$").expect("valid pull request regex")
});

/// Pull request URL announced by the agent in a `pull request: <url>` line.
pub fn parse_pull_request(stdout: &str) -> Option<String> {
    PULL_REQUEST
        .captures_iter(stdout)
        .last()
        .map(|c| c[1].to_string())
}

/// Artifact of the most recent successful phase of this issue.
pub(crate) async fn previous_artifact(ctx: &PhaseContext) -> Option<PathBuf> {
    ctx.checkpoint
        .snapshot()
        .await
        .phases
        .iter()
        .rev()
        .find(|r| r.success)
        .and_then(|r| r.output_path.clone())
}

/// Quote `arg` for `sh -c`.
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Spawns the configured agent command with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    command: String,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    async fn launch_on_host(&self, request: &AgentRequest) -> Result<AgentOutput, PhaseError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&request.working_dir)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(PhaseError::SpawnFailed)?;

        // The prompt is fed while the output is drained; both count against the timeout.
        let stdin = child.stdin.take();
        let prompt = request.prompt.as_bytes();
        let write_prompt = async move {
            if let Some(mut stdin) = stdin
                && let Err(e) = stdin.write_all(prompt).await
            {
                tracing::debug!(error = %e, "agent closed stdin before reading the full prompt");
            }
        };
        let run = async move {
            let ((), output) = tokio::join!(write_prompt, child.wait_with_output());
            output
        };

        let output = match timeout(request.timeout, run).await {
            Ok(result) => result.context("Failed to wait for agent process")?,
            Err(_) => {
                return Err(PhaseError::AgentTimeout {
                    timeout_secs: request.timeout.as_secs(),
                });
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if exit_code != 0 {
            return Err(PhaseError::AgentNonZeroExit {
                exit_code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(AgentOutput {
            token_usage: parse_token_usage(&stdout),
            stdout,
            exit_code,
        })
    }

    async fn launch_in_session(
        &self,
        session: &SessionHandle,
        request: &AgentRequest,
    ) -> Result<AgentOutput, PhaseError> {
        let prompt_file = tempfile::Builder::new()
            .prefix("conveyor-prompt-")
            .suffix(".md")
            .tempfile()
            .context("Failed to create prompt file")?;
        std::fs::write(prompt_file.path(), &request.prompt).context("Failed to write prompt file")?;

        let mut command_line = String::new();
        for (key, value) in &request.env {
            command_line.push_str(&format!("{}={} ", key, shell_quote(value)));
        }
        command_line.push_str(&shell_quote(&self.command));
        for arg in &self.args {
            command_line.push(' ');
            command_line.push_str(&shell_quote(arg));
        }
        command_line.push_str(&format!(
            " < {}",
            shell_quote(&prompt_file.path().to_string_lossy())
        ));

        let output = match timeout(request.timeout, session.exec(&command_line)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(PhaseError::AgentTimeout {
                    timeout_secs: request.timeout.as_secs(),
                });
            }
        };

        if !output.success() {
            return Err(PhaseError::AgentNonZeroExit {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        Ok(AgentOutput {
            token_usage: parse_token_usage(&output.stdout),
            stdout: output.stdout,
            exit_code: output.exit_code,
        })
    }
}

#[async_trait]
impl AgentLauncher for CommandLauncher {
    async fn launch(&self, request: &AgentRequest) -> Result<AgentOutput, PhaseError> {
        match &request.session {
            Some(session) => self.launch_in_session(session, request).await,
            None => self.launch_on_host(request).await,
        }
    }
}

/// Default executor: asks the agent to perform the phase and stores its answer.
#[derive(Debug, Clone, Default)]
pub struct AgentPhaseExecutor;

impl AgentPhaseExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Render the instruction given to the agent for `phase`.
    pub fn render_prompt(
        ctx: &PhaseContext,
        phase: &PhaseDefinition,
        previous_artifact: Option<&Path>,
        pull_request: Option<&str>,
    ) -> String {
        let mut prompt = format!(
            "# Phase {}: {}\n\n## Issue #{}: {}\n\n{}\n",
            phase.id, phase.name, ctx.issue.number, ctx.issue.title, ctx.issue.body
        );
        if let Some(path) = previous_artifact {
            prompt.push_str(&format!(
                "\n## Previous phase output\n\nRead {} before starting.\n",
                path.display()
            ));
        }
        if let Some(url) = pull_request {
            prompt.push_str(&format!("\n## Pull request\n\n{}\n", url));
        }
        prompt.push_str(&format!(
            "\nWork in {}. Reply with the {} result.\n",
            ctx.working_checkout_path.display(),
            phase.name.to_lowercase()
        ));
        prompt
    }
}

#[async_trait]
impl PhaseExecutor for AgentPhaseExecutor {
    async fn execute(&self, ctx: &PhaseContext, phase: &PhaseDefinition) -> Result<PathBuf> {
        let previous = previous_artifact(ctx).await;
        let pull_request = ctx.pull_request().await;

        let request = AgentRequest {
            working_dir: ctx.working_checkout_path.clone(),
            prompt: Self::render_prompt(ctx, phase, previous.as_deref(), pull_request.as_deref()),
            timeout: Duration::from_secs(ctx.config.agent().timeout_secs),
            env: vec![
                ("CONVEYOR_ISSUE".to_string(), ctx.issue.number.to_string()),
                ("CONVEYOR_PHASE".to_string(), phase.id.to_string()),
            ],
            session: ctx.session().await,
        };

        let output = ctx.launcher.launch(&request).await?;
        ctx.record_tokens(output.token_usage);
        if let Some(url) = parse_pull_request(&output.stdout) {
            ctx.set_pull_request(&url).await;
        }

        tokio::fs::create_dir_all(&ctx.progress_dir)
            .await
            .with_context(|| format!("Failed to create {}", ctx.progress_dir.display()))?;
        let artifact = ctx.progress_dir.join(phase.artifact_file_name());
        tokio::fs::write(&artifact, &output.stdout)
            .await
            .with_context(|| format!("Failed to write artifact {}", artifact.display()))?;

        Ok(artifact)
    }
}

/// Commits with the `git` CLI.
#[derive(Debug, Clone, Default)]
pub struct GitCommitManager;

#[async_trait]
impl CommitManager for GitCommitManager {
    async fn commit(&self, working_dir: &Path, phase: &PhaseDefinition, message: &str) -> Result<()> {
        let add = Command::new("git")
            .args(["add", "-A"])
            .current_dir(working_dir)
            .output()
            .await
            .context("Failed to run git add")?;
        if !add.status.success() {
            anyhow::bail!(
                "git add failed: {}",
                String::from_utf8_lossy(&add.stderr).trim()
            );
        }

        let commit = Command::new("git")
            .args(["commit", "--allow-empty", "-m", message])
            .current_dir(working_dir)
            .output()
            .await
            .context("Failed to run git commit")?;
        if !commit.status.success() {
            anyhow::bail!(
                "git commit after phase {} failed: {}",
                phase.id,
                String::from_utf8_lossy(&commit.stderr).trim()
            );
        }
        Ok(())
    }
}
