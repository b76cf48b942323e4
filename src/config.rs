//! Layered fleet configuration.
//!
//! Settings are resolved in three layers, later layers winning:
//! 1. `.conveyor/conveyor.toml` (missing file means defaults)
//! 2. Environment variables (`CONVEYOR_MAX_PARALLEL`, `CONVEYOR_AGENT_CMD`)
//! 3. CLI arguments

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::isolation::IsolationSettings;
use crate::retry::RetryPolicy;

/// `[fleet]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetSection {
    /// Issues processed concurrently
    #[serde(default = "default_max_parallel_issues")]
    pub max_parallel_issues: usize,
    /// Checkpoint directory, relative to the project directory
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Treat an issue that completed with non-critical failures as failed
    #[serde(default = "default_block_on_partial_failure")]
    pub block_on_partial_failure: bool,
    /// Token ceiling per issue
    #[serde(default)]
    pub token_budget: Option<u64>,
    /// Revision the issue branches start from
    #[serde(default)]
    pub base_revision: Option<String>,
}

fn default_max_parallel_issues() -> usize {
    3
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".conveyor/state")
}

fn default_block_on_partial_failure() -> bool {
    true
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            max_parallel_issues: default_max_parallel_issues(),
            state_dir: default_state_dir(),
            block_on_partial_failure: default_block_on_partial_failure(),
            token_budget: None,
            base_revision: None,
        }
    }
}

/// `[agent]` section: the external agent CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentSection {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_timeout_secs() -> u64 {
    1800
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: Vec::new(),
            timeout_secs: default_agent_timeout_secs(),
        }
    }
}

/// The complete `conveyor.toml` structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ConveyorToml {
    #[serde(default)]
    pub fleet: FleetSection,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub agent: AgentSection,
}

impl ConveyorToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load `conveyor.toml` from `conveyor_dir`, or defaults if it doesn't exist.
    pub fn load_or_default(conveyor_dir: &Path) -> Result<Self> {
        let path = conveyor_dir.join("conveyor.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.fleet.max_parallel_issues == 0 {
            warnings.push("max_parallel_issues is 0; using 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0; using 1".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            warnings.push(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            ));
        }
        if self.agent.timeout_secs == 0 {
            warnings.push("agent.timeout_secs is 0; every agent run will time out".to_string());
        }
        warnings
    }
}

/// Fully resolved configuration for one fleet run.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub project_dir: PathBuf,
    pub conveyor_dir: PathBuf,
    pub toml: ConveyorToml,
    pub isolation: IsolationSettings,
}

impl FleetConfig {
    /// Load file configuration and apply process environment overrides.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let mut config = Self::from_files(project_dir)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load file configuration only.
    pub fn from_files(project_dir: &Path) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory: {}", project_dir.display()))?;
        let conveyor_dir = project_dir.join(".conveyor");
        let toml = ConveyorToml::load_or_default(&conveyor_dir)?;
        let isolation = IsolationSettings::load(&project_dir)?;

        for warning in toml.validate() {
            tracing::warn!("{}", warning);
        }

        Ok(Self {
            project_dir,
            conveyor_dir,
            toml,
            isolation,
        })
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup("CONVEYOR_MAX_PARALLEL") {
            match raw.trim().parse::<usize>() {
                Ok(n) => self.toml.fleet.max_parallel_issues = n,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid CONVEYOR_MAX_PARALLEL"),
            }
        }
        if let Some(cmd) = lookup("CONVEYOR_AGENT_CMD")
            && !cmd.trim().is_empty()
        {
            self.toml.agent.command = cmd;
        }
    }

    /// Apply CLI overrides.
    pub fn with_cli_args(mut self, max_parallel: Option<usize>) -> Self {
        if let Some(n) = max_parallel {
            self.toml.fleet.max_parallel_issues = n;
        }
        self
    }

    /// Concurrency limit, never below one.
    pub fn max_parallel_issues(&self) -> usize {
        self.toml.fleet.max_parallel_issues.max(1)
    }

    pub fn state_dir(&self) -> PathBuf {
        let dir = &self.toml.fleet.state_dir;
        if dir.is_absolute() {
            dir.clone()
        } else {
            self.project_dir.join(dir)
        }
    }

    /// Where an issue's phase artifacts are written.
    pub fn progress_dir(&self, issue: u64) -> PathBuf {
        self.state_dir()
            .join("progress")
            .join(format!("issue-{}", issue))
    }

    pub fn fleet_checkpoint_path(&self) -> PathBuf {
        crate::checkpoint::fleet_checkpoint_path(&self.state_dir())
    }

    pub fn block_on_partial_failure(&self) -> bool {
        self.toml.fleet.block_on_partial_failure
    }

    pub fn token_budget(&self) -> Option<u64> {
        self.toml.fleet.token_budget
    }

    pub fn base_revision(&self) -> Option<String> {
        self.toml.fleet.base_revision.clone()
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.toml.retry
    }

    pub fn agent(&self) -> &AgentSection {
        &self.toml.agent
    }
}
