//! Host "isolation": commands run directly on the host.
//!
//! The host provider enforces only the environment allowlist. It is the
//! fallback target when a policy cannot be met by a real sandbox and the
//! caller has opted into degraded isolation.

use super::provider::IsolationProvider;
use super::types::{ExecOutput, IsolationCapabilities, IsolationPolicy, NetworkMode, SessionState};
use crate::errors::IsolationError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::Mutex;

/// Resolved without `PATH`, which sessions only see when allowlisted.
const SHELL: &str = "/bin/sh";

struct HostSession {
    working_dir: PathBuf,
    env: Vec<(String, String)>,
    state: SessionState,
}

/// Runs session commands on the host through `sh -c`.
pub struct HostProvider {
    default_dir: PathBuf,
    sessions: Mutex<HashMap<String, HostSession>>,
}

impl HostProvider {
    pub fn new(default_dir: impl Into<PathBuf>) -> Self {
        Self {
            default_dir: default_dir.into(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Number of sessions that have not been destroyed.
    pub async fn live_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[async_trait]
impl IsolationProvider for HostProvider {
    fn name(&self) -> &str {
        "host"
    }

    fn capabilities(&self) -> IsolationCapabilities {
        IsolationCapabilities {
            mounts: false,
            env_allowlist: true,
            secrets: false,
            resource_limits: false,
            network_modes: vec![NetworkMode::Host],
        }
    }

    async fn start(&self, policy: &IsolationPolicy) -> Result<String, IsolationError> {
        let id = uuid::Uuid::new_v4().to_string();
        let env = policy
            .env_allowlist
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.clone(), v)))
            .collect();
        let session = HostSession {
            working_dir: policy
                .working_dir
                .clone()
                .unwrap_or_else(|| self.default_dir.clone()),
            env,
            state: SessionState::Running,
        };
        self.sessions.lock().await.insert(id.clone(), session);
        tracing::debug!(session = %id, "host session started");
        Ok(id)
    }

    async fn exec(&self, session_id: &str, command: &str) -> Result<ExecOutput, IsolationError> {
        let (working_dir, env) = {
            let sessions = self.sessions.lock().await;
            let session = sessions
                .get(session_id)
                .ok_or_else(|| IsolationError::UnknownSession(session_id.to_string()))?;
            if session.state != SessionState::Running {
                return Err(IsolationError::SessionNotRunning(session_id.to_string()));
            }
            (session.working_dir.clone(), session.env.clone())
        };

        let mut cmd = Command::new(SHELL);
        cmd.arg("-c")
            .arg(command)
            .current_dir(&working_dir)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd.output().await.map_err(|source| IsolationError::ExecFailed {
            session: session_id.to_string(),
            source,
        })?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn stop(&self, session_id: &str) -> Result<(), IsolationError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| IsolationError::UnknownSession(session_id.to_string()))?;
        if session.state != SessionState::Running {
            return Err(IsolationError::SessionNotRunning(session_id.to_string()));
        }
        session.state = SessionState::Stopped;
        Ok(())
    }

    async fn destroy(&self, session_id: &str) -> Result<(), IsolationError> {
        if self.sessions.lock().await.remove(session_id).is_none() {
            return Err(IsolationError::UnknownSession(session_id.to_string()));
        }
        tracing::debug!(session = %session_id, "host session destroyed");
        Ok(())
    }
}
