use super::types::{ExecOutput, IsolationCapabilities, IsolationPolicy};
use crate::errors::IsolationError;
use async_trait::async_trait;
use std::sync::Arc;

/// Abstraction over sandboxing backends.
/// Real implementations live outside this crate (containers, VMs); `HostProvider`
/// runs directly on the host and serves as the degraded fallback.
#[async_trait]
pub trait IsolationProvider: Send + Sync {
    /// Stable name used in logs and mismatch errors.
    fn name(&self) -> &str;

    /// What this provider can enforce. Queried, never mutated, by negotiation.
    fn capabilities(&self) -> IsolationCapabilities;

    /// Start a session for `policy` and return its id.
    async fn start(&self, policy: &IsolationPolicy) -> Result<String, IsolationError>;

    /// Run a shell command inside a running session.
    async fn exec(&self, session_id: &str, command: &str) -> Result<ExecOutput, IsolationError>;

    /// Stop a running session. The session can no longer exec.
    async fn stop(&self, session_id: &str) -> Result<(), IsolationError>;

    /// Tear a session down and forget it.
    async fn destroy(&self, session_id: &str) -> Result<(), IsolationError>;
}

/// A started session bound to the provider that owns it.
///
/// Dropping the handle does not destroy the session; callers must call
/// [`SessionHandle::destroy`] on every exit path.
#[derive(Clone)]
pub struct SessionHandle {
    provider: Arc<dyn IsolationProvider>,
    id: String,
}

impl SessionHandle {
    /// Start a session on `provider`.
    pub async fn start(
        provider: Arc<dyn IsolationProvider>,
        policy: &IsolationPolicy,
    ) -> Result<Self, IsolationError> {
        let id = provider.start(policy).await?;
        Ok(Self { provider, id })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub async fn exec(&self, command: &str) -> Result<ExecOutput, IsolationError> {
        self.provider.exec(&self.id, command).await
    }

    /// Stop and destroy the session, logging rather than failing on stop errors.
    pub async fn destroy(self) -> Result<(), IsolationError> {
        if let Err(e) = self.provider.stop(&self.id).await {
            tracing::debug!(session = %self.id, error = %e, "stop before destroy failed");
        }
        self.provider.destroy(&self.id).await
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("provider", &self.provider.name())
            .field("id", &self.id)
            .finish()
    }
}
