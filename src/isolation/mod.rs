//! Execution isolation: the provider contract and capability negotiation.
//!
//! A phase that needs a sandboxed session states an [`IsolationPolicy`]. Before a
//! session is started the policy is matched against the provider's declared
//! [`IsolationCapabilities`] with [`negotiate`]; sandbox backends themselves are
//! external and only the host fallback ships here.

mod config;
mod host;
mod negotiate;
mod provider;
mod types;

pub use config::IsolationSettings;
pub use host::HostProvider;
pub use negotiate::{NegotiationOptions, find_mismatches, negotiate};
pub use provider::{IsolationProvider, SessionHandle};
pub use types::{
    ExecOutput, IsolationCapabilities, IsolationPolicy, MountSpec, NetworkMode, ResourceLimits,
    SecretBinding, SessionState,
};
