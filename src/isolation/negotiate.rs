//! Capability negotiation between an isolation policy and a provider.
//!
//! Negotiation is a pure function of the provider's declared capabilities and
//! the requested policy. Every attribute category is checked independently and
//! all mismatches are reported together; a single mismatch is enough to reject
//! the provider unless host fallback is allowed.

use super::provider::IsolationProvider;
use super::types::{IsolationCapabilities, IsolationPolicy};
use crate::errors::IsolationError;
use std::sync::Arc;

/// Fallback settings for [`negotiate`].
#[derive(Clone, Default)]
pub struct NegotiationOptions {
    pub allow_fallback_to_host: bool,
    pub host_provider: Option<Arc<dyn IsolationProvider>>,
}

/// Names of every policy attribute the capabilities cannot satisfy.
pub fn find_mismatches(capabilities: &IsolationCapabilities, policy: &IsolationPolicy) -> Vec<String> {
    let mut mismatches = Vec::new();

    if !policy.mounts.is_empty() && !capabilities.mounts {
        mismatches.push("mounts".to_string());
    }
    if let Some(mode) = policy.network_mode
        && !capabilities.network_modes.contains(&mode)
    {
        mismatches.push(format!("networkMode({mode})"));
    }
    if !policy.env_allowlist.is_empty() && !capabilities.env_allowlist {
        mismatches.push("envAllowlist".to_string());
    }
    if !policy.secrets.is_empty() && !capabilities.secrets {
        mismatches.push("secrets".to_string());
    }
    if policy.requests_resource_limits() && !capabilities.resource_limits {
        mismatches.push("resourceLimits".to_string());
    }

    mismatches
}

/// Pick the provider a session request may use.
///
/// Returns `provider` when it satisfies `policy`, the host provider when it does
/// not but fallback is allowed, and `CapabilityMismatch` otherwise.
pub fn negotiate(
    provider: Arc<dyn IsolationProvider>,
    policy: &IsolationPolicy,
    options: &NegotiationOptions,
) -> Result<Arc<dyn IsolationProvider>, IsolationError> {
    let mismatches = find_mismatches(&provider.capabilities(), policy);
    if mismatches.is_empty() {
        return Ok(provider);
    }

    if options.allow_fallback_to_host
        && let Some(host) = &options.host_provider
    {
        tracing::warn!(
            provider = provider.name(),
            fallback = host.name(),
            mismatches = ?mismatches,
            "isolation policy unsupported, degrading to host execution"
        );
        return Ok(host.clone());
    }

    Err(IsolationError::CapabilityMismatch {
        provider: provider.name().to_string(),
        mismatches,
    })
}
