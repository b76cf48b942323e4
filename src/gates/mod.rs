//! Post-phase quality gates.
//!
//! A gate scores a phase's output after its executor has returned successfully.
//! Gates are looked up by phase id in a [`GateRegistry`] that is built once per
//! fleet run and handed to the pipeline. Phase 1 additionally merges the
//! registry's ambiguity gate into its result.

mod builtin;

pub use builtin::{AmbiguityGate, ArtifactGate};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Outcome category of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Pass,
    Warn,
    Fail,
}

/// Result of running a gate. The status is always derived from the lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub status: GateStatus,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl GateResult {
    /// Build a result whose status follows from the diagnostics.
    pub fn from_diagnostics(warnings: Vec<String>, errors: Vec<String>) -> Self {
        let status = if !errors.is_empty() {
            GateStatus::Fail
        } else if !warnings.is_empty() {
            GateStatus::Warn
        } else {
            GateStatus::Pass
        };
        Self {
            status,
            warnings,
            errors,
        }
    }

    pub fn pass() -> Self {
        Self::from_diagnostics(Vec::new(), Vec::new())
    }

    pub fn is_fail(&self) -> bool {
        self.status == GateStatus::Fail
    }

    /// Union the diagnostics of two results and recompute the status.
    pub fn merge(self, other: GateResult) -> GateResult {
        let mut warnings = self.warnings;
        warnings.extend(other.warnings);
        let mut errors = self.errors;
        errors.extend(other.errors);
        Self::from_diagnostics(warnings, errors)
    }
}

/// What a gate gets to look at.
#[derive(Debug, Clone)]
pub struct GateContext {
    pub progress_dir: PathBuf,
    pub working_checkout_path: PathBuf,
    pub base_revision: Option<String>,
}

/// A post-phase quality check.
#[async_trait]
pub trait Gate: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(&self, context: &GateContext) -> Result<GateResult>;
}

/// Run a gate, turning an error from the gate itself into a failing result.
pub async fn run_gate(gate: &dyn Gate, context: &GateContext) -> GateResult {
    match gate.validate(context).await {
        Ok(result) => result,
        Err(e) => GateResult::from_diagnostics(
            Vec::new(),
            vec![format!("gate '{}' errored: {:#}", gate.name(), e)],
        ),
    }
}

/// Gates per phase id, plus the ambiguity gate merged into phase 1.
#[derive(Clone, Default)]
pub struct GateRegistry {
    gates: HashMap<u32, Arc<dyn Gate>>,
    ambiguity: Option<Arc<dyn Gate>>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the gate for `phase`, replacing any previous one.
    pub fn register(mut self, phase: u32, gate: Arc<dyn Gate>) -> Self {
        self.gates.insert(phase, gate);
        self
    }

    /// Set the secondary gate merged into phase 1's result.
    pub fn with_ambiguity_gate(mut self, gate: Arc<dyn Gate>) -> Self {
        self.ambiguity = Some(gate);
        self
    }

    pub fn has_gate(&self, phase: u32) -> bool {
        self.gates.contains_key(&phase) || (phase == 1 && self.ambiguity.is_some())
    }

    /// Run the gate(s) registered for `phase`. `None` means nothing is registered.
    pub async fn evaluate(&self, phase: u32, context: &GateContext) -> Option<GateResult> {
        let primary = match self.gates.get(&phase) {
            Some(gate) => Some(run_gate(gate.as_ref(), context).await),
            None => None,
        };

        let ambiguity = match (&self.ambiguity, phase) {
            (Some(gate), 1) => Some(run_gate(gate.as_ref(), context).await),
            _ => None,
        };

        match (primary, ambiguity) {
            (Some(p), Some(a)) => Some(p.merge(a)),
            (Some(p), None) => Some(p),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        }
    }
}
