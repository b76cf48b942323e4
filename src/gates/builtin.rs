//! Gates that ship with the engine.

use super::{Gate, GateContext, GateResult};
use anyhow::{Context, Result};
use async_trait::async_trait;

/// Checks that a phase left its artifact behind in the progress directory.
pub struct ArtifactGate {
    file_name: String,
    min_bytes: Option<u64>,
}

impl ArtifactGate {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            min_bytes: None,
        }
    }

    /// Warn when the artifact is smaller than `bytes`.
    pub fn with_min_size(mut self, bytes: u64) -> Self {
        self.min_bytes = Some(bytes);
        self
    }
}

#[async_trait]
impl Gate for ArtifactGate {
    fn name(&self) -> &str {
        "artifact"
    }

    async fn validate(&self, context: &GateContext) -> Result<GateResult> {
        let path = context.progress_dir.join(&self.file_name);
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        match tokio::fs::metadata(&path).await {
            Err(_) => errors.push(format!("missing artifact {}", path.display())),
            Ok(meta) if meta.len() == 0 => {
                errors.push(format!("artifact {} is empty", path.display()))
            }
            Ok(meta) => {
                if let Some(min) = self.min_bytes
                    && meta.len() < min
                {
                    warnings.push(format!(
                        "artifact {} is only {} bytes (expected at least {})",
                        path.display(),
                        meta.len(),
                        min
                    ));
                }
            }
        }

        Ok(GateResult::from_diagnostics(warnings, errors))
    }
}

const CLARIFICATION_MARKER: &str = "[NEEDS CLARIFICATION]";

/// Scans the analysis artifact for unresolved questions.
///
/// Lines carrying `[NEEDS CLARIFICATION]` are errors. List items under an
/// `Open Questions` heading are warnings.
pub struct AmbiguityGate {
    file_name: String,
}

impl AmbiguityGate {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }
}

#[async_trait]
impl Gate for AmbiguityGate {
    fn name(&self) -> &str {
        "ambiguity"
    }

    async fn validate(&self, context: &GateContext) -> Result<GateResult> {
        let path = context.progress_dir.join(&self.file_name);
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let (warnings, errors) = scan_ambiguities(&content);
        Ok(GateResult::from_diagnostics(warnings, errors))
    }
}

/// Returns `(open_questions, clarifications)` found in a markdown document.
fn scan_ambiguities(content: &str) -> (Vec<String>, Vec<String>) {
    let mut warnings = Vec::new();
    let mut errors = Vec::new();
    let mut in_open_questions = false;

    for line in content.lines() {
        let trimmed = line.trim();

        if trimmed.contains(CLARIFICATION_MARKER) {
            errors.push(format!("needs clarification: {}", trimmed));
        }

        if let Some(heading) = trimmed.strip_prefix('#') {
            let heading = heading.trim_start_matches('#').trim();
            in_open_questions = heading.eq_ignore_ascii_case("open questions");
            continue;
        }

        if in_open_questions
            && let Some(item) = trimmed
                .strip_prefix("- ")
                .or_else(|| trimmed.strip_prefix("* "))
        {
            let item = item.trim();
            if !item.is_empty() && !item.eq_ignore_ascii_case("none") {
                warnings.push(format!("open question: {}", item));
            }
        }
    }

    (warnings, errors)
}
