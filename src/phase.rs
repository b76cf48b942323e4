//! Phase definitions and JSON loading for issue pipelines.
//!
//! This module provides:
//! - `PhaseDefinition` describing one step of an issue pipeline
//! - `PipelineFile` representing a `pipeline.json` override
//! - The default five-phase pipeline and the reduced review-response pipeline

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A single step of an issue pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseDefinition {
    /// 1-based id; defines execution order
    pub id: u32,
    /// Human-readable name of the phase
    pub name: String,
    /// A failed critical phase aborts the remaining pipeline
    #[serde(default)]
    pub critical: bool,
    /// Conventional-commit type used when committing after this phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_type: Option<String>,
    /// Supports `{issue}`, `{title}` and `{phase}` placeholders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message_template: Option<String>,
    /// Run the phase inside an isolation session
    #[serde(default)]
    pub sandboxed: bool,
    /// Execute the task plan found in the previous phase's output, task by task
    #[serde(default)]
    pub task_plan: bool,
}

impl PhaseDefinition {
    pub fn new(id: u32, name: &str, critical: bool) -> Self {
        Self {
            id,
            name: name.to_string(),
            critical,
            commit_type: None,
            commit_message_template: None,
            sandboxed: false,
            task_plan: false,
        }
    }

    pub fn with_commit(mut self, commit_type: &str, template: &str) -> Self {
        self.commit_type = Some(commit_type.to_string());
        self.commit_message_template = Some(template.to_string());
        self
    }

    pub fn sandboxed(mut self) -> Self {
        self.sandboxed = true;
        self
    }

    pub fn with_task_plan(mut self) -> Self {
        self.task_plan = true;
        self
    }

    /// Lowercase, dash-separated form of the name.
    pub fn slug(&self) -> String {
        let mut slug = String::with_capacity(self.name.len());
        for c in self.name.chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
            } else if !slug.is_empty() && !slug.ends_with('-') {
                slug.push('-');
            }
        }
        slug.trim_end_matches('-').to_string()
    }

    /// File name of this phase's primary artifact, e.g. `01-analysis.md`.
    pub fn artifact_file_name(&self) -> String {
        format!("{:02}-{}.md", self.id, self.slug())
    }

    /// Render the commit message for this phase, if it commits at all.
    pub fn commit_message(&self, issue: u64, title: &str) -> Option<String> {
        let commit_type = self.commit_type.as_deref()?;
        let message = match &self.commit_message_template {
            Some(template) => template
                .replace("{issue}", &issue.to_string())
                .replace("{title}", title)
                .replace("{phase}", &self.name),
            None => format!("{}: {} (#{})", commit_type, title, issue),
        };
        Some(message)
    }
}

/// Represents a `pipeline.json` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineFile {
    pub phases: Vec<PhaseDefinition>,
}

impl PipelineFile {
    /// Load and validate a pipeline from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        let file: PipelineFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse pipeline JSON: {}", path.display()))?;

        validate_phases(&file.phases)
            .with_context(|| format!("Invalid pipeline: {}", path.display()))?;
        Ok(file)
    }
}

/// Phase ids must be non-zero and strictly ascending.
pub fn validate_phases(phases: &[PhaseDefinition]) -> Result<()> {
    if phases.is_empty() {
        bail!("pipeline has no phases");
    }
    let mut last = 0;
    for phase in phases {
        if phase.id == 0 {
            bail!("phase '{}' has id 0; ids are 1-based", phase.name);
        }
        if phase.id <= last {
            bail!(
                "phase {} ({}) is not after phase {}; ids must be strictly ascending",
                phase.id,
                phase.name,
                last
            );
        }
        last = phase.id;
    }
    Ok(())
}

/// Load `.conveyor/pipeline.json` from the project, falling back to the default pipeline.
pub fn load_pipeline(project_dir: &Path) -> Result<Vec<PhaseDefinition>> {
    let path = project_dir.join(".conveyor").join("pipeline.json");
    if path.exists() {
        Ok(PipelineFile::load(&path)?.phases)
    } else {
        Ok(default_pipeline())
    }
}

/// The full issue pipeline.
pub fn default_pipeline() -> Vec<PhaseDefinition> {
    vec![
        PhaseDefinition::new(1, "Analysis", true),
        PhaseDefinition::new(2, "Planning", true),
        PhaseDefinition::new(3, "Implementation", true)
            .with_commit("feat", "feat: {title} (#{issue})")
            .sandboxed()
            .with_task_plan(),
        PhaseDefinition::new(4, "Integration Verification", false)
            .with_commit("test", "test: verify {title} (#{issue})")
            .sandboxed(),
        PhaseDefinition::new(5, "Publication", false),
    ]
}

/// Reduced pipeline for responding to review feedback on an existing change.
pub fn review_response_pipeline() -> Vec<PhaseDefinition> {
    default_pipeline()
        .into_iter()
        .filter(|p| matches!(p.id, 3 | 4 | 5))
        .map(|mut p| {
            if p.id == 3 {
                p.commit_type = Some("fix".to_string());
                p.commit_message_template =
                    Some("fix: address review on {title} (#{issue})".to_string());
                // No planning phase runs before it.
                p.task_plan = false;
            }
            p
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_pipeline_is_valid() {
        let phases = default_pipeline();
        assert_eq!(phases.len(), 5);
        validate_phases(&phases).unwrap();
        assert!(phases[0].critical);
        assert!(!phases[4].critical);
        assert!(phases[2].sandboxed);
        assert!(phases[2].task_plan);
        assert_eq!(phases.iter().filter(|p| p.task_plan).count(), 1);
    }

    #[test]
    fn test_review_response_pipeline_is_subset() {
        let phases = review_response_pipeline();
        let ids: Vec<u32> = phases.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        validate_phases(&phases).unwrap();
        assert_eq!(phases[0].commit_type.as_deref(), Some("fix"));
        assert!(!phases[0].task_plan);
    }

    #[test]
    fn test_artifact_file_name() {
        let phase = PhaseDefinition::new(4, "Integration Verification", false);
        assert_eq!(phase.slug(), "integration-verification");
        assert_eq!(phase.artifact_file_name(), "04-integration-verification.md");

        let odd = PhaseDefinition::new(12, "  Build & Test!! ", false);
        assert_eq!(odd.artifact_file_name(), "12-build-test.md");
    }

    #[test]
    fn test_commit_message_placeholders() {
        let phase = PhaseDefinition::new(3, "Implementation", true)
            .with_commit("feat", "{phase} for #{issue}: {title}");
        assert_eq!(
            phase.commit_message(17, "Add login").as_deref(),
            Some("Implementation for #17: Add login")
        );
    }

    #[test]
    fn test_commit_message_without_template() {
        let mut phase = PhaseDefinition::new(3, "Implementation", true);
        assert!(phase.commit_message(1, "t").is_none());
        phase.commit_type = Some("chore".to_string());
        assert_eq!(phase.commit_message(1, "t").as_deref(), Some("chore: t (#1)"));
    }

    #[test]
    fn test_validate_rejects_bad_ids() {
        assert!(validate_phases(&[]).is_err());
        assert!(validate_phases(&[PhaseDefinition::new(0, "zero", false)]).is_err());
        let err = validate_phases(&[
            PhaseDefinition::new(2, "b", false),
            PhaseDefinition::new(2, "c", false),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("strictly ascending"));
    }

    #[test]
    fn test_pipeline_file_load_full_definition() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipeline.json");
        let file = PipelineFile {
            phases: review_response_pipeline(),
        };
        std::fs::write(&path, serde_json::to_string_pretty(&file).unwrap()).unwrap();

        let loaded = PipelineFile::load(&path).unwrap();
        assert_eq!(loaded.phases, file.phases);
    }

    #[test]
    fn test_pipeline_file_minimal_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"phases": [{"id": 1, "name": "Analysis"}]}"#).unwrap();

        let loaded = PipelineFile::load(&path).unwrap();
        assert!(!loaded.phases[0].critical);
        assert!(!loaded.phases[0].sandboxed);
        assert!(!loaded.phases[0].task_plan);
        assert!(loaded.phases[0].commit_type.is_none());
    }

    #[test]
    fn test_load_pipeline_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        assert_eq!(load_pipeline(dir.path()).unwrap(), default_pipeline());
    }

    #[test]
    fn test_load_pipeline_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".conveyor")).unwrap();
        std::fs::write(
            dir.path().join(".conveyor").join("pipeline.json"),
            r#"{"phases": [{"id": 2, "name": "b"}, {"id": 1, "name": "a"}]}"#,
        )
        .unwrap();
        assert!(load_pipeline(dir.path()).is_err());
    }
}
