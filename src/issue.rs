//! Tracked issues fed to the fleet.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A tracked issue as read from the issues file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    /// Issue numbers that must complete before this one starts
    #[serde(default)]
    pub depends_on: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl Issue {
    pub fn new(number: u64, title: &str) -> Self {
        Self {
            number,
            title: title.to_string(),
            body: String::new(),
            depends_on: Vec::new(),
            branch: None,
        }
    }

    pub fn depends_on(mut self, deps: &[u64]) -> Self {
        self.depends_on = deps.to_vec();
        self
    }

    /// Scheduler node id for this issue.
    pub fn node_id(&self) -> String {
        self.number.to_string()
    }

    /// Branch the issue's work lands on.
    pub fn branch_name(&self) -> String {
        self.branch
            .clone()
            .unwrap_or_else(|| format!("conveyor/issue-{}", self.number))
    }
}

/// The `--issues` input file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuesFile {
    pub issues: Vec<Issue>,
}

impl IssuesFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read issues file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse issues JSON: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_issues_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.json");
        std::fs::write(
            &path,
            r#"{"issues": [
                {"number": 1, "title": "Base"},
                {"number": 2, "title": "Feature", "body": "details", "depends_on": [1], "branch": "feat/two"}
            ]}"#,
        )
        .unwrap();

        let file = IssuesFile::load(&path).unwrap();
        assert_eq!(file.issues.len(), 2);
        assert_eq!(file.issues[0], Issue::new(1, "Base"));
        assert_eq!(file.issues[1].depends_on, vec![1]);
        assert_eq!(file.issues[1].branch_name(), "feat/two");
        assert_eq!(file.issues[0].branch_name(), "conveyor/issue-1");
    }

    #[test]
    fn test_load_missing_file_has_path_context() {
        let err = IssuesFile::load(Path::new("/nonexistent/issues.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/issues.json"));
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.json");
        std::fs::write(&path, "{\"issues\": [{\"title\": \"no number\"}]}").unwrap();
        assert!(IssuesFile::load(&path).is_err());
    }
}
