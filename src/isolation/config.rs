use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::types::{IsolationPolicy, MountSpec, NetworkMode, ResourceLimits, SecretBinding};

/// Variables passed into sessions when the config names none.
const DEFAULT_ENV_ALLOWLIST: &[&str] = &["PATH"];

/// Isolation settings for sandboxed phases.
#[derive(Debug, Clone, PartialEq)]
pub struct IsolationSettings {
    /// Run on the host when the configured provider cannot satisfy the policy
    pub allow_fallback_to_host: bool,
    pub policy: IsolationPolicy,
}

impl Default for IsolationSettings {
    fn default() -> Self {
        Self {
            allow_fallback_to_host: false,
            policy: IsolationPolicy {
                env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|k| k.to_string()).collect(),
                ..Default::default()
            },
        }
    }
}

/// Raw TOML structure for `.conveyor/isolation.toml`
#[derive(Debug, Deserialize)]
struct IsolationToml {
    isolation: Option<IsolationSection>,
}

#[derive(Debug, Deserialize)]
struct IsolationSection {
    allow_fallback_to_host: Option<bool>,
    network: Option<NetworkMode>,
    memory: Option<String>,
    cpus: Option<f64>,
    timeout: Option<u64>,
    env: Option<Vec<String>>,
    /// container path -> host path
    mounts: Option<HashMap<String, String>>,
    /// env var -> secret name
    secrets: Option<HashMap<String, String>>,
}

impl IsolationSettings {
    /// Load isolation settings from `.conveyor/isolation.toml` in the project directory.
    /// Returns defaults if the file doesn't exist.
    pub fn load(project_path: &Path) -> Result<Self> {
        let config_path = project_path.join(".conveyor").join("isolation.toml");
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let toml: IsolationToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let mut settings = Self::default();
        let Some(section) = toml.isolation else {
            return Ok(settings);
        };

        if let Some(allow) = section.allow_fallback_to_host {
            settings.allow_fallback_to_host = allow;
        }
        settings.policy.network_mode = section.network;
        if let Some(env) = section.env {
            settings.policy.env_allowlist = env;
        }

        let limits = ResourceLimits {
            memory: section.memory,
            cpus: section.cpus,
            timeout_secs: section.timeout,
        };
        if !limits.is_empty() {
            settings.policy.resource_limits = Some(limits);
        }

        if let Some(mounts) = section.mounts {
            let mut mounts: Vec<MountSpec> = mounts
                .into_iter()
                .map(|(target, source)| MountSpec {
                    source: source.into(),
                    target: target.into(),
                    read_only: false,
                })
                .collect();
            mounts.sort_by(|a, b| a.target.cmp(&b.target));
            settings.policy.mounts = mounts;
        }

        if let Some(secrets) = section.secrets {
            let mut secrets: Vec<SecretBinding> = secrets
                .into_iter()
                .map(|(env_var, name)| SecretBinding { name, env_var })
                .collect();
            secrets.sort_by(|a, b| a.env_var.cmp(&b.env_var));
            settings.policy.secrets = secrets;
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_config(dir: &Path, content: &str) {
        let conveyor_dir = dir.join(".conveyor");
        fs::create_dir_all(&conveyor_dir).unwrap();
        fs::write(conveyor_dir.join("isolation.toml"), content).unwrap();
    }

    #[test]
    fn test_isolation_settings_defaults() {
        let settings = IsolationSettings::default();
        assert!(!settings.allow_fallback_to_host);
        assert_eq!(settings.policy.env_allowlist, vec!["PATH"]);
        assert!(settings.policy.mounts.is_empty());
        assert!(settings.policy.network_mode.is_none());
    }

    #[test]
    fn test_isolation_settings_env_replaces_default_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "[isolation]\nenv = [\"HOME\"]\n");
        let settings = IsolationSettings::load(dir.path()).unwrap();
        assert_eq!(settings.policy.env_allowlist, vec!["HOME"]);
    }

    #[test]
    fn test_isolation_settings_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = IsolationSettings::load(dir.path()).unwrap();
        assert_eq!(settings, IsolationSettings::default());
    }

    #[test]
    fn test_isolation_settings_load_full() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
[isolation]
allow_fallback_to_host = true
network = "bridge"
memory = "8g"
cpus = 4.0
timeout = 3600
env = ["PATH", "CARGO_HOME"]

[isolation.mounts]
"/work" = "/home/dev/repo"

[isolation.secrets]
GH_TOKEN = "github-token"
"#,
        );

        let settings = IsolationSettings::load(dir.path()).unwrap();
        assert!(settings.allow_fallback_to_host);
        assert_eq!(settings.policy.network_mode, Some(NetworkMode::Bridge));
        assert_eq!(settings.policy.env_allowlist, vec!["PATH", "CARGO_HOME"]);
        let limits = settings.policy.resource_limits.unwrap();
        assert_eq!(limits.memory.as_deref(), Some("8g"));
        assert_eq!(limits.cpus, Some(4.0));
        assert_eq!(limits.timeout_secs, Some(3600));
        assert_eq!(settings.policy.mounts[0].target, Path::new("/work"));
        assert_eq!(settings.policy.mounts[0].source, Path::new("/home/dev/repo"));
        assert_eq!(settings.policy.secrets[0].env_var, "GH_TOKEN");
        assert_eq!(settings.policy.secrets[0].name, "github-token");
    }

    #[test]
    fn test_isolation_settings_load_partial() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "[isolation]\nnetwork = \"none\"\n");

        let settings = IsolationSettings::load(dir.path()).unwrap();
        assert_eq!(settings.policy.network_mode, Some(NetworkMode::None));
        assert!(settings.policy.resource_limits.is_none());
        assert!(settings.policy.mounts.is_empty());
        assert!(!settings.allow_fallback_to_host);
    }

    #[test]
    fn test_isolation_settings_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "not valid toml {{{{");
        assert!(IsolationSettings::load(dir.path()).is_err());
    }

    #[test]
    fn test_isolation_settings_load_empty_section() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "[isolation]\n");
        let settings = IsolationSettings::load(dir.path()).unwrap();
        assert_eq!(settings, IsolationSettings::default());
    }
}
