//! Configuration management for devstack.
//!
//! Handles loading and saving global settings from TOML files.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Container engine settings
    pub engine: EngineConfig,

    /// Host port allocation settings
    pub ports: PortsConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Where stack records live (`~` is expanded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<String>,

    /// Start instances of the same dependency wave concurrently
    pub parallel: bool,
}

/// Container engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine CLI binary
    pub binary: String,

    /// When to pull images
    pub pull: PullPolicy,
}

/// Host port allocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Skip ports something on the host already listens on
    pub probe_host: bool,
}

/// Image pull policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull only when the image is not present locally
    #[default]
    Missing,
    /// Pull before every create
    Always,
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("missing"),
            Self::Always => f.write_str("always"),
        }
    }
}

impl FromStr for PullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing" => Ok(Self::Missing),
            "always" => Ok(Self::Always),
            other => Err(format!("unknown pull policy '{other}' (expected missing or always)")),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { state_dir: None, parallel: true }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { binary: "docker".to_string(), pull: PullPolicy::Missing }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self { probe_host: true }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Looks for config in:
    /// 1. `~/.config/devstack/config.toml`
    /// 2. Falls back to defaults
    pub fn load() -> anyhow::Result<Self> {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                return Self::load_from_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Save configuration to the global config file. Returns its path.
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let dir = Self::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        std::fs::create_dir_all(&dir)?;

        let content = toml::to_string_pretty(self)?;
        let path = dir.join("config.toml");
        std::fs::write(&path, content)?;

        tracing::debug!(path = %path.display(), "Saved config");
        Ok(path)
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("devstack"))
    }

    /// Get the global config file path.
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|d| d.join("config.toml"))
    }

    /// Get the data directory path.
    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("devstack"))
    }

    /// Resolve the state directory.
    ///
    /// An explicit directory (command line or `DEVSTACK_STATE_DIR`) wins over
    /// `general.state_dir`, which wins over the platform data directory.
    pub fn state_dir(&self, explicit: Option<&Path>) -> Result<PathBuf, StoreError> {
        if let Some(dir) = explicit {
            return Ok(dir.to_path_buf());
        }
        if let Some(dir) = &self.general.state_dir {
            return Ok(PathBuf::from(shellexpand::tilde(dir).into_owned()));
        }
        Self::data_dir().ok_or(StoreError::NoStateDir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.general.parallel);
        assert!(config.general.state_dir.is_none());
        assert_eq!(config.engine.binary, "docker");
        assert_eq!(config.engine.pull, PullPolicy::Missing);
        assert!(config.ports.probe_host);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[engine]"));
        assert!(toml_str.contains("pull = \"missing\""));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [general]
            parallel = false
            state_dir = "/var/lib/devstack"

            [engine]
            binary = "podman"
            pull = "always"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(!config.general.parallel);
        assert_eq!(config.engine.binary, "podman");
        assert_eq!(config.engine.pull, PullPolicy::Always);
        // Missing sections fall back to defaults
        assert!(config.ports.probe_host);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ports]\nprobe_host = false\n").unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert!(!config.ports.probe_host);
        assert_eq!(config.engine.binary, "docker");
    }

    #[test]
    fn test_state_dir_precedence() {
        let mut config = Config::default();
        config.general.state_dir = Some("/srv/devstack".to_string());

        let explicit = Path::new("/tmp/state");
        assert_eq!(config.state_dir(Some(explicit)).unwrap(), explicit);
        assert_eq!(config.state_dir(None).unwrap(), PathBuf::from("/srv/devstack"));
    }

    #[test]
    fn test_state_dir_expands_tilde() {
        let mut config = Config::default();
        config.general.state_dir = Some("~/stacks".to_string());

        let dir = config.state_dir(None).unwrap();
        assert!(!dir.to_string_lossy().starts_with('~'));
        assert!(dir.ends_with("stacks"));
    }

    #[test]
    fn test_pull_policy_parse() {
        assert_eq!("always".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert!("never".parse::<PullPolicy>().is_err());
    }
}
