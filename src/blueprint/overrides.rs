//! Per-project overrides read from `.devstack.toml`.
//!
//! ```toml
//! [env]
//! APP_DEBUG = "true"
//!
//! [services.db]
//! tag = "8.4"
//! port = 3307
//!
//! [services.mail]
//! enabled = false
//!
//! [services.app]
//! probe = "tcp"
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// File name of the per-project override file.
pub const OVERRIDE_FILE: &str = ".devstack.toml";

/// User overrides for a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Overrides {
    /// Flat environment overrides, applied to every instance
    pub env: BTreeMap<String, String>,

    /// Role overrides keyed by role name
    pub services: BTreeMap<String, RoleOverride>,
}

/// Overrides for one role. Every set field wins over the role default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleOverride {
    /// Force the role in (`true`) or out (`false`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Replace the image reference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Replace only the tag of the image
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Requested host port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Environment for this role only
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Hard dependencies, replacing the role's defaults
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,

    /// Readiness probe, replacing the role's default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeOverride>,
}

/// Probes a user can select; command probes stay role-defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeOverride {
    /// Wait for the running state only
    Running,
    /// Wait until the published host port accepts connections
    Tcp,
}

impl Overrides {
    /// Load `.devstack.toml` from a project directory; a missing file means no
    /// overrides.
    pub fn load(project_dir: &Path) -> anyhow::Result<Self> {
        let path = project_dir.join(OVERRIDE_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let overrides: Self =
            toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;

        tracing::debug!(
            path = %path.display(),
            env = overrides.env.len(),
            services = overrides.services.len(),
            "Loaded overrides"
        );
        Ok(overrides)
    }

    /// Get or create the override entry for a role.
    pub fn role_mut(&mut self, role: &str) -> &mut RoleOverride {
        self.services.entry(role.to_string()).or_default()
    }

    /// Force a role in.
    pub fn enable(&mut self, role: &str) {
        self.role_mut(role).enabled = Some(true);
    }

    /// Force a role out.
    pub fn disable(&mut self, role: &str) {
        self.role_mut(role).enabled = Some(false);
    }

    /// Add a flat environment override.
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }
}

/// Replace the tag of an image reference, keeping registry and repository.
pub fn with_tag(image: &str, tag: &str) -> String {
    let repo = image.split('@').next().unwrap_or(image);
    let name_start = repo.rfind('/').map_or(0, |i| i + 1);
    let repo = match repo[name_start..].rfind(':') {
        Some(i) => &repo[..name_start + i],
        None => repo,
    };
    format!("{repo}:{tag}")
}
