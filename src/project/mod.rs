//! Project analysis.
//!
//! Classifies a project directory into a [`ProjectKind`] plus a set of
//! detected [`Feature`] flags. Analysis only reads the filesystem.

mod detector;

pub use detector::ProjectDetector;

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;

/// Detected project kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectKind {
    /// PHP project (Composer, Laravel, Symfony, plain PHP)
    Php,
    /// Python project (pip, Poetry, Django, Flask)
    Python,
    /// Anything else
    Unknown,
}

impl ProjectKind {
    /// Short identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Php => "php",
            Self::Python => "python",
            Self::Unknown => "unknown",
        }
    }

    /// Get display name for the project kind.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Php => "PHP",
            Self::Python => "Python",
            Self::Unknown => "Unknown",
        }
    }

    /// Directories never worth descending into while looking for markers.
    pub fn ignore_dirs(&self) -> &'static [&'static str] {
        match self {
            Self::Php => &[".git", "vendor", "node_modules", "storage"],
            Self::Python => &[".git", "__pycache__", ".venv", "venv", ".tox", "node_modules"],
            Self::Unknown => &[".git", "node_modules"],
        }
    }
}

impl fmt::Display for ProjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected project feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Feature {
    /// The project talks to a database server
    #[serde(rename = "has-database")]
    HasDatabase,
    /// MySQL/MariaDB driver hint
    #[serde(rename = "db-mysql")]
    DbMysql,
    /// PostgreSQL driver hint
    #[serde(rename = "db-postgres")]
    DbPostgres,
    /// Redis cache/session/queue
    #[serde(rename = "has-redis")]
    HasRedis,
    /// Outgoing SMTP mail
    #[serde(rename = "has-mail")]
    HasMail,
    /// Laravel application
    #[serde(rename = "framework-laravel")]
    Laravel,
    /// Symfony application
    #[serde(rename = "framework-symfony")]
    Symfony,
    /// Django application
    #[serde(rename = "framework-django")]
    Django,
    /// Flask application
    #[serde(rename = "framework-flask")]
    Flask,
}

impl Feature {
    /// All features, in display order.
    pub const ALL: [Feature; 9] = [
        Self::HasDatabase,
        Self::DbMysql,
        Self::DbPostgres,
        Self::HasRedis,
        Self::HasMail,
        Self::Laravel,
        Self::Symfony,
        Self::Django,
        Self::Flask,
    ];

    /// Flag string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HasDatabase => "has-database",
            Self::DbMysql => "db-mysql",
            Self::DbPostgres => "db-postgres",
            Self::HasRedis => "has-redis",
            Self::HasMail => "has-mail",
            Self::Laravel => "framework-laravel",
            Self::Symfony => "framework-symfony",
            Self::Django => "framework-django",
            Self::Flask => "framework-flask",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown feature '{s}'"))
    }
}

/// An analyzed project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Absolute project directory
    pub path: PathBuf,

    /// Name derived from the directory, used as the stack name
    pub name: String,

    /// Detected kind
    pub kind: ProjectKind,

    /// Detected features
    pub features: BTreeSet<Feature>,
}

impl Project {
    /// Whether a feature was detected.
    pub fn has(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }
}

/// Analyze a project directory.
///
/// Fails only when `path` is missing or not a directory. An unrecognized
/// layout yields [`ProjectKind::Unknown`].
pub fn analyze(path: impl AsRef<Path>) -> Result<Project, AnalysisError> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(AnalysisError::NotFound(path.to_path_buf()));
    }
    if !path.is_dir() {
        return Err(AnalysisError::NotADirectory(path.to_path_buf()));
    }

    let path = path
        .canonicalize()
        .map_err(|source| AnalysisError::Io { path: path.to_path_buf(), source })?;

    let detector = ProjectDetector::new(&path);
    let kind = detector.detect_kind();
    let features = detector.detect_features(kind);
    let name = project_name(&path);

    tracing::debug!(project = %name, kind = %kind, features = features.len(), "Analyzed project");

    Ok(Project { path, name, kind, features })
}

/// Derive a container-safe stack name from a directory path.
pub fn project_name(path: &Path) -> String {
    let raw = path.file_name().and_then(|n| n.to_str()).unwrap_or("project");

    let mut name: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();

    // Container names must start with an alphanumeric character
    name = name.trim_matches(|c| c == '-' || c == '_').to_string();
    if name.is_empty() {
        name = "project".to_string();
    }
    name
}
