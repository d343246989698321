//! Project environment files.
//!
//! Reads a project's `.env` files, interpolates `${VAR}` references and masks
//! sensitive values for display.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

/// `.env` files merged for a project, in load order (later files win).
pub const ENV_FILE_PATTERNS: &[&str] = &[".env", ".env.local"];

/// Sensitive variable name patterns that should be masked.
const SENSITIVE_PATTERNS: &[&str] = &[
    "KEY",
    "SECRET",
    "PASSWORD",
    "PASSWD",
    "TOKEN",
    "CREDENTIAL",
    "AUTH",
    "PRIVATE",
];

/// `${NAME}` or `${NAME:-default}`.
static VAR_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid variable regex")
});

/// Variables loaded from a project's `.env` files.
#[derive(Debug, Clone, Default)]
pub struct ProjectEnv {
    /// Merged values
    values: BTreeMap<String, String>,

    /// Files that contributed values
    sources: Vec<PathBuf>,
}

impl ProjectEnv {
    /// Load and merge the `.env` files found in `root`.
    ///
    /// Missing files are skipped; malformed lines are logged and ignored so a
    /// broken `.env` never prevents a stack from being planned.
    pub fn load(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let mut env = Self::default();

        for pattern in ENV_FILE_PATTERNS {
            let path = root.join(pattern);
            if !path.is_file() {
                continue;
            }

            let iter = match dotenvy::from_path_iter(&path) {
                Ok(iter) => iter,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to read env file");
                    continue;
                }
            };

            for item in iter {
                match item {
                    Ok((key, value)) => {
                        env.values.insert(key, value);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping malformed env line");
                    }
                }
            }
            env.sources.push(path);
        }

        tracing::debug!(count = env.values.len(), files = env.sources.len(), "Loaded project env");
        env
    }

    /// Build from explicit values.
    pub fn from_values(values: BTreeMap<String, String>) -> Self {
        Self { values, sources: Vec::new() }
    }

    /// Get a value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Whether a key is defined.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// All values.
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Files that contributed values.
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }
}

/// Check if a variable name is sensitive.
pub fn is_sensitive_var(name: &str) -> bool {
    let upper = name.to_uppercase();
    SENSITIVE_PATTERNS.iter().any(|pattern| upper.contains(pattern))
}

/// Mask a value for display if its name is sensitive.
pub fn masked_value(name: &str, value: &str) -> String {
    if !is_sensitive_var(name) || value.is_empty() {
        return value.to_string();
    }
    if value.chars().count() <= 4 {
        "****".to_string()
    } else {
        let prefix: String = value.chars().take(2).collect();
        format!("{prefix}****")
    }
}

/// Names referenced by `${NAME}` / `${NAME:-default}` in a value.
pub fn references(value: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in VAR_REF.captures_iter(value) {
        if !names.iter().any(|n| n == &caps[1]) {
            names.push(caps[1].to_string());
        }
    }
    names
}

/// Result of interpolating a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpolated {
    /// The expanded value
    pub value: String,

    /// Referenced names that had no value and no default
    pub missing: Vec<String>,
}

/// Expand `${NAME}` and `${NAME:-default}` references using `lookup`.
///
/// Unresolved references without a default expand to the empty string and
/// are reported in [`Interpolated::missing`].
pub fn interpolate<F>(value: &str, lookup: F) -> Interpolated
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = Vec::new();
    let expanded = VAR_REF.replace_all(value, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match (lookup(name), caps.get(2)) {
            (Some(found), _) if !found.is_empty() => found,
            (_, Some(default)) => default.as_str().to_string(),
            (Some(found), None) => found,
            (None, None) => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    Interpolated { value: expanded.into_owned(), missing }
}
