//! Durable stack records.
//!
//! One JSON file per project under `<state_dir>/stacks/`, named after a hash
//! of the project path. There is no cross-process locking; the last writer
//! wins.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::synth::StackPlan;

/// Lifecycle status of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackStatus {
    Absent,
    Creating,
    Running,
    Reconciling,
    Stopping,
    Stopped,
    Destroying,
    Failed,
    Unknown,
}

impl StackStatus {
    /// Status word.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Reconciling => "reconciling",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Destroying => "destroying",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine identity of a created container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Engine container id
    pub id: String,

    /// Fingerprint of the instance the container was created from
    pub fingerprint: String,
}

/// Persisted state of one project's stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackRecord {
    /// Absolute project directory
    pub project_path: PathBuf,

    /// Stack name
    pub project_name: String,

    /// Last applied plan
    pub plan: StackPlan,

    /// Created containers keyed by instance name
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerRecord>,

    /// Engine network id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,

    /// Current status
    pub status: StackStatus,

    /// Last write
    pub updated_at: DateTime<Utc>,
}

impl StackRecord {
    /// Start a record for a plan.
    pub fn new(plan: StackPlan, status: StackStatus) -> Self {
        Self {
            project_path: plan.project.path.clone(),
            project_name: plan.project.name.clone(),
            plan,
            containers: BTreeMap::new(),
            network_id: None,
            status,
            updated_at: Utc::now(),
        }
    }

    /// Update the status and timestamp.
    pub fn set_status(&mut self, status: StackStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Container id of an instance.
    pub fn container_id(&self, instance: &str) -> Option<&str> {
        self.containers.get(instance).map(|c| c.id.as_str())
    }
}

/// A record file that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptRecord {
    /// Record file
    pub path: PathBuf,

    /// Parse error
    pub error: String,
}

/// Everything found in the store.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Readable records
    pub records: Vec<StackRecord>,

    /// Unreadable record files
    pub corrupt: Vec<CorruptRecord>,
}

impl LoadReport {
    /// Record of another project using `name`.
    pub fn name_owner(&self, name: &str, except: &Path) -> Option<&StackRecord> {
        self.records.iter().find(|r| r.project_name == name && r.project_path != except)
    }
}

/// File-backed record store.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Store rooted at `state_dir`.
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self { dir: state_dir.as_ref().join("stacks") }
    }

    /// Directory holding record files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stable record key for a project path.
    pub fn key(project: &Path) -> String {
        let digest = Sha256::digest(project.to_string_lossy().as_bytes());
        let hex = format!("{digest:x}");
        hex[..16].to_string()
    }

    /// Record file of a project.
    pub fn record_path(&self, project: &Path) -> PathBuf {
        self.dir.join(format!("{}.json", Self::key(project)))
    }

    /// Read every record. Unreadable files are reported, not fatal.
    pub fn load(&self) -> Result<LoadReport, StoreError> {
        let mut report = LoadReport::default();
        if !self.dir.exists() {
            return Ok(report);
        }

        let entries =
            fs::read_dir(&self.dir).map_err(|source| StoreError::Io { path: self.dir.clone(), source })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            match read_record(&path) {
                Ok(record) => report.records.push(record),
                Err(e) => {
                    let error = unreadable_reason(&e);
                    tracing::warn!(path = %path.display(), error = %error, "Ignoring unreadable stack record");
                    report.corrupt.push(CorruptRecord { path, error });
                }
            }
        }

        Ok(report)
    }

    /// Read one project's record. A corrupt record reads as absent.
    pub fn get(&self, project: &Path) -> Result<Option<StackRecord>, StoreError> {
        let path = self.record_path(project);
        if !path.exists() {
            return Ok(None);
        }

        match read_record(&path) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                let error = unreadable_reason(&e);
                tracing::warn!(path = %path.display(), error = %error, "Treating unreadable stack record as absent");
                Ok(None)
            }
        }
    }

    /// Write a record atomically.
    pub fn save(&self, record: &StackRecord) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io { path: self.dir.clone(), source })?;

        let content = serde_json::to_string_pretty(record)
            .map_err(|source| StoreError::Serialize { project: record.project_name.clone(), source })?;
        let path = self.record_path(&record.project_path);
        write_file_atomic(&path, &content)?;

        tracing::debug!(project = %record.project_name, status = %record.status, "Saved stack record");
        Ok(())
    }

    /// Delete a project's record. Returns whether one existed.
    pub fn delete(&self, project: &Path) -> Result<bool, StoreError> {
        let path = self.record_path(project);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

fn read_record(path: &Path) -> Result<StackRecord, StoreError> {
    let bytes = fs::read(path).map_err(|source| StoreError::Io { path: path.to_path_buf(), source })?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt { path: path.to_path_buf(), source })
}

/// Why a record file could not be used, without its path.
fn unreadable_reason(err: &StoreError) -> String {
    match err {
        StoreError::Corrupt { source, .. } => source.to_string(),
        StoreError::Io { source, .. } => source.to_string(),
        other => other.to_string(),
    }
}

/// Write a file atomically (write to temp, then rename).
fn write_file_atomic(path: &Path, content: &str) -> Result<(), StoreError> {
    let temp_path = path.with_extension("tmp");

    fs::write(&temp_path, content).map_err(|source| StoreError::Io { path: temp_path.clone(), source })?;

    // Rename to final location (atomic on most systems)
    fs::rename(&temp_path, path).map_err(|source| StoreError::Io { path: path.to_path_buf(), source })?;

    Ok(())
}
