//! Error types for devstack.
//!
//! Each pipeline stage has its own error enum; [`Error`] aggregates them for
//! callers that drive the whole pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::EngineError;

/// Result type for devstack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Any error surfaced by the devstack core.
#[derive(Debug, Error)]
pub enum Error {
    /// Project analysis failed.
    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    /// Blueprint resolution failed.
    #[error(transparent)]
    Blueprint(#[from] BlueprintError),

    /// Stack synthesis failed.
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    /// A lifecycle operation failed.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// The state store could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised while analyzing a project directory.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The path does not exist.
    #[error("project path does not exist: {0}")]
    NotFound(PathBuf),

    /// The path exists but is not a directory.
    #[error("project path is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The path could not be canonicalized or read.
    #[error("cannot read project at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while resolving a blueprint.
#[derive(Debug, Error)]
pub enum BlueprintError {
    /// A role depends on a role that is not part of the blueprint.
    #[error("project '{project}': role '{role}' has unresolved dependency '{dependency}'")]
    UnresolvedDependency { project: String, role: String, dependency: String },

    /// An override names a role that does not exist for this project kind.
    #[error("project '{project}': unknown role '{role}' in overrides (available: {available})")]
    UnknownRole { project: String, role: String, available: String },

    /// An override value cannot be applied.
    #[error("project '{project}': invalid override for role '{role}': {reason}")]
    InvalidOverride { project: String, role: String, reason: String },
}

/// Errors raised while synthesizing a stack plan.
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// The role dependency graph contains a cycle.
    #[error("project '{project}': cyclic dependency between roles {}", roles.join(", "))]
    CyclicDependency { project: String, roles: Vec<String> },

    /// No free host port exists at or above the requested one.
    #[error("project '{project}': no free host port for role '{role}' at or above {requested}")]
    PortExhausted { project: String, role: String, requested: u16 },
}

/// Errors raised by lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// An instance never became healthy.
    #[error("project '{project}': health check failed for {instance} after {attempts} attempts: {reason}")]
    HealthCheckFailed { project: String, instance: String, attempts: u32, reason: String },

    /// A container engine call failed.
    #[error("project '{project}': engine call failed for {target}: {source}")]
    Engine {
        project: String,
        target: String,
        #[source]
        source: EngineError,
    },

    /// Another project already owns the container names this plan would use.
    #[error("project '{project}': stack name already used by project at {other}")]
    NameConflict { project: String, other: PathBuf },

    /// There is no recorded stack for the project.
    #[error("project '{project}': no stack has been applied")]
    NoStack { project: String },

    /// The operation was interrupted and rolled back.
    #[error("project '{project}': interrupted, changes made by this run were rolled back")]
    Interrupted { project: String },
}

impl LifecycleError {
    /// Whether the engine itself could not be reached.
    pub fn is_engine_unavailable(&self) -> bool {
        matches!(self, Self::Engine { source: EngineError::Unavailable(_), .. })
    }
}

/// Errors raised by the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A record file exists but does not parse.
    #[error("corrupt stack record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A record could not be serialized.
    #[error("cannot serialize stack record for '{project}': {source}")]
    Serialize {
        project: String,
        #[source]
        source: serde_json::Error,
    },

    /// Filesystem failure.
    #[error("state store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No data directory could be determined.
    #[error("could not determine a state directory; set DEVSTACK_STATE_DIR")]
    NoStateDir,
}
