//! Container engine abstraction.
//!
//! devstack drives containers through the [`ContainerEngine`] trait:
//! - [`DockerCli`]: shells out to the `docker` (or compatible) CLI
//! - [`MemoryEngine`]: in-process engine for tests and dry runs

mod docker;
mod memory;

pub use docker::DockerCli;
pub use memory::{EngineCall, MemoryEngine};

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blueprint::{HealthCheck, Probe};
use crate::core::PullPolicy;
use crate::synth::{InstanceMount, ServiceInstance};

/// Label carrying the owning project path.
pub const LABEL_PROJECT: &str = "devstack.project";
/// Label carrying the role name.
pub const LABEL_ROLE: &str = "devstack.role";
/// Label carrying the instance fingerprint.
pub const LABEL_FINGERPRINT: &str = "devstack.fingerprint";

/// Errors reported by an engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine cannot be reached at all.
    #[error("container engine unavailable: {0}")]
    Unavailable(String),

    /// The referenced resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The engine rejected the operation.
    #[error("{operation} failed: {message}")]
    Failed { operation: String, message: String },
}

impl EngineError {
    /// Shorthand for [`EngineError::Failed`].
    pub fn failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed { operation: operation.into(), message: message.into() }
    }

    /// Whether the resource was missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Outcome of an ensure-style create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ensured {
    /// Engine identifier
    pub id: String,

    /// Whether this call created the resource
    pub created: bool,
}

/// Container lifecycle state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl ContainerStatus {
    /// Parse the engine's status word.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" | "removing" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Engine-side health check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No health check configured
    None,
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    /// Parse the engine's health word; empty means no health check.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "starting" => Self::Starting,
            "healthy" => Self::Healthy,
            "unhealthy" => Self::Unhealthy,
            _ => Self::None,
        }
    }
}

/// Inspected container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    /// Lifecycle status
    pub status: ContainerStatus,

    /// Health check status
    pub health: HealthStatus,
}

impl ContainerState {
    /// Whether the container is running.
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

/// A container looked up by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Engine container id
    pub id: String,

    /// Container labels
    pub labels: BTreeMap<String, String>,
}

impl ContainerInfo {
    /// Whether devstack created this container for `project`.
    pub fn belongs_to(&self, project: &Path) -> bool {
        self.labels.get(LABEL_PROJECT).is_some_and(|p| Path::new(p) == project)
    }
}

/// Everything the engine needs to create a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,

    /// Image reference
    pub image: String,

    /// Network to attach to
    pub network: String,

    /// Published ports as (host, container)
    pub ports: Vec<(u16, u16)>,

    /// Environment
    pub env: BTreeMap<String, String>,

    /// Mounts
    pub mounts: Vec<InstanceMount>,

    /// Command override
    pub command: Option<Vec<String>>,

    /// Working directory
    pub workdir: Option<String>,

    /// Engine-run health check, for command probes
    pub healthcheck: Option<HealthCheck>,

    /// Container labels
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// Build the spec for a planned instance.
    pub fn for_instance(instance: &ServiceInstance, network: &str, project: &Path) -> Self {
        let labels = BTreeMap::from([
            (LABEL_PROJECT.to_string(), project.display().to_string()),
            (LABEL_ROLE.to_string(), instance.role.to_string()),
            (LABEL_FINGERPRINT.to_string(), instance.fingerprint()),
        ]);
        let healthcheck = match instance.healthcheck.probe {
            Probe::Command(_) => Some(instance.healthcheck.clone()),
            Probe::Running | Probe::Tcp => None,
        };

        Self {
            name: instance.name.clone(),
            image: instance.image.clone(),
            network: network.to_string(),
            ports: vec![(instance.host_port, instance.container_port)],
            env: instance.env.clone(),
            mounts: instance.volumes.clone(),
            command: instance.command.clone(),
            workdir: instance.workdir.clone(),
            healthcheck,
            labels,
        }
    }
}

/// Client for a container engine.
///
/// `create_network` and `create_volume` have ensure semantics: an existing
/// resource is returned with `created == false`.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine name, for logging.
    fn name(&self) -> &str;

    /// Ensure a network exists.
    async fn create_network(&self, name: &str) -> Result<Ensured, EngineError>;

    /// Remove a network.
    async fn remove_network(&self, name: &str) -> Result<(), EngineError>;

    /// Ensure a named volume exists.
    async fn create_volume(&self, name: &str) -> Result<Ensured, EngineError>;

    /// Remove a named volume.
    async fn remove_volume(&self, name: &str) -> Result<(), EngineError>;

    /// Make an image available locally according to `policy`.
    async fn pull_image(&self, image: &str, policy: PullPolicy) -> Result<(), EngineError>;

    /// Create a container; returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    /// Start a created or stopped container.
    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Inspect a container.
    async fn inspect_container(&self, id: &str) -> Result<ContainerState, EngineError>;

    /// Look up a container by name; `None` when there is none.
    async fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError>;

    /// Stop a container, waiting up to `timeout`.
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), EngineError>;

    /// Remove a container.
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;
}

#[async_trait]
impl<T: ContainerEngine + ?Sized> ContainerEngine for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn create_network(&self, name: &str) -> Result<Ensured, EngineError> {
        (**self).create_network(name).await
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        (**self).remove_network(name).await
    }

    async fn create_volume(&self, name: &str) -> Result<Ensured, EngineError> {
        (**self).create_volume(name).await
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        (**self).remove_volume(name).await
    }

    async fn pull_image(&self, image: &str, policy: PullPolicy) -> Result<(), EngineError> {
        (**self).pull_image(image, policy).await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        (**self).create_container(spec).await
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        (**self).start_container(id).await
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, EngineError> {
        (**self).inspect_container(id).await
    }

    async fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError> {
        (**self).find_container(name).await
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), EngineError> {
        (**self).stop_container(id, timeout).await
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        (**self).remove_container(id).await
    }
}
