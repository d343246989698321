//! Docker CLI engine.
//!
//! Drives `docker` (or a CLI-compatible binary such as `podman`) through
//! subprocesses.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{
    ContainerEngine, ContainerInfo, ContainerSpec, ContainerState, ContainerStatus, EngineError, Ensured, HealthStatus,
};
use crate::core::PullPolicy;

/// Engine backed by the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    /// Use the given CLI binary.
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// Run the CLI and return trimmed stdout.
    async fn run(&self, operation: &str, args: &[String]) -> Result<String, EngineError> {
        debug!(binary = %self.binary, ?args, "Running engine command");

        let output = Command::new(&self.binary).args(args).output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::Unavailable(format!("'{}' not found in PATH", self.binary))
            } else {
                EngineError::Unavailable(format!("failed to run '{}': {e}", self.binary))
            }
        })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify(operation, &stderr))
    }
}

/// Map CLI stderr onto an engine error.
fn classify(operation: &str, stderr: &str) -> EngineError {
    let lower = stderr.to_lowercase();
    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
    {
        EngineError::Unavailable(stderr.to_string())
    } else if lower.contains("no such") || lower.contains("not found") {
        EngineError::NotFound(stderr.to_string())
    } else {
        EngineError::failed(operation, stderr)
    }
}

/// Parse `<id>|<labels json>` from `docker inspect`.
fn parse_container_info(out: &str) -> Result<ContainerInfo, EngineError> {
    let (id, labels) = out.split_once('|').unwrap_or((out, "null"));
    let labels: Option<BTreeMap<String, String>> = serde_json::from_str(labels.trim())
        .map_err(|e| EngineError::failed("inspect", format!("unexpected label output: {e}")))?;
    Ok(ContainerInfo { id: id.trim().to_string(), labels: labels.unwrap_or_default() })
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

/// Arguments for `docker create`.
fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut out = args(["create", "--name", &spec.name, "--network", &spec.network]);

    for (host, container) in &spec.ports {
        out.push("-p".to_string());
        out.push(format!("{host}:{container}"));
    }
    for (key, value) in &spec.env {
        out.push("-e".to_string());
        out.push(format!("{key}={value}"));
    }
    for mount in &spec.mounts {
        out.push("-v".to_string());
        out.push(mount.to_bind_string());
    }
    if let Some(workdir) = &spec.workdir {
        out.push("-w".to_string());
        out.push(workdir.clone());
    }
    for (key, value) in &spec.labels {
        out.push("--label".to_string());
        out.push(format!("{key}={value}"));
    }
    if let Some(check) = &spec.healthcheck {
        if let crate::blueprint::Probe::Command(test) = &check.probe {
            out.push("--health-cmd".to_string());
            out.push(test.join(" "));
            out.push("--health-interval".to_string());
            out.push(format!("{}ms", check.interval_ms));
            out.push("--health-timeout".to_string());
            out.push(format!("{}ms", check.timeout_ms));
            out.push("--health-retries".to_string());
            out.push(check.retries.to_string());
        }
    }

    out.push(spec.image.clone());
    if let Some(command) = &spec.command {
        out.extend(command.iter().cloned());
    }
    out
}

#[async_trait]
impl ContainerEngine for DockerCli {
    fn name(&self) -> &str {
        &self.binary
    }

    #[instrument(skip(self))]
    async fn create_network(&self, name: &str) -> Result<Ensured, EngineError> {
        match self.run("network inspect", &args(["network", "inspect", "--format", "{{.Id}}", name])).await {
            Ok(id) => return Ok(Ensured { id, created: false }),
            Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let id = self
            .run("network create", &args(["network", "create", "--label", "devstack.managed=true", name]))
            .await?;
        Ok(Ensured { id, created: true })
    }

    #[instrument(skip(self))]
    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        self.run("network rm", &args(["network", "rm", name])).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn create_volume(&self, name: &str) -> Result<Ensured, EngineError> {
        match self.run("volume inspect", &args(["volume", "inspect", "--format", "{{.Name}}", name])).await {
            Ok(id) => return Ok(Ensured { id, created: false }),
            Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let id = self
            .run("volume create", &args(["volume", "create", "--label", "devstack.managed=true", name]))
            .await?;
        Ok(Ensured { id, created: true })
    }

    #[instrument(skip(self))]
    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.run("volume rm", &args(["volume", "rm", name])).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn pull_image(&self, image: &str, policy: PullPolicy) -> Result<(), EngineError> {
        if policy == PullPolicy::Missing {
            match self.run("image inspect", &args(["image", "inspect", "--format", "{{.Id}}", image])).await {
                Ok(_) => return Ok(()),
                Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.run("pull", &args(["pull", "--quiet", image])).await.map(|_| ())
    }

    #[instrument(skip(self, spec), fields(container = %spec.name))]
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.run("create", &create_args(spec)).await
    }

    #[instrument(skip(self))]
    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.run("start", &args(["start", id])).await.map(|_| ())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, EngineError> {
        let format = "{{.State.Status}}|{{if .State.Health}}{{.State.Health.Status}}{{end}}";
        let out = self.run("inspect", &args(["inspect", "--type", "container", "--format", format, id])).await?;
        let (status, health) = out.split_once('|').unwrap_or((out.as_str(), ""));
        Ok(ContainerState { status: ContainerStatus::parse(status), health: HealthStatus::parse(health) })
    }

    async fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError> {
        let format = "{{.Id}}|{{json .Config.Labels}}";
        match self.run("inspect", &args(["inspect", "--type", "container", "--format", format, name])).await {
            Ok(out) => parse_container_info(&out).map(Some),
            Err(EngineError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), EngineError> {
        let secs = timeout.as_secs().max(1).to_string();
        self.run("stop", &args(["stop", "--time", &secs, id])).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        self.run("rm", &args(["rm", "--force", "--volumes", id])).await.map(|_| ())
    }
}
