//! Health gating of started instances.

use tokio::net::TcpStream;

use super::CancelToken;
use crate::blueprint::Probe;
use crate::core::{retry_async_if, AttemptTimeout};
use crate::engine::{ContainerEngine, ContainerStatus, EngineError, HealthStatus};
use crate::error::LifecycleError;
use crate::synth::ServiceInstance;

/// Why a single probe did not pass.
#[derive(Debug)]
enum ProbeError {
    /// Not ready yet; worth another attempt
    NotReady(String),
    /// The probe took too long
    Timeout(AttemptTimeout),
    /// The engine failed; never retried
    Engine(EngineError),
    /// Interrupted by the user
    Cancelled,
}

impl From<AttemptTimeout> for ProbeError {
    fn from(e: AttemptTimeout) -> Self {
        Self::Timeout(e)
    }
}

/// Wait until `instance` passes its probe. Returns the number of attempts.
pub(crate) async fn wait_healthy<E>(
    engine: &E,
    project: &str,
    id: &str,
    instance: &ServiceInstance,
    cancel: &CancelToken,
) -> Result<u32, LifecycleError>
where
    E: ContainerEngine + ?Sized,
{
    let config = instance.healthcheck.retry_config();

    let outcome = retry_async_if(
        &config,
        |e| matches!(e, ProbeError::NotReady(_) | ProbeError::Timeout(_)),
        || cancel.is_cancelled(),
        || probe_once(engine, id, instance, cancel),
    )
    .await;

    let attempts = outcome.attempts;
    match outcome.into_result() {
        Ok(()) => {
            tracing::debug!(project, instance = %instance.name, attempts, "Instance healthy");
            Ok(attempts)
        }
        Err(ProbeError::Cancelled) => Err(LifecycleError::Interrupted { project: project.to_string() }),
        Err(_) if cancel.is_cancelled() => Err(LifecycleError::Interrupted { project: project.to_string() }),
        Err(ProbeError::Engine(source)) => Err(LifecycleError::Engine {
            project: project.to_string(),
            target: instance.name.clone(),
            source,
        }),
        Err(ProbeError::NotReady(reason)) => Err(LifecycleError::HealthCheckFailed {
            project: project.to_string(),
            instance: instance.name.clone(),
            attempts,
            reason,
        }),
        Err(ProbeError::Timeout(timeout)) => Err(LifecycleError::HealthCheckFailed {
            project: project.to_string(),
            instance: instance.name.clone(),
            attempts,
            reason: timeout.to_string(),
        }),
    }
}

async fn probe_once<E>(
    engine: &E,
    id: &str,
    instance: &ServiceInstance,
    cancel: &CancelToken,
) -> Result<(), ProbeError>
where
    E: ContainerEngine + ?Sized,
{
    if cancel.is_cancelled() {
        return Err(ProbeError::Cancelled);
    }

    let state = engine.inspect_container(id).await.map_err(ProbeError::Engine)?;
    if !state.is_running() {
        let reason = match state.status {
            ContainerStatus::Exited | ContainerStatus::Dead => format!("container is {}", state.status),
            other => format!("container is {other}, waiting for running"),
        };
        return Err(ProbeError::NotReady(reason));
    }

    match &instance.healthcheck.probe {
        Probe::Running => Ok(()),
        Probe::Command(_) => match state.health {
            HealthStatus::Healthy => Ok(()),
            HealthStatus::Unhealthy => Err(ProbeError::NotReady("health command reports unhealthy".to_string())),
            HealthStatus::Starting | HealthStatus::None => {
                Err(ProbeError::NotReady("health command has not passed yet".to_string()))
            }
        },
        Probe::Tcp => match TcpStream::connect(("127.0.0.1", instance.host_port)).await {
            Ok(_) => Ok(()),
            Err(e) => Err(ProbeError::NotReady(format!("port {} not accepting connections: {e}", instance.host_port))),
        },
    }
}
