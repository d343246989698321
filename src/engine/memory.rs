//! In-memory engine.
//!
//! Keeps networks, volumes and containers in a map. Used by the test suite and
//! by `--engine memory` to walk through a lifecycle without touching a real
//! engine. Supports delayed health, failure injection and interruption hooks.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ContainerEngine, ContainerInfo, ContainerSpec, ContainerState, ContainerStatus, EngineError, Ensured, HealthStatus,
};
use crate::core::PullPolicy;
use crate::lifecycle::CancelToken;

/// A recorded engine call. Containers are identified by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EngineCall {
    CreateNetwork(String),
    RemoveNetwork(String),
    CreateVolume(String),
    RemoveVolume(String),
    Pull(String),
    Create(String),
    Start(String),
    Inspect(String),
    Find(String),
    Stop(String),
    Remove(String),
}

#[derive(Debug, Clone)]
struct MemoryContainer {
    spec: ContainerSpec,
    status: ContainerStatus,
    probes: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    networks: BTreeMap<String, String>,
    volumes: BTreeSet<String>,
    images: BTreeSet<String>,
    containers: BTreeMap<String, MemoryContainer>,
    next_id: u64,
    calls: Vec<EngineCall>,
    failures: BTreeSet<EngineCall>,
    lost_replies: BTreeSet<String>,
    cancels: Vec<(EngineCall, CancelToken)>,
    healthy_after: BTreeMap<String, u32>,
    never_healthy: BTreeSet<String>,
    unavailable: bool,
}

/// In-process container engine.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    state: Mutex<MemoryState>,
}

impl MemoryEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `starting` for a container's first `probes` inspections.
    pub fn healthy_after(&self, container: &str, probes: u32) {
        self.state.lock().healthy_after.insert(container.to_string(), probes);
    }

    /// Never report a container healthy.
    pub fn never_healthy(&self, container: &str) {
        self.state.lock().never_healthy.insert(container.to_string());
    }

    /// Fail whenever `call` is made.
    pub fn fail_on(&self, call: EngineCall) {
        self.state.lock().failures.insert(call);
    }

    /// Create `container` but report the call as failed, as when the CLI
    /// client dies after the daemon has acted.
    pub fn lose_create_reply(&self, container: &str) {
        self.state.lock().lost_replies.insert(container.to_string());
    }

    /// Cancel `token` when `call` is made. The call itself succeeds.
    pub fn cancel_on(&self, call: EngineCall, token: CancelToken) {
        self.state.lock().cancels.push((call, token));
    }

    /// Make every call fail as unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Calls made so far.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Names of existing containers.
    pub fn containers(&self) -> Vec<String> {
        self.state.lock().containers.values().map(|c| c.spec.name.clone()).collect()
    }

    /// Existing networks.
    pub fn networks(&self) -> Vec<String> {
        self.state.lock().networks.keys().cloned().collect()
    }

    /// Existing volumes.
    pub fn volumes(&self) -> Vec<String> {
        self.state.lock().volumes.iter().cloned().collect()
    }

    /// Status of a container by name.
    pub fn status_of(&self, container: &str) -> Option<ContainerStatus> {
        let state = self.state.lock();
        state.containers.values().find(|c| c.spec.name == container).map(|c| c.status)
    }

    /// Spec a container was created with.
    pub fn spec_of(&self, container: &str) -> Option<ContainerSpec> {
        let state = self.state.lock();
        state.containers.values().find(|c| c.spec.name == container).map(|c| c.spec.clone())
    }

    /// Simulate a container stopping outside devstack.
    pub fn kill(&self, container: &str) {
        let mut state = self.state.lock();
        if let Some(c) = state.containers.values_mut().find(|c| c.spec.name == container) {
            c.status = ContainerStatus::Exited;
        }
    }

    /// Simulate a container being deleted outside devstack.
    pub fn forget(&self, container: &str) {
        self.state.lock().containers.retain(|_, c| c.spec.name != container);
    }

    /// Record a call and apply injected behavior.
    fn enter(state: &mut MemoryState, call: EngineCall) -> Result<(), EngineError> {
        state.calls.push(call.clone());
        if state.unavailable {
            return Err(EngineError::Unavailable("memory engine switched off".to_string()));
        }
        for (trigger, token) in &state.cancels {
            if *trigger == call {
                token.cancel();
            }
        }
        if state.failures.contains(&call) {
            return Err(EngineError::failed(format!("{call:?}"), "injected failure"));
        }
        Ok(())
    }

    fn container_name(state: &MemoryState, id: &str) -> String {
        state.containers.get(id).map(|c| c.spec.name.clone()).unwrap_or_else(|| id.to_string())
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_network(&self, name: &str) -> Result<Ensured, EngineError> {
        let mut state = self.state.lock();
        Self::enter(&mut state, EngineCall::CreateNetwork(name.to_string()))?;

        if let Some(id) = state.networks.get(name) {
            return Ok(Ensured { id: id.clone(), created: false });
        }
        let id = format!("net-{name}");
        state.networks.insert(name.to_string(), id.clone());
        Ok(Ensured { id, created: true })
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        Self::enter(&mut state, EngineCall::RemoveNetwork(name.to_string()))?;

        if state.containers.values().any(|c| c.spec.network == name) {
            return Err(EngineError::failed("network rm", format!("network {name} has active endpoints")));
        }
        state.networks.remove(name).map(|_| ()).ok_or_else(|| EngineError::NotFound(format!("network {name}")))
    }

    async fn create_volume(&self, name: &str) -> Result<Ensured, EngineError> {
        let mut state = self.state.lock();
        Self::enter(&mut state, EngineCall::CreateVolume(name.to_string()))?;

        let created = state.volumes.insert(name.to_string());
        Ok(Ensured { id: name.to_string(), created })
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        Self::enter(&mut state, EngineCall::RemoveVolume(name.to_string()))?;

        if state.volumes.remove(name) {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("volume {name}")))
        }
    }

    async fn pull_image(&self, image: &str, policy: PullPolicy) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if policy == PullPolicy::Missing && state.images.contains(image) {
            return Ok(());
        }
        Self::enter(&mut state, EngineCall::Pull(image.to_string()))?;
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let mut state = self.state.lock();
        Self::enter(&mut state, EngineCall::Create(spec.name.clone()))?;

        if state.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(EngineError::failed(
                "create",
                format!("container name {} is already in use", spec.name),
            ));
        }
        if !state.networks.contains_key(&spec.network) {
            return Err(EngineError::NotFound(format!("network {}", spec.network)));
        }

        state.next_id += 1;
        let id = format!("mem-{:04}", state.next_id);
        state.containers.insert(
            id.clone(),
            MemoryContainer { spec: spec.clone(), status: ContainerStatus::Created, probes: 0 },
        );
        if state.lost_replies.contains(&spec.name) {
            return Err(EngineError::failed("create", "signal: interrupt"));
        }
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let name = Self::container_name(&state, id);
        Self::enter(&mut state, EngineCall::Start(name))?;

        let container =
            state.containers.get_mut(id).ok_or_else(|| EngineError::NotFound(format!("container {id}")))?;
        container.status = ContainerStatus::Running;
        container.probes = 0;
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, EngineError> {
        let mut state = self.state.lock();
        let name = Self::container_name(&state, id);
        Self::enter(&mut state, EngineCall::Inspect(name.clone()))?;

        let threshold = state.healthy_after.get(&name).copied().unwrap_or(0);
        let never = state.never_healthy.contains(&name);
        let container =
            state.containers.get_mut(id).ok_or_else(|| EngineError::NotFound(format!("container {id}")))?;

        let health = match (&container.spec.healthcheck, container.status) {
            (None, _) => HealthStatus::None,
            (Some(_), ContainerStatus::Running) => {
                container.probes += 1;
                if never {
                    HealthStatus::Unhealthy
                } else if container.probes > threshold {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Starting
                }
            }
            (Some(_), _) => HealthStatus::Starting,
        };

        Ok(ContainerState { status: container.status, health })
    }

    async fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError> {
        let mut state = self.state.lock();
        Self::enter(&mut state, EngineCall::Find(name.to_string()))?;

        Ok(state
            .containers
            .iter()
            .find(|(_, c)| c.spec.name == name)
            .map(|(id, c)| ContainerInfo { id: id.clone(), labels: c.spec.labels.clone() }))
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let name = Self::container_name(&state, id);
        Self::enter(&mut state, EngineCall::Stop(name))?;

        let container =
            state.containers.get_mut(id).ok_or_else(|| EngineError::NotFound(format!("container {id}")))?;
        container.status = ContainerStatus::Exited;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let name = Self::container_name(&state, id);
        Self::enter(&mut state, EngineCall::Remove(name))?;

        state.containers.remove(id).map(|_| ()).ok_or_else(|| EngineError::NotFound(format!("container {id}")))
    }
}
