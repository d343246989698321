//! Lifecycle orchestration.
//!
//! The [`Orchestrator`] applies stack plans to a container engine and keeps
//! the state store in step:
//! - `apply`: create or reconcile, wave by wave, with health gating and
//!   rollback of everything this run created on failure
//! - `status`: re-inspect containers and refresh the recorded status
//! - `stop` / `destroy`: reverse-order teardown

mod health;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::blueprint::{RoleName, StackBlueprint};
use crate::core::PullPolicy;
use crate::engine::{ContainerEngine, ContainerSpec, ContainerState, EngineError};
use crate::env::ProjectEnv;
use crate::error::{LifecycleError, Result};
use crate::project::Project;
use crate::store::{ContainerRecord, StackRecord, StackStatus, StateStore};
use crate::synth::{synthesize, PortAllocation, PortProbe, ServiceInstance, StackPlan, SynthesisContext};

/// Shared interruption flag, set from a signal handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create an unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Orchestrator behavior knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Start instances of one wave concurrently
    pub parallel: bool,

    /// Image pull policy
    pub pull: PullPolicy,

    /// Grace period when stopping containers
    pub stop_timeout: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self { parallel: true, pull: PullPolicy::Missing, stop_timeout: Duration::from_secs(10) }
    }
}

/// Observed state of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    /// Container name
    pub name: String,

    /// Role
    pub role: RoleName,

    /// Image
    pub image: String,

    /// Published host port
    pub host_port: u16,

    /// Engine state; `None` when the container is gone
    pub state: Option<ContainerState>,
}

/// Result of a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Stack name
    pub project: String,

    /// Project directory
    pub path: PathBuf,

    /// Aggregate status
    pub status: StackStatus,

    /// Per-instance state in plan order
    pub instances: Vec<InstanceStatus>,
}

/// What apply does with one planned instance.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    /// Running and current
    Keep { id: String },
    /// Current but not running
    Start { id: String },
    /// No container yet
    Create,
    /// Container content is stale
    Recreate { old: String },
}

/// Outcome of converging one instance.
struct Step {
    name: String,
    role: RoleName,
    /// Container created by this step, kept for rollback
    created: Option<String>,
    result: std::result::Result<StepChange, LifecycleError>,
}

enum StepChange {
    Unchanged,
    /// Started or restarted an existing container
    Restarted,
    /// New container
    Created(ContainerRecord),
}

/// Resources created by the current apply, in creation order.
#[derive(Debug, Default)]
struct Journal {
    containers: Vec<(String, String)>,
    network: Option<String>,
    volumes: Vec<String>,
}

/// Drives the container engine and the state store.
pub struct Orchestrator<E: ContainerEngine> {
    engine: E,
    store: StateStore,
    allocation: PortAllocation,
    cancel: CancelToken,
    options: OrchestratorOptions,
}

impl<E: ContainerEngine> Orchestrator<E> {
    /// Create an orchestrator; the port allocation is rebuilt from the store.
    pub fn new(engine: E, store: StateStore) -> Result<Self> {
        let report = store.load()?;
        let allocation = PortAllocation::from_plans(report.records.iter().map(|r| &r.plan));

        Ok(Self {
            engine,
            store,
            allocation,
            cancel: CancelToken::new(),
            options: OrchestratorOptions::default(),
        })
    }

    /// Use a shared cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Set behavior options.
    #[must_use]
    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    /// Skip host ports that something else listens on.
    #[must_use]
    pub fn with_port_probe(mut self, probe: impl PortProbe + 'static) -> Self {
        self.allocation = std::mem::take(&mut self.allocation).with_probe(probe);
        self
    }

    /// The engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The state store.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// The port allocation of this invocation.
    pub fn allocation(&self) -> &PortAllocation {
        &self.allocation
    }

    /// Synthesize a plan against this invocation's port allocation, reclaiming
    /// the ports of the project's last applied plan.
    pub fn plan(&mut self, blueprint: &StackBlueprint, project_env: ProjectEnv) -> Result<StackPlan> {
        let previous = self.store.get(&blueprint.project.path)?.map(|r| r.plan);
        let ctx = SynthesisContext::new().with_env(project_env).with_previous(previous);
        let plan = synthesize(blueprint, &mut self.allocation, &ctx)?;
        Ok(plan)
    }

    /// Apply a plan: create the stack or reconcile it with the recorded one.
    pub async fn apply(&mut self, plan: &StackPlan) -> Result<StackRecord> {
        let project = &plan.project;
        let report = self.store.load()?;

        if let Some(other) = report.name_owner(&project.name, &project.path) {
            return Err(LifecycleError::NameConflict {
                project: project.name.clone(),
                other: other.project_path.clone(),
            }
            .into());
        }

        let existing = report.records.into_iter().find(|r| r.project_path == project.path);
        let fresh = existing.is_none();
        let mut record = existing.unwrap_or_else(|| StackRecord::new(plan.clone(), StackStatus::Creating));

        let actions = self.assess(plan, &record).await?;
        let removals = removals(plan, &record);

        let converged = actions.values().all(|a| matches!(a, Action::Keep { .. })) && removals.is_empty();
        if !fresh && converged && record.plan == *plan && record.status == StackStatus::Running {
            info!(project = %project.name, "Stack is up to date");
            return Ok(record);
        }

        record.set_status(if fresh { StackStatus::Creating } else { StackStatus::Reconciling });
        self.store.save(&record)?;
        info!(project = %project.name, fresh, "Applying stack");

        let mut journal = Journal::default();
        let outcome = self.execute(plan, &mut record, &actions, &removals, &mut journal).await;

        match outcome {
            Ok(()) => {
                record.plan = plan.clone();
                record.set_status(StackStatus::Running);
                self.store.save(&record)?;
                self.allocation.release_project(&project.path);
                self.allocation.register_plan(plan);
                info!(project = %project.name, instances = plan.instances.len(), "Stack running");
                Ok(record)
            }
            Err(err) => {
                warn!(project = %project.name, error = %err, "Apply failed, rolling back");
                self.rollback(&project.name, &journal).await;

                if fresh {
                    self.store.delete(&project.path)?;
                    self.allocation.release_project(&project.path);
                } else {
                    for (name, _) in &journal.containers {
                        record.containers.remove(name);
                    }
                    record.set_status(StackStatus::Failed);
                    self.store.save(&record)?;
                }
                Err(err.into())
            }
        }
    }

    /// Inspect recorded containers and decide what each planned instance needs.
    async fn assess(&self, plan: &StackPlan, record: &StackRecord) -> Result<BTreeMap<String, Action>> {
        let mut actions = BTreeMap::new();

        for instance in &plan.instances {
            let action = match record.containers.get(&instance.name) {
                None => Action::Create,
                Some(existing) => match self.engine.inspect_container(&existing.id).await {
                    Err(EngineError::NotFound(_)) => Action::Create,
                    Err(source) => {
                        return Err(self.engine_error(&plan.project.name, &instance.name, source).into())
                    }
                    Ok(_) if existing.fingerprint != instance.fingerprint() => {
                        Action::Recreate { old: existing.id.clone() }
                    }
                    Ok(state) if state.is_running() => Action::Keep { id: existing.id.clone() },
                    Ok(_) => Action::Start { id: existing.id.clone() },
                },
            };
            debug!(project = %plan.project.name, instance = %instance.name, ?action, "Assessed instance");
            actions.insert(instance.name.clone(), action);
        }

        Ok(actions)
    }

    async fn execute(
        &self,
        plan: &StackPlan,
        record: &mut StackRecord,
        actions: &BTreeMap<String, Action>,
        removals: &[String],
        journal: &mut Journal,
    ) -> std::result::Result<(), LifecycleError> {
        let project = &plan.project.name;

        for name in removals {
            self.check_cancel(project)?;
            if let Some(existing) = record.containers.get(name) {
                info!(project = %project, instance = %name, "Removing instance no longer planned");
                self.teardown_container(project, name, &existing.id).await?;
            }
            record.containers.remove(name);
        }

        self.ensure_infrastructure(plan, record, journal).await?;

        let mut changed: BTreeSet<RoleName> = BTreeSet::new();
        for wave in plan.waves() {
            self.check_cancel(project)?;

            let futures: Vec<_> = wave
                .iter()
                .map(|instance| {
                    let dependency_changed = instance.depends_on.iter().any(|d| changed.contains(d));
                    let action = actions.get(&instance.name).cloned().unwrap_or(Action::Create);
                    self.converge(plan, instance, action, dependency_changed)
                })
                .collect();

            let steps = if self.options.parallel {
                join_all(futures).await
            } else {
                let mut steps = Vec::with_capacity(futures.len());
                for future in futures {
                    let step = future.await;
                    let failed = step.result.is_err();
                    steps.push(step);
                    if failed {
                        break;
                    }
                }
                steps
            };

            let mut first_error = None;
            for step in steps {
                if let Some(id) = step.created {
                    journal.containers.push((step.name.clone(), id));
                }
                match step.result {
                    Ok(StepChange::Unchanged) => {}
                    Ok(StepChange::Restarted) => {
                        changed.insert(step.role);
                    }
                    Ok(StepChange::Created(container)) => {
                        record.containers.insert(step.name, container);
                        changed.insert(step.role);
                    }
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }
        }

        Ok(())
    }

    async fn ensure_infrastructure(
        &self,
        plan: &StackPlan,
        record: &mut StackRecord,
        journal: &mut Journal,
    ) -> std::result::Result<(), LifecycleError> {
        let project = &plan.project.name;

        let network = self
            .engine
            .create_network(&plan.network)
            .await
            .map_err(|e| self.engine_error(project, &plan.network, e))?;
        if network.created {
            debug!(project = %project, network = %plan.network, "Created network");
            journal.network = Some(plan.network.clone());
        }
        record.network_id = Some(network.id);

        for volume in &plan.volumes {
            let ensured =
                self.engine.create_volume(volume).await.map_err(|e| self.engine_error(project, volume, e))?;
            if ensured.created {
                debug!(project = %project, volume = %volume, "Created volume");
                journal.volumes.push(volume.clone());
            }
        }

        Ok(())
    }

    /// Bring one instance to its planned state.
    async fn converge(
        &self,
        plan: &StackPlan,
        instance: &ServiceInstance,
        action: Action,
        dependency_changed: bool,
    ) -> Step {
        let project = &plan.project.name;
        let mut step = Step {
            name: instance.name.clone(),
            role: instance.role,
            created: None,
            result: Ok(StepChange::Unchanged),
        };

        step.result = match action {
            Action::Keep { .. } if !dependency_changed => Ok(StepChange::Unchanged),
            Action::Keep { id } => {
                info!(project = %project, instance = %instance.name, "Restarting after dependency change");
                self.restart(project, instance, &id).await.map(|()| StepChange::Restarted)
            }
            Action::Start { id } => {
                info!(project = %project, instance = %instance.name, "Starting instance");
                self.start_gated(project, instance, &id).await.map(|()| StepChange::Restarted)
            }
            Action::Create => self.launch(plan, instance, &mut step.created).await,
            Action::Recreate { old } => {
                info!(project = %project, instance = %instance.name, "Recreating changed instance");
                match self.teardown_container(project, &instance.name, &old).await {
                    Ok(()) => self.launch(plan, instance, &mut step.created).await,
                    Err(e) => Err(e),
                }
            }
        };

        step
    }

    /// Pull, create, start and health-gate a new container.
    async fn launch(
        &self,
        plan: &StackPlan,
        instance: &ServiceInstance,
        created: &mut Option<String>,
    ) -> std::result::Result<StepChange, LifecycleError> {
        let project = &plan.project.name;
        self.check_cancel(project)?;

        self.engine
            .pull_image(&instance.image, self.options.pull)
            .await
            .map_err(|e| self.engine_error(project, &instance.image, e))?;
        self.check_cancel(project)?;

        let spec = ContainerSpec::for_instance(instance, &plan.network, &plan.project.path);
        let id = self.create_container(plan, &spec).await?;
        *created = Some(id.clone());
        info!(project = %project, instance = %instance.name, port = instance.host_port, "Created container");

        self.start_gated(project, instance, &id).await?;
        Ok(StepChange::Created(ContainerRecord { id, fingerprint: instance.fingerprint() }))
    }

    /// Create a container. When the engine reports a failure, a container of
    /// this project left under the same name (by this call or an earlier,
    /// interrupted run) is removed and the create is tried once more.
    async fn create_container(
        &self,
        plan: &StackPlan,
        spec: &ContainerSpec,
    ) -> std::result::Result<String, LifecycleError> {
        let project = &plan.project.name;
        let mut retried = false;

        loop {
            let err = match self.engine.create_container(spec).await {
                Ok(id) => return Ok(id),
                Err(e @ EngineError::Unavailable(_)) => return Err(self.engine_error(project, &spec.name, e)),
                Err(e) => e,
            };

            let removed = self.remove_leftover(plan, &spec.name).await?;
            if !removed || retried {
                return Err(self.engine_error(project, &spec.name, err));
            }
            self.check_cancel(project)?;
            retried = true;
        }
    }

    /// Remove an untracked container of this project named `name`. Returns
    /// whether one was removed; containers of other owners are left alone.
    async fn remove_leftover(&self, plan: &StackPlan, name: &str) -> std::result::Result<bool, LifecycleError> {
        let project = &plan.project.name;
        let found = self.engine.find_container(name).await.map_err(|e| self.engine_error(project, name, e))?;

        match found {
            Some(info) if info.belongs_to(&plan.project.path) => {
                warn!(project = %project, instance = %name, "Removing untracked container left by an earlier create");
                self.teardown_container(project, name, &info.id).await?;
                Ok(true)
            }
            Some(_) => {
                debug!(project = %project, instance = %name, "Container name held by another owner");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn start_gated(
        &self,
        project: &str,
        instance: &ServiceInstance,
        id: &str,
    ) -> std::result::Result<(), LifecycleError> {
        self.check_cancel(project)?;
        self.engine.start_container(id).await.map_err(|e| self.engine_error(project, &instance.name, e))?;
        health::wait_healthy(&self.engine, project, id, instance, &self.cancel).await?;
        Ok(())
    }

    async fn restart(
        &self,
        project: &str,
        instance: &ServiceInstance,
        id: &str,
    ) -> std::result::Result<(), LifecycleError> {
        self.check_cancel(project)?;
        self.engine
            .stop_container(id, self.options.stop_timeout)
            .await
            .map_err(|e| self.engine_error(project, &instance.name, e))?;
        self.start_gated(project, instance, id).await
    }

    /// Stop and remove a container, tolerating one that is already gone.
    async fn teardown_container(
        &self,
        project: &str,
        name: &str,
        id: &str,
    ) -> std::result::Result<(), LifecycleError> {
        match self.engine.stop_container(id, self.options.stop_timeout).await {
            Ok(()) | Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(self.engine_error(project, name, e)),
        }
        match self.engine.remove_container(id).await {
            Ok(()) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(self.engine_error(project, name, e)),
        }
    }

    /// Undo everything the journal recorded, newest first. Failures are
    /// logged and skipped.
    async fn rollback(&self, project: &str, journal: &Journal) {
        for (name, id) in journal.containers.iter().rev() {
            if let Err(e) = self.teardown_container(project, name, id).await {
                warn!(project = %project, instance = %name, error = %e, "Rollback could not remove container");
            }
        }
        if let Some(network) = &journal.network {
            if let Err(e) = self.engine.remove_network(network).await {
                warn!(project = %project, network = %network, error = %e, "Rollback could not remove network");
            }
        }
        for volume in journal.volumes.iter().rev() {
            if let Err(e) = self.engine.remove_volume(volume).await {
                warn!(project = %project, volume = %volume, error = %e, "Rollback could not remove volume");
            }
        }
    }

    /// Re-inspect every recorded container and refresh the recorded status.
    pub async fn status(&self, project: &Project) -> Result<StatusReport> {
        let mut record = self.record(project)?;
        let mut instances = Vec::with_capacity(record.plan.instances.len());

        for instance in &record.plan.instances {
            let state = match record.container_id(&instance.name) {
                None => None,
                Some(id) => match self.engine.inspect_container(id).await {
                    Ok(state) => Some(state),
                    Err(EngineError::NotFound(_)) => None,
                    Err(e) => return Err(self.engine_error(&project.name, &instance.name, e).into()),
                },
            };
            instances.push(InstanceStatus {
                name: instance.name.clone(),
                role: instance.role,
                image: instance.image.clone(),
                host_port: instance.host_port,
                state,
            });
        }

        let running = instances.iter().filter(|i| i.state.is_some_and(|s| s.is_running())).count();
        let status = if running == instances.len() && running > 0 {
            StackStatus::Running
        } else if running == 0 {
            StackStatus::Stopped
        } else {
            StackStatus::Unknown
        };

        if record.status != status {
            debug!(project = %project.name, from = %record.status, to = %status, "Refreshing stack status");
            record.set_status(status);
            self.store.save(&record)?;
        }

        Ok(StatusReport { project: record.project_name, path: record.project_path, status, instances })
    }

    /// Stop every container in reverse dependency order.
    pub async fn stop(&self, project: &Project) -> Result<StackRecord> {
        let mut record = self.record(project)?;
        record.set_status(StackStatus::Stopping);
        self.store.save(&record)?;

        let targets: Vec<(String, String)> = record
            .plan
            .instances
            .iter()
            .rev()
            .filter_map(|i| record.container_id(&i.name).map(|id| (i.name.clone(), id.to_string())))
            .collect();

        for (name, id) in targets {
            match self.engine.stop_container(&id, self.options.stop_timeout).await {
                Ok(()) => info!(project = %project.name, instance = %name, "Stopped container"),
                Err(EngineError::NotFound(_)) => {
                    debug!(project = %project.name, instance = %name, "Container already gone");
                }
                Err(e) => {
                    let err = self.engine_error(&project.name, &name, e);
                    record.set_status(StackStatus::Unknown);
                    self.store.save(&record)?;
                    return Err(err.into());
                }
            }
        }

        record.set_status(StackStatus::Stopped);
        self.store.save(&record)?;
        Ok(record)
    }

    /// Tear the stack down and forget it. Returns whether a stack existed.
    pub async fn destroy(&mut self, project: &Project, remove_volumes: bool) -> Result<bool> {
        let Some(mut record) = self.store.get(&project.path)? else {
            debug!(project = %project.name, "No stack to destroy");
            return Ok(false);
        };
        record.set_status(StackStatus::Destroying);
        self.store.save(&record)?;

        if let Err(err) = self.teardown(&record, remove_volumes).await {
            record.set_status(StackStatus::Failed);
            self.store.save(&record)?;
            return Err(err.into());
        }

        self.store.delete(&project.path)?;
        self.allocation.release_project(&project.path);
        info!(project = %project.name, remove_volumes, "Stack destroyed");
        Ok(true)
    }

    async fn teardown(&self, record: &StackRecord, remove_volumes: bool) -> std::result::Result<(), LifecycleError> {
        let project = &record.project_name;

        for instance in record.plan.instances.iter().rev() {
            if let Some(id) = record.container_id(&instance.name) {
                self.teardown_container(project, &instance.name, id).await?;
                debug!(project = %project, instance = %instance.name, "Removed container");
            }
        }

        match self.engine.remove_network(&record.plan.network).await {
            Ok(()) | Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(self.engine_error(project, &record.plan.network, e)),
        }

        if remove_volumes {
            for volume in &record.plan.volumes {
                match self.engine.remove_volume(volume).await {
                    Ok(()) | Err(EngineError::NotFound(_)) => {}
                    Err(e) => return Err(self.engine_error(project, volume, e)),
                }
            }
        }

        Ok(())
    }

    fn record(&self, project: &Project) -> Result<StackRecord> {
        self.store
            .get(&project.path)?
            .ok_or_else(|| LifecycleError::NoStack { project: project.name.clone() }.into())
    }

    fn check_cancel(&self, project: &str) -> std::result::Result<(), LifecycleError> {
        if self.cancel.is_cancelled() {
            return Err(LifecycleError::Interrupted { project: project.to_string() });
        }
        Ok(())
    }

    fn engine_error(&self, project: &str, target: &str, source: EngineError) -> LifecycleError {
        LifecycleError::Engine { project: project.to_string(), target: target.to_string(), source }
    }
}

/// Recorded instances that the plan no longer contains, in reverse order.
fn removals(plan: &StackPlan, record: &StackRecord) -> Vec<String> {
    record
        .plan
        .instances
        .iter()
        .rev()
        .map(|i| i.name.clone())
        .filter(|name| plan.instance(name).is_none() && record.containers.contains_key(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::blueprint::{resolve, Overrides};
    use crate::engine::{ContainerStatus, EngineCall, MemoryEngine};
    use crate::error::Error;
    use crate::project::{Feature, ProjectKind};

    struct Harness {
        _dir: TempDir,
        engine: Arc<MemoryEngine>,
        orchestrator: Orchestrator<Arc<MemoryEngine>>,
    }

    fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let orchestrator = Orchestrator::new(Arc::clone(&engine), StateStore::new(dir.path())).unwrap();
        Harness { _dir: dir, engine, orchestrator }
    }

    fn project(path: &str, features: &[Feature]) -> Project {
        let path = PathBuf::from(path);
        Project {
            name: crate::project::project_name(&path),
            path,
            kind: ProjectKind::Php,
            features: features.iter().copied().collect::<BTreeSet<_>>(),
        }
    }

    fn plan_with(h: &mut Harness, project: &Project, overrides: &Overrides) -> StackPlan {
        let blueprint = resolve(project, overrides).unwrap();
        let mut plan = h.orchestrator.plan(&blueprint, ProjectEnv::default()).unwrap();
        for instance in &mut plan.instances {
            instance.healthcheck = instance.healthcheck.clone().interval(Duration::from_millis(1)).retries(3);
        }
        plan
    }

    fn plan(h: &mut Harness, project: &Project) -> StackPlan {
        plan_with(h, project, &Overrides::default())
    }

    fn position(calls: &[EngineCall], call: &EngineCall) -> usize {
        calls.iter().position(|c| c == call).unwrap_or_else(|| panic!("missing call {call:?}"))
    }

    fn call(kind: fn(String) -> EngineCall, name: &str) -> EngineCall {
        kind(name.to_string())
    }

    fn mutating(calls: &[EngineCall]) -> Vec<EngineCall> {
        calls.iter().filter(|c| !matches!(c, EngineCall::Inspect(_) | EngineCall::Find(_))).cloned().collect()
    }

    #[tokio::test]
    async fn test_apply_creates_stack_in_dependency_order() {
        let mut h = harness();
        let shop = project("/work/shop", &[Feature::HasDatabase]);
        let plan = plan(&mut h, &shop);

        let record = h.orchestrator.apply(&plan).await.unwrap();
        assert_eq!(record.status, StackStatus::Running);
        assert_eq!(record.containers.keys().cloned().collect::<Vec<_>>(), vec!["shop-app", "shop-db"]);
        assert_eq!(record.network_id.as_deref(), Some("net-shop-net"));

        let calls = h.engine.calls();
        assert!(
            position(&calls, &call(EngineCall::Start, "shop-db"))
                < position(&calls, &call(EngineCall::Create, "shop-app"))
        );
        assert_eq!(h.engine.networks(), vec!["shop-net"]);
        assert_eq!(h.engine.volumes(), plan.volumes);
        assert_eq!(h.engine.status_of("shop-app"), Some(ContainerStatus::Running));

        let stored = h.orchestrator.store().get(&shop.path).unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_second_apply_changes_nothing() {
        let mut h = harness();
        let shop = project("/work/shop", &[Feature::HasDatabase]);
        let first_plan = plan(&mut h, &shop);
        let first = h.orchestrator.apply(&first_plan).await.unwrap();
        h.engine.clear_calls();

        let second_plan = plan(&mut h, &shop);
        assert_eq!(second_plan, first_plan);
        let second = h.orchestrator.apply(&second_plan).await.unwrap();

        assert!(mutating(&h.engine.calls()).is_empty());
        assert_eq!(second.updated_at, first.updated_at);
        let stored = h.orchestrator.store().get(&shop.path).unwrap().unwrap();
        assert_eq!(stored.updated_at, first.updated_at);
    }

    #[tokio::test]
    async fn test_apply_after_stop_restarts_existing_containers() {
        let mut h = harness();
        let shop = project("/work/shop", &[Feature::HasDatabase]);
        let plan = plan(&mut h, &shop);
        let first = h.orchestrator.apply(&plan).await.unwrap();

        let stopped = h.orchestrator.stop(&shop).await.unwrap();
        assert_eq!(stopped.status, StackStatus::Stopped);
        assert_eq!(h.engine.status_of("shop-db"), Some(ContainerStatus::Exited));
        h.engine.clear_calls();

        let record = h.orchestrator.apply(&plan).await.unwrap();
        let calls = mutating(&h.engine.calls());
        assert!(calls.contains(&call(EngineCall::Start, "shop-db")));
        assert!(calls.contains(&call(EngineCall::Start, "shop-app")));
        assert!(!calls.iter().any(|c| matches!(c, EngineCall::Create(_))));
        assert_eq!(record.containers, first.containers);
        assert_eq!(record.status, StackStatus::Running);
    }

    #[tokio::test]
    async fn test_changed_instance_recreated_and_dependents_restarted() {
        let mut h = harness();
        let shop = project("/work/shop", &[Feature::HasDatabase]);
        let plan = plan(&mut h, &shop);
        let first = h.orchestrator.apply(&plan).await.unwrap();
        h.engine.clear_calls();

        let mut changed = plan.clone();
        changed.instances.iter_mut().find(|i| i.role == RoleName::Db).unwrap().image =
            "postgres:17-alpine".to_string();
        let record = h.orchestrator.apply(&changed).await.unwrap();

        let calls = mutating(&h.engine.calls());
        assert_eq!(
            calls,
            vec![
                call(EngineCall::CreateNetwork, "shop-net"),
                call(EngineCall::CreateVolume, &plan.volumes[0]),
                call(EngineCall::Stop, "shop-db"),
                call(EngineCall::Remove, "shop-db"),
                call(EngineCall::Pull, "postgres:17-alpine"),
                call(EngineCall::Create, "shop-db"),
                call(EngineCall::Start, "shop-db"),
                call(EngineCall::Stop, "shop-app"),
                call(EngineCall::Start, "shop-app"),
            ]
        );
        assert_ne!(record.container_id("shop-db"), first.container_id("shop-db"));
        assert_eq!(record.container_id("shop-app"), first.container_id("shop-app"));
        assert_eq!(record.plan, changed);
    }

    #[tokio::test]
    async fn test_dropped_role_is_removed() {
        let mut h = harness();
        let shop = project("/work/shop", &[Feature::HasDatabase, Feature::HasRedis]);
        let plan = plan(&mut h, &shop);
        h.orchestrator.apply(&plan).await.unwrap();

        let mut overrides = Overrides::default();
        overrides.disable("cache");
        let smaller = plan_with(&mut h, &shop, &overrides);
        let record = h.orchestrator.apply(&smaller).await.unwrap();

        assert!(h.engine.calls().contains(&call(EngineCall::Remove, "shop-cache")));
        assert_eq!(record.containers.keys().cloned().collect::<Vec<_>>(), vec!["shop-app", "shop-db"]);
        assert!(!h.engine.containers().contains(&"shop-cache".to_string()));
    }

    #[tokio::test]
    async fn test_health_failure_rolls_back_fresh_stack() {
        let mut h = harness();
        let shop = project("/work/shop", &[Feature::HasDatabase]);
        let plan = plan(&mut h, &shop);
        h.engine.never_healthy("shop-db");

        let err = h.orchestrator.apply(&plan).await.unwrap_err();
        match err {
            Error::Lifecycle(LifecycleError::HealthCheckFailed { instance, attempts, .. }) => {
                assert_eq!(instance, "shop-db");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(h.engine.containers().is_empty());
        assert!(h.engine.networks().is_empty());
        assert!(h.engine.volumes().is_empty());
        assert!(!h.engine.calls().contains(&call(EngineCall::Create, "shop-app")));
        assert!(h.orchestrator.store().get(&shop.path).unwrap().is_none());
        let app_port = plan.instance("shop-app").unwrap().host_port;
        assert!(h.orchestrator.allocation().owner(app_port).is_none());
    }

    #[tokio::test]
    async fn test_failed_reconcile_keeps_untouched_instances() {
        let mut h = harness();
        let shop = project("/work/shop", &[Feature::HasDatabase]);
        let plan = plan(&mut h, &shop);
        h.orchestrator.apply(&plan).await.unwrap();

        let mut changed = plan.clone();
        changed.instances.iter_mut().find(|i| i.role == RoleName::App).unwrap().image = "php:8.3-apache".to_string();
        h.engine.fail_on(call(EngineCall::Start, "shop-app"));

        let err = h.orchestrator.apply(&changed).await.unwrap_err();
        assert!(matches!(err, Error::Lifecycle(LifecycleError::Engine { .. })));

        let record = h.orchestrator.store().get(&shop.path).unwrap().unwrap();
        assert_eq!(record.status, StackStatus::Failed);
        assert_eq!(record.containers.keys().cloned().collect::<Vec<_>>(), vec!["shop-db"]);
        assert_eq!(record.plan, plan);
        assert_eq!(h.engine.containers(), vec!["shop-db"]);
        assert_eq!(h.engine.networks(), vec!["shop-net"]);
    }

    #[tokio::test]
    async fn test_sequential_wave_stops_at_first_failure() {
        let mut h = harness();
        h.orchestrator = h.orchestrator.with_options(OrchestratorOptions { parallel: false, ..Default::default() });
        let shop = project("/work/shop", &[Feature::HasDatabase, Feature::HasRedis, Feature::HasMail]);
        let plan = plan(&mut h, &shop);
        let first = plan.waves()[0][0].name.clone();
        h.engine.fail_on(EngineCall::Create(first.clone()));

        assert!(h.orchestrator.apply(&plan).await.is_err());
        let creates: Vec<_> =
            h.engine.calls().into_iter().filter(|c| matches!(c, EngineCall::Create(_))).collect();
        assert_eq!(creates, vec![EngineCall::Create(first)]);
        assert!(h.engine.containers().is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_rolls_back() {
        let mut h = harness();
        let cancel = CancelToken::new();
        h.orchestrator = h.orchestrator.with_cancel(cancel.clone());
        let shop = project("/work/shop", &[Feature::HasDatabase]);
        let plan = plan(&mut h, &shop);
        h.engine.cancel_on(call(EngineCall::Create, "shop-db"), cancel.clone());

        let err = h.orchestrator.apply(&plan).await.unwrap_err();
        assert!(matches!(err, Error::Lifecycle(LifecycleError::Interrupted { .. })));
        assert!(cancel.is_cancelled());
        assert!(h.engine.containers().is_empty());
        assert!(h.engine.networks().is_empty());
        assert!(h.orchestrator.store().get(&shop.path).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_interrupted_create_leaves_no_container() {
        let mut h = harness();
        let cancel = CancelToken::new();
        h.orchestrator = h.orchestrator.with_cancel(cancel.clone());
        let shop = project("/work/shop", &[]);
        let plan = plan(&mut h, &shop);
        h.engine.lose_create_reply("shop-app");
        h.engine.cancel_on(call(EngineCall::Create, "shop-app"), cancel.clone());

        let err = h.orchestrator.apply(&plan).await.unwrap_err();
        assert!(matches!(err, Error::Lifecycle(LifecycleError::Interrupted { .. })));
        assert!(h.engine.containers().is_empty());
        assert!(h.engine.networks().is_empty());
        assert!(h.orchestrator.store().get(&shop.path).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_create_reply_retried_once_then_cleaned() {
        let mut h = harness();
        let shop = project("/work/shop", &[]);
        let plan = plan(&mut h, &shop);
        h.engine.lose_create_reply("shop-app");

        let err = h.orchestrator.apply(&plan).await.unwrap_err();
        assert!(matches!(err, Error::Lifecycle(LifecycleError::Engine { .. })));
        let creates = h.engine.calls().iter().filter(|c| matches!(c, EngineCall::Create(_))).count();
        assert_eq!(creates, 2);
        assert!(h.engine.containers().is_empty());
    }

    #[tokio::test]
    async fn test_leftover_container_of_project_is_replaced() {
        let mut h = harness();
        let shop = project("/work/shop", &[]);
        let plan = plan(&mut h, &shop);
        let app = plan.instance("shop-app").unwrap();
        h.engine.create_network(&plan.network).await.unwrap();
        let leftover = h
            .engine
            .create_container(&ContainerSpec::for_instance(app, &plan.network, &shop.path))
            .await
            .unwrap();

        let record = h.orchestrator.apply(&plan).await.unwrap();
        assert_eq!(record.status, StackStatus::Running);
        assert_eq!(h.engine.containers(), vec!["shop-app"]);
        assert_ne!(record.container_id("shop-app"), Some(leftover.as_str()));
    }

    #[tokio::test]
    async fn test_foreign_container_with_same_name_is_kept() {
        let mut h = harness();
        let shop = project("/work/shop", &[]);
        let plan = plan(&mut h, &shop);
        let app = plan.instance("shop-app").unwrap();
        h.engine.create_network(&plan.network).await.unwrap();
        let mut foreign = ContainerSpec::for_instance(app, &plan.network, std::path::Path::new("/elsewhere/shop"));
        foreign.image = "httpd:2.4".to_string();
        let foreign_id = h.engine.create_container(&foreign).await.unwrap();

        let err = h.orchestrator.apply(&plan).await.unwrap_err();
        assert!(matches!(err, Error::Lifecycle(LifecycleError::Engine { .. })));
        assert_eq!(h.engine.find_container("shop-app").await.unwrap().unwrap().id, foreign_id);
        assert!(h.orchestrator.store().get(&shop.path).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_later_failure_rolls_back_earlier_instances() {
        let mut h = harness();
        let shop = project("/work/shop", &[Feature::HasDatabase]);
        let plan = plan(&mut h, &shop);
        h.engine.fail_on(call(EngineCall::Start, "shop-app"));

        assert!(h.orchestrator.apply(&plan).await.is_err());

        let calls = mutating(&h.engine.calls());
        let tail = &calls[calls.len() - 6..];
        assert_eq!(
            tail,
            &[
                call(EngineCall::Stop, "shop-app"),
                call(EngineCall::Remove, "shop-app"),
                call(EngineCall::Stop, "shop-db"),
                call(EngineCall::Remove, "shop-db"),
                call(EngineCall::RemoveNetwork, "shop-net"),
                call(EngineCall::RemoveVolume, &plan.volumes[0]),
            ]
        );
        assert!(h.engine.containers().is_empty());
        assert!(h.engine.networks().is_empty());
        assert!(h.engine.volumes().is_empty());
        assert!(h.orchestrator.store().get(&shop.path).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_name_conflict_between_projects() {
        let mut h = harness();
        let first = project("/work/a/shop", &[]);
        let plan_a = plan(&mut h, &first);
        h.orchestrator.apply(&plan_a).await.unwrap();
        h.engine.clear_calls();

        let second = project("/work/b/shop", &[]);
        let plan_b = plan(&mut h, &second);
        let err = h.orchestrator.apply(&plan_b).await.unwrap_err();
        match err {
            Error::Lifecycle(LifecycleError::NameConflict { other, .. }) => {
                assert_eq!(other, PathBuf::from("/work/a/shop"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(h.engine.calls().is_empty());
        assert!(h.orchestrator.store().get(&second.path).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_and_destroy_in_reverse_order() {
        let mut h = harness();
        let shop = project("/work/shop", &[Feature::HasDatabase]);
        let plan = plan(&mut h, &shop);
        h.orchestrator.apply(&plan).await.unwrap();
        h.engine.clear_calls();

        h.orchestrator.stop(&shop).await.unwrap();
        assert_eq!(
            mutating(&h.engine.calls()),
            vec![call(EngineCall::Stop, "shop-app"), call(EngineCall::Stop, "shop-db")]
        );

        h.engine.clear_calls();
        assert!(h.orchestrator.destroy(&shop, true).await.unwrap());
        let mut expected = vec![
            call(EngineCall::Stop, "shop-app"),
            call(EngineCall::Remove, "shop-app"),
            call(EngineCall::Stop, "shop-db"),
            call(EngineCall::Remove, "shop-db"),
            call(EngineCall::RemoveNetwork, "shop-net"),
        ];
        expected.extend(plan.volumes.iter().map(|v| call(EngineCall::RemoveVolume, v)));
        assert_eq!(mutating(&h.engine.calls()), expected);
        assert!(h.engine.containers().is_empty());
        assert!(h.engine.networks().is_empty());
        assert!(h.engine.volumes().is_empty());
        assert!(h.orchestrator.store().get(&shop.path).unwrap().is_none());
        assert!(h.orchestrator.allocation().ports().next().is_none());

        assert!(!h.orchestrator.destroy(&shop, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_destroy_tolerates_vanished_container_and_keeps_volumes() {
        let mut h = harness();
        let shop = project("/work/shop", &[Feature::HasDatabase]);
        let plan = plan(&mut h, &shop);
        h.orchestrator.apply(&plan).await.unwrap();
        h.engine.forget("shop-app");

        assert!(h.orchestrator.destroy(&shop, false).await.unwrap());
        assert!(h.engine.containers().is_empty());
        assert!(h.engine.networks().is_empty());
        assert_eq!(h.engine.volumes().len(), plan.volumes.len());
        assert!(h.orchestrator.store().get(&shop.path).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_aggregates_instances() {
        let mut h = harness();
        let shop = project("/work/shop", &[Feature::HasDatabase]);
        let plan = plan(&mut h, &shop);
        h.orchestrator.apply(&plan).await.unwrap();

        let report = h.orchestrator.status(&shop).await.unwrap();
        assert_eq!(report.status, StackStatus::Running);
        assert_eq!(report.instances.len(), 2);

        h.engine.kill("shop-app");
        let report = h.orchestrator.status(&shop).await.unwrap();
        assert_eq!(report.status, StackStatus::Unknown);
        let stored = h.orchestrator.store().get(&shop.path).unwrap().unwrap();
        assert_eq!(stored.status, StackStatus::Unknown);

        h.engine.forget("shop-db");
        let report = h.orchestrator.status(&shop).await.unwrap();
        assert_eq!(report.status, StackStatus::Stopped);
        let db = report.instances.iter().find(|i| i.role == RoleName::Db).unwrap();
        assert!(db.state.is_none());
    }

    #[tokio::test]
    async fn test_status_without_stack() {
        let h = harness();
        let err = h.orchestrator.status(&project("/work/none", &[])).await.unwrap_err();
        assert!(matches!(err, Error::Lifecycle(LifecycleError::NoStack { .. })));
    }

    #[tokio::test]
    async fn test_engine_unavailable_leaves_no_record() {
        let mut h = harness();
        let shop = project("/work/shop", &[]);
        let plan = plan(&mut h, &shop);
        h.engine.set_unavailable(true);

        let err = h.orchestrator.apply(&plan).await.unwrap_err();
        match err {
            Error::Lifecycle(e) => assert!(e.is_engine_unavailable()),
            other => panic!("unexpected error: {other}"),
        }
        assert!(h.orchestrator.store().get(&shop.path).unwrap().is_none());
    }
}
