//! Stack synthesis.
//!
//! Turns a [`StackBlueprint`] into a concrete [`StackPlan`]: dependency order,
//! host ports, volumes, environment and names. Synthesis never talks to the
//! container engine.

mod compose;
mod environment;
mod ports;
mod topo;

pub use compose::to_compose;
pub use ports::{PortAllocation, PortOwner, PortProbe, TcpProbe};

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::blueprint::{BlueprintRole, HealthCheck, Probe, RoleName, StackBlueprint, VolumeSource};
use crate::env::ProjectEnv;
use crate::error::SynthesisError;
use crate::project::Project;

use environment::EnvResolver;

/// Container name of a role instance.
pub fn instance_name(project: &str, role: RoleName) -> String {
    format!("{project}-{role}")
}

/// Network name of a stack.
pub fn network_name(project: &str) -> String {
    format!("{project}-net")
}

/// Engine volume name for a role's named volume.
pub fn volume_name(project: &str, role: RoleName, volume: &str) -> String {
    format!("{project}-{role}-{volume}")
}

/// Source of an instance mount.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MountSource {
    /// Project-scoped engine volume
    Volume { name: String },
    /// Absolute host path
    Bind { path: PathBuf },
}

/// A resolved mount.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceMount {
    /// Volume or host path
    pub source: MountSource,

    /// Path inside the container
    pub target: String,

    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
}

impl InstanceMount {
    /// `source:target[:ro]` form used by engine CLIs and compose files.
    pub fn to_bind_string(&self) -> String {
        let source = match &self.source {
            MountSource::Volume { name } => name.clone(),
            MountSource::Bind { path } => path.display().to_string(),
        };
        if self.read_only {
            format!("{source}:{}:ro", self.target)
        } else {
            format!("{source}:{}", self.target)
        }
    }
}

/// A concrete container to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Container name, `<project>-<role>`
    pub name: String,

    /// Role this instance fills
    pub role: RoleName,

    /// Image reference
    pub image: String,

    /// Port inside the container
    pub container_port: u16,

    /// Published host port
    pub host_port: u16,

    /// Host port the blueprint asked for
    pub requested_port: u16,

    /// Mounts
    pub volumes: Vec<InstanceMount>,

    /// Fully resolved environment
    pub env: BTreeMap<String, String>,

    /// Roles that start before this one
    pub depends_on: Vec<RoleName>,

    /// Command override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,

    /// Readiness contract
    pub healthcheck: HealthCheck,
}

impl ServiceInstance {
    /// Content fingerprint used to decide whether a running container is
    /// still what the plan asks for.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();

        feed(&mut hasher, "image", &self.image);
        feed(&mut hasher, "ports", &format!("{}:{}", self.host_port, self.container_port));
        for (key, value) in &self.env {
            feed(&mut hasher, "env", &format!("{key}={value}"));
        }
        for mount in &self.volumes {
            feed(&mut hasher, "volume", &mount.to_bind_string());
        }
        if let Some(command) = &self.command {
            feed(&mut hasher, "command", &command.join("\0"));
        }
        if let Some(workdir) = &self.workdir {
            feed(&mut hasher, "workdir", workdir);
        }
        let probe = match &self.healthcheck.probe {
            Probe::Running => "running".to_string(),
            Probe::Tcp => "tcp".to_string(),
            Probe::Command(test) => format!("command:{}", test.join("\0")),
        };
        feed(&mut hasher, "probe", &probe);

        format!("{:x}", hasher.finalize())
    }
}

fn feed(hasher: &mut Sha256, label: &str, value: &str) {
    hasher.update(label.as_bytes());
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

/// A fully resolved stack, ready to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackPlan {
    /// The project this stack serves
    pub project: Project,

    /// Network name
    pub network: String,

    /// Instances in dependency order
    pub instances: Vec<ServiceInstance>,

    /// Named volumes to create
    pub volumes: Vec<String>,

    /// Non-fatal synthesis problems
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl StackPlan {
    /// Look up an instance by container name.
    pub fn instance(&self, name: &str) -> Option<&ServiceInstance> {
        self.instances.iter().find(|i| i.name == name)
    }

    /// Look up the instance of a role.
    pub fn instance_for(&self, role: RoleName) -> Option<&ServiceInstance> {
        self.instances.iter().find(|i| i.role == role)
    }

    /// Instances grouped into dependency waves.
    ///
    /// Every instance lands one wave after the latest of its dependencies, so
    /// the members of a wave never depend on each other.
    pub fn waves(&self) -> Vec<Vec<&ServiceInstance>> {
        let mut level: BTreeMap<RoleName, usize> = BTreeMap::new();
        let mut waves: Vec<Vec<&ServiceInstance>> = Vec::new();

        for instance in &self.instances {
            let wave = instance
                .depends_on
                .iter()
                .filter_map(|d| level.get(d))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level.insert(instance.role, wave);
            if waves.len() <= wave {
                waves.resize_with(wave + 1, Vec::new);
            }
            waves[wave].push(instance);
        }
        waves
    }
}

/// Inputs to synthesis beyond the blueprint.
#[derive(Debug, Clone, Default)]
pub struct SynthesisContext {
    /// Project `.env` values
    pub project_env: ProjectEnv,

    /// Last applied plan for this project, used to reclaim ports
    pub previous: Option<StackPlan>,
}

impl SynthesisContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set project `.env` values.
    #[must_use]
    pub fn with_env(mut self, project_env: ProjectEnv) -> Self {
        self.project_env = project_env;
        self
    }

    /// Set the previously applied plan.
    #[must_use]
    pub fn with_previous(mut self, previous: Option<StackPlan>) -> Self {
        self.previous = previous;
        self
    }
}

/// Synthesize a stack plan and register its ports in `allocation`.
pub fn synthesize(
    blueprint: &StackBlueprint,
    allocation: &mut PortAllocation,
    ctx: &SynthesisContext,
) -> Result<StackPlan, SynthesisError> {
    let project = &blueprint.project;
    let order = topo::order(&project.name, &blueprint.roles)?;

    let names: BTreeMap<RoleName, String> =
        blueprint.roles.iter().map(|r| (r.name(), instance_name(&project.name, r.name()))).collect();

    // Our own containers may still be bound to these; the host probe would
    // report them busy.
    let mut trusted = allocation.release_project(&project.path);
    if let Some(previous) = &ctx.previous {
        trusted.extend(previous.instances.iter().map(|i| i.host_port));
    }

    let resolver = EnvResolver { names: &names, project_env: &ctx.project_env };
    let mut warnings = Vec::new();
    let mut instances = Vec::with_capacity(order.len());
    let mut volumes = Vec::new();

    for idx in order {
        let role = &blueprint.roles[idx];
        let name = names[&role.name()].clone();
        let previous = ctx.previous.as_ref().and_then(|p| p.instance(&name));

        let host_port = assign_port(allocation, project, role, &name, previous, &trusted, &mut warnings)?;
        allocation.claim(host_port, &project.path, &name);

        let mounts = mounts(project, role, &mut volumes);
        let raw_env = environment::merge(role, &ctx.project_env, &blueprint.env_overrides);
        let env = resolver.resolve(&name, &raw_env, &mut warnings);

        tracing::debug!(project = %project.name, instance = %name, port = host_port, "Synthesized instance");

        instances.push(ServiceInstance {
            name,
            role: role.name(),
            image: role.spec.image.clone(),
            container_port: role.spec.container_port,
            host_port,
            requested_port: role.spec.host_port,
            volumes: mounts,
            env,
            depends_on: role.spec.dependencies().collect(),
            command: role.spec.command.clone(),
            workdir: role.spec.workdir.clone(),
            healthcheck: role.spec.healthcheck.clone(),
        });
    }

    Ok(StackPlan {
        network: network_name(&project.name),
        project: project.clone(),
        instances,
        volumes,
        warnings,
    })
}

fn assign_port(
    allocation: &PortAllocation,
    project: &Project,
    role: &BlueprintRole,
    name: &str,
    previous: Option<&ServiceInstance>,
    trusted: &BTreeSet<u16>,
    warnings: &mut Vec<String>,
) -> Result<u16, SynthesisError> {
    let requested = role.spec.host_port;

    // Reclaim the recorded port unless the requested port changed since
    if let Some(prev) = previous.filter(|p| p.requested_port == requested) {
        if allocation.is_available(prev.host_port, &project.path, name, true) {
            return Ok(prev.host_port);
        }
        let message = match allocation.owner(prev.host_port) {
            Some(owner) if owner.project == project.path => format!(
                "{name}: previous host port {} was handed to {} of this stack, reallocating from {requested}",
                prev.host_port, owner.instance
            ),
            Some(owner) => format!(
                "{name}: previous host port {} is now held by {} of another project, reallocating from {requested}",
                prev.host_port, owner.instance
            ),
            None => format!(
                "{name}: previous host port {} is busy on the host, reallocating from {requested}",
                prev.host_port
            ),
        };
        tracing::warn!(project = %project.name, instance = %name, port = prev.host_port, "{message}");
        warnings.push(message);
    }

    let port = allocation.next_available(requested, &project.path, name, trusted).ok_or_else(|| {
        SynthesisError::PortExhausted {
            project: project.name.clone(),
            role: role.name().to_string(),
            requested,
        }
    })?;

    if port != requested {
        tracing::debug!(project = %project.name, instance = %name, requested, port, "Requested port taken");
    }
    Ok(port)
}

fn mounts(project: &Project, role: &BlueprintRole, volumes: &mut Vec<String>) -> Vec<InstanceMount> {
    role.spec
        .volumes
        .iter()
        .map(|mount| {
            let source = match &mount.source {
                VolumeSource::Named(suffix) => {
                    let name = volume_name(&project.name, role.name(), suffix);
                    if !volumes.contains(&name) {
                        volumes.push(name.clone());
                    }
                    MountSource::Volume { name }
                }
                VolumeSource::Project(rel) => MountSource::Bind { path: project_path(&project.path, rel) },
            };
            InstanceMount { source, target: mount.target.clone(), read_only: mount.read_only }
        })
        .collect()
}

fn project_path(root: &Path, rel: &Path) -> PathBuf {
    if rel == Path::new(".") {
        root.to_path_buf()
    } else {
        root.join(rel)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::blueprint::{resolve, Overrides};
    use crate::project::{Feature, ProjectKind};

    fn blueprint(dir: &str, kind: ProjectKind, features: &[Feature]) -> StackBlueprint {
        let path = PathBuf::from(dir);
        let project = Project {
            name: crate::project::project_name(&path),
            path,
            kind,
            features: features.iter().copied().collect::<BTreeSet<_>>(),
        };
        resolve(&project, &Overrides::default()).unwrap()
    }

    #[test]
    fn test_php_with_database_plan() {
        let bp = blueprint("/work/shop", ProjectKind::Php, &[Feature::HasDatabase]);
        let mut alloc = PortAllocation::new();
        let plan = synthesize(&bp, &mut alloc, &SynthesisContext::new()).unwrap();

        let names: Vec<_> = plan.instances.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["shop-db", "shop-app"]);
        assert_eq!(plan.network, "shop-net");
        assert_eq!(plan.volumes, vec!["shop-db-data".to_string()]);

        let app = plan.instance_for(RoleName::App).unwrap();
        assert_eq!(app.host_port, 8080);
        assert_eq!(app.depends_on, vec![RoleName::Db]);
        assert_eq!(app.env["DB_HOST"], "shop-db");
        assert_eq!(app.env["DB_PORT"], "5432");
        assert_eq!(
            app.volumes[0].source,
            MountSource::Bind { path: PathBuf::from("/work/shop") }
        );

        let db = plan.instance("shop-db").unwrap();
        assert_eq!(db.host_port, 5432);
        assert_eq!(db.env["POSTGRES_DB"], "app");
        assert!(plan.warnings.is_empty(), "{:?}", plan.warnings);
    }

    #[test]
    fn test_two_projects_get_disjoint_ports() {
        let mut alloc = PortAllocation::new();
        let a = synthesize(
            &blueprint("/work/a", ProjectKind::Php, &[]),
            &mut alloc,
            &SynthesisContext::new(),
        )
        .unwrap();
        let b = synthesize(
            &blueprint("/work/b", ProjectKind::Php, &[]),
            &mut alloc,
            &SynthesisContext::new(),
        )
        .unwrap();

        assert_eq!(a.instances[0].host_port, 8080);
        assert_eq!(b.instances[0].host_port, 8081);
    }

    #[test]
    fn test_resynthesis_reclaims_ports() {
        let bp = blueprint("/work/b", ProjectKind::Php, &[]);

        let mut alloc = PortAllocation::new();
        alloc.claim(8080, Path::new("/work/a"), "a-app");
        let first = synthesize(&bp, &mut alloc, &SynthesisContext::new()).unwrap();
        assert_eq!(first.instances[0].host_port, 8081);

        // a goes away; b keeps 8081 instead of moving to 8080
        let mut alloc = PortAllocation::from_plans([&first]);
        let ctx = SynthesisContext::new().with_previous(Some(first.clone()));
        let second = synthesize(&bp, &mut alloc, &ctx).unwrap();
        assert_eq!(second.instances[0].host_port, 8081);
        assert_eq!(second, first);
    }

    #[test]
    fn test_lost_reclaim_port_warns() {
        let bp = blueprint("/work/b", ProjectKind::Php, &[]);
        let mut alloc = PortAllocation::new();
        alloc.claim(8080, Path::new("/work/a"), "a-app");
        let first = synthesize(&bp, &mut alloc, &SynthesisContext::new()).unwrap();

        let mut alloc = PortAllocation::new();
        alloc.claim(8081, Path::new("/work/c"), "c-app");
        let ctx = SynthesisContext::new().with_previous(Some(first));
        let second = synthesize(&bp, &mut alloc, &ctx).unwrap();

        assert_eq!(second.instances[0].host_port, 8080);
        assert_eq!(second.warnings.len(), 1);
        assert!(second.warnings[0].contains("c-app of another project"));
    }

    #[test]
    fn test_reclaim_lost_to_sibling_role_names_this_stack() {
        let bp = blueprint("/work/shop", ProjectKind::Php, &[Feature::HasDatabase]);
        let first = synthesize(&bp, &mut PortAllocation::new(), &SynthesisContext::new()).unwrap();
        let app_port = first.instance("shop-app").unwrap().host_port;

        // db is ordered before app and now asks for the app's old port
        let mut overrides = Overrides::default();
        overrides.role_mut("db").port = Some(app_port);
        let bp = resolve(&bp.project, &overrides).unwrap();

        let ctx = SynthesisContext::new().with_previous(Some(first));
        let second = synthesize(&bp, &mut PortAllocation::new(), &ctx).unwrap();

        assert_eq!(second.instance("shop-db").unwrap().host_port, app_port);
        assert_ne!(second.instance("shop-app").unwrap().host_port, app_port);
        let warning = second.warnings.iter().find(|w| w.starts_with("shop-app")).unwrap();
        assert!(warning.contains("shop-db of this stack"));
        assert!(!warning.contains("another project"));
    }

    #[test]
    fn test_port_exhausted() {
        let mut overrides = Overrides::default();
        overrides.role_mut("app").port = Some(u16::MAX);
        let bp = resolve(&blueprint("/work/a", ProjectKind::Php, &[]).project, &overrides).unwrap();

        let mut alloc = PortAllocation::new();
        alloc.claim(u16::MAX, Path::new("/work/z"), "z-app");
        let err = synthesize(&bp, &mut alloc, &SynthesisContext::new()).unwrap_err();
        assert!(matches!(err, SynthesisError::PortExhausted { requested: 65535, .. }));
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let bp = blueprint("/work/shop", ProjectKind::Php, &[Feature::HasRedis]);
        let plan = synthesize(&bp, &mut PortAllocation::new(), &SynthesisContext::new()).unwrap();
        let cache = plan.instance("shop-cache").unwrap().clone();

        let same = cache.clone();
        assert_eq!(cache.fingerprint(), same.fingerprint());

        let mut retagged = cache.clone();
        retagged.image = "redis:7.2-alpine".to_string();
        assert_ne!(cache.fingerprint(), retagged.fingerprint());

        let mut env_changed = cache.clone();
        env_changed.env.insert("X".into(), "1".into());
        assert_ne!(cache.fingerprint(), env_changed.fingerprint());
    }

    #[test]
    fn test_waves_group_independent_instances() {
        let bp = blueprint(
            "/work/shop",
            ProjectKind::Python,
            &[Feature::HasDatabase, Feature::HasRedis, Feature::HasMail],
        );
        let plan = synthesize(&bp, &mut PortAllocation::new(), &SynthesisContext::new()).unwrap();
        let waves: Vec<Vec<&str>> =
            plan.waves().iter().map(|w| w.iter().map(|i| i.name.as_str()).collect()).collect();

        assert_eq!(waves, vec![vec!["shop-db", "shop-cache", "shop-mail"], vec!["shop-app"]]);
    }

    #[test]
    fn test_dotenv_flows_into_app_and_db() {
        let bp = blueprint("/work/shop", ProjectKind::Php, &[Feature::DbMysql, Feature::HasDatabase]);
        let env = ProjectEnv::from_values(BTreeMap::from([
            ("DB_DATABASE".to_string(), "shop".to_string()),
            ("DB_HOST".to_string(), "db".to_string()),
            ("APP_NAME".to_string(), "Shop".to_string()),
        ]));
        let ctx = SynthesisContext::new().with_env(env);
        let plan = synthesize(&bp, &mut PortAllocation::new(), &ctx).unwrap();

        let app = plan.instance_for(RoleName::App).unwrap();
        assert_eq!(app.env["DB_HOST"], "shop-db");
        assert_eq!(app.env["DB_DATABASE"], "shop");
        assert_eq!(app.env["APP_NAME"], "Shop");

        let db = plan.instance_for(RoleName::Db).unwrap();
        assert_eq!(db.env["MYSQL_DATABASE"], "shop");
        assert!(!db.env.contains_key("APP_NAME"));
    }
}
