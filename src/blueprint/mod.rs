//! Blueprint resolution.
//!
//! Maps an analyzed [`Project`] and user [`Overrides`] onto the static role
//! table of the project's kind, producing an ordered [`StackBlueprint`].

mod overrides;
mod roles;

pub use overrides::{with_tag, Overrides, ProbeOverride, RoleOverride, OVERRIDE_FILE};
pub use roles::{role_table, HealthCheck, Probe, RoleName, ServiceRole, VolumeMount, VolumeSource};

use std::collections::{BTreeMap, BTreeSet};

use crate::error::BlueprintError;
use crate::project::Project;

/// A selected role with overrides merged in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlueprintRole {
    /// Role definition after image, port and dependency overrides
    pub spec: ServiceRole,

    /// Environment overrides for this role; these win over everything else
    pub env_overrides: BTreeMap<String, String>,
}

impl BlueprintRole {
    /// Role name.
    pub fn name(&self) -> RoleName {
        self.spec.name
    }
}

/// The roles a project needs, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackBlueprint {
    /// The analyzed project
    pub project: Project,

    /// Selected roles in declaration order
    pub roles: Vec<BlueprintRole>,

    /// Flat environment overrides
    pub env_overrides: BTreeMap<String, String>,
}

impl StackBlueprint {
    /// Look up a selected role.
    pub fn role(&self, name: RoleName) -> Option<&BlueprintRole> {
        self.roles.iter().find(|r| r.name() == name)
    }

    /// Names of the selected roles in declaration order.
    pub fn role_names(&self) -> Vec<RoleName> {
        self.roles.iter().map(BlueprintRole::name).collect()
    }
}

/// Resolve the blueprint for a project.
///
/// Only structural validation happens here: override keys must name roles of
/// the project's kind and hard dependencies must be selected.
pub fn resolve(project: &Project, overrides: &Overrides) -> Result<StackBlueprint, BlueprintError> {
    let table = role_table(project);
    let role_overrides = validate_override_keys(project, &table, overrides)?;

    let mut selected = Vec::new();
    for role in table {
        let forced = role_overrides.get(&role.name).and_then(|o| o.enabled);
        let include = if role.is_required() {
            if forced == Some(false) {
                return Err(BlueprintError::InvalidOverride {
                    project: project.name.clone(),
                    role: role.name.to_string(),
                    reason: "a required role cannot be disabled".to_string(),
                });
            }
            true
        } else {
            forced.unwrap_or_else(|| role.trigger.is_some_and(|feature| project.has(feature)))
        };

        if include {
            selected.push(role);
        } else {
            tracing::debug!(project = %project.name, role = %role.name, "Role not selected");
        }
    }

    for role in &mut selected {
        if let Some(ov) = role_overrides.get(&role.name) {
            apply_override(project, role, ov)?;
        }
    }

    let names: BTreeSet<RoleName> = selected.iter().map(|r| r.name).collect();
    for role in &mut selected {
        if let Some(missing) = role.requires.iter().find(|d| !names.contains(d)) {
            return Err(BlueprintError::UnresolvedDependency {
                project: project.name.clone(),
                role: role.name.to_string(),
                dependency: missing.to_string(),
            });
        }
        let requires = role.requires.clone();
        role.after.retain(|d| names.contains(d) && !requires.contains(d));
    }

    inject_link_env(&mut selected);

    let roles = selected
        .into_iter()
        .map(|spec| {
            let env_overrides =
                role_overrides.get(&spec.name).map(|o| o.env.clone()).unwrap_or_default();
            BlueprintRole { spec, env_overrides }
        })
        .collect::<Vec<_>>();

    tracing::debug!(
        project = %project.name,
        roles = ?roles.iter().map(|r| r.name().as_str()).collect::<Vec<_>>(),
        "Resolved blueprint"
    );

    Ok(StackBlueprint { project: project.clone(), roles, env_overrides: overrides.env.clone() })
}

fn validate_override_keys<'a>(
    project: &Project,
    table: &[ServiceRole],
    overrides: &'a Overrides,
) -> Result<BTreeMap<RoleName, &'a RoleOverride>, BlueprintError> {
    let mut by_role = BTreeMap::new();

    for (key, value) in &overrides.services {
        let name = key
            .parse::<RoleName>()
            .ok()
            .filter(|name| table.iter().any(|r| r.name == *name))
            .ok_or_else(|| BlueprintError::UnknownRole {
                project: project.name.clone(),
                role: key.clone(),
                available: table.iter().map(|r| r.name.as_str()).collect::<Vec<_>>().join(", "),
            })?;
        by_role.insert(name, value);
    }

    Ok(by_role)
}

fn apply_override(
    project: &Project,
    role: &mut ServiceRole,
    ov: &RoleOverride,
) -> Result<(), BlueprintError> {
    let role_name = role.name.to_string();
    let invalid = |reason: &str| BlueprintError::InvalidOverride {
        project: project.name.clone(),
        role: role_name.clone(),
        reason: reason.to_string(),
    };

    if let Some(image) = &ov.image {
        if image.trim().is_empty() {
            return Err(invalid("image must not be empty"));
        }
        role.image = image.clone();
    }
    if let Some(tag) = &ov.tag {
        if tag.trim().is_empty() || tag.contains(['/', ' ']) {
            return Err(invalid("tag must be a plain image tag"));
        }
        role.image = with_tag(&role.image, tag);
    }
    if let Some(port) = ov.port {
        if port == 0 {
            return Err(invalid("port must be between 1 and 65535"));
        }
        role.host_port = port;
    }
    if let Some(probe) = ov.probe {
        role.healthcheck.probe = match probe {
            ProbeOverride::Running => Probe::Running,
            ProbeOverride::Tcp => Probe::Tcp,
        };
    }
    if let Some(deps) = &ov.depends_on {
        let mut requires = Vec::with_capacity(deps.len());
        for dep in deps {
            let parsed = dep.parse::<RoleName>().map_err(|_| BlueprintError::UnresolvedDependency {
                project: project.name.clone(),
                role: role_name.clone(),
                dependency: dep.clone(),
            })?;
            if !requires.contains(&parsed) {
                requires.push(parsed);
            }
        }
        role.requires = requires;
    }

    Ok(())
}

/// Give each role the connection environment of the roles it depends on.
/// A role's own defaults win over injected values.
fn inject_link_env(selected: &mut [ServiceRole]) {
    let links: BTreeMap<RoleName, BTreeMap<String, String>> =
        selected.iter().map(|r| (r.name, r.link_env.clone())).collect();

    for role in selected.iter_mut() {
        let deps: Vec<RoleName> = role.dependencies().collect();
        for dep in deps {
            let Some(env) = links.get(&dep) else { continue };
            for (key, value) in env {
                role.env.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }
}
