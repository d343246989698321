//! docker-compose export of a stack plan.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{MountSource, StackPlan};
use crate::blueprint::Probe;
use crate::env::masked_value;

#[derive(Debug, Serialize)]
struct ComposeFile {
    name: String,
    services: BTreeMap<String, ComposeService>,
    networks: BTreeMap<String, NamedResource>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    volumes: BTreeMap<String, NamedResource>,
}

#[derive(Debug, Serialize)]
struct ComposeService {
    image: String,
    container_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    working_dir: Option<String>,
    ports: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    healthcheck: Option<ComposeHealthcheck>,
}

#[derive(Debug, Serialize)]
struct ComposeHealthcheck {
    test: Vec<String>,
    interval: String,
    timeout: String,
    retries: u32,
}

#[derive(Debug, Serialize)]
struct NamedResource {
    name: String,
}

/// Render a plan as a docker-compose YAML document.
///
/// Services are keyed by role. With `mask` set, sensitive environment values
/// are masked.
pub fn to_compose(plan: &StackPlan, mask: bool) -> Result<String, serde_yaml::Error> {
    let mut services = BTreeMap::new();

    for instance in &plan.instances {
        let environment = instance
            .env
            .iter()
            .map(|(k, v)| {
                let value = if mask { masked_value(k, v) } else { v.clone() };
                (k.clone(), value)
            })
            .collect();

        let healthcheck = match &instance.healthcheck.probe {
            Probe::Command(test) => Some(ComposeHealthcheck {
                test: std::iter::once("CMD".to_string()).chain(test.iter().cloned()).collect(),
                interval: format!("{}ms", instance.healthcheck.interval_ms),
                timeout: format!("{}ms", instance.healthcheck.timeout_ms),
                retries: instance.healthcheck.retries,
            }),
            Probe::Running | Probe::Tcp => None,
        };

        services.insert(
            instance.role.to_string(),
            ComposeService {
                image: instance.image.clone(),
                container_name: instance.name.clone(),
                command: instance.command.clone(),
                working_dir: instance.workdir.clone(),
                ports: vec![format!("{}:{}", instance.host_port, instance.container_port)],
                environment,
                volumes: instance.volumes.iter().map(|m| m.to_bind_string()).collect(),
                depends_on: instance.depends_on.iter().map(|r| r.to_string()).collect(),
                healthcheck,
            },
        );
    }

    let volumes = plan
        .instances
        .iter()
        .flat_map(|i| &i.volumes)
        .filter_map(|m| match &m.source {
            MountSource::Volume { name } => Some((name.clone(), NamedResource { name: name.clone() })),
            MountSource::Bind { .. } => None,
        })
        .collect();

    let file = ComposeFile {
        name: plan.project.name.clone(),
        services,
        networks: BTreeMap::from([("default".to_string(), NamedResource { name: plan.network.clone() })]),
        volumes,
    };

    serde_yaml::to_string(&file)
}
