//! Instance environment merging and reference resolution.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::blueprint::{BlueprintRole, RoleName};
use crate::env::{interpolate, references, ProjectEnv};

/// `${service:<role>}`
static SERVICE_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{service:([a-z]+)\}").expect("valid service regex"));

/// Merge environment layers for one role.
///
/// Later layers win: role defaults, project `.env`, flat overrides, role
/// overrides. The app role takes every `.env` and flat key; other roles only
/// take keys their defaults declare.
pub(crate) fn merge(
    role: &BlueprintRole,
    project_env: &ProjectEnv,
    flat: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = role.spec.env.clone();
    let takes_all = role.name() == RoleName::App;

    for layer in [project_env.values(), flat] {
        for (key, value) in layer {
            if takes_all || role.spec.env.contains_key(key) {
                env.insert(key.clone(), value.clone());
            }
        }
    }
    env.extend(role.env_overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// Resolves templates in merged environments.
pub(crate) struct EnvResolver<'a> {
    /// Instance name per selected role
    pub names: &'a BTreeMap<RoleName, String>,

    /// Project `.env` values, the fallback for `${VAR}`
    pub project_env: &'a ProjectEnv,
}

impl EnvResolver<'_> {
    /// Resolve `${service:role}`, role-name hosts and `${VAR}` references.
    ///
    /// Problems are appended to `warnings` and never fail synthesis.
    pub fn resolve(
        &self,
        instance: &str,
        raw: &BTreeMap<String, String>,
        warnings: &mut Vec<String>,
    ) -> BTreeMap<String, String> {
        let mut linked = BTreeMap::new();
        for (key, value) in raw {
            linked.insert(key.clone(), self.link(instance, key, value, warnings));
        }

        let mut done = BTreeMap::new();
        for key in linked.keys() {
            let mut visiting = Vec::new();
            self.expand(instance, key, &linked, &mut done, &mut visiting, warnings);
        }
        done
    }

    fn link(&self, instance: &str, key: &str, value: &str, warnings: &mut Vec<String>) -> String {
        // DB_HOST=db in a project's .env means the db service
        if key.ends_with("_HOST") {
            if let Some(name) = value.parse::<RoleName>().ok().and_then(|r| self.names.get(&r)) {
                return name.clone();
            }
        }

        SERVICE_REF
            .replace_all(value, |caps: &regex::Captures<'_>| {
                let role = &caps[1];
                match role.parse::<RoleName>().ok().and_then(|r| self.names.get(&r)) {
                    Some(name) => name.clone(),
                    None => {
                        warnings.push(format!(
                            "{instance}: {key} references service '{role}' which is not part of the stack"
                        ));
                        String::new()
                    }
                }
            })
            .into_owned()
    }

    fn expand(
        &self,
        instance: &str,
        key: &str,
        linked: &BTreeMap<String, String>,
        done: &mut BTreeMap<String, String>,
        visiting: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> String {
        if let Some(value) = done.get(key) {
            return value.clone();
        }
        let Some(value) = linked.get(key) else {
            return String::new();
        };

        visiting.push(key.to_string());
        let mut resolved_refs = BTreeMap::new();
        for name in references(value) {
            // Self and cyclic references fall through to the project .env
            if linked.contains_key(&name) && !visiting.contains(&name) {
                let resolved = self.expand(instance, &name, linked, done, visiting, warnings);
                resolved_refs.insert(name, resolved);
            }
        }
        visiting.pop();

        let out = interpolate(value, |name| {
            resolved_refs
                .get(name)
                .cloned()
                .or_else(|| self.project_env.get(name).map(str::to_string))
        });
        for missing in &out.missing {
            warnings.push(format!("{instance}: {key} references undefined variable {missing}"));
        }

        done.insert(key.to_string(), out.value.clone());
        out.value
    }
}
