//! Dependency ordering of blueprint roles.

use std::collections::BTreeSet;

use crate::blueprint::BlueprintRole;
use crate::error::SynthesisError;

/// Order roles so every role comes after its dependencies.
///
/// Kahn's algorithm; the ready set is drained lowest declaration index first,
/// so the result is deterministic. Returns indices into `roles`.
pub(crate) fn order(project: &str, roles: &[BlueprintRole]) -> Result<Vec<usize>, SynthesisError> {
    let mut in_degree = vec![0usize; roles.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); roles.len()];

    for (idx, role) in roles.iter().enumerate() {
        for dep in role.spec.dependencies() {
            let Some(dep_idx) = roles.iter().position(|r| r.name() == dep) else {
                // Not selected; the resolver already rejected missing hard deps
                continue;
            };
            // dep -> role edge
            dependents[dep_idx].push(idx);
            in_degree[idx] += 1;
        }
    }

    let mut ready: BTreeSet<usize> =
        in_degree.iter().enumerate().filter(|(_, &d)| d == 0).map(|(i, _)| i).collect();
    let mut result = Vec::with_capacity(roles.len());

    while let Some(node) = ready.pop_first() {
        result.push(node);
        for &next in &dependents[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if result.len() != roles.len() {
        let stuck = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d > 0)
            .map(|(i, _)| roles[i].name().to_string())
            .collect();
        return Err(SynthesisError::CyclicDependency { project: project.to_string(), roles: stuck });
    }

    Ok(result)
}
