//! Dependency resolver: orders build types into an execution plan.

use std::collections::HashMap;

use foreman_core::descriptor::{BuildType, Descriptor};
use foreman_core::{Error, ExecutionPlan, Result};

/// Compute the execution plan for a whole descriptor.
pub fn resolve(descriptor: &Descriptor) -> Result<ExecutionPlan> {
    resolve_subset(descriptor, None)
}

/// Compute the execution plan restricted to the given targets and their
/// transitive dependencies. `None` selects every build type.
///
/// Ordering is a stable topological sort: whenever several build types are
/// ready, the one declared first comes first. A dependency cycle yields
/// [`Error::CycleDetected`] naming all members of the cycle.
pub fn resolve_subset(descriptor: &Descriptor, targets: Option<&[String]>) -> Result<ExecutionPlan> {
    let scoped = descriptor.build_types();
    let build_types: Vec<&BuildType> = scoped.iter().map(|s| s.build_type).collect();
    let index: HashMap<&str, usize> = build_types
        .iter()
        .enumerate()
        .map(|(i, bt)| (bt.name.as_str(), i))
        .collect();

    // Dependency edges as indices, validated up front.
    let mut deps: Vec<Vec<usize>> = Vec::with_capacity(build_types.len());
    for bt in &build_types {
        let mut edges = Vec::with_capacity(bt.depends_on.len());
        for dep in &bt.depends_on {
            let j = *index.get(dep.as_str()).ok_or_else(|| {
                Error::Internal(format!(
                    "build type '{}' depends on unknown build type '{}'",
                    bt.name, dep
                ))
            })?;
            edges.push(j);
        }
        deps.push(edges);
    }

    // Node set: everything, or the targets plus their transitive deps.
    let mut selected = vec![targets.is_none(); build_types.len()];
    if let Some(targets) = targets {
        let mut stack = Vec::new();
        for target in targets {
            let i = *index.get(target.as_str()).ok_or_else(|| {
                Error::Internal(format!("unknown build type '{}'", target))
            })?;
            stack.push(i);
        }
        while let Some(i) = stack.pop() {
            if !selected[i] {
                selected[i] = true;
                stack.extend(deps[i].iter().copied());
            }
        }
    }

    // Kahn's algorithm with a declaration-order scan, so ties break by
    // declaration order.
    let mut indegree: Vec<usize> = (0..build_types.len())
        .map(|i| {
            if selected[i] {
                deps[i].iter().filter(|&&j| selected[j]).count()
            } else {
                0
            }
        })
        .collect();
    let mut emitted = vec![false; build_types.len()];
    let total = selected.iter().filter(|&&s| s).count();
    let mut order = Vec::with_capacity(total);

    while order.len() < total {
        let next = (0..build_types.len())
            .find(|&i| selected[i] && !emitted[i] && indegree[i] == 0);
        let Some(i) = next else {
            let members = find_cycle(&build_types, &deps, &selected, &emitted);
            return Err(Error::CycleDetected { members });
        };
        emitted[i] = true;
        order.push(build_types[i].name.clone());
        for (k, k_deps) in deps.iter().enumerate() {
            if selected[k] && !emitted[k] && k_deps.contains(&i) {
                indegree[k] -= k_deps.iter().filter(|&&j| j == i).count();
            }
        }
    }

    let plan_deps: HashMap<String, Vec<String>> = build_types
        .iter()
        .enumerate()
        .filter(|(i, _)| selected[*i])
        .map(|(_, bt)| (bt.name.clone(), bt.depends_on.clone()))
        .collect();

    Ok(ExecutionPlan::new(order, plan_deps))
}

/// Extract the members of one dependency cycle among the unemitted nodes.
fn find_cycle(
    build_types: &[&BuildType],
    deps: &[Vec<usize>],
    selected: &[bool],
    emitted: &[bool],
) -> Vec<String> {
    // 0 = unvisited, 1 = on the current path, 2 = done
    let mut state = vec![0u8; build_types.len()];
    let mut path = Vec::new();

    for start in 0..build_types.len() {
        if selected[start] && !emitted[start] && state[start] == 0 {
            if let Some(members) = visit(start, deps, &mut state, &mut path) {
                return members
                    .into_iter()
                    .map(|i| build_types[i].name.clone())
                    .collect();
            }
        }
    }
    Vec::new()
}

fn visit(
    node: usize,
    deps: &[Vec<usize>],
    state: &mut Vec<u8>,
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    state[node] = 1;
    path.push(node);

    for &dep in &deps[node] {
        if state[dep] == 1 {
            let pos = path.iter().position(|&n| n == dep).unwrap_or(0);
            return Some(path[pos..].to_vec());
        }
        if state[dep] == 0 {
            if let Some(cycle) = visit(dep, deps, state, path) {
                return Some(cycle);
            }
        }
    }

    path.pop();
    state[node] = 2;
    None
}
