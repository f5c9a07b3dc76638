//! Dependency ordering over a [`ServiceGraph`].
//!
//! All functions are pure: they read the graph and return orders or errors.
use std::collections::{BTreeSet, HashSet};

use crate::{config::ServiceGraph, error::ResolveError};

/// Returns `name` and its transitive dependencies, dependencies first.
///
/// Depth-first, post-order: a service is appended only after everything it
/// depends on. Revisiting a service still on the recursion stack is a cycle,
/// reported at that service.
pub fn resolve(graph: &ServiceGraph, name: &str) -> Result<Vec<String>, ResolveError> {
    let mut order = Vec::new();
    let mut resolved = HashSet::new();
    let mut in_progress = HashSet::new();
    visit(graph, name, &mut resolved, &mut in_progress, &mut order)?;
    Ok(order)
}

/// Resolves each root independently and merges the orders, keeping the first
/// occurrence of every service.
pub fn resolve_many<S: AsRef<str>>(
    graph: &ServiceGraph,
    names: &[S],
) -> Result<Vec<String>, ResolveError> {
    let mut merged = Vec::new();
    let mut placed = HashSet::new();

    for name in names {
        for service in resolve(graph, name.as_ref())? {
            if placed.insert(service.clone()) {
                merged.push(service);
            }
        }
    }

    Ok(merged)
}

fn visit(
    graph: &ServiceGraph,
    name: &str,
    resolved: &mut HashSet<String>,
    in_progress: &mut HashSet<String>,
    order: &mut Vec<String>,
) -> Result<(), ResolveError> {
    if resolved.contains(name) {
        return Ok(());
    }
    if in_progress.contains(name) {
        return Err(ResolveError::Cycle(name.to_string()));
    }

    let definition = graph
        .get(name)
        .ok_or_else(|| ResolveError::UnknownService(name.to_string()))?;

    in_progress.insert(name.to_string());
    for dep in &definition.depends_on {
        visit(graph, dep, resolved, in_progress, order)?;
    }
    in_progress.remove(name);

    resolved.insert(name.to_string());
    order.push(name.to_string());
    Ok(())
}

/// Returns `name` plus every service that depends on it directly or
/// transitively.
pub fn dependents(graph: &ServiceGraph, name: &str) -> Result<BTreeSet<String>, ResolveError> {
    if !graph.contains(name) {
        return Err(ResolveError::UnknownService(name.to_string()));
    }

    let mut set = BTreeSet::from([name.to_string()]);
    loop {
        let additions: Vec<String> = graph
            .iter()
            .filter(|service| !set.contains(&service.name))
            .filter(|service| service.depends_on.iter().any(|dep| set.contains(dep)))
            .map(|service| service.name.clone())
            .collect();

        if additions.is_empty() {
            return Ok(set);
        }
        set.extend(additions);
    }
}

/// Order in which to stop `names` and everything depending on them:
/// dependents first, then what they depend on.
pub fn stop_order<S: AsRef<str>>(
    graph: &ServiceGraph,
    names: &[S],
) -> Result<Vec<String>, ResolveError> {
    let mut subset = BTreeSet::new();
    for name in names {
        subset.extend(dependents(graph, name.as_ref())?);
    }

    let roots: Vec<&String> = subset.iter().collect();
    let mut order: Vec<String> = resolve_many(graph, &roots)?
        .into_iter()
        .filter(|service| subset.contains(service))
        .collect();
    order.reverse();
    Ok(order)
}
