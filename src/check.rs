//! Structural checks over dependency graphs.
//!
//! Graphs are given as a map from node id to the ids it depends on ("A
//! after B" means A depends on B). Both workflow steps and agent
//! dependencies are checked with the same routines. Ordered maps keep every
//! result reproducible.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// node id -> ids it depends on
pub type DependencyGraph = BTreeMap<String, Vec<String>>;

/// A reference to a non-existent node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanRef {
    pub from: String,
    pub to: String,
}

/// Check for cycles in the dependency relation.
///
/// Each reported cycle lists its members in dependency order, starting and
/// ending at the same node.
pub fn check_cycles(graph: &DependencyGraph) -> Vec<Vec<String>> {
    let mut cycles = Vec::new();
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for node_id in graph.keys() {
        if !visited.contains(node_id) {
            find_cycles(
                graph,
                node_id,
                &mut visited,
                &mut rec_stack,
                &mut path,
                &mut cycles,
            );
        }
    }

    cycles
}

fn find_cycles(
    graph: &DependencyGraph,
    node_id: &str,
    visited: &mut HashSet<String>,
    rec_stack: &mut HashSet<String>,
    path: &mut Vec<String>,
    cycles: &mut Vec<Vec<String>>,
) {
    visited.insert(node_id.to_string());
    rec_stack.insert(node_id.to_string());
    path.push(node_id.to_string());

    if let Some(deps) = graph.get(node_id) {
        for dep_id in deps {
            if !graph.contains_key(dep_id) {
                continue;
            }
            if !visited.contains(dep_id) {
                find_cycles(graph, dep_id, visited, rec_stack, path, cycles);
            } else if rec_stack.contains(dep_id) {
                // Found a cycle - extract it from the path
                if let Some(pos) = path.iter().position(|x| x == dep_id) {
                    let mut cycle: Vec<String> = path[pos..].to_vec();
                    cycle.push(dep_id.clone());
                    cycles.push(cycle);
                }
            }
        }
    }

    path.pop();
    rec_stack.remove(node_id);
}

/// Check for references to nodes that are not in the graph
pub fn check_orphans(graph: &DependencyGraph) -> Vec<OrphanRef> {
    let mut orphans = Vec::new();

    for (node_id, deps) in graph {
        for dep in deps {
            if !graph.contains_key(dep) {
                orphans.push(OrphanRef {
                    from: node_id.clone(),
                    to: dep.clone(),
                });
            }
        }
    }

    orphans
}

/// Group nodes into layers: every node lands in the first layer after all
/// of its dependencies. Nodes inside a layer are sorted by id.
///
/// Returns `None` if the graph has a cycle or a dangling reference.
pub fn layers(graph: &DependencyGraph) -> Option<Vec<Vec<String>>> {
    let mut placed: HashSet<&str> = HashSet::new();
    let mut remaining: BTreeSet<&str> = graph.keys().map(|k| k.as_str()).collect();
    let mut result = Vec::new();

    while !remaining.is_empty() {
        let layer: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|id| {
                graph[*id]
                    .iter()
                    .all(|dep| placed.contains(dep.as_str()))
            })
            .collect();

        if layer.is_empty() {
            return None;
        }

        for id in &layer {
            remaining.remove(id);
        }
        placed.extend(layer.iter().copied());
        result.push(layer.into_iter().map(String::from).collect());
    }

    Some(result)
}

/// All nodes that `node_id` depends on, directly or transitively.
pub fn ancestors(graph: &DependencyGraph, node_id: &str) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<&str> = vec![node_id];
    while let Some(id) = stack.pop() {
        if let Some(deps) = graph.get(id) {
            for dep in deps {
                if seen.insert(dep.clone()) {
                    stack.push(dep);
                }
            }
        }
    }
    seen
}
