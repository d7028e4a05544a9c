//! Structural validation for DAG node lists.
//!
//! Checks run in a fixed order: emptiness, duplicate ids, dangling
//! dependency references, then cycles. Validation is a pure function over
//! its input and can be called from any number of threads.

use crate::error::DagError;
use crate::types::{DagNode, NodeId};
use std::collections::{HashMap, HashSet};

/// Validate a DAG node list.
///
/// # Errors
/// - [`DagError::EmptyGraph`] for an empty list.
/// - [`DagError::DuplicateNode`] if two nodes share an id.
/// - [`DagError::MissingDependency`] if a dependency id matches no node.
/// - [`DagError::CycleDetected`] if the dependency relation has a cycle.
pub fn validate(nodes: &[DagNode]) -> Result<(), DagError> {
    if nodes.is_empty() {
        return Err(DagError::EmptyGraph);
    }

    let mut graph: HashMap<&NodeId, &[NodeId]> = HashMap::with_capacity(nodes.len());
    for node in nodes {
        if graph.insert(&node.id, &node.dependencies).is_some() {
            return Err(DagError::DuplicateNode(node.id.clone()));
        }
    }

    for node in nodes {
        if let Some(dep) = node.dependencies.iter().find(|d| !graph.contains_key(d)) {
            return Err(DagError::MissingDependency(dep.clone()));
        }
    }

    let mut explored: HashSet<&NodeId> = HashSet::with_capacity(nodes.len());
    let mut on_path: HashSet<&NodeId> = HashSet::new();

    for node in nodes {
        if explored.contains(&node.id) {
            continue;
        }
        if has_cycle_from(&node.id, &graph, &mut on_path, &mut explored) {
            return Err(DagError::CycleDetected);
        }
    }

    Ok(())
}

/// Iterative depth-first walk along dependency edges starting at `start`.
///
/// Each stack frame holds a node and the index of the next dependency to
/// visit, so deep chains cannot overflow the call stack.
fn has_cycle_from<'a>(
    start: &'a NodeId,
    graph: &HashMap<&'a NodeId, &'a [NodeId]>,
    on_path: &mut HashSet<&'a NodeId>,
    explored: &mut HashSet<&'a NodeId>,
) -> bool {
    let mut stack: Vec<(&'a NodeId, usize)> = vec![(start, 0)];
    on_path.insert(start);

    while let Some((node, next)) = stack.last_mut() {
        let deps: &'a [NodeId] = graph[*node];
        if let Some(dep) = deps.get(*next) {
            *next += 1;
            if on_path.contains(dep) {
                return true;
            }
            if explored.contains(dep) {
                continue;
            }
            on_path.insert(dep);
            stack.push((dep, 0));
        } else {
            let node = *node;
            stack.pop();
            on_path.remove(node);
            explored.insert(node);
        }
    }

    false
}
