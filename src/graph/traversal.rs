//! Breadth-first neighbor traversal shared by the repository implementations.

use std::collections::{HashSet, VecDeque};

use crate::error::Result;

/// Collect entity ids reachable from `start` within `max_depth` hops.
///
/// `adjacent` returns the ids directly connected to a node (both edge
/// directions, already filtered by relationship type). The start node is
/// never part of the result; ids appear in discovery order.
pub(crate) fn breadth_first_neighbors<F>(start: &str, max_depth: usize, mut adjacent: F) -> Result<Vec<String>>
where
    F: FnMut(&str) -> Result<Vec<String>>,
{
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    let mut result = Vec::new();

    queue.push_back((start.to_string(), 0));
    visited.insert(start.to_string());

    while let Some((entity, depth)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }

        for neighbor in adjacent(&entity)? {
            if visited.insert(neighbor.clone()) {
                queue.push_back((neighbor.clone(), depth + 1));
                result.push(neighbor);
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// a - b - c, a - d (undirected)
    fn adjacency() -> HashMap<&'static str, Vec<&'static str>> {
        let mut adj = HashMap::new();
        adj.insert("a", vec!["b", "d"]);
        adj.insert("b", vec!["a", "c"]);
        adj.insert("c", vec!["b"]);
        adj.insert("d", vec!["a"]);
        adj
    }

    fn run(start: &str, depth: usize) -> Vec<String> {
        let adj = adjacency();
        breadth_first_neighbors(start, depth, |node| {
            Ok(adj
                .get(node)
                .map(|n| n.iter().map(|s| s.to_string()).collect())
                .unwrap_or_default())
        })
        .unwrap()
    }

    #[test]
    fn test_traverse_single_hop() {
        assert_eq!(run("a", 1), vec!["b", "d"]);
    }

    #[test]
    fn test_traverse_multi_hop_excludes_start() {
        let found = run("a", 3);
        assert_eq!(found.len(), 3);
        assert!(!found.contains(&"a".to_string()));
        assert!(found.contains(&"c".to_string()));
    }

    #[test]
    fn test_traverse_depth_zero() {
        assert!(run("a", 0).is_empty());
    }

    #[test]
    fn test_traverse_unknown_start() {
        assert!(run("zzz", 2).is_empty());
    }
}
