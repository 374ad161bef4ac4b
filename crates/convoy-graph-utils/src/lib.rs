#![deny(clippy::all)]

//! Graph helpers shared by the package graph and the task engine: cycle
//! validation with readable errors, transitive closures, and a concurrent
//! topological walker.

mod walker;

use std::collections::HashSet;

use itertools::Itertools;
use petgraph::{graph::NodeIndex, prelude::*, visit::depth_first_search};
use thiserror::Error;
pub use walker::{WalkMessage, Walker};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cyclic dependency detected:\n{0}")]
    CyclicDependencies(String),
    #[error("{0} depends on itself")]
    SelfDependency(String),
}

/// Verifies the graph is a DAG. All strongly connected components with more
/// than one member are reported together, as are self-edges.
pub fn validate_graph<N: std::fmt::Display, E>(graph: &Graph<N, E>) -> Result<(), Error> {
    // This is equivalent to AcyclicGraph.Validate()
    let cycles_lines = petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .filter(|cycle| cycle.len() > 1)
        .map(|cycle| {
            let workspaces = cycle
                .into_iter()
                .map(|id| graph.node_weight(id).expect("node in graph"));
            format!("\t{}", workspaces.format(", "))
        })
        .join("\n");

    if !cycles_lines.is_empty() {
        return Err(Error::CyclicDependencies(cycles_lines));
    }

    for edge in graph.edge_references() {
        if edge.source() == edge.target() {
            return Err(Error::SelfDependency(
                graph
                    .node_weight(edge.source())
                    .expect("edge source in graph")
                    .to_string(),
            ));
        }
    }

    Ok(())
}

/// Every node reachable from `starting` in the given direction, including
/// the starting nodes themselves.
pub fn transitive_closure<N: std::hash::Hash + Eq, E, I: IntoIterator<Item = NodeIndex>>(
    graph: &Graph<N, E>,
    starting: I,
    direction: petgraph::Direction,
) -> HashSet<&N> {
    let mut visited = HashSet::new();
    let visitor = |event| {
        if let petgraph::visit::DfsEvent::Discover(n, _) = event {
            visited.insert(n);
        }
        petgraph::visit::Control::<()>::Continue
    };

    match direction {
        petgraph::Direction::Outgoing => {
            depth_first_search(graph, starting, visitor);
        }
        petgraph::Direction::Incoming => {
            depth_first_search(petgraph::visit::Reversed(graph), starting, visitor);
        }
    }

    visited
        .into_iter()
        .map(|index| graph.node_weight(index).expect("visited node in graph"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validates_dag() {
        let mut graph: Graph<&str, ()> = Graph::new();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        graph.add_edge(a, b, ());
        assert!(validate_graph(&graph).is_ok());
    }

    #[test]
    fn test_detects_cycle() {
        let mut graph: Graph<&str, ()> = Graph::new();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        let c = graph.add_node("c");
        graph.add_edge(a, b, ());
        graph.add_edge(b, c, ());
        graph.add_edge(c, a, ());
        let err = validate_graph(&graph).unwrap_err();
        let message = err.to_string();
        assert!(message.contains('a') && message.contains('b') && message.contains('c'));
    }

    #[test]
    fn test_detects_self_edge() {
        let mut graph: Graph<&str, ()> = Graph::new();
        let a = graph.add_node("a");
        graph.add_edge(a, a, ());
        assert!(matches!(
            validate_graph(&graph),
            Err(Error::SelfDependency(node)) if node == "a"
        ));
    }

    #[test]
    fn test_transitive_closure() {
        let mut graph: Graph<&str, ()> = Graph::new();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        let c = graph.add_node("c");
        let d = graph.add_node("d");
        graph.add_edge(a, b, ());
        graph.add_edge(b, c, ());
        graph.add_edge(d, c, ());

        let downstream = transitive_closure(&graph, Some(a), petgraph::Direction::Outgoing);
        assert_eq!(downstream, ["a", "b", "c"].iter().collect());

        let upstream = transitive_closure(&graph, Some(c), petgraph::Direction::Incoming);
        assert_eq!(upstream, ["a", "b", "c", "d"].iter().collect());
    }
}
