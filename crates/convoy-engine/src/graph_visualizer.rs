use std::io::Write;

use petgraph::visit::EdgeRef;

use crate::{Built, Engine, TaskNode};

/// Text formats for dumping the task graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Dot,
    Mermaid,
}

impl Engine<Built> {
    /// Writes the task graph in the requested format. Edges read
    /// "dependent → dependency".
    pub fn write_graph(
        &self,
        mut writer: impl Write,
        format: GraphFormat,
    ) -> Result<(), std::io::Error> {
        let graph = &self.task_graph;
        let mut edges: Vec<(String, String)> = graph
            .edge_references()
            .map(|edge| {
                (
                    graph[edge.source()].to_string(),
                    graph[edge.target()].to_string(),
                )
            })
            .collect();
        edges.sort();

        match format {
            GraphFormat::Dot => {
                writeln!(writer, "digraph {{")?;
                for (source, target) in edges {
                    writeln!(writer, "\t\"{source}\" -> \"{target}\"")?;
                }
                writeln!(writer, "}}")?;
            }
            GraphFormat::Mermaid => {
                writeln!(writer, "graph TD")?;
                for (source, target) in edges {
                    writeln!(writer, "\t{} --> {}", mermaid_id(&source), mermaid_id(&target))?;
                }
            }
        }
        Ok(())
    }
}

fn mermaid_id(node: &str) -> String {
    // Mermaid node ids cannot carry `#`
    format!("{}[\"{node}\"]", node.replace(['#', '/'], "_"))
}

impl Engine<Built> {
    pub fn tasks_sorted(&self) -> Vec<String> {
        let mut tasks: Vec<_> = self
            .tasks()
            .filter_map(|node| match node {
                TaskNode::Task(id) => Some(id.to_string()),
                TaskNode::Root => None,
            })
            .collect();
        tasks.sort();
        tasks
    }
}
