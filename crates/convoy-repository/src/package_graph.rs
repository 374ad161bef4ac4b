use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use convoypath::{AnchoredSystemPath, AnchoredSystemPathBuf};
use petgraph::prelude::*;
use serde::Serialize;

use crate::package_json::PackageJson;

pub const ROOT_PKG_NAME: &str = "//";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("package graph: {0}")]
    InvalidGraph(#[from] convoy_graph_utils::Error),
    #[error("duplicate package name: {0}")]
    DuplicatePackage(PackageName),
}

/// A workspace member name. The root package is spelled `//` to keep it
/// distinct from any real package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PackageName {
    Root,
    Other(String),
}

impl PackageName {
    pub fn as_str(&self) -> &str {
        match self {
            PackageName::Root => ROOT_PKG_NAME,
            PackageName::Other(name) => name,
        }
    }
}

impl From<&str> for PackageName {
    fn from(value: &str) -> Self {
        if value == ROOT_PKG_NAME {
            PackageName::Root
        } else {
            PackageName::Other(value.to_string())
        }
    }
}

impl From<String> for PackageName {
    fn from(value: String) -> Self {
        if value == ROOT_PKG_NAME {
            PackageName::Root
        } else {
            PackageName::Other(value)
        }
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PackageName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A node in the workspace dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PackageNode {
    Root,
    Workspace(PackageName),
}

impl PackageNode {
    pub fn as_package_name(&self) -> PackageName {
        match self {
            PackageNode::Root => PackageName::Root,
            PackageNode::Workspace(name) => name.clone(),
        }
    }
}

impl fmt::Display for PackageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageNode::Root => f.write_str("___ROOT___"),
            PackageNode::Workspace(name) => name.fmt(f),
        }
    }
}

/// Everything the engine needs to know about one package.
#[derive(Debug, Clone, Default)]
pub struct PackageInfo {
    pub package_json: PackageJson,
    /// Repo-root-anchored directory of the package.
    pub package_path: AnchoredSystemPathBuf,
    /// Fingerprint of the package's external dependency closure, computed
    /// upstream from the lockfile.
    pub external_deps_hash: String,
    /// Framework label supplied by the caller. Convoy reports it; it never
    /// detects one.
    pub framework: Option<String>,
}

impl PackageInfo {
    pub fn package_path(&self) -> &AnchoredSystemPath {
        &self.package_path
    }

    pub fn get_external_deps_hash(&self) -> String {
        self.external_deps_hash.clone()
    }
}

/// The immutable package graph a run executes against: package metadata
/// plus internal dependency edges. Edges point from dependent to dependency.
pub struct PackageGraph {
    workspace_graph: Graph<PackageNode, ()>,
    node_lookup: HashMap<PackageNode, NodeIndex>,
    packages: HashMap<PackageName, PackageInfo>,
}

impl PackageGraph {
    pub fn builder(root_package_json: PackageJson) -> PackageGraphBuilder {
        PackageGraphBuilder::new(root_package_json)
    }

    pub fn packages(&self) -> impl Iterator<Item = (&PackageName, &PackageInfo)> {
        self.packages.iter()
    }

    pub fn len(&self) -> usize {
        // The root node is bookkeeping, not a package
        self.packages.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn package_info(&self, name: &PackageName) -> Option<&PackageInfo> {
        self.packages.get(name)
    }

    pub fn package_json(&self, name: &PackageName) -> Option<&PackageJson> {
        self.packages.get(name).map(|info| &info.package_json)
    }

    pub fn package_dir(&self, name: &PackageName) -> Option<&AnchoredSystemPath> {
        self.packages.get(name).map(|info| info.package_path())
    }

    pub fn root_external_deps_hash(&self) -> String {
        self.packages
            .get(&PackageName::Root)
            .map(|info| info.get_external_deps_hash())
            .unwrap_or_default()
    }

    /// Direct internal dependencies of `node`.
    pub fn immediate_dependencies(&self, node: &PackageNode) -> Option<HashSet<PackageNode>> {
        let index = self.node_lookup.get(node)?;
        Some(
            self.workspace_graph
                .neighbors_directed(*index, petgraph::Direction::Outgoing)
                .map(|index| self.workspace_graph[index].clone())
                .filter(|node| !matches!(node, PackageNode::Root))
                .collect(),
        )
    }

    /// Direct internal dependents of `node` (packages that depend on it).
    pub fn immediate_dependents(&self, node: &PackageNode) -> Option<HashSet<PackageNode>> {
        let index = self.node_lookup.get(node)?;
        Some(
            self.workspace_graph
                .neighbors_directed(*index, petgraph::Direction::Incoming)
                .map(|index| self.workspace_graph[index].clone())
                .filter(|node| !matches!(node, PackageNode::Root))
                .collect(),
        )
    }
}

/// Assembles a validated [`PackageGraph`] from explicit package entries.
/// Internal edges are derived from manifest dependencies whose names match
/// workspace members.
pub struct PackageGraphBuilder {
    root_package_json: PackageJson,
    root_external_deps_hash: String,
    packages: Vec<(PackageName, PackageInfo)>,
}

impl PackageGraphBuilder {
    fn new(root_package_json: PackageJson) -> Self {
        Self {
            root_package_json,
            root_external_deps_hash: String::new(),
            packages: Vec::new(),
        }
    }

    pub fn with_root_external_deps_hash(mut self, hash: impl Into<String>) -> Self {
        self.root_external_deps_hash = hash.into();
        self
    }

    pub fn with_package(
        mut self,
        name: impl Into<PackageName>,
        package_json: PackageJson,
        package_path: AnchoredSystemPathBuf,
        external_deps_hash: impl Into<String>,
    ) -> Self {
        self.packages.push((
            name.into(),
            PackageInfo {
                package_json,
                package_path,
                external_deps_hash: external_deps_hash.into(),
                framework: None,
            },
        ));
        self
    }

    /// Attaches a framework label to the most recently added package.
    pub fn with_framework(mut self, label: impl Into<String>) -> Self {
        if let Some((_, info)) = self.packages.last_mut() {
            info.framework = Some(label.into());
        }
        self
    }

    pub fn build(self) -> Result<PackageGraph, Error> {
        let Self {
            root_package_json,
            root_external_deps_hash,
            packages,
        } = self;

        let mut graph = Graph::new();
        let mut node_lookup = HashMap::new();
        let mut package_infos: HashMap<PackageName, PackageInfo> = HashMap::new();

        let root_index = graph.add_node(PackageNode::Root);
        node_lookup.insert(PackageNode::Root, root_index);

        let root_workspace = PackageNode::Workspace(PackageName::Root);
        let root_workspace_index = graph.add_node(root_workspace.clone());
        node_lookup.insert(root_workspace, root_workspace_index);
        graph.add_edge(root_workspace_index, root_index, ());
        package_infos.insert(
            PackageName::Root,
            PackageInfo {
                package_json: root_package_json,
                package_path: AnchoredSystemPathBuf::default(),
                external_deps_hash: root_external_deps_hash,
                framework: None,
            },
        );

        for (name, info) in &packages {
            if package_infos.contains_key(name) {
                return Err(Error::DuplicatePackage(name.clone()));
            }
            let node = PackageNode::Workspace(name.clone());
            let index = graph.add_node(node.clone());
            node_lookup.insert(node, index);
            package_infos.insert(name.clone(), info.clone());
        }

        // Dependency edges: any manifest dependency whose name matches a
        // workspace member is internal.
        for (name, info) in &packages {
            let from = node_lookup[&PackageNode::Workspace(name.clone())];
            let mut has_internal_dep = false;
            for dependency in info.package_json.all_dependencies() {
                let dependency_name = PackageName::from(dependency.as_str());
                if dependency_name == *name {
                    continue;
                }
                if let Some(to) = node_lookup.get(&PackageNode::Workspace(dependency_name)) {
                    graph.add_edge(from, *to, ());
                    has_internal_dep = true;
                }
            }
            if !has_internal_dep {
                graph.add_edge(from, root_index, ());
            }
        }

        convoy_graph_utils::validate_graph(&graph)?;

        Ok(PackageGraph {
            workspace_graph: graph,
            node_lookup,
            packages: package_infos,
        })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use pretty_assertions::assert_eq;

    use super::*;

    fn package_json(name: &str, deps: &[&str]) -> PackageJson {
        PackageJson {
            name: Some(name.to_string()),
            dependencies: Some(
                deps.iter()
                    .map(|dep| (dep.to_string(), "workspace:*".to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn test_graph() -> Result<PackageGraph> {
        Ok(PackageGraph::builder(PackageJson::default())
            .with_package(
                "app",
                package_json("app", &["util", "lodash"]),
                AnchoredSystemPathBuf::from_raw("apps/app".replace('/', std::path::MAIN_SEPARATOR_STR))?,
                "appdeps",
            )
            .with_package(
                "util",
                package_json("util", &[]),
                AnchoredSystemPathBuf::from_raw("packages/util".replace('/', std::path::MAIN_SEPARATOR_STR))?,
                "utildeps",
            )
            .build()?)
    }

    #[test]
    fn test_internal_edges_only_for_members() -> Result<()> {
        let graph = test_graph()?;
        let deps = graph
            .immediate_dependencies(&PackageNode::Workspace(PackageName::from("app")))
            .unwrap();
        assert_eq!(
            deps,
            [PackageNode::Workspace(PackageName::from("util"))]
                .into_iter()
                .collect()
        );
        Ok(())
    }

    #[test]
    fn test_dependents() -> Result<()> {
        let graph = test_graph()?;
        let dependents = graph
            .immediate_dependents(&PackageNode::Workspace(PackageName::from("util")))
            .unwrap();
        assert_eq!(
            dependents,
            [PackageNode::Workspace(PackageName::from("app"))]
                .into_iter()
                .collect()
        );
        Ok(())
    }

    #[test]
    fn test_cycle_rejected() {
        let result = PackageGraph::builder(PackageJson::default())
            .with_package(
                "a",
                package_json("a", &["b"]),
                AnchoredSystemPathBuf::from_raw("a").unwrap(),
                "",
            )
            .with_package(
                "b",
                package_json("b", &["a"]),
                AnchoredSystemPathBuf::from_raw("b").unwrap(),
                "",
            )
            .build();
        assert!(matches!(result, Err(Error::InvalidGraph(_))));
    }

    #[test]
    fn test_duplicate_package_rejected() {
        let result = PackageGraph::builder(PackageJson::default())
            .with_package(
                "a",
                PackageJson::default(),
                AnchoredSystemPathBuf::from_raw("a").unwrap(),
                "",
            )
            .with_package(
                "a",
                PackageJson::default(),
                AnchoredSystemPathBuf::from_raw("a2").unwrap(),
                "",
            )
            .build();
        assert!(matches!(result, Err(Error::DuplicatePackage(_))));
    }

    #[test]
    fn test_root_name_round_trip() {
        assert_eq!(PackageName::from("//"), PackageName::Root);
        assert_eq!(PackageName::Root.to_string(), "//");
    }
}
