#![deny(clippy::all)]

//! The package graph consumed by the task engine.
//!
//! Workspace discovery and lockfile analysis happen upstream; this crate
//! models their *result*: a set of packages with manifests, directories,
//! internal dependency edges, and precomputed external dependency hashes.

pub mod package_graph;
pub mod package_json;

pub use package_graph::{PackageGraph, PackageGraphBuilder, PackageInfo, PackageName, PackageNode};
pub use package_json::PackageJson;
