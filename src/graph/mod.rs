//! Resource graph module.
//!
//! Builds the typed dependency graph of a description and resolves
//! reference expressions against known outputs.

mod builder;
mod resolve;

pub use builder::{DependencyEdge, EdgeReason, GraphBuilder, ResourceGraph, ResourceNode};
pub use resolve::{resolve_node, Lookup, OutputSource, ResolvedAttributes, ResolvedValue};
