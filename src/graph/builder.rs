//! Resource graph construction.
//!
//! Turns the declared resources into nodes and infers a dependency edge for
//! every reference expression and every explicit `depends_on` entry. The
//! finished graph is guaranteed acyclic.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::config::{AttrExpr, LifecycleConfig, Reference, ResourceKey, ResourceSpec};
use crate::error::{ConfigError, ConvergeError, Result};

/// A resource as seen by the planner for one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    /// Identity.
    pub key: ResourceKey,
    /// Attribute expressions, references still unresolved.
    pub attributes: BTreeMap<String, AttrExpr>,
    /// Every reference found, with the attribute path that holds it.
    pub references: Vec<(String, Reference)>,
    /// Lifecycle options.
    pub lifecycle: LifecycleConfig,
}

/// Why a dependency edge exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeReason {
    /// An attribute references the target.
    Reference {
        /// Attribute path holding the reference.
        attribute: String,
    },
    /// Declared in `depends_on`.
    Explicit,
}

/// Edge meaning "`to` must exist before `from` can be created or updated".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    /// Index of the dependent node.
    pub from: usize,
    /// Index of the dependency node.
    pub to: usize,
    /// Origin of the edge.
    pub reason: EdgeReason,
}

/// Acyclic graph of resource nodes.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<ResourceNode>,
    edges: Vec<DependencyEdge>,
    index: HashMap<ResourceKey, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

/// Builder that validates references and acyclicity.
#[derive(Debug, Default)]
pub struct GraphBuilder;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

impl GraphBuilder {
    /// Creates a new builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds the dependency graph of the given resources.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateResource`, `InvalidReference`, `UnresolvedReference`
    /// or `CircularDependency` configuration errors.
    pub fn build(&self, resources: &[ResourceSpec]) -> Result<ResourceGraph> {
        let mut graph = ResourceGraph::default();

        for spec in resources {
            let key = spec.key();
            if graph.index.contains_key(&key) {
                return Err(ConfigError::DuplicateResource {
                    key: key.to_string(),
                }
                .into());
            }

            let mut references = Vec::new();
            for (attr, expr) in &spec.attributes {
                collect_references(expr, attr.clone(), &key, &mut references)?;
            }

            graph.index.insert(key.clone(), graph.nodes.len());
            graph.nodes.push(ResourceNode {
                key,
                attributes: spec.attributes.clone(),
                references,
                lifecycle: spec.lifecycle,
            });
        }

        for (from, spec) in resources.iter().enumerate() {
            let node_key = &graph.nodes[from].key;

            let mut edges = Vec::new();
            for (attribute, reference) in &graph.nodes[from].references {
                let to = graph.index.get(&reference.key).copied().ok_or_else(|| {
                    ConvergeError::Config(ConfigError::UnresolvedReference {
                        from: node_key.to_string(),
                        reference: reference.to_string(),
                    })
                })?;
                edges.push(DependencyEdge {
                    from,
                    to,
                    reason: EdgeReason::Reference {
                        attribute: attribute.clone(),
                    },
                });
            }

            for dep in &spec.depends_on {
                let dep_key = ResourceKey::parse(dep).map_err(|_| ConfigError::InvalidReference {
                    from: node_key.to_string(),
                    reference: dep.clone(),
                })?;
                let to = graph.index.get(&dep_key).copied().ok_or_else(|| {
                    ConvergeError::Config(ConfigError::UnresolvedReference {
                        from: node_key.to_string(),
                        reference: dep.clone(),
                    })
                })?;
                edges.push(DependencyEdge {
                    from,
                    to,
                    reason: EdgeReason::Explicit,
                });
            }

            graph.edges.extend(edges);
        }

        graph.dependencies = vec![Vec::new(); graph.nodes.len()];
        graph.dependents = vec![Vec::new(); graph.nodes.len()];
        for edge in &graph.edges {
            if !graph.dependencies[edge.from].contains(&edge.to) {
                graph.dependencies[edge.from].push(edge.to);
                graph.dependents[edge.to].push(edge.from);
            }
        }

        graph.check_acyclic()?;

        debug!(
            "Built resource graph: {} nodes, {} edges",
            graph.nodes.len(),
            graph.edges.len()
        );
        Ok(graph)
    }
}

/// Walks an expression, recording references with their attribute path.
fn collect_references(
    expr: &AttrExpr,
    path: String,
    owner: &ResourceKey,
    out: &mut Vec<(String, Reference)>,
) -> Result<()> {
    match expr {
        AttrExpr::Ref(r) => {
            let reference = Reference::parse(&r.target).map_err(|_| ConfigError::InvalidReference {
                from: owner.to_string(),
                reference: r.target.clone(),
            })?;
            out.push((path, reference));
        }
        AttrExpr::List(items) => {
            for (i, item) in items.iter().enumerate() {
                collect_references(item, format!("{path}[{i}]"), owner, out)?;
            }
        }
        AttrExpr::Map(entries) => {
            for (k, v) in entries {
                collect_references(v, format!("{path}.{k}"), owner, out)?;
            }
        }
        AttrExpr::Literal(_) => {}
    }
    Ok(())
}

impl ResourceGraph {
    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns all nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    /// Returns all edges.
    #[must_use]
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Looks up the index of a node.
    #[must_use]
    pub fn index_of(&self, key: &ResourceKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    /// Looks up a node by key.
    #[must_use]
    pub fn node(&self, key: &ResourceKey) -> Option<&ResourceNode> {
        self.index_of(key).map(|i| &self.nodes[i])
    }

    /// Returns true if the graph declares the key.
    #[must_use]
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.index.contains_key(key)
    }

    /// Returns the direct dependency keys of a node, sorted.
    #[must_use]
    pub fn dependency_keys(&self, key: &ResourceKey) -> Vec<ResourceKey> {
        let Some(idx) = self.index_of(key) else {
            return Vec::new();
        };
        let keys: BTreeSet<ResourceKey> = self.dependencies[idx]
            .iter()
            .map(|&d| self.nodes[d].key.clone())
            .collect();
        keys.into_iter().collect()
    }

    /// Returns the direct dependent keys of a node, sorted.
    #[must_use]
    pub fn dependent_keys(&self, key: &ResourceKey) -> Vec<ResourceKey> {
        let Some(idx) = self.index_of(key) else {
            return Vec::new();
        };
        let keys: BTreeSet<ResourceKey> = self.dependents[idx]
            .iter()
            .map(|&d| self.nodes[d].key.clone())
            .collect();
        keys.into_iter().collect()
    }

    /// Returns node indices with every dependency before its dependents.
    ///
    /// Ties are broken by key so the order is deterministic.
    #[must_use]
    pub fn topological_order(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<(ResourceKey, usize)> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| (self.nodes[i].key.clone(), i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(entry) = ready.pop_first() {
            let idx = entry.1;
            order.push(idx);
            for &dependent in &self.dependents[idx] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert((self.nodes[dependent].key.clone(), dependent));
                }
            }
        }
        order
    }

    /// Depth-first search with a recursion-stack check.
    fn check_acyclic(&self) -> Result<()> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut stack = Vec::new();

        let mut roots: Vec<usize> = (0..self.nodes.len()).collect();
        roots.sort_by(|a, b| self.nodes[*a].key.cmp(&self.nodes[*b].key));

        for root in roots {
            if marks[root] == Mark::Unvisited {
                self.visit(root, &mut marks, &mut stack)?;
            }
        }
        Ok(())
    }

    fn visit(&self, idx: usize, marks: &mut [Mark], stack: &mut Vec<usize>) -> Result<()> {
        marks[idx] = Mark::OnStack;
        stack.push(idx);

        for &dep in &self.dependencies[idx] {
            match marks[dep] {
                Mark::OnStack => {
                    let start = stack.iter().position(|&i| i == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..]
                        .iter()
                        .map(|&i| self.nodes[i].key.to_string())
                        .collect();
                    cycle.push(self.nodes[dep].key.to_string());
                    return Err(ConfigError::CircularDependency {
                        cycle: cycle.join(" -> "),
                    }
                    .into());
                }
                Mark::Unvisited => self.visit(dep, marks, stack)?,
                Mark::Done => {}
            }
        }

        stack.pop();
        marks[idx] = Mark::Done;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn resources(yaml: &str) -> Vec<ResourceSpec> {
        let full = format!("stack: {{ name: test }}\nresources:\n{yaml}");
        ConfigParser::new()
            .parse_yaml(&full, None)
            .expect("parse")
            .resources
    }

    #[test]
    fn test_edges_inferred_from_references() {
        let specs = resources(
            r"
  - { name: v, kind: aws_vpc, attributes: { cidr_block: 10.0.0.0/16 } }
  - { name: s1, kind: aws_subnet, attributes: { vpc_id: { ref: aws_vpc.v.id } } }
  - { name: s2, kind: aws_subnet, attributes: { vpc_id: { ref: aws_vpc.v } } }
",
        );
        let graph = GraphBuilder::new().build(&specs).expect("build");

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.edges().len(), 2);

        let vpc = ResourceKey::new("aws_vpc", "v");
        assert_eq!(
            graph.dependent_keys(&vpc),
            vec![
                ResourceKey::new("aws_subnet", "s1"),
                ResourceKey::new("aws_subnet", "s2")
            ]
        );
        assert_eq!(
            graph.dependency_keys(&ResourceKey::new("aws_subnet", "s1")),
            vec![vpc]
        );
    }

    #[test]
    fn test_nested_reference_paths() {
        let specs = resources(
            r"
  - { name: web, kind: aws_security_group, attributes: { name: web } }
  - name: nic
    kind: aws_network_interface
    attributes:
      security_groups: [ { ref: aws_security_group.web.id } ]
      tags: { owner: { ref: aws_security_group.web.name } }
",
        );
        let graph = GraphBuilder::new().build(&specs).expect("build");
        let nic = graph
            .node(&ResourceKey::new("aws_network_interface", "nic"))
            .expect("node");

        let paths: Vec<&str> = nic.references.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["security_groups[0]", "tags.owner"]);
        // two references to the same node collapse into one dependency
        assert_eq!(
            graph.dependency_keys(&nic.key),
            vec![ResourceKey::new("aws_security_group", "web")]
        );
    }

    #[test]
    fn test_explicit_depends_on() {
        let specs = resources(
            r"
  - { name: gw, kind: aws_internet_gateway, attributes: { tag: gw } }
  - name: web
    kind: aws_instance
    depends_on: [aws_internet_gateway.gw]
    attributes: { ami: ami-1 }
",
        );
        let graph = GraphBuilder::new().build(&specs).expect("build");
        assert_eq!(graph.edges()[0].reason, EdgeReason::Explicit);
    }

    #[test]
    fn test_unresolved_reference() {
        let specs = resources(
            r"
  - { name: s1, kind: aws_subnet, attributes: { vpc_id: { ref: aws_vpc.missing.id } } }
",
        );
        let err = GraphBuilder::new().build(&specs).expect_err("must fail");
        assert!(matches!(
            err,
            ConvergeError::Config(ConfigError::UnresolvedReference { .. })
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let specs = resources(
            r"
  - { name: a, kind: aws_security_group, attributes: { peer: { ref: aws_security_group.b } } }
  - { name: b, kind: aws_security_group, attributes: { peer: { ref: aws_security_group.a } } }
",
        );
        let err = GraphBuilder::new().build(&specs).expect_err("must fail");
        match err {
            ConvergeError::Config(ConfigError::CircularDependency { cycle }) => {
                assert_eq!(
                    cycle,
                    "aws_security_group.a -> aws_security_group.b -> aws_security_group.a"
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let specs = resources(
            r"
  - { name: a, kind: aws_security_group, attributes: { peer: { ref: aws_security_group.a } } }
",
        );
        assert!(GraphBuilder::new().build(&specs).is_err());
    }

    #[test]
    fn test_topological_order() {
        let specs = resources(
            r"
  - { name: web, kind: aws_instance, attributes: { subnet_id: { ref: aws_subnet.s } } }
  - { name: s, kind: aws_subnet, attributes: { vpc_id: { ref: aws_vpc.v } } }
  - { name: v, kind: aws_vpc, attributes: { cidr_block: 10.0.0.0/16 } }
",
        );
        let graph = GraphBuilder::new().build(&specs).expect("build");
        let order: Vec<String> = graph
            .topological_order()
            .into_iter()
            .map(|i| graph.nodes()[i].key.to_string())
            .collect();
        assert_eq!(order, vec!["aws_vpc.v", "aws_subnet.s", "aws_instance.web"]);
    }
}
