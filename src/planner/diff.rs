//! Differ: desired graph against stored state.
//!
//! Walks the graph in dependency order and decides one action per resource.
//! Resources that are about to be created or replaced have no outputs yet,
//! so anything referencing them resolves to an unknown value and is treated
//! as changed.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::config::{ConfigHasher, Reference, ResourceKey, DEFAULT_REFERENCE_ATTRIBUTE};
use crate::error::Result;
use crate::graph::{
    resolve_node, Lookup, OutputSource, ResolvedAttributes, ResolvedValue, ResourceGraph,
    ResourceNode,
};
use crate::provider::{FieldClass, SchemaCatalog};
use crate::state::{StateDocument, StateRecord};

/// One changed attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeChange {
    /// Attribute name.
    pub attribute: String,
    /// Last-applied value, if any.
    pub before: Option<Value>,
    /// Desired value; `None` when the attribute was removed.
    pub after: Option<ResolvedValue>,
    /// Whether the change forces replacement.
    pub forces_replacement: bool,
}

/// What to do with a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    /// Create a new object.
    Create,
    /// Change the existing object in place.
    Update {
        /// Changed attributes; empty when only the dependency fingerprint moved.
        changes: Vec<AttributeChange>,
    },
    /// Destroy the object and create a new one.
    Replace {
        /// Changed attributes, at least one replace-only.
        changes: Vec<AttributeChange>,
        /// Whether the new object is created before the old one is deleted.
        create_before_destroy: bool,
    },
    /// Delete the object.
    Destroy,
    /// Nothing to do.
    NoOp,
}

/// The part of a replacement one planned action performs.
///
/// The planner splits every replacement in two so that deleting the old
/// object can be ordered after the resources that still reference it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplaceStep {
    /// The whole action; every kind but a planned replacement.
    #[default]
    Whole,
    /// Create the new object and commit its record.
    CreateNew,
    /// Delete the old object.
    DestroyOld,
}

/// A planned action on one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    /// Resource identity.
    pub key: ResourceKey,
    /// What to do.
    pub kind: ActionKind,
    /// Part of a replacement this action performs.
    pub step: ReplaceStep,
    /// Desired node; absent for destroys of undeclared resources.
    pub node: Option<ResourceNode>,
    /// Record the decision was made against.
    pub prior: Option<StateRecord>,
    /// Inputs as resolved at plan time.
    pub planned: ResolvedAttributes,
    /// Graph dependencies of the desired node.
    pub dependencies: Vec<ResourceKey>,
    /// Actions that must finish before this one, set by the planner.
    pub after: Vec<ResourceKey>,
}

impl ActionKind {
    /// Short label used in logs and reports.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update { .. } => "update",
            Self::Replace { .. } => "replace",
            Self::Destroy => "destroy",
            Self::NoOp => "no-op",
        }
    }

    /// Plan marker (`+`, `~`, `-/+`, `+/-`, `-`).
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update { .. } => "~",
            Self::Replace {
                create_before_destroy: true,
                ..
            } => "+/-",
            Self::Replace { .. } => "-/+",
            Self::Destroy => "-",
            Self::NoOp => " ",
        }
    }

    /// Changed attributes, if any.
    #[must_use]
    pub fn changes(&self) -> &[AttributeChange] {
        match self {
            Self::Update { changes } | Self::Replace { changes, .. } => changes,
            _ => &[],
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl Action {
    /// Returns true for a pure destroy.
    #[must_use]
    pub const fn is_destroy(&self) -> bool {
        matches!(self.kind, ActionKind::Destroy)
    }

    /// Returns true if the action deletes an existing object.
    #[must_use]
    pub const fn is_removal(&self) -> bool {
        self.is_destroy() || matches!(self.step, ReplaceStep::DestroyOld)
    }

    /// Returns true if the action brings a new object into existence.
    #[must_use]
    pub const fn creates_object(&self) -> bool {
        matches!(self.kind, ActionKind::Create) || matches!(self.step, ReplaceStep::CreateNew)
    }

    /// Label of this action, naming the replacement step if it is one.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self.step {
            ReplaceStep::Whole => self.kind.label(),
            ReplaceStep::CreateNew => "replace: create",
            ReplaceStep::DestroyOld => "replace: destroy",
        }
    }

    /// Changed attributes, reported once per replacement.
    #[must_use]
    pub fn changes(&self) -> &[AttributeChange] {
        match self.step {
            ReplaceStep::DestroyOld => &[],
            ReplaceStep::Whole | ReplaceStep::CreateNew => self.kind.changes(),
        }
    }

    /// Returns true if nothing needs to happen.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        matches!(self.kind, ActionKind::NoOp)
    }

    fn destroy(record: &StateRecord) -> Self {
        Self {
            key: record.key.clone(),
            kind: ActionKind::Destroy,
            step: ReplaceStep::Whole,
            node: None,
            prior: Some(record.clone()),
            planned: ResolvedAttributes::default(),
            dependencies: Vec::new(),
            after: Vec::new(),
        }
    }
}

/// Outputs visible while planning.
struct PlanningOutputs<'a> {
    state: &'a StateDocument,
    /// Keys being created or replaced in this plan.
    unknown: BTreeSet<ResourceKey>,
    /// Planned values of attributes changed by in-place updates.
    updated: HashMap<ResourceKey, BTreeMap<String, ResolvedValue>>,
}

impl OutputSource for PlanningOutputs<'_> {
    fn lookup(&self, reference: &Reference) -> Lookup {
        if self.unknown.contains(&reference.key) {
            return Lookup::Pending;
        }
        if reference.attribute != DEFAULT_REFERENCE_ATTRIBUTE {
            if let Some(value) = self
                .updated
                .get(&reference.key)
                .and_then(|changed| changed.get(&reference.attribute))
            {
                return match value {
                    ResolvedValue::Known(v) => Lookup::Known(v.clone()),
                    ResolvedValue::Unknown => Lookup::Pending,
                };
            }
        }
        match self.state.record(&reference.key) {
            Some(record) => record.output(&reference.attribute).map_or_else(
                || {
                    Lookup::Missing(format!(
                        "{} has no output named '{}'",
                        reference.key, reference.attribute
                    ))
                },
                Lookup::Known,
            ),
            None => Lookup::Pending,
        }
    }
}

/// Computes actions from a graph and a state snapshot.
#[derive(Debug)]
pub struct Differ<'a> {
    catalog: &'a SchemaCatalog,
    hasher: ConfigHasher,
}

impl<'a> Differ<'a> {
    /// Creates a differ using the given schema catalog.
    #[must_use]
    pub const fn new(catalog: &'a SchemaCatalog) -> Self {
        Self {
            catalog,
            hasher: ConfigHasher::new(),
        }
    }

    /// Decides an action for every declared and every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::ResolutionFailed` if a reference names an output
    /// that a recorded resource does not have.
    pub fn diff(&self, graph: &ResourceGraph, state: &StateDocument) -> Result<Vec<Action>> {
        let mut outputs = PlanningOutputs {
            state,
            unknown: BTreeSet::new(),
            updated: HashMap::new(),
        };
        let mut actions = Vec::with_capacity(graph.len());

        for index in graph.topological_order() {
            let node = &graph.nodes()[index];
            let planned = resolve_node(node, &outputs)?;
            let dependencies = graph.dependency_keys(&node.key);
            let prior = state.record(&node.key);

            let kind = match prior {
                None => ActionKind::Create,
                Some(record) => {
                    let fingerprint = self.planned_fingerprint(&dependencies, &outputs);
                    self.decide(node, record, &planned, fingerprint.as_deref())
                }
            };
            debug!("{} -> {kind}", node.key);

            match &kind {
                ActionKind::Create | ActionKind::Replace { .. } => {
                    outputs.unknown.insert(node.key.clone());
                }
                ActionKind::Update { changes } if !changes.is_empty() => {
                    let changed = changes
                        .iter()
                        .map(|c| {
                            let value =
                                c.after.clone().unwrap_or(ResolvedValue::Known(Value::Null));
                            (c.attribute.clone(), value)
                        })
                        .collect();
                    outputs.updated.insert(node.key.clone(), changed);
                }
                _ => {}
            }

            actions.push(Action {
                key: node.key.clone(),
                kind,
                step: ReplaceStep::Whole,
                node: Some(node.clone()),
                prior: prior.cloned(),
                planned,
                dependencies,
                after: Vec::new(),
            });
        }

        for record in state.records.values() {
            if !graph.contains(&record.key) {
                debug!("{} is no longer declared -> destroy", record.key);
                actions.push(Action::destroy(record));
            }
        }

        Ok(actions)
    }

    /// Plans the destruction of every recorded resource.
    #[must_use]
    pub fn diff_destroy(&self, graph: &ResourceGraph, state: &StateDocument) -> Vec<Action> {
        state
            .records
            .values()
            .map(|record| {
                let mut action = Action::destroy(record);
                action.node = graph.node(&record.key).cloned();
                action.dependencies = graph.dependency_keys(&record.key);
                action
            })
            .collect()
    }

    /// Fingerprint the resource would have if applied now; `None` if a
    /// dependency has no remote id yet.
    fn planned_fingerprint(
        &self,
        dependencies: &[ResourceKey],
        outputs: &PlanningOutputs<'_>,
    ) -> Option<String> {
        let mut resolved = Vec::with_capacity(dependencies.len());
        for dependency in dependencies {
            if outputs.unknown.contains(dependency) {
                return None;
            }
            let record = outputs.state.record(dependency)?;
            resolved.push((dependency, record.remote_id.as_str()));
        }
        Some(self.hasher.dependency_fingerprint(resolved))
    }

    fn decide(
        &self,
        node: &ResourceNode,
        record: &StateRecord,
        planned: &ResolvedAttributes,
        fingerprint: Option<&str>,
    ) -> ActionKind {
        let changes = self.changed_attributes(node, record, planned);
        let fingerprint_moved = fingerprint != Some(record.dependency_fingerprint.as_str());

        if changes.iter().any(|c| c.forces_replacement) {
            ActionKind::Replace {
                changes,
                create_before_destroy: node.lifecycle.create_before_destroy,
            }
        } else if !changes.is_empty() || fingerprint_moved {
            ActionKind::Update { changes }
        } else {
            ActionKind::NoOp
        }
    }

    fn changed_attributes(
        &self,
        node: &ResourceNode,
        record: &StateRecord,
        planned: &ResolvedAttributes,
    ) -> Vec<AttributeChange> {
        let names: BTreeSet<&String> = planned.values.keys().chain(record.inputs.keys()).collect();

        names
            .into_iter()
            .filter_map(|name| {
                let before = record.inputs.get(name);
                let after = planned.values.get(name);
                let unchanged = matches!(
                    (before, after),
                    (Some(b), Some(ResolvedValue::Known(a))) if a == b
                );
                if unchanged {
                    return None;
                }
                Some(AttributeChange {
                    attribute: name.clone(),
                    before: before.cloned(),
                    after: after.cloned(),
                    forces_replacement: self.catalog.classify(&node.key.kind, name)
                        == FieldClass::ReplaceOnly,
                })
            })
            .collect()
    }
}
