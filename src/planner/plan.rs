//! Plan types and construction.
//!
//! The planner layers actions with Kahn's algorithm. An action enters the
//! next batch once every action it must follow has been placed; actions in
//! one batch have no ordering constraint between them. Replacements are split
//! into a create step and a destroy step before layering.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::ResourceKey;
use crate::error::{ConvergeError, PlanError, Result};

use super::diff::{Action, ActionKind, ReplaceStep};

/// What a plan was computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    /// Converge to the description.
    Apply,
    /// Remove everything in state.
    Destroy,
}

/// A set of actions with no edges between them.
#[derive(Debug, Clone, Default)]
pub struct ActionBatch {
    /// Actions, sorted by key.
    pub actions: Vec<Action>,
}

/// An ordered, batched plan.
#[derive(Debug, Clone)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Plan mode.
    pub mode: PlanMode,
    /// Stack the plan belongs to.
    pub stack: String,
    /// Environment the plan belongs to.
    pub environment: String,
    /// Hash of the description the plan was computed from.
    pub description_hash: String,
    /// State serial the plan was computed against.
    pub state_serial: u64,
    /// Batches in execution order.
    pub batches: Vec<ActionBatch>,
    /// Resources that need no action.
    pub unchanged: Vec<ResourceKey>,
    /// Old objects of earlier replacements still to be deleted, as
    /// `(key, old remote id)`.
    pub superseded: Vec<(ResourceKey, String)>,
}

/// Action counts of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Resources to create.
    pub create: usize,
    /// Resources to update in place.
    pub update: usize,
    /// Resources to replace.
    pub replace: usize,
    /// Resources to destroy.
    pub destroy: usize,
    /// Resources left alone.
    pub unchanged: usize,
}

impl PlanSummary {
    /// Total number of actions that touch the provider or state.
    #[must_use]
    pub const fn changes(&self) -> usize {
        self.create + self.update + self.replace + self.destroy
    }
}

impl Plan {
    /// Tags the plan with the stack identity it targets.
    #[must_use]
    pub fn for_stack(mut self, stack: &str, environment: &str) -> Self {
        self.stack = stack.to_string();
        self.environment = environment.to_string();
        self
    }

    /// Records old objects that the next apply deletes.
    #[must_use]
    pub fn with_superseded(mut self, superseded: Vec<(ResourceKey, String)>) -> Self {
        self.superseded = superseded;
        self
    }

    /// Returns true if the plan has nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.superseded.is_empty() && self.batches.iter().all(|b| b.actions.is_empty())
    }

    /// Iterates over all actions in execution order.
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.batches.iter().flat_map(|b| b.actions.iter())
    }

    /// Returns the batch index holding an action for `key`.
    #[must_use]
    pub fn batch_of(&self, key: &ResourceKey) -> Option<usize> {
        self.batches
            .iter()
            .position(|b| b.actions.iter().any(|a| &a.key == key))
    }

    /// Counts actions by kind; a replacement counts once.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary {
            unchanged: self.unchanged.len(),
            destroy: self.superseded.len(),
            ..PlanSummary::default()
        };
        for action in self.actions() {
            match action.kind {
                ActionKind::Create => summary.create += 1,
                ActionKind::Update { .. } => summary.update += 1,
                ActionKind::Replace { .. } if action.step == ReplaceStep::DestroyOld => {}
                ActionKind::Replace { .. } => summary.replace += 1,
                ActionKind::Destroy => summary.destroy += 1,
                ActionKind::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }
}

/// Orders actions into batches.
#[derive(Debug, Default)]
pub struct Planner;

impl Planner {
    /// Creates a new planner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds a plan from differ output.
    ///
    /// Ordering rules:
    /// - a create, update or replacement's create step follows the actions
    ///   that bring its dependencies to their desired configuration;
    /// - a destroy or replacement's destroy step follows every action, other
    ///   than a create, on a resource that depends on it, either per the
    ///   desired graph or per its last applied record;
    /// - the two steps of a replacement run destroy first unless it is
    ///   create-before-destroy.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::CircularDependency` if the rules form a cycle.
    pub fn build(
        &self,
        actions: Vec<Action>,
        mode: PlanMode,
        description_hash: &str,
        state_serial: u64,
    ) -> Result<Plan> {
        let (noops, mut pending): (Vec<Action>, Vec<Action>) =
            actions.into_iter().partition(Action::is_noop);

        let unchanged: Vec<ResourceKey> = noops.into_iter().map(|a| a.key).collect();

        Self::promote_create_first(&mut pending);
        let mut pending = Self::split_replacements(pending);

        let predecessors = Self::ordering_edges(&pending);
        let keys: Vec<ResourceKey> = pending.iter().map(|a| a.key.clone()).collect();
        for (action, preds) in pending.iter_mut().zip(&predecessors) {
            action.after = preds.iter().map(|&p| keys[p].clone()).collect();
            action.after.sort();
            action.after.dedup();
        }

        let layers = Self::layer(&pending, &predecessors)?;

        let mut slots: Vec<Option<Action>> = pending.into_iter().map(Some).collect();
        let batches: Vec<ActionBatch> = layers
            .into_iter()
            .map(|layer| ActionBatch {
                actions: layer.into_iter().filter_map(|i| slots[i].take()).collect(),
            })
            .collect();

        debug!(
            "Planned {} batch(es), {} unchanged",
            batches.len(),
            unchanged.len()
        );

        Ok(Plan {
            created_at: Utc::now(),
            mode,
            stack: String::new(),
            environment: String::new(),
            description_hash: description_hash.to_string(),
            state_serial,
            batches,
            unchanged,
            superseded: Vec::new(),
        })
    }

    /// Makes a replacement create-before-destroy when a resource that keeps
    /// or re-creates a reference to it changes while the old object must
    /// still exist: an in-place update, or a create-before-destroy
    /// replacement of its own.
    fn promote_create_first(actions: &mut [Action]) {
        loop {
            let kept_alive: BTreeSet<ResourceKey> = actions
                .iter()
                .filter(|a| {
                    matches!(
                        a.kind,
                        ActionKind::Update { .. }
                            | ActionKind::Replace {
                                create_before_destroy: true,
                                ..
                            }
                    )
                })
                .flat_map(|a| a.dependencies.iter().cloned())
                .collect();

            let mut promoted = false;
            for action in actions.iter_mut() {
                if let ActionKind::Replace {
                    create_before_destroy,
                    ..
                } = &mut action.kind
                    && !*create_before_destroy
                    && kept_alive.contains(&action.key)
                {
                    debug!(
                        "{}: dependents change in place, creating before destroying",
                        action.key
                    );
                    *create_before_destroy = true;
                    promoted = true;
                }
            }
            if !promoted {
                return;
            }
        }
    }

    /// Replaces every replacement with its destroy step and its create step.
    fn split_replacements(actions: Vec<Action>) -> Vec<Action> {
        let mut split = Vec::with_capacity(actions.len());
        for action in actions {
            if matches!(action.kind, ActionKind::Replace { .. }) {
                let mut create = action.clone();
                create.step = ReplaceStep::CreateNew;
                let mut destroy = action;
                destroy.step = ReplaceStep::DestroyOld;
                split.push(destroy);
                split.push(create);
            } else {
                split.push(action);
            }
        }
        split
    }

    /// Returns, per action, the indices of the actions it must follow.
    fn ordering_edges(actions: &[Action]) -> Vec<BTreeSet<usize>> {
        let mut forward = BTreeMap::new();
        let mut removal = BTreeMap::new();
        for (i, action) in actions.iter().enumerate() {
            if action.is_removal() {
                removal.insert(&action.key, i);
            } else {
                forward.insert(&action.key, i);
            }
        }

        let mut predecessors = vec![BTreeSet::new(); actions.len()];

        for (i, action) in actions.iter().enumerate() {
            if action.is_removal() {
                continue;
            }
            for dependency in &action.dependencies {
                if let Some(&d) = forward.get(dependency) {
                    predecessors[i].insert(d);
                }
            }
        }

        for (i, action) in actions.iter().enumerate() {
            let ActionKind::Replace {
                create_before_destroy,
                ..
            } = action.kind
            else {
                continue;
            };
            let first = match (action.step, create_before_destroy) {
                (ReplaceStep::CreateNew, false) => removal.get(&action.key),
                (ReplaceStep::DestroyOld, true) => forward.get(&action.key),
                _ => None,
            };
            if let Some(&f) = first {
                predecessors[i].insert(f);
            }
        }

        for (r, removed) in actions.iter().enumerate() {
            if !removed.is_removal() {
                continue;
            }
            for (x, other) in actions.iter().enumerate() {
                if other.key == removed.key || other.creates_object() {
                    continue;
                }
                let depended_on = other.dependencies.contains(&removed.key)
                    || other
                        .prior
                        .as_ref()
                        .is_some_and(|r| r.dependencies.contains(&removed.key));
                if depended_on {
                    predecessors[r].insert(x);
                }
            }
        }

        predecessors
    }

    /// Kahn layering; each layer is sorted by key.
    fn layer(actions: &[Action], predecessors: &[BTreeSet<usize>]) -> Result<Vec<Vec<usize>>> {
        let mut remaining: Vec<usize> = predecessors.iter().map(BTreeSet::len).collect();
        let mut successors = vec![Vec::new(); actions.len()];
        for (i, preds) in predecessors.iter().enumerate() {
            for &p in preds {
                successors[p].push(i);
            }
        }

        let mut placed = 0;
        let mut layers = Vec::new();
        let mut ready: Vec<usize> = (0..actions.len()).filter(|&i| remaining[i] == 0).collect();

        while !ready.is_empty() {
            ready.sort_by(|&a, &b| actions[a].key.cmp(&actions[b].key));
            let mut next = Vec::new();
            for &i in &ready {
                for &s in &successors[i] {
                    remaining[s] -= 1;
                    if remaining[s] == 0 {
                        next.push(s);
                    }
                }
            }
            placed += ready.len();
            layers.push(std::mem::replace(&mut ready, next));
        }

        if placed < actions.len() {
            let stuck: BTreeSet<String> = (0..actions.len())
                .filter(|&i| remaining[i] > 0)
                .map(|i| actions[i].key.to_string())
                .collect();
            return Err(ConvergeError::Plan(PlanError::CircularDependency {
                cycle: stuck.into_iter().collect::<Vec<_>>().join(", "),
            }));
        }

        Ok(layers)
    }
}
