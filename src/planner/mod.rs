//! Planning and execution.
//!
//! This module compares the desired graph with stored state, layers the
//! resulting actions into dependency-ordered batches and executes them
//! against a provider.

mod diff;
mod plan;
mod executor;

pub use diff::{Action, ActionKind, AttributeChange, Differ, ReplaceStep};
pub use plan::{ActionBatch, Plan, PlanMode, PlanSummary, Planner};
pub use executor::{ApplyReport, Executor, ExecutorSettings, FailureCause, ResourceOutcome};
