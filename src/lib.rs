// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Converge
//!
//! A declarative infrastructure reconciliation engine: plan, apply and
//! destroy dependency-ordered resource graphs against a remote API.
//!
//! ## Overview
//!
//! Converge turns a stack description into a safe, ordered set of remote
//! operations:
//!
//! - Resources and their references form a typed dependency graph
//! - The last-applied state of every resource is persisted between runs
//! - Each run diffs the graph against state and plans create, update,
//!   replace and destroy actions in dependency-ordered batches
//! - Batches execute concurrently and commit state per resource, so a
//!   failed or interrupted run is resumed by simply planning again
//!
//! ## Architecture
//!
//! 1. **Graph**: built from `converge.stack.yaml`, references become edges
//! 2. **State**: last-applied records with write-ahead intents and a run lock
//! 3. **Differ / Planner**: per-resource actions layered with Kahn's algorithm
//! 4. **Executor**: bounded concurrency within a batch, barriers between batches
//!
//! ## Modules
//!
//! - [`config`]: Description parsing and validation
//! - [`graph`]: Resource graph building and reference resolution
//! - [`state`]: State storage backends (local, S3, memory)
//! - [`provider`]: Provider trait, schema catalog and adapters
//! - [`planner`]: Diffing, batching and execution
//! - [`engine`]: Plan, apply, destroy, drift and reconcile runs
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! stack:
//!   name: tutorial
//!   environment: dev
//!
//! resources:
//!   - name: main
//!     kind: aws_vpc
//!     attributes:
//!       cidr_block: "10.0.0.0/16"
//!   - name: public
//!     kind: aws_subnet
//!     attributes:
//!       vpc_id: { ref: aws_vpc.main.id }
//!       cidr_block: "10.0.1.0/24"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, Description, ResourceKey};
pub use engine::{DriftReport, Engine, ReconciliationResult};
pub use error::{ConvergeError, Result};
pub use graph::{GraphBuilder, ResourceGraph};
pub use planner::{ApplyReport, Executor, Plan, Planner};
pub use provider::{HttpProvider, MemoryProvider, Provider, SchemaCatalog};
pub use state::{LocalStateStore, MemoryStateStore, S3StateStore, StateStore};
