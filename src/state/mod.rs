//! State management module for the converge engine.
//!
//! This module provides persistent storage for the last confirmed state of
//! every applied resource, write-ahead intents for operations in flight,
//! run locking, and run history.

mod store;
mod local;
mod s3;
mod memory;
mod lock;
mod types;

pub use store::{Mutation, StateStore};
pub use local::{LocalStateStore, STATE_DIR};
pub use s3::S3StateStore;
pub use memory::MemoryStateStore;
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS, LOCK_RENEWAL_SECS};
pub use types::{
    OperationKind, PendingOperation, RunHistoryEntry, RunOperation, StateDocument, StateRecord,
    SupersededObject, STATE_VERSION,
};
