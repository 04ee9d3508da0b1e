//! State store trait definition.
//!
//! Backends implement raw document persistence, locking, and a serialized
//! read-modify-write ([`StateStore::mutate`]). The per-resource operations
//! used by the executor are provided on top of `mutate`, so every backend
//! gets the same write-ahead semantics.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::ResourceKey;
use crate::error::Result;

use super::lock::LockInfo;
use super::types::{PendingOperation, RunHistoryEntry, StateDocument, StateRecord};

/// A mutation applied to the state document under the store's write lock.
pub type Mutation = Box<dyn FnOnce(&mut StateDocument) + Send>;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the state document.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<StateDocument>>;

    /// Saves the whole state document.
    async fn save(&self, state: &StateDocument) -> Result<()>;

    /// Applies a mutation atomically and durably.
    ///
    /// Mutations from concurrent tasks are serialized. A missing document is
    /// created empty before the mutation runs. Returns the written document.
    async fn mutate(&self, mutation: Mutation) -> Result<StateDocument>;

    /// Deletes the state document.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires a lock on the state.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases a lock on the state.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the lock regardless of holder.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Pushes back the expiry of a lock this run holds.
    ///
    /// Fails with `StateError::LockLost` once the stored lock is gone or
    /// belongs to someone else.
    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Checks if the state is locked by a live lock.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Loads the document, or an empty one if none exists.
    async fn snapshot(&self) -> Result<StateDocument> {
        Ok(self
            .load()
            .await?
            .unwrap_or_else(|| StateDocument::new("", "")))
    }

    /// Gets a single record.
    async fn get(&self, key: &ResourceKey) -> Result<Option<StateRecord>> {
        Ok(self
            .load()
            .await?
            .and_then(|doc| doc.records.get(key).cloned()))
    }

    /// Records the intent to perform a remote operation.
    async fn begin(&self, key: &ResourceKey, operation: PendingOperation) -> Result<()> {
        let key = key.clone();
        self.mutate(Box::new(move |doc| doc.begin_pending(key, operation)))
            .await
            .map(|_| ())
    }

    /// Stores a record and clears its intent in one write.
    async fn commit(&self, record: StateRecord) -> Result<()> {
        self.mutate(Box::new(move |doc| doc.upsert(record)))
            .await
            .map(|_| ())
    }

    /// Stores the record of a replacement and marks the replaced object for
    /// deletion in one write.
    async fn commit_superseding(&self, record: StateRecord, old_remote_id: &str) -> Result<()> {
        let old_remote_id = old_remote_id.to_string();
        self.mutate(Box::new(move |doc| doc.supersede(record, &old_remote_id)))
            .await
            .map(|_| ())
    }

    /// Drops the deletion mark of an old object once it is gone.
    async fn clear_superseded(&self, key: &ResourceKey, old_remote_id: &str) -> Result<()> {
        let key = key.clone();
        let old_remote_id = old_remote_id.to_string();
        self.mutate(Box::new(move |doc| {
            doc.clear_superseded(&key, &old_remote_id);
        }))
        .await
        .map(|_| ())
    }

    /// Deletes a record and clears its intent in one write.
    async fn remove(&self, key: &ResourceKey) -> Result<()> {
        let key = key.clone();
        self.mutate(Box::new(move |doc| {
            doc.remove(&key);
        }))
        .await
        .map(|_| ())
    }

    /// Clears an intent after a failed remote call. Returns whether one existed.
    async fn abandon(&self, key: &ResourceKey) -> Result<bool> {
        let key = key.clone();
        let cleared = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cleared);
        self.mutate(Box::new(move |doc| {
            flag.store(doc.clear_pending(&key), Ordering::SeqCst);
        }))
        .await?;
        Ok(cleared.load(Ordering::SeqCst))
    }

    /// Appends a run history entry.
    async fn record_history(&self, entry: RunHistoryEntry) -> Result<()> {
        self.mutate(Box::new(move |doc| doc.add_history(entry)))
            .await
            .map(|_| ())
    }

    /// Sets the stack identity on a fresh document.
    async fn initialize(&self, stack: &str, environment: &str) -> Result<()> {
        let stack = stack.to_string();
        let environment = environment.to_string();
        self.mutate(Box::new(move |doc| {
            if doc.stack.is_empty() {
                doc.stack = stack;
                doc.environment = environment;
            }
        }))
        .await
        .map(|_| ())
    }
}
