//! In-memory state backend.
//!
//! Used by tests and dry runs. Contents vanish with the process.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;

use super::lock::LockInfo;
use super::store::{Mutation, StateStore};
use super::types::StateDocument;

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    document: Mutex<Option<StateDocument>>,
    lock: Mutex<Option<LockInfo>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<StateDocument>> {
        Ok(self.document.lock().await.clone())
    }

    async fn save(&self, state: &StateDocument) -> Result<()> {
        *self.document.lock().await = Some(state.clone());
        Ok(())
    }

    async fn mutate(&self, mutation: Mutation) -> Result<StateDocument> {
        let mut guard = self.document.lock().await;
        let state = guard.get_or_insert_with(|| StateDocument::new("", ""));
        mutation(state);
        Ok(state.clone())
    }

    async fn delete(&self) -> Result<()> {
        *self.document.lock().await = None;
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.document.lock().await.is_some())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut guard = self.lock.lock().await;
        if let Some(existing) = guard.as_ref() {
            if existing.blocks(holder) {
                return Err(existing.conflict());
            }
        }
        let info = LockInfo::new(holder);
        *guard = Some(info.clone());
        Ok(info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut guard = self.lock.lock().await;
        if guard.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *guard = None;
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let mut guard = self.lock.lock().await;
        match guard.as_mut() {
            Some(current) if current.lock_id == lock.lock_id => {
                *current = current.renewed();
                Ok(current.clone())
            }
            _ => Err(lock.lost()),
        }
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceKey;
    use crate::error::{ConvergeError, StateError};
    use crate::state::{OperationKind, PendingOperation};

    #[tokio::test]
    async fn test_abandon_reports_cleared_intent() {
        let store = MemoryStateStore::new();
        let key = ResourceKey::new("aws_eip", "nat");

        assert!(!store.abandon(&key).await.expect("abandon"));

        store
            .begin(&key, PendingOperation::new(OperationKind::Create, None))
            .await
            .expect("begin");
        assert!(store.abandon(&key).await.expect("abandon"));
        assert!(store.snapshot().await.expect("snapshot").pending.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_sets_identity_once() {
        let store = MemoryStateStore::new();
        store.initialize("tutorial", "dev").await.expect("init");
        store.initialize("other", "prod").await.expect("init");

        let doc = store.snapshot().await.expect("snapshot");
        assert_eq!(doc.stack, "tutorial");
        assert_eq!(doc.environment, "dev");
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let store = MemoryStateStore::new();
        let lock = store.acquire_lock("a").await.expect("lock");
        assert!(store.acquire_lock("b").await.is_err());
        store.release_lock(&lock.lock_id).await.expect("release");
        assert!(!store.is_locked().await.expect("is_locked"));
    }

    #[tokio::test]
    async fn test_renewal_fails_once_lock_is_taken() {
        let store = MemoryStateStore::new();
        let lock = store.acquire_lock("a").await.expect("lock");
        let renewed = store.renew_lock(&lock).await.expect("renew");
        assert_eq!(renewed.lock_id, lock.lock_id);

        store.force_unlock().await.expect("force unlock");
        store.acquire_lock("b").await.expect("lock");
        let err = store.renew_lock(&lock).await.expect_err("lost");
        assert!(matches!(err, ConvergeError::State(StateError::LockLost { .. })));
        assert_eq!(
            store.get_lock_info().await.expect("info").expect("lock").holder,
            "b"
        );
    }
}
