//! Local file-based state storage backend.
//!
//! Stores the state document as JSON under `.converge/` for single-machine
//! use. Writes go to a temporary file that is synced and then renamed over
//! the real one, so a reader never sees a half-written document.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ConvergeError, Result, StateError};

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::{Mutation, StateStore};
use super::types::{StateDocument, STATE_VERSION};

/// Default state directory name.
pub const STATE_DIR: &str = ".converge";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl LocalStateStore {
    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                ConvergeError::State(StateError::write(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    async fn read_document(&self) -> Result<Option<StateDocument>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| {
            ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            })
        })?;

        let state: StateDocument = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;

        if state.version != STATE_VERSION {
            return Err(ConvergeError::State(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }));
        }

        Ok(Some(state))
    }

    async fn write_document(&self, state: &StateDocument) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(state).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })?;

        let temp_path = self.state_path.with_extension("tmp");
        write_synced(&temp_path, &content).await?;

        fs::rename(&temp_path, &self.state_path).await.map_err(|e| {
            ConvergeError::State(StateError::write(format!(
                "Failed to rename state file: {e}"
            )))
        })?;

        debug!("State written (serial {})", state.serial);
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| {
            ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            })
        })?;

        LockInfo::from_json(&content).map(Some)
    }

    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                ConvergeError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }

    /// Publishes a lock file unless one exists. Returns false if one does.
    ///
    /// The lock is written to a private file and hard-linked into place, so
    /// the link either fails or exposes a complete document.
    async fn create_lock_file(&self, lock: &LockInfo) -> Result<bool> {
        let staged = self.base_dir.join(format!("{LOCK_FILE}.{}", lock.lock_id));
        write_synced(&staged, &lock.to_json()?).await?;

        let linked = fs::hard_link(&staged, &self.lock_path).await;
        let _ = fs::remove_file(&staged).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(ConvergeError::State(StateError::LockFailed {
                message: format!("Failed to create lock file: {e}"),
            })),
        }
    }

    /// Error for an acquisition that lost a race.
    async fn contended(&self) -> ConvergeError {
        match self.read_lock_file().await {
            Ok(Some(existing)) => existing.conflict(),
            Ok(None) => ConvergeError::State(StateError::LockFailed {
                message: String::from("lock file changed during acquisition"),
            }),
            Err(e) => e,
        }
    }
}

async fn write_synced(path: &Path, content: &str) -> Result<()> {
    let mut file = fs::File::create(path).await.map_err(|e| {
        ConvergeError::State(StateError::write(format!(
            "Failed to create {}: {e}",
            path.display()
        )))
    })?;

    file.write_all(content.as_bytes()).await.map_err(|e| {
        ConvergeError::State(StateError::write(format!(
            "Failed to write {}: {e}",
            path.display()
        )))
    })?;

    file.sync_all().await.map_err(|e| {
        ConvergeError::State(StateError::write(format!(
            "Failed to sync {}: {e}",
            path.display()
        )))
    })
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StateDocument>> {
        debug!("Loading state from: {}", self.state_path.display());
        self.read_document().await
    }

    async fn save(&self, state: &StateDocument) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        info!("Saving state to: {}", self.state_path.display());
        self.write_document(state).await
    }

    async fn mutate(&self, mutation: Mutation) -> Result<StateDocument> {
        let _guard = self.write_lock.lock().await;
        let mut state = self
            .read_document()
            .await?
            .unwrap_or_else(|| StateDocument::new("", ""));
        mutation(&mut state);
        self.write_document(&state).await?;
        Ok(state)
    }

    async fn delete(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path).await.map_err(|e| {
                ConvergeError::State(StateError::write(format!(
                    "Failed to delete state file: {e}"
                )))
            })?;
        }

        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        self.ensure_dir().await?;
        let lock_info = LockInfo::new(&holder_id);

        if !self.create_lock_file(&lock_info).await? {
            if let Some(existing) = self.read_lock_file().await? {
                if existing.blocks(&holder_id) {
                    return Err(existing.conflict());
                }
                debug!("Expired or own lock found, taking over");
                self.delete_lock_file().await?;
            }
            if !self.create_lock_file(&lock_info).await? {
                return Err(self.contended().await);
            }
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        info!("Force-removing state lock: {}", self.lock_path.display());
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        match self.read_lock_file().await? {
            Some(current) if current.lock_id == lock.lock_id => {
                let renewed = current.renewed();
                let staged = self.lock_path.with_extension("lock.tmp");
                write_synced(&staged, &renewed.to_json()?).await?;
                fs::rename(&staged, &self.lock_path).await.map_err(|e| {
                    ConvergeError::State(StateError::LockFailed {
                        message: format!("Failed to renew lock file: {e}"),
                    })
                })?;
                debug!("Renewed state lock {}", renewed.lock_id);
                Ok(renewed)
            }
            _ => Err(lock.lost()),
        }
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceKey;
    use crate::state::{OperationKind, PendingOperation, StateRecord};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn record(name: &str) -> StateRecord {
        StateRecord::new(
            ResourceKey::new("aws_subnet", name),
            &format!("subnet-{name}"),
            BTreeMap::new(),
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let state = StateDocument::new("tutorial", "dev");
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.stack, "tutorial");
        assert_eq!(loaded.environment, "dev");
        assert!(!store.state_path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let (store, _temp) = create_test_store();

        let mut state = StateDocument::new("tutorial", "dev");
        state.version = String::from("0.1");
        store.save(&state).await.expect("Failed to save state");

        let err = store.load().await.expect_err("should reject version");
        assert!(matches!(
            err,
            ConvergeError::State(StateError::VersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_intent_lifecycle_survives_reopen() {
        let (store, temp) = create_test_store();
        let key = ResourceKey::new("aws_subnet", "a");

        store
            .begin(&key, PendingOperation::new(OperationKind::Create, None))
            .await
            .expect("begin");

        let reopened = LocalStateStore::with_base_dir(temp.path());
        let doc = reopened.snapshot().await.expect("snapshot");
        assert_eq!(doc.dangling_creates(), vec![key.clone()]);

        reopened.commit(record("a")).await.expect("commit");
        let doc = store.snapshot().await.expect("snapshot");
        assert!(doc.pending.is_empty());
        assert_eq!(doc.records[&key].remote_id, "subnet-a");

        store.remove(&key).await.expect("remove");
        assert!(store.get(&key).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_commits_are_serialized() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(LocalStateStore::with_base_dir(temp_dir.path()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.commit(record(&format!("s{i}"))).await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("commit");
        }

        let doc = store.snapshot().await.expect("snapshot");
        assert_eq!(doc.len(), 8);
        assert_eq!(doc.serial, 8);
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict_and_force_unlock() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("holder-2").await;
        assert!(matches!(
            result,
            Err(ConvergeError::State(StateError::LockedByOther { .. }))
        ));

        store.force_unlock().await.expect("force unlock");
        store
            .acquire_lock("holder-2")
            .await
            .expect("lock should be free");
    }

    #[tokio::test]
    async fn test_racing_acquisitions_have_one_winner() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(LocalStateStore::with_base_dir(temp_dir.path()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.acquire_lock(&format!("holder-{i}")).await
            }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            match handle.await.expect("join") {
                Ok(lock) => winners.push(lock),
                Err(e) => assert!(
                    matches!(e, ConvergeError::State(StateError::LockedByOther { .. })),
                    "{e}"
                ),
            }
        }

        assert_eq!(winners.len(), 1);
        let stored = store.get_lock_info().await.expect("info").expect("lock");
        assert_eq!(stored.lock_id, winners[0].lock_id);
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, _temp) = create_test_store();

        let mut stale = LockInfo::new("crashed");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        store.ensure_dir().await.expect("dir");
        write_synced(&store.lock_path, &stale.to_json().expect("json"))
            .await
            .expect("write");

        let lock = store.acquire_lock("next").await.expect("takeover");
        assert_eq!(
            store.get_lock_info().await.expect("info").expect("lock").lock_id,
            lock.lock_id
        );
    }

    #[tokio::test]
    async fn test_renewal_extends_expiry_until_lost() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("holder").await.expect("lock");

        let renewed = store.renew_lock(&lock).await.expect("renew");
        assert_eq!(renewed.lock_id, lock.lock_id);
        assert!(renewed.expires_at >= lock.expires_at);
        assert_eq!(
            store.get_lock_info().await.expect("info").expect("lock"),
            renewed
        );

        store.force_unlock().await.expect("force unlock");
        let err = store.renew_lock(&lock).await.expect_err("lost");
        assert!(matches!(err, ConvergeError::State(StateError::LockLost { .. })));
        assert!(!store.is_locked().await.expect("is_locked"));
    }
}
