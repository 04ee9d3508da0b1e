//! Run lock for the state document.
//!
//! A lock is advisory: it is a small document stored next to the state and
//! expires after [`LOCK_EXPIRY_SECS`] so a crashed run never blocks the
//! stack forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConvergeError, Result, StateError};

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300; // 5 minutes

/// How often a running apply renews its lock, in seconds.
pub const LOCK_RENEWAL_SECS: u64 = 60;

/// Information about a state lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Returns the same lock with a fresh expiry.
    #[must_use]
    pub fn renewed(&self) -> Self {
        Self {
            expires_at: Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
            ..self.clone()
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns true if the lock is live and owned by someone else.
    #[must_use]
    pub fn blocks(&self, holder: &str) -> bool {
        !self.is_expired() && self.holder != holder
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }

    /// Builds the error reported to a caller that found this lock.
    #[must_use]
    pub fn conflict(&self) -> ConvergeError {
        ConvergeError::State(StateError::LockedByOther {
            holder: self.holder.clone(),
            since: self.acquired_at.to_rfc3339(),
        })
    }

    /// Builds the error reported when this lock is found gone or replaced.
    #[must_use]
    pub fn lost(&self) -> ConvergeError {
        ConvergeError::State(StateError::LockLost {
            lock_id: self.lock_id.clone(),
        })
    }

    /// Parses a stored lock document.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Corrupted` if the content is not a lock.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| {
            ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to parse lock: {e}"),
            })
        })
    }

    /// Serializes the lock document.
    ///
    /// # Errors
    ///
    /// Returns `StateError::SerializationError` if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}
