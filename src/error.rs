//! Error types for the converge reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration and graph building, state management, provider calls,
//! planning and applying.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for the converge engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
///
/// Every variant is fatal and is reported before any remote call is made.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The description file was not found.
    #[error("Stack file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The description file could not be parsed.
    #[error("Failed to parse stack description: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Stack validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Duplicate resource definition.
    #[error("Duplicate resource: {key}")]
    DuplicateResource {
        /// The duplicated `kind.name` key.
        key: String,
    },

    /// A reference expression is malformed.
    #[error("Invalid reference '{reference}' in {from}: expected <kind>.<name>[.<attribute>]")]
    InvalidReference {
        /// Resource holding the reference.
        from: String,
        /// The malformed reference text.
        reference: String,
    },

    /// An attribute references a resource that is not declared.
    #[error("Unresolved reference in {from}: '{reference}' does not name a declared resource")]
    UnresolvedReference {
        /// Resource holding the reference.
        from: String,
        /// The reference that could not be resolved.
        reference: String,
    },

    /// Circular dependency detected.
    #[error("Circular dependency detected: {cycle}")]
    CircularDependency {
        /// Description of the cycle.
        cycle: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State file not found.
    #[error("State file not found: {path}")]
    NotFound {
        /// Path to the missing state file.
        path: PathBuf,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The run lock was removed or taken over while the run held it.
    #[error("State lock {lock_id} is no longer held by this run")]
    LockLost {
        /// Identifier of the lost lock.
        lock_id: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// The stored record no longer matches the one the plan was built from.
    #[error("State conflict for {key}: planned against {expected}, found {found}")]
    Conflict {
        /// Resource key.
        key: String,
        /// What the plan expected.
        expected: String,
        /// What the store holds now.
        found: String,
    },

    /// A previous run crashed between a remote call and its commit.
    #[error(
        "Unknown state for {}: a previous run was interrupted mid-operation; \
         verify the remote objects and run `converge state clear-pending <key>`",
        keys.join(", ")
    )]
    UnknownState {
        /// Keys with dangling create intents.
        keys: Vec<String>,
    },
}

/// Provider errors.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    /// Authentication failed.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// The provider rejected the operation.
    #[error("Provider rejected operation on {kind}: {message}")]
    Rejected {
        /// Resource kind.
        kind: String,
        /// Error message from the provider.
        message: String,
    },

    /// The remote object does not exist.
    #[error("Remote object not found: {kind} {id}")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Remote identifier.
        id: String,
    },

    /// The provider has no binding for this kind.
    #[error("Unsupported resource kind: {kind}")]
    UnsupportedKind {
        /// Resource kind.
        kind: String,
    },

    /// Network failure or timeout, eligible for retry.
    #[error("Transient provider failure: {message}")]
    Transient {
        /// Description of the transient failure.
        message: String,
    },

    /// Invalid response from the provider.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// Transient failures persisted past the retry budget.
    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Last transient error message.
        last: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The ordering edges between actions form a cycle.
    #[error("Circular dependency between planned actions: {cycle}")]
    CircularDependency {
        /// Keys left unplaced by the topological sort.
        cycle: String,
    },

    /// A reference could not be resolved against state.
    #[error("Failed to resolve {reference} for {key}: {message}")]
    ResolutionFailed {
        /// Resource being planned.
        key: String,
        /// Reference being resolved.
        reference: String,
        /// Why resolution failed.
        message: String,
    },
}

/// Apply errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// A dependency's record was missing when resolving inputs.
    #[error("Dependency {dependency} of {key} has no committed state")]
    MissingDependency {
        /// Resource being applied.
        key: String,
        /// Dependency without a record.
        dependency: String,
    },

    /// The run was aborted.
    #[error("Run aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for converge operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is a configuration-level error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Plan(PlanError::CircularDependency { .. }))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns true if the error reports a missing remote object.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns the backoff before retry number `attempt` (1-based), if retryable.
    ///
    /// The delay doubles per attempt starting from `base_ms`, capped at 30s.
    #[must_use]
    pub fn retry_delay(&self, attempt: u32, base_ms: u64) -> Option<Duration> {
        if !self.is_retryable() {
            return None;
        }
        let factor = 1_u64 << attempt.saturating_sub(1).min(16);
        Some(Duration::from_millis(base_ms.saturating_mul(factor).min(30_000)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_is_retryable() {
        let err = ConvergeError::Provider(ProviderError::transient("timeout"));
        assert!(err.is_retryable());

        let err = ConvergeError::Provider(ProviderError::rejected("aws_vpc", "bad cidr"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retry_delay_backoff() {
        let err = ProviderError::transient("timeout");
        assert_eq!(err.retry_delay(1, 100), Some(Duration::from_millis(100)));
        assert_eq!(err.retry_delay(3, 100), Some(Duration::from_millis(400)));
        assert_eq!(err.retry_delay(30, 1_000), Some(Duration::from_secs(30)));
        assert_eq!(ProviderError::rejected("k", "no").retry_delay(1, 100), None);
    }

    #[test]
    fn test_configuration_classification() {
        let err = ConvergeError::Config(ConfigError::CircularDependency {
            cycle: String::from("a -> b -> a"),
        });
        assert!(err.is_configuration());

        let err = ConvergeError::Plan(PlanError::CircularDependency {
            cycle: String::from("a"),
        });
        assert!(err.is_configuration());

        let err = ConvergeError::internal("boom");
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_unknown_state_message_lists_keys() {
        let err = StateError::UnknownState {
            keys: vec![String::from("aws_vpc.main"), String::from("aws_eip.nat")],
        };
        let message = err.to_string();
        assert!(message.contains("aws_vpc.main, aws_eip.nat"));
    }
}
