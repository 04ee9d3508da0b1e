//! Provider adapter trait.
//!
//! The engine treats a provider as an opaque capability set: typed
//! create/read/update/delete calls per resource kind plus static metadata.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Attributes;
use crate::error::ProviderError;

use super::schema::SchemaCatalog;

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// A remote object as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteObject {
    /// Provider-side identifier.
    pub id: String,
    /// Full attribute view, including computed outputs.
    #[serde(default)]
    pub attributes: Attributes,
}

/// Trait for provider adapters.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short provider name for logs and reports.
    fn name(&self) -> &'static str;

    /// Static metadata for the kinds this provider supports.
    fn schemas(&self) -> SchemaCatalog;

    /// Creates an object.
    async fn create(&self, kind: &str, attributes: &Attributes) -> ProviderResult<RemoteObject>;

    /// Reads an object. Returns `ProviderError::NotFound` if it is gone.
    async fn read(&self, kind: &str, id: &str) -> ProviderResult<RemoteObject>;

    /// Applies an in-place change set to an object.
    async fn update(
        &self,
        kind: &str,
        id: &str,
        changes: &Attributes,
    ) -> ProviderResult<RemoteObject>;

    /// Deletes an object. Returns `ProviderError::NotFound` if it was already gone.
    async fn delete(&self, kind: &str, id: &str) -> ProviderResult<()>;
}
