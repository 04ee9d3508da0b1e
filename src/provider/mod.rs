//! Provider adapters.
//!
//! This module contains the provider trait the engine drives, the static
//! schema catalog, a generic REST binding and an in-memory simulation.

mod adapter;
mod http;
mod memory;
mod schema;

pub use adapter::{Provider, ProviderResult, RemoteObject};
#[cfg(test)]
pub use adapter::MockProvider;
pub use http::HttpProvider;
pub use memory::{InjectedFailure, MemoryProvider, ProviderCall};
pub use schema::{FieldClass, ResourceSchema, SchemaCatalog};
