//! Configuration module for the converge engine.
//!
//! This module handles all description-related functionality:
//! - Parsing and deserializing `converge.stack.yaml`
//! - Validation of declared values
//! - Computing hashes and dependency fingerprints for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    AttrExpr, Attributes, Description, ExecutionConfig, FailureMode, LifecycleConfig,
    ProviderConfig, RefExpr, Reference, ResourceKey, ResourceSpec, SchemaConfig, StackConfig,
    StateBackend, StateConfig, DEFAULT_REFERENCE_ATTRIBUTE,
};
pub use parser::{ConfigParser, find_config_file, DEFAULT_CONFIG_FILES, PROVIDER_TOKEN_VAR};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::ConfigHasher;
