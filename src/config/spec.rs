//! Description types for the reconciliation engine.
//!
//! This module defines the structs that map to the `converge.stack.yaml` file.
//! A description is the complete desired state for one run: stack identity,
//! backend settings and the list of declared resources.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Resolved attribute map, ordered for deterministic hashing and display.
pub type Attributes = BTreeMap<String, Value>;

/// Attribute a reference points at when none is named.
pub const DEFAULT_REFERENCE_ATTRIBUTE: &str = "id";

/// The root structure of a stack description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Description {
    /// Stack-level identity.
    pub stack: StackConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider endpoint configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Executor tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Additional resource schemas (extend or override the built-in catalog).
    #[serde(default)]
    pub schemas: Vec<SchemaConfig>,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

/// Stack-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackConfig {
    /// Unique name for the stack.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Base URL of the provider REST API.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// How the executor reacts to a failed action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Stop dispatching after the first failure.
    #[default]
    Abort,
    /// Keep applying branches that do not depend on a failed resource.
    BestEffort,
}

/// Executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum number of concurrent remote operations within a batch.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Failure handling mode.
    #[serde(default)]
    pub on_failure: FailureMode,
    /// Retries for transient provider failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff between retries, doubled on each attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

/// Schema override for one resource kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaConfig {
    /// Resource kind.
    pub kind: String,
    /// Attributes whose change forces replacement.
    #[serde(default)]
    pub replace_only: Vec<String>,
    /// Attributes the provider can change in place.
    #[serde(default)]
    pub updatable: Vec<String>,
    /// Attributes computed by the provider.
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// A single declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// Logical name, unique per kind.
    pub name: String,
    /// Resource kind (e.g. `aws_subnet`).
    pub kind: String,
    /// Explicit dependencies as `kind.name` keys.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Lifecycle options.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Attribute expressions.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrExpr>,
}

/// Lifecycle options for a resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LifecycleConfig {
    /// Create the replacement before destroying the old object.
    #[serde(default)]
    pub create_before_destroy: bool,
}

/// An attribute expression: a literal or a reference to another resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AttrExpr {
    /// Reference marker `{ ref: "kind.name.attr" }`.
    Ref(RefExpr),
    /// List of expressions.
    List(Vec<AttrExpr>),
    /// Map of expressions.
    Map(BTreeMap<String, AttrExpr>),
    /// Scalar literal.
    Literal(Value),
}

/// The body of a reference marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RefExpr {
    /// Reference text, `kind.name[.attribute]`.
    #[serde(rename = "ref")]
    pub target: String,
}

/// Identity of a resource: `(kind, logical name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey {
    /// Resource kind.
    pub kind: String,
    /// Logical name.
    pub name: String,
}

/// A parsed reference: target resource plus output attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Target resource.
    pub key: ResourceKey,
    /// Output attribute of the target.
    pub attribute: String,
}

fn default_environment() -> String {
    String::from("dev")
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_concurrency() -> usize {
    4
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_backoff_ms() -> u64 {
    500
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            on_failure: FailureMode::default(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Description {
    /// Finds a declared resource by key.
    #[must_use]
    pub fn resource(&self, key: &ResourceKey) -> Option<&ResourceSpec> {
        self.resources
            .iter()
            .find(|r| r.kind == key.kind && r.name == key.name)
    }

    /// Returns the keys of all declared resources.
    #[must_use]
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.resources.iter().map(ResourceSpec::key).collect()
    }
}

impl ResourceSpec {
    /// Returns the identity of this resource.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.kind, &self.name)
    }
}

impl AttrExpr {
    /// Appends the reference texts contained in this expression.
    pub fn collect_refs<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Ref(r) => out.push(&r.target),
            Self::List(items) => items.iter().for_each(|i| i.collect_refs(out)),
            Self::Map(entries) => entries.values().for_each(|e| e.collect_refs(out)),
            Self::Literal(_) => {}
        }
    }

    /// Builds a reference expression.
    #[must_use]
    pub fn reference(target: impl Into<String>) -> Self {
        Self::Ref(RefExpr {
            target: target.into(),
        })
    }

    /// Builds a literal string expression.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self::Literal(Value::String(value.into()))
    }
}

impl ResourceKey {
    /// Creates a new key.
    #[must_use]
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    /// Parses a `kind.name` string.
    ///
    /// # Errors
    ///
    /// Returns a message if the string does not have exactly two non-empty parts.
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        let mut parts = s.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(name), None) if !kind.is_empty() && !name.is_empty() => {
                Ok(Self::new(kind, name))
            }
            _ => Err(format!("Invalid resource key '{s}': expected <kind>.<name>")),
        }
    }
}

impl Reference {
    /// Parses `kind.name` or `kind.name.attribute`.
    ///
    /// # Errors
    ///
    /// Returns a message if the text is malformed.
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(format!("Invalid reference '{s}'"));
        }
        match parts.as_slice() {
            [kind, name] => Ok(Self {
                key: ResourceKey::new(kind, name),
                attribute: DEFAULT_REFERENCE_ATTRIBUTE.to_string(),
            }),
            [kind, name, attribute] => Ok(Self {
                key: ResourceKey::new(kind, name),
                attribute: (*attribute).to_string(),
            }),
            _ => Err(format!("Invalid reference '{s}'")),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.key, self.attribute)
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.to_string()
    }
}
