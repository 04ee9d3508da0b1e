//! State types for tracking applied resources.
//!
//! These types are the persisted record of what the engine has confirmed
//! against the provider. Nothing in here is ever written speculatively: a
//! record only changes after the remote operation it describes succeeded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::{Attributes, ResourceKey, DEFAULT_REFERENCE_ATTRIBUTE};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of run history entries kept.
const MAX_HISTORY: usize = 100;

/// The complete persisted state of a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateDocument {
    /// State format version.
    pub version: String,
    /// Stack name.
    pub stack: String,
    /// Environment name.
    pub environment: String,
    /// Incremented on every committed mutation.
    pub serial: u64,
    /// Applied resources.
    #[serde(default)]
    pub records: BTreeMap<ResourceKey, StateRecord>,
    /// Remote operations started but not yet committed.
    #[serde(default)]
    pub pending: BTreeMap<ResourceKey, PendingOperation>,
    /// Old objects of committed replacements that still have to be deleted.
    #[serde(default)]
    pub superseded: Vec<SupersededObject>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// Last confirmed state of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateRecord {
    /// Resource identity.
    pub key: ResourceKey,
    /// Provider-side identifier.
    pub remote_id: String,
    /// Last-applied resolved input attributes.
    pub inputs: Attributes,
    /// Attributes returned by the provider.
    #[serde(default)]
    pub outputs: Attributes,
    /// Dependencies at the time of the last apply.
    #[serde(default)]
    pub dependencies: Vec<ResourceKey>,
    /// Hash of the dependencies' remote ids.
    pub dependency_fingerprint: String,
    /// When the remote object was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

/// Write-ahead intent for a remote operation in flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingOperation {
    /// Operation that was dispatched.
    pub operation: OperationKind,
    /// Remote id involved, if one existed before the call.
    pub remote_id: Option<String>,
    /// When the operation was dispatched.
    pub started_at: DateTime<Utc>,
}

/// An object replaced by a newer one but not yet deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupersededObject {
    /// Resource the object belonged to.
    pub key: ResourceKey,
    /// Remote id of the old object.
    pub remote_id: String,
    /// When the replacement was committed.
    pub since: DateTime<Utc>,
}

/// Kinds of remote operations tracked by intents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create a new object.
    Create,
    /// Update an object in place.
    Update,
    /// Destroy and recreate an object.
    Replace,
    /// Destroy an object.
    Destroy,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunHistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: RunOperation,
    /// Resources the run acted on.
    pub resources: Vec<String>,
    /// Whether every action succeeded.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Plan applied.
    Apply,
    /// Stack destroyed.
    Destroy,
    /// Repeated plan and apply.
    Reconcile,
}

impl StateDocument {
    /// Creates a new empty state document.
    #[must_use]
    pub fn new(stack: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            stack: stack.to_string(),
            environment: environment.to_string(),
            serial: 0,
            records: BTreeMap::new(),
            pending: BTreeMap::new(),
            superseded: Vec::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a record by key.
    #[must_use]
    pub fn record(&self, key: &ResourceKey) -> Option<&StateRecord> {
        self.records.get(key)
    }

    /// Records an intent before a remote call.
    pub fn begin_pending(&mut self, key: ResourceKey, operation: PendingOperation) {
        self.pending.insert(key, operation);
        self.touch();
    }

    /// Adds or replaces a record and clears its intent.
    pub fn upsert(&mut self, record: StateRecord) {
        self.pending.remove(&record.key);
        self.records.insert(record.key.clone(), record);
        self.touch();
    }

    /// Stores the record of a replacement and marks the object it replaces
    /// for deletion, in one step.
    pub fn supersede(&mut self, record: StateRecord, old_remote_id: &str) {
        self.superseded.push(SupersededObject {
            key: record.key.clone(),
            remote_id: old_remote_id.to_string(),
            since: Utc::now(),
        });
        self.upsert(record);
    }

    /// Drops the deletion mark of an old object. Returns whether it existed.
    pub fn clear_superseded(&mut self, key: &ResourceKey, remote_id: &str) -> bool {
        let before = self.superseded.len();
        self.superseded.retain(|s| !(&s.key == key && s.remote_id == remote_id));
        let cleared = self.superseded.len() != before;
        if cleared {
            self.touch();
        }
        cleared
    }

    /// Removes a record and clears its intent.
    pub fn remove(&mut self, key: &ResourceKey) -> Option<StateRecord> {
        self.pending.remove(key);
        let removed = self.records.remove(key);
        self.touch();
        removed
    }

    /// Clears an intent without touching the record.
    pub fn clear_pending(&mut self, key: &ResourceKey) -> bool {
        let existed = self.pending.remove(key).is_some();
        if existed {
            self.touch();
        }
        existed
    }

    /// Returns keys of create intents.
    ///
    /// The provider may or may not hold an object for such an intent, and a
    /// record behind it only describes the object being replaced.
    #[must_use]
    pub fn dangling_creates(&self) -> Vec<ResourceKey> {
        self.pending
            .iter()
            .filter(|(key, op)| match op.operation {
                OperationKind::Create => true,
                OperationKind::Replace => !self.records.contains_key(*key),
                OperationKind::Update | OperationKind::Destroy => false,
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Returns old objects still waiting for deletion after their
    /// replacement was committed, as `(key, old remote id)`.
    #[must_use]
    pub fn superseded_objects(&self) -> Vec<(ResourceKey, String)> {
        self.superseded
            .iter()
            .map(|s| (s.key.clone(), s.remote_id.clone()))
            .collect()
    }

    /// Returns true if `remote_id` is marked as the old object of `key`.
    #[must_use]
    pub fn is_superseded(&self, key: &ResourceKey, remote_id: &str) -> bool {
        self.superseded
            .iter()
            .any(|s| &s.key == key && s.remote_id == remote_id)
    }

    /// Returns keys of intents that a re-diff will simply retry.
    #[must_use]
    pub fn resumable_intents(&self) -> Vec<ResourceKey> {
        self.pending
            .iter()
            .filter(|(key, op)| {
                op.operation != OperationKind::Create && self.records.contains_key(*key)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns the number of applied resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn touch(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }
}

impl StateRecord {
    /// Creates a record for a freshly created object.
    #[must_use]
    pub fn new(key: ResourceKey, remote_id: &str, inputs: Attributes, outputs: Attributes) -> Self {
        let now = Utc::now();
        Self {
            key,
            remote_id: remote_id.to_string(),
            inputs,
            outputs,
            dependencies: Vec::new(),
            dependency_fingerprint: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the dependency list and its fingerprint.
    #[must_use]
    pub fn with_dependencies(
        mut self,
        dependencies: Vec<ResourceKey>,
        fingerprint: String,
    ) -> Self {
        self.dependencies = dependencies;
        self.dependency_fingerprint = fingerprint;
        self
    }

    /// Returns the value other resources see for `attribute`.
    ///
    /// `id` is the remote identifier; other names are looked up in the
    /// provider outputs first, then in the applied inputs.
    #[must_use]
    pub fn output(&self, attribute: &str) -> Option<Value> {
        if attribute == DEFAULT_REFERENCE_ATTRIBUTE {
            return Some(Value::String(self.remote_id.clone()));
        }
        self.outputs
            .get(attribute)
            .or_else(|| self.inputs.get(attribute))
            .cloned()
    }

    /// Returns true if both records describe the same remote object and dependencies.
    #[must_use]
    pub fn same_identity(&self, other: &Self) -> bool {
        self.remote_id == other.remote_id
            && self.dependency_fingerprint == other.dependency_fingerprint
    }
}

impl PendingOperation {
    /// Creates a new intent.
    #[must_use]
    pub fn new(operation: OperationKind, remote_id: Option<String>) -> Self {
        Self {
            operation,
            remote_id,
            started_at: Utc::now(),
        }
    }
}

impl RunHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: RunOperation, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(operation: RunOperation, resources: Vec<String>, error: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            resources,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Reconcile => "reconcile",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(name: &str) -> StateRecord {
        StateRecord::new(
            ResourceKey::new("aws_vpc", name),
            "vpc-1",
            BTreeMap::from([(String::from("cidr_block"), json!("10.0.0.0/16"))]),
            BTreeMap::from([(String::from("arn"), json!("arn:vpc-1"))]),
        )
    }

    #[test]
    fn test_record_outputs() {
        let r = record("main");
        assert_eq!(r.output("id"), Some(json!("vpc-1")));
        assert_eq!(r.output("arn"), Some(json!("arn:vpc-1")));
        assert_eq!(r.output("cidr_block"), Some(json!("10.0.0.0/16")));
        assert_eq!(r.output("missing"), None);
    }

    #[test]
    fn test_upsert_clears_intent_and_bumps_serial() {
        let mut doc = StateDocument::new("s", "dev");
        let key = ResourceKey::new("aws_vpc", "main");

        doc.begin_pending(key.clone(), PendingOperation::new(OperationKind::Create, None));
        assert_eq!(doc.dangling_creates(), vec![key.clone()]);

        doc.upsert(record("main"));
        assert!(doc.pending.is_empty());
        assert!(doc.dangling_creates().is_empty());
        assert_eq!(doc.serial, 2);
    }

    #[test]
    fn test_resumable_intents() {
        let mut doc = StateDocument::new("s", "dev");
        doc.upsert(record("main"));
        let key = ResourceKey::new("aws_vpc", "main");
        doc.begin_pending(
            key.clone(),
            PendingOperation::new(OperationKind::Destroy, Some(String::from("vpc-1"))),
        );

        assert!(doc.dangling_creates().is_empty());
        assert_eq!(doc.resumable_intents(), vec![key]);
    }

    #[test]
    fn test_create_intent_over_record_is_dangling() {
        let mut doc = StateDocument::new("s", "dev");
        doc.upsert(record("main"));
        let key = ResourceKey::new("aws_vpc", "main");
        doc.begin_pending(key.clone(), PendingOperation::new(OperationKind::Create, None));

        assert_eq!(doc.dangling_creates(), vec![key]);
        assert!(doc.resumable_intents().is_empty());
    }

    #[test]
    fn test_superseded_object_survives_until_cleared() {
        let mut doc = StateDocument::new("s", "dev");
        doc.upsert(record("main"));
        let key = ResourceKey::new("aws_vpc", "main");

        let mut replacement = record("main");
        replacement.remote_id = String::from("vpc-2");
        doc.supersede(replacement, "vpc-1");

        assert_eq!(doc.records[&key].remote_id, "vpc-2");
        assert_eq!(
            doc.superseded_objects(),
            vec![(key.clone(), String::from("vpc-1"))]
        );
        assert!(doc.is_superseded(&key, "vpc-1"));
        assert!(doc.pending.is_empty());

        doc.remove(&key);
        assert!(doc.is_superseded(&key, "vpc-1"));

        assert!(!doc.clear_superseded(&key, "vpc-2"));
        assert!(doc.clear_superseded(&key, "vpc-1"));
        assert!(doc.superseded_objects().is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut doc = StateDocument::new("s", "dev");
        for _ in 0..(MAX_HISTORY + 5) {
            doc.add_history(RunHistoryEntry::new(RunOperation::Apply, vec![]));
        }
        assert_eq!(doc.history.len(), MAX_HISTORY);
    }

    #[test]
    fn test_document_json_roundtrip_keys() {
        let mut doc = StateDocument::new("s", "dev");
        doc.upsert(record("main"));
        let json = serde_json::to_string(&doc).expect("serialize");
        assert!(json.contains("\"aws_vpc.main\""));
        let back: StateDocument = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, doc);
    }
}
