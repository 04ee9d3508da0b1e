//! In-process simulated provider.
//!
//! Keeps objects in memory, generates ids per kind, computes outputs and
//! lets tests inject permanent or transient failures per kind. It can also
//! refuse to delete objects that others still point at, like most clouds do.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::config::Attributes;
use crate::error::ProviderError;

use super::adapter::{Provider, ProviderResult, RemoteObject};
use super::schema::SchemaCatalog;

/// A failure injected for every mutating call on a kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Reject every call with the given message.
    Permanent(String),
    /// Fail with a transient error this many times, then succeed.
    Transient(u32),
}

/// A call observed by the memory provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// Operation name (`create`, `read`, `update`, `delete`).
    pub operation: &'static str,
    /// Resource kind.
    pub kind: String,
    /// Remote id, if the call targeted one.
    pub id: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<(String, String), Attributes>,
    counters: HashMap<String, u64>,
    failures: HashMap<String, InjectedFailure>,
    delete_failures: HashMap<String, InjectedFailure>,
    references_enforced: bool,
    calls: Vec<ProviderCall>,
}

/// Simulated cloud provider.
#[derive(Debug)]
pub struct MemoryProvider {
    catalog: SchemaCatalog,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    inner: Mutex<Inner>,
}

/// Counts a call as in flight until dropped.
struct InFlight<'a> {
    count: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(count: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = count.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { count }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    /// Creates a provider with the built-in catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::with_catalog(SchemaCatalog::builtin())
    }

    /// Creates a provider with a custom catalog.
    #[must_use]
    pub fn with_catalog(catalog: SchemaCatalog) -> Self {
        Self {
            catalog,
            latency: None,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Delays every call by the given duration.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Injects a failure for mutating calls on a kind.
    pub fn fail_on(&self, kind: &str, failure: InjectedFailure) {
        self.with_inner(|inner| {
            inner.failures.insert(kind.to_string(), failure);
        });
    }

    /// Injects a failure for deletes on a kind only.
    pub fn fail_on_delete(&self, kind: &str, failure: InjectedFailure) {
        self.with_inner(|inner| {
            inner.delete_failures.insert(kind.to_string(), failure);
        });
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        self.with_inner(|inner| {
            inner.failures.clear();
            inner.delete_failures.clear();
        });
    }

    /// Rejects deleting an object while another object's attributes hold
    /// its id.
    #[must_use]
    pub fn enforce_references(self) -> Self {
        self.with_inner(|inner| inner.references_enforced = true);
        self
    }

    /// Returns the highest number of calls that were in flight at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Returns the attributes of an object.
    #[must_use]
    pub fn object(&self, kind: &str, id: &str) -> Option<Attributes> {
        self.with_inner(|inner| {
            inner
                .objects
                .get(&(kind.to_string(), id.to_string()))
                .cloned()
        })
    }

    /// Returns the number of live objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.with_inner(|inner| inner.objects.len())
    }

    /// Returns all calls observed so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.with_inner(|inner| inner.calls.clone())
    }

    /// Counts observed calls of one operation.
    #[must_use]
    pub fn call_count(&self, operation: &str) -> usize {
        self.with_inner(|inner| {
            inner
                .calls
                .iter()
                .filter(|c| c.operation == operation)
                .count()
        })
    }

    /// Changes an attribute behind the engine's back.
    pub fn tamper(&self, kind: &str, id: &str, attribute: &str, value: Value) {
        self.with_inner(|inner| {
            if let Some(attrs) = inner.objects.get_mut(&(kind.to_string(), id.to_string())) {
                attrs.insert(attribute.to_string(), value);
            }
        });
    }

    /// Deletes an object behind the engine's back.
    pub fn forget(&self, kind: &str, id: &str) {
        self.with_inner(|inner| {
            inner.objects.remove(&(kind.to_string(), id.to_string()));
        });
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    async fn simulate_latency(&self) {
        let _call = InFlight::enter(&self.in_flight, &self.peak);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn record_call(inner: &mut Inner, operation: &'static str, kind: &str, id: Option<&str>) {
        inner.calls.push(ProviderCall {
            operation,
            kind: kind.to_string(),
            id: id.map(str::to_string),
        });
    }

    fn check_failure(
        failures: &mut HashMap<String, InjectedFailure>,
        kind: &str,
    ) -> ProviderResult<()> {
        match failures.get_mut(kind) {
            Some(InjectedFailure::Permanent(message)) => {
                Err(ProviderError::rejected(kind, message.clone()))
            }
            Some(InjectedFailure::Transient(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Err(ProviderError::transient(format!("simulated timeout on {kind}")))
            }
            _ => Ok(()),
        }
    }

    /// Finds an object other than `id` whose attributes mention `id`.
    fn referrer<'a>(inner: &'a Inner, id: &str) -> Option<&'a (String, String)> {
        inner
            .objects
            .iter()
            .find(|((_, other), attrs)| other != id && attrs.values().any(|v| mentions(v, id)))
            .map(|(key, _)| key)
    }

    fn next_id(inner: &mut Inner, kind: &str) -> String {
        let counter = inner.counters.entry(kind.to_string()).or_insert(0);
        *counter += 1;
        let prefix = kind.trim_start_matches("aws_").replace('_', "-");
        format!("{prefix}-{counter:08x}")
    }

    fn computed_outputs(&self, kind: &str, id: &str, attributes: &mut Attributes) {
        attributes.insert(String::from("id"), Value::String(id.to_string()));
        attributes.insert(
            String::from("arn"),
            Value::String(format!("arn:converge:{kind}:{id}")),
        );
        if let Some(schema) = self.catalog.get(kind) {
            for output in &schema.outputs {
                attributes
                    .entry(output.clone())
                    .or_insert_with(|| Value::String(format!("{output}-{id}")));
            }
        }
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn schemas(&self) -> SchemaCatalog {
        self.catalog.clone()
    }

    async fn create(&self, kind: &str, attributes: &Attributes) -> ProviderResult<RemoteObject> {
        self.simulate_latency().await;
        self.with_inner(|inner| {
            Self::record_call(inner, "create", kind, None);
            Self::check_failure(&mut inner.failures, kind)?;

            let id = Self::next_id(inner, kind);
            let mut stored = attributes.clone();
            self.computed_outputs(kind, &id, &mut stored);
            inner
                .objects
                .insert((kind.to_string(), id.clone()), stored.clone());

            debug!("memory provider created {kind} {id}");
            Ok(RemoteObject {
                id,
                attributes: stored,
            })
        })
    }

    async fn read(&self, kind: &str, id: &str) -> ProviderResult<RemoteObject> {
        self.simulate_latency().await;
        self.with_inner(|inner| {
            Self::record_call(inner, "read", kind, Some(id));
            inner
                .objects
                .get(&(kind.to_string(), id.to_string()))
                .map(|attributes| RemoteObject {
                    id: id.to_string(),
                    attributes: attributes.clone(),
                })
                .ok_or_else(|| ProviderError::NotFound {
                    kind: kind.to_string(),
                    id: id.to_string(),
                })
        })
    }

    async fn update(
        &self,
        kind: &str,
        id: &str,
        changes: &Attributes,
    ) -> ProviderResult<RemoteObject> {
        self.simulate_latency().await;
        self.with_inner(|inner| {
            Self::record_call(inner, "update", kind, Some(id));
            Self::check_failure(&mut inner.failures, kind)?;

            let stored = inner
                .objects
                .get_mut(&(kind.to_string(), id.to_string()))
                .ok_or_else(|| ProviderError::NotFound {
                    kind: kind.to_string(),
                    id: id.to_string(),
                })?;
            for (name, value) in changes {
                stored.insert(name.clone(), value.clone());
            }

            Ok(RemoteObject {
                id: id.to_string(),
                attributes: stored.clone(),
            })
        })
    }

    async fn delete(&self, kind: &str, id: &str) -> ProviderResult<()> {
        self.simulate_latency().await;
        self.with_inner(|inner| {
            Self::record_call(inner, "delete", kind, Some(id));
            Self::check_failure(&mut inner.delete_failures, kind)?;
            Self::check_failure(&mut inner.failures, kind)?;

            if inner.references_enforced
                && let Some((other_kind, other_id)) = Self::referrer(inner, id)
            {
                return Err(ProviderError::rejected(
                    kind,
                    format!("{id} is still referenced by {other_kind} {other_id}"),
                ));
            }

            inner
                .objects
                .remove(&(kind.to_string(), id.to_string()))
                .map(|_| ())
                .ok_or_else(|| ProviderError::NotFound {
                    kind: kind.to_string(),
                    id: id.to_string(),
                })
        })
    }
}

fn mentions(value: &Value, id: &str) -> bool {
    match value {
        Value::String(s) => s == id,
        Value::Array(items) => items.iter().any(|v| mentions(v, id)),
        Value::Object(map) => map.values().any(|v| mentions(v, id)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs() -> Attributes {
        BTreeMap::from([(String::from("cidr_block"), json!("10.0.0.0/16"))])
    }

    #[tokio::test]
    async fn test_crud_cycle() {
        let provider = MemoryProvider::new();

        let created = provider.create("aws_vpc", &attrs()).await.expect("create");
        assert!(created.id.starts_with("vpc-"));
        assert_eq!(created.attributes["id"], json!(created.id));
        assert!(created.attributes.contains_key("arn"));
        assert!(created.attributes.contains_key("main_route_table_id"));

        let changes = BTreeMap::from([(String::from("tags"), json!({"Name": "main"}))]);
        let updated = provider
            .update("aws_vpc", &created.id, &changes)
            .await
            .expect("update");
        assert_eq!(updated.attributes["tags"], json!({"Name": "main"}));

        provider.delete("aws_vpc", &created.id).await.expect("delete");
        let err = provider
            .read("aws_vpc", &created.id)
            .await
            .expect_err("object is gone");
        assert!(err.is_not_found());
        assert_eq!(provider.object_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let provider = MemoryProvider::new();
        provider.fail_on("aws_eip", InjectedFailure::Transient(2));

        for _ in 0..2 {
            let err = provider.create("aws_eip", &attrs()).await.expect_err("transient");
            assert!(err.is_retryable());
        }
        provider.create("aws_eip", &attrs()).await.expect("third call succeeds");
        assert_eq!(provider.call_count("create"), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure() {
        let provider = MemoryProvider::new();
        provider.fail_on("aws_instance", InjectedFailure::Permanent(String::from("quota")));

        let err = provider
            .create("aws_instance", &attrs())
            .await
            .expect_err("rejected");
        assert!(matches!(err, ProviderError::Rejected { .. }));
        assert_eq!(provider.object_count(), 0);

        provider.clear_failures();
        provider.create("aws_instance", &attrs()).await.expect("create");
    }

    #[tokio::test]
    async fn test_delete_failure_leaves_creates_alone() {
        let provider = MemoryProvider::new();
        provider.fail_on_delete("aws_vpc", InjectedFailure::Permanent(String::from("busy")));

        let created = provider.create("aws_vpc", &attrs()).await.expect("create");
        let err = provider
            .delete("aws_vpc", &created.id)
            .await
            .expect_err("delete rejected");
        assert!(matches!(err, ProviderError::Rejected { .. }));
        assert_eq!(provider.object_count(), 1);

        provider.clear_failures();
        provider.delete("aws_vpc", &created.id).await.expect("delete");
    }

    #[tokio::test]
    async fn test_referenced_object_cannot_be_deleted() {
        let provider = MemoryProvider::new().enforce_references();
        let vpc = provider.create("aws_vpc", &attrs()).await.expect("vpc");
        let subnet = provider
            .create(
                "aws_subnet",
                &BTreeMap::from([(String::from("vpc_id"), json!(vpc.id))]),
            )
            .await
            .expect("subnet");

        let err = provider
            .delete("aws_vpc", &vpc.id)
            .await
            .expect_err("vpc is referenced");
        assert!(err.to_string().contains(&subnet.id), "{err}");

        provider.delete("aws_subnet", &subnet.id).await.expect("subnet");
        provider.delete("aws_vpc", &vpc.id).await.expect("vpc");
        assert_eq!(provider.object_count(), 0);
    }
}
