//! Plan executor.
//!
//! Runs a plan batch by batch. Batches are strict barriers; actions inside a
//! batch run concurrently on spawned tasks bounded by a semaphore. Every
//! remote call is bracketed by a write-ahead intent in the state store and
//! its result is committed before the task finishes, so later batches always
//! see the outputs of the resources they reference. Old objects left behind
//! by an earlier create-before-destroy replacement are deleted once the
//! batches are done.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Attributes, ConfigHasher, ExecutionConfig, FailureMode, Reference, ResourceKey};
use crate::error::{ApplyError, ConvergeError, ProviderError, Result, StateError};
use crate::graph::{resolve_node, Lookup, OutputSource};
use crate::provider::{Provider, ProviderResult};
use crate::state::{OperationKind, PendingOperation, StateDocument, StateRecord, StateStore};

use super::diff::{Action, ActionKind, AttributeChange, ReplaceStep};
use super::plan::{Plan, PlanMode};

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Maximum concurrent actions within a batch.
    pub concurrency: usize,
    /// What to do after a failed action.
    pub on_failure: FailureMode,
    /// Retries for transient provider failures.
    pub max_retries: u32,
    /// Base backoff between retries, in milliseconds.
    pub retry_backoff_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&ExecutionConfig::default())
    }
}

impl From<&ExecutionConfig> for ExecutorSettings {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            on_failure: config.on_failure,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
        }
    }
}

/// Why an action failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The provider rejected the call or retries ran out.
    Provider,
    /// The stored record changed since the plan was made.
    Conflict,
    /// The state store could not be read or written.
    State,
    /// Inputs could not be resolved.
    Resolution,
    /// Unexpected executor failure.
    Internal,
}

/// Terminal state of one resource after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResourceOutcome {
    /// The action completed and was committed.
    Applied {
        /// Action performed.
        action: String,
        /// Remote id after the action, if the object still exists.
        remote_id: Option<String>,
    },
    /// Nothing to do.
    Skipped,
    /// The action failed.
    Failed {
        /// Error message.
        reason: String,
        /// Error category.
        cause: FailureCause,
    },
    /// The action was not dispatched.
    ///
    /// `blocked_by` lists failed or pending prerequisites; it is empty when
    /// the run was aborted or cancelled before this action started.
    Pending {
        /// Prerequisites that did not complete.
        blocked_by: Vec<ResourceKey>,
    },
}

impl ResourceOutcome {
    /// Returns true for `Failed`.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Returns true for `Pending`.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    /// Short status label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Skipped => "skipped",
            Self::Failed { .. } => "failed",
            Self::Pending { .. } => "pending",
        }
    }
}

/// Per-resource result of applying a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// Mode of the executed plan.
    pub mode: PlanMode,
    /// Outcome per resource.
    pub outcomes: BTreeMap<ResourceKey, ResourceOutcome>,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Whether the run stopped dispatching after a failure.
    pub aborted: bool,
}

impl ApplyReport {
    /// Returns true if every resource was applied or skipped.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes
            .values()
            .all(|o| !o.is_failed() && !o.is_pending())
    }

    /// Gets the outcome of one resource.
    #[must_use]
    pub fn outcome(&self, key: &ResourceKey) -> Option<&ResourceOutcome> {
        self.outcomes.get(key)
    }

    /// Counts outcomes with the given label.
    #[must_use]
    pub fn count(&self, label: &str) -> usize {
        self.outcomes.values().filter(|o| o.label() == label).count()
    }

    /// Keys of resources an action was applied to.
    #[must_use]
    pub fn applied_keys(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ResourceOutcome::Applied { .. }))
            .map(|(k, _)| k.to_string())
            .collect()
    }

    /// One-line summary of failures, if any.
    #[must_use]
    pub fn failure_summary(&self) -> Option<String> {
        let failures: Vec<String> = self
            .outcomes
            .iter()
            .filter_map(|(k, o)| match o {
                ResourceOutcome::Failed { reason, .. } => Some(format!("{k}: {reason}")),
                _ => None,
            })
            .collect();
        (!failures.is_empty()).then(|| failures.join("; "))
    }
}

/// Executes plans against a provider and a state store.
pub struct Executor {
    store: Arc<dyn StateStore>,
    provider: Arc<dyn Provider>,
    settings: ExecutorSettings,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("store", &self.store.backend_type())
            .field("provider", &self.provider.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Creates a new executor.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        provider: Arc<dyn Provider>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            provider,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses the given token to stop dispatching new actions.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Executes a plan and reports the outcome of every resource.
    pub async fn execute(&self, plan: &Plan) -> ApplyReport {
        let started_at = Utc::now();
        let summary = plan.summary();
        info!(
            "Executing {} plan: {} to create, {} to update, {} to replace, {} to destroy",
            match plan.mode {
                PlanMode::Apply => "apply",
                PlanMode::Destroy => "destroy",
            },
            summary.create,
            summary.update,
            summary.replace,
            summary.destroy
        );

        let mut outcomes: BTreeMap<ResourceKey, ResourceOutcome> = plan
            .unchanged
            .iter()
            .map(|key| (key.clone(), ResourceOutcome::Skipped))
            .collect();

        let superseded = match self.store.snapshot().await {
            Ok(state) => state.superseded_objects(),
            Err(e) => {
                error!("Failed to read superseded objects: {e}");
                Vec::new()
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let halted = Arc::new(AtomicBool::new(false));
        let context = Arc::new(ActionContext {
            store: Arc::clone(&self.store),
            provider: Arc::clone(&self.provider),
            settings: self.settings.clone(),
            hasher: ConfigHasher::new(),
        });

        for (index, batch) in plan.batches.iter().enumerate() {
            debug!(
                "Batch {}/{}: {} action(s)",
                index + 1,
                plan.batches.len(),
                batch.actions.len()
            );

            let mut tasks = JoinSet::new();
            for action in &batch.actions {
                let blocked_by: Vec<ResourceKey> = action
                    .after
                    .iter()
                    .filter(|k| {
                        outcomes
                            .get(*k)
                            .is_some_and(|o| o.is_failed() || o.is_pending())
                    })
                    .cloned()
                    .collect();

                if !blocked_by.is_empty() {
                    warn!("{} blocked by {}", action.key, join_keys(&blocked_by));
                    settle(
                        &mut outcomes,
                        action.key.clone(),
                        ResourceOutcome::Pending { blocked_by },
                    );
                    continue;
                }

                if self.cancel.is_cancelled() || halted.load(Ordering::SeqCst) {
                    settle(
                        &mut outcomes,
                        action.key.clone(),
                        ResourceOutcome::Pending { blocked_by: Vec::new() },
                    );
                    continue;
                }

                let semaphore = Arc::clone(&semaphore);
                let halted = Arc::clone(&halted);
                let cancel = self.cancel.clone();
                let context = Arc::clone(&context);
                let action = action.clone();

                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return (action.key, ResourceOutcome::Pending { blocked_by: Vec::new() });
                    };
                    if cancel.is_cancelled() || halted.load(Ordering::SeqCst) {
                        return (action.key, ResourceOutcome::Pending { blocked_by: Vec::new() });
                    }

                    let outcome = context.run(&action).await;
                    if outcome.is_failed() && context.settings.on_failure == FailureMode::Abort {
                        halted.store(true, Ordering::SeqCst);
                    }
                    (action.key, outcome)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((key, outcome)) => settle(&mut outcomes, key, outcome),
                    Err(e) => error!("Action task failed: {e}"),
                }
            }

            for action in &batch.actions {
                outcomes
                    .entry(action.key.clone())
                    .or_insert_with(|| ResourceOutcome::Failed {
                        reason: String::from("action task terminated unexpectedly"),
                        cause: FailureCause::Internal,
                    });
            }
        }

        for (key, old_id) in superseded {
            if self.cancel.is_cancelled() || halted.load(Ordering::SeqCst) {
                debug!("{key}: leaving old object {old_id} for the next apply");
                continue;
            }
            let outcome = context.retire(&key, &old_id).await;
            settle(&mut outcomes, key, outcome);
        }

        let cancelled = self.cancel.is_cancelled();
        let aborted = halted.load(Ordering::SeqCst);
        if cancelled {
            warn!("Run cancelled; in-flight operations were allowed to finish");
        } else if aborted {
            warn!("Run aborted after a failure");
        }

        ApplyReport {
            mode: plan.mode,
            outcomes,
            started_at,
            finished_at: Utc::now(),
            cancelled,
            aborted,
        }
    }
}

/// Records an outcome. Both steps of a replacement report under one key: a
/// failure sticks, and the new remote id survives the destroy step.
fn settle(
    outcomes: &mut BTreeMap<ResourceKey, ResourceOutcome>,
    key: ResourceKey,
    outcome: ResourceOutcome,
) {
    match outcomes.entry(key) {
        Entry::Vacant(slot) => {
            slot.insert(outcome);
        }
        Entry::Occupied(mut slot) => {
            let keep = match (slot.get(), &outcome) {
                (existing, _) if existing.is_failed() => true,
                (
                    ResourceOutcome::Applied {
                        remote_id: Some(_), ..
                    },
                    ResourceOutcome::Applied { remote_id: None, .. },
                ) => true,
                _ => false,
            };
            if !keep {
                slot.insert(outcome);
            }
        }
    }
}

fn join_keys(keys: &[ResourceKey]) -> String {
    keys.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Outputs of committed records, read at dispatch time.
struct CommittedOutputs<'a> {
    state: &'a StateDocument,
}

impl OutputSource for CommittedOutputs<'_> {
    fn lookup(&self, reference: &Reference) -> Lookup {
        match self.state.record(&reference.key) {
            Some(record) => record.output(&reference.attribute).map_or_else(
                || {
                    Lookup::Missing(format!(
                        "{} has no output named '{}'",
                        reference.key, reference.attribute
                    ))
                },
                Lookup::Known,
            ),
            None => Lookup::Missing(format!("{} has no committed state", reference.key)),
        }
    }
}

/// Inputs of an action as resolved at dispatch time.
struct ResolvedInputs {
    inputs: Attributes,
    dependencies: Vec<ResourceKey>,
    fingerprint: String,
}

struct ActionContext {
    store: Arc<dyn StateStore>,
    provider: Arc<dyn Provider>,
    settings: ExecutorSettings,
    hasher: ConfigHasher,
}

impl ActionContext {
    async fn run(&self, action: &Action) -> ResourceOutcome {
        debug!("{} {} ({})", action.kind.symbol(), action.key, action.label());

        match self.perform(action).await {
            Ok(remote_id) => {
                info!("{} {}: {} complete", action.kind.symbol(), action.key, action.label());
                ResourceOutcome::Applied {
                    action: action.kind.label().to_string(),
                    remote_id,
                }
            }
            Err(err) => {
                error!("{} {} failed: {err}", action.label(), action.key);
                ResourceOutcome::Failed {
                    reason: err.to_string(),
                    cause: classify(&err),
                }
            }
        }
    }

    async fn perform(&self, action: &Action) -> Result<Option<String>> {
        self.check_prior(action).await?;

        match (&action.kind, action.step) {
            (ActionKind::Create, _) => {
                let resolved = self.resolve_inputs(action).await?;
                self.create_object(&action.key, resolved, None).await.map(Some)
            }
            (ActionKind::Update { changes }, _) => self.update(action, changes).await.map(Some),
            (ActionKind::Replace { .. }, ReplaceStep::Whole) => Err(ConvergeError::internal(
                format!("replacement of {} was not split into steps", action.key),
            )),
            (
                ActionKind::Replace {
                    create_before_destroy,
                    ..
                },
                ReplaceStep::CreateNew,
            ) => {
                let resolved = self.resolve_inputs(action).await?;
                let supersedes = if *create_before_destroy {
                    Some(prior_record(action)?.remote_id.as_str())
                } else {
                    None
                };
                self.create_object(&action.key, resolved, supersedes)
                    .await
                    .map(Some)
            }
            (
                ActionKind::Replace {
                    create_before_destroy: true,
                    ..
                },
                ReplaceStep::DestroyOld,
            ) => self.destroy_superseded(action).await.map(|()| None),
            (ActionKind::Replace { .. }, ReplaceStep::DestroyOld) => {
                self.destroy_original(action).await.map(|()| None)
            }
            (ActionKind::Destroy, _) => self.destroy(action).await.map(|()| None),
            (ActionKind::NoOp, _) => Ok(None),
        }
    }

    /// Refuses to act if the stored record moved since the plan was made.
    ///
    /// The second step of a replacement checks against what the first step
    /// left behind instead of the planned record.
    async fn check_prior(&self, action: &Action) -> Result<()> {
        let expected = match (&action.kind, action.step) {
            (
                ActionKind::Replace {
                    create_before_destroy: false,
                    ..
                },
                ReplaceStep::CreateNew,
            ) => None,
            (
                ActionKind::Replace {
                    create_before_destroy: true,
                    ..
                },
                ReplaceStep::DestroyOld,
            ) => return self.check_superseded(action).await,
            _ => action.prior.as_ref(),
        };

        let current = self.store.get(&action.key).await?;
        match (expected, &current) {
            (None, None) => Ok(()),
            (Some(expected), Some(current)) if expected.same_identity(current) => Ok(()),
            (expected, current) => Err(ConvergeError::State(StateError::Conflict {
                key: action.key.to_string(),
                expected: describe_record(expected),
                found: describe_record(current.as_ref()),
            })),
        }
    }

    /// Checks that the old object is still marked for deletion.
    async fn check_superseded(&self, action: &Action) -> Result<()> {
        let prior = prior_record(action)?;
        let state = self.store.snapshot().await?;
        if state.is_superseded(&action.key, &prior.remote_id) {
            return Ok(());
        }
        Err(ConvergeError::State(StateError::Conflict {
            key: action.key.to_string(),
            expected: format!("{} marked for deletion", prior.remote_id),
            found: describe_record(state.record(&action.key)),
        }))
    }

    async fn resolve_inputs(&self, action: &Action) -> Result<ResolvedInputs> {
        let node = action.node.as_ref().ok_or_else(|| {
            ConvergeError::internal(format!("{} has no desired configuration", action.key))
        })?;

        let state = self.store.snapshot().await?;
        let source = CommittedOutputs { state: &state };
        let inputs = resolve_node(node, &source)?.into_known().ok_or_else(|| {
            ConvergeError::internal(format!("{} has unresolved inputs", action.key))
        })?;

        let mut resolved = Vec::with_capacity(action.dependencies.len());
        for dependency in &action.dependencies {
            let record = state.record(dependency).ok_or_else(|| {
                ConvergeError::Apply(ApplyError::MissingDependency {
                    key: action.key.to_string(),
                    dependency: dependency.to_string(),
                })
            })?;
            resolved.push((dependency, record.remote_id.as_str()));
        }
        let fingerprint = self.hasher.dependency_fingerprint(resolved);

        Ok(ResolvedInputs {
            inputs,
            dependencies: action.dependencies.clone(),
            fingerprint,
        })
    }

    /// Creates an object and commits its record. With `supersedes`, the
    /// same write marks the replaced object for deletion.
    async fn create_object(
        &self,
        key: &ResourceKey,
        resolved: ResolvedInputs,
        supersedes: Option<&str>,
    ) -> Result<String> {
        self.store
            .begin(key, PendingOperation::new(OperationKind::Create, None))
            .await?;

        let provider = self.provider.as_ref();
        let kind = key.kind.as_str();
        let inputs = &resolved.inputs;
        let created = match self.call(key, move || provider.create(kind, inputs)).await {
            Ok(object) => object,
            Err(e) => {
                self.abandon(key).await;
                return Err(e.into());
            }
        };

        let record = StateRecord::new(key.clone(), &created.id, resolved.inputs, created.attributes)
            .with_dependencies(resolved.dependencies, resolved.fingerprint);
        match supersedes {
            Some(old_id) => self.store.commit_superseding(record, old_id).await?,
            None => self.store.commit(record).await?,
        }
        Ok(created.id)
    }

    async fn update(&self, action: &Action, changes: &[AttributeChange]) -> Result<String> {
        let prior = prior_record(action)?;
        let resolved = self.resolve_inputs(action).await?;

        let outputs = if changes.is_empty() {
            debug!("{}: dependencies moved, re-committing without a remote call", action.key);
            prior.outputs.clone()
        } else {
            let payload: Attributes = changes
                .iter()
                .map(|c| {
                    let value = resolved.inputs.get(&c.attribute).cloned().unwrap_or(Value::Null);
                    (c.attribute.clone(), value)
                })
                .collect();

            self.store
                .begin(
                    &action.key,
                    PendingOperation::new(OperationKind::Update, Some(prior.remote_id.clone())),
                )
                .await?;

            let provider = self.provider.as_ref();
            let kind = action.key.kind.as_str();
            let id = prior.remote_id.as_str();
            let payload = &payload;
            match self.call(&action.key, move || provider.update(kind, id, payload)).await {
                Ok(object) => object.attributes,
                Err(e) => {
                    self.abandon(&action.key).await;
                    return Err(e.into());
                }
            }
        };

        let mut record = prior.clone();
        record.inputs = resolved.inputs;
        record.outputs = outputs;
        record.dependencies = resolved.dependencies;
        record.dependency_fingerprint = resolved.fingerprint;
        record.updated_at = Utc::now();
        self.store.commit(record).await?;
        Ok(prior.remote_id.clone())
    }

    /// First step of a destroy-first replacement.
    async fn destroy_original(&self, action: &Action) -> Result<()> {
        let prior = prior_record(action)?;

        self.store
            .begin(
                &action.key,
                PendingOperation::new(OperationKind::Replace, Some(prior.remote_id.clone())),
            )
            .await?;
        if let Err(e) = self.delete_remote(&action.key, &prior.remote_id).await {
            self.abandon(&action.key).await;
            return Err(e.into());
        }
        self.store.remove(&action.key).await
    }

    /// Last step of a create-before-destroy replacement.
    async fn destroy_superseded(&self, action: &Action) -> Result<()> {
        let prior = prior_record(action)?;
        self.delete_old_object(&action.key, &prior.remote_id).await
    }

    /// Deletes the old object of a committed replacement and clears its
    /// mark. If the delete fails the mark stays, so a later apply retries.
    async fn delete_old_object(&self, key: &ResourceKey, old_id: &str) -> Result<()> {
        if let Err(e) = self.delete_remote(key, old_id).await {
            return Err(ConvergeError::Provider(ProviderError::rejected(
                &key.kind,
                format!("old object {old_id} was not deleted and will be retried: {e}"),
            )));
        }
        self.store.clear_superseded(key, old_id).await
    }

    /// Deletes an old object left marked by an earlier run.
    async fn retire(&self, key: &ResourceKey, old_id: &str) -> ResourceOutcome {
        info!("- {key}: deleting old object {old_id}");
        match self.delete_old_object(key, old_id).await {
            Ok(()) => ResourceOutcome::Applied {
                action: String::from("destroy"),
                remote_id: None,
            },
            Err(err) => {
                error!("{key}: {err}");
                ResourceOutcome::Failed {
                    reason: err.to_string(),
                    cause: classify(&err),
                }
            }
        }
    }

    async fn destroy(&self, action: &Action) -> Result<()> {
        let prior = prior_record(action)?;

        self.store
            .begin(
                &action.key,
                PendingOperation::new(OperationKind::Destroy, Some(prior.remote_id.clone())),
            )
            .await?;
        if let Err(e) = self.delete_remote(&action.key, &prior.remote_id).await {
            self.abandon(&action.key).await;
            return Err(e.into());
        }
        self.store.remove(&action.key).await
    }

    /// Deletes a remote object; an object that is already gone counts as deleted.
    async fn delete_remote(&self, key: &ResourceKey, id: &str) -> ProviderResult<()> {
        let provider = self.provider.as_ref();
        let kind = key.kind.as_str();
        match self.call(key, move || provider.delete(kind, id)).await {
            Err(e) if e.is_not_found() => {
                debug!("{key}: remote object {id} already gone");
                Ok(())
            }
            other => other,
        }
    }

    async fn abandon(&self, key: &ResourceKey) {
        if let Err(e) = self.store.abandon(key).await {
            warn!("{key}: failed to clear intent after a failed call: {e}");
        }
    }

    /// Calls the provider, retrying transient failures with backoff.
    async fn call<T, F, Fut>(&self, key: &ResourceKey, mut operation: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match err.retry_delay(attempt, self.settings.retry_backoff_ms) {
                Some(delay) if attempt <= self.settings.max_retries => {
                    warn!(
                        "{key}: {err} (attempt {attempt}/{}), retrying in {delay:?}",
                        self.settings.max_retries + 1
                    );
                    tokio::time::sleep(delay).await;
                }
                Some(_) => {
                    return Err(ProviderError::RetriesExhausted {
                        attempts: attempt,
                        last: err.to_string(),
                    });
                }
                None => return Err(err),
            }
        }
    }
}

fn prior_record(action: &Action) -> Result<&StateRecord> {
    action
        .prior
        .as_ref()
        .ok_or_else(|| ConvergeError::internal(format!("{} has no prior record", action.key)))
}

fn describe_record(record: Option<&StateRecord>) -> String {
    record.map_or_else(
        || String::from("no record"),
        |r| {
            let fingerprint: String = r.dependency_fingerprint.chars().take(8).collect();
            format!("{} ({fingerprint})", r.remote_id)
        },
    )
}

const fn classify(err: &ConvergeError) -> FailureCause {
    match err {
        ConvergeError::Provider(_) => FailureCause::Provider,
        ConvergeError::State(StateError::Conflict { .. }) => FailureCause::Conflict,
        ConvergeError::State(_) | ConvergeError::Io(_) => FailureCause::State,
        ConvergeError::Plan(_) | ConvergeError::Apply(_) | ConvergeError::Config(_) => {
            FailureCause::Resolution
        }
        ConvergeError::Internal(_) => FailureCause::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttrExpr, LifecycleConfig};
    use crate::graph::{ResolvedAttributes, ResourceNode};
    use crate::planner::plan::Planner;
    use crate::provider::{MemoryProvider, MockProvider, RemoteObject};
    use crate::state::MemoryStateStore;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn settings(max_retries: u32) -> ExecutorSettings {
        ExecutorSettings {
            concurrency: 2,
            on_failure: FailureMode::Abort,
            max_retries,
            retry_backoff_ms: 1,
        }
    }

    fn create_action(kind: &str, name: &str) -> Action {
        let key = ResourceKey::new(kind, name);
        Action {
            key: key.clone(),
            kind: ActionKind::Create,
            node: Some(ResourceNode {
                key,
                attributes: BTreeMap::from([(
                    String::from("cidr_block"),
                    AttrExpr::string("10.0.0.0/16"),
                )]),
                references: Vec::new(),
                lifecycle: LifecycleConfig::default(),
            }),
            prior: None,
            planned: ResolvedAttributes::default(),
            dependencies: Vec::new(),
            after: Vec::new(),
            step: ReplaceStep::Whole,
        }
    }

    fn plan_of(actions: Vec<Action>) -> Plan {
        Planner::new()
            .build(actions, PlanMode::Apply, "h", 0)
            .expect("plan")
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let mut provider = MockProvider::new();
        provider.expect_name().return_const("mock");
        provider.expect_create().times(3).returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProviderError::transient("timeout"))
            } else {
                Ok(RemoteObject {
                    id: String::from("vpc-9"),
                    attributes: BTreeMap::new(),
                })
            }
        });

        let store = Arc::new(MemoryStateStore::new());
        let executor = Executor::new(store.clone(), Arc::new(provider), settings(3));
        let report = executor.execute(&plan_of(vec![create_action("aws_vpc", "main")])).await;

        assert!(report.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let doc = store.snapshot().await.expect("snapshot");
        assert_eq!(doc.records[&ResourceKey::new("aws_vpc", "main")].remote_id, "vpc-9");
        assert!(doc.pending.is_empty());
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let mut provider = MockProvider::new();
        provider.expect_name().return_const("mock");
        provider
            .expect_create()
            .times(3)
            .returning(|_, _| Err(ProviderError::transient("timeout")));

        let store = Arc::new(MemoryStateStore::new());
        let executor = Executor::new(store.clone(), Arc::new(provider), settings(2));
        let report = executor.execute(&plan_of(vec![create_action("aws_vpc", "main")])).await;

        match report.outcome(&ResourceKey::new("aws_vpc", "main")) {
            Some(ResourceOutcome::Failed { reason, cause }) => {
                assert_eq!(*cause, FailureCause::Provider);
                assert!(reason.contains("3 attempts"), "{reason}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let doc = store.snapshot().await.expect("snapshot");
        assert!(doc.records.is_empty());
        assert!(doc.pending.is_empty(), "failed call must clear its intent");
    }

    #[tokio::test]
    async fn test_stale_prior_is_a_conflict() {
        let store = Arc::new(MemoryStateStore::new());
        let key = ResourceKey::new("aws_vpc", "main");
        store
            .commit(StateRecord::new(key.clone(), "vpc-2", BTreeMap::new(), BTreeMap::new()))
            .await
            .expect("commit");

        let mut action = create_action("aws_vpc", "main");
        action.kind = ActionKind::Destroy;
        action.prior = Some(StateRecord::new(
            key.clone(),
            "vpc-1",
            BTreeMap::new(),
            BTreeMap::new(),
        ));

        let provider = Arc::new(MemoryProvider::new());
        let executor = Executor::new(store.clone(), provider.clone(), settings(0));
        let report = executor.execute(&plan_of(vec![action])).await;

        assert!(matches!(
            report.outcome(&key),
            Some(ResourceOutcome::Failed { cause: FailureCause::Conflict, .. })
        ));
        assert!(provider.calls().is_empty());
        assert_eq!(
            store.get(&key).await.expect("get").expect("record").remote_id,
            "vpc-2"
        );
    }

    #[tokio::test]
    async fn test_cancelled_run_dispatches_nothing() {
        let token = CancellationToken::new();
        token.cancel();

        let provider = Arc::new(MemoryProvider::new());
        let executor =
            Executor::new(Arc::new(MemoryStateStore::new()), provider.clone(), settings(0))
                .with_cancellation(token);
        let report = executor
            .execute(&plan_of(vec![
                create_action("aws_vpc", "a"),
                create_action("aws_vpc", "b"),
            ]))
            .await;

        assert!(report.cancelled);
        assert_eq!(report.count("pending"), 2);
        assert_eq!(provider.object_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_update_recommits_without_remote_call() {
        let store = Arc::new(MemoryStateStore::new());
        let key = ResourceKey::new("aws_vpc", "main");
        let prior = StateRecord::new(
            key.clone(),
            "vpc-1",
            BTreeMap::from([(String::from("cidr_block"), json!("10.0.0.0/16"))]),
            BTreeMap::new(),
        )
        .with_dependencies(Vec::new(), String::from("stale"));
        store.commit(prior.clone()).await.expect("commit");

        let mut action = create_action("aws_vpc", "main");
        action.kind = ActionKind::Update { changes: Vec::new() };
        action.prior = Some(prior);

        let provider = Arc::new(MemoryProvider::new());
        let executor = Executor::new(store.clone(), provider.clone(), settings(0));
        let report = executor.execute(&plan_of(vec![action])).await;

        assert!(report.is_success());
        assert!(provider.calls().is_empty());
        let record = store.get(&key).await.expect("get").expect("record");
        assert_ne!(record.dependency_fingerprint, "stale");
    }

    #[tokio::test]
    async fn test_in_flight_calls_never_exceed_concurrency() {
        let provider = Arc::new(MemoryProvider::new().with_latency(Duration::from_millis(20)));
        let executor = Executor::new(
            Arc::new(MemoryStateStore::new()),
            provider.clone(),
            settings(0),
        );
        let actions = (0..5)
            .map(|i| create_action("aws_vpc", &format!("vpc{i}")))
            .collect();

        let report = executor.execute(&plan_of(actions)).await;

        assert!(report.is_success());
        assert_eq!(provider.object_count(), 5);
        assert_eq!(provider.peak_concurrency(), 2);
    }
}
