//! Reconciliation engine.
//!
//! Ties the pipeline together: description → graph → diff → plan → execute.
//! The engine owns no global state; the state store, the provider and the
//! cancellation token are passed in so independent runs can coexist.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, Description, ResourceKey};
use crate::error::{ConvergeError, Result, StateError};
use crate::graph::{GraphBuilder, ResourceGraph};
use crate::planner::{ApplyReport, Differ, Executor, ExecutorSettings, Plan, PlanMode, Planner};
use crate::provider::{Provider, SchemaCatalog};
use crate::state::{
    generate_holder_id, LockInfo, RunHistoryEntry, RunOperation, StateDocument, StateStore,
    LOCK_RENEWAL_SECS,
};

/// Drives plan, apply, destroy, drift and reconcile runs.
pub struct Engine {
    store: Arc<dyn StateStore>,
    provider: Arc<dyn Provider>,
    settings: ExecutorSettings,
    holder: String,
    cancel: CancellationToken,
    lock_renewal: Duration,
    hasher: ConfigHasher,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.store.backend_type())
            .field("provider", &self.provider.name())
            .field("settings", &self.settings)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

/// Result of a reconciliation run.
#[derive(Debug, Serialize)]
pub struct ReconciliationResult {
    /// Number of apply passes performed.
    pub attempts: usize,
    /// Whether the final plan was empty.
    pub converged: bool,
    /// Report of every apply pass.
    pub reports: Vec<ApplyReport>,
}

/// Drift status of one recorded resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DriftStatus {
    /// Remote object matches the last-applied inputs.
    InSync,
    /// Remote object no longer exists.
    Missing,
    /// Remote values differ from the last-applied inputs.
    Changed {
        /// Differing attributes.
        attributes: Vec<AttributeDrift>,
    },
    /// The provider could not be asked.
    Unreadable {
        /// Error message.
        reason: String,
    },
}

/// One attribute that drifted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeDrift {
    /// Attribute name.
    pub attribute: String,
    /// Last-applied value.
    pub recorded: Value,
    /// Value reported by the provider.
    pub remote: Value,
}

/// Drift of one recorded resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDrift {
    /// Resource key.
    pub key: ResourceKey,
    /// Recorded remote id.
    pub remote_id: String,
    /// Drift status.
    #[serde(flatten)]
    pub status: DriftStatus,
}

/// Report of drift detection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// Every recorded resource with its drift status.
    pub resources: Vec<ResourceDrift>,
    /// Declared resources with no record yet.
    pub not_applied: Vec<ResourceKey>,
    /// Recorded resources no longer declared.
    pub undeclared: Vec<ResourceKey>,
}

impl DriftReport {
    /// Returns true if any recorded object drifted or went missing.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        self.resources
            .iter()
            .any(|r| !matches!(r.status, DriftStatus::InSync))
    }

    /// Returns true if the state is converged (no drift, nothing pending).
    #[must_use]
    pub fn is_converged(&self) -> bool {
        !self.has_drift() && self.not_applied.is_empty() && self.undeclared.is_empty()
    }

    /// Returns the drift entry of one resource.
    #[must_use]
    pub fn resource(&self, key: &ResourceKey) -> Option<&ResourceDrift> {
        self.resources.iter().find(|r| &r.key == key)
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected - state is converged");
        }

        writeln!(f, "Drift detected:")?;
        for resource in &self.resources {
            match &resource.status {
                DriftStatus::InSync => {}
                DriftStatus::Missing => {
                    writeln!(f, "  - {} ({}): missing", resource.key, resource.remote_id)?;
                }
                DriftStatus::Changed { attributes } => {
                    let names: Vec<&str> =
                        attributes.iter().map(|a| a.attribute.as_str()).collect();
                    writeln!(f, "  - {}: changed {}", resource.key, names.join(", "))?;
                }
                DriftStatus::Unreadable { reason } => {
                    writeln!(f, "  - {}: unreadable ({reason})", resource.key)?;
                }
            }
        }
        for key in &self.not_applied {
            writeln!(f, "  - {key}: not applied")?;
        }
        for key in &self.undeclared {
            writeln!(f, "  - {key}: no longer declared")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.converged { "converged" } else { "not converged" };
        writeln!(f, "Reconciliation {status} after {} apply pass(es)", self.attempts)?;
        for (i, report) in self.reports.iter().enumerate() {
            writeln!(
                f,
                "  Pass {}: {} applied, {} failed, {} pending",
                i + 1,
                report.count("applied"),
                report.count("failed"),
                report.count("pending")
            )?;
        }
        Ok(())
    }
}

impl Engine {
    /// Creates a new engine with default executor settings.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, provider: Arc<dyn Provider>) -> Self {
        Self {
            store,
            provider,
            settings: ExecutorSettings::default(),
            holder: generate_holder_id(),
            cancel: CancellationToken::new(),
            lock_renewal: Duration::from_secs(LOCK_RENEWAL_SECS),
            hasher: ConfigHasher::new(),
        }
    }

    /// Sets the executor settings.
    #[must_use]
    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Uses the given token to cancel runs.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the lock holder identity.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Sets how often a running apply renews its lock.
    #[must_use]
    pub const fn with_lock_renewal(mut self, every: Duration) -> Self {
        self.lock_renewal = every;
        self
    }

    /// Returns the schema catalog for a description.
    #[must_use]
    pub fn catalog(&self, description: &Description) -> SchemaCatalog {
        self.provider.schemas().merged(&description.schemas)
    }

    /// Computes the plan that converges state to the description.
    ///
    /// Read-only: neither the store nor the provider is modified.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unresolved references or cycles,
    /// `LockedByOther` if another run holds the lock, and `UnknownState` if a
    /// previous run crashed mid-create.
    pub async fn plan(&self, description: &Description) -> Result<Plan> {
        info!(
            "Planning {}/{}",
            description.stack.name, description.stack.environment
        );

        let graph = GraphBuilder::new().build(&description.resources)?;
        let state = self.planning_snapshot().await?;

        let catalog = self.catalog(description);
        let actions = Differ::new(&catalog).diff(&graph, &state)?;
        let plan = Planner::new()
            .build(
                actions,
                PlanMode::Apply,
                &self.hasher.hash_description(description),
                state.serial,
            )?
            .for_stack(&description.stack.name, &description.stack.environment)
            .with_superseded(state.superseded_objects());

        let summary = plan.summary();
        info!(
            "Plan: {} to create, {} to update, {} to replace, {} to destroy, {} unchanged",
            summary.create, summary.update, summary.replace, summary.destroy, summary.unchanged
        );
        Ok(plan)
    }

    /// Computes the plan that destroys every recorded resource.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::plan`]; a cycle in the description is reported here
    /// too.
    pub async fn plan_destroy(&self, description: &Description) -> Result<Plan> {
        info!(
            "Planning destroy of {}/{}",
            description.stack.name, description.stack.environment
        );

        let graph = GraphBuilder::new().build(&description.resources)?;
        let state = self.planning_snapshot().await?;

        let catalog = self.catalog(description);
        let actions = Differ::new(&catalog).diff_destroy(&graph, &state);
        let plan = Planner::new()
            .build(
                actions,
                PlanMode::Destroy,
                &self.hasher.hash_description(description),
                state.serial,
            )?
            .for_stack(&description.stack.name, &description.stack.environment)
            .with_superseded(state.superseded_objects());

        info!("Plan: {} to destroy", plan.summary().destroy);
        Ok(plan)
    }

    /// Applies a plan while holding the run lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be acquired, a crashed create is
    /// still pending, or the run history cannot be written. Per-resource
    /// failures are reported in the [`ApplyReport`], not as errors.
    pub async fn apply(&self, plan: &Plan) -> Result<ApplyReport> {
        let operation = match plan.mode {
            PlanMode::Apply => RunOperation::Apply,
            PlanMode::Destroy => RunOperation::Destroy,
        };
        self.apply_as(plan, operation).await
    }

    /// Destroys every recorded resource.
    ///
    /// # Errors
    ///
    /// See [`Engine::plan_destroy`] and [`Engine::apply`].
    pub async fn destroy(&self, description: &Description) -> Result<ApplyReport> {
        let plan = self.plan_destroy(description).await?;
        self.apply(&plan).await
    }

    /// Plans and applies until the plan is empty or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the first planning or locking error.
    pub async fn reconcile(
        &self,
        description: &Description,
        max_attempts: usize,
    ) -> Result<ReconciliationResult> {
        info!(
            "Starting reconciliation for {}/{}",
            description.stack.name, description.stack.environment
        );

        let mut reports = Vec::new();
        loop {
            let plan = self.plan(description).await?;
            if plan.is_empty() {
                info!("No changes required - state is converged");
                return Ok(ReconciliationResult {
                    attempts: reports.len(),
                    converged: true,
                    reports,
                });
            }

            if reports.len() >= max_attempts || self.cancel.is_cancelled() {
                warn!("Reconciliation stopped after {} pass(es)", reports.len());
                return Ok(ReconciliationResult {
                    attempts: reports.len(),
                    converged: false,
                    reports,
                });
            }

            debug!("Reconciliation pass {}/{max_attempts}", reports.len() + 1);
            let report = self.apply_as(&plan, RunOperation::Reconcile).await?;
            let failed = !report.is_success();
            reports.push(report);

            if failed && reports.len() < max_attempts {
                warn!("Reconciliation pass failed, retrying...");
                tokio::time::sleep(Duration::from_millis(self.settings.retry_backoff_ms)).await;
            }
        }
    }

    /// Compares every recorded object with what the provider reports.
    ///
    /// # Errors
    ///
    /// Returns an error if the description is invalid or state cannot be read.
    pub async fn check_drift(&self, description: &Description) -> Result<DriftReport> {
        info!(
            "Checking for drift in {}/{}",
            description.stack.name, description.stack.environment
        );

        let graph = GraphBuilder::new().build(&description.resources)?;
        let state = self.store.snapshot().await?;
        let mut report = DriftReport::default();

        for record in state.records.values() {
            let status = match self.provider.read(&record.key.kind, &record.remote_id).await {
                Ok(object) => {
                    let attributes: Vec<AttributeDrift> = record
                        .inputs
                        .iter()
                        .filter_map(|(name, recorded)| {
                            let remote = object.attributes.get(name)?;
                            (remote != recorded).then(|| AttributeDrift {
                                attribute: name.clone(),
                                recorded: recorded.clone(),
                                remote: remote.clone(),
                            })
                        })
                        .collect();
                    if attributes.is_empty() {
                        DriftStatus::InSync
                    } else {
                        DriftStatus::Changed { attributes }
                    }
                }
                Err(e) if e.is_not_found() => DriftStatus::Missing,
                Err(e) => {
                    error!("Failed to read {}: {e}", record.key);
                    DriftStatus::Unreadable { reason: e.to_string() }
                }
            };
            debug!("{}: {:?}", record.key, status);

            if !graph.contains(&record.key) {
                report.undeclared.push(record.key.clone());
            }
            report.resources.push(ResourceDrift {
                key: record.key.clone(),
                remote_id: record.remote_id.clone(),
                status,
            });
        }

        report.not_applied = graph
            .nodes()
            .iter()
            .filter(|n| state.record(&n.key).is_none())
            .map(|n| n.key.clone())
            .collect();

        Ok(report)
    }

    /// Loads state for planning after checking the lock and crashed creates.
    async fn planning_snapshot(&self) -> Result<StateDocument> {
        if let Some(lock) = self.store.get_lock_info().await?
            && lock.blocks(&self.holder)
        {
            return Err(lock.conflict());
        }

        let state = self.store.snapshot().await?;
        ensure_no_dangling_creates(&state)?;
        Ok(state)
    }

    async fn apply_as(&self, plan: &Plan, operation: RunOperation) -> Result<ApplyReport> {
        let lock = self.store.acquire_lock(&self.holder).await?;
        debug!("Acquired state lock {}", lock.lock_id);

        let run = self.cancel.child_token();
        let heartbeat = tokio::spawn(keep_lock_alive(
            Arc::clone(&self.store),
            lock.clone(),
            self.lock_renewal,
            run.clone(),
        ));

        let result = self.apply_locked(plan, operation, run).await;

        heartbeat.abort();
        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            error!("Failed to release state lock {}: {e}", lock.lock_id);
        }
        result
    }

    async fn apply_locked(
        &self,
        plan: &Plan,
        operation: RunOperation,
        run: CancellationToken,
    ) -> Result<ApplyReport> {
        self.store.initialize(&plan.stack, &plan.environment).await?;

        let state = self.store.snapshot().await?;
        ensure_no_dangling_creates(&state)?;
        if state.serial != plan.state_serial {
            debug!(
                "State moved from serial {} to {} since planning",
                plan.state_serial, state.serial
            );
        }

        let resumable = state.resumable_intents();
        if !resumable.is_empty() {
            warn!(
                "Clearing {} interrupted operation(s) from a previous run; \
                 they will be re-attempted by re-planning",
                resumable.len()
            );
            self.store
                .mutate(Box::new(|doc: &mut StateDocument| {
                    for key in doc.resumable_intents() {
                        doc.clear_pending(&key);
                    }
                }))
                .await?;
        }

        let report = Executor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.provider),
            self.settings.clone(),
        )
        .with_cancellation(run)
        .execute(plan)
        .await;

        let applied = report.applied_keys();
        let entry = match report.failure_summary() {
            None if report.is_success() => RunHistoryEntry::new(operation, applied),
            None => RunHistoryEntry::failed(operation, applied, "run did not complete"),
            Some(summary) => RunHistoryEntry::failed(operation, applied, &summary),
        };
        self.store.record_history(entry).await?;

        if report.is_success() {
            info!("Apply complete: {} resource(s) changed", report.count("applied"));
        } else {
            warn!(
                "Apply finished with {} failed and {} pending resource(s)",
                report.count("failed"),
                report.count("pending")
            );
        }
        Ok(report)
    }
}

/// Renews the run lock until aborted. Cancels the run once the lock is
/// found gone or taken, so no further action is dispatched without it.
async fn keep_lock_alive(
    store: Arc<dyn StateStore>,
    mut lock: LockInfo,
    every: Duration,
    run: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match store.renew_lock(&lock).await {
            Ok(renewed) => {
                debug!("Renewed state lock {}", renewed.lock_id);
                lock = renewed;
            }
            Err(ConvergeError::State(StateError::LockLost { lock_id })) => {
                error!("State lock {lock_id} was lost; stopping the run");
                run.cancel();
                return;
            }
            Err(e) => warn!("Failed to renew state lock {}: {e}", lock.lock_id),
        }
    }
}

fn ensure_no_dangling_creates(state: &StateDocument) -> Result<()> {
    let dangling = state.dangling_creates();
    if dangling.is_empty() {
        return Ok(());
    }
    Err(ConvergeError::State(StateError::UnknownState {
        keys: dangling.iter().map(ToString::to_string).collect(),
    }))
}

/// Helper for CLI output: the graph of a description, validated.
///
/// # Errors
///
/// Returns a configuration error for unresolved references or cycles.
pub fn build_graph(description: &Description) -> Result<ResourceGraph> {
    GraphBuilder::new().build(&description.resources)
}
