//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde_json::Value;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::engine::{DriftReport, DriftStatus, ReconciliationResult};
use crate::graph::{ResolvedValue, ResourceGraph};
use crate::planner::{
    Action, ActionKind, ApplyReport, AttributeChange, Plan, PlanMode, ResourceOutcome,
};
use crate::state::{LockInfo, StateDocument};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "Batch")]
    batch: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Changes")]
    changes: String,
}

/// Outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Dependencies")]
    dependencies: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&PlanJson::from(plan)),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - infrastructure matches the description.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let title = match plan.mode {
            PlanMode::Apply => "Execution Plan",
            PlanMode::Destroy => "Destroy Plan",
        };
        let _ = writeln!(output, "\n{}", title.bold());
        let _ = writeln!(
            output,
            "   Stack: {}/{}  description {}  state serial {}\n",
            plan.stack,
            plan.environment,
            short(&plan.description_hash),
            plan.state_serial
        );

        let mut rows: Vec<PlanActionRow> = plan
            .batches
            .iter()
            .enumerate()
            .flat_map(|(i, batch)| {
                batch.actions.iter().map(move |a| PlanActionRow {
                    batch: i + 1,
                    action: Self::format_action(a),
                    resource: a.key.to_string(),
                    changes: truncate(&Self::change_names(a.changes()), 48),
                })
            })
            .collect();
        rows.extend(plan.superseded.iter().map(|(key, old_id)| PlanActionRow {
            batch: plan.batches.len() + 1,
            action: "-destroy old".red().to_string(),
            resource: key.to_string(),
            changes: format!("left by an earlier replacement: {old_id}"),
        }));
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for action in plan.actions() {
                if action.changes().is_empty() {
                    continue;
                }
                let _ = writeln!(output, "\n  {} {}", action.kind.symbol(), action.key);
                for change in action.changes() {
                    let _ = writeln!(output, "      {}", Self::format_change(change));
                }
            }
        }

        let summary = plan.summary();
        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy.",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().magenta(),
            summary.destroy.to_string().red()
        );

        output
    }

    /// Formats the outcome of an apply or destroy.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                let mut output = String::new();
                let rows: Vec<OutcomeRow> = report
                    .outcomes
                    .iter()
                    .map(|(key, outcome)| OutcomeRow {
                        resource: key.to_string(),
                        result: Self::format_outcome(outcome),
                        detail: truncate(&Self::outcome_detail(outcome), 60),
                    })
                    .collect();

                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let status = if report.is_success() {
                    format!("{} Complete", "✓".green())
                } else if report.cancelled {
                    format!("{} Cancelled", "⚠".yellow())
                } else {
                    format!("{} Finished with errors", "✗".red())
                };
                let _ = writeln!(
                    output,
                    "\n{status}: {} applied, {} unchanged, {} failed, {} pending ({}s)",
                    report.count("applied"),
                    report.count("skipped"),
                    report.count("failed"),
                    report.count("pending"),
                    (report.finished_at - report.started_at).num_seconds()
                );
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!("{} No drift detected - state is converged.\n", "✓".green());
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for resource in &report.resources {
                    match &resource.status {
                        DriftStatus::InSync => {}
                        DriftStatus::Missing => {
                            let _ = writeln!(
                                output,
                                "   {} {} ({}) no longer exists",
                                "-".red(),
                                resource.key,
                                resource.remote_id
                            );
                        }
                        DriftStatus::Changed { attributes } => {
                            let _ = writeln!(output, "   {} {}", "~".yellow(), resource.key);
                            for attr in attributes {
                                let _ = writeln!(
                                    output,
                                    "       {}: {} -> {}",
                                    attr.attribute,
                                    render(&attr.recorded),
                                    render(&attr.remote)
                                );
                            }
                        }
                        DriftStatus::Unreadable { reason } => {
                            let _ =
                                writeln!(output, "   {} {}: {reason}", "?".dimmed(), resource.key);
                        }
                    }
                }
                for key in &report.not_applied {
                    let _ = writeln!(output, "   {} {key} not applied yet", "+".green());
                }
                for key in &report.undeclared {
                    let _ = writeln!(output, "   {} {key} no longer declared", "-".red());
                }
                output
            }
        }
    }

    /// Formats a reconciliation result.
    #[must_use]
    pub fn format_reconciliation(&self, result: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => to_json(result),
            OutputFormat::Text => {
                let status = if result.converged {
                    format!("{} Reconciliation converged", "✓".green())
                } else {
                    format!("{} Reconciliation did not converge", "✗".red())
                };

                let mut output = format!("{status} after {} pass(es)\n", result.attempts);
                for (i, report) in result.reports.iter().enumerate() {
                    let _ = writeln!(
                        output,
                        "   Pass {}: {} applied, {} failed, {} pending",
                        i + 1,
                        report.count("applied"),
                        report.count("failed"),
                        report.count("pending")
                    );
                    if let Some(failures) = report.failure_summary() {
                        let _ = writeln!(output, "      {failures}");
                    }
                }
                output
            }
        }
    }

    /// Formats a state document.
    #[must_use]
    pub fn format_state(&self, state: &StateDocument, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = writeln!(output, "\nState: {}/{}\n", state.stack, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                match lock {
                    Some(lock) if !lock.is_expired() => {
                        let _ = writeln!(
                            output,
                            "   Lock: {} by {} ({}s left)",
                            lock.lock_id,
                            lock.holder,
                            lock.remaining_secs()
                        );
                    }
                    _ => {
                        let _ = writeln!(output, "   Lock: none");
                    }
                }

                if !state.records.is_empty() {
                    output.push('\n');
                    let rows: Vec<RecordRow> = state
                        .records
                        .values()
                        .map(|r| RecordRow {
                            resource: r.key.to_string(),
                            id: r.remote_id.clone(),
                            dependencies: truncate(
                                &r.dependencies
                                    .iter()
                                    .map(ToString::to_string)
                                    .collect::<Vec<_>>()
                                    .join(", "),
                                40,
                            ),
                            updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.pending.is_empty() {
                    let _ = writeln!(output, "\n{} Interrupted operations:", "⚠".yellow());
                    for (key, pending) in &state.pending {
                        let _ = writeln!(
                            output,
                            "     {key}: {} since {}",
                            pending.operation,
                            pending.started_at.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }

                if !state.superseded.is_empty() {
                    let _ = writeln!(output, "\n{} Old objects awaiting deletion:", "⚠".yellow());
                    for old in &state.superseded {
                        let _ = writeln!(
                            output,
                            "     {}: {} since {}",
                            old.key,
                            old.remote_id,
                            old.since.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} resources)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.len()
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats a validation result together with the resource graph.
    #[must_use]
    pub fn format_validation(
        &self,
        result: &ValidationResult,
        graph: &ResourceGraph,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "resources": graph.len(),
                "edges": graph.edges().len(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = format!(
                    "{} Description is valid: {} resources, {} dependency edges\n",
                    "✓".green(),
                    graph.len(),
                    graph.edges().len()
                );
                if show_warnings && !result.warnings.is_empty() {
                    output.push_str("\nWarnings:\n");
                    for warning in &result.warnings {
                        let _ = writeln!(output, "  {} {warning}", "⚠".yellow());
                    }
                }
                output
            }
        }
    }

    /// Formats a status message.
    #[must_use]
    pub fn message(&self, status: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                to_json(&serde_json::json!({ "status": status, "message": message }))
            }
            OutputFormat::Text => {
                let marker = match status {
                    "success" => "✓".green(),
                    "error" => "✗".red(),
                    _ => "⚠".yellow(),
                };
                format!("{marker} {message}")
            }
        }
    }

    fn format_action(action: &Action) -> String {
        let label = format!("{}{}", action.kind.symbol(), action.label());
        match action.kind {
            ActionKind::Create => label.green().to_string(),
            ActionKind::Update { .. } => label.yellow().to_string(),
            ActionKind::Replace { .. } => label.magenta().to_string(),
            ActionKind::Destroy => label.red().to_string(),
            ActionKind::NoOp => label.dimmed().to_string(),
        }
    }

    fn format_outcome(outcome: &ResourceOutcome) -> String {
        match outcome {
            ResourceOutcome::Applied { action, .. } => action.green().to_string(),
            ResourceOutcome::Skipped => "no-op".dimmed().to_string(),
            ResourceOutcome::Failed { .. } => "failed".red().to_string(),
            ResourceOutcome::Pending { .. } => "pending".yellow().to_string(),
        }
    }

    fn outcome_detail(outcome: &ResourceOutcome) -> String {
        match outcome {
            ResourceOutcome::Applied { remote_id, .. } => remote_id.clone().unwrap_or_default(),
            ResourceOutcome::Skipped => String::new(),
            ResourceOutcome::Failed { reason, .. } => reason.clone(),
            ResourceOutcome::Pending { blocked_by } if blocked_by.is_empty() => {
                String::from("not dispatched")
            }
            ResourceOutcome::Pending { blocked_by } => format!(
                "blocked by {}",
                blocked_by
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }

    fn change_names(changes: &[AttributeChange]) -> String {
        changes
            .iter()
            .map(|c| {
                if c.forces_replacement {
                    format!("{}!", c.attribute)
                } else {
                    c.attribute.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn format_change(change: &AttributeChange) -> String {
        let before = change.before.as_ref().map_or_else(|| String::from("(none)"), render);
        let after = match &change.after {
            Some(ResolvedValue::Known(value)) => render(value),
            Some(ResolvedValue::Unknown) => String::from("(known after apply)"),
            None => String::from("(removed)"),
        };
        let note = if change.forces_replacement {
            format!(" {}", "# forces replacement".magenta())
        } else {
            String::new()
        };
        format!("{}: {before} -> {after}{note}", change.attribute)
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{s}\""),
        other => other.to_string(),
    }
}

fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

/// Truncates a string to a maximum number of characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// JSON serialization helpers

#[derive(serde::Serialize)]
struct PlanJson {
    mode: PlanMode,
    stack: String,
    environment: String,
    description_hash: String,
    state_serial: u64,
    summary: crate::planner::PlanSummary,
    batches: Vec<Vec<ActionJson>>,
    superseded: Vec<SupersededJson>,
}

#[derive(serde::Serialize)]
struct ActionJson {
    resource: String,
    action: &'static str,
    changes: Vec<ChangeJson>,
}

#[derive(serde::Serialize)]
struct SupersededJson {
    resource: String,
    remote_id: String,
}

#[derive(serde::Serialize)]
struct ChangeJson {
    attribute: String,
    before: Option<Value>,
    after: Option<Value>,
    known_after_apply: bool,
    forces_replacement: bool,
}

impl From<&AttributeChange> for ChangeJson {
    fn from(change: &AttributeChange) -> Self {
        let (after, known_after_apply) = match &change.after {
            Some(ResolvedValue::Known(value)) => (Some(value.clone()), false),
            Some(ResolvedValue::Unknown) => (None, true),
            None => (None, false),
        };
        Self {
            attribute: change.attribute.clone(),
            before: change.before.clone(),
            after,
            known_after_apply,
            forces_replacement: change.forces_replacement,
        }
    }
}

impl From<&Plan> for PlanJson {
    fn from(plan: &Plan) -> Self {
        Self {
            mode: plan.mode,
            stack: plan.stack.clone(),
            environment: plan.environment.clone(),
            description_hash: plan.description_hash.clone(),
            state_serial: plan.state_serial,
            summary: plan.summary(),
            batches: plan
                .batches
                .iter()
                .map(|batch| {
                    batch
                        .actions
                        .iter()
                        .map(|a| ActionJson {
                            resource: a.key.to_string(),
                            action: a.label(),
                            changes: a.changes().iter().map(ChangeJson::from).collect(),
                        })
                        .collect()
                })
                .collect(),
            superseded: plan
                .superseded
                .iter()
                .map(|(key, remote_id)| SupersededJson {
                    resource: key.to_string(),
                    remote_id: remote_id.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééééééééé", 6), "ééé...");
    }

    #[test]
    fn test_change_rendering() {
        let change = AttributeChange {
            attribute: String::from("vpc_id"),
            before: Some(json!("vpc-1")),
            after: Some(ResolvedValue::Unknown),
            forces_replacement: true,
        };
        colored::control::set_override(false);
        let text = OutputFormatter::format_change(&change);
        assert_eq!(text, "vpc_id: \"vpc-1\" -> (known after apply) # forces replacement");

        let encoded = serde_json::to_value(ChangeJson::from(&change)).expect("json");
        assert_eq!(encoded["known_after_apply"], json!(true));
        assert_eq!(encoded["after"], Value::Null);
    }

    #[test]
    fn test_plan_lists_old_objects_awaiting_deletion() {
        let key = crate::config::ResourceKey::new("aws_vpc", "main");
        let plan = crate::planner::Planner::new()
            .build(Vec::new(), PlanMode::Apply, "abcdef0123", 4)
            .expect("plan")
            .with_superseded(vec![(key, String::from("vpc-old"))]);

        colored::control::set_override(false);
        let text = OutputFormatter::format_plan_text(&plan, false);
        assert!(text.contains("-destroy old"), "{text}");
        assert!(text.contains("vpc-old"), "{text}");
        assert!(text.contains("0 to create, 0 to update, 0 to replace, 1 to destroy"));

        let encoded = serde_json::to_value(PlanJson::from(&plan)).expect("json");
        assert_eq!(encoded["superseded"][0]["remote_id"], json!("vpc-old"));
        assert_eq!(encoded["batches"], json!([]));
    }
}
