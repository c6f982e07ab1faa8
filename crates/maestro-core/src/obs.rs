//! Structured lifecycle events.
//!
//! Every event is an `info!` (or `warn!`/`error!`) record with an
//! `event = "<area>.<action>"` field, so log pipelines can filter on it.
//! [`WorkItemSpan`] ties all logs of one work item together.

use tracing::{error, info, warn};

use crate::merge_policy::MergePolicyEvaluationResults;

/// RAII guard entering a span for one work item.
///
/// ```ignore
/// let _span = WorkItemSpan::enter(&item.id.to_string(), item.type_name());
/// ```
pub struct WorkItemSpan {
    _span: tracing::span::EnteredSpan,
}

impl WorkItemSpan {
    pub fn enter(work_item_id: &str, work_item_type: &str) -> Self {
        let span = tracing::info_span!(
            "maestro.work_item",
            work_item_id = %work_item_id,
            work_item_type = %work_item_type,
        );
        Self {
            _span: span.entered(),
        }
    }

    /// The span itself, for instrumenting futures.
    pub fn span(work_item_id: &str, work_item_type: &str) -> tracing::Span {
        tracing::info_span!(
            "maestro.work_item",
            work_item_id = %work_item_id,
            work_item_type = %work_item_type,
        )
    }
}

pub fn emit_pr_created(actor: &str, pr_url: &str, updates: usize) {
    info!(event = "pr.created", actor = %actor, pr_url = %pr_url, updates = updates);
}

pub fn emit_pr_updated(actor: &str, pr_url: &str, updates: usize) {
    info!(event = "pr.updated", actor = %actor, pr_url = %pr_url, updates = updates);
}

pub fn emit_pr_merged(actor: &str, pr_url: &str) {
    info!(event = "pr.merged", actor = %actor, pr_url = %pr_url);
}

pub fn emit_pr_closed(actor: &str, pr_url: &str, reason: &str) {
    info!(event = "pr.closed", actor = %actor, pr_url = %pr_url, reason = %reason);
}

pub fn emit_pr_merge_conflict(actor: &str, pr_url: &str, retries: u32, manual: bool) {
    warn!(
        event = "pr.merge_conflict",
        actor = %actor,
        pr_url = %pr_url,
        retries = retries,
        needs_manual_attention = manual,
    );
}

pub fn emit_policy_evaluated(actor: &str, pr_url: &str, results: &MergePolicyEvaluationResults) {
    info!(
        event = "policy.evaluated",
        actor = %actor,
        pr_url = %pr_url,
        policies = results.results.len(),
        succeeded = results.succeeded(),
        pending = results.pending(),
        failed = results.failed(),
    );
}

pub fn emit_work_item_completed(work_item_id: &str, work_item_type: &str, outcome: &str) {
    info!(
        event = "work_item.completed",
        work_item_id = %work_item_id,
        work_item_type = %work_item_type,
        outcome = %outcome,
    );
}

pub fn emit_work_item_retry(work_item_type: &str, method: &str, attempt: u32, error: &dyn std::fmt::Display) {
    warn!(
        event = "work_item.retry_scheduled",
        work_item_type = %work_item_type,
        method = %method,
        attempt = attempt,
        error = %error,
    );
}

pub fn emit_work_item_dead_lettered(work_item_id: &str, attempts: u32, reason: &dyn std::fmt::Display) {
    error!(
        event = "work_item.dead_lettered",
        work_item_id = %work_item_id,
        attempts = attempts,
        reason = %reason,
    );
}

pub fn emit_longest_path(channel_id: i64, best_case_minutes: f64, worst_case_minutes: f64, repositories: &str) {
    info!(
        event = "graph.longest_path",
        channel_id = channel_id,
        best_case_minutes = best_case_minutes,
        worst_case_minutes = worst_case_minutes,
        contributing_repositories = %repositories,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_item_span_enter() {
        let _span = WorkItemSpan::enter("00000000-0000-0000-0000-000000000000", "CodeFlow");
        emit_work_item_completed("id", "CodeFlow", "completed");
    }
}
