//! Process-wide counters for the flow engine.
//!
//! Call sites increment silently; [`Metrics::flush`] emits every value in a
//! single `info!` event, which the daemon does on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

/// Atomic counters, no locking.
pub struct Metrics {
    work_items_processed: AtomicU64,
    work_items_failed: AtomicU64,
    work_items_dead_lettered: AtomicU64,
    prs_created: AtomicU64,
    prs_updated: AtomicU64,
    prs_merged: AtomicU64,
    policy_evaluations: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($field), "counter incremented");
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            work_items_processed: AtomicU64::new(0),
            work_items_failed: AtomicU64::new(0),
            work_items_dead_lettered: AtomicU64::new(0),
            prs_created: AtomicU64::new(0),
            prs_updated: AtomicU64::new(0),
            prs_merged: AtomicU64::new(0),
            policy_evaluations: AtomicU64::new(0),
        }
    }

    counter!(inc_work_items_processed, work_items_processed, work_items_processed);
    counter!(inc_work_items_failed, work_items_failed, work_items_failed);
    counter!(inc_work_items_dead_lettered, work_items_dead_lettered, work_items_dead_lettered);
    counter!(inc_prs_created, prs_created, prs_created);
    counter!(inc_prs_updated, prs_updated, prs_updated);
    counter!(inc_prs_merged, prs_merged, prs_merged);
    counter!(inc_policy_evaluations, policy_evaluations, policy_evaluations);

    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            work_items_processed = self.work_items_processed(),
            work_items_failed = self.work_items_failed(),
            work_items_dead_lettered = self.work_items_dead_lettered(),
            prs_created = self.prs_created(),
            prs_updated = self.prs_updated(),
            prs_merged = self.prs_merged(),
            policy_evaluations = self.policy_evaluations(),
        );
    }

    /// Zero every counter (tests).
    pub fn reset(&self) {
        for counter in [
            &self.work_items_processed,
            &self.work_items_failed,
            &self.work_items_dead_lettered,
            &self.prs_created,
            &self.prs_updated,
            &self.prs_merged,
            &self.policy_evaluations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
