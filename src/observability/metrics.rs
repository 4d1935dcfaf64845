//! Metrics registry for the storage engine
//!
//! - Counters only, monotonic, reset on process start
//! - Atomic, lock-free increments

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters of one storage manager
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    field_reads: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_discarded: AtomicU64,
    fields_written: AtomicU64,
    blocks_created: AtomicU64,
    clears_completed: AtomicU64,
    clears_failed: AtomicU64,
    integrity_checks: AtomicU64,
    integrity_failures: AtomicU64,
    defragmentations: AtomicU64,
    storage_errors: AtomicU64,
    mirror_repairs: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_field_reads(&self) {
        self.field_reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a committed transaction that wrote `fields` field values
    pub fn record_commit(&self, fields: u64) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
        self.fields_written.fetch_add(fields, Ordering::Relaxed);
    }

    pub fn increment_discarded(&self) {
        self.transactions_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_blocks_created(&self) {
        self.blocks_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_clears(&self) {
        self.clears_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_clear_failures(&self) {
        self.clears_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one integrity check and its outcome
    pub fn record_integrity_check(&self, passed: bool) {
        self.integrity_checks.fetch_add(1, Ordering::Relaxed);
        if !passed {
            self.integrity_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn increment_defragmentations(&self) {
        self.defragmentations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_storage_errors(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_mirror_repairs(&self) {
        self.mirror_repairs.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            field_reads: self.field_reads.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_discarded: self.transactions_discarded.load(Ordering::Relaxed),
            fields_written: self.fields_written.load(Ordering::Relaxed),
            blocks_created: self.blocks_created.load(Ordering::Relaxed),
            clears_completed: self.clears_completed.load(Ordering::Relaxed),
            clears_failed: self.clears_failed.load(Ordering::Relaxed),
            integrity_checks: self.integrity_checks.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            defragmentations: self.defragmentations.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            mirror_repairs: self.mirror_repairs.load(Ordering::Relaxed),
        }
    }

    /// Snapshot rendered as a JSON object
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Point-in-time copy of [`MetricsRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub field_reads: u64,
    pub transactions_committed: u64,
    pub transactions_discarded: u64,
    pub fields_written: u64,
    pub blocks_created: u64,
    pub clears_completed: u64,
    pub clears_failed: u64,
    pub integrity_checks: u64,
    pub integrity_failures: u64,
    pub defragmentations: u64,
    pub storage_errors: u64,
    pub mirror_repairs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let metrics = MetricsRegistry::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.transactions_committed, 0);
        assert_eq!(snap.integrity_failures, 0);
    }

    #[test]
    fn test_record_commit_counts_fields() {
        let metrics = MetricsRegistry::new();
        metrics.record_commit(3);
        metrics.record_commit(2);
        let snap = metrics.snapshot();
        assert_eq!(snap.transactions_committed, 2);
        assert_eq!(snap.fields_written, 5);
    }

    #[test]
    fn test_integrity_failures_counted_separately() {
        let metrics = MetricsRegistry::new();
        metrics.record_integrity_check(true);
        metrics.record_integrity_check(false);
        let snap = metrics.snapshot();
        assert_eq!(snap.integrity_checks, 2);
        assert_eq!(snap.integrity_failures, 1);
    }

    #[test]
    fn test_to_json() {
        let metrics = MetricsRegistry::new();
        metrics.increment_mirror_repairs();
        let parsed: serde_json::Value = serde_json::from_str(&metrics.to_json()).unwrap();
        assert_eq!(parsed["mirror_repairs"], 1);
    }
}
