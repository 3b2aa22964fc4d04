//! Run-level data-quality counters.
//!
//! Per-row failures never abort a batch; they are logged, counted here and
//! the row is skipped. Lookup misses are not failures at all, only a soft
//! metric. The counters are shared across category workers, so everything
//! sits behind locks.

use crate::model::QualitySummary;
use std::collections::BTreeMap;
use std::sync::Mutex;

pub const SKIP_MISSING_BUSINESS_KEY: &str = "missing_business_key";
pub const SKIP_INVALID_TIMESTAMP: &str = "invalid_timestamp";
pub const SKIP_MISSING_REQUIRED_FIELD: &str = "missing_required_field";
pub const SKIP_INVALID_SPEED_VIOLATION: &str = "invalid_speed_violation";

#[derive(Debug, Default)]
pub struct QualityCounters {
    source_rows_total: Mutex<u64>,
    fact_rows_emitted: Mutex<u64>,
    skipped: Mutex<BTreeMap<String, u64>>,
    lookup_misses: Mutex<BTreeMap<String, u64>>,
}

impl QualityCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source_rows(&self, count: u64) {
        *self.source_rows_total.lock().unwrap() += count;
    }

    pub fn record_fact_emitted(&self) {
        *self.fact_rows_emitted.lock().unwrap() += 1;
    }

    pub fn record_skip(&self, reason: &str) {
        let mut skipped = self.skipped.lock().unwrap();
        *skipped.entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn record_lookup_miss(&self, fk_field: &str) {
        let mut misses = self.lookup_misses.lock().unwrap();
        *misses.entry(fk_field.to_string()).or_insert(0) += 1;
    }

    pub fn skipped_total(&self) -> u64 {
        self.skipped.lock().unwrap().values().sum()
    }

    pub fn summary(&self) -> QualitySummary {
        QualitySummary {
            source_rows_total: *self.source_rows_total.lock().unwrap(),
            fact_rows_emitted: *self.fact_rows_emitted.lock().unwrap(),
            rows_skipped_by_reason: self.skipped.lock().unwrap().clone(),
            lookup_misses: self.lookup_misses.lock().unwrap().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_aggregate_into_summary() {
        let counters = QualityCounters::new();
        counters.add_source_rows(10);
        counters.record_fact_emitted();
        counters.record_fact_emitted();
        counters.record_skip(SKIP_INVALID_SPEED_VIOLATION);
        counters.record_skip(SKIP_INVALID_TIMESTAMP);
        counters.record_skip(SKIP_INVALID_TIMESTAMP);
        counters.record_lookup_miss("location_key");

        let summary = counters.summary();
        assert_eq!(summary.source_rows_total, 10);
        assert_eq!(summary.fact_rows_emitted, 2);
        assert_eq!(
            summary.rows_skipped_by_reason[SKIP_INVALID_SPEED_VIOLATION],
            1
        );
        assert_eq!(summary.rows_skipped_by_reason[SKIP_INVALID_TIMESTAMP], 2);
        assert_eq!(summary.rows_skipped_total(), 3);
        assert_eq!(summary.lookup_misses["location_key"], 1);
    }
}
