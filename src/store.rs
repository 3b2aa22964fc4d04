//! SCD Type 2 dimension store.
//!
//! One store per versioned dimension. Each business key owns an ordered list
//! of versions; at most one version is current, and closing the old version
//! and opening the new one happen under the same exclusive entry guard, so
//! concurrent resolution for one key can never observe two current rows or a
//! validity gap.

use crate::error::{DwhError, Result};
use crate::model::{
    AttrValue, AttributeMap, BusinessKey, DimensionRow, DimensionSnapshot, UNKNOWN_KEY,
};
use chrono::NaiveDateTime;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

/// Point-in-time copy of a store's state, used to roll back a run whose
/// persistence step failed.
#[derive(Debug, Clone)]
pub struct StoreCheckpoint {
    versions: Vec<(BusinessKey, Vec<DimensionRow>)>,
    next_key: i64,
}

pub struct DimensionStore {
    name: String,
    tracked: Vec<String>,
    unknown: DimensionRow,
    versions: DashMap<BusinessKey, Vec<DimensionRow>>,
    next_key: AtomicI64,
}

impl DimensionStore {
    /// Create a store with its Unknown member pre-seeded at surrogate key 0.
    /// Surrogate allocation for real entities starts at 1.
    pub fn new(
        name: impl Into<String>,
        tracked: Vec<String>,
        unknown_attributes: AttributeMap,
    ) -> Self {
        DimensionStore {
            name: name.into(),
            tracked,
            unknown: DimensionRow::unknown(unknown_attributes),
            versions: DashMap::new(),
            next_key: AtomicI64::new(UNKNOWN_KEY + 1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve a business key to its surrogate key, creating or versioning
    /// rows as needed.
    ///
    /// - first sighting inserts a new current row;
    /// - unchanged tracked attributes return the existing key (idempotent);
    /// - changed tracked attributes close the current row at `observed_at`
    ///   and insert a new row with a fresh surrogate key.
    pub fn resolve_or_create(
        &self,
        business_key: &BusinessKey,
        attributes: &AttributeMap,
        observed_at: NaiveDateTime,
    ) -> Result<i64> {
        if business_key.is_blank() {
            return Err(DwhError::Validation(format!(
                "Missing or empty business key for dimension '{}'",
                self.name
            )));
        }

        // The entry guard is the per-(dimension, business key) critical
        // section: close-old and insert-new are not observable separately.
        let mut versions = self.versions.entry(business_key.clone()).or_default();

        if let Some(current) = versions.iter_mut().rev().find(|r| r.is_current) {
            if self.tracked_equal(&current.attributes, attributes) {
                return Ok(current.surrogate_key);
            }
            let old_key = current.surrogate_key;
            current.valid_to = Some(observed_at);
            current.is_current = false;
            let new_key = self.allocate_key();
            debug!(
                dimension = %self.name,
                business_key = %business_key,
                old_key,
                new_key,
                "tracked attributes changed, opening new version"
            );
            versions.push(DimensionRow {
                surrogate_key: new_key,
                business_key: business_key.clone(),
                attributes: attributes.clone(),
                valid_from: observed_at,
                valid_to: None,
                is_current: true,
            });
            return Ok(new_key);
        }

        let key = self.allocate_key();
        versions.push(DimensionRow {
            surrogate_key: key,
            business_key: business_key.clone(),
            attributes: attributes.clone(),
            valid_from: observed_at,
            valid_to: None,
            is_current: true,
        });
        Ok(key)
    }

    /// Surrogate key of the current version, if the business key is known.
    pub fn current_key(&self, business_key: &BusinessKey) -> Option<i64> {
        self.versions.get(business_key).and_then(|versions| {
            versions
                .iter()
                .rev()
                .find(|r| r.is_current)
                .map(|r| r.surrogate_key)
        })
    }

    /// Temporal-window lookup: the version whose `[valid_from, valid_to)`
    /// window contains `at`.
    pub fn key_as_of(&self, business_key: &BusinessKey, at: NaiveDateTime) -> Option<i64> {
        self.versions.get(business_key).and_then(|versions| {
            versions
                .iter()
                .find(|r| {
                    r.valid_from <= at && r.valid_to.map_or(true, |closed| at < closed)
                })
                .map(|r| r.surrogate_key)
        })
    }

    /// Ordered snapshot of every version, Unknown member first.
    pub fn snapshot(&self) -> DimensionSnapshot {
        let mut rows = vec![self.unknown.clone()];
        for entry in self.versions.iter() {
            rows.extend(entry.value().iter().cloned());
        }
        DimensionSnapshot::from_rows(self.name.clone(), rows)
    }

    /// Copy of the current state, restorable with [`DimensionStore::restore`].
    pub fn checkpoint(&self) -> StoreCheckpoint {
        StoreCheckpoint {
            versions: self
                .versions
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            next_key: self.next_key.load(Ordering::SeqCst),
        }
    }

    /// Roll the store back to a checkpoint taken earlier in the run.
    pub fn restore(&self, checkpoint: StoreCheckpoint) {
        self.versions.clear();
        for (key, versions) in checkpoint.versions {
            self.versions.insert(key, versions);
        }
        self.next_key.store(checkpoint.next_key, Ordering::SeqCst);
    }

    fn allocate_key(&self) -> i64 {
        self.next_key.fetch_add(1, Ordering::SeqCst)
    }

    /// Compare only the tracked attribute subset. An absent attribute and an
    /// explicit null are the same thing; null and empty string are not.
    fn tracked_equal(&self, existing: &AttributeMap, incoming: &AttributeMap) -> bool {
        self.tracked.iter().all(|attr| {
            let old = existing.get(attr).unwrap_or(&AttrValue::Null);
            let new = incoming.get(attr).unwrap_or(&AttrValue::Null);
            old == new
        })
    }
}
