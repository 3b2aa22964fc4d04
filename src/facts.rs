//! Fact resolution.
//!
//! Consumes raw event rows plus the current dimension snapshots and produces
//! fully-keyed fact rows. Every foreign key resolves to a surrogate key that
//! exists in its dimension; a failed lookup resolves to the Unknown member
//! (key 0) and is counted as a soft miss, never an error. Per-row failures
//! (malformed timestamp, absent required field) skip the row and never abort
//! the batch.

use crate::calendar::{date_key, time_key};
use crate::config::{EtlConfig, UnmappedSeverityPolicy};
use crate::data_utils::parse_event_timestamp;
use crate::error::{DwhError, Result};
use crate::model::{
    BusinessKey, DimensionSnapshot, FactRow, DIM_DATE, DIM_ENVIRONMENTAL, DIM_EVENT_TYPE,
    DIM_LOCATION, DIM_TIME, DIM_VEHICLE, UNKNOWN_KEY,
};
use crate::quality::{
    QualityCounters, SKIP_INVALID_SPEED_VIOLATION, SKIP_INVALID_TIMESTAMP,
    SKIP_MISSING_REQUIRED_FIELD,
};
use crate::records::{
    AccidentRow, CongestionRow, EventCategory, FlowRow, RoadClosureRow, SourceBatch,
    SpeedViolationRow,
};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use lazy_static::lazy_static;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::{info, warn};

lazy_static! {
    static ref ACCIDENT_SEVERITY_SCORES: HashMap<&'static str, f64> = {
        let mut m = HashMap::new();
        m.insert("Minor", 1.0);
        m.insert("Moderate", 2.0);
        m.insert("Severe", 3.0);
        m.insert("Fatal", 4.0);
        m
    };
    static ref CONGESTION_LEVEL_SCORES: HashMap<&'static str, f64> = {
        let mut m = HashMap::new();
        m.insert("Low", 1.0);
        m.insert("Medium", 2.0);
        m.insert("Moderate", 2.0);
        m.insert("High", 3.0);
        m.insert("Severe", 4.0);
        m
    };
}

/// Severity assumed when an accident row carries none.
const DEFAULT_ACCIDENT_SEVERITY: &str = "Moderate";

/// Shared monotonic event-id counter. Ids are allocated under the lock and
/// only for rows that produce a fact record, so the successful sequence has
/// no gaps and no reuse even with category workers running in parallel.
#[derive(Debug)]
pub struct EventIdAllocator {
    next: Mutex<i64>,
}

impl EventIdAllocator {
    pub fn new() -> Self {
        EventIdAllocator { next: Mutex::new(1) }
    }

    pub fn allocate(&self) -> i64 {
        let mut next = self.next.lock().unwrap();
        let id = *next;
        *next += 1;
        id
    }
}

impl Default for EventIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Day-bucketed index over the daily-aggregated environmental dimension.
/// Exact calendar-day match by default; with a tolerance, the nearest day
/// within it wins and ties break toward the earlier day.
#[derive(Debug)]
struct EnvironmentalIndex {
    by_day: BTreeMap<NaiveDate, i64>,
    tolerance_days: i64,
}

impl EnvironmentalIndex {
    fn build(snapshot: Option<&DimensionSnapshot>, tolerance_days: i64) -> Self {
        let mut by_day = BTreeMap::new();
        if let Some(snapshot) = snapshot {
            for row in &snapshot.rows {
                if row.surrogate_key == UNKNOWN_KEY || !row.is_current {
                    continue;
                }
                if let Some(component) = row.business_key.components().first() {
                    if let Ok(day) = NaiveDate::parse_from_str(component, "%Y-%m-%d") {
                        by_day.insert(day, row.surrogate_key);
                    }
                }
            }
        }
        EnvironmentalIndex {
            by_day,
            tolerance_days,
        }
    }

    fn lookup(&self, day: NaiveDate) -> Option<i64> {
        if let Some(key) = self.by_day.get(&day) {
            return Some(*key);
        }
        if self.tolerance_days == 0 {
            return None;
        }
        let window_start = day - Duration::days(self.tolerance_days);
        let window_end = day + Duration::days(self.tolerance_days);
        let mut best: Option<(i64, i64)> = None;
        for (candidate, key) in self.by_day.range(window_start..=window_end) {
            let distance = (*candidate - day).num_days().abs();
            // Strict < keeps the earlier day on equal distance.
            if best.map_or(true, |(d, _)| distance < d) {
                best = Some((distance, *key));
            }
        }
        best.map(|(_, key)| key)
    }
}

/// Why a row was dropped instead of producing a fact record.
enum RowSkip {
    MissingField(&'static str),
    BadTimestamp(String),
    NotAViolation,
}

impl RowSkip {
    fn reason(&self) -> &'static str {
        match self {
            RowSkip::MissingField(_) => SKIP_MISSING_REQUIRED_FIELD,
            RowSkip::BadTimestamp(_) => SKIP_INVALID_TIMESTAMP,
            RowSkip::NotAViolation => SKIP_INVALID_SPEED_VIOLATION,
        }
    }

    fn describe(&self) -> String {
        match self {
            RowSkip::MissingField(field) => format!("missing required field '{}'", field),
            RowSkip::BadTimestamp(raw) => format!("malformed timestamp '{}'", raw),
            RowSkip::NotAViolation => "recorded speed does not exceed the limit".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct FactResolver<'a> {
    config: &'a EtlConfig,
    date: &'a DimensionSnapshot,
    time: &'a DimensionSnapshot,
    location: &'a DimensionSnapshot,
    event_type: &'a DimensionSnapshot,
    vehicle: Option<&'a DimensionSnapshot>,
    env_index: EnvironmentalIndex,
    event_ids: EventIdAllocator,
}

impl<'a> FactResolver<'a> {
    /// Validate the dimension set up front: resolution without the date,
    /// time, location or event-type snapshot is a configuration failure
    /// before any row is processed.
    pub fn new(
        config: &'a EtlConfig,
        dimensions: &'a HashMap<String, DimensionSnapshot>,
    ) -> Result<Self> {
        let required = |name: &str| -> Result<&'a DimensionSnapshot> {
            dimensions.get(name).ok_or_else(|| {
                DwhError::Configuration(format!(
                    "Missing required dimension snapshot '{}' for fact resolution",
                    name
                ))
            })
        };
        Ok(FactResolver {
            config,
            date: required(DIM_DATE)?,
            time: required(DIM_TIME)?,
            location: required(DIM_LOCATION)?,
            event_type: required(DIM_EVENT_TYPE)?,
            vehicle: dimensions.get(DIM_VEHICLE),
            env_index: EnvironmentalIndex::build(
                dimensions.get(DIM_ENVIRONMENTAL),
                config.environmental_tolerance_days,
            ),
            event_ids: EventIdAllocator::new(),
        })
    }

    /// Process the five source categories in fixed order and return the fact
    /// rows in category-then-row order.
    pub fn resolve_batch(&self, batch: &SourceBatch, quality: &QualityCounters) -> Vec<FactRow> {
        quality.add_source_rows(batch.fact_source_rows());

        let mut facts = Vec::new();
        for category in EventCategory::ALL {
            let before = facts.len();
            match category {
                EventCategory::Flow => {
                    for row in &batch.flow {
                        self.push_row(self.flow_fact(row, quality), category, quality, &mut facts);
                    }
                }
                EventCategory::Accident => {
                    for row in &batch.accidents {
                        self.push_row(
                            self.accident_fact(row, quality),
                            category,
                            quality,
                            &mut facts,
                        );
                    }
                }
                EventCategory::Congestion => {
                    for row in &batch.congestion {
                        self.push_row(
                            self.congestion_fact(row, quality),
                            category,
                            quality,
                            &mut facts,
                        );
                    }
                }
                EventCategory::SpeedViolation => {
                    for row in &batch.speed_violations {
                        self.push_row(
                            self.speed_violation_fact(row, quality),
                            category,
                            quality,
                            &mut facts,
                        );
                    }
                }
                EventCategory::RoadClosure => {
                    for row in &batch.road_closures {
                        self.push_row(
                            self.road_closure_fact(row, quality),
                            category,
                            quality,
                            &mut facts,
                        );
                    }
                }
            }
            info!(
                source = category.source_table(),
                emitted = facts.len() - before,
                "resolved fact category"
            );
        }
        facts
    }

    fn push_row(
        &self,
        outcome: std::result::Result<FactRow, RowSkip>,
        category: EventCategory,
        quality: &QualityCounters,
        facts: &mut Vec<FactRow>,
    ) {
        match outcome {
            Ok(fact) => {
                quality.record_fact_emitted();
                facts.push(fact);
            }
            Err(skip) => {
                warn!(
                    source = category.source_table(),
                    reason = skip.reason(),
                    "skipping row: {}",
                    skip.describe()
                );
                quality.record_skip(skip.reason());
            }
        }
    }

    fn event_time(
        &self,
        raw: Option<&str>,
        field: &'static str,
    ) -> std::result::Result<NaiveDateTime, RowSkip> {
        let raw = raw.ok_or(RowSkip::MissingField(field))?;
        parse_event_timestamp(raw).map_err(|_| RowSkip::BadTimestamp(raw.to_string()))
    }

    /// Foreign keys shared by every category: date, time, location and
    /// environmental, each falling back to Unknown on a miss.
    fn common_keys(
        &self,
        at: NaiveDateTime,
        location: Option<&str>,
        source_table: &str,
        quality: &QualityCounters,
    ) -> (i64, i64, i64, i64) {
        let dk = date_key(at.date());
        let dk = if self.date.contains_key(dk) {
            dk
        } else {
            quality.record_lookup_miss("date_key");
            UNKNOWN_KEY
        };

        let tk = time_key(at);
        let tk = if self.time.contains_key(tk) {
            tk
        } else {
            quality.record_lookup_miss("time_key");
            UNKNOWN_KEY
        };

        let lk = match location {
            Some(name) => self
                .location
                .current_key(&BusinessKey::pair(name, source_table)),
            None => None,
        };
        let lk = match lk {
            Some(key) => key,
            None => {
                quality.record_lookup_miss("location_key");
                UNKNOWN_KEY
            }
        };

        let ek = match self.env_index.lookup(at.date()) {
            Some(key) => key,
            None => {
                quality.record_lookup_miss("environmental_key");
                UNKNOWN_KEY
            }
        };

        (dk, tk, lk, ek)
    }

    fn event_type_key(&self, code: &str, quality: &QualityCounters) -> i64 {
        match self.event_type.current_key(&BusinessKey::single(code)) {
            Some(key) => key,
            None => {
                quality.record_lookup_miss("event_type_key");
                UNKNOWN_KEY
            }
        }
    }

    fn flow_fact(
        &self,
        row: &FlowRow,
        quality: &QualityCounters,
    ) -> std::result::Result<FactRow, RowSkip> {
        let at = self.event_time(row.timestamp.as_deref(), "Timestamp")?;
        let vehicle_count = row
            .vehicle_count
            .ok_or(RowSkip::MissingField("VehicleCount"))?;

        Ok(self.assemble(
            at,
            row.location.as_deref(),
            EventCategory::Flow,
            "FLOW",
            UNKNOWN_KEY,
            [("vehicle_count".to_string(), vehicle_count as f64)].into(),
            quality,
        ))
    }

    fn accident_fact(
        &self,
        row: &AccidentRow,
        quality: &QualityCounters,
    ) -> std::result::Result<FactRow, RowSkip> {
        let at = self.event_time(row.reported_at.as_deref(), "ReportedAt")?;
        let vehicles_involved = row
            .vehicles_involved
            .ok_or(RowSkip::MissingField("VehiclesInvolved"))?;

        let severity = row.severity.as_deref().unwrap_or(DEFAULT_ACCIDENT_SEVERITY);
        let code = format!("ACC_{}", severity.to_uppercase());

        let mut measures = BTreeMap::new();
        measures.insert("vehicles_involved".to_string(), vehicles_involved as f64);
        match ACCIDENT_SEVERITY_SCORES.get(severity) {
            Some(score) => {
                measures.insert("incident_severity_score".to_string(), *score);
            }
            None => match self.config.unmapped_severity_policy {
                UnmappedSeverityPolicy::Zero => {
                    measures.insert("incident_severity_score".to_string(), 0.0);
                }
                UnmappedSeverityPolicy::Omit => {}
            },
        }

        Ok(self.assemble(
            at,
            row.location.as_deref(),
            EventCategory::Accident,
            &code,
            UNKNOWN_KEY,
            measures,
            quality,
        ))
    }

    fn congestion_fact(
        &self,
        row: &CongestionRow,
        quality: &QualityCounters,
    ) -> std::result::Result<FactRow, RowSkip> {
        let at = self.event_time(row.recorded_at.as_deref(), "RecordedAt")?;
        let level = row.level.as_deref().ok_or(RowSkip::MissingField("Level"))?;
        let code = format!("CONGESTION_{}", level.to_uppercase());
        let score = CONGESTION_LEVEL_SCORES.get(level).copied().unwrap_or(0.0);

        Ok(self.assemble(
            at,
            row.location.as_deref(),
            EventCategory::Congestion,
            &code,
            UNKNOWN_KEY,
            [("congestion_level_score".to_string(), score)].into(),
            quality,
        ))
    }

    fn speed_violation_fact(
        &self,
        row: &SpeedViolationRow,
        quality: &QualityCounters,
    ) -> std::result::Result<FactRow, RowSkip> {
        let recorded = row
            .speed_recorded
            .ok_or(RowSkip::MissingField("SpeedRecorded"))?;
        let limit = row.speed_limit.ok_or(RowSkip::MissingField("SpeedLimit"))?;
        // Not a genuine violation: dropped before any resolution work.
        if recorded <= limit {
            return Err(RowSkip::NotAViolation);
        }

        let at = self.event_time(row.timestamp.as_deref(), "Timestamp")?;

        let vehicle_key = match (&self.vehicle, row.vehicle_id.as_deref()) {
            (Some(snapshot), Some(id)) => match snapshot.current_key(&BusinessKey::single(id)) {
                Some(key) => key,
                None => {
                    quality.record_lookup_miss("vehicle_key");
                    UNKNOWN_KEY
                }
            },
            _ => {
                quality.record_lookup_miss("vehicle_key");
                UNKNOWN_KEY
            }
        };

        let mut measures = BTreeMap::new();
        measures.insert("avg_speed".to_string(), recorded);
        measures.insert("speed_excess".to_string(), recorded - limit);

        Ok(self.assemble(
            at,
            row.location.as_deref(),
            EventCategory::SpeedViolation,
            "SPEED_VIOLATION",
            vehicle_key,
            measures,
            quality,
        ))
    }

    fn road_closure_fact(
        &self,
        row: &RoadClosureRow,
        quality: &QualityCounters,
    ) -> std::result::Result<FactRow, RowSkip> {
        let at = self.event_time(row.closed_at.as_deref(), "ClosedAt")?;
        let duration = row
            .duration_minutes
            .unwrap_or(self.config.default_closure_duration_minutes);

        Ok(self.assemble(
            at,
            row.location.as_deref(),
            EventCategory::RoadClosure,
            "ROAD_CLOSURE",
            UNKNOWN_KEY,
            [("duration_minutes".to_string(), duration as f64)].into(),
            quality,
        ))
    }

    fn assemble(
        &self,
        at: NaiveDateTime,
        location: Option<&str>,
        category: EventCategory,
        event_type_code: &str,
        vehicle_key: i64,
        measures: BTreeMap<String, f64>,
        quality: &QualityCounters,
    ) -> FactRow {
        let (date_key, time_key, location_key, environmental_key) =
            self.common_keys(at, location, category.source_table(), quality);
        FactRow {
            event_id: self.event_ids.allocate(),
            date_key,
            time_key,
            location_key,
            vehicle_key,
            event_type_key: self.event_type_key(event_type_code, quality),
            environmental_key,
            measures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DimensionBuilder;
    use crate::calendar::{build_date_dimension, build_event_type_dimension, build_time_dimension};
    use crate::config::CalendarRange;
    use crate::model::{AttributeMap, DIM_DATE, DIM_ENVIRONMENTAL, DIM_EVENT_TYPE, DIM_LOCATION, DIM_TIME, DIM_VEHICLE};
    use crate::records::{VehicleRow, WeatherRow};
    use crate::store::DimensionStore;
    use chrono::NaiveDate;

    fn test_config() -> EtlConfig {
        EtlConfig {
            calendar: CalendarRange {
                start_year: 2024,
                end_year: 2024,
            },
            ..EtlConfig::default()
        }
    }

    fn observed() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    /// Dimension set built from a batch, the way the pipeline assembles it.
    fn dimensions_for(
        config: &EtlConfig,
        batch: &SourceBatch,
    ) -> HashMap<String, DimensionSnapshot> {
        let quality = QualityCounters::new();
        let location_store = DimensionStore::new(
            DIM_LOCATION,
            config.tracked_for(DIM_LOCATION).unwrap().to_vec(),
            AttributeMap::new(),
        );
        let vehicle_store = DimensionStore::new(
            DIM_VEHICLE,
            config.tracked_for(DIM_VEHICLE).unwrap().to_vec(),
            AttributeMap::new(),
        );
        let environmental_store = DimensionStore::new(
            DIM_ENVIRONMENTAL,
            config.tracked_for(DIM_ENVIRONMENTAL).unwrap().to_vec(),
            AttributeMap::new(),
        );

        let mut dims = HashMap::new();
        dims.insert(
            DIM_DATE.to_string(),
            build_date_dimension(&config.calendar),
        );
        dims.insert(DIM_TIME.to_string(), build_time_dimension());
        dims.insert(DIM_EVENT_TYPE.to_string(), build_event_type_dimension());
        dims.insert(
            DIM_LOCATION.to_string(),
            DimensionBuilder::build_location_dimension(batch, &location_store, observed(), &quality)
                .unwrap(),
        );
        dims.insert(
            DIM_VEHICLE.to_string(),
            DimensionBuilder::build_vehicle_dimension(batch, &vehicle_store, observed(), &quality)
                .unwrap(),
        );
        dims.insert(
            DIM_ENVIRONMENTAL.to_string(),
            DimensionBuilder::build_environmental_dimension(
                batch,
                &environmental_store,
                observed(),
                &quality,
            )
            .unwrap(),
        );
        dims
    }

    fn flow(ts: &str, location: &str, count: i64) -> FlowRow {
        FlowRow {
            timestamp: Some(ts.to_string()),
            location: Some(location.to_string()),
            vehicle_count: Some(count),
        }
    }

    #[test]
    fn flow_row_resolves_every_foreign_key() {
        let config = test_config();
        let mut batch = SourceBatch::default();
        batch.flow = vec![flow("2024-03-01 08:30:00", "5th & Main", 42)];
        batch.weather = vec![WeatherRow {
            timestamp: Some("2024-03-01 08:00:00".to_string()),
            temperature_c: Some(11.0),
            condition: Some("Clear".to_string()),
        }];

        let dims = dimensions_for(&config, &batch);
        let resolver = FactResolver::new(&config, &dims).unwrap();
        let quality = QualityCounters::new();
        let facts = resolver.resolve_batch(&batch, &quality);

        assert_eq!(facts.len(), 1);
        let fact = &facts[0];
        assert_eq!(fact.event_id, 1);
        assert_eq!(fact.date_key, 20240301);
        assert_eq!(fact.time_key, 830);
        assert_ne!(fact.location_key, UNKNOWN_KEY);
        assert_eq!(fact.vehicle_key, UNKNOWN_KEY);
        assert_ne!(fact.environmental_key, UNKNOWN_KEY);
        assert_eq!(fact.measures["vehicle_count"], 42.0);
    }

    #[test]
    fn midnight_resolves_to_time_key_zero_not_a_miss() {
        let config = test_config();
        let mut batch = SourceBatch::default();
        batch.flow = vec![flow("2024-03-01 00:00:00", "5th & Main", 5)];

        let dims = dimensions_for(&config, &batch);
        let resolver = FactResolver::new(&config, &dims).unwrap();
        let quality = QualityCounters::new();
        let facts = resolver.resolve_batch(&batch, &quality);

        assert_eq!(facts[0].time_key, 0);
        assert!(!quality.summary().lookup_misses.contains_key("time_key"));
    }

    #[test]
    fn non_violation_is_filtered_before_resolution() {
        let config = test_config();
        let mut batch = SourceBatch::default();
        batch.speed_violations = vec![SpeedViolationRow {
            timestamp: Some("2024-03-01 10:00:00".to_string()),
            location: Some("5th & Main".to_string()),
            vehicle_id: Some("V-1".to_string()),
            speed_recorded: Some(30.0),
            speed_limit: Some(35.0),
        }];

        let dims = dimensions_for(&config, &batch);
        let resolver = FactResolver::new(&config, &dims).unwrap();
        let quality = QualityCounters::new();
        let facts = resolver.resolve_batch(&batch, &quality);

        assert!(facts.is_empty());
        let summary = quality.summary();
        assert_eq!(
            summary.rows_skipped_by_reason[SKIP_INVALID_SPEED_VIOLATION],
            1
        );
        assert_eq!(summary.fact_rows_emitted, 0);
    }

    #[test]
    fn severe_congestion_scores_four_with_matching_event_type() {
        let config = test_config();
        let mut batch = SourceBatch::default();
        batch.congestion = vec![CongestionRow {
            recorded_at: Some("2024-03-01 17:15:00".to_string()),
            location: Some("I-90 EB".to_string()),
            level: Some("Severe".to_string()),
        }];

        let dims = dimensions_for(&config, &batch);
        let resolver = FactResolver::new(&config, &dims).unwrap();
        let quality = QualityCounters::new();
        let facts = resolver.resolve_batch(&batch, &quality);

        let fact = &facts[0];
        assert_eq!(fact.measures["congestion_level_score"], 4.0);
        let expected = dims[DIM_EVENT_TYPE]
            .current_key(&BusinessKey::single("CONGESTION_SEVERE"))
            .unwrap();
        assert_eq!(fact.event_type_key, expected);
    }

    #[test]
    fn accident_without_severity_defaults_to_moderate() {
        let config = test_config();
        let mut batch = SourceBatch::default();
        batch.accidents = vec![AccidentRow {
            reported_at: Some("2024-03-01 09:00:00".to_string()),
            location: Some("Oak & Pine".to_string()),
            severity: None,
            vehicles_involved: Some(2),
        }];

        let dims = dimensions_for(&config, &batch);
        let resolver = FactResolver::new(&config, &dims).unwrap();
        let quality = QualityCounters::new();
        let facts = resolver.resolve_batch(&batch, &quality);

        let fact = &facts[0];
        let expected = dims[DIM_EVENT_TYPE]
            .current_key(&BusinessKey::single("ACC_MODERATE"))
            .unwrap();
        assert_eq!(fact.event_type_key, expected);
        assert_eq!(fact.measures["incident_severity_score"], 2.0);
    }

    #[test]
    fn unknown_location_resolves_to_sentinel_and_counts_a_miss() {
        let config = test_config();
        let mut batch = SourceBatch::default();
        batch.flow = vec![flow("2024-03-01 08:00:00", "5th & Main", 10)];
        // Dimensions built from an empty batch know no locations.
        let dims = dimensions_for(&config, &SourceBatch::default());

        let resolver = FactResolver::new(&config, &dims).unwrap();
        let quality = QualityCounters::new();
        let facts = resolver.resolve_batch(&batch, &quality);

        assert_eq!(facts[0].location_key, UNKNOWN_KEY);
        assert_eq!(quality.summary().lookup_misses["location_key"], 1);
    }

    #[test]
    fn event_ids_stay_gap_free_across_skips() {
        let config = test_config();
        let mut batch = SourceBatch::default();
        batch.flow = vec![
            flow("2024-03-01 08:00:00", "A", 1),
            FlowRow {
                timestamp: Some("garbage".to_string()),
                location: Some("B".to_string()),
                vehicle_count: Some(2),
            },
            flow("2024-03-01 09:00:00", "C", 3),
        ];
        batch.road_closures = vec![RoadClosureRow {
            closed_at: Some("2024-03-01 06:00:00".to_string()),
            location: Some("A".to_string()),
            reason: Some("Roadworks".to_string()),
            duration_minutes: None,
        }];

        let dims = dimensions_for(&config, &batch);
        let resolver = FactResolver::new(&config, &dims).unwrap();
        let quality = QualityCounters::new();
        let facts = resolver.resolve_batch(&batch, &quality);

        let ids: Vec<i64> = facts.iter().map(|f| f.event_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(
            quality.summary().rows_skipped_by_reason[SKIP_INVALID_TIMESTAMP],
            1
        );
        // Closure without an explicit duration takes the configured default.
        assert_eq!(facts[2].measures["duration_minutes"], 120.0);
    }

    #[test]
    fn every_foreign_key_exists_in_its_dimension() {
        let config = test_config();
        let mut batch = SourceBatch::default();
        batch.flow = vec![flow("2024-03-01 08:00:00", "5th & Main", 12)];
        batch.accidents = vec![AccidentRow {
            reported_at: Some("2024-03-01 11:00:00".to_string()),
            location: Some("Nowhere Rd".to_string()),
            severity: Some("Severe".to_string()),
            vehicles_involved: Some(3),
        }];
        batch.speed_violations = vec![SpeedViolationRow {
            timestamp: Some("2024-03-01 12:00:00".to_string()),
            location: Some("5th & Main".to_string()),
            vehicle_id: Some("V-9".to_string()),
            speed_recorded: Some(88.0),
            speed_limit: Some(60.0),
        }];
        batch.vehicles = vec![VehicleRow {
            vehicle_id: Some("V-9".to_string()),
            vehicle_type: Some("SUV".to_string()),
        }];

        let dims = dimensions_for(&config, &batch);
        let resolver = FactResolver::new(&config, &dims).unwrap();
        let quality = QualityCounters::new();
        let facts = resolver.resolve_batch(&batch, &quality);

        assert_eq!(facts.len(), 3);
        for fact in &facts {
            assert!(dims[DIM_DATE].contains_key(fact.date_key));
            assert!(dims[DIM_TIME].contains_key(fact.time_key));
            assert!(dims[DIM_LOCATION].contains_key(fact.location_key));
            assert!(dims[DIM_VEHICLE].contains_key(fact.vehicle_key));
            assert!(dims[DIM_EVENT_TYPE].contains_key(fact.event_type_key));
            assert!(dims[DIM_ENVIRONMENTAL].contains_key(fact.environmental_key));
        }
    }

    #[test]
    fn missing_required_snapshot_fails_before_any_row() {
        let config = test_config();
        let mut dims = dimensions_for(&config, &SourceBatch::default());
        dims.remove(DIM_DATE);

        let err = FactResolver::new(&config, &dims).unwrap_err();
        assert!(matches!(err, DwhError::Configuration(_)));
    }

    #[test]
    fn environmental_tolerance_prefers_exact_then_earlier_day() {
        let mut index = EnvironmentalIndex {
            by_day: BTreeMap::new(),
            tolerance_days: 1,
        };
        let feb29 = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let mar2 = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        index.by_day.insert(feb29, 7);
        index.by_day.insert(mar2, 9);

        // Equidistant neighbors: the earlier day wins.
        let mar1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(index.lookup(mar1), Some(7));
        // Exact match beats nearest.
        assert_eq!(index.lookup(mar2), Some(9));
        // Outside tolerance.
        assert_eq!(
            index.lookup(NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()),
            None
        );

        index.tolerance_days = 0;
        assert_eq!(index.lookup(mar1), None);
    }
}
