//! Entity dimension builders.
//!
//! Convert raw extract rows into deduplicated dimension candidates and feed
//! them through the SCD2 store, one resolver call per distinct business key.
//! Every produced snapshot carries the Unknown member, batch or no batch.

use crate::data_utils::parse_event_timestamp;
use crate::error::Result;
use crate::model::{AttrValue, AttributeMap, BusinessKey, DimensionSnapshot};
use crate::quality::{QualityCounters, SKIP_INVALID_TIMESTAMP, SKIP_MISSING_BUSINESS_KEY};
use crate::records::SourceBatch;
use crate::store::DimensionStore;
use chrono::{NaiveDate, NaiveDateTime};
use itertools::Itertools;
use lazy_static::lazy_static;
use std::collections::HashMap;
use tracing::{info, warn};

lazy_static! {
    /// Fixed vehicle-type to category mapping. Types outside the table fall
    /// to "Other", never an error.
    static ref VEHICLE_CATEGORIES: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("Sedan", "Passenger");
        m.insert("SUV", "Passenger");
        m.insert("Truck", "Commercial");
        m.insert("Bus", "Public Transport");
        m.insert("Van", "Commercial");
        m.insert("Motorcycle", "Passenger");
        m.insert("Taxi", "Service");
        m.insert("Emergency", "Service");
        m
    };
}

/// Category bucket for a vehicle type.
pub fn vehicle_category(vehicle_type: &str) -> &'static str {
    VEHICLE_CATEGORIES.get(vehicle_type).copied().unwrap_or("Other")
}

pub struct DimensionBuilder;

impl DimensionBuilder {
    /// Location dimension: one entity per distinct `(location_name,
    /// source_table)` pair sighted in the event extracts. Identical names in
    /// different source tables stay distinct entities. Descriptive attributes
    /// come from the location master extract, matched by name.
    pub fn build_location_dimension(
        batch: &SourceBatch,
        store: &DimensionStore,
        observed_at: NaiveDateTime,
        quality: &QualityCounters,
    ) -> Result<DimensionSnapshot> {
        let master = batch.location_master();

        let candidates: Vec<(String, &'static str)> = batch
            .location_sightings()
            .into_iter()
            .filter_map(|(name, source)| match name {
                Some(n) if !n.trim().is_empty() && n != "Unknown" => Some((n.to_string(), source)),
                _ => None,
            })
            .unique()
            .collect();

        for (name, source) in &candidates {
            let mut attributes = AttributeMap::new();
            attributes.insert("location_name".to_string(), AttrValue::Text(name.clone()));
            attributes.insert(
                "location_source".to_string(),
                AttrValue::Text(source.to_string()),
            );
            if let Some(row) = master.get(name.as_str()) {
                attributes.insert(
                    "street_name".to_string(),
                    AttrValue::from(row.street_name.clone()),
                );
                attributes.insert("district".to_string(), AttrValue::from(row.district.clone()));
                attributes.insert(
                    "road_type".to_string(),
                    AttrValue::from(row.road_type.clone()),
                );
            }

            let business_key = BusinessKey::pair(name.clone(), *source);
            if let Err(err) = store.resolve_or_create(&business_key, &attributes, observed_at) {
                warn!(%business_key, %err, "skipping location candidate");
                quality.record_skip(SKIP_MISSING_BUSINESS_KEY);
            }
        }

        let snapshot = store.snapshot();
        info!(
            rows = snapshot.len(),
            candidates = candidates.len(),
            "built location dimension"
        );
        Ok(snapshot)
    }

    /// Vehicle dimension from the Vehicles extract, keyed by vehicle id, with
    /// the type-to-category bucket applied.
    pub fn build_vehicle_dimension(
        batch: &SourceBatch,
        store: &DimensionStore,
        observed_at: NaiveDateTime,
        quality: &QualityCounters,
    ) -> Result<DimensionSnapshot> {
        let candidates = batch
            .vehicles
            .iter()
            .filter(|r| r.vehicle_id.is_some())
            .unique_by(|r| r.vehicle_id.clone())
            .collect_vec();

        for row in &candidates {
            let vehicle_id = row.vehicle_id.as_deref().unwrap_or_default();
            let category = row
                .vehicle_type
                .as_deref()
                .map(vehicle_category)
                .unwrap_or("Other");

            let mut attributes = AttributeMap::new();
            attributes.insert(
                "vehicle_id".to_string(),
                AttrValue::Text(vehicle_id.to_string()),
            );
            attributes.insert(
                "vehicle_type".to_string(),
                AttrValue::from(row.vehicle_type.clone()),
            );
            attributes.insert(
                "vehicle_category".to_string(),
                AttrValue::Text(category.to_string()),
            );

            let business_key = BusinessKey::single(vehicle_id);
            if let Err(err) = store.resolve_or_create(&business_key, &attributes, observed_at) {
                warn!(%business_key, %err, "skipping vehicle candidate");
                quality.record_skip(SKIP_MISSING_BUSINESS_KEY);
            }
        }

        let snapshot = store.snapshot();
        info!(rows = snapshot.len(), "built vehicle dimension");
        Ok(snapshot)
    }

    /// Environmental dimension: weather readings aggregated to one entity per
    /// calendar day (mean temperature, most-frequent condition; ties broken
    /// toward the condition seen earliest in the day).
    pub fn build_environmental_dimension(
        batch: &SourceBatch,
        store: &DimensionStore,
        observed_at: NaiveDateTime,
        quality: &QualityCounters,
    ) -> Result<DimensionSnapshot> {
        // (timestamp, temperature, condition) with parse failures counted
        // and dropped.
        let mut readings: Vec<(NaiveDateTime, Option<f64>, Option<&str>)> = Vec::new();
        for row in &batch.weather {
            let Some(raw) = row.timestamp.as_deref() else {
                quality.record_skip(SKIP_INVALID_TIMESTAMP);
                continue;
            };
            match parse_event_timestamp(raw) {
                Ok(at) => readings.push((at, row.temperature_c, row.condition.as_deref())),
                Err(err) => {
                    warn!(%err, "skipping weather reading");
                    quality.record_skip(SKIP_INVALID_TIMESTAMP);
                }
            }
        }
        readings.sort_by_key(|(at, _, _)| *at);

        let mut by_day: Vec<(NaiveDate, Vec<&(NaiveDateTime, Option<f64>, Option<&str>)>)> =
            Vec::new();
        for (day, group) in &readings.iter().group_by(|(at, _, _)| at.date()) {
            by_day.push((day, group.collect()));
        }

        for (day, group) in &by_day {
            let temps: Vec<f64> = group.iter().filter_map(|(_, t, _)| *t).collect();
            let mean_temp = if temps.is_empty() {
                AttrValue::Null
            } else {
                AttrValue::Float(temps.iter().sum::<f64>() / temps.len() as f64)
            };
            let condition = most_frequent_condition(group.iter().filter_map(|(_, _, c)| *c));

            let mut attributes = AttributeMap::new();
            attributes.insert(
                "date".to_string(),
                AttrValue::Text(day.format("%Y-%m-%d").to_string()),
            );
            attributes.insert("temperature_c".to_string(), mean_temp);
            attributes.insert(
                "weather_condition".to_string(),
                condition.map(AttrValue::from).unwrap_or(AttrValue::Null),
            );

            let business_key = BusinessKey::single(day.format("%Y-%m-%d").to_string());
            store.resolve_or_create(&business_key, &attributes, observed_at)?;
        }

        let snapshot = store.snapshot();
        info!(
            rows = snapshot.len(),
            days = by_day.len(),
            "built environmental dimension"
        );
        Ok(snapshot)
    }
}

/// Most-frequent value; on a tie, the one that appeared first wins. The
/// caller supplies conditions in timestamp order.
fn most_frequent_condition<'a>(conditions: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut counts: Vec<(&str, u64)> = Vec::new();
    for condition in conditions {
        match counts.iter_mut().find(|(c, _)| *c == condition) {
            Some((_, n)) => *n += 1,
            None => counts.push((condition, 1)),
        }
    }
    // Counts are in first-seen order; strict > keeps the earliest on ties.
    let mut best: Option<(&str, u64)> = None;
    for (condition, count) in counts {
        if best.map_or(true, |(_, n)| count > n) {
            best = Some((condition, count));
        }
    }
    best.map(|(c, _)| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EtlConfig;
    use crate::model::DIM_LOCATION;
    use crate::records::{FlowRow, LocationRow, VehicleRow, WeatherRow};
    use chrono::NaiveDate;

    fn observed() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn location_store() -> DimensionStore {
        let config = EtlConfig::default();
        DimensionStore::new(
            DIM_LOCATION,
            config.tracked_for(DIM_LOCATION).unwrap().to_vec(),
            AttributeMap::new(),
        )
    }

    fn flow_row(location: &str) -> FlowRow {
        FlowRow {
            timestamp: Some("2024-03-01 08:00:00".to_string()),
            location: Some(location.to_string()),
            vehicle_count: Some(10),
        }
    }

    #[test]
    fn duplicate_sightings_resolve_once() {
        let mut batch = SourceBatch::default();
        batch.flow = vec![flow_row("5th & Main"), flow_row("5th & Main")];

        let store = location_store();
        let quality = QualityCounters::new();
        let snapshot =
            DimensionBuilder::build_location_dimension(&batch, &store, observed(), &quality)
                .unwrap();

        // Unknown plus one entity.
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot.current_key(&BusinessKey::pair("5th & Main", "TrafficFlow")),
            Some(1)
        );
    }

    #[test]
    fn same_name_across_tables_stays_distinct() {
        let mut batch = SourceBatch::default();
        batch.flow = vec![flow_row("5th & Main")];
        batch.accidents = vec![crate::records::AccidentRow {
            reported_at: Some("2024-03-01 09:00:00".to_string()),
            location: Some("5th & Main".to_string()),
            severity: Some("Minor".to_string()),
            vehicles_involved: Some(2),
        }];

        let store = location_store();
        let quality = QualityCounters::new();
        let snapshot =
            DimensionBuilder::build_location_dimension(&batch, &store, observed(), &quality)
                .unwrap();

        let flow_key = snapshot
            .current_key(&BusinessKey::pair("5th & Main", "TrafficFlow"))
            .unwrap();
        let accident_key = snapshot
            .current_key(&BusinessKey::pair("5th & Main", "Accidents"))
            .unwrap();
        assert_ne!(flow_key, accident_key);
    }

    #[test]
    fn empty_batch_still_has_unknown_member() {
        let store = location_store();
        let quality = QualityCounters::new();
        let snapshot = DimensionBuilder::build_location_dimension(
            &SourceBatch::default(),
            &store,
            observed(),
            &quality,
        )
        .unwrap();

        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(0));
    }

    #[test]
    fn master_attributes_drive_versioning() {
        let store = location_store();
        let quality = QualityCounters::new();

        let mut day1 = SourceBatch::default();
        day1.flow = vec![flow_row("5th & Main")];
        day1.locations = vec![LocationRow {
            name: Some("5th & Main".to_string()),
            street_name: Some("5th Avenue".to_string()),
            district: Some("Downtown".to_string()),
            road_type: Some("Arterial".to_string()),
        }];
        DimensionBuilder::build_location_dimension(&day1, &store, observed(), &quality).unwrap();

        let mut day2 = day1.clone();
        day2.locations[0].street_name = Some("Fifth Avenue".to_string());
        let later = NaiveDate::from_ymd_opt(2024, 3, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let snapshot =
            DimensionBuilder::build_location_dimension(&day2, &store, later, &quality).unwrap();

        // Old version closed, new version current, keys 1 and 2.
        assert_eq!(snapshot.len(), 3);
        assert_eq!(
            snapshot.current_key(&BusinessKey::pair("5th & Main", "TrafficFlow")),
            Some(2)
        );
        let old = snapshot.row(1).unwrap();
        assert!(!old.is_current);
        assert_eq!(old.valid_to, Some(later));
    }

    #[test]
    fn unmapped_vehicle_type_falls_to_other() {
        assert_eq!(vehicle_category("Sedan"), "Passenger");
        assert_eq!(vehicle_category("Hovercraft"), "Other");
    }

    #[test]
    fn vehicle_dimension_buckets_types() {
        let mut batch = SourceBatch::default();
        batch.vehicles = vec![
            VehicleRow {
                vehicle_id: Some("V-1".to_string()),
                vehicle_type: Some("Truck".to_string()),
            },
            VehicleRow {
                vehicle_id: Some("V-2".to_string()),
                vehicle_type: Some("Rickshaw".to_string()),
            },
            VehicleRow {
                vehicle_id: None,
                vehicle_type: Some("Bus".to_string()),
            },
        ];

        let config = EtlConfig::default();
        let store = DimensionStore::new(
            crate::model::DIM_VEHICLE,
            config
                .tracked_for(crate::model::DIM_VEHICLE)
                .unwrap()
                .to_vec(),
            AttributeMap::new(),
        );
        let quality = QualityCounters::new();
        let snapshot =
            DimensionBuilder::build_vehicle_dimension(&batch, &store, observed(), &quality)
                .unwrap();

        assert_eq!(snapshot.len(), 3);
        let truck = snapshot
            .current_key(&BusinessKey::single("V-1"))
            .and_then(|k| snapshot.row(k))
            .unwrap();
        assert_eq!(
            truck.attributes["vehicle_category"],
            AttrValue::Text("Commercial".to_string())
        );
        let rickshaw = snapshot
            .current_key(&BusinessKey::single("V-2"))
            .and_then(|k| snapshot.row(k))
            .unwrap();
        assert_eq!(
            rickshaw.attributes["vehicle_category"],
            AttrValue::Text("Other".to_string())
        );
    }

    #[test]
    fn weather_aggregates_to_daily_mean_and_mode() {
        let mut batch = SourceBatch::default();
        batch.weather = vec![
            WeatherRow {
                timestamp: Some("2024-03-01 06:00:00".to_string()),
                temperature_c: Some(10.0),
                condition: Some("Rain".to_string()),
            },
            WeatherRow {
                timestamp: Some("2024-03-01 12:00:00".to_string()),
                temperature_c: Some(14.0),
                condition: Some("Clear".to_string()),
            },
            WeatherRow {
                timestamp: Some("2024-03-01 18:00:00".to_string()),
                temperature_c: None,
                condition: Some("Rain".to_string()),
            },
            WeatherRow {
                timestamp: Some("not a time".to_string()),
                temperature_c: Some(99.0),
                condition: Some("Clear".to_string()),
            },
        ];

        let config = EtlConfig::default();
        let store = DimensionStore::new(
            crate::model::DIM_ENVIRONMENTAL,
            config
                .tracked_for(crate::model::DIM_ENVIRONMENTAL)
                .unwrap()
                .to_vec(),
            AttributeMap::new(),
        );
        let quality = QualityCounters::new();
        let snapshot =
            DimensionBuilder::build_environmental_dimension(&batch, &store, observed(), &quality)
                .unwrap();

        assert_eq!(snapshot.len(), 2);
        let day = snapshot
            .current_key(&BusinessKey::single("2024-03-01"))
            .and_then(|k| snapshot.row(k))
            .unwrap();
        assert_eq!(day.attributes["temperature_c"], AttrValue::Float(12.0));
        assert_eq!(
            day.attributes["weather_condition"],
            AttrValue::Text("Rain".to_string())
        );
        assert_eq!(
            quality.summary().rows_skipped_by_reason[SKIP_INVALID_TIMESTAMP],
            1
        );
    }

    #[test]
    fn condition_tie_breaks_toward_earliest() {
        let conditions = ["Fog", "Clear", "Clear", "Fog"];
        assert_eq!(
            most_frequent_condition(conditions.iter().copied()),
            Some("Fog".to_string())
        );
    }
}
