//! Typed source records, one per extract table.
//!
//! Field spellings follow the source-system headings (`Timestamp`,
//! `ReportedAt`, `VehicleCount`, ...) via serde renames so extracts
//! deserialize without a mapping layer. Timestamps stay raw strings here;
//! parsing happens during resolution, where a malformed value is a per-row
//! validation failure rather than a batch failure.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The five fact source categories, in processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    Flow,
    Accident,
    Congestion,
    SpeedViolation,
    RoadClosure,
}

impl EventCategory {
    pub const ALL: [EventCategory; 5] = [
        EventCategory::Flow,
        EventCategory::Accident,
        EventCategory::Congestion,
        EventCategory::SpeedViolation,
        EventCategory::RoadClosure,
    ];

    /// Source table name as it appears in the extracts.
    pub fn source_table(&self) -> &'static str {
        match self {
            EventCategory::Flow => "TrafficFlow",
            EventCategory::Accident => "Accidents",
            EventCategory::Congestion => "CongestionLevels",
            EventCategory::SpeedViolation => "SpeedViolations",
            EventCategory::RoadClosure => "RoadClosures",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRow {
    #[serde(rename = "Timestamp")]
    pub timestamp: Option<String>,
    #[serde(rename = "Location")]
    pub location: Option<String>,
    #[serde(rename = "VehicleCount")]
    pub vehicle_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccidentRow {
    #[serde(rename = "ReportedAt")]
    pub reported_at: Option<String>,
    #[serde(rename = "Location")]
    pub location: Option<String>,
    #[serde(rename = "Severity")]
    pub severity: Option<String>,
    #[serde(rename = "VehiclesInvolved")]
    pub vehicles_involved: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CongestionRow {
    #[serde(rename = "RecordedAt")]
    pub recorded_at: Option<String>,
    #[serde(rename = "Location")]
    pub location: Option<String>,
    #[serde(rename = "Level")]
    pub level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedViolationRow {
    #[serde(rename = "Timestamp")]
    pub timestamp: Option<String>,
    #[serde(rename = "Location")]
    pub location: Option<String>,
    #[serde(rename = "VehicleID")]
    pub vehicle_id: Option<String>,
    #[serde(rename = "SpeedRecorded")]
    pub speed_recorded: Option<f64>,
    #[serde(rename = "SpeedLimit")]
    pub speed_limit: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoadClosureRow {
    #[serde(rename = "ClosedAt")]
    pub closed_at: Option<String>,
    #[serde(rename = "Location")]
    pub location: Option<String>,
    #[serde(rename = "Reason")]
    pub reason: Option<String>,
    #[serde(rename = "DurationMinutes")]
    pub duration_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherRow {
    #[serde(rename = "Timestamp")]
    pub timestamp: Option<String>,
    #[serde(rename = "Temperature_C")]
    pub temperature_c: Option<f64>,
    #[serde(rename = "Condition")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleRow {
    #[serde(rename = "VehicleID")]
    pub vehicle_id: Option<String>,
    #[serde(rename = "VehicleType")]
    pub vehicle_type: Option<String>,
}

/// Master-data enrichment for locations sighted in the event tables, matched
/// by location name. Carries the descriptive attributes tracked for
/// versioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationRow {
    #[serde(rename = "Location")]
    pub name: Option<String>,
    #[serde(rename = "StreetName")]
    pub street_name: Option<String>,
    #[serde(rename = "District")]
    pub district: Option<String>,
    #[serde(rename = "RoadType")]
    pub road_type: Option<String>,
}

/// One batch of raw extracts, as handed over by the extraction collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceBatch {
    pub flow: Vec<FlowRow>,
    pub accidents: Vec<AccidentRow>,
    pub congestion: Vec<CongestionRow>,
    pub speed_violations: Vec<SpeedViolationRow>,
    pub road_closures: Vec<RoadClosureRow>,
    pub weather: Vec<WeatherRow>,
    pub vehicles: Vec<VehicleRow>,
    pub locations: Vec<LocationRow>,
}

impl SourceBatch {
    /// Total fact-source row count (weather, vehicle and location extracts
    /// feed dimensions, not facts).
    pub fn fact_source_rows(&self) -> u64 {
        (self.flow.len()
            + self.accidents.len()
            + self.congestion.len()
            + self.speed_violations.len()
            + self.road_closures.len()) as u64
    }

    /// Location names sighted per source table, in extract order.
    pub fn location_sightings(&self) -> Vec<(Option<&str>, &'static str)> {
        let mut sightings = Vec::new();
        sightings.extend(
            self.flow
                .iter()
                .map(|r| (r.location.as_deref(), EventCategory::Flow.source_table())),
        );
        sightings.extend(self.accidents.iter().map(|r| {
            (
                r.location.as_deref(),
                EventCategory::Accident.source_table(),
            )
        }));
        sightings.extend(self.congestion.iter().map(|r| {
            (
                r.location.as_deref(),
                EventCategory::Congestion.source_table(),
            )
        }));
        sightings.extend(self.speed_violations.iter().map(|r| {
            (
                r.location.as_deref(),
                EventCategory::SpeedViolation.source_table(),
            )
        }));
        sightings.extend(self.road_closures.iter().map(|r| {
            (
                r.location.as_deref(),
                EventCategory::RoadClosure.source_table(),
            )
        }));
        sightings
    }

    /// Location enrichment rows indexed by location name.
    pub fn location_master(&self) -> HashMap<&str, &LocationRow> {
        self.locations
            .iter()
            .filter_map(|r| r.name.as_deref().map(|n| (n, r)))
            .collect()
    }
}
