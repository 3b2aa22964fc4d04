//! Pipeline configuration.
//!
//! Everything that was policy in the source system is explicit here: which
//! attributes trigger a new dimension version, the calendar coverage, the
//! measure defaults, and the run-level data-quality threshold.

use crate::error::{DwhError, Result};
use crate::model::{DIM_ENVIRONMENTAL, DIM_LOCATION, DIM_VEHICLE};
use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Policy for accident severities outside the known mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmappedSeverityPolicy {
    /// Emit `incident_severity_score = 0.0`.
    Zero,
    /// Omit the measure from the fact row.
    Omit,
}

/// Calendar coverage for the date dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarRange {
    pub start_year: i32,
    pub end_year: i32,
}

impl Default for CalendarRange {
    /// Three past years through one future year, matching the warehouse's
    /// retention window.
    fn default() -> Self {
        let current = Utc::now().year();
        CalendarRange {
            start_year: current - 3,
            end_year: current + 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    /// Per-dimension attribute subset compared during change detection.
    /// A versioned dimension without an entry here fails at startup.
    pub tracked_attributes: HashMap<String, Vec<String>>,

    pub calendar: CalendarRange,

    pub unmapped_severity_policy: UnmappedSeverityPolicy,

    /// Closure duration used when the source row carries none.
    pub default_closure_duration_minutes: i64,

    /// Nearest-day tolerance for environmental matching. Zero means exact
    /// calendar-day match only.
    pub environmental_tolerance_days: i64,

    /// Run fails when skipped/total exceeds this ratio.
    pub max_skip_ratio: f64,
}

impl Default for EtlConfig {
    fn default() -> Self {
        let mut tracked = HashMap::new();
        tracked.insert(
            DIM_LOCATION.to_string(),
            vec![
                "street_name".to_string(),
                "district".to_string(),
                "road_type".to_string(),
            ],
        );
        tracked.insert(
            DIM_VEHICLE.to_string(),
            vec!["vehicle_type".to_string(), "vehicle_category".to_string()],
        );
        tracked.insert(
            DIM_ENVIRONMENTAL.to_string(),
            vec![
                "temperature_c".to_string(),
                "weather_condition".to_string(),
            ],
        );
        EtlConfig {
            tracked_attributes: tracked,
            calendar: CalendarRange::default(),
            unmapped_severity_policy: UnmappedSeverityPolicy::Zero,
            default_closure_duration_minutes: 120,
            environmental_tolerance_days: 0,
            max_skip_ratio: 0.5,
        }
    }
}

impl EtlConfig {
    /// Tracked attribute set for a versioned dimension. Missing configuration
    /// is fatal before any row is processed.
    pub fn tracked_for(&self, dimension: &str) -> Result<&[String]> {
        self.tracked_attributes
            .get(dimension)
            .map(|v| v.as_slice())
            .ok_or_else(|| {
                DwhError::Configuration(format!(
                    "No tracked attribute set configured for dimension '{}'",
                    dimension
                ))
            })
    }
}
