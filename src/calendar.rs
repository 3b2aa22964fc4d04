//! Deterministic calendar-type dimensions.
//!
//! Date, time-of-day and the static event-type catalog are pure enumerations:
//! no resolution step, no versioning. They expose the same snapshot shape as
//! the versioned dimensions (Unknown member at key 0) so fact resolution
//! consumes every dimension uniformly.

use crate::config::CalendarRange;
use crate::model::{
    AttrValue, AttributeMap, BusinessKey, DimensionRow, DimensionSnapshot, DIM_DATE,
    DIM_EVENT_TYPE, DIM_TIME,
};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};

/// `yyyymmdd` surrogate for a calendar date.
pub fn date_key(date: NaiveDate) -> i64 {
    date.year() as i64 * 10000 + date.month() as i64 * 100 + date.day() as i64
}

/// `hour*100 + minute` surrogate for a time of day. Midnight maps to 0,
/// which coincides with the Unknown key by construction.
pub fn time_key(time: NaiveDateTime) -> i64 {
    time.hour() as i64 * 100 + time.minute() as i64
}

fn season(month: u32) -> &'static str {
    match month {
        3..=5 => "Spring",
        6..=8 => "Summer",
        9..=11 => "Fall",
        _ => "Winter",
    }
}

fn day_segment(hour: u32) -> &'static str {
    match hour {
        5..=11 => "Morning",
        12..=16 => "Afternoon",
        17..=20 => "Evening",
        _ => "Night",
    }
}

// Peak windows from sensor-volume profiling of the source feeds.
const MIDDAY_PEAK_HOUR: u32 = 13;
const EVENING_PEAK_START: u32 = 18;
const EVENING_PEAK_END: u32 = 19;

fn static_row(surrogate_key: i64, business_key: BusinessKey, attributes: AttributeMap) -> DimensionRow {
    DimensionRow {
        surrogate_key,
        business_key,
        attributes,
        valid_from: NaiveDateTime::MIN,
        valid_to: None,
        is_current: true,
    }
}

/// Date dimension over the configured year range, one row per day plus the
/// Unknown member.
pub fn build_date_dimension(range: &CalendarRange) -> DimensionSnapshot {
    let mut rows = vec![DimensionRow::unknown(AttributeMap::new())];

    let start = NaiveDate::from_ymd_opt(range.start_year, 1, 1).expect("valid start of range");
    let end = NaiveDate::from_ymd_opt(range.end_year, 12, 31).expect("valid end of range");

    let mut date = start;
    while date <= end {
        let iso = date.format("%Y-%m-%d").to_string();
        let mut attributes = AttributeMap::new();
        attributes.insert("date".to_string(), AttrValue::Text(iso.clone()));
        attributes.insert("day".to_string(), AttrValue::Int(date.day() as i64));
        attributes.insert(
            "day_of_week".to_string(),
            AttrValue::Int(date.weekday().num_days_from_monday() as i64),
        );
        attributes.insert("month".to_string(), AttrValue::Int(date.month() as i64));
        attributes.insert(
            "quarter".to_string(),
            AttrValue::Int(((date.month() - 1) / 3 + 1) as i64),
        );
        attributes.insert("year".to_string(), AttrValue::Int(date.year() as i64));
        attributes.insert(
            "is_weekend".to_string(),
            AttrValue::Bool(date.weekday().num_days_from_monday() >= 5),
        );
        attributes.insert(
            "season".to_string(),
            AttrValue::Text(season(date.month()).to_string()),
        );

        rows.push(static_row(date_key(date), BusinessKey::single(iso), attributes));
        date = date + Duration::days(1);
    }

    DimensionSnapshot::from_rows(DIM_DATE, rows)
}

/// Time dimension at minute granularity: 1440 rows plus the Unknown member.
pub fn build_time_dimension() -> DimensionSnapshot {
    let mut rows = vec![DimensionRow::unknown(AttributeMap::new())];

    for hour in 0..24u32 {
        for minute in 0..60u32 {
            let key = hour as i64 * 100 + minute as i64;
            let is_peak = hour == MIDDAY_PEAK_HOUR
                || (EVENING_PEAK_START..=EVENING_PEAK_END).contains(&hour);

            let mut attributes = AttributeMap::new();
            attributes.insert(
                "time_of_day".to_string(),
                AttrValue::Text(format!("{:02}:{:02}", hour, minute)),
            );
            attributes.insert("hour".to_string(), AttrValue::Int(hour as i64));
            attributes.insert("minute".to_string(), AttrValue::Int(minute as i64));
            attributes.insert("peak_hour_flag".to_string(), AttrValue::Bool(is_peak));
            attributes.insert(
                "day_segment".to_string(),
                AttrValue::Text(day_segment(hour).to_string()),
            );

            rows.push(static_row(
                key,
                BusinessKey::single(format!("{:02}{:02}", hour, minute)),
                attributes,
            ));
        }
    }

    DimensionSnapshot::from_rows(DIM_TIME, rows)
}

/// Static event-type catalog: code, category, description and severity scale.
pub fn build_event_type_dimension() -> DimensionSnapshot {
    let catalog: [(&str, &str, &str, i64); 13] = [
        ("FLOW", "Flow", "Regular traffic flow measurement", 0),
        ("ACC_MINOR", "Accident", "Minor accident", 3),
        ("ACC_MODERATE", "Accident", "Moderate accident", 6),
        ("ACC_SEVERE", "Accident", "Severe accident", 9),
        ("ACC_FATAL", "Accident", "Fatal accident", 10),
        ("CONGESTION_LOW", "Congestion", "Low congestion", 2),
        ("CONGESTION_MEDIUM", "Congestion", "Medium congestion", 5),
        ("CONGESTION_MODERATE", "Congestion", "Moderate congestion", 5),
        ("CONGESTION_HIGH", "Congestion", "High congestion", 8),
        ("CONGESTION_SEVERE", "Congestion", "Severe congestion", 9),
        ("SPEED_VIOLATION", "Violation", "Speed limit violation", 4),
        ("ROAD_CLOSURE", "Closure", "Road closure", 7),
        (
            "TRAFFIC_LIGHT_STATUS",
            "Infrastructure",
            "Traffic light status update",
            1,
        ),
    ];

    let mut rows = vec![DimensionRow::unknown(AttributeMap::new())];
    for (idx, (code, category, description, scale)) in catalog.iter().enumerate() {
        let mut attributes = AttributeMap::new();
        attributes.insert(
            "event_type_id".to_string(),
            AttrValue::Text(code.to_string()),
        );
        attributes.insert(
            "event_category".to_string(),
            AttrValue::Text(category.to_string()),
        );
        attributes.insert(
            "event_description".to_string(),
            AttrValue::Text(description.to_string()),
        );
        attributes.insert("severity_scale".to_string(), AttrValue::Int(*scale));

        rows.push(static_row(
            idx as i64 + 1,
            BusinessKey::single(*code),
            attributes,
        ));
    }

    DimensionSnapshot::from_rows(DIM_EVENT_TYPE, rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_dimension_covers_range_with_unknown_first() {
        let snapshot = build_date_dimension(&CalendarRange {
            start_year: 2024,
            end_year: 2024,
        });
        // 366 days in 2024 plus the Unknown member.
        assert_eq!(snapshot.len(), 367);
        assert_eq!(snapshot.rows[0].surrogate_key, 0);
        assert!(snapshot.contains_key(20240229));
        assert_eq!(
            snapshot.current_key(&BusinessKey::single("2024-02-29")),
            Some(20240229)
        );
    }

    #[test]
    fn time_dimension_has_minute_granularity() {
        let snapshot = build_time_dimension();
        assert_eq!(snapshot.len(), 1441);
        assert!(snapshot.contains_key(2359));
        assert!(snapshot.contains_key(0));
    }

    #[test]
    fn midnight_maps_to_key_zero() {
        let midnight = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(time_key(midnight), 0);
    }

    #[test]
    fn event_type_catalog_resolves_codes() {
        let snapshot = build_event_type_dimension();
        let severe = snapshot
            .current_key(&BusinessKey::single("CONGESTION_SEVERE"))
            .unwrap();
        assert_ne!(severe, 0);
        assert!(snapshot
            .current_key(&BusinessKey::single("ACC_MODERATE"))
            .is_some());
        assert!(snapshot
            .current_key(&BusinessKey::single("NO_SUCH_CODE"))
            .is_none());
    }
}
