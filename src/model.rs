use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Sentinel surrogate key for the Unknown member of every dimension.
pub const UNKNOWN_KEY: i64 = 0;

/// Dimension names, as used in snapshot maps and the loader interface.
pub const DIM_DATE: &str = "dim_date";
pub const DIM_TIME: &str = "dim_time";
pub const DIM_LOCATION: &str = "dim_location";
pub const DIM_VEHICLE: &str = "dim_vehicle";
pub const DIM_EVENT_TYPE: &str = "dim_event_type";
pub const DIM_ENVIRONMENTAL: &str = "dim_environmental";

/// Fact table name, as used in the loader interface.
pub const FACT_TRAFFIC_EVENTS: &str = "fact_traffic_events";

/// Natural identifier from a source system, an ordered tuple of components.
///
/// Location keys are `(location_name, source_table)` pairs; vehicle keys are a
/// single vehicle id; environmental keys are an ISO calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusinessKey(Vec<String>);

impl BusinessKey {
    pub fn new<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        BusinessKey(components.into_iter().map(Into::into).collect())
    }

    pub fn single(component: impl Into<String>) -> Self {
        BusinessKey(vec![component.into()])
    }

    pub fn pair(first: impl Into<String>, second: impl Into<String>) -> Self {
        BusinessKey(vec![first.into(), second.into()])
    }

    /// Reserved key of the Unknown member.
    pub fn unknown() -> Self {
        BusinessKey(vec!["Unknown".to_string()])
    }

    pub fn components(&self) -> &[String] {
        &self.0
    }

    /// A key with no components, or any blank component, cannot identify an
    /// entity and must be rejected by the resolver.
    pub fn is_blank(&self) -> bool {
        self.0.is_empty() || self.0.iter().any(|c| c.trim().is_empty())
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("|"))
    }
}

/// Typed dimension attribute value.
///
/// `Null` and `Text("")` are distinct values: an absent street name and an
/// empty street name never compare equal during change detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Text(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Text(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl<T: Into<AttrValue>> From<Option<T>> for AttrValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => AttrValue::Null,
        }
    }
}

pub type AttributeMap = BTreeMap<String, AttrValue>;

/// One version of a dimension entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionRow {
    pub surrogate_key: i64,
    pub business_key: BusinessKey,
    pub attributes: AttributeMap,
    pub valid_from: NaiveDateTime,
    pub valid_to: Option<NaiveDateTime>,
    pub is_current: bool,
}

impl DimensionRow {
    /// The Unknown member: never expires, always current.
    pub fn unknown(attributes: AttributeMap) -> Self {
        DimensionRow {
            surrogate_key: UNKNOWN_KEY,
            business_key: BusinessKey::unknown(),
            attributes,
            valid_from: NaiveDateTime::MIN,
            valid_to: None,
            is_current: true,
        }
    }
}

/// Read-only view of a dimension at a point in time: ordered rows plus the
/// current business-key index consumed by fact resolution and the loader.
#[derive(Debug, Clone)]
pub struct DimensionSnapshot {
    pub name: String,
    pub rows: Vec<DimensionRow>,
    current: HashMap<BusinessKey, i64>,
    keys: HashSet<i64>,
}

impl DimensionSnapshot {
    /// Build a snapshot from already-keyed rows (calendar dimensions and the
    /// event-type catalog produce rows directly, with no resolution step).
    pub fn from_rows(name: impl Into<String>, mut rows: Vec<DimensionRow>) -> Self {
        rows.sort_by_key(|r| r.surrogate_key);
        let current = rows
            .iter()
            .filter(|r| r.is_current)
            .map(|r| (r.business_key.clone(), r.surrogate_key))
            .collect();
        let keys = rows.iter().map(|r| r.surrogate_key).collect();
        DimensionSnapshot {
            name: name.into(),
            rows,
            current,
            keys,
        }
    }

    /// Surrogate key of the current version for a business key.
    pub fn current_key(&self, business_key: &BusinessKey) -> Option<i64> {
        self.current.get(business_key).copied()
    }

    /// Whether a surrogate key exists in this snapshot (Unknown counts).
    pub fn contains_key(&self, surrogate_key: i64) -> bool {
        self.keys.contains(&surrogate_key)
    }

    /// Row for a surrogate key, if present.
    pub fn row(&self, surrogate_key: i64) -> Option<&DimensionRow> {
        self.rows.iter().find(|r| r.surrogate_key == surrogate_key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Fully-keyed fact row. Measures are sparse: only the fields that apply to
/// the row's event category are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactRow {
    pub event_id: i64,
    pub date_key: i64,
    pub time_key: i64,
    pub location_key: i64,
    pub vehicle_key: i64,
    pub event_type_key: i64,
    pub environmental_key: i64,
    pub measures: BTreeMap<String, f64>,
}

/// Data-quality summary for one pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualitySummary {
    pub source_rows_total: u64,
    pub fact_rows_emitted: u64,
    pub rows_skipped_by_reason: BTreeMap<String, u64>,
    pub lookup_misses: BTreeMap<String, u64>,
}

impl QualitySummary {
    pub fn rows_skipped_total(&self) -> u64 {
        self.rows_skipped_by_reason.values().sum()
    }
}
