use crate::errors::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type DeviceId = i64;

/// Administrative state of a device, set at registration or by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Inactive,
    Maintenance,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Active => "active",
            DeviceStatus::Inactive => "inactive",
            DeviceStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(DeviceStatus::Active),
            "inactive" => Ok(DeviceStatus::Inactive),
            "maintenance" => Ok(DeviceStatus::Maintenance),
            other => Err(format!("unknown device status '{}'", other)),
        }
    }
}

/// Liveness as persisted on the durable device record by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Connectivity::Online => "online",
            Connectivity::Offline => "offline",
        }
    }

    /// Online iff `now - last_activity <= threshold`.
    pub fn derive(
        last_activity: DateTime<Utc>,
        now: DateTime<Utc>,
        threshold: chrono::Duration,
    ) -> Self {
        if now - last_activity <= threshold {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Connectivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "online" => Ok(Connectivity::Online),
            "offline" => Ok(Connectivity::Offline),
            other => Err(format!("unknown connectivity '{}'", other)),
        }
    }
}

/// Durable device record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub id: DeviceId,
    pub owner_id: i64,
    pub status: DeviceStatus,
    pub connectivity: Connectivity,
    pub last_seen: Option<DateTime<Utc>>,
}

/// What a successful credential check yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuthenticatedDevice {
    pub id: DeviceId,
    pub owner_id: i64,
    pub status: DeviceStatus,
}

/// One scalar reading. Append-only once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MeasurementRow {
    pub device_id: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub measurement_name: String,
    pub numeric_value: f64,
}

/// A value as submitted, before it is checked for being numeric.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementValue {
    Integer(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Null,
    Array,
    Object,
}

impl MeasurementValue {
    /// Integers and finite floats are kept; everything else is dropped.
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            MeasurementValue::Integer(i) => Some(*i as f64),
            MeasurementValue::Float(f) if f.is_finite() => Some(*f),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MeasurementValue::Integer(_) => "integer",
            MeasurementValue::Float(f) if f.is_finite() => "float",
            MeasurementValue::Float(_) => "non-finite float",
            MeasurementValue::Bool(_) => "boolean",
            MeasurementValue::Text(_) => "string",
            MeasurementValue::Null => "null",
            MeasurementValue::Array => "array",
            MeasurementValue::Object => "object",
        }
    }
}

impl From<&serde_json::Value> for MeasurementValue {
    fn from(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => MeasurementValue::Integer(i),
                None => MeasurementValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::Bool(b) => MeasurementValue::Bool(*b),
            Value::String(s) => MeasurementValue::Text(s.clone()),
            Value::Null => MeasurementValue::Null,
            Value::Array(_) => MeasurementValue::Array,
            Value::Object(_) => MeasurementValue::Object,
        }
    }
}

impl From<f64> for MeasurementValue {
    fn from(value: f64) -> Self {
        MeasurementValue::Float(value)
    }
}

impl From<i64> for MeasurementValue {
    fn from(value: i64) -> Self {
        MeasurementValue::Integer(value)
    }
}

impl From<&str> for MeasurementValue {
    fn from(value: &str) -> Self {
        MeasurementValue::Text(value.to_string())
    }
}

impl From<bool> for MeasurementValue {
    fn from(value: bool) -> Self {
        MeasurementValue::Bool(value)
    }
}

/// A field removed during validation, reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedField {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitReceipt {
    pub device_id: DeviceId,
    pub accepted_count: usize,
    pub timestamp: DateTime<Utc>,
    pub dropped: Vec<DroppedField>,
}

/// Derived liveness reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Online,
    Offline,
    Unknown,
}

impl From<Connectivity> for Liveness {
    fn from(c: Connectivity) -> Self {
        match c {
            Connectivity::Online => Liveness::Online,
            Connectivity::Offline => Liveness::Offline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessSource {
    Cache,
    Durable,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub device_id: DeviceId,
    pub status: Liveness,
    pub last_seen: Option<DateTime<Utc>>,
    pub source: LivenessSource,
}

/// Range query response. `count` is the number of rows actually returned.
#[derive(Debug, Clone, Serialize)]
pub struct RangeResult {
    pub device_id: DeviceId,
    pub rows: Vec<MeasurementRow>,
    pub count: usize,
    pub limit: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFn {
    Avg,
    Sum,
    Min,
    Max,
    Count,
}

impl AggregateFn {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFn::Avg => "avg",
            AggregateFn::Sum => "sum",
            AggregateFn::Min => "min",
            AggregateFn::Max => "max",
            AggregateFn::Count => "count",
        }
    }
}

impl FromStr for AggregateFn {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "avg" | "mean" => Ok(AggregateFn::Avg),
            "sum" => Ok(AggregateFn::Sum),
            "min" => Ok(AggregateFn::Min),
            "max" => Ok(AggregateFn::Max),
            "count" => Ok(AggregateFn::Count),
            _ => Err(ValidationError::UnsupportedAggregation(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateQuery {
    pub device_id: DeviceId,
    pub measurement: String,
    pub function: AggregateFn,
    pub window_secs: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// One fixed-size time bucket. `bucket_start` is epoch-aligned to the window.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Bucket {
    pub bucket_start: DateTime<Utc>,
    pub value: Option<f64>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateResult {
    pub device_id: DeviceId,
    pub measurement: String,
    pub function: AggregateFn,
    pub window_secs: i64,
    pub buckets: Vec<Bucket>,
    /// Total rows across all buckets. Zero is a valid, empty result.
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestReading {
    pub device_id: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub measurements: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum BackendHealth {
    Healthy,
    Degraded { reason: String },
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entry_count: Option<usize>,
    pub backend_health: BackendHealth,
    pub sync_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_numeric_classification() {
        let payload = serde_json::json!({
            "temperature": 22.1,
            "count": 3,
            "mode": "auto",
            "enabled": true,
            "nothing": null,
            "nested": {"a": 1},
            "list": [1, 2]
        });
        let obj = payload.as_object().unwrap();

        assert_eq!(MeasurementValue::from(&obj["temperature"]).as_numeric(), Some(22.1));
        assert_eq!(MeasurementValue::from(&obj["count"]).as_numeric(), Some(3.0));
        for key in ["mode", "enabled", "nothing", "nested", "list"] {
            assert_eq!(MeasurementValue::from(&obj[key]).as_numeric(), None, "{}", key);
        }
    }

    #[test]
    fn test_non_finite_float_is_not_numeric() {
        assert_eq!(MeasurementValue::Float(f64::NAN).as_numeric(), None);
        assert_eq!(MeasurementValue::Float(f64::INFINITY).kind(), "non-finite float");
    }

    #[test]
    fn test_connectivity_threshold_is_inclusive() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let threshold = Duration::seconds(60);

        assert_eq!(Connectivity::derive(t0, t0 + Duration::seconds(59), threshold), Connectivity::Online);
        assert_eq!(Connectivity::derive(t0, t0 + Duration::seconds(60), threshold), Connectivity::Online);
        assert_eq!(Connectivity::derive(t0, t0 + Duration::seconds(61), threshold), Connectivity::Offline);
    }

    #[test]
    fn test_aggregate_fn_parsing() {
        assert_eq!("mean".parse::<AggregateFn>(), Ok(AggregateFn::Avg));
        assert_eq!("COUNT".parse::<AggregateFn>(), Ok(AggregateFn::Count));
        assert_eq!(
            "median".parse::<AggregateFn>(),
            Err(ValidationError::UnsupportedAggregation("median".to_string()))
        );
    }

    #[test]
    fn test_device_status_round_trip_names() {
        for status in [DeviceStatus::Active, DeviceStatus::Inactive, DeviceStatus::Maintenance] {
            assert_eq!(status.as_str().parse::<DeviceStatus>(), Ok(status));
        }
        assert!("retired".parse::<DeviceStatus>().is_err());
    }
}
