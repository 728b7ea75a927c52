use crate::errors::ValidationError;
use crate::metrics::FIELDS_DROPPED_TOTAL;
use crate::model::{DeviceId, DroppedField, MeasurementValue};
use std::collections::BTreeMap;
use tracing::warn;

/// Longest measurement name the store accepts.
pub const MAX_NAME_LEN: usize = 100;

/// A flat measurement map as submitted by a device.
pub type Measurements = BTreeMap<String, MeasurementValue>;

/// Readings that survived validation, plus what was dropped and why.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub readings: Vec<(String, f64)>,
    pub dropped: Vec<DroppedField>,
}

/// Convert a JSON object into a measurement map.
pub fn measurements_from_json(object: &serde_json::Map<String, serde_json::Value>) -> Measurements {
    object
        .iter()
        .map(|(name, value)| (name.clone(), MeasurementValue::from(value)))
        .collect()
}

/// Keep numeric readings, drop everything else with a warning.
///
/// A malformed field never aborts the submission; only a payload with no
/// surviving readings is rejected.
pub fn normalize(
    device_id: DeviceId,
    measurements: &Measurements,
) -> Result<Normalized, ValidationError> {
    let mut readings = Vec::with_capacity(measurements.len());
    let mut dropped = Vec::new();

    for (name, value) in measurements {
        let verdict = if name.trim().is_empty() {
            Err("empty measurement name".to_string())
        } else if name.chars().count() > MAX_NAME_LEN {
            Err(format!("measurement name longer than {} characters", MAX_NAME_LEN))
        } else {
            value
                .as_numeric()
                .ok_or_else(|| format!("{} value is not numeric", value.kind()))
        };

        match verdict {
            Ok(numeric) => readings.push((name.clone(), numeric)),
            Err(reason) => {
                warn!("Dropping field '{}' from device {}: {}", name, device_id, reason);
                FIELDS_DROPPED_TOTAL.inc();
                dropped.push(DroppedField {
                    name: name.clone(),
                    reason,
                });
            }
        }
    }

    if readings.is_empty() {
        return Err(ValidationError::EmptyPayload {
            dropped: dropped.len(),
        });
    }

    Ok(Normalized { readings, dropped })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(value: serde_json::Value) -> Measurements {
        measurements_from_json(value.as_object().unwrap())
    }

    #[test]
    fn test_numeric_fields_kept() {
        let normalized = normalize(1, &payload(serde_json::json!({
            "temperature": 22.1,
            "humidity": 40
        })))
        .unwrap();

        assert_eq!(
            normalized.readings,
            vec![("humidity".to_string(), 40.0), ("temperature".to_string(), 22.1)]
        );
        assert!(normalized.dropped.is_empty());
    }

    #[test]
    fn test_non_numeric_fields_dropped() {
        let normalized = normalize(1, &payload(serde_json::json!({
            "temperature": 22.1,
            "mode": "auto",
            "door_open": true,
            "config": {"a": 1}
        })))
        .unwrap();

        assert_eq!(normalized.readings, vec![("temperature".to_string(), 22.1)]);
        let names: Vec<&str> = normalized.dropped.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["config", "door_open", "mode"]);
    }

    #[test]
    fn test_empty_payload() {
        let err = normalize(1, &payload(serde_json::json!({"mode": "auto", "x": null}))).unwrap_err();
        assert_eq!(err, ValidationError::EmptyPayload { dropped: 2 });

        let err = normalize(1, &Measurements::new()).unwrap_err();
        assert_eq!(err, ValidationError::EmptyPayload { dropped: 0 });
    }

    #[test]
    fn test_bad_names_dropped() {
        let mut measurements = Measurements::new();
        measurements.insert("".to_string(), MeasurementValue::Float(1.0));
        measurements.insert("x".repeat(MAX_NAME_LEN + 1), MeasurementValue::Float(2.0));
        measurements.insert("ok".to_string(), MeasurementValue::Integer(3));

        let normalized = normalize(1, &measurements).unwrap();
        assert_eq!(normalized.readings, vec![("ok".to_string(), 3.0)]);
        assert_eq!(normalized.dropped.len(), 2);
    }

    #[test]
    fn test_non_finite_float_dropped() {
        let mut measurements = Measurements::new();
        measurements.insert("a".to_string(), MeasurementValue::Float(f64::NAN));
        measurements.insert("b".to_string(), MeasurementValue::Float(1.5));

        let normalized = normalize(1, &measurements).unwrap();
        assert_eq!(normalized.readings, vec![("b".to_string(), 1.5)]);
        assert_eq!(normalized.dropped[0].reason, "non-finite float value is not numeric");
    }
}
