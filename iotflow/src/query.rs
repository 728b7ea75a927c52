use crate::errors::{Error, Result, ValidationError};
use crate::model::{
    AggregateFn, AggregateQuery, AggregateResult, DeviceId, LatestReading, RangeResult,
};
use crate::store::MeasurementStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

pub const DEFAULT_MAX_RANGE_LIMIT: usize = 10_000;

/// Widest aggregation bucket: one leap year.
pub const MAX_WINDOW_SECS: i64 = 366 * 24 * 60 * 60;

/// Reads over the durable measurement table. Holds no handle to the status
/// cache: telemetry history and liveness are independent.
pub struct QueryEngine {
    measurements: Arc<dyn MeasurementStore>,
    max_limit: usize,
}

fn check_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if start >= end {
        return Err(ValidationError::InvalidRange.into());
    }
    Ok(())
}

impl QueryEngine {
    pub fn new(measurements: Arc<dyn MeasurementStore>, max_limit: usize) -> Self {
        Self {
            measurements,
            max_limit,
        }
    }

    /// Rows in `[start, end)`, newest first. `limit` is capped at the
    /// configured maximum and the result says whether rows were cut off.
    pub async fn range(
        &self,
        device_id: DeviceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<RangeResult> {
        check_window(start, end)?;
        let limit = limit.min(self.max_limit);

        // One extra row tells us whether the window holds more than `limit`.
        let mut rows = self
            .measurements
            .range(device_id, start, end, limit.saturating_add(1))
            .await?;
        let truncated = rows.len() > limit;
        rows.truncate(limit);

        if truncated {
            debug!("Range for device {} truncated at {} rows", device_id, limit);
        }

        Ok(RangeResult {
            device_id,
            count: rows.len(),
            rows,
            limit,
            truncated,
        })
    }

    pub async fn aggregate(
        &self,
        device_id: DeviceId,
        measurement: &str,
        function: &str,
        window_secs: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<AggregateResult> {
        let function: AggregateFn = function.parse()?;
        if !(1..=MAX_WINDOW_SECS).contains(&window_secs) {
            return Err(ValidationError::InvalidWindow.into());
        }
        check_window(start, end)?;

        let query = AggregateQuery {
            device_id,
            measurement: measurement.to_string(),
            function,
            window_secs,
            start,
            end,
        };
        let buckets = self.measurements.aggregate(&query).await?;
        let count = buckets.iter().map(|b| b.count).sum();

        Ok(AggregateResult {
            device_id,
            measurement: query.measurement,
            function,
            window_secs,
            buckets,
            count,
        })
    }

    pub async fn latest(&self, device_id: DeviceId) -> Result<LatestReading> {
        let rows = self.measurements.latest(device_id).await?;
        let timestamp = match rows.first() {
            Some(row) => row.timestamp,
            None => {
                return Err(Error::NotFound(format!(
                    "no telemetry for device {}",
                    device_id
                )))
            }
        };

        Ok(LatestReading {
            device_id,
            timestamp,
            measurements: rows
                .into_iter()
                .map(|r| (r.measurement_name, r.numeric_value))
                .collect(),
        })
    }

    /// Irreversibly delete rows in `[start, end)`.
    pub async fn delete(
        &self,
        device_id: DeviceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        check_window(start, end)?;
        let deleted = self.measurements.delete_range(device_id, start, end).await?;
        info!(
            "Deleted {} telemetry rows for device {} in [{}, {})",
            deleted, device_id, start, end
        );
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StorageError;
    use crate::model::MeasurementRow;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    /// Temperature every 10s for five minutes, plus humidity every minute.
    async fn seeded(max_limit: usize) -> (Arc<MemoryStore>, QueryEngine) {
        let store = Arc::new(MemoryStore::new());
        let mut rows = Vec::new();
        for i in 0..30 {
            rows.push(MeasurementRow {
                device_id: 1,
                timestamp: t0() + Duration::seconds(i * 10),
                measurement_name: "temperature".to_string(),
                numeric_value: i as f64,
            });
        }
        for i in 0..5 {
            rows.push(MeasurementRow {
                device_id: 1,
                timestamp: t0() + Duration::minutes(i),
                measurement_name: "humidity".to_string(),
                numeric_value: 50.0,
            });
        }
        store.insert_rows(&rows).await.unwrap();
        (store.clone(), QueryEngine::new(store, max_limit))
    }

    #[tokio::test]
    async fn test_range_respects_limit_and_reports_truncation() {
        let (_, engine) = seeded(DEFAULT_MAX_RANGE_LIMIT).await;
        let result = engine
            .range(1, t0(), t0() + Duration::minutes(10), 7)
            .await
            .unwrap();

        assert_eq!(result.count, 7);
        assert_eq!(result.rows.len(), 7);
        assert!(result.truncated);
        assert!(result.rows.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_range_limit_is_capped() {
        let (_, engine) = seeded(10).await;
        let result = engine
            .range(1, t0(), t0() + Duration::minutes(10), 1_000_000)
            .await
            .unwrap();

        assert_eq!(result.limit, 10);
        assert_eq!(result.count, 10);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_range_excludes_end_bound() {
        let (_, engine) = seeded(DEFAULT_MAX_RANGE_LIMIT).await;
        let start = t0() + Duration::seconds(10);
        let end = t0() + Duration::seconds(60);
        let result = engine.range(1, start, end, 100).await.unwrap();

        assert!(!result.truncated);
        assert!(result.rows.iter().all(|r| r.timestamp >= start && r.timestamp < end));
        // temperature at 10..50s, no humidity (it sits at 0s and 60s)
        assert_eq!(result.count, 5);
    }

    #[tokio::test]
    async fn test_inverted_window_is_rejected() {
        let (_, engine) = seeded(DEFAULT_MAX_RANGE_LIMIT).await;
        let err = engine.range(1, t0(), t0(), 10).await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::InvalidRange)));
    }

    #[tokio::test]
    async fn test_aggregate_buckets() {
        let (_, engine) = seeded(DEFAULT_MAX_RANGE_LIMIT).await;
        let result = engine
            .aggregate(1, "temperature", "avg", 60, t0(), t0() + Duration::minutes(5))
            .await
            .unwrap();

        assert_eq!(result.buckets.len(), 5);
        assert_eq!(result.count, 30);
        assert_eq!(result.buckets[0].bucket_start, t0());
        assert_eq!(result.buckets[0].value, Some(2.5));
        assert_eq!(result.buckets[0].count, 6);
    }

    #[tokio::test]
    async fn test_aggregate_count_matches_range() {
        let (_, engine) = seeded(DEFAULT_MAX_RANGE_LIMIT).await;
        let start = t0() + Duration::seconds(25);
        let end = t0() + Duration::seconds(125);

        let aggregate = engine
            .aggregate(1, "temperature", "count", 30, start, end)
            .await
            .unwrap();
        let range = engine.range(1, start, end, 10_000).await.unwrap();
        let in_range = range
            .rows
            .iter()
            .filter(|r| r.measurement_name == "temperature")
            .count() as i64;

        assert_eq!(aggregate.count, in_range);
        let summed: f64 = aggregate.buckets.iter().filter_map(|b| b.value).sum();
        assert_eq!(summed, in_range as f64);
    }

    #[tokio::test]
    async fn test_aggregate_without_rows_is_empty_not_error() {
        let (_, engine) = seeded(DEFAULT_MAX_RANGE_LIMIT).await;
        let result = engine
            .aggregate(1, "pressure", "max", 60, t0(), t0() + Duration::hours(1))
            .await
            .unwrap();

        assert!(result.buckets.is_empty());
        assert_eq!(result.count, 0);
    }

    #[tokio::test]
    async fn test_aggregate_rejects_bad_parameters() {
        let (_, engine) = seeded(DEFAULT_MAX_RANGE_LIMIT).await;
        let end = t0() + Duration::hours(1);

        let err = engine.aggregate(1, "temperature", "median", 60, t0(), end).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::UnsupportedAggregation(ref f)) if f == "median"
        ));

        let err = engine.aggregate(1, "temperature", "sum", 0, t0(), end).await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::InvalidWindow)));
    }

    #[tokio::test]
    async fn test_aggregate_window_has_an_upper_bound() {
        let (_, engine) = seeded(DEFAULT_MAX_RANGE_LIMIT).await;
        let end = t0() + Duration::hours(1);

        for window in [MAX_WINDOW_SECS + 1, i64::MAX] {
            let err = engine
                .aggregate(1, "temperature", "count", window, t0(), end)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Validation(ValidationError::InvalidWindow)));
        }

        let result = engine
            .aggregate(1, "temperature", "count", MAX_WINDOW_SECS, t0(), end)
            .await
            .unwrap();
        assert_eq!(result.buckets.len(), 1);
        assert_eq!(result.count, 30);
    }

    #[tokio::test]
    async fn test_latest_returns_full_measurement_set() {
        let (_, engine) = seeded(DEFAULT_MAX_RANGE_LIMIT).await;
        let latest = engine.latest(1).await.unwrap();

        assert_eq!(latest.timestamp, t0() + Duration::seconds(290));
        assert_eq!(latest.measurements.len(), 1);
        assert_eq!(latest.measurements["temperature"], 29.0);
    }

    #[tokio::test]
    async fn test_latest_without_rows_is_not_found() {
        let (_, engine) = seeded(DEFAULT_MAX_RANGE_LIMIT).await;
        assert!(matches!(engine.latest(2).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_window() {
        let (store, engine) = seeded(DEFAULT_MAX_RANGE_LIMIT).await;
        let deleted = engine.delete(1, t0(), t0() + Duration::minutes(1)).await.unwrap();

        // temperature 0..50s (6 rows) and humidity at 0s
        assert_eq!(deleted, 7);
        assert_eq!(store.row_count(), 35 - 7);
    }

    #[tokio::test]
    async fn test_store_outage_fails_queries() {
        let (store, engine) = seeded(DEFAULT_MAX_RANGE_LIMIT).await;
        store.set_available(false);
        let err = engine.range(1, t0(), t0() + Duration::minutes(1), 10).await.unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::Unavailable(_))));
    }
}
