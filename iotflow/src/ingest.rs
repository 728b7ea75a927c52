use crate::cache::StatusCache;
use crate::clock::Clock;
use crate::errors::{Error, Result};
use crate::metrics::{
    INGEST_LATENCY_SECONDS, REJECTED_SUBMISSIONS_TOTAL, ROWS_WRITTEN_TOTAL, SUBMISSIONS_TOTAL,
};
use crate::model::{DeviceId, MeasurementRow, SubmitReceipt};
use crate::store::MeasurementStore;
use crate::validate::{normalize, Measurements};
use chrono::{DateTime, SubsecRound, Utc};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error};

/// Normalizes submissions into measurement rows and persists them.
///
/// The activity signal is only sent after the rows are committed, so a
/// device never looks alive because of a write that failed.
pub struct TelemetryWriter {
    measurements: Arc<dyn MeasurementStore>,
    cache: Arc<StatusCache>,
    clock: Arc<dyn Clock>,
}

impl TelemetryWriter {
    pub fn new(
        measurements: Arc<dyn MeasurementStore>,
        cache: Arc<StatusCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            measurements,
            cache,
            clock,
        }
    }

    pub async fn submit(
        &self,
        device_id: DeviceId,
        measurements: &Measurements,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<SubmitReceipt> {
        // Captured on entry, not at persistence time.
        let received_at = self.clock.now();
        let timestamp = timestamp.map_or(received_at, |t| t.trunc_subsecs(6));
        SUBMISSIONS_TOTAL.inc();

        let normalized = normalize(device_id, measurements).map_err(|e| {
            REJECTED_SUBMISSIONS_TOTAL.with_label_values(&["validation"]).inc();
            Error::Validation(e)
        })?;

        let rows: Vec<MeasurementRow> = normalized
            .readings
            .into_iter()
            .map(|(measurement_name, numeric_value)| MeasurementRow {
                device_id,
                timestamp,
                measurement_name,
                numeric_value,
            })
            .collect();

        let start = Instant::now();
        if let Err(e) = self.measurements.insert_rows(&rows).await {
            error!("Failed to persist {} rows for device {}: {}", rows.len(), device_id, e);
            REJECTED_SUBMISSIONS_TOTAL.with_label_values(&["storage"]).inc();
            return Err(e.into());
        }
        INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
        ROWS_WRITTEN_TOTAL.inc_by(rows.len() as f64);

        self.cache.record_activity(device_id).await;

        debug!(
            "Stored {} measurement(s) for device {} at {} ({} dropped)",
            rows.len(),
            device_id,
            timestamp,
            normalized.dropped.len()
        );

        Ok(SubmitReceipt {
            device_id,
            accepted_count: rows.len(),
            timestamp,
            dropped: normalized.dropped,
        })
    }

    /// Activity without measurements. Returns the instant that was recorded.
    pub async fn heartbeat(&self, device_id: DeviceId) -> DateTime<Utc> {
        self.cache.record_activity(device_id).await.at
    }
}
