//! The externally visible operations: device-facing calls authenticate first,
//! admin calls go straight to the component that owns them.

use crate::auth::DeviceAuthenticator;
use crate::cache::{CacheBackend, CacheSettings, StatusCache};
use crate::clock::Clock;
use crate::errors::{AuthError, CacheError, Result};
use crate::ingest::TelemetryWriter;
use crate::model::{
    AggregateResult, AuthenticatedDevice, BackendHealth, CacheStats, DeviceId, LatestReading,
    RangeResult, StatusReport, SubmitReceipt,
};
use crate::query::{QueryEngine, DEFAULT_MAX_RANGE_LIMIT};
use crate::reconcile::{ConnectivityChange, StatusReconciler, SyncReport, SyncStats};
use crate::store::{DeviceStore, MeasurementStore};
use crate::validate::Measurements;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    pub cache: CacheSettings,
    pub max_range_limit: usize,
    pub sync_enabled: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            max_range_limit: DEFAULT_MAX_RANGE_LIMIT,
            sync_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub store: BackendHealth,
    pub cache: BackendHealth,
}

impl Health {
    /// The service can take writes as long as the durable store is up.
    pub fn is_serving(&self) -> bool {
        self.store == BackendHealth::Healthy
    }
}

pub struct TelemetryService {
    auth: DeviceAuthenticator,
    writer: TelemetryWriter,
    queries: QueryEngine,
    cache: Arc<StatusCache>,
    reconciler: Arc<StatusReconciler>,
    devices: Arc<dyn DeviceStore>,
}

impl TelemetryService {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        measurements: Arc<dyn MeasurementStore>,
        cache_backend: Option<Arc<dyn CacheBackend>>,
        clock: Arc<dyn Clock>,
        settings: ServiceSettings,
    ) -> Self {
        let cache = Arc::new(StatusCache::new(
            cache_backend,
            devices.clone(),
            clock.clone(),
            settings.cache,
        ));
        let reconciler = Arc::new(StatusReconciler::new(
            cache.clone(),
            devices.clone(),
            settings.sync_enabled,
        ));

        Self {
            auth: DeviceAuthenticator::new(devices.clone()),
            writer: TelemetryWriter::new(measurements.clone(), cache.clone(), clock),
            queries: QueryEngine::new(measurements, settings.max_range_limit),
            cache,
            reconciler,
            devices,
        }
    }

    pub fn reconciler(&self) -> Arc<StatusReconciler> {
        self.reconciler.clone()
    }

    /// The credential must belong to `device_id`; a valid credential for a
    /// different device is treated as invalid.
    async fn authorize(
        &self,
        device_id: DeviceId,
        credential: Option<&str>,
    ) -> Result<AuthenticatedDevice> {
        let device = self.auth.authenticate(credential).await?;
        if device.id != device_id {
            warn!(
                "Credential for device {} presented for device {}",
                device.id, device_id
            );
            return Err(AuthError::Invalid.into());
        }
        Ok(device)
    }

    pub async fn submit(
        &self,
        device_id: DeviceId,
        credential: Option<&str>,
        measurements: &Measurements,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<SubmitReceipt> {
        self.authorize(device_id, credential).await?;
        self.writer.submit(device_id, measurements, timestamp).await
    }

    pub async fn heartbeat(
        &self,
        device_id: DeviceId,
        credential: Option<&str>,
    ) -> Result<DateTime<Utc>> {
        self.authorize(device_id, credential).await?;
        Ok(self.writer.heartbeat(device_id).await)
    }

    pub async fn get_range(
        &self,
        device_id: DeviceId,
        credential: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<RangeResult> {
        self.authorize(device_id, credential).await?;
        self.queries.range(device_id, start, end, limit).await
    }

    pub async fn get_latest(
        &self,
        device_id: DeviceId,
        credential: Option<&str>,
    ) -> Result<LatestReading> {
        self.authorize(device_id, credential).await?;
        self.queries.latest(device_id).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn get_aggregate(
        &self,
        device_id: DeviceId,
        credential: Option<&str>,
        measurement: &str,
        function: &str,
        window_secs: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<AggregateResult> {
        self.authorize(device_id, credential).await?;
        self.queries
            .aggregate(device_id, measurement, function, window_secs, start, end)
            .await
    }

    pub async fn delete_range(
        &self,
        device_id: DeviceId,
        credential: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        self.authorize(device_id, credential).await?;
        self.queries.delete(device_id, start, end).await
    }

    pub async fn get_status(&self, device_id: DeviceId) -> Result<StatusReport> {
        self.cache.get_status(device_id).await
    }

    pub async fn get_statuses(
        &self,
        device_ids: &[DeviceId],
    ) -> Result<BTreeMap<DeviceId, StatusReport>> {
        self.cache.get_statuses(device_ids).await
    }

    pub async fn force_sync(&self, device_id: DeviceId) -> Result<SyncReport> {
        Ok(self.reconciler.force_sync(device_id).await?)
    }

    pub async fn bulk_sync(&self) -> SyncReport {
        self.reconciler.bulk_sync().await
    }

    pub fn enable_sync(&self) {
        self.reconciler.enable();
    }

    pub fn disable_sync(&self) {
        self.reconciler.disable();
    }

    pub fn sync_enabled(&self) -> bool {
        self.reconciler.is_enabled()
    }

    /// Connectivity transitions written by reconciliation. Drop the receiver
    /// to unsubscribe.
    pub fn subscribe_status_changes(&self) -> broadcast::Receiver<ConnectivityChange> {
        self.reconciler.subscribe()
    }

    pub async fn get_sync_stats(&self) -> SyncStats {
        self.reconciler.stats().await
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        let (entry_count, backend_health) = self.cache.stats().await;
        CacheStats {
            entry_count,
            backend_health,
            sync_enabled: self.reconciler.is_enabled(),
        }
    }

    pub async fn clear_device_cache(
        &self,
        device_id: DeviceId,
    ) -> std::result::Result<bool, CacheError> {
        self.cache.clear_device(device_id).await
    }

    pub async fn clear_all_device_caches(&self) -> std::result::Result<usize, CacheError> {
        self.cache.clear_all().await
    }

    pub async fn health(&self) -> Health {
        let store = match self.devices.ping().await {
            Ok(()) => BackendHealth::Healthy,
            Err(e) => BackendHealth::Degraded {
                reason: e.to_string(),
            },
        };
        Health {
            store,
            cache: self.cache.health().await,
        }
    }
}
