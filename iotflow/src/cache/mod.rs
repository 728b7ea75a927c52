//! Device liveness cache.
//!
//! The cache only remembers *when* a device was last active. Online/Offline is
//! derived on read by comparing that timestamp against the offline threshold,
//! which is independent of the entry TTL. The TTL bounds how long the cache
//! remembers a device at all; the threshold decides liveness.
//!
//! The cache is an accelerator. Every read has a durable fallback and no
//! cache failure is ever returned to ingestion or status callers.

pub mod memory;
pub mod redis;

use crate::clock::Clock;
use crate::errors::{CacheError, Error, Result};
use crate::metrics::CACHE_FAILURES_TOTAL;
use crate::model::{BackendHealth, Connectivity, DeviceId, Liveness, LivenessSource, StatusReport};
use crate::store::DeviceStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub use memory::InMemoryCache;
pub use redis::RedisCache;

pub const LAST_SEEN_PREFIX: &str = "device:lastseen:";

pub fn last_seen_key(device_id: DeviceId) -> String {
    format!("{}{}", LAST_SEEN_PREFIX, device_id)
}

pub fn parse_last_seen_key(key: &str) -> Option<DeviceId> {
    key.strip_prefix(LAST_SEEN_PREFIX)?.parse().ok()
}

async fn bounded_by<T>(
    limit: Duration,
    fut: impl Future<Output = std::result::Result<T, CacheError>>,
) -> std::result::Result<T, CacheError> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(CacheError::Timeout))
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn set_last_seen(
        &self,
        device_id: DeviceId,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> std::result::Result<(), CacheError>;

    async fn get_last_seen(
        &self,
        device_id: DeviceId,
    ) -> std::result::Result<Option<DateTime<Utc>>, CacheError>;

    /// One slot per requested id, in request order.
    async fn get_many_last_seen(
        &self,
        device_ids: &[DeviceId],
    ) -> std::result::Result<Vec<Option<DateTime<Utc>>>, CacheError>;

    /// Every device that currently has an unexpired entry.
    async fn tracked_devices(&self) -> std::result::Result<Vec<DeviceId>, CacheError>;

    async fn remove(&self, device_id: DeviceId) -> std::result::Result<bool, CacheError>;

    async fn clear_all(&self) -> std::result::Result<usize, CacheError>;

    async fn ping(&self) -> std::result::Result<(), CacheError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    /// How long an entry survives without refresh.
    pub ttl: Duration,
    /// How recent the last activity must be to count as Online.
    pub offline_threshold: chrono::Duration,
    /// Upper bound on any single backend call.
    pub op_timeout: Duration,
    /// Upper bound on calls that walk every entry (listing, clearing).
    pub scan_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            offline_threshold: chrono::Duration::seconds(60),
            op_timeout: Duration::from_millis(250),
            scan_timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of one activity event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activity {
    /// The instant stored as the device's last activity.
    pub at: DateTime<Utc>,
    /// Whether the cache took the write; when false the durable record did.
    pub cached: bool,
}

pub struct StatusCache {
    backend: Option<Arc<dyn CacheBackend>>,
    devices: Arc<dyn DeviceStore>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
}

impl StatusCache {
    /// `backend = None` runs with the cache tier disabled; every read then
    /// goes to the durable store.
    pub fn new(
        backend: Option<Arc<dyn CacheBackend>>,
        devices: Arc<dyn DeviceStore>,
        clock: Arc<dyn Clock>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            backend,
            devices,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> CacheSettings {
        self.settings
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn derive(&self, last_activity: DateTime<Utc>, now: DateTime<Utc>) -> Connectivity {
        Connectivity::derive(last_activity, now, self.settings.offline_threshold)
    }

    fn backend(&self) -> std::result::Result<&Arc<dyn CacheBackend>, CacheError> {
        self.backend.as_ref().ok_or(CacheError::Disabled)
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, CacheError>>,
    ) -> std::result::Result<T, CacheError> {
        bounded_by(self.settings.op_timeout, fut).await
    }

    async fn bounded_scan<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, CacheError>>,
    ) -> std::result::Result<T, CacheError> {
        bounded_by(self.settings.scan_timeout, fut).await
    }

    fn absorb(&self, op: &str, device_id: Option<DeviceId>, err: &CacheError) {
        if *err == CacheError::Disabled {
            return;
        }
        CACHE_FAILURES_TOTAL.inc();
        match device_id {
            Some(id) => warn!("Status cache {} failed for device {}: {}", op, id, err),
            None => warn!("Status cache {} failed: {}", op, err),
        }
    }

    /// Record that a device was just active.
    ///
    /// Never fails. When the cache does not take the write, the durable
    /// `last_seen` is advanced instead so liveness stays derivable.
    pub async fn record_activity(&self, device_id: DeviceId) -> Activity {
        let now = self.clock.now();
        let outcome = match self.backend() {
            Ok(backend) => {
                self.bounded(backend.set_last_seen(device_id, now, self.settings.ttl))
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                debug!("Device {} active at {}", device_id, now);
                Activity {
                    at: now,
                    cached: true,
                }
            }
            Err(e) => {
                self.absorb("write", Some(device_id), &e);
                self.touch_durable(device_id, now).await;
                Activity {
                    at: now,
                    cached: false,
                }
            }
        }
    }

    async fn touch_durable(&self, device_id: DeviceId, at: DateTime<Utc>) {
        match self.devices.touch_last_seen(device_id, at).await {
            Ok(true) => debug!("Durable last_seen advanced for device {}", device_id),
            Ok(false) => warn!("Activity for unknown device {}", device_id),
            Err(e) => warn!("Could not advance durable last_seen for device {}: {}", device_id, e),
        }
    }

    /// Raw cache lookup. Unlike the other reads this surfaces cache failures,
    /// which reconciliation needs to tell "absent" from "unreachable".
    pub async fn lookup(
        &self,
        device_id: DeviceId,
    ) -> std::result::Result<Option<DateTime<Utc>>, CacheError> {
        let backend = self.backend()?;
        self.bounded(backend.get_last_seen(device_id)).await
    }

    async fn cached_last_seen(&self, device_id: DeviceId) -> Option<DateTime<Utc>> {
        match self.lookup(device_id).await {
            Ok(last_seen) => last_seen,
            Err(e) => {
                self.absorb("read", Some(device_id), &e);
                None
            }
        }
    }

    /// Liveness from the cache, or from the durable record when the cache has
    /// nothing, is unreachable, or holds an entry older than the durable one.
    pub async fn get_status(&self, device_id: DeviceId) -> Result<StatusReport> {
        let now = self.clock.now();
        match self.cached_last_seen(device_id).await {
            Some(last_seen) => Ok(self.reconcile_report(device_id, last_seen, now).await),
            None => self.durable_status(device_id, now).await,
        }
    }

    /// Statuses for many devices. Ids with no device record are omitted.
    pub async fn get_statuses(
        &self,
        device_ids: &[DeviceId],
    ) -> Result<BTreeMap<DeviceId, StatusReport>> {
        let now = self.clock.now();
        let cached = match self.backend() {
            Ok(backend) => self.bounded(backend.get_many_last_seen(device_ids)).await,
            Err(e) => Err(e),
        };
        let cached = cached.unwrap_or_else(|e| {
            self.absorb("bulk read", None, &e);
            vec![None; device_ids.len()]
        });

        let mut reports = BTreeMap::new();
        for (idx, &device_id) in device_ids.iter().enumerate() {
            let report = match cached.get(idx).copied().flatten() {
                Some(last_seen) => self.reconcile_report(device_id, last_seen, now).await,
                None => match self.durable_status(device_id, now).await {
                    Ok(report) => report,
                    Err(Error::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                },
            };
            reports.insert(device_id, report);
        }
        Ok(reports)
    }

    /// The later of the cached and durable activity timestamps.
    pub async fn get_last_seen(&self, device_id: DeviceId) -> Option<DateTime<Utc>> {
        let cached = self.cached_last_seen(device_id).await;
        let durable = match self.devices.get_device(device_id).await {
            Ok(device) => device.and_then(|d| d.last_seen),
            Err(e) => {
                warn!("Durable last_seen lookup failed for device {}: {}", device_id, e);
                None
            }
        };
        cached.max(durable)
    }

    /// A cache hit that already reads Online is final. Otherwise the durable
    /// record may hold newer activity written while the cache was degraded.
    async fn reconcile_report(
        &self,
        device_id: DeviceId,
        cached: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StatusReport {
        let report = self.cache_report(device_id, cached, now);
        if report.status == Liveness::Online {
            return report;
        }
        match self.devices.get_device(device_id).await {
            Ok(Some(device)) if device.last_seen > Some(cached) => StatusReport {
                device_id,
                status: device
                    .last_seen
                    .map_or(Liveness::Offline, |seen| self.derive(seen, now).into()),
                last_seen: device.last_seen,
                source: LivenessSource::Durable,
            },
            Ok(_) => report,
            Err(e) => {
                debug!("Durable cross-check failed for device {}: {}", device_id, e);
                report
            }
        }
    }

    fn cache_report(
        &self,
        device_id: DeviceId,
        last_seen: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StatusReport {
        StatusReport {
            device_id,
            status: self.derive(last_seen, now).into(),
            last_seen: Some(last_seen),
            source: LivenessSource::Cache,
        }
    }

    async fn durable_status(&self, device_id: DeviceId, now: DateTime<Utc>) -> Result<StatusReport> {
        match self.devices.get_device(device_id).await {
            Ok(Some(device)) => Ok(StatusReport {
                device_id,
                status: match device.last_seen {
                    Some(seen) => self.derive(seen, now).into(),
                    None => Liveness::Offline,
                },
                last_seen: device.last_seen,
                source: LivenessSource::Durable,
            }),
            Ok(None) => Err(Error::NotFound(format!("device {}", device_id))),
            Err(e) => {
                warn!("Durable status fallback failed for device {}: {}", device_id, e);
                Ok(StatusReport {
                    device_id,
                    status: Liveness::Unknown,
                    last_seen: None,
                    source: LivenessSource::Unavailable,
                })
            }
        }
    }

    pub async fn tracked_devices(&self) -> std::result::Result<Vec<DeviceId>, CacheError> {
        let backend = self.backend()?;
        self.bounded_scan(backend.tracked_devices()).await
    }

    pub async fn clear_device(&self, device_id: DeviceId) -> std::result::Result<bool, CacheError> {
        let backend = self.backend()?;
        self.bounded(backend.remove(device_id)).await
    }

    pub async fn clear_all(&self) -> std::result::Result<usize, CacheError> {
        let backend = self.backend()?;
        self.bounded_scan(backend.clear_all()).await
    }

    pub async fn health(&self) -> BackendHealth {
        let backend = match self.backend() {
            Ok(backend) => backend,
            Err(_) => return BackendHealth::Disabled,
        };
        match self.bounded(backend.ping()).await {
            Ok(()) => BackendHealth::Healthy,
            Err(e) => BackendHealth::Degraded {
                reason: e.to_string(),
            },
        }
    }

    /// Entry count (when reachable) and backend health.
    pub async fn stats(&self) -> (Option<usize>, BackendHealth) {
        let health = self.health().await;
        let entry_count = match health {
            BackendHealth::Healthy => self.tracked_devices().await.ok().map(|ids| ids.len()),
            _ => None,
        };
        (entry_count, health)
    }
}
