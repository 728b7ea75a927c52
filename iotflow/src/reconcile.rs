//! Copies cache-derived liveness into the durable device record.
//!
//! Reconciliation is best-effort. Each device is an independent unit: one
//! failing device never aborts a batch, and re-running a partial batch only
//! writes devices whose durable state still differs from the cache.

use crate::cache::StatusCache;
use crate::errors::{CacheError, ReconcileError};
use crate::metrics::{SYNC_ENABLED, SYNC_RESULTS_TOTAL};
use crate::model::{Connectivity, Device, DeviceId};
use crate::store::DeviceStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Undelivered changes kept per subscriber before the oldest are dropped.
const CHANGE_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyCurrent,
    NoCacheEntry,
    SyncDisabled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum SyncOutcome {
    Synced {
        connectivity: Connectivity,
        last_seen: DateTime<Utc>,
    },
    /// `connectivity` and `last_seen` carry the derived state when one exists.
    Skipped {
        reason: SkipReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        connectivity: Option<Connectivity>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_seen: Option<DateTime<Utc>>,
    },
    Failed {
        error: String,
    },
}

impl SyncOutcome {
    fn skipped(reason: SkipReason, state: Option<(Connectivity, DateTime<Utc>)>) -> Self {
        SyncOutcome::Skipped {
            reason,
            connectivity: state.map(|(c, _)| c),
            last_seen: state.map(|(_, t)| t),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            SyncOutcome::Synced { .. } => "synced",
            SyncOutcome::Skipped { .. } => "skipped",
            SyncOutcome::Failed { .. } => "failed",
        }
    }
}

/// Published whenever reconciliation flips a device's durable connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectivityChange {
    pub device_id: DeviceId,
    pub previous: Connectivity,
    pub current: Connectivity,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncItem {
    pub device_id: DeviceId,
    #[serde(flatten)]
    pub outcome: SyncOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    pub skipped: usize,
    pub items: Vec<SyncItem>,
    /// Failures that are not tied to one device, such as listing cache entries.
    pub errors: Vec<String>,
}

impl SyncReport {
    fn record(&mut self, device_id: DeviceId, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Synced { .. } => self.synced += 1,
            SyncOutcome::Skipped { .. } => self.skipped += 1,
            SyncOutcome::Failed { .. } => self.failed += 1,
        }
        SYNC_RESULTS_TOTAL.with_label_values(&[outcome.label()]).inc();
        self.items.push(SyncItem { device_id, outcome });
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStats {
    pub enabled: bool,
    pub runs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_synced: usize,
    pub last_failed: usize,
    pub last_skipped: usize,
    pub tracked_devices: Option<usize>,
}

#[derive(Debug, Default)]
struct History {
    runs: u64,
    last_run_at: Option<DateTime<Utc>>,
    last: (usize, usize, usize),
}

pub struct StatusReconciler {
    cache: Arc<StatusCache>,
    devices: Arc<dyn DeviceStore>,
    enabled: AtomicBool,
    history: Mutex<History>,
    changes: broadcast::Sender<ConnectivityChange>,
}

impl StatusReconciler {
    pub fn new(cache: Arc<StatusCache>, devices: Arc<dyn DeviceStore>, enabled: bool) -> Self {
        SYNC_ENABLED.set(if enabled { 1.0 } else { 0.0 });
        Self {
            cache,
            devices,
            enabled: AtomicBool::new(enabled),
            history: Mutex::new(History::default()),
            changes: broadcast::channel(CHANGE_BUFFER).0,
        }
    }

    /// Receive every connectivity change from now on. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityChange> {
        self.changes.subscribe()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        SYNC_ENABLED.set(1.0);
        info!("Status reconciliation enabled");
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        SYNC_ENABLED.set(0.0);
        info!("Status reconciliation disabled");
    }

    /// Reconcile one device now. Only an unknown device is an error; every
    /// other failure is reported in the returned report.
    pub async fn force_sync(&self, device_id: DeviceId) -> Result<SyncReport, ReconcileError> {
        let mut report = SyncReport::default();
        let outcome = match self.devices.get_device(device_id).await {
            Ok(Some(device)) => self.sync_device(device).await,
            Ok(None) => return Err(ReconcileError::NotFound(device_id)),
            Err(e) => SyncOutcome::Failed {
                error: e.to_string(),
            },
        };
        report.record(device_id, outcome);
        self.finish_run(&report);
        Ok(report)
    }

    /// Reconcile every device the cache currently tracks.
    pub async fn bulk_sync(&self) -> SyncReport {
        let mut report = SyncReport::default();
        match self.cache.tracked_devices().await {
            Ok(device_ids) => {
                for device_id in device_ids {
                    let outcome = self.sync_tracked(device_id).await;
                    report.record(device_id, outcome);
                }
            }
            Err(e) => {
                warn!("Bulk sync could not list cached devices: {}", e);
                report.errors.push(format!("listing cached devices failed: {}", e));
            }
        }

        self.finish_run(&report);
        info!(
            "Bulk sync finished: {} synced, {} skipped, {} failed",
            report.synced, report.skipped, report.failed
        );
        report
    }

    async fn sync_tracked(&self, device_id: DeviceId) -> SyncOutcome {
        match self.devices.get_device(device_id).await {
            Ok(Some(device)) => self.sync_device(device).await,
            Ok(None) => SyncOutcome::Failed {
                error: format!("device {} has a cache entry but no record", device_id),
            },
            Err(e) => SyncOutcome::Failed {
                error: e.to_string(),
            },
        }
    }

    async fn sync_device(&self, device: Device) -> SyncOutcome {
        // A cache entry can lag the durable record after an outage, so the
        // later of the two wins. With the cache tier off, durable is all there is.
        let last_seen = match self.cache.lookup(device.id).await {
            Ok(Some(cached)) => device.last_seen.map_or(cached, |durable| durable.max(cached)),
            Ok(None) => return SyncOutcome::skipped(SkipReason::NoCacheEntry, None),
            Err(CacheError::Disabled) => match device.last_seen {
                Some(last_seen) => last_seen,
                None => return SyncOutcome::skipped(SkipReason::NoCacheEntry, None),
            },
            Err(e) => {
                return SyncOutcome::Failed {
                    error: format!("cache lookup failed: {}", e),
                }
            }
        };

        let connectivity = self.cache.derive(last_seen, self.cache.now());
        if device.connectivity == connectivity && device.last_seen == Some(last_seen) {
            return SyncOutcome::skipped(SkipReason::AlreadyCurrent, Some((connectivity, last_seen)));
        }

        if !self.is_enabled() {
            return SyncOutcome::skipped(SkipReason::SyncDisabled, Some((connectivity, last_seen)));
        }

        match self
            .devices
            .write_liveness(device.id, connectivity, last_seen)
            .await
        {
            Ok(true) => {
                debug!(
                    "Device {} reconciled: {} -> {} (last seen {})",
                    device.id, device.connectivity, connectivity, last_seen
                );
                if device.connectivity != connectivity {
                    // No subscribers is not an error.
                    let _ = self.changes.send(ConnectivityChange {
                        device_id: device.id,
                        previous: device.connectivity,
                        current: connectivity,
                        last_seen,
                    });
                }
                SyncOutcome::Synced {
                    connectivity,
                    last_seen,
                }
            }
            Ok(false) => SyncOutcome::Failed {
                error: format!("device {} disappeared during sync", device.id),
            },
            Err(e) => SyncOutcome::Failed {
                error: e.to_string(),
            },
        }
    }

    fn finish_run(&self, report: &SyncReport) {
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.runs += 1;
        history.last_run_at = Some(self.cache.now());
        history.last = (report.synced, report.failed, report.skipped);
    }

    pub async fn stats(&self) -> SyncStats {
        let tracked_devices = self.cache.tracked_devices().await.ok().map(|ids| ids.len());
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        SyncStats {
            enabled: self.is_enabled(),
            runs: history.runs,
            last_run_at: history.last_run_at,
            last_synced: history.last.0,
            last_failed: history.last.1,
            last_skipped: history.last.2,
            tracked_devices,
        }
    }

    /// Run `bulk_sync` every `every` until `shutdown` flips or its sender drops.
    pub async fn run_periodic(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        info!("Starting status reconciler with interval {:?}", every);
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_enabled() {
                        self.bulk_sync().await;
                    } else {
                        debug!("Reconciliation disabled, skipping cycle");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Status reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{fixture, Fixture};
    use crate::cache::CacheSettings;
    use crate::clock::Clock;
    use chrono::Duration as ChronoDuration;

    fn reconciler(f: &Fixture) -> StatusReconciler {
        StatusReconciler::new(f.cache.clone(), f.store.clone(), true)
    }

    async fn durable(f: &Fixture, id: DeviceId) -> Device {
        f.store.get_device(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_force_sync_writes_then_skips() {
        let f = fixture();
        let r = reconciler(&f);
        f.cache.record_activity(1).await;

        let report = r.force_sync(1).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(
            report.items[0].outcome,
            SyncOutcome::Synced {
                connectivity: Connectivity::Online,
                last_seen: f.clock.now()
            }
        );
        let device = durable(&f, 1).await;
        assert_eq!(device.connectivity, Connectivity::Online);
        assert_eq!(device.last_seen, Some(f.clock.now()));

        let again = r.force_sync(1).await.unwrap();
        assert_eq!((again.synced, again.skipped, again.failed), (0, 1, 0));
        assert_eq!(
            again.items[0].outcome,
            SyncOutcome::Skipped {
                reason: SkipReason::AlreadyCurrent,
                connectivity: Some(Connectivity::Online),
                last_seen: Some(f.clock.now()),
            }
        );
    }

    #[tokio::test]
    async fn test_skip_without_cache_entry_carries_no_state() {
        let f = fixture();
        let report = reconciler(&f).force_sync(2).await.unwrap();
        assert_eq!(
            report.items[0].outcome,
            SyncOutcome::Skipped {
                reason: SkipReason::NoCacheEntry,
                connectivity: None,
                last_seen: None,
            }
        );
        let json = serde_json::to_value(&report.items[0]).unwrap();
        assert_eq!(json["reason"], "no_cache_entry");
        assert!(json.get("last_seen").is_none());
    }

    #[tokio::test]
    async fn test_sync_after_cache_outage_keeps_newer_durable_activity() {
        let f = fixture();
        let r = reconciler(&f);
        let t0 = f.clock.now();
        f.cache.record_activity(1).await;

        f.backend.down.store(true, std::sync::atomic::Ordering::SeqCst);
        f.clock.advance(ChronoDuration::seconds(30));
        let during_outage = f.cache.record_activity(1).await;
        assert!(!during_outage.cached);
        f.backend.down.store(false, std::sync::atomic::Ordering::SeqCst);

        f.clock.advance(ChronoDuration::seconds(40));
        let report = r.force_sync(1).await.unwrap();

        assert_eq!(
            report.items[0].outcome,
            SyncOutcome::Synced {
                connectivity: Connectivity::Online,
                last_seen: t0 + ChronoDuration::seconds(30),
            }
        );
        let device = durable(&f, 1).await;
        assert_eq!(device.connectivity, Connectivity::Online);
        assert_eq!(device.last_seen, Some(during_outage.at));
    }

    #[tokio::test]
    async fn test_connectivity_changes_are_published() {
        let f = fixture();
        let r = reconciler(&f);
        let mut changes = r.subscribe();
        f.cache.record_activity(1).await;
        let seen = f.clock.now();

        r.force_sync(1).await.unwrap();
        assert_eq!(
            changes.try_recv().unwrap(),
            ConnectivityChange {
                device_id: 1,
                previous: Connectivity::Offline,
                current: Connectivity::Online,
                last_seen: seen,
            }
        );

        // Nothing changed, nothing published.
        r.force_sync(1).await.unwrap();
        assert_eq!(changes.try_recv(), Err(broadcast::error::TryRecvError::Empty));

        f.clock.advance(ChronoDuration::seconds(61));
        r.bulk_sync().await;
        let change = changes.try_recv().unwrap();
        assert_eq!((change.previous, change.current), (Connectivity::Online, Connectivity::Offline));

        drop(changes);
        f.cache.record_activity(1).await;
        assert_eq!(r.force_sync(1).await.unwrap().synced, 1);
    }

    #[tokio::test]
    async fn test_disabled_sync_publishes_nothing() {
        let f = fixture();
        let r = reconciler(&f);
        let mut changes = r.subscribe();
        r.disable();
        f.cache.record_activity(1).await;

        r.force_sync(1).await.unwrap();
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_force_sync_records_transition_to_offline() {
        let f = fixture();
        let r = reconciler(&f);
        f.cache.record_activity(1).await;
        r.force_sync(1).await.unwrap();

        f.clock.advance(ChronoDuration::seconds(61));
        let report = r.force_sync(1).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(durable(&f, 1).await.connectivity, Connectivity::Offline);
    }

    #[tokio::test]
    async fn test_force_sync_unknown_device() {
        let f = fixture();
        assert_eq!(reconciler(&f).force_sync(42).await, Err(ReconcileError::NotFound(42)));
    }

    #[tokio::test]
    async fn test_bulk_sync_isolates_failures() {
        let f = fixture();
        let r = reconciler(&f);
        for id in 1..=3 {
            f.cache.record_activity(id).await;
        }
        *f.backend.poisoned.lock().unwrap() = Some(2);

        let report = r.bulk_sync().await;

        assert_eq!(report.synced, 2);
        assert_eq!(report.failed, 1);
        let failed: Vec<DeviceId> = report
            .items
            .iter()
            .filter(|i| matches!(i.outcome, SyncOutcome::Failed { .. }))
            .map(|i| i.device_id)
            .collect();
        assert_eq!(failed, vec![2]);
        assert_eq!(durable(&f, 3).await.connectivity, Connectivity::Online);
    }

    #[tokio::test]
    async fn test_bulk_sync_rerun_does_not_double_count() {
        let f = fixture();
        let r = reconciler(&f);
        f.cache.record_activity(1).await;
        f.cache.record_activity(2).await;

        let first = r.bulk_sync().await;
        let second = r.bulk_sync().await;

        assert_eq!(first.synced, 2);
        assert_eq!((second.synced, second.skipped), (0, 2));
        assert_eq!(r.stats().await.runs, 2);
    }

    #[tokio::test]
    async fn test_bulk_sync_reports_listing_failure() {
        let f = fixture();
        let r = reconciler(&f);
        f.backend.down.store(true, std::sync::atomic::Ordering::SeqCst);

        let report = r.bulk_sync().await;
        assert_eq!(report.items.len(), 0);
        assert_eq!(report.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_sync_durable_failure_is_counted() {
        let f = fixture();
        let r = reconciler(&f);
        f.cache.record_activity(1).await;
        f.store.set_available(false);

        let report = r.bulk_sync().await;
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_disabled_sync_writes_nothing() {
        let f = fixture();
        let r = reconciler(&f);
        f.cache.record_activity(1).await;
        r.disable();
        assert!(!r.is_enabled());

        let report = r.force_sync(1).await.unwrap();
        assert_eq!(
            report.items[0].outcome,
            SyncOutcome::Skipped {
                reason: SkipReason::SyncDisabled,
                connectivity: Some(Connectivity::Online),
                last_seen: Some(f.clock.now()),
            }
        );
        assert_eq!(durable(&f, 1).await.connectivity, Connectivity::Offline);

        r.enable();
        assert_eq!(r.force_sync(1).await.unwrap().synced, 1);
    }

    #[tokio::test]
    async fn test_cache_tier_off_uses_durable_last_seen() {
        let f = fixture();
        let cache = Arc::new(StatusCache::new(
            None,
            f.store.clone(),
            f.clock.clone(),
            CacheSettings::default(),
        ));
        let r = StatusReconciler::new(cache.clone(), f.store.clone(), true);
        cache.record_activity(1).await;

        let report = r.force_sync(1).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(durable(&f, 1).await.connectivity, Connectivity::Online);
        assert_eq!(r.bulk_sync().await.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_periodic_loop_runs_and_stops() {
        let f = fixture();
        let r = Arc::new(reconciler(&f));
        f.cache.record_activity(1).await;
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(r.clone().run_periodic(Duration::from_millis(10), rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(r.stats().await.runs >= 1);
        assert_eq!(durable(&f, 1).await.connectivity, Connectivity::Online);
    }
}
