use crate::auth::hash_credential;
use crate::errors::StorageError;
use crate::model::{
    AggregateFn, AggregateQuery, Bucket, Connectivity, Device, DeviceId, DeviceStatus,
    MeasurementRow,
};
use crate::store::{DeviceStore, MeasurementStore};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

type RowKey = (DeviceId, DateTime<Utc>, String);

#[derive(Default)]
struct Inner {
    devices: HashMap<DeviceId, Device>,
    credentials: HashMap<String, DeviceId>,
    rows: BTreeMap<RowKey, f64>,
}

/// Process-local durable store. Used in tests and single-node development.
///
/// `set_available(false)` makes every call fail with
/// [`StorageError::Unavailable`], which is how store outages are simulated.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Registration happens outside the telemetry core; this stands in for it.
    pub fn register_device(
        &self,
        id: DeviceId,
        owner_id: i64,
        credential: &str,
        status: DeviceStatus,
    ) -> Device {
        let device = Device {
            id,
            owner_id,
            status,
            connectivity: Connectivity::Offline,
            last_seen: None,
        };
        let mut inner = self.write();
        inner.credentials.insert(hash_credential(credential), id);
        inner.devices.insert(id, device.clone());
        device
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn row_count(&self) -> usize {
        self.read().rows.len()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("memory store offline".to_string()))
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn window_bounds(
    device_id: DeviceId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> std::ops::Range<RowKey> {
    (device_id, start, String::new())..(device_id, end, String::new())
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn find_by_credential_hash(&self, hash: &str) -> Result<Option<Device>, StorageError> {
        self.check()?;
        let inner = self.read();
        Ok(inner
            .credentials
            .get(hash)
            .and_then(|id| inner.devices.get(id))
            .cloned())
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>, StorageError> {
        self.check()?;
        Ok(self.read().devices.get(&id).cloned())
    }

    async fn touch_last_seen(&self, id: DeviceId, at: DateTime<Utc>) -> Result<bool, StorageError> {
        self.check()?;
        let mut inner = self.write();
        match inner.devices.get_mut(&id) {
            Some(device) => {
                if device.last_seen.map_or(true, |seen| seen < at) {
                    device.last_seen = Some(at);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn write_liveness(
        &self,
        id: DeviceId,
        connectivity: Connectivity,
        last_seen: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        self.check()?;
        let mut inner = self.write();
        match inner.devices.get_mut(&id) {
            Some(device) => {
                device.connectivity = connectivity;
                device.last_seen = device.last_seen.max(Some(last_seen));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check()
    }
}

#[async_trait]
impl MeasurementStore for MemoryStore {
    async fn insert_rows(&self, rows: &[MeasurementRow]) -> Result<(), StorageError> {
        self.check()?;
        let mut inner = self.write();
        for row in rows {
            inner
                .rows
                .entry((row.device_id, row.timestamp, row.measurement_name.clone()))
                .or_insert(row.numeric_value);
        }
        Ok(())
    }

    async fn range(
        &self,
        device_id: DeviceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MeasurementRow>, StorageError> {
        self.check()?;
        if start >= end {
            return Ok(Vec::new());
        }

        let inner = self.read();
        let mut rows: Vec<MeasurementRow> = inner
            .rows
            .range(window_bounds(device_id, start, end))
            .map(|((id, ts, name), value)| MeasurementRow {
                device_id: *id,
                timestamp: *ts,
                measurement_name: name.clone(),
                numeric_value: *value,
            })
            .collect();
        rows.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.measurement_name.cmp(&b.measurement_name))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn latest(&self, device_id: DeviceId) -> Result<Vec<MeasurementRow>, StorageError> {
        self.check()?;
        let inner = self.read();
        let newest = inner
            .rows
            .keys()
            .filter(|(id, _, _)| *id == device_id)
            .map(|(_, ts, _)| *ts)
            .max();

        Ok(match newest {
            Some(ts) => inner
                .rows
                .iter()
                .filter(|((id, row_ts, _), _)| *id == device_id && *row_ts == ts)
                .map(|((id, row_ts, name), value)| MeasurementRow {
                    device_id: *id,
                    timestamp: *row_ts,
                    measurement_name: name.clone(),
                    numeric_value: *value,
                })
                .collect(),
            None => Vec::new(),
        })
    }

    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<Bucket>, StorageError> {
        self.check()?;
        if query.start >= query.end || query.window_secs <= 0 {
            return Ok(Vec::new());
        }

        let inner = self.read();
        let mut grouped: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
        for ((_, ts, name), value) in inner
            .rows
            .range(window_bounds(query.device_id, query.start, query.end))
        {
            if *name == query.measurement {
                let bucket = ts.timestamp().div_euclid(query.window_secs) * query.window_secs;
                grouped.entry(bucket).or_default().push(*value);
            }
        }

        Ok(grouped
            .into_iter()
            .filter_map(|(bucket, values)| {
                let bucket_start = Utc.timestamp_opt(bucket, 0).single()?;
                Some(Bucket {
                    bucket_start,
                    value: apply(query.function, &values),
                    count: values.len() as i64,
                })
            })
            .collect())
    }

    async fn delete_range(
        &self,
        device_id: DeviceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        self.check()?;
        if start >= end {
            return Ok(0);
        }

        let mut inner = self.write();
        let doomed: Vec<RowKey> = inner
            .rows
            .range(window_bounds(device_id, start, end))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            inner.rows.remove(key);
        }
        Ok(doomed.len() as u64)
    }
}

fn apply(function: AggregateFn, values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    match function {
        AggregateFn::Avg => Some(values.iter().sum::<f64>() / values.len() as f64),
        AggregateFn::Sum => Some(values.iter().sum()),
        AggregateFn::Min => values.iter().copied().reduce(f64::min),
        AggregateFn::Max => values.iter().copied().reduce(f64::max),
        AggregateFn::Count => Some(values.len() as f64),
    }
}
