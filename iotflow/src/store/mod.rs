//! Durable store ports and their adapters.
//!
//! The durable store is authoritative for measurement rows and device
//! records. Implementations must be safe under concurrent access and must
//! fail a call outright (never hang) once their own timeout elapses.

pub mod memory;
pub mod postgres;

use crate::errors::StorageError;
use crate::model::{AggregateQuery, Bucket, Connectivity, Device, DeviceId, MeasurementRow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Look up a device by the SHA-256 hex digest of its credential.
    async fn find_by_credential_hash(&self, hash: &str) -> Result<Option<Device>, StorageError>;

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>, StorageError>;

    /// Move `last_seen` forward to `at`. Returns false for an unknown device.
    async fn touch_last_seen(&self, id: DeviceId, at: DateTime<Utc>) -> Result<bool, StorageError>;

    /// Write the reconciled connectivity; `last_seen` only moves forward.
    /// Returns false for an unknown device.
    async fn write_liveness(
        &self,
        id: DeviceId,
        connectivity: Connectivity,
        last_seen: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;
}

#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Persist all rows or none of them.
    async fn insert_rows(&self, rows: &[MeasurementRow]) -> Result<(), StorageError>;

    /// Rows with `start <= timestamp < end`, newest first, at most `limit`.
    async fn range(
        &self,
        device_id: DeviceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MeasurementRow>, StorageError>;

    /// Every row sharing the device's most recent timestamp.
    async fn latest(&self, device_id: DeviceId) -> Result<Vec<MeasurementRow>, StorageError>;

    /// Buckets ordered by `bucket_start` ascending; empty buckets are omitted.
    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<Bucket>, StorageError>;

    async fn delete_range(
        &self,
        device_id: DeviceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StorageError>;
}
