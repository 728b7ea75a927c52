use crate::cache::CacheBackend;
use crate::clock::Clock;
use crate::errors::CacheError;
use crate::model::DeviceId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const SHARDS: usize = 32;

#[derive(Debug, Clone, Copy)]
struct Entry {
    last_seen: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn live_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (self.expires_at > now).then_some(self.last_seen)
    }
}

type Shard = HashMap<DeviceId, Entry>;

/// Single-process liveness cache with the same TTL semantics as Redis.
///
/// Entries are spread over independently locked shards. Expiry is checked per
/// key on read; expired entries are only swept by the whole-cache operations.
pub struct InMemoryCache {
    shards: Vec<Mutex<Shard>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            clock,
        }
    }

    fn shard(&self, device_id: DeviceId) -> MutexGuard<'_, Shard> {
        let index = device_id.rem_euclid(SHARDS as i64) as usize;
        self.shards[index].lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Drop expired entries from every shard, one shard lock at a time.
    fn sweep(&self) -> impl Iterator<Item = MutexGuard<'_, Shard>> {
        let now = self.clock.now();
        self.shards.iter().map(move |shard| {
            let mut shard = shard.lock().unwrap_or_else(|p| p.into_inner());
            shard.retain(|_, entry| entry.expires_at > now);
            shard
        })
    }

    #[cfg(test)]
    fn stored_len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(|p| p.into_inner()).len())
            .sum()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn set_last_seen(
        &self,
        device_id: DeviceId,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| CacheError::Backend(e.to_string()))?;
        let expires_at = self.clock.now() + ttl;
        self.shard(device_id).insert(
            device_id,
            Entry {
                last_seen: at,
                expires_at,
            },
        );
        Ok(())
    }

    async fn get_last_seen(&self, device_id: DeviceId) -> Result<Option<DateTime<Utc>>, CacheError> {
        let now = self.clock.now();
        Ok(self
            .shard(device_id)
            .get(&device_id)
            .and_then(|e| e.live_at(now)))
    }

    async fn get_many_last_seen(
        &self,
        device_ids: &[DeviceId],
    ) -> Result<Vec<Option<DateTime<Utc>>>, CacheError> {
        let now = self.clock.now();
        Ok(device_ids
            .iter()
            .map(|id| self.shard(*id).get(id).and_then(|e| e.live_at(now)))
            .collect())
    }

    async fn tracked_devices(&self) -> Result<Vec<DeviceId>, CacheError> {
        let mut ids: Vec<DeviceId> = self
            .sweep()
            .flat_map(|shard| shard.keys().copied().collect::<Vec<_>>())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn remove(&self, device_id: DeviceId) -> Result<bool, CacheError> {
        let now = self.clock.now();
        Ok(self
            .shard(device_id)
            .remove(&device_id)
            .and_then(|e| e.live_at(now))
            .is_some())
    }

    async fn clear_all(&self) -> Result<usize, CacheError> {
        Ok(self
            .sweep()
            .map(|mut shard| {
                let count = shard.len();
                shard.clear();
                count
            })
            .sum())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
