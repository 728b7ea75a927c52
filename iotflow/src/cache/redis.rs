use crate::cache::{last_seen_key, parse_last_seen_key, CacheBackend, LAST_SEEN_PREFIX};
use crate::errors::CacheError;
use crate::model::DeviceId;
use async_trait::async_trait;
use bb8_redis::{bb8, redis, RedisConnectionManager};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::Display;
use std::time::Duration;
use tracing::info;

const SCAN_BATCH: usize = 500;
const MAX_POOL_SIZE: u32 = 16;

fn backend_err(e: impl Display) -> CacheError {
    CacheError::Backend(e.to_string())
}

fn encode(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode(key: &str, value: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| CacheError::Corrupt {
            key: key.to_string(),
            value: value.to_string(),
        })
}

/// Liveness entries stored as `device:lastseen:<id>` → RFC 3339 timestamp,
/// each with its own expiry.
#[derive(Clone)]
pub struct RedisCache {
    pool: bb8::Pool<RedisConnectionManager>,
}

impl RedisCache {
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self, CacheError> {
        info!("Connecting to Redis...");
        let manager = RedisConnectionManager::new(url).map_err(backend_err)?;
        let pool = bb8::Pool::builder()
            .max_size(MAX_POOL_SIZE)
            .connection_timeout(connect_timeout)
            .build(manager)
            .await
            .map_err(backend_err)?;
        info!("Redis connection pool ready");
        Ok(Self { pool })
    }

    async fn scan_keys(&self) -> Result<Vec<String>, CacheError> {
        let mut conn = self.pool.get().await.map_err(backend_err)?;
        let pattern = format!("{}*", LAST_SEEN_PREFIX);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut *conn)
                .await
                .map_err(backend_err)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once.
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn set_last_seen(
        &self,
        device_id: DeviceId,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await.map_err(backend_err)?;
        let _: () = redis::cmd("SET")
            .arg(last_seen_key(device_id))
            .arg(encode(at))
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut *conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn get_last_seen(&self, device_id: DeviceId) -> Result<Option<DateTime<Utc>>, CacheError> {
        let mut conn = self.pool.get().await.map_err(backend_err)?;
        let key = last_seen_key(device_id);
        let value: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut *conn)
            .await
            .map_err(backend_err)?;
        value.map(|v| decode(&key, &v)).transpose()
    }

    async fn get_many_last_seen(
        &self,
        device_ids: &[DeviceId],
    ) -> Result<Vec<Option<DateTime<Utc>>>, CacheError> {
        if device_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.pool.get().await.map_err(backend_err)?;
        let keys: Vec<String> = device_ids.iter().map(|id| last_seen_key(*id)).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut *conn)
            .await
            .map_err(backend_err)?;

        // A corrupt entry reads as absent here so one bad key cannot hide the rest.
        Ok(keys
            .iter()
            .zip(values)
            .map(|(key, value)| value.and_then(|v| decode(key, &v).ok()))
            .collect())
    }

    async fn tracked_devices(&self) -> Result<Vec<DeviceId>, CacheError> {
        let keys = self.scan_keys().await?;
        Ok(keys.iter().filter_map(|k| parse_last_seen_key(k)).collect())
    }

    async fn remove(&self, device_id: DeviceId) -> Result<bool, CacheError> {
        let mut conn = self.pool.get().await.map_err(backend_err)?;
        let removed: i64 = redis::cmd("DEL")
            .arg(last_seen_key(device_id))
            .query_async(&mut *conn)
            .await
            .map_err(backend_err)?;
        Ok(removed > 0)
    }

    async fn clear_all(&self) -> Result<usize, CacheError> {
        let keys = self.scan_keys().await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.pool.get().await.map_err(backend_err)?;
        let mut removed = 0usize;
        for chunk in keys.chunks(SCAN_BATCH) {
            let n: i64 = redis::cmd("DEL")
                .arg(chunk)
                .query_async(&mut *conn)
                .await
                .map_err(backend_err)?;
            removed += usize::try_from(n).unwrap_or(0);
        }
        info!("Cleared {} device liveness entries", removed);
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await.map_err(backend_err)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}
