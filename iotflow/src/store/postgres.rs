use crate::errors::StorageError;
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{
    AggregateFn, AggregateQuery, Bucket, Connectivity, Device, DeviceId, DeviceStatus,
    MeasurementRow,
};
use crate::store::{DeviceStore, MeasurementStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

const MAX_INSERT_ATTEMPTS: u32 = 5;

/// Postgres-backed device and measurement store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    op_timeout: Duration,
}

impl PgStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        op_timeout: Duration,
    ) -> Result<Self, StorageError> {
        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(op_timeout)
            .connect(database_url)
            .await?;

        info!("Database connection established");
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Migrations completed");

        Ok(Self::from_pool(pool, op_timeout))
    }

    pub fn from_pool(pool: PgPool, op_timeout: Duration) -> Self {
        Self { pool, op_timeout }
    }

    /// Bound a single round-trip by the store timeout.
    async fn timed<T, F>(&self, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(|e| {
                DB_FAILURES_TOTAL.inc();
                StorageError::from(e)
            }),
            Err(_) => {
                DB_FAILURES_TOTAL.inc();
                Err(StorageError::Timeout)
            }
        }
    }

    async fn insert_rows_inner(&self, rows: &[MeasurementRow]) -> Result<(), sqlx::Error> {
        let device_ids: Vec<i64> = rows.iter().map(|r| r.device_id).collect();
        let timestamps: Vec<DateTime<Utc>> = rows.iter().map(|r| r.timestamp).collect();
        let names: Vec<&str> = rows.iter().map(|r| r.measurement_name.as_str()).collect();
        let values: Vec<f64> = rows.iter().map(|r| r.numeric_value).collect();

        let query = r#"
            INSERT INTO measurements (device_id, ts, measurement_name, numeric_value)
            SELECT * FROM UNNEST($1::int8[], $2::timestamptz[], $3::text[], $4::float8[])
            ON CONFLICT (device_id, ts, measurement_name) DO NOTHING
            "#;

        sqlx::query(query)
            .bind(&device_ids)
            .bind(&timestamps)
            .bind(&names)
            .bind(&values)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: i64,
    owner_id: i64,
    status: String,
    connectivity: String,
    last_seen: Option<DateTime<Utc>>,
}

impl TryFrom<DeviceRow> for Device {
    type Error = StorageError;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        let corrupt = |e: String| StorageError::Unavailable(format!("device {}: {}", row.id, e));
        Ok(Device {
            id: row.id,
            owner_id: row.owner_id,
            status: row.status.parse::<DeviceStatus>().map_err(corrupt)?,
            connectivity: row.connectivity.parse::<Connectivity>().map_err(corrupt)?,
            last_seen: row.last_seen,
        })
    }
}

const DEVICE_COLUMNS: &str = "id, owner_id, status, connectivity, last_seen";

#[async_trait]
impl DeviceStore for PgStore {
    async fn find_by_credential_hash(&self, hash: &str) -> Result<Option<Device>, StorageError> {
        let query = format!("SELECT {} FROM devices WHERE credential_hash = $1", DEVICE_COLUMNS);
        let row = self
            .timed(
                sqlx::query_as::<_, DeviceRow>(&query)
                    .bind(hash)
                    .fetch_optional(&self.pool),
            )
            .await?;
        row.map(Device::try_from).transpose()
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>, StorageError> {
        let query = format!("SELECT {} FROM devices WHERE id = $1", DEVICE_COLUMNS);
        let row = self
            .timed(
                sqlx::query_as::<_, DeviceRow>(&query)
                    .bind(id)
                    .fetch_optional(&self.pool),
            )
            .await?;
        row.map(Device::try_from).transpose()
    }

    async fn touch_last_seen(&self, id: DeviceId, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let result = self
            .timed(
                sqlx::query(
                    "UPDATE devices
                     SET last_seen = GREATEST(COALESCE(last_seen, $2), $2), updated_at = NOW()
                     WHERE id = $1",
                )
                .bind(id)
                .bind(at)
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn write_liveness(
        &self,
        id: DeviceId,
        connectivity: Connectivity,
        last_seen: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = self
            .timed(
                sqlx::query(
                    "UPDATE devices
                     SET connectivity = $2,
                         last_seen = GREATEST(COALESCE(last_seen, $3), $3),
                         updated_at = NOW()
                     WHERE id = $1",
                )
                .bind(id)
                .bind(connectivity.as_str())
                .bind(last_seen)
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.timed(sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl MeasurementStore for PgStore {
    async fn insert_rows(&self, rows: &[MeasurementRow]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut attempts = 0;

        loop {
            attempts += 1;
            let outcome = tokio::time::timeout(self.op_timeout, self.insert_rows_inner(rows)).await;
            let err = match outcome {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e,
                Err(_) => {
                    DB_FAILURES_TOTAL.inc();
                    error!("Measurement insert timed out after {:?}", self.op_timeout);
                    return Err(StorageError::Timeout);
                }
            };

            DB_FAILURES_TOTAL.inc();
            if attempts >= MAX_INSERT_ATTEMPTS || !is_transient_error(&err) {
                error!(
                    "Measurement insert failed permanently after {} attempts: {}",
                    attempts, err
                );
                return Err(err.into());
            }

            let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
            warn!(
                "Measurement insert failed (attempt {}/{}), retrying in {}ms: {}",
                attempts, MAX_INSERT_ATTEMPTS, wait_ms, err
            );
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        }
    }

    async fn range(
        &self,
        device_id: DeviceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MeasurementRow>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.timed(
            sqlx::query_as::<_, MeasurementRow>(
                "SELECT device_id, ts AS timestamp, measurement_name, numeric_value
                 FROM measurements
                 WHERE device_id = $1 AND ts >= $2 AND ts < $3
                 ORDER BY ts DESC, measurement_name
                 LIMIT $4",
            )
            .bind(device_id)
            .bind(start)
            .bind(end)
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .await
    }

    async fn latest(&self, device_id: DeviceId) -> Result<Vec<MeasurementRow>, StorageError> {
        self.timed(
            sqlx::query_as::<_, MeasurementRow>(
                "SELECT device_id, ts AS timestamp, measurement_name, numeric_value
                 FROM measurements
                 WHERE device_id = $1
                   AND ts = (SELECT MAX(ts) FROM measurements WHERE device_id = $1)
                 ORDER BY measurement_name",
            )
            .bind(device_id)
            .fetch_all(&self.pool),
        )
        .await
    }

    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<Bucket>, StorageError> {
        let sql = format!(
            "SELECT to_timestamp(floor(extract(epoch FROM ts)::float8 / $5::float8) * $5::float8)
                        AS bucket_start,
                    {} AS value,
                    COUNT(*) AS count
             FROM measurements
             WHERE device_id = $1 AND measurement_name = $2 AND ts >= $3 AND ts < $4
             GROUP BY 1
             ORDER BY 1",
            aggregate_expr(query.function)
        );

        self.timed(
            sqlx::query_as::<_, Bucket>(&sql)
                .bind(query.device_id)
                .bind(&query.measurement)
                .bind(query.start)
                .bind(query.end)
                .bind(query.window_secs as f64)
                .fetch_all(&self.pool),
        )
        .await
    }

    async fn delete_range(
        &self,
        device_id: DeviceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let result = self
            .timed(
                sqlx::query("DELETE FROM measurements WHERE device_id = $1 AND ts >= $2 AND ts < $3")
                    .bind(device_id)
                    .bind(start)
                    .bind(end)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected())
    }
}

fn aggregate_expr(function: AggregateFn) -> &'static str {
    match function {
        AggregateFn::Avg => "AVG(numeric_value)",
        AggregateFn::Sum => "SUM(numeric_value)",
        AggregateFn::Min => "MIN(numeric_value)",
        AggregateFn::Max => "MAX(numeric_value)",
        AggregateFn::Count => "COUNT(*)::float8",
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
