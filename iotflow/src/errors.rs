use crate::model::DeviceStatus;
use thiserror::Error;

/// Credential checks. Never retried internally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("credential missing")]
    Missing,

    #[error("credential invalid")]
    Invalid,

    #[error("device is {0}, not active")]
    Inactive(DeviceStatus),
}

/// The caller's payload or parameters are wrong; retrying unchanged will fail again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no numeric measurements in payload ({dropped} field(s) dropped)")]
    EmptyPayload { dropped: usize },

    #[error("unsupported aggregation: {0}")]
    UnsupportedAggregation(String),

    #[error("aggregation window must be between one second and 366 days")]
    InvalidWindow,

    #[error("invalid time range: start must be before end")]
    InvalidRange,

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("durable store unavailable: {0}")]
    Unavailable(String),

    #[error("durable store timed out")]
    Timeout,
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => StorageError::Timeout,
            other => StorageError::Unavailable(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StorageError::Unavailable(format!("migration failed: {}", err))
    }
}

/// Liveness cache failures. Logged and absorbed, never returned to callers of
/// ingestion or status reads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache tier disabled")]
    Disabled,

    #[error("cache operation timed out")]
    Timeout,

    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("corrupt cache entry {key}: {value}")]
    Corrupt { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is not valid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("cache TTL ({ttl_secs}s) must not be shorter than the offline threshold ({threshold_secs}s)")]
    TtlBelowThreshold { ttl_secs: u64, threshold_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("device {0} not found")]
    NotFound(i64),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Authorization error: {0}")]
    Auth(#[from] AuthError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.into())
    }
}

impl Error {
    /// Only storage failures invite a caller-side retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Storage(_) => true,

            Error::Auth(_) => false,
            Error::Validation(_) => false,
            Error::Reconcile(_) => false,
            Error::NotFound(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(Error::Storage(StorageError::Timeout).is_retryable());
        assert!(Error::Storage(StorageError::Unavailable("down".to_string())).is_retryable());
        assert!(!Error::Auth(AuthError::Invalid).is_retryable());
        assert!(!Error::Validation(ValidationError::EmptyPayload { dropped: 2 }).is_retryable());
        assert!(!Error::NotFound("device 1".to_string()).is_retryable());
    }

    #[test]
    fn test_pool_timeout_maps_to_storage_timeout() {
        let err: StorageError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err, StorageError::Timeout);

        let err: StorageError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, StorageError::Unavailable(_)));
    }

    #[test]
    fn test_inactive_message_names_status() {
        let err = AuthError::Inactive(DeviceStatus::Maintenance);
        assert_eq!(err.to_string(), "device is maintenance, not active");
    }
}
