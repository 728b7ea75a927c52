use crate::errors::{AuthError, Error, Result};
use crate::model::{AuthenticatedDevice, DeviceStatus};
use crate::store::DeviceStore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

/// SHA-256 hex digest under which device credentials are stored.
pub fn hash_credential(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}

/// First eight characters of a credential, for log lines.
fn mask(credential: &str) -> String {
    let prefix: String = credential.chars().take(8).collect();
    format!("{}...", prefix)
}

/// Validates device credentials against the durable device record.
///
/// Read-only: authorization never mutates device state.
#[derive(Clone)]
pub struct DeviceAuthenticator {
    devices: Arc<dyn DeviceStore>,
}

impl DeviceAuthenticator {
    pub fn new(devices: Arc<dyn DeviceStore>) -> Self {
        Self { devices }
    }

    pub async fn authenticate(&self, credential: Option<&str>) -> Result<AuthenticatedDevice> {
        let credential = match credential.map(str::trim) {
            Some(c) if !c.is_empty() => c,
            _ => return Err(AuthError::Missing.into()),
        };

        let device = self
            .devices
            .find_by_credential_hash(&hash_credential(credential))
            .await
            .map_err(Error::Storage)?;

        let Some(device) = device else {
            warn!("Invalid credential attempt: {}", mask(credential));
            return Err(AuthError::Invalid.into());
        };

        if device.status != DeviceStatus::Active {
            debug!(device_id = device.id, status = %device.status, "Rejected non-active device");
            return Err(AuthError::Inactive(device.status).into());
        }

        Ok(AuthenticatedDevice {
            id: device.id,
            owner_id: device.owner_id,
            status: device.status,
        })
    }
}
