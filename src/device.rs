// device.rs - Device identity sent with sync requests

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity block the engine includes in every `SYNC_REQUEST`.
///
/// The host peer uses this to label the session and to key its own
/// per-device bookkeeping. Persisting `device_id` across launches is the
/// host application's responsibility; `detect` generates a fresh one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
    pub device_platform: String,
}

impl DeviceInfo {
    /// Build a device identity from the local host.
    ///
    /// `device_type` distinguishes peers of the same platform, e.g.
    /// "desktop" or "mobile".
    pub fn detect(device_type: &str) -> Self {
        let device_name = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            device_id: Uuid::new_v4().to_string(),
            device_name,
            device_type: device_type.to_string(),
            device_platform: std::env::consts::OS.to_string(),
        }
    }
}
