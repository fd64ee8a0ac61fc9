//! Plain device snapshots and per-device outcomes.

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;
use crate::platform::Platform;

/// Flat snapshot of a device row with its site and credential references.
///
/// Loaded once per job and handed to workers; no live database handles
/// cross the pool boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceFacts {
    pub device_id: i64,
    pub hostname: String,
    /// Management address (IP or resolvable name).
    pub address: String,
    pub platform: Platform,
    pub site_code: String,
    pub repo_name: String,
    /// Username of the device's credential set, when one is assigned.
    pub cred_username: Option<String>,
    /// Sealed password of the device's credential set.
    pub sealed_password: Option<String>,
    /// Per-device TLS verification override; `None` defers to the boot flag.
    pub tls_verify: Option<bool>,
}

/// Resolved login material for one device.
///
/// Lives only for the duration of a single device's backup. The password
/// never appears in `Debug` output, so accidental logging stays harmless.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What a worker produced for one device.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Raw configuration text, as returned by the device.
    Config(String),
    /// Captured failure; workers never propagate.
    Failed(DeviceError),
    /// Cancelled before the worker started.
    Skipped,
}

/// One device's terminal outcome within a job.
#[derive(Debug, Clone)]
pub struct DeviceOutcome {
    pub device_id: i64,
    pub hostname: String,
    pub outcome: FetchOutcome,
    pub duration_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_reveals_the_password() {
        let creds = Credentials {
            username: "netops".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("netops"));
        assert!(rendered.contains("<redacted>"));
    }
}
