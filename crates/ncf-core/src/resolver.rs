//! Credential resolution.

use ncf_auth::Sealer;

use crate::device::{Credentials, DeviceFacts};
use crate::error::DeviceError;

/// Resolves `(device) -> (username, password)` ahead of any connection.
///
/// Order, first match wins:
/// 1. the device's own credential set, unsealed with the boot key;
/// 2. the process-wide fallback pair;
/// 3. `NoCredentials`.
///
/// An unseal failure is terminal for the device; it never falls through to
/// the fallback tier.
pub struct CredentialResolver {
    sealer: Sealer,
    fallback: Option<(String, String)>,
}

impl CredentialResolver {
    pub fn new(sealer: Sealer, fallback: Option<(String, String)>) -> Self {
        Self { sealer, fallback }
    }

    /// Resolve credentials for one device.
    pub fn resolve(&self, facts: &DeviceFacts) -> Result<Credentials, DeviceError> {
        if let (Some(username), Some(sealed)) = (&facts.cred_username, &facts.sealed_password) {
            let password = self
                .sealer
                .unseal(sealed)
                .map_err(|e| DeviceError::CredentialDecrypt(e.to_string()))?;
            return Ok(Credentials {
                username: username.clone(),
                password,
            });
        }
        if let Some((username, password)) = &self.fallback {
            return Ok(Credentials {
                username: username.clone(),
                password: password.clone(),
            });
        }
        Err(DeviceError::NoCredentials)
    }
}
