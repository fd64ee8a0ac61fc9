//! Sealing error types

use thiserror::Error;

/// Errors from the credential envelope.
#[derive(Error, Debug)]
pub enum SealError {
    /// The boot key is not a valid 32-byte URL-safe base64 Fernet key.
    #[error("invalid unseal key: not a 32-byte base64 Fernet key")]
    InvalidKey,

    /// Ciphertext could not be decrypted (corrupt, or sealed under another key).
    #[error("unseal failed: ciphertext invalid for the configured key")]
    Unseal,

    /// Decrypted bytes were not valid UTF-8.
    #[error("unseal failed: plaintext is not valid UTF-8")]
    Encoding,
}
