//! Fernet envelope around credential passwords.

use fernet::Fernet;

use crate::error::SealError;

/// Symmetric envelope for credential passwords.
///
/// Wraps a process-global Fernet key. Sealed values round-trip through
/// `seal`/`unseal`; a value sealed under a different key fails to unseal
/// rather than silently decoding.
pub struct Sealer {
    cipher: Fernet,
}

impl Sealer {
    /// Build a sealer from a 32-byte URL-safe base64 key.
    pub fn new(key: &str) -> Result<Self, SealError> {
        let cipher = Fernet::new(key).ok_or(SealError::InvalidKey)?;
        Ok(Self { cipher })
    }

    /// Generate a fresh random key, suitable for first-boot provisioning.
    pub fn generate_key() -> String {
        Fernet::generate_key()
    }

    /// Seal a plaintext password.
    pub fn seal(&self, plaintext: &str) -> String {
        self.cipher.encrypt(plaintext.as_bytes())
    }

    /// Unseal a sealed password.
    pub fn unseal(&self, sealed: &str) -> Result<String, SealError> {
        let bytes = self.cipher.decrypt(sealed).map_err(|_| SealError::Unseal)?;
        String::from_utf8(bytes).map_err(|_| SealError::Encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_round_trips() {
        let sealer = Sealer::new(&Sealer::generate_key()).unwrap();
        let sealed = sealer.seal("sw0rdfish");
        assert_ne!(sealed, "sw0rdfish");
        assert_eq!(sealer.unseal(&sealed).unwrap(), "sw0rdfish");
    }

    #[test]
    fn sealed_values_differ_per_call() {
        // Fernet tokens embed a random IV, so equal plaintexts seal differently.
        let sealer = Sealer::new(&Sealer::generate_key()).unwrap();
        assert_ne!(sealer.seal("x"), sealer.seal("x"));
    }

    #[test]
    fn wrong_key_fails_to_unseal() {
        let a = Sealer::new(&Sealer::generate_key()).unwrap();
        let b = Sealer::new(&Sealer::generate_key()).unwrap();
        let sealed = a.seal("secret");
        assert!(matches!(b.unseal(&sealed), Err(SealError::Unseal)));
    }

    #[test]
    fn garbage_key_rejected() {
        assert!(matches!(Sealer::new("not-a-key"), Err(SealError::InvalidKey)));
    }

    #[test]
    fn corrupt_ciphertext_rejected() {
        let sealer = Sealer::new(&Sealer::generate_key()).unwrap();
        assert!(matches!(sealer.unseal("gAAAAABcorrupt"), Err(SealError::Unseal)));
    }
}
