//! Credential sealing for the ncf inventory.
//!
//! Device passwords are stored sealed with a process-wide Fernet key supplied
//! at boot. This crate owns the envelope; resolution order lives in
//! `ncf-core`.

pub mod error;
pub mod seal;

pub use error::SealError;
pub use seal::Sealer;
