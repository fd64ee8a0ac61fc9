//! # ncf persistence layer
//!
//! SQLite via sqlx: the inventory tables, job and result rows, and the
//! narrow repository interface the engine and the REST façade read and
//! write through.

pub mod error;
pub mod models;
pub mod pool;
pub mod repo;

pub use error::{DbError, Result};
pub use models::{CredentialSetRow, DeviceRow, JobRow, NewDevice, ResultRow, SiteRow};
pub use pool::DbPool;
pub use repo::Repo;
