//! Client for the on-net repository service.
//!
//! Each site owns one repository; each device owns one file inside it. The
//! client keeps repositories in existence idempotently, commits normalized
//! configurations through the contents API, and retrieves unified diffs
//! between the two most recent revisions of a file.

pub mod client;
pub mod error;

pub use client::RepoClient;
pub use error::RepoError;
