//! Repository-service error types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, RepoError>;

/// Errors surfaced by the repository-service client.
///
/// Transport failures and unexpected statuses collapse into `Unavailable`;
/// the orchestrator turns that into a per-device failed result and the job
/// continues.
#[derive(Error, Debug)]
pub enum RepoError {
    /// The service could not be reached or answered outside its contract.
    #[error("repository service unavailable (status {status}): {snippet}")]
    Unavailable {
        /// HTTP status, or 0 when the request never got an answer.
        status: u16,
        /// Leading bytes of the response body, for the result row.
        snippet: String,
    },
}

impl RepoError {
    /// Wrap a transport-level failure (no HTTP status available).
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            status: 0,
            snippet: err.to_string(),
        }
    }

    /// Wrap an unexpected HTTP response.
    pub fn status(status: u16, body: &str) -> Self {
        let snippet: String = body.chars().take(200).collect();
        Self::Unavailable { status, snippet }
    }
}
