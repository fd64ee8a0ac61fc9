//! Error taxonomy for per-device failures and the orchestrator.

use thiserror::Error;

/// Per-device failure.
///
/// Every variant becomes a failed result row; none of them aborts a job. The
/// `kind()` string is what gets persisted and shown in result listings.
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    /// Resolver found neither a device credential set nor fallback creds.
    #[error("no credentials available (device set and process fallback both missing)")]
    NoCredentials,

    /// Sealed password failed to unseal; never falls back.
    #[error("credential unseal failed: {0}")]
    CredentialDecrypt(String),

    /// The device refused the resolved credentials.
    #[error("device rejected credentials")]
    AuthRejected,

    /// TCP connect or DNS resolution failed.
    #[error("{0}")]
    Unreachable(String),

    /// Per-device deadline exceeded (or the session was cancelled mid-flight).
    #[error("{0}")]
    Timeout(String),

    /// Mid-session I/O failure.
    #[error("{0}")]
    Transport(String),

    /// Response did not match the expected shape.
    #[error("{0}")]
    Protocol(String),

    /// Normalization failed. Unreachable by construction; kept so result
    /// rows and the REST surface can name the kind.
    #[error("{0}")]
    Scrub(String),

    /// Repository-service call failed after retries.
    #[error("{0}")]
    RepositoryUnavailable(String),
}

impl DeviceError {
    /// Stable kind tag stored in result rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoCredentials => "no_credentials",
            Self::CredentialDecrypt(_) => "credential_decrypt",
            Self::AuthRejected => "auth_rejected",
            Self::Unreachable(_) => "unreachable",
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::Scrub(_) => "scrub",
            Self::RepositoryUnavailable(_) => "repository_unavailable",
        }
    }

    /// The string persisted in a failed result's `error` column.
    pub fn record(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

impl From<ncf_git::RepoError> for DeviceError {
    fn from(err: ncf_git::RepoError) -> Self {
        Self::RepositoryUnavailable(err.to_string())
    }
}

/// Orchestrator-level failure. Anything here marks the whole job failed.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Inventory or job row could not be loaded/written at a point where the
    /// job cannot meaningfully continue.
    #[error("fatal: {0}")]
    Fatal(String),
}
