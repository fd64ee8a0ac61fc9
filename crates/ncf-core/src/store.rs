//! Persistence seam for the orchestrator.

use async_trait::async_trait;
use thiserror::Error;

use crate::device::DeviceFacts;
use crate::progress::JobState;

/// Store-level failure, opaque to the engine beyond its message.
#[derive(Error, Debug)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

/// Result state for one device within one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultState {
    Success,
    Failed,
    Skipped,
}

impl ResultState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// A result row to append. One per `(job, device)`, created exactly once.
#[derive(Debug, Clone)]
pub struct NewResult {
    pub job_id: i64,
    pub device_id: i64,
    pub state: ResultState,
    pub content_hash: String,
    pub commit_id: Option<String>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

/// The narrow persistence interface the engine mutates jobs through.
///
/// `ncf-db` implements it over SQLite; scenario tests implement it in
/// memory. Counter methods are additive so concurrent engines on the same
/// database stay correct, though a single engine serializes all writes
/// through one consumer anyway.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Load flat device facts (device + site + credential) for the ids.
    async fn load_device_facts(&self, device_ids: &[i64])
        -> Result<Vec<DeviceFacts>, StoreError>;

    /// Stamp `started_at` on the job.
    async fn mark_job_started(&self, job_id: i64) -> Result<(), StoreError>;

    /// Total device count recorded at job creation.
    async fn job_total(&self, job_id: i64) -> Result<i64, StoreError>;

    /// Append one result row.
    async fn insert_result(&self, result: NewResult) -> Result<(), StoreError>;

    /// `completed = completed + 1`.
    async fn add_completed(&self, job_id: i64) -> Result<(), StoreError>;

    /// `failed = failed + 1`.
    async fn add_failed(&self, job_id: i64) -> Result<(), StoreError>;

    /// Content hash and commit id of the device's most recent successful
    /// result, if any.
    async fn latest_success(
        &self,
        device_id: i64,
    ) -> Result<Option<(String, String)>, StoreError>;

    /// Move the job to a terminal state and stamp `completed_at`.
    async fn finalize_job(&self, job_id: i64, state: JobState) -> Result<(), StoreError>;
}
