//! Database row models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Network site row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SiteRow {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub repo_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stored credential set row. The password is sealed; plaintext never
/// touches the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CredentialSetRow {
    pub id: i64,
    pub label: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub sealed_password: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Device inventory row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceRow {
    pub id: i64,
    pub hostname: String,
    pub address: String,
    pub platform: String,
    pub site_id: i64,
    pub credential_id: Option<i64>,
    pub enabled: bool,
    pub tls_verify: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a device insert.
#[derive(Debug, Clone)]
pub struct NewDevice {
    pub hostname: String,
    pub address: String,
    pub platform: String,
    pub site_id: i64,
    pub credential_id: Option<i64>,
    pub enabled: bool,
    pub tls_verify: Option<bool>,
}

/// Backup job row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRow {
    pub id: i64,
    pub triggered_at: DateTime<Utc>,
    pub triggered_by: String,
    pub state: String,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-device result row within a job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ResultRow {
    pub id: i64,
    pub job_id: i64,
    pub device_id: i64,
    pub state: String,
    pub content_hash: Option<String>,
    pub commit_id: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}
