//! Repository layer for inventory, jobs, and results.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;

use ncf_core::device::DeviceFacts;
use ncf_core::progress::JobState;
use ncf_core::store::{JobStore, NewResult, StoreError};
use ncf_core::Platform;

use crate::error::{DbError, Result};
use crate::models::{CredentialSetRow, DeviceRow, JobRow, NewDevice, ResultRow, SiteRow};
use crate::pool::DbPool;

/// Inventory/job repository over the shared pool.
#[derive(Clone)]
pub struct Repo {
    pool: DbPool,
}

impl Repo {
    /// Create a new repository
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    // ── Inventory ─────────────────────────────────────────────────────────

    /// Insert a site.
    pub async fn create_site(&self, code: &str, name: &str, repo_name: &str) -> Result<SiteRow> {
        let now = Utc::now();
        let site = sqlx::query_as::<_, SiteRow>(
            "INSERT INTO sites (code, name, repo_name, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(code)
        .bind(name)
        .bind(repo_name)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool.inner())
        .await?;
        Ok(site)
    }

    /// Insert a credential set; `sealed_password` must already be sealed.
    pub async fn create_credential_set(
        &self,
        label: &str,
        username: &str,
        sealed_password: &str,
    ) -> Result<CredentialSetRow> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, CredentialSetRow>(
            "INSERT INTO credential_sets (label, username, sealed_password, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(label)
        .bind(username)
        .bind(sealed_password)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool.inner())
        .await?;
        Ok(row)
    }

    /// Insert a device.
    pub async fn create_device(&self, device: NewDevice) -> Result<DeviceRow> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, DeviceRow>(
            "INSERT INTO devices
               (hostname, address, platform, site_id, credential_id, enabled, tls_verify,
                created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(&device.hostname)
        .bind(&device.address)
        .bind(&device.platform)
        .bind(device.site_id)
        .bind(device.credential_id)
        .bind(device.enabled)
        .bind(device.tls_verify)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool.inner())
        .await?;
        Ok(row)
    }

    /// Get a device by id.
    pub async fn get_device(&self, device_id: i64) -> Result<Option<DeviceRow>> {
        let row = sqlx::query_as::<_, DeviceRow>("SELECT * FROM devices WHERE id = ?")
            .bind(device_id)
            .fetch_optional(self.pool.inner())
            .await?;
        Ok(row)
    }

    /// Get a device's site.
    pub async fn get_site(&self, site_id: i64) -> Result<Option<SiteRow>> {
        let row = sqlx::query_as::<_, SiteRow>("SELECT * FROM sites WHERE id = ?")
            .bind(site_id)
            .fetch_optional(self.pool.inner())
            .await?;
        Ok(row)
    }

    /// Enabled devices, optionally restricted to a site.
    pub async fn list_enabled_devices(&self, site_id: Option<i64>) -> Result<Vec<DeviceRow>> {
        let rows = match site_id {
            Some(site_id) => {
                sqlx::query_as::<_, DeviceRow>(
                    "SELECT * FROM devices WHERE enabled = 1 AND site_id = ? ORDER BY id",
                )
                .bind(site_id)
                .fetch_all(self.pool.inner())
                .await?
            }
            None => {
                sqlx::query_as::<_, DeviceRow>(
                    "SELECT * FROM devices WHERE enabled = 1 ORDER BY id",
                )
                .fetch_all(self.pool.inner())
                .await?
            }
        };
        Ok(rows)
    }

    // ── Jobs ──────────────────────────────────────────────────────────────

    /// Create a job in `running` state with zeroed counters.
    pub async fn create_job(&self, triggered_by: &str, total: i64) -> Result<JobRow> {
        let job = sqlx::query_as::<_, JobRow>(
            "INSERT INTO backup_jobs (triggered_at, triggered_by, state, total, completed, failed)
             VALUES (?, ?, 'running', ?, 0, 0) RETURNING *",
        )
        .bind(Utc::now())
        .bind(triggered_by)
        .bind(total)
        .fetch_one(self.pool.inner())
        .await?;
        Ok(job)
    }

    /// Get a job by id.
    pub async fn get_job(&self, job_id: i64) -> Result<Option<JobRow>> {
        let job = sqlx::query_as::<_, JobRow>("SELECT * FROM backup_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(self.pool.inner())
            .await?;
        Ok(job)
    }

    /// Most recent jobs first.
    pub async fn list_jobs(&self, limit: i64) -> Result<Vec<JobRow>> {
        let jobs = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM backup_jobs ORDER BY triggered_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool.inner())
        .await?;
        Ok(jobs)
    }

    /// Jobs still marked running.
    pub async fn running_job_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM backup_jobs WHERE state = 'running'")
            .fetch_one(self.pool.inner())
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    /// Mark every `running` job failed. Run at boot: anything still running
    /// was orphaned by a restart.
    pub async fn orphan_running_jobs(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE backup_jobs SET state = 'failed', completed_at = ? WHERE state = 'running'",
        )
        .bind(Utc::now())
        .execute(self.pool.inner())
        .await?;
        Ok(result.rows_affected())
    }

    // ── Results ───────────────────────────────────────────────────────────

    /// Results for one job, oldest first.
    pub async fn job_results(&self, job_id: i64) -> Result<Vec<ResultRow>> {
        let rows = sqlx::query_as::<_, ResultRow>(
            "SELECT * FROM backup_results WHERE job_id = ? ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(self.pool.inner())
        .await?;
        Ok(rows)
    }

    /// A device's most recent results, newest first.
    pub async fn device_history(&self, device_id: i64, limit: i64) -> Result<Vec<ResultRow>> {
        let rows = sqlx::query_as::<_, ResultRow>(
            "SELECT * FROM backup_results WHERE device_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(self.pool.inner())
        .await?;
        Ok(rows)
    }

    /// Get a result by id.
    pub async fn get_result(&self, result_id: i64) -> Result<Option<ResultRow>> {
        let row = sqlx::query_as::<_, ResultRow>("SELECT * FROM backup_results WHERE id = ?")
            .bind(result_id)
            .fetch_optional(self.pool.inner())
            .await?;
        Ok(row)
    }
}

#[derive(sqlx::FromRow)]
struct FactsRow {
    device_id: i64,
    hostname: String,
    address: String,
    platform: String,
    site_code: String,
    repo_name: String,
    cred_username: Option<String>,
    sealed_password: Option<String>,
    tls_verify: Option<bool>,
}

impl FactsRow {
    fn into_facts(self) -> std::result::Result<DeviceFacts, DbError> {
        let platform = Platform::parse(&self.platform)
            .ok_or_else(|| DbError::InvalidRow(format!("platform {}", self.platform)))?;
        Ok(DeviceFacts {
            device_id: self.device_id,
            hostname: self.hostname,
            address: self.address,
            platform,
            site_code: self.site_code,
            repo_name: self.repo_name,
            cred_username: self.cred_username,
            sealed_password: self.sealed_password,
            tls_verify: self.tls_verify,
        })
    }
}

#[async_trait]
impl JobStore for Repo {
    async fn load_device_facts(
        &self,
        device_ids: &[i64],
    ) -> std::result::Result<Vec<DeviceFacts>, StoreError> {
        if device_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; device_ids.len()].join(",");
        let query = format!(
            "SELECT d.id AS device_id, d.hostname, d.address, d.platform,
                    s.code AS site_code, s.repo_name,
                    c.username AS cred_username, c.sealed_password, d.tls_verify
             FROM devices d
             JOIN sites s ON s.id = d.site_id
             LEFT JOIN credential_sets c ON c.id = d.credential_id
             WHERE d.id IN ({placeholders})
             ORDER BY d.id"
        );
        let mut q = sqlx::query_as::<_, FactsRow>(&query);
        for id in device_ids {
            q = q.bind(id);
        }
        let rows = q
            .fetch_all(self.pool.inner())
            .await
            .map_err(|e| StoreError(e.to_string()))?;
        rows.into_iter()
            .map(|r| r.into_facts().map_err(|e| StoreError(e.to_string())))
            .collect()
    }

    async fn mark_job_started(&self, job_id: i64) -> std::result::Result<(), StoreError> {
        sqlx::query("UPDATE backup_jobs SET started_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(job_id)
            .execute(self.pool.inner())
            .await
            .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }

    async fn job_total(&self, job_id: i64) -> std::result::Result<i64, StoreError> {
        let row = sqlx::query("SELECT total FROM backup_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(self.pool.inner())
            .await
            .map_err(|e| StoreError(e.to_string()))?
            .ok_or_else(|| StoreError(format!("job {job_id} not found")))?;
        Ok(row.get::<i64, _>("total"))
    }

    async fn insert_result(&self, result: NewResult) -> std::result::Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO backup_results
               (job_id, device_id, state, content_hash, commit_id, error, duration_ms, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(result.job_id)
        .bind(result.device_id)
        .bind(result.state.as_str())
        .bind(&result.content_hash)
        .bind(&result.commit_id)
        .bind(&result.error)
        .bind(result.duration_ms)
        .bind(Utc::now())
        .execute(self.pool.inner())
        .await
        .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }

    async fn add_completed(&self, job_id: i64) -> std::result::Result<(), StoreError> {
        sqlx::query("UPDATE backup_jobs SET completed = completed + 1 WHERE id = ?")
            .bind(job_id)
            .execute(self.pool.inner())
            .await
            .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }

    async fn add_failed(&self, job_id: i64) -> std::result::Result<(), StoreError> {
        sqlx::query("UPDATE backup_jobs SET failed = failed + 1 WHERE id = ?")
            .bind(job_id)
            .execute(self.pool.inner())
            .await
            .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }

    async fn latest_success(
        &self,
        device_id: i64,
    ) -> std::result::Result<Option<(String, String)>, StoreError> {
        let row = sqlx::query(
            "SELECT content_hash, commit_id FROM backup_results
             WHERE device_id = ? AND state = 'success'
             ORDER BY id DESC LIMIT 1",
        )
        .bind(device_id)
        .fetch_optional(self.pool.inner())
        .await
        .map_err(|e| StoreError(e.to_string()))?;
        Ok(row.map(|r| {
            (
                r.get::<Option<String>, _>("content_hash").unwrap_or_default(),
                r.get::<Option<String>, _>("commit_id").unwrap_or_default(),
            )
        }))
    }

    async fn finalize_job(
        &self,
        job_id: i64,
        state: JobState,
    ) -> std::result::Result<(), StoreError> {
        sqlx::query("UPDATE backup_jobs SET state = ?, completed_at = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(Utc::now())
            .bind(job_id)
            .execute(self.pool.inner())
            .await
            .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }
}
