//! REST handlers for the backups surface.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use ncf_core::progress::{JobState, ProgressEvent};
use ncf_core::CancelToken;
use ncf_db::{JobRow, ResultRow};

use crate::error::ApiError;
use crate::state::AppState;

/// Jobs shown by the list endpoint.
const JOB_LIST_LIMIT: i64 = 100;

/// Results shown by the device-history endpoint.
const HISTORY_LIMIT: i64 = 5;

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub site_id: Option<i64>,
    pub device_ids: Option<Vec<i64>>,
    pub triggered_by: Option<String>,
}

#[derive(Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: JobRow,
    pub results: Vec<ResultRow>,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "service": "ncf" }))
}

/// `POST /api/backups/jobs`: start a job over the selected devices.
pub async fn create_job(
    State(state): State<AppState>,
    Json(body): Json<CreateJobRequest>,
) -> Result<Response, ApiError> {
    let devices = state.repo.list_enabled_devices(body.site_id).await?;
    let device_ids: Vec<i64> = match &body.device_ids {
        Some(filter) if !filter.is_empty() => devices
            .iter()
            .map(|d| d.id)
            .filter(|id| filter.contains(id))
            .collect(),
        _ => devices.iter().map(|d| d.id).collect(),
    };
    if device_ids.is_empty() {
        return Err(ApiError::BadRequest("no devices to back up".to_string()));
    }

    let running = state.repo.running_job_count().await?;
    if running >= state.settings.max_concurrent_jobs as i64 {
        return Err(ApiError::Conflict(format!(
            "{running} jobs already running (limit {})",
            state.settings.max_concurrent_jobs
        )));
    }

    let triggered_by = body.triggered_by.as_deref().unwrap_or("api");
    let job = state
        .repo
        .create_job(triggered_by, device_ids.len() as i64)
        .await?;
    info!(job_id = job.id, devices = device_ids.len(), triggered_by, "backup job created");

    // Seed the bus so subscribers arriving before the engine's first event
    // still get a snapshot.
    state.bus.publish(ProgressEvent {
        job_id: job.id,
        total: job.total,
        completed: 0,
        failed: 0,
        state: JobState::Running,
        last_device: None,
        last_status: None,
    });

    let cancel = CancelToken::new();
    state
        .running
        .lock()
        .expect("running-jobs lock")
        .insert(job.id, cancel.clone());

    let engine = state.engine.clone();
    let registry = state.running.clone();
    let job_id = job.id;
    tokio::spawn(async move {
        // Fatal errors are already reflected in the job row and on the bus.
        let _ = engine.run_job(job_id, device_ids, cancel).await;
        registry.lock().expect("running-jobs lock").remove(&job_id);
    });

    Ok((StatusCode::CREATED, Json(json!({ "job_id": job.id }))).into_response())
}

/// `GET /api/backups/jobs`
pub async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<JobRow>>, ApiError> {
    Ok(Json(state.repo.list_jobs(JOB_LIST_LIMIT).await?))
}

/// `GET /api/backups/jobs/{id}`: detail plus per-device results.
///
/// A fatally-failed job surfaces as 500 with the job body attached.
pub async fn job_detail(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> Result<Response, ApiError> {
    let job = state
        .repo
        .get_job(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id} not found")))?;
    let results = state.repo.job_results(job_id).await?;
    let status = if job.state == "failed" {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    Ok((status, Json(JobDetail { job, results })).into_response())
}

/// `GET /api/backups/device/{id}/history`: last results for a device.
pub async fn device_history(
    State(state): State<AppState>,
    Path(device_id): Path<i64>,
) -> Result<Json<Vec<ResultRow>>, ApiError> {
    state
        .repo
        .get_device(device_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("device {device_id} not found")))?;
    Ok(Json(state.repo.device_history(device_id, HISTORY_LIMIT).await?))
}

/// `GET /api/backups/diff/{id}`: unified diff for a result's file.
pub async fn result_diff(
    State(state): State<AppState>,
    Path(result_id): Path<i64>,
) -> Result<Response, ApiError> {
    let result = state
        .repo
        .get_result(result_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("result {result_id} not found")))?;
    let device = state
        .repo
        .get_device(result.device_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("device no longer exists".to_string()))?;
    let site = state
        .repo
        .get_site(device.site_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("site no longer exists".to_string()))?;

    let diff = state
        .git
        .diff(
            &state.settings.repo_service.org,
            &site.repo_name,
            &format!("{}.txt", device.hostname),
        )
        .await?;
    match diff {
        Some(text) => Ok(([("content-type", "text/plain; charset=utf-8")], text).into_response()),
        None => Err(ApiError::Conflict(
            "only one revision exists; nothing to diff yet".to_string(),
        )),
    }
}
