//! Client endpoints: POST /schedule, POST /delete, GET /status, GET /jobs.
//!
//! Bodies are read as raw bytes and parsed here so malformed JSON gets the
//! same `{"error", "code"}` shape as every other failure.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use gits_core::{JobId, OwnerId};
use gits_scheduler::{ContentUpload, JobAction, ScheduleRequest};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{bad_request, scheduler_error, ApiError};
use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct ScheduleBody {
    pub user_id: String,
    pub action: JobAction,
    pub schedule_time: String,
    pub repo_url: String,
    #[serde(default)]
    pub credential_ref: Option<String>,
    #[serde(default)]
    pub content: Option<ContentBody>,
}

#[derive(Debug, Deserialize)]
pub struct ContentBody {
    pub filename: String,
    pub base64: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteBody {
    pub user_id: String,
    pub job_id: String,
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub user_id: Option<String>,
}

/// POST /schedule
pub async fn schedule_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body: ScheduleBody = parse_body(&body)?;

    let content = match body.content {
        Some(c) => {
            let bytes = STANDARD
                .decode(c.base64.as_bytes())
                .map_err(|e| bad_request(format!("content is not valid base64: {e}")))?;
            Some(ContentUpload {
                filename: c.filename,
                bytes,
            })
        }
        None => None,
    };

    let request = ScheduleRequest {
        owner: OwnerId::from(body.user_id),
        action: body.action,
        schedule_time: body.schedule_time,
        repo_url: body.repo_url,
        credential_ref: body.credential_ref.filter(|c| !c.is_empty()),
        content,
    };

    let job = state.scheduler.schedule(request).await.map_err(|e| {
        warn!(code = e.code(), "schedule rejected: {e}");
        scheduler_error(&e)
    })?;

    let mut out = json!({
        "job_id": job.job_id,
        "schedule_time": job.schedule_time,
        "status": job.status,
        "cron_expression": job.expression.to_string(),
    });
    if let Some(content_ref) = job.payload_ref {
        out["content_ref"] = json!(content_ref);
    }
    Ok(Json(out))
}

/// POST /delete
pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body: DeleteBody = parse_body(&body)?;
    let owner = OwnerId::from(body.user_id);
    let job_id = JobId::from(body.job_id);
    if !job_id.is_valid_rule_name() {
        return Err(bad_request(format!("invalid job_id: {:?}", job_id.as_str())));
    }

    state
        .scheduler
        .cancel(&owner, &job_id)
        .await
        .map_err(|e| scheduler_error(&e))?;

    info!(job_id = %job_id, owner = %owner, "job deleted via API");
    Ok(Json(json!({"deleted": true, "job_id": job_id})))
}

/// GET /status?user_id=…
pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<Value>, ApiError> {
    let owner = require_owner(query)?;
    let summary = state
        .scheduler
        .status(&owner)
        .await
        .map_err(|e| scheduler_error(&e))?;
    Ok(Json(json!(summary)))
}

/// GET /jobs?user_id=…
pub async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<Value>, ApiError> {
    let owner = require_owner(query)?;
    let jobs = state
        .scheduler
        .jobs(&owner)
        .await
        .map_err(|e| scheduler_error(&e))?;

    let jobs: Vec<Value> = jobs
        .into_iter()
        .map(|j| {
            json!({
                "job_id": j.job_id,
                "schedule_time": j.schedule_time,
                "status": j.status,
                "action": j.action,
                "created_at": j.created_at,
                "error": j.error,
            })
        })
        .collect();
    Ok(Json(json!({"jobs": jobs})))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid JSON body: {e}")))
}

fn require_owner(query: OwnerQuery) -> Result<OwnerId, ApiError> {
    match query.user_id {
        Some(id) if !id.trim().is_empty() => Ok(OwnerId::from(id)),
        _ => Err(bad_request("user_id query parameter is required")),
    }
}
