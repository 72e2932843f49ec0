pub mod fire;
pub mod health;
pub mod jobs;

use axum::{http::StatusCode, Json};
use gits_scheduler::SchedulerError;
use serde_json::{json, Value};

pub type ApiError = (StatusCode, Json<Value>);

/// `{"error", "code"}` body with the status matching the error's kind.
pub fn scheduler_error(e: &SchedulerError) -> ApiError {
    let status = match e {
        SchedulerError::Time(_)
        | SchedulerError::InvalidRequest(_)
        | SchedulerError::InvalidEnvelope(_) => StatusCode::BAD_REQUEST,
        SchedulerError::JobNotFound { .. } | SchedulerError::NoJobs { .. } => StatusCode::NOT_FOUND,
        SchedulerError::AlreadyTerminal { .. } | SchedulerError::JobInProgress { .. } => {
            StatusCode::CONFLICT
        }
        SchedulerError::DanglingJob { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        SchedulerError::StoreUnavailable(_)
        | SchedulerError::RegistryUnavailable(_)
        | SchedulerError::TargetsStillAttached { .. }
        | SchedulerError::RuleNotFound { .. }
        | SchedulerError::Upload(_) => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({"error": e.to_string(), "code": e.code()})))
}

pub fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message.into(), "code": "INVALID_REQUEST"})),
    )
}
