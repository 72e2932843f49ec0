use gits_core::ErrorClass;
use thiserror::Error;

use crate::timespec::TimeError;
use crate::types::JobStatus;

/// Errors that can occur within the scheduling subsystem.
///
/// Display strings are single-line and stable; clients match on them.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The requested fire time was malformed or not in the future.
    #[error(transparent)]
    Time(#[from] TimeError),

    /// A request field other than the time failed validation.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The owner has never scheduled a job (or all were cancelled).
    #[error("No scheduled jobs found for this user")]
    NoJobs { owner: String },

    /// The job already left `pending`; the requested transition was not applied.
    #[error("Job {id} is already {status}")]
    AlreadyTerminal { id: String, status: JobStatus },

    /// A fire delivery holds the job's claim and may be running git right now.
    #[error("Job {id} is running")]
    JobInProgress { id: String },

    /// The job store could not be reached or failed mid-operation.
    #[error("Job store unavailable: {0}")]
    StoreUnavailable(String),

    /// The rule still has targets; they must be removed first.
    #[error("Rule {rule} still has targets attached")]
    TargetsStillAttached { rule: String },

    /// The trigger registry has no rule with this name.
    #[error("Rule not found: {rule}")]
    RuleNotFound { rule: String },

    /// The trigger registry could not be reached or failed mid-operation.
    #[error("Trigger registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// The job row was written but its trigger was not. The row stays
    /// `pending` without a trigger until the caller cancels or resubmits.
    #[error("Job {id} was stored but its trigger could not be registered: {reason}")]
    DanglingJob { id: String, reason: String },

    /// The content store rejected or timed out on an upload.
    #[error("Content upload failed: {0}")]
    Upload(String),

    /// A fire event could not be decoded.
    #[error("Invalid fire event: {0}")]
    InvalidEnvelope(String),
}

impl SchedulerError {
    /// Short error code string sent to clients in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Time(TimeError::InvalidFormat { .. }) => "INVALID_FORMAT",
            SchedulerError::Time(TimeError::NotInFuture { .. }) => "NOT_IN_FUTURE",
            SchedulerError::InvalidRequest(_) => "INVALID_REQUEST",
            SchedulerError::JobNotFound { .. } | SchedulerError::NoJobs { .. } => "JOB_NOT_FOUND",
            SchedulerError::AlreadyTerminal { .. } => "ALREADY_TERMINAL",
            SchedulerError::JobInProgress { .. } => "JOB_IN_PROGRESS",
            SchedulerError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            SchedulerError::TargetsStillAttached { .. } => "TARGETS_STILL_ATTACHED",
            SchedulerError::RuleNotFound { .. } => "RULE_NOT_FOUND",
            SchedulerError::RegistryUnavailable(_) => "REGISTRY_UNAVAILABLE",
            SchedulerError::DanglingJob { .. } => "DANGLING_JOB",
            SchedulerError::Upload(_) => "UPLOAD_FAILED",
            SchedulerError::InvalidEnvelope(_) => "INVALID_ENVELOPE",
        }
    }

    /// Malformed request fields are usage errors; everything else, including
    /// a time in the past, is a runtime failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            SchedulerError::InvalidRequest(_) | SchedulerError::InvalidEnvelope(_) => {
                ErrorClass::Usage
            }
            _ => ErrorClass::Runtime,
        }
    }
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        SchedulerError::StoreUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
