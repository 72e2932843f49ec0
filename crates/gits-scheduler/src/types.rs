use gits_core::{JobId, OwnerId};
use serde::{Deserialize, Serialize};

use crate::timespec::TriggerExpression;

/// The git action a job runs when its trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobAction {
    Push {
        #[serde(default)]
        force: bool,
    },
    Commit {
        message: String,
    },
    /// Pathspecs are kept in the order the user gave them.
    Add {
        pathspecs: Vec<String>,
    },
}

impl JobAction {
    pub fn kind(&self) -> &'static str {
        match self {
            JobAction::Push { .. } => "push",
            JobAction::Commit { .. } => "commit",
            JobAction::Add { .. } => "add",
        }
    }

    pub fn commit_message(&self) -> Option<&str> {
        match self {
            JobAction::Commit { message } => Some(message),
            _ => None,
        }
    }

    /// Reject actions git would refuse anyway, before anything is written.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            JobAction::Push { .. } => Ok(()),
            JobAction::Commit { message } if message.trim().is_empty() => {
                Err("commit message must not be empty".to_string())
            }
            JobAction::Commit { .. } => Ok(()),
            JobAction::Add { pathspecs } if pathspecs.is_empty() => {
                Err("add requires at least one pathspec".to_string())
            }
            JobAction::Add { pathspecs } if pathspecs.iter().any(|p| p.trim().is_empty()) => {
                Err("pathspecs must not be empty strings".to_string())
            }
            JobAction::Add { .. } => Ok(()),
        }
    }
}

/// Lifecycle state of a job. `Pending` is initial, the rest are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its trigger to fire.
    Pending,
    /// The git collaborator reported success.
    Succeeded,
    /// The git collaborator reported failure or could not be run.
    Failed,
    /// Explicitly cancelled before firing.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Result of a fired job, written back by `mark_terminal`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed { error: String },
}

impl Outcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Outcome::Succeeded => JobStatus::Succeeded,
            Outcome::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Outcome::Succeeded => None,
            Outcome::Failed { error } => Some(error),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Globally unique; also the trigger rule name.
    pub job_id: JobId,
    /// Partition key.
    pub owner: OwnerId,
    /// Microseconds since epoch, strictly increasing per owner.
    pub created_at: i64,
    /// Canonical UTC fire minute, e.g. `2025-07-17T15:00Z`.
    pub schedule_time: String,
    pub action: JobAction,
    pub status: JobStatus,
    /// Reference to uploaded change content, if the request carried any.
    pub payload_ref: Option<String>,
    pub repo_url: String,
    /// Name of the credential secret; never the credential itself.
    pub credential_ref: Option<String>,
    /// Captured failure text for `failed` jobs.
    pub error: Option<String>,
    /// RFC 3339 time of the last write.
    pub updated_at: String,
}

impl Job {
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.job_id.clone(),
            schedule_time: self.schedule_time.clone(),
            status: self.status,
        }
    }
}

/// Input to `JobStore::create`. `job_id` and `created_at` are assigned by the
/// store when absent.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: Option<JobId>,
    pub created_at: Option<i64>,
    pub owner: OwnerId,
    pub schedule_time: String,
    pub action: JobAction,
    pub payload_ref: Option<String>,
    pub repo_url: String,
    pub credential_ref: Option<String>,
}

/// Change content to upload before the job row is written.
#[derive(Debug, Clone)]
pub struct ContentUpload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Everything a client supplies to schedule one action.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub owner: OwnerId,
    pub action: JobAction,
    /// Raw user input, validated by `timespec::normalize`.
    pub schedule_time: String,
    pub repo_url: String,
    pub credential_ref: Option<String>,
    pub content: Option<ContentUpload>,
}

/// Returned by a successful `schedule`.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub job_id: JobId,
    pub schedule_time: String,
    pub status: JobStatus,
    pub expression: TriggerExpression,
    pub payload_ref: Option<String>,
}

/// What `status` reports for an owner's most recent job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub schedule_time: String,
    pub status: JobStatus,
}

/// A decoded fire event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FireRequest {
    pub job_id: JobId,
    pub owner: Option<OwnerId>,
    pub action: Option<JobAction>,
    pub content_ref: Option<String>,
    pub credential_ref: Option<String>,
    pub repo_url: Option<String>,
}

/// Why a fire was discharged without running anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// No row with this id (cancelled, or never stored).
    Missing,
    /// The job had already reached a terminal status.
    AlreadyTerminal { status: JobStatus },
    /// A concurrent delivery wrote the terminal status first.
    LostRace,
    /// Another delivery holds the job's claim and is running it.
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FireOutcome {
    Succeeded,
    Failed { error: String },
    Discarded { reason: DiscardReason },
}

impl From<Outcome> for FireOutcome {
    fn from(o: Outcome) -> Self {
        match o {
            Outcome::Succeeded => FireOutcome::Succeeded,
            Outcome::Failed { error } => FireOutcome::Failed { error },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_json_shape() {
        let a = JobAction::Add {
            pathspecs: vec!["b.txt".into(), "a.txt".into()],
        };
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, r#"{"kind":"add","pathspecs":["b.txt","a.txt"]}"#);

        let push: JobAction = serde_json::from_str(r#"{"kind":"push"}"#).unwrap();
        assert_eq!(push, JobAction::Push { force: false });
    }

    #[test]
    fn action_validation() {
        assert!(JobAction::Commit { message: "  ".into() }.validate().is_err());
        assert!(JobAction::Add { pathspecs: vec![] }.validate().is_err());
        assert!(JobAction::Add { pathspecs: vec!["".into()] }.validate().is_err());
        assert!(JobAction::Commit { message: "x".into() }.validate().is_ok());
        assert!(JobAction::Push { force: true }.validate().is_ok());
    }

    #[test]
    fn status_text_round_trip() {
        for s in [
            JobStatus::Pending,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(s.to_string().parse::<JobStatus>().unwrap(), s);
        }
        assert!("running".parse::<JobStatus>().is_err());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }
}
