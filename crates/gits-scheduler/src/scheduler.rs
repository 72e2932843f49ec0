//! Job lifecycle: schedule, cancel, status and fire handling.
//!
//! Every operation is a short, independent call against the store and the
//! registry; nothing here keeps a timer. A job leaves `pending` at most once,
//! enforced by the store's conditional writes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gits_core::{config::DEFAULT_CALL_TIMEOUT_MS, JobId, OwnerId};
use tracing::{error, info, warn};

use crate::{
    content::{is_safe_filename, ContentStore},
    error::{Result, SchedulerError},
    executor::{ExecutionRequest, GitExecutor},
    registry::{TargetInput, TriggerRegistry, Unregistered},
    store::JobStore,
    timespec,
    types::{
        DiscardReason, FireOutcome, FireRequest, Job, JobSummary, NewJob, Outcome,
        ScheduleRequest, ScheduledJob,
    },
};

const MAX_OWNER_LEN: usize = 128;
const MAX_CREDENTIAL_REF_LEN: usize = 256;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct JobScheduler {
    store: Arc<dyn JobStore>,
    registry: Arc<dyn TriggerRegistry>,
    content: Option<Arc<dyn ContentStore>>,
    call_timeout: Duration,
    clock: Clock,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<dyn TriggerRegistry>) -> Self {
        Self {
            store,
            registry,
            content: None,
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_content(mut self, content: Arc<dyn ContentStore>) -> Self {
        self.content = Some(content);
        self
    }

    /// Upper bound for each store, registry and upload call.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Validate, upload content, write the job, then register its trigger.
    ///
    /// Validation failures have no side effects. A registry failure after the
    /// job row exists yields [`SchedulerError::DanglingJob`]; the row stays
    /// `pending` with no trigger until it is cancelled.
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<ScheduledJob> {
        let at = timespec::normalize(&request.schedule_time, (self.clock)())?;
        validate_request(&request)?;

        let payload_ref = match &request.content {
            Some(upload) => {
                let store = self.content.as_ref().ok_or_else(|| {
                    SchedulerError::InvalidRequest(
                        "change content is not accepted by this server".to_string(),
                    )
                })?;
                let content_ref = self
                    .bounded(
                        store.put(&request.owner, &upload.filename, &upload.bytes),
                        SchedulerError::Upload,
                    )
                    .await?;
                Some(content_ref)
            }
            None => None,
        };

        let new_job = NewJob {
            job_id: None,
            created_at: None,
            owner: request.owner.clone(),
            schedule_time: at.canonical.clone(),
            action: request.action,
            payload_ref: payload_ref.clone(),
            repo_url: request.repo_url,
            credential_ref: request.credential_ref,
        };
        let job = match self
            .bounded(self.store.create(new_job), SchedulerError::StoreUnavailable)
            .await
        {
            Ok(job) => job,
            Err(e) => {
                if let Some(content_ref) = &payload_ref {
                    self.discard_content(content_ref).await;
                }
                return Err(e);
            }
        };

        let input = TargetInput::for_job(&job)?;
        if let Err(e) = self
            .bounded(
                self.registry.register(job.job_id.as_str(), &at.expression, input),
                SchedulerError::RegistryUnavailable,
            )
            .await
        {
            error!(
                job_id = %job.job_id,
                owner = %job.owner,
                "trigger registration failed after job was stored; job is pending without a trigger: {e}"
            );
            return Err(SchedulerError::DanglingJob {
                id: job.job_id.to_string(),
                reason: e.to_string(),
            });
        }

        info!(
            job_id = %job.job_id,
            owner = %job.owner,
            action = job.action.kind(),
            schedule_time = %job.schedule_time,
            expression = %at.expression,
            "job scheduled"
        );

        Ok(ScheduledJob {
            job_id: job.job_id,
            schedule_time: job.schedule_time,
            status: job.status,
            expression: at.expression,
            payload_ref: job.payload_ref,
        })
    }

    /// Remove a pending job's trigger, then its row. Returns the removed job.
    ///
    /// `JobNotFound` when no such row exists for `owner`, even if a stray
    /// trigger was cleaned up on the way. `JobInProgress` while a fire is
    /// running the job; the row is kept and the run finishes normally.
    pub async fn cancel(&self, owner: &OwnerId, job_id: &JobId) -> Result<Job> {
        if !job_id.is_valid_rule_name() {
            return Err(SchedulerError::InvalidRequest(format!(
                "invalid job id: {:?}",
                job_id.as_str()
            )));
        }
        let existing = self
            .bounded(self.store.get(job_id), SchedulerError::StoreUnavailable)
            .await?;

        match &existing {
            Some(job) if &job.owner != owner => {
                return Err(SchedulerError::JobNotFound {
                    id: job_id.to_string(),
                })
            }
            Some(job) if job.status.is_terminal() => {
                return Err(SchedulerError::AlreadyTerminal {
                    id: job_id.to_string(),
                    status: job.status,
                })
            }
            Some(job) => info!(
                job_id = %job.job_id,
                owner = %job.owner,
                action = job.action.kind(),
                schedule_time = %job.schedule_time,
                "cancelling job"
            ),
            None => {}
        }

        let removed = self
            .bounded(
                self.registry.unregister(job_id.as_str()),
                SchedulerError::RegistryUnavailable,
            )
            .await?;
        if removed == Unregistered::AlreadyAbsent {
            info!(job_id = %job_id, "trigger already absent");
        }

        let deleted = self
            .bounded(
                self.store.delete_by_identity(owner, job_id),
                SchedulerError::StoreUnavailable,
            )
            .await?;
        info!(job_id = %job_id, owner = %owner, "job cancelled");
        Ok(deleted)
    }

    /// The owner's most recently created job.
    pub async fn status(&self, owner: &OwnerId) -> Result<JobSummary> {
        let job = self
            .bounded(self.store.query_latest(owner), SchedulerError::StoreUnavailable)
            .await?;
        Ok(job.summary())
    }

    /// All of the owner's jobs, most recent first.
    pub async fn jobs(&self, owner: &OwnerId) -> Result<Vec<Job>> {
        self.bounded(self.store.query_all(owner), SchedulerError::StoreUnavailable)
            .await
    }

    /// Run a fired job once and record its terminal status.
    ///
    /// Fires for missing or already-terminal jobs are discarded. The job is
    /// claimed before git runs; a delivery that finds another claim holding
    /// it, or loses the terminal write, is discarded too.
    pub async fn on_fire(
        &self,
        request: &FireRequest,
        executor: &dyn GitExecutor,
    ) -> Result<FireOutcome> {
        let job_id = &request.job_id;
        let existing = self
            .bounded(self.store.get(job_id), SchedulerError::StoreUnavailable)
            .await?;

        match existing {
            None => {
                info!(job_id = %job_id, "fire for unknown job discarded");
                self.release_trigger(job_id).await;
                return Ok(FireOutcome::Discarded {
                    reason: DiscardReason::Missing,
                });
            }
            Some(job) if request.owner.as_ref().is_some_and(|o| o != &job.owner) => {
                warn!(job_id = %job_id, "fire event owner does not match stored job; discarded");
                return Ok(FireOutcome::Discarded {
                    reason: DiscardReason::Missing,
                });
            }
            Some(job) if job.status.is_terminal() => {
                info!(job_id = %job_id, status = %job.status, "fire for finished job discarded");
                self.release_trigger(job_id).await;
                return Ok(FireOutcome::Discarded {
                    reason: DiscardReason::AlreadyTerminal { status: job.status },
                });
            }
            Some(_) => {}
        }

        // Git runs only under a claim; cancel is refused while it is held.
        let job = match self
            .bounded(self.store.claim(job_id), SchedulerError::StoreUnavailable)
            .await
        {
            Ok(job) => job,
            Err(SchedulerError::JobNotFound { .. }) => {
                info!(job_id = %job_id, "job was cancelled before it could run");
                self.release_trigger(job_id).await;
                return Ok(FireOutcome::Discarded {
                    reason: DiscardReason::Missing,
                });
            }
            Err(SchedulerError::AlreadyTerminal { status, .. }) => {
                info!(job_id = %job_id, %status, "another delivery finished this job first");
                self.release_trigger(job_id).await;
                return Ok(FireOutcome::Discarded {
                    reason: DiscardReason::LostRace,
                });
            }
            Err(SchedulerError::JobInProgress { .. }) => {
                info!(job_id = %job_id, "another delivery is running this job");
                return Ok(FireOutcome::Discarded {
                    reason: DiscardReason::InProgress,
                });
            }
            Err(e) => return Err(e),
        };

        info!(job_id = %job.job_id, owner = %job.owner, action = job.action.kind(), "executing job");
        let outcome = match executor.execute(&execution_request(&job)).await {
            Ok(report) if report.succeeded() => Outcome::Succeeded,
            Ok(report) => Outcome::Failed {
                error: format!("git exited with status {}\n{}", report.exit_code, report.output),
            },
            Err(e) => Outcome::Failed {
                error: e.to_string(),
            },
        };

        match self
            .bounded(
                self.store.mark_terminal(job_id, &outcome),
                SchedulerError::StoreUnavailable,
            )
            .await
        {
            Ok(_) => {}
            Err(SchedulerError::AlreadyTerminal { status, .. }) => {
                info!(job_id = %job_id, %status, "another delivery finished this job first");
                return Ok(FireOutcome::Discarded {
                    reason: DiscardReason::LostRace,
                });
            }
            Err(SchedulerError::JobNotFound { .. }) => {
                info!(job_id = %job_id, "job was cancelled while executing");
                return Ok(FireOutcome::Discarded {
                    reason: DiscardReason::Missing,
                });
            }
            Err(e) => {
                error!(
                    job_id = %job_id,
                    outcome = %outcome.status(),
                    "terminal status write failed; job stays pending: {e}"
                );
                return Err(e);
            }
        }

        self.release_trigger(job_id).await;
        info!(job_id = %job_id, status = %outcome.status(), "job finished");
        Ok(outcome.into())
    }

    // --- private helpers ---------------------------------------------------

    /// Await `fut`, mapping expiry of the call timeout through `on_timeout`.
    ///
    /// The SQLite backends do their work on the blocking pool, so expiry is
    /// reported on time even while a database call is stuck.
    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T>>,
        on_timeout: fn(String) -> SchedulerError,
    ) -> Result<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(on_timeout(format!(
                "timed out after {}ms",
                self.call_timeout.as_millis()
            ))),
        }
    }

    /// Best-effort trigger removal once a job can no longer fire usefully.
    async fn release_trigger(&self, job_id: &JobId) {
        if let Err(e) = self
            .bounded(
                self.registry.unregister(job_id.as_str()),
                SchedulerError::RegistryUnavailable,
            )
            .await
        {
            warn!(job_id = %job_id, "could not remove trigger: {e}");
        }
    }

    async fn discard_content(&self, content_ref: &str) {
        let Some(store) = &self.content else {
            return;
        };
        if let Err(e) = self
            .bounded(store.remove(content_ref), SchedulerError::Upload)
            .await
        {
            warn!(content_ref, "could not remove orphaned content: {e}");
        }
    }
}

fn execution_request(job: &Job) -> ExecutionRequest {
    ExecutionRequest {
        job_id: job.job_id.clone(),
        action: job.action.clone(),
        repo_url: job.repo_url.clone(),
        credential_ref: job.credential_ref.clone(),
        content_ref: job.payload_ref.clone(),
    }
}

fn validate_request(request: &ScheduleRequest) -> Result<()> {
    let owner = request.owner.as_str();
    if owner.trim().is_empty() || owner.len() > MAX_OWNER_LEN || owner.chars().any(char::is_control)
    {
        return Err(SchedulerError::InvalidRequest(
            "user id must be 1-128 printable characters".to_string(),
        ));
    }
    request
        .action
        .validate()
        .map_err(SchedulerError::InvalidRequest)?;
    validate_repo_url(&request.repo_url).map_err(SchedulerError::InvalidRequest)?;

    if let Some(cred) = &request.credential_ref {
        if cred.is_empty() || cred.len() > MAX_CREDENTIAL_REF_LEN || cred.chars().any(char::is_control)
        {
            return Err(SchedulerError::InvalidRequest(
                "credential reference must be 1-256 printable characters".to_string(),
            ));
        }
    }
    if let Some(upload) = &request.content {
        if !is_safe_filename(&upload.filename) {
            return Err(SchedulerError::InvalidRequest(format!(
                "content filename must be a bare file name: {:?}",
                upload.filename
            )));
        }
    }
    Ok(())
}

/// Accept `https://host/path`, `ssh://…` and scp-style `user@host:path`.
pub fn validate_repo_url(url: &str) -> std::result::Result<(), String> {
    let invalid = || "Repository URL must be HTTPS or SSH format for GitHub.".to_string();
    if url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid());
    }

    if let Some(rest) = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("ssh://"))
    {
        let (host, path) = rest.split_once('/').ok_or_else(invalid)?;
        let host = host.rsplit('@').next().unwrap_or(host);
        return if !host.is_empty() && !path.trim_matches('/').is_empty() {
            Ok(())
        } else {
            Err(invalid())
        };
    }

    match url.split_once(':') {
        Some((user_host, path)) if !path.is_empty() && !path.starts_with('/') => {
            match user_host.split_once('@') {
                Some((user, host)) if !user.is_empty() && !host.is_empty() => Ok(()),
                _ => Err(invalid()),
            }
        }
        _ => Err(invalid()),
    }
}
