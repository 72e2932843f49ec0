//! Durable job records partitioned by owner.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use gits_core::{config::DEFAULT_CLAIM_LEASE_SECS, JobId, OwnerId};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    types::{Job, JobAction, JobStatus, NewJob, Outcome},
};

const JOB_COLUMNS: &str = "job_id, owner, created_at, schedule_time, action, status,
                           payload_ref, repo_url, credential_ref, error, updated_at";

/// Keyed job storage. Every method is atomic per (owner, job_id).
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Write a new `pending` row, assigning `job_id` / `created_at` when absent.
    async fn create(&self, job: NewJob) -> Result<Job>;

    /// Look a job up by identity alone.
    async fn get(&self, job_id: &JobId) -> Result<Option<Job>>;

    /// The owner's row with the greatest `created_at`.
    async fn query_latest(&self, owner: &OwnerId) -> Result<Job>;

    /// All of the owner's rows, most recent first.
    async fn query_all(&self, owner: &OwnerId) -> Result<Vec<Job>>;

    /// Remove a pending row located by owner + job_id and return it.
    ///
    /// `JobNotFound` if absent, `AlreadyTerminal` if the row left `pending`,
    /// `JobInProgress` while a fire holds an unexpired claim on it.
    async fn delete_by_identity(&self, owner: &OwnerId, job_id: &JobId) -> Result<Job>;

    /// Take the right to run a pending job. Must succeed before git runs.
    ///
    /// `JobNotFound` if absent, `AlreadyTerminal` if the row left `pending`,
    /// `JobInProgress` while another unexpired claim exists.
    async fn claim(&self, job_id: &JobId) -> Result<Job>;

    /// `pending → succeeded | failed`. Any other transition is rejected.
    async fn mark_terminal(&self, job_id: &JobId, outcome: &Outcome) -> Result<Job>;
}

/// SQLite-backed [`JobStore`].
///
/// Cloning shares the connection. Writes run in `BEGIN IMMEDIATE`
/// transactions so several processes may open the same database file.
/// Every call runs on the blocking pool, so a caller's timeout still fires
/// while SQLite is stuck.
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
    claim_lease: Duration,
}

impl SqliteJobStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            claim_lease: Duration::from_secs(DEFAULT_CLAIM_LEASE_SECS),
        })
    }

    /// After `lease`, a claim left by a crashed delivery may be taken again.
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Run `f` against the locked connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| {
                SchedulerError::StoreUnavailable("job store lock poisoned".to_string())
            })?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| SchedulerError::StoreUnavailable(format!("job store task failed: {e}")))?
    }

    /// Claims stamped at or before this instant have expired.
    fn lease_cutoff(&self) -> i64 {
        let lease = i64::try_from(self.claim_lease.as_secs()).unwrap_or(i64::MAX);
        Utc::now().timestamp().saturating_sub(lease)
    }

    /// Next `created_at` for `owner`: wall clock, bumped past the last value
    /// so two creations in the same microsecond still order.
    fn next_created_at(conn: &Connection, owner: &OwnerId) -> Result<i64> {
        let last: Option<i64> = conn.query_row(
            "SELECT MAX(created_at) FROM jobs WHERE owner = ?1",
            [owner.as_str()],
            |row| row.get(0),
        )?;
        let now = Utc::now().timestamp_micros();
        Ok(match last {
            Some(last) if last >= now => last + 1,
            _ => now,
        })
    }

    fn select_by_id(conn: &Connection, job_id: &JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1");
        conn.query_row(&sql, [job_id.as_str()], read_row)
            .optional()?
            .map(JobRow::into_job)
            .transpose()
    }

    /// A pending row's claim stamp, if a fire still holds it.
    fn live_claim(conn: &Connection, job_id: &JobId, cutoff: i64) -> Result<Option<i64>> {
        let claimed_at: Option<i64> = conn
            .query_row(
                "SELECT claimed_at FROM jobs WHERE job_id = ?1",
                [job_id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(claimed_at.filter(|at| *at > cutoff))
    }
}

/// Pending row for `job_id`; `JobNotFound` / `AlreadyTerminal` otherwise.
fn pending_row(conn: &Connection, job_id: &JobId) -> Result<Job> {
    let job = SqliteJobStore::select_by_id(conn, job_id)?.ok_or_else(|| {
        SchedulerError::JobNotFound {
            id: job_id.to_string(),
        }
    })?;
    if job.status.is_terminal() {
        return Err(SchedulerError::AlreadyTerminal {
            id: job_id.to_string(),
            status: job.status,
        });
    }
    Ok(job)
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, job: NewJob) -> Result<Job> {
        self.blocking(move |conn| create_row(conn, job)).await
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>> {
        let job_id = job_id.clone();
        self.blocking(move |conn| Self::select_by_id(conn, &job_id))
            .await
    }

    async fn query_latest(&self, owner: &OwnerId) -> Result<Job> {
        let owner = owner.clone();
        self.blocking(move |conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE owner = ?1
                 ORDER BY created_at DESC LIMIT 1"
            );
            conn.query_row(&sql, [owner.as_str()], read_row)
                .optional()?
                .ok_or_else(|| SchedulerError::NoJobs {
                    owner: owner.to_string(),
                })?
                .into_job()
        })
        .await
    }

    async fn query_all(&self, owner: &OwnerId) -> Result<Vec<Job>> {
        let owner = owner.clone();
        self.blocking(move |conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE owner = ?1
                 ORDER BY created_at DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([owner.as_str()], read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            // Rows that fail to decode are logged and left out.
            Ok(rows
                .into_iter()
                .filter_map(|row| {
                    let id = row.job_id.clone();
                    row.into_job()
                        .map_err(|e| warn!(job_id = %id, "skipping undecodable job row: {e}"))
                        .ok()
                })
                .collect())
        })
        .await
    }

    async fn delete_by_identity(&self, owner: &OwnerId, job_id: &JobId) -> Result<Job> {
        let (owner, job_id) = (owner.clone(), job_id.clone());
        let cutoff = self.lease_cutoff();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let job = SqliteJobStore::select_by_id(&tx, &job_id)?
                .filter(|j| j.owner == owner)
                .ok_or_else(|| SchedulerError::JobNotFound {
                    id: job_id.to_string(),
                })?;
            if job.status.is_terminal() {
                return Err(SchedulerError::AlreadyTerminal {
                    id: job_id.to_string(),
                    status: job.status,
                });
            }
            if SqliteJobStore::live_claim(&tx, &job_id, cutoff)?.is_some() {
                return Err(SchedulerError::JobInProgress {
                    id: job_id.to_string(),
                });
            }

            let n = tx.execute(
                "DELETE FROM jobs WHERE owner = ?1 AND job_id = ?2 AND status = 'pending'
                 AND (claimed_at IS NULL OR claimed_at <= ?3)",
                rusqlite::params![owner.as_str(), job_id.as_str(), cutoff],
            )?;
            if n == 0 {
                return Err(SchedulerError::JobNotFound {
                    id: job_id.to_string(),
                });
            }
            tx.commit()?;

            debug!(job_id = %job_id, owner = %owner, "job row deleted");
            Ok(job)
        })
        .await
    }

    async fn claim(&self, job_id: &JobId) -> Result<Job> {
        let job_id = job_id.clone();
        let cutoff = self.lease_cutoff();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let job = pending_row(&tx, &job_id)?;
            if let Some(at) = SqliteJobStore::live_claim(&tx, &job_id, cutoff)? {
                debug!(job_id = %job_id, claimed_at = at, "job already claimed");
                return Err(SchedulerError::JobInProgress {
                    id: job_id.to_string(),
                });
            }

            tx.execute(
                "UPDATE jobs SET claimed_at = ?1
                 WHERE job_id = ?2 AND status = 'pending'",
                rusqlite::params![Utc::now().timestamp(), job_id.as_str()],
            )?;
            tx.commit()?;

            debug!(job_id = %job_id, "job claimed");
            Ok(job)
        })
        .await
    }

    async fn mark_terminal(&self, job_id: &JobId, outcome: &Outcome) -> Result<Job> {
        let (job_id, outcome) = (job_id.clone(), outcome.clone());
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = pending_row(&tx, &job_id)?;

            let now = Utc::now().to_rfc3339();
            let status = outcome.status();
            tx.execute(
                "UPDATE jobs SET status = ?1, error = ?2, updated_at = ?3, claimed_at = NULL
                 WHERE job_id = ?4 AND status = 'pending'",
                rusqlite::params![status.to_string(), outcome.error(), now, job_id.as_str()],
            )?;
            tx.commit()?;

            info!(job_id = %job_id, %status, "job reached terminal status");
            Ok(Job {
                status,
                error: outcome.error().map(str::to_string),
                updated_at: now,
                ..current
            })
        })
        .await
    }
}

fn create_row(conn: &mut Connection, job: NewJob) -> Result<Job> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let created_at = match job.created_at {
        Some(given) => {
            if has_row_at_or_after(&tx, &job.owner, given)? {
                return Err(SchedulerError::InvalidRequest(format!(
                    "created_at {given} is not after the owner's latest job"
                )));
            }
            given
        }
        None => SqliteJobStore::next_created_at(&tx, &job.owner)?,
    };
    let job_id = job.job_id.unwrap_or_default();
    let action_json = serde_json::to_string(&job.action)
        .map_err(|e| SchedulerError::InvalidRequest(e.to_string()))?;
    let now = Utc::now().to_rfc3339();

    let inserted = tx.execute(
        "INSERT INTO jobs
         (owner, created_at, job_id, schedule_time, action, status,
          payload_ref, repo_url, credential_ref, error, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, NULL, ?9)",
        rusqlite::params![
            job.owner.as_str(),
            created_at,
            job_id.as_str(),
            job.schedule_time,
            action_json,
            job.payload_ref,
            job.repo_url,
            job.credential_ref,
            now,
        ],
    );
    if let Err(e) = inserted {
        return Err(match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::ConstraintViolation) => SchedulerError::InvalidRequest(
                format!("job {job_id} or its creation slot already exists"),
            ),
            _ => e.into(),
        });
    }
    tx.commit()?;

    info!(job_id = %job_id, owner = %job.owner, created_at, "job stored");

    Ok(Job {
        job_id,
        owner: job.owner,
        created_at,
        schedule_time: job.schedule_time,
        action: job.action,
        status: JobStatus::Pending,
        payload_ref: job.payload_ref,
        repo_url: job.repo_url,
        credential_ref: job.credential_ref,
        error: None,
        updated_at: now,
    })
}

/// True if the owner already has a row at or after `created_at`.
fn has_row_at_or_after(conn: &Connection, owner: &OwnerId, created_at: i64) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM jobs WHERE owner = ?1 AND created_at >= ?2",
        rusqlite::params![owner.as_str(), created_at],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Raw column values; decoding of JSON / enum columns happens in `into_job`.
struct JobRow {
    job_id: String,
    owner: String,
    created_at: i64,
    schedule_time: String,
    action: String,
    status: String,
    payload_ref: Option<String>,
    repo_url: String,
    credential_ref: Option<String>,
    error: Option<String>,
    updated_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        job_id: row.get(0)?,
        owner: row.get(1)?,
        created_at: row.get(2)?,
        schedule_time: row.get(3)?,
        action: row.get(4)?,
        status: row.get(5)?,
        payload_ref: row.get(6)?,
        repo_url: row.get(7)?,
        credential_ref: row.get(8)?,
        error: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let action: JobAction = serde_json::from_str(&self.action).map_err(|e| {
            SchedulerError::StoreUnavailable(format!("bad action JSON for {}: {e}", self.job_id))
        })?;
        let status: JobStatus = self
            .status
            .parse()
            .map_err(SchedulerError::StoreUnavailable)?;
        Ok(Job {
            job_id: self.job_id.into(),
            owner: self.owner.into(),
            created_at: self.created_at,
            schedule_time: self.schedule_time,
            action,
            status,
            payload_ref: self.payload_ref,
            repo_url: self.repo_url,
            credential_ref: self.credential_ref,
            error: self.error,
            updated_at: self.updated_at,
        })
    }
}
