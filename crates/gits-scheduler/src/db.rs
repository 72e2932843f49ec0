use rusqlite::Connection;

use crate::error::Result;

/// Initialise the job store schema in `conn`.
///
/// Rows are keyed by `(owner, created_at)` so "most recent for owner" is an
/// index range scan; `job_id` is unique across owners and carries a second
/// index for delete-by-identity.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            owner           TEXT    NOT NULL,
            created_at      INTEGER NOT NULL,   -- microseconds since epoch
            job_id          TEXT    NOT NULL UNIQUE,
            schedule_time   TEXT    NOT NULL,   -- YYYY-MM-DDTHH:MMZ
            action          TEXT    NOT NULL,   -- JSON-encoded JobAction
            status          TEXT    NOT NULL DEFAULT 'pending',
            payload_ref     TEXT,
            repo_url        TEXT    NOT NULL,
            credential_ref  TEXT,
            error           TEXT,
            updated_at      TEXT    NOT NULL,
            claimed_at      INTEGER,            -- unix seconds; set while a fire runs the job
            PRIMARY KEY (owner, created_at)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_owner_job_id ON jobs (owner, job_id);
        ",
    )?;
    Ok(())
}

/// Initialise the local trigger registry schema in `conn`.
///
/// Targets live in their own table with no cascade so a rule cannot be
/// dropped while a target still points at it.
pub fn init_trigger_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS trigger_rules (
            name        TEXT NOT NULL PRIMARY KEY,
            expression  TEXT NOT NULL,          -- cron(M H D Mo ? Y)
            fire_at     TEXT NOT NULL,          -- RFC 3339, derived from expression
            claimed_at  TEXT,                   -- RFC 3339; NULL until delivered
            created_at  TEXT NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS trigger_targets (
            rule_name   TEXT NOT NULL,
            target_id   TEXT NOT NULL,
            input       TEXT NOT NULL,          -- JSON-encoded TargetInput
            PRIMARY KEY (rule_name, target_id)
        ) STRICT;

        -- Clock polling: SELECT … WHERE fire_at <= ? AND (claimed_at IS NULL OR …)
        CREATE INDEX IF NOT EXISTS idx_trigger_rules_due ON trigger_rules (fire_at);
        ",
    )
}
