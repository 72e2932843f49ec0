//! SQLite trigger registry and the clock that fires its rules.
//!
//! [`SqliteTriggerRegistry`] stores rules and targets; [`TriggerClock`] polls
//! those tables once a second and emits a [`FireEnvelope`] per due target.
//! Delivering a rule claims it for one lease period. The rule row is removed
//! only when the fire handler unregisters it; a claim that outlives its lease
//! (the process died before the job finished) is delivered again.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use gits_core::config::DEFAULT_CLAIM_LEASE_SECS;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    db::init_trigger_db,
    error::{Result, SchedulerError},
    registry::{
        FireEnvelope, RuleDescription, RuleState, TargetDescriptor, TargetInput, TriggerRegistry,
    },
    timespec::TriggerExpression,
};

/// Fires arriving later than this are still delivered, with a warning.
const LATE_FIRE_WARN_SECS: i64 = 60;

fn unavailable(e: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::RegistryUnavailable(e.to_string())
}

fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Clone)]
pub struct SqliteTriggerRegistry {
    conn: Arc<Mutex<Connection>>,
    claim_lease: Duration,
}

impl SqliteTriggerRegistry {
    pub fn new(conn: Connection) -> Result<Self> {
        init_trigger_db(&conn).map_err(unavailable)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            claim_lease: Duration::from_secs(DEFAULT_CLAIM_LEASE_SECS),
        })
    }

    /// How long a delivered rule stays claimed before it is delivered again.
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| unavailable("trigger registry lock poisoned"))
    }

    /// Run `f` against the locked connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| unavailable("trigger registry lock poisoned"))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| unavailable(format!("trigger registry task failed: {e}")))?
    }

    fn rule_exists(conn: &Connection, rule: &str) -> Result<bool> {
        conn.query_row("SELECT 1 FROM trigger_rules WHERE name = ?1", [rule], |_| Ok(()))
            .optional()
            .map(|r| r.is_some())
            .map_err(unavailable)
    }

    /// Claim every due rule that is unclaimed or whose claim has expired, and
    /// return one envelope per target, in fire-time order.
    pub fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<FireEnvelope>> {
        // An unrepresentable lease never expires: "" sorts before every stamp.
        let expired_before = chrono::Duration::from_std(self.claim_lease)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
            .map(stamp)
            .unwrap_or_default();

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(unavailable)?;

        // Collect eagerly so `stmt` is dropped before the UPDATE borrows `tx`.
        let due: Vec<(String, String, Option<String>)> = {
            let mut stmt = tx
                .prepare_cached(
                    "SELECT name, fire_at, claimed_at FROM trigger_rules
                     WHERE fire_at <= ?1 AND (claimed_at IS NULL OR claimed_at <= ?2)
                     ORDER BY fire_at, name",
                )
                .map_err(unavailable)?;
            let rows = stmt
                .query_map([stamp(now), expired_before], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .map_err(unavailable)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(unavailable)?;
            rows
        };

        let mut envelopes = Vec::new();
        for (name, fire_at, claimed_at) in due {
            match claimed_at {
                Some(claimed_at) => {
                    warn!(rule = %name, %claimed_at, "claim expired without release; delivering again");
                }
                None => {
                    if let Ok(at) = DateTime::parse_from_rfc3339(&fire_at) {
                        let late = (now - at.with_timezone(&Utc)).num_seconds();
                        if late > LATE_FIRE_WARN_SECS {
                            warn!(rule = %name, late_secs = late, "rule fired late");
                        }
                    }
                }
            }

            tx.execute(
                "UPDATE trigger_rules SET claimed_at = ?1 WHERE name = ?2",
                [stamp(now), name.clone()],
            )
            .map_err(unavailable)?;

            let targets = read_targets(&tx, &name)?;
            if targets.is_empty() {
                debug!(rule = %name, "due rule has no targets; claimed without delivery");
            }
            envelopes.extend(targets.into_iter().map(|t| FireEnvelope {
                rule: name.clone(),
                input: t.input,
            }));
        }
        tx.commit().map_err(unavailable)?;
        Ok(envelopes)
    }

    /// Drop a rule's claim so the next poll delivers it again.
    pub fn release_claim(&self, rule: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE trigger_rules SET claimed_at = NULL WHERE name = ?1",
            [rule],
        )
        .map_err(unavailable)?;
        Ok(())
    }
}

fn read_targets(conn: &Connection, rule: &str) -> Result<Vec<TargetDescriptor>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT target_id, input FROM trigger_targets
             WHERE rule_name = ?1 ORDER BY target_id",
        )
        .map_err(unavailable)?;
    let rows = stmt
        .query_map([rule], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(unavailable)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(unavailable)?;

    rows.into_iter()
        .map(|(id, input)| {
            let input: TargetInput = serde_json::from_str(&input)
                .map_err(|e| unavailable(format!("bad target input on {rule}/{id}: {e}")))?;
            Ok(TargetDescriptor { id, input })
        })
        .collect()
}

#[async_trait]
impl TriggerRegistry for SqliteTriggerRegistry {
    async fn put_rule(&self, name: &str, expression: &TriggerExpression) -> Result<()> {
        let fire_at = expression.fire_at().ok_or_else(|| {
            SchedulerError::InvalidRequest(format!("expression {expression} names no instant"))
        })?;
        let (name, expression) = (name.to_string(), expression.clone());
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO trigger_rules (name, expression, fire_at, claimed_at, created_at)
                 VALUES (?1, ?2, ?3, NULL, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                    expression = excluded.expression,
                    fire_at    = excluded.fire_at,
                    claimed_at = NULL",
                rusqlite::params![name, expression.to_string(), stamp(fire_at), stamp(Utc::now())],
            )
            .map_err(unavailable)?;
            debug!(rule = %name, %expression, "rule put");
            Ok(())
        })
        .await
    }

    async fn put_targets(&self, rule: &str, targets: &[TargetDescriptor]) -> Result<()> {
        let (rule, targets) = (rule.to_string(), targets.to_vec());
        self.blocking(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(unavailable)?;
            if !Self::rule_exists(&tx, &rule)? {
                return Err(SchedulerError::RuleNotFound { rule });
            }
            for target in &targets {
                let input = serde_json::to_string(&target.input).map_err(unavailable)?;
                tx.execute(
                    "INSERT INTO trigger_targets (rule_name, target_id, input)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(rule_name, target_id) DO UPDATE SET input = excluded.input",
                    rusqlite::params![rule, target.id, input],
                )
                .map_err(unavailable)?;
            }
            tx.commit().map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn remove_targets(&self, rule: &str, ids: &[&str]) -> Result<()> {
        let rule = rule.to_string();
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        self.blocking(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(unavailable)?;
            if !Self::rule_exists(&tx, &rule)? {
                return Err(SchedulerError::RuleNotFound { rule });
            }
            for id in &ids {
                tx.execute(
                    "DELETE FROM trigger_targets WHERE rule_name = ?1 AND target_id = ?2",
                    [&rule, id],
                )
                .map_err(unavailable)?;
            }
            tx.commit().map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn delete_rule(&self, rule: &str) -> Result<()> {
        let rule = rule.to_string();
        self.blocking(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(unavailable)?;
            let attached: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM trigger_targets WHERE rule_name = ?1",
                    [&rule],
                    |row| row.get(0),
                )
                .map_err(unavailable)?;
            if attached > 0 {
                return Err(SchedulerError::TargetsStillAttached { rule });
            }
            let n = tx
                .execute("DELETE FROM trigger_rules WHERE name = ?1", [&rule])
                .map_err(unavailable)?;
            if n == 0 {
                return Err(SchedulerError::RuleNotFound { rule });
            }
            tx.commit().map_err(unavailable)?;
            debug!(rule = %rule, "rule deleted");
            Ok(())
        })
        .await
    }

    async fn describe_rule(&self, rule: &str) -> Result<Option<RuleDescription>> {
        let rule = rule.to_string();
        self.blocking(move |conn| {
            let row: Option<(String, Option<String>)> = conn
                .query_row(
                    "SELECT expression, claimed_at FROM trigger_rules WHERE name = ?1",
                    [&rule],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(unavailable)?;
            let Some((expression, claimed_at)) = row else {
                return Ok(None);
            };

            let targets = read_targets(conn, &rule)?;
            Ok(Some(RuleDescription {
                name: rule,
                expression: expression.parse().map_err(unavailable)?,
                state: match claimed_at {
                    Some(_) => RuleState::Claimed,
                    None => RuleState::Enabled,
                },
                targets,
            }))
        })
        .await
    }
}

/// Plays the external clock for [`SqliteTriggerRegistry`].
pub struct TriggerClock {
    registry: SqliteTriggerRegistry,
    fire_tx: mpsc::Sender<FireEnvelope>,
}

impl TriggerClock {
    pub fn new(registry: SqliteTriggerRegistry, fire_tx: mpsc::Sender<FireEnvelope>) -> Self {
        Self { registry, fire_tx }
    }

    /// Poll every second until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("trigger clock started");

        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()) {
                        error!("trigger clock tick error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("trigger clock shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Fire everything due at `now`. Returns how many envelopes were delivered.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut delivered = 0;
        for envelope in self.registry.claim_due(now)? {
            let rule = envelope.rule.clone();
            // try_send never blocks the tick loop. A rejected envelope gives
            // its claim back so the next tick redelivers it.
            match self.fire_tx.try_send(envelope) {
                Ok(()) => {
                    info!(rule = %rule, "rule fired");
                    delivered += 1;
                }
                Err(e) => {
                    warn!(rule = %rule, "fire channel rejected envelope: {e}; will retry");
                    if let Err(e) = self.registry.release_claim(&rule) {
                        warn!(rule = %rule, "could not release claim; redelivered after the lease: {e}");
                    }
                }
            }
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{keys, Unregistered, TARGET_ID};
    use chrono::TimeZone;

    fn registry() -> SqliteTriggerRegistry {
        SqliteTriggerRegistry::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn expr(min: u32) -> TriggerExpression {
        TriggerExpression::from_utc(&Utc.with_ymd_and_hms(2030, 1, 1, 10, min, 0).unwrap())
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, h, m, s).unwrap()
    }

    fn input(job: &str) -> TargetInput {
        TargetInput::default().with(keys::JOB_ID, job)
    }

    #[tokio::test]
    async fn register_then_describe() {
        let r = registry();
        r.register("gits-1", &expr(5), input("gits-1")).await.unwrap();

        let d = r.describe_rule("gits-1").await.unwrap().unwrap();
        assert_eq!(d.expression, expr(5));
        assert_eq!(d.state, RuleState::Enabled);
        assert_eq!(d.targets.len(), 1);
        assert_eq!(d.targets[0].id, TARGET_ID);
        assert_eq!(d.targets[0].input.get(keys::JOB_ID), Some("gits-1"));
    }

    #[tokio::test]
    async fn delete_rule_with_targets_is_refused() {
        let r = registry();
        r.register("gits-1", &expr(5), input("gits-1")).await.unwrap();
        let err = r.delete_rule("gits-1").await.unwrap_err();
        assert!(matches!(err, SchedulerError::TargetsStillAttached { .. }));
        assert!(r.describe_rule("gits-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let r = registry();
        r.register("gits-1", &expr(5), input("gits-1")).await.unwrap();
        assert_eq!(r.unregister("gits-1").await.unwrap(), Unregistered::Removed);
        assert_eq!(
            r.unregister("gits-1").await.unwrap(),
            Unregistered::AlreadyAbsent
        );
        assert!(r.describe_rule("gits-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn targets_need_a_rule() {
        let r = registry();
        let err = r
            .put_targets(
                "missing",
                &[TargetDescriptor {
                    id: TARGET_ID.to_string(),
                    input: input("x"),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::RuleNotFound { .. }));
    }

    #[tokio::test]
    async fn clock_fires_due_rules_once_per_lease() {
        let r = registry().with_claim_lease(Duration::from_secs(300));
        r.register("gits-early", &expr(5), input("gits-early")).await.unwrap();
        r.register("gits-late", &expr(30), input("gits-late")).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let clock = TriggerClock::new(r.clone(), tx);

        assert_eq!(clock.tick(at(10, 4, 59)).unwrap(), 0);

        assert_eq!(clock.tick(at(10, 5, 0)).unwrap(), 1);
        let env = rx.try_recv().unwrap();
        assert_eq!(env.rule, "gits-early");
        assert_eq!(env.input.get(keys::JOB_ID), Some("gits-early"));

        // Claimed, not deleted; the later rule is untouched.
        assert_eq!(clock.tick(at(10, 5, 1)).unwrap(), 0);
        let d = r.describe_rule("gits-early").await.unwrap().unwrap();
        assert_eq!(d.state, RuleState::Claimed);
        assert_eq!(
            r.describe_rule("gits-late").await.unwrap().unwrap().state,
            RuleState::Enabled
        );

        // Unregistering is what ends a claimed rule.
        r.unregister("gits-early").await.unwrap();
        assert_eq!(clock.tick(at(10, 20, 0)).unwrap(), 0);
    }

    #[tokio::test]
    async fn unreleased_claim_is_delivered_again_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gits.db");
        let open = || {
            SqliteTriggerRegistry::new(Connection::open(&path).unwrap())
                .unwrap()
                .with_claim_lease(Duration::from_secs(300))
        };

        {
            let r = open();
            r.register("gits-1", &expr(5), input("gits-1")).await.unwrap();
            let (tx, rx) = mpsc::channel(8);
            let clock = TriggerClock::new(r, tx);
            assert_eq!(clock.tick(at(10, 5, 0)).unwrap(), 1);
            // The process dies with the envelope still buffered.
            drop(rx);
        }

        let r = open();
        let (tx, mut rx) = mpsc::channel(8);
        let clock = TriggerClock::new(r.clone(), tx);
        assert_eq!(clock.tick(at(10, 9, 59)).unwrap(), 0);
        assert_eq!(clock.tick(at(10, 10, 0)).unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap().rule, "gits-1");
        assert_eq!(
            r.describe_rule("gits-1").await.unwrap().unwrap().state,
            RuleState::Claimed
        );
    }

    #[tokio::test]
    async fn full_channel_redelivers_next_tick() {
        let r = registry();
        r.register("gits-a", &expr(1), input("gits-a")).await.unwrap();
        r.register("gits-b", &expr(2), input("gits-b")).await.unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let clock = TriggerClock::new(r.clone(), tx);
        let now = at(11, 0, 0);

        assert_eq!(clock.tick(now).unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap().rule, "gits-a");

        assert_eq!(clock.tick(now).unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap().rule, "gits-b");
    }

    #[tokio::test]
    async fn closed_channel_releases_every_claim_in_the_batch() {
        let r = registry();
        r.register("gits-a", &expr(1), input("gits-a")).await.unwrap();
        r.register("gits-b", &expr(2), input("gits-b")).await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        assert_eq!(TriggerClock::new(r.clone(), tx).tick(at(11, 0, 0)).unwrap(), 0);
        for rule in ["gits-a", "gits-b"] {
            assert_eq!(
                r.describe_rule(rule).await.unwrap().unwrap().state,
                RuleState::Enabled
            );
        }

        let (tx, _rx) = mpsc::channel(8);
        assert_eq!(TriggerClock::new(r, tx).tick(at(11, 0, 1)).unwrap(), 2);
    }

    #[tokio::test]
    async fn put_rule_again_clears_the_claim() {
        let r = registry();
        r.register("gits-1", &expr(5), input("gits-1")).await.unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let clock = TriggerClock::new(r.clone(), tx);
        clock.tick(at(10, 5, 0)).unwrap();

        r.put_rule("gits-1", &expr(40)).await.unwrap();
        let d = r.describe_rule("gits-1").await.unwrap().unwrap();
        assert_eq!(d.state, RuleState::Enabled);
        assert_eq!(d.expression, expr(40));
    }

    #[tokio::test]
    async fn stuck_connection_does_not_block_the_caller() {
        let r = registry();
        let conn = Arc::clone(&r.conn);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _guard = conn.lock().unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(500));
        });
        locked_rx.recv().unwrap();

        let res = tokio::time::timeout(Duration::from_millis(50), r.describe_rule("gits-1")).await;
        assert!(res.is_err(), "call should still be waiting on the lock");
        holder.join().unwrap();
    }
}
