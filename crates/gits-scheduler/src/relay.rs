//! Turns fire envelopes into `on_fire` calls.

use std::sync::Arc;

use gits_core::JobId;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SchedulerError},
    executor::GitExecutor,
    registry::{keys, FireEnvelope, TargetInput},
    scheduler::JobScheduler,
    types::{FireOutcome, FireRequest, JobAction},
};

#[derive(Clone)]
pub struct ExecutionRelay {
    scheduler: Arc<JobScheduler>,
    executor: Arc<dyn GitExecutor>,
}

impl ExecutionRelay {
    pub fn new(scheduler: Arc<JobScheduler>, executor: Arc<dyn GitExecutor>) -> Self {
        Self {
            scheduler,
            executor,
        }
    }

    pub async fn on_trigger(&self, envelope: &FireEnvelope) -> Result<FireOutcome> {
        let request = decode(envelope)?;
        debug!(job_id = %request.job_id, rule = %envelope.rule, "fire event decoded");

        self.scheduler
            .on_fire(&request, self.executor.as_ref())
            .await
            .inspect_err(|e| {
                error!(job_id = %request.job_id, "fire handling failed, not retried: {e}");
            })
    }

    /// Decode a raw JSON envelope, as delivered over HTTP.
    pub async fn on_trigger_bytes(&self, body: &[u8]) -> Result<FireOutcome> {
        let envelope: FireEnvelope = serde_json::from_slice(body)
            .map_err(|e| SchedulerError::InvalidEnvelope(e.to_string()))?;
        self.on_trigger(&envelope).await
    }

    /// Handle envelopes from `fire_rx` until `shutdown` broadcasts `true` or
    /// the sender side closes.
    pub async fn run(
        self,
        mut fire_rx: mpsc::Receiver<FireEnvelope>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("execution relay started");
        loop {
            tokio::select! {
                maybe = fire_rx.recv() => {
                    let Some(envelope) = maybe else {
                        info!("fire channel closed; relay stopping");
                        break;
                    };
                    // Each fire runs on its own task so a slow git call does
                    // not hold back the next due job.
                    let relay = self.clone();
                    tokio::spawn(async move {
                        match relay.on_trigger(&envelope).await {
                            Ok(outcome) => debug!(rule = %envelope.rule, ?outcome, "fire handled"),
                            Err(SchedulerError::InvalidEnvelope(e)) => {
                                warn!(rule = %envelope.rule, "undecodable fire event dropped: {e}");
                            }
                            // on_trigger logs every other error.
                            Err(_) => {}
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("execution relay shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Build a [`FireRequest`] from an envelope, requiring at least `JOB_ID`
/// matching the rule name.
pub fn decode(envelope: &FireEnvelope) -> Result<FireRequest> {
    let input = &envelope.input;
    let job_id = non_empty(input, keys::JOB_ID)
        .ok_or_else(|| SchedulerError::InvalidEnvelope("missing JOB_ID".to_string()))?;
    if job_id != envelope.rule {
        return Err(SchedulerError::InvalidEnvelope(format!(
            "JOB_ID {job_id} does not match rule {}",
            envelope.rule
        )));
    }
    let job_id = JobId::from(job_id);
    if !job_id.is_valid_rule_name() {
        return Err(SchedulerError::InvalidEnvelope(format!(
            "JOB_ID {:?} is not a valid rule name",
            job_id.as_str()
        )));
    }

    let action = match non_empty(input, keys::ACTION) {
        Some(raw) => Some(
            serde_json::from_str::<JobAction>(raw)
                .map_err(|e| SchedulerError::InvalidEnvelope(format!("bad ACTION: {e}")))?,
        ),
        None => None,
    };
    if let (Some(action), Some(kind)) = (&action, non_empty(input, keys::ACTION_KIND)) {
        if action.kind() != kind {
            return Err(SchedulerError::InvalidEnvelope(format!(
                "ACTION_KIND {kind} does not match ACTION"
            )));
        }
    }

    Ok(FireRequest {
        job_id,
        owner: non_empty(input, keys::USER_ID).map(Into::into),
        action,
        content_ref: non_empty(input, keys::CONTENT_REF).map(str::to_string),
        credential_ref: non_empty(input, keys::CREDENTIAL_REF).map(str::to_string),
        repo_url: non_empty(input, keys::REPO_URL).map(str::to_string),
    })
}

fn non_empty<'a>(input: &'a TargetInput, key: &str) -> Option<&'a str> {
    input.get(key).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(input: TargetInput) -> FireEnvelope {
        FireEnvelope {
            rule: "gits-1".to_string(),
            input,
        }
    }

    #[test]
    fn decodes_full_envelope() {
        let raw = serde_json::json!({
            "rule": "gits-1",
            "input": {"environmentVariablesOverride": [
                {"name": "JOB_ID", "value": "gits-1", "type": "PLAINTEXT"},
                {"name": "USER_ID", "value": "u1", "type": "PLAINTEXT"},
                {"name": "ACTION_KIND", "value": "push", "type": "PLAINTEXT"},
                {"name": "ACTION", "value": "{\"kind\":\"push\",\"force\":true}", "type": "PLAINTEXT"},
                {"name": "COMMIT_MESSAGE", "value": "", "type": "PLAINTEXT"},
                {"name": "REPO_URL", "value": "https://github.com/a/b.git", "type": "PLAINTEXT"},
                {"name": "CREDENTIAL_REF", "value": "", "type": "PLAINTEXT"}
            ]}
        });
        let env: FireEnvelope = serde_json::from_value(raw).unwrap();
        let req = decode(&env).unwrap();

        assert_eq!(req.job_id.as_str(), "gits-1");
        assert_eq!(req.owner.as_ref().map(|o| o.as_str()), Some("u1"));
        assert_eq!(req.action, Some(JobAction::Push { force: true }));
        assert_eq!(req.repo_url.as_deref(), Some("https://github.com/a/b.git"));
        assert_eq!(req.credential_ref, None);
        assert_eq!(req.content_ref, None);
    }

    #[test]
    fn rejects_malformed_envelopes() {
        let cases = [
            TargetInput::default(),
            TargetInput::default().with(keys::JOB_ID, ""),
            TargetInput::default().with(keys::JOB_ID, "gits-other"),
            TargetInput::default()
                .with(keys::JOB_ID, "gits-1")
                .with(keys::ACTION, "{not json"),
            TargetInput::default()
                .with(keys::JOB_ID, "gits-1")
                .with(keys::ACTION_KIND, "commit")
                .with(keys::ACTION, r#"{"kind":"push"}"#),
        ];
        for input in cases {
            let err = decode(&envelope(input.clone())).unwrap_err();
            assert_eq!(err.code(), "INVALID_ENVELOPE", "{input:?}");
        }
    }

    #[test]
    fn rejects_job_ids_that_are_not_rule_names() {
        let long = "g".repeat(65);
        for bad in ["gits 1", "../etc/passwd", long.as_str()] {
            let env = FireEnvelope {
                rule: bad.to_string(),
                input: TargetInput::default().with(keys::JOB_ID, bad),
            };
            let err = decode(&env).unwrap_err();
            assert_eq!(err.code(), "INVALID_ENVELOPE", "{bad}");
        }
    }
}
