//! Durable one-shot trigger registry seam.
//!
//! A rule carries the fire expression; its single target carries the
//! key/value overrides handed back verbatim when the rule fires. The
//! registry never interprets them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{Result, SchedulerError},
    timespec::TriggerExpression,
    types::Job,
};

/// Every rule gets exactly one target with this id.
pub const TARGET_ID: &str = "Target1";

/// Override names carried in a target's input.
pub mod keys {
    pub const JOB_ID: &str = "JOB_ID";
    pub const USER_ID: &str = "USER_ID";
    pub const ACTION_KIND: &str = "ACTION_KIND";
    pub const ACTION: &str = "ACTION";
    pub const COMMIT_MESSAGE: &str = "COMMIT_MESSAGE";
    pub const REPO_URL: &str = "REPO_URL";
    pub const CREDENTIAL_REF: &str = "CREDENTIAL_REF";
    pub const CONTENT_REF: &str = "CONTENT_REF";
}

fn plaintext() -> String {
    "PLAINTEXT".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvOverride {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", default = "plaintext")]
    pub kind: String,
}

/// Opaque payload stored on a target and delivered on fire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInput {
    #[serde(default)]
    pub environment_variables_override: Vec<EnvOverride>,
}

impl TargetInput {
    /// Append an override. Later duplicates are shadowed by earlier ones on lookup.
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.environment_variables_override.push(EnvOverride {
            name: name.to_string(),
            value: value.into(),
            kind: plaintext(),
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.environment_variables_override
            .iter()
            .find(|o| o.name == name)
            .map(|o| o.value.as_str())
    }

    /// Everything the relay needs to run `job` without another store read.
    pub fn for_job(job: &Job) -> Result<Self> {
        let action = serde_json::to_string(&job.action)
            .map_err(|e| SchedulerError::InvalidRequest(e.to_string()))?;

        let mut input = TargetInput::default()
            .with(keys::JOB_ID, job.job_id.as_str())
            .with(keys::USER_ID, job.owner.as_str())
            .with(keys::ACTION_KIND, job.action.kind())
            .with(keys::ACTION, action)
            .with(
                keys::COMMIT_MESSAGE,
                job.action.commit_message().unwrap_or_default(),
            )
            .with(keys::REPO_URL, job.repo_url.as_str())
            .with(
                keys::CREDENTIAL_REF,
                job.credential_ref.as_deref().unwrap_or_default(),
            );
        if let Some(content_ref) = &job.payload_ref {
            input = input.with(keys::CONTENT_REF, content_ref.as_str());
        }
        Ok(input)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub id: String,
    pub input: TargetInput,
}

/// What a fired rule delivers to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FireEnvelope {
    pub rule: String,
    pub input: TargetInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    /// Waiting for its fire time.
    Enabled,
    /// Delivered to the fire channel and not yet released. Offered again once
    /// the claim lease runs out.
    Claimed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleDescription {
    pub name: String,
    pub expression: TriggerExpression,
    pub state: RuleState,
    pub targets: Vec<TargetDescriptor>,
}

/// Result of [`TriggerRegistry::unregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unregistered {
    Removed,
    /// The rule did not exist; nothing was removed.
    AlreadyAbsent,
}

#[async_trait]
pub trait TriggerRegistry: Send + Sync {
    /// Create or replace a rule. A replaced rule is re-enabled.
    async fn put_rule(&self, name: &str, expression: &TriggerExpression) -> Result<()>;

    /// Attach targets to an existing rule. `RuleNotFound` otherwise.
    async fn put_targets(&self, rule: &str, targets: &[TargetDescriptor]) -> Result<()>;

    /// Detach targets by id. Unknown ids are ignored; an unknown rule is `RuleNotFound`.
    async fn remove_targets(&self, rule: &str, ids: &[&str]) -> Result<()>;

    /// Delete a rule with no targets left.
    ///
    /// `TargetsStillAttached` if any remain, `RuleNotFound` if absent.
    async fn delete_rule(&self, rule: &str) -> Result<()>;

    async fn describe_rule(&self, rule: &str) -> Result<Option<RuleDescription>>;

    /// Rule first, then its single target.
    async fn register(
        &self,
        rule: &str,
        expression: &TriggerExpression,
        input: TargetInput,
    ) -> Result<()> {
        self.put_rule(rule, expression).await?;
        self.put_targets(
            rule,
            &[TargetDescriptor {
                id: TARGET_ID.to_string(),
                input,
            }],
        )
        .await?;
        debug!(rule, %expression, "trigger registered");
        Ok(())
    }

    /// Targets first, then the rule. A missing rule is success.
    async fn unregister(&self, rule: &str) -> Result<Unregistered> {
        match self.remove_targets(rule, &[TARGET_ID]).await {
            Ok(()) => {}
            Err(SchedulerError::RuleNotFound { .. }) => return Ok(Unregistered::AlreadyAbsent),
            Err(e) => return Err(e),
        }
        match self.delete_rule(rule).await {
            Ok(()) => {
                debug!(rule, "trigger unregistered");
                Ok(Unregistered::Removed)
            }
            Err(SchedulerError::RuleNotFound { .. }) => {
                warn!(rule, "rule vanished between target removal and delete");
                Ok(Unregistered::AlreadyAbsent)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobAction, JobStatus};

    fn job(payload_ref: Option<&str>) -> Job {
        Job {
            job_id: "gits-abc".into(),
            owner: "u1".into(),
            created_at: 1,
            schedule_time: "2030-01-01T10:00Z".to_string(),
            action: JobAction::Commit {
                message: "fix typo".to_string(),
            },
            status: JobStatus::Pending,
            payload_ref: payload_ref.map(str::to_string),
            repo_url: "https://github.com/acme/app.git".to_string(),
            credential_ref: Some("pat".to_string()),
            error: None,
            updated_at: String::new(),
        }
    }

    #[test]
    fn target_input_wire_shape() {
        let input = TargetInput::default().with(keys::JOB_ID, "gits-1");
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "environmentVariablesOverride": [
                    {"name": "JOB_ID", "value": "gits-1", "type": "PLAINTEXT"}
                ]
            })
        );

        let parsed: TargetInput = serde_json::from_str(
            r#"{"environmentVariablesOverride":[{"name":"USER_ID","value":"u"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.get(keys::USER_ID), Some("u"));
        assert_eq!(parsed.environment_variables_override[0].kind, "PLAINTEXT");
    }

    #[test]
    fn job_input_omits_absent_content() {
        let without = TargetInput::for_job(&job(None)).unwrap();
        assert_eq!(without.get(keys::CONTENT_REF), None);
        assert_eq!(without.get(keys::COMMIT_MESSAGE), Some("fix typo"));
        assert_eq!(without.get(keys::ACTION_KIND), Some("commit"));

        let with = TargetInput::for_job(&job(Some("file:///x/y.json"))).unwrap();
        assert_eq!(with.get(keys::CONTENT_REF), Some("file:///x/y.json"));
        assert_eq!(with.get(keys::CREDENTIAL_REF), Some("pat"));
    }
}
