//! HTTP client for the gits gateway.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use gits_scheduler::JobAction;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{CliError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
pub struct ContentPayload {
    pub filename: String,
    pub base64: String,
}

impl ContentPayload {
    pub fn new(filename: String, bytes: &[u8]) -> Self {
        Self {
            filename,
            base64: STANDARD.encode(bytes),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SchedulePayload {
    pub user_id: String,
    pub action: JobAction,
    pub schedule_time: String,
    pub repo_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentPayload>,
}

#[derive(Debug, Deserialize)]
pub struct Scheduled {
    pub job_id: String,
    pub schedule_time: String,
    pub status: String,
    pub cron_expression: String,
    #[serde(default)]
    pub content_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusReply {
    pub job_id: String,
    pub schedule_time: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct JobLine {
    pub job_id: String,
    pub schedule_time: String,
    pub status: String,
    pub action: JobAction,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobsReply {
    jobs: Vec<JobLine>,
}

pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn schedule(&self, payload: &SchedulePayload) -> Result<Scheduled> {
        let resp = self
            .client
            .post(self.url("/schedule"))
            .json(payload)
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn delete(&self, user_id: &str, job_id: &str) -> Result<()> {
        let resp = self
            .client
            .post(self.url("/delete"))
            .json(&serde_json::json!({"user_id": user_id, "job_id": job_id}))
            .send()
            .await?;
        decode::<Value>(resp).await.map(|_| ())
    }

    pub async fn status(&self, user_id: &str) -> Result<StatusReply> {
        let resp = self
            .client
            .get(self.url("/status"))
            .query(&[("user_id", user_id)])
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn jobs(&self, user_id: &str) -> Result<Vec<JobLine>> {
        let resp = self
            .client
            .get(self.url("/jobs"))
            .query(&[("user_id", user_id)])
            .send()
            .await?;
        decode::<JobsReply>(resp).await.map(|r| r.jobs)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    debug!(status = status.as_u16(), url = %resp.url(), "gateway replied");

    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(api_error(status.as_u16(), &text));
    }
    Ok(resp.json().await?)
}

/// Prefer the gateway's own `{"error", "code"}` text; fall back to the raw body.
pub fn api_error(status: u16, body: &str) -> CliError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let field = |name: &str| {
        parsed
            .as_ref()
            .and_then(|v| v.get(name))
            .and_then(Value::as_str)
            .map(String::from)
    };

    let message = field("error").unwrap_or_else(|| {
        let body = body.trim();
        if body.is_empty() {
            format!("gateway returned status {status}")
        } else {
            format!("gateway returned status {status}: {body}")
        }
    });
    CliError::Api {
        status,
        code: field("code"),
        message,
    }
}
