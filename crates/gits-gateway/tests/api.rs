use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use gits_core::config::{FireAuthMode, GitsConfig};
use gits_gateway::{
    app::{build_router, AppState},
    http::fire::{sign, SIGNATURE_HEADER},
};
use gits_scheduler::{
    registry::keys, ExecutionRelay, ExecutionReport, ExecutionRequest, ExecutorError,
    FireEnvelope, FsContentStore, GitExecutor, JobScheduler, SqliteJobStore,
    SqliteTriggerRegistry, TargetInput,
};
use rusqlite::Connection;
use serde_json::{json, Value};
use tower::ServiceExt;

const REPO: &str = "https://github.com/acme/site.git";

#[derive(Default)]
struct RecordingExecutor {
    calls: Mutex<Vec<ExecutionRequest>>,
}

#[async_trait]
impl GitExecutor for RecordingExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionReport, ExecutorError> {
        self.calls.lock().unwrap().push(request.clone());
        Ok(ExecutionReport {
            exit_code: 0,
            output: String::new(),
        })
    }
}

struct TestApp {
    router: Router,
    executor: Arc<RecordingExecutor>,
    _content_dir: tempfile::TempDir,
}

fn app_with(auth_mode: FireAuthMode, secret: Option<&str>) -> TestApp {
    let content_dir = tempfile::tempdir().unwrap();
    let store = SqliteJobStore::new(Connection::open_in_memory().unwrap()).unwrap();
    let registry = SqliteTriggerRegistry::new(Connection::open_in_memory().unwrap()).unwrap();

    let scheduler = Arc::new(
        JobScheduler::new(Arc::new(store), Arc::new(registry))
            .with_content(Arc::new(FsContentStore::new(content_dir.path())))
            .with_clock(|| Utc.with_ymd_and_hms(2030, 1, 1, 10, 0, 0).unwrap()),
    );
    let executor = Arc::new(RecordingExecutor::default());
    let relay = ExecutionRelay::new(Arc::clone(&scheduler), executor.clone());

    let mut config = GitsConfig::default();
    config.gateway.local_clock = false;
    config.fire.auth_mode = auth_mode;
    config.fire.secret = secret.map(String::from);

    TestApp {
        router: build_router(Arc::new(AppState::new(config, scheduler, relay))),
        executor,
        _content_dir: content_dir,
    }
}

fn app() -> TestApp {
    app_with(FireAuthMode::None, None)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post(uri: &str, body: &Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn push_request(user: &str, at: &str) -> Value {
    json!({
        "user_id": user,
        "action": {"kind": "push", "force": false},
        "schedule_time": at,
        "repo_url": REPO,
    })
}

fn fire_body(job_id: &str, user: &str) -> String {
    let envelope = FireEnvelope {
        rule: job_id.to_string(),
        input: TargetInput::default()
            .with(keys::JOB_ID, job_id)
            .with(keys::USER_ID, user),
    };
    serde_json::to_string(&envelope).unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let t = app();
    let (status, body) = send(&t.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["local_clock"], false);
    assert!(body["commit"].is_string());
}

#[tokio::test]
async fn schedule_then_status_and_jobs() {
    let t = app();
    let (status, body) = send(&t.router, post("/schedule", &push_request("alice", "2030-01-01T10:05"))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["schedule_time"], "2030-01-01T10:05Z");
    assert_eq!(body["status"], "pending");
    assert_eq!(body["cron_expression"], "cron(5 10 1 1 ? 2030)");
    assert!(body.get("content_ref").is_none());
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, body) = send(&t.router, get("/status?user_id=alice")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_id"], job_id);
    assert_eq!(body["status"], "pending");

    let (status, body) = send(&t.router, get("/jobs?user_id=alice")).await;
    assert_eq!(status, StatusCode::OK);
    let jobs = body["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["action"]["kind"], "push");
}

#[tokio::test]
async fn schedule_with_content_returns_ref() {
    let t = app();
    let mut req = push_request("alice", "2030-01-01T11:00");
    req["action"] = json!({"kind": "commit", "message": "nightly"});
    req["content"] = json!({"filename": "gits-changes-1.json", "base64": "e30="});

    let (status, body) = send(&t.router, post("/schedule", &req)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(body["content_ref"].as_str().unwrap().starts_with("file://"));
}

#[tokio::test]
async fn schedule_rejections() {
    let t = app();

    let (status, body) = send(&t.router, post("/schedule", &push_request("alice", "2029-12-31T23:59"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "NOT_IN_FUTURE");
    assert_eq!(body["error"], "Schedule time must be in the future.");

    let (status, body) = send(&t.router, post("/schedule", &push_request("alice", "tomorrow"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_FORMAT");

    let mut bad_content = push_request("alice", "2030-01-01T11:00");
    bad_content["content"] = json!({"filename": "x.json", "base64": "!!!"});
    let (status, body) = send(&t.router, post("/schedule", &bad_content)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");

    let raw = Request::post("/schedule").body(Body::from("{not json")).unwrap();
    let (status, body) = send(&t.router, raw).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");

    // nothing was stored
    let (status, body) = send(&t.router, get("/status?user_id=alice")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "JOB_NOT_FOUND");
}

#[tokio::test]
async fn status_requires_user_id() {
    let t = app();
    let (status, body) = send(&t.router, get("/status")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn delete_twice_then_not_found() {
    let t = app();
    let (_, body) = send(&t.router, post("/schedule", &push_request("alice", "2030-01-01T10:05"))).await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let del = json!({"user_id": "alice", "job_id": job_id});
    let (status, body) = send(&t.router, post("/delete", &del)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);

    let (status, body) = send(&t.router, post("/delete", &del)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "JOB_NOT_FOUND");
}

#[tokio::test]
async fn delete_by_other_owner_is_not_found() {
    let t = app();
    let (_, body) = send(&t.router, post("/schedule", &push_request("alice", "2030-01-01T10:05"))).await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, _) = send(&t.router, post("/delete", &json!({"user_id": "mallory", "job_id": job_id}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(&t.router, get("/status?user_id=alice")).await;
    assert_eq!(body["status"], "pending");
}

#[tokio::test]
async fn delete_with_malformed_job_id_is_bad_request() {
    let t = app();
    for bad in ["gits 1", "../../etc", ""] {
        let (status, body) = send(&t.router, post("/delete", &json!({"user_id": "alice", "job_id": bad}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{bad}");
        assert_eq!(body["code"], "INVALID_REQUEST");
    }
}

#[tokio::test]
async fn fire_runs_job_once() {
    let t = app();
    let (_, body) = send(&t.router, post("/schedule", &push_request("alice", "2030-01-01T10:05"))).await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let fire = || {
        Request::post("/fire")
            .body(Body::from(fire_body(&job_id, "alice")))
            .unwrap()
    };
    let (status, body) = send(&t.router, fire()).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["outcome"], "succeeded");

    let (status, body) = send(&t.router, fire()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "discarded");
    assert_eq!(t.executor.calls.lock().unwrap().len(), 1);

    let (_, body) = send(&t.router, get("/status?user_id=alice")).await;
    assert_eq!(body["status"], "succeeded");
}

#[tokio::test]
async fn fire_with_garbage_is_bad_request() {
    let t = app();
    let req = Request::post("/fire").body(Body::from("[]")).unwrap();
    let (status, body) = send(&t.router, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_ENVELOPE");
}

#[tokio::test]
async fn fire_hmac_is_enforced() {
    let t = app_with(FireAuthMode::HmacSha256, Some("s3cret"));
    let body = fire_body("gits-unknown", "alice");

    let unsigned = Request::post("/fire").body(Body::from(body.clone())).unwrap();
    let (status, resp) = send(&t.router, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(resp["code"], "UNAUTHORIZED");

    let signed = Request::post("/fire")
        .header(SIGNATURE_HEADER, sign("s3cret", body.as_bytes()).unwrap())
        .body(Body::from(body))
        .unwrap();
    let (status, resp) = send(&t.router, signed).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["outcome"], "discarded");
    assert_eq!(resp["reason"], "missing");
}

#[tokio::test]
async fn fire_bearer_is_enforced() {
    let t = app_with(FireAuthMode::BearerToken, Some("tok"));
    let body = fire_body("gits-unknown", "alice");

    let wrong = Request::post("/fire")
        .header("authorization", "Bearer nope")
        .body(Body::from(body.clone()))
        .unwrap();
    assert_eq!(send(&t.router, wrong).await.0, StatusCode::UNAUTHORIZED);

    let right = Request::post("/fire")
        .header("authorization", "Bearer tok")
        .body(Body::from(body))
        .unwrap();
    assert_eq!(send(&t.router, right).await.0, StatusCode::OK);
}
