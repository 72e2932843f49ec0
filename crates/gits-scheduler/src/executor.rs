//! Git execution seam and the local `git` subprocess backend.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gits_core::{ContentBundle, JobId};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{content::ContentStore, types::JobAction};

/// Captured output beyond this many characters is cut in the middle.
pub const MAX_OUTPUT_CHARS: usize = 8_000;

/// Everything the executor gets to run one fired job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub job_id: JobId,
    pub action: JobAction,
    pub repo_url: String,
    pub credential_ref: Option<String>,
    pub content_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub exit_code: i32,
    pub output: String,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Failures to run git at all, as opposed to git exiting non-zero.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to start git: {0}")]
    Spawn(String),

    #[error("git timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("could not apply change content: {0}")]
    Content(String),
}

#[async_trait]
pub trait GitExecutor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionReport, ExecutorError>;
}

/// Runs `git` in a fixed working tree via `tokio::process`.
///
/// Change content, when referenced, is written into the tree first. Steps run
/// in order and stop at the first non-zero exit.
pub struct CommandGitExecutor {
    program: String,
    workdir: PathBuf,
    timeout: Duration,
    content: Option<Arc<dyn ContentStore>>,
}

impl CommandGitExecutor {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: "git".to_string(),
            workdir: workdir.into(),
            timeout,
            content: None,
        }
    }

    /// Resolve `content_ref`s through `store`.
    pub fn with_content(mut self, store: Arc<dyn ContentStore>) -> Self {
        self.content = Some(store);
        self
    }

    /// Run something other than `git` from `PATH`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn load_bundle(&self, content_ref: &str) -> Result<ContentBundle, ExecutorError> {
        let store = self
            .content
            .as_ref()
            .ok_or_else(|| ExecutorError::Content("no content store configured".to_string()))?;
        let bytes = store
            .get(content_ref)
            .await
            .map_err(|e| ExecutorError::Content(e.to_string()))?;
        ContentBundle::from_bytes(&bytes).map_err(|e| ExecutorError::Content(e.to_string()))
    }

    async fn run_step(
        &self,
        request: &ExecutionRequest,
        args: &[String],
    ) -> Result<ExecutionReport, ExecutorError> {
        debug!(job_id = %request.job_id, ?args, "running git step");

        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GITS_JOB_ID", request.job_id.as_str())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cred) = &request.credential_ref {
            cmd.env("GITS_CREDENTIAL_REF", cred);
        }
        if let Some(content_ref) = &request.content_ref {
            cmd.env("GITS_CONTENT_REF", content_ref);
        }

        let child = cmd
            .spawn()
            .map_err(|e| ExecutorError::Spawn(format!("{}: {e}", self.program)))?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecutorError::Timeout {
                secs: self.timeout.as_secs(),
            })?
            .map_err(|e| ExecutorError::Spawn(e.to_string()))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ExecutionReport {
            exit_code: output.status.code().unwrap_or(-1),
            output: text,
        })
    }
}

#[async_trait]
impl GitExecutor for CommandGitExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionReport, ExecutorError> {
        let mut staged = Vec::new();
        if let Some(content_ref) = &request.content_ref {
            let bundle = self.load_bundle(content_ref).await?;
            apply_bundle(&self.workdir, &bundle).await?;
            staged = bundle.paths().map(str::to_string).collect();
            info!(job_id = %request.job_id, paths = staged.len(), "change content applied");
        }

        let mut transcript = String::new();
        let mut exit_code = 0;
        for args in plan(&request.action, &request.repo_url, &staged) {
            let report = self.run_step(request, &args).await?;
            transcript.push_str(&format!("$ git {}\n{}", args.join(" "), report.output));
            exit_code = report.exit_code;
            if !report.succeeded() {
                warn!(job_id = %request.job_id, exit_code, ?args, "git step failed");
                break;
            }
        }

        Ok(ExecutionReport {
            exit_code,
            output: truncate_output(&transcript, MAX_OUTPUT_CHARS),
        })
    }
}

/// Git argument lists for `action`, given the paths written from content.
pub fn plan(action: &JobAction, repo_url: &str, staged: &[String]) -> Vec<Vec<String>> {
    fn owned(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    match action {
        JobAction::Add { pathspecs } => {
            let mut args = owned(&["add", "--"]);
            args.extend(pathspecs.iter().cloned());
            vec![args]
        }
        JobAction::Commit { message } => {
            let mut steps = Vec::new();
            if !staged.is_empty() {
                let mut add = owned(&["add", "-A", "--"]);
                add.extend(staged.iter().cloned());
                steps.push(add);
            }
            steps.push(owned(&["commit", "-m", message.as_str()]));
            steps
        }
        JobAction::Push { force } => {
            let mut args = owned(&["push"]);
            if *force {
                args.push("--force".to_string());
            }
            args.push(if repo_url.is_empty() { "origin" } else { repo_url }.to_string());
            args.push("HEAD".to_string());
            vec![args]
        }
    }
}

/// Write bundle files into `root` and remove its deletions.
async fn apply_bundle(root: &Path, bundle: &ContentBundle) -> Result<(), ExecutorError> {
    let files = bundle
        .decoded_files()
        .map_err(|e| ExecutorError::Content(e.to_string()))?;
    for (rel, bytes) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExecutorError::Content(format!("{}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ExecutorError::Content(format!("{}: {e}", path.display())))?;
    }
    for rel in &bundle.deleted {
        let path = root.join(rel);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ExecutorError::Content(format!("{}: {e}", path.display()))),
        }
    }
    Ok(())
}

/// Keep the head and tail of long output, cutting on char boundaries.
fn truncate_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_owned();
    }
    let half = max_chars / 2;
    let head: String = output.chars().take(half).collect();
    let tail: String = output.chars().skip(total - half).collect();
    format!(
        "{head}\n... [{} chars omitted] ...\n{tail}",
        total - 2 * half
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::FsContentStore;

    fn request(action: JobAction) -> ExecutionRequest {
        ExecutionRequest {
            job_id: "gits-test".into(),
            action,
            repo_url: "https://github.com/acme/app.git".to_string(),
            credential_ref: None,
            content_ref: None,
        }
    }

    #[test]
    fn plans_per_action() {
        let add = plan(
            &JobAction::Add {
                pathspecs: vec!["b".into(), "a".into()],
            },
            "",
            &[],
        );
        assert_eq!(add, vec![vec!["add", "--", "b", "a"]]);

        let commit = plan(
            &JobAction::Commit {
                message: "msg".into(),
            },
            "",
            &["x.txt".to_string()],
        );
        assert_eq!(
            commit,
            vec![vec!["add", "-A", "--", "x.txt"], vec!["commit", "-m", "msg"]]
        );

        let push = plan(&JobAction::Push { force: true }, "git@github.com:a/b.git", &[]);
        assert_eq!(
            push,
            vec![vec!["push", "--force", "git@github.com:a/b.git", "HEAD"]]
        );
        let push = plan(&JobAction::Push { force: false }, "", &[]);
        assert_eq!(push, vec![vec!["push", "origin", "HEAD"]]);
    }

    #[test]
    fn truncation_keeps_both_ends() {
        let s = format!("{}{}", "a".repeat(50), "z".repeat(50));
        let t = truncate_output(&s, 20);
        assert!(t.starts_with("aaaaaaaaaa\n"));
        assert!(t.ends_with("\nzzzzzzzzzz"));
        assert!(t.contains("[80 chars omitted]"));
        assert_eq!(truncate_output("short", 20), "short");
    }

    #[tokio::test]
    async fn bundle_is_applied_before_git_runs() {
        let tree = tempfile::tempdir().unwrap();
        let uploads = tempfile::tempdir().unwrap();
        std::fs::write(tree.path().join("gone.txt"), "old").unwrap();

        let store = Arc::new(FsContentStore::new(uploads.path()));
        let mut bundle = ContentBundle::default();
        bundle.add_file("src/new.txt", b"hello").unwrap();
        bundle.add_deleted("gone.txt").unwrap();
        let content_ref = store
            .put(&"u1".into(), "b.json", &bundle.to_bytes().unwrap())
            .await
            .unwrap();

        let exec = CommandGitExecutor::new(tree.path(), Duration::from_secs(10))
            .with_content(store)
            .with_program("true");
        let mut req = request(JobAction::Commit {
            message: "apply".into(),
        });
        req.content_ref = Some(content_ref);

        let report = exec.execute(&req).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(
            std::fs::read_to_string(tree.path().join("src/new.txt")).unwrap(),
            "hello"
        );
        assert!(!tree.path().join("gone.txt").exists());
        assert!(report.output.contains("$ git add -A -- src/new.txt gone.txt"));
        assert!(report.output.contains("$ git commit -m apply"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_raised() {
        let tree = tempfile::tempdir().unwrap();
        let exec =
            CommandGitExecutor::new(tree.path(), Duration::from_secs(10)).with_program("false");
        let report = exec.execute(&request(JobAction::Push { force: false })).await.unwrap();
        assert!(!report.succeeded());
        assert_ne!(report.exit_code, 0);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let tree = tempfile::tempdir().unwrap();
        let exec = CommandGitExecutor::new(tree.path(), Duration::from_secs(10))
            .with_program("gits-no-such-binary");
        let err = exec
            .execute(&request(JobAction::Push { force: false }))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn(_)));
    }

    #[tokio::test]
    async fn content_without_store_is_refused() {
        let tree = tempfile::tempdir().unwrap();
        let exec =
            CommandGitExecutor::new(tree.path(), Duration::from_secs(10)).with_program("true");
        let mut req = request(JobAction::Commit { message: "m".into() });
        req.content_ref = Some("file:///nowhere.json".into());
        assert!(matches!(
            exec.execute(&req).await,
            Err(ExecutorError::Content(_))
        ));
    }
}
