//! Read-only queries against the local repository.

use std::path::PathBuf;

use tokio::process::Command;
use tracing::debug;

use crate::error::{CliError, Result};

/// One entry of `git status --porcelain -z -M`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub index: char,
    pub worktree: char,
    pub path: String,
    /// Source path of a rename or copy.
    pub orig: Option<String>,
}

impl StatusEntry {
    pub fn is_deleted(&self) -> bool {
        self.index == 'D' || self.worktree == 'D'
    }

    pub fn is_renamed(&self) -> bool {
        self.index == 'R' || self.worktree == 'R'
    }
}

/// The working tree the CLI was started in.
#[derive(Debug, Clone)]
pub struct Repo {
    /// Repository root; porcelain paths are relative to it.
    pub root: PathBuf,
    /// Path of the current directory below `root`, `""` or ending in `/`.
    pub prefix: String,
}

impl Repo {
    /// Fails with [`CliError::NotARepository`] outside a work tree.
    pub async fn discover() -> Result<Self> {
        let inside = git(&["rev-parse", "--is-inside-work-tree"])
            .await
            .map_err(|_| CliError::NotARepository)?;
        if inside.trim() != "true" {
            return Err(CliError::NotARepository);
        }

        let root = git(&["rev-parse", "--show-toplevel"]).await?;
        let prefix = git(&["rev-parse", "--show-prefix"]).await?;
        Ok(Self {
            root: PathBuf::from(root.trim()),
            prefix: prefix.trim().to_string(),
        })
    }

    pub async fn origin_url(&self) -> Result<String> {
        let url = git(&["remote", "get-url", "origin"])
            .await
            .map_err(|_| CliError::NoOrigin)?;
        let url = url.trim();
        if url.is_empty() {
            return Err(CliError::NoOrigin);
        }
        Ok(url.to_string())
    }

    pub async fn status(&self) -> Result<Vec<StatusEntry>> {
        let out = git(&["status", "--porcelain", "-z", "-M"]).await?;
        Ok(parse_porcelain_z(&out))
    }

    /// A path typed by the user, rewritten relative to the repository root.
    pub fn to_root_relative(&self, user_path: &str) -> String {
        let trimmed = user_path.strip_prefix("./").unwrap_or(user_path);
        format!("{}{}", self.prefix, trimmed)
    }
}

/// Parse NUL-separated porcelain v1 output. Renames and copies carry their
/// source path in the following record.
pub fn parse_porcelain_z(out: &str) -> Vec<StatusEntry> {
    let mut entries = Vec::new();
    let mut records = out.split('\0').filter(|r| !r.is_empty());

    while let Some(record) = records.next() {
        let mut chars = record.chars();
        let (Some(index), Some(worktree), Some(' ')) = (chars.next(), chars.next(), chars.next())
        else {
            continue;
        };
        let path = chars.as_str().to_string();
        let orig = if matches!(index, 'R' | 'C') || matches!(worktree, 'R' | 'C') {
            records.next().map(String::from)
        } else {
            None
        };
        entries.push(StatusEntry {
            index,
            worktree,
            path,
            orig,
        });
    }
    entries
}

async fn git(args: &[&str]) -> Result<String> {
    debug!(?args, "running git");
    let output = Command::new("git")
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await?;

    if !output.status.success() {
        return Err(CliError::Git {
            command: args.join(" "),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
