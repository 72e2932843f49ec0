use std::path::Path;

use chrono::Utc;
use clap::{Parser, Subcommand};
use gits_core::bundle::BUNDLE_PREFIX;
use gits_core::config::{default_config_path, ClientConfig, GitsConfig};
use gits_scheduler::{scheduler::validate_repo_url, timespec, JobAction};
use tracing::{debug, info};

use crate::api::{ApiClient, ContentPayload, SchedulePayload};
use crate::changes::{all_changes, build_bundle, selected_changes, split_file_args};
use crate::error::{CliError, Result};
use crate::git::Repo;

/// Schedule git commits, adds and pushes for later.
#[derive(Debug, Parser)]
#[command(name = "gits", version, about)]
pub struct Cli {
    /// Config file; defaults to ~/.gits/gits.toml.
    #[arg(long, global = true, env = "GITS_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Schedule an action at a UTC minute, e.g. 2025-07-17T15:00.
    Schedule(ScheduleArgs),
    /// Show your most recently scheduled job.
    Status,
    /// Cancel a pending job.
    Delete {
        job_id: String,
    },
    /// List all your jobs, newest first.
    Jobs,
}

#[derive(Debug, clap::Args)]
pub struct ScheduleArgs {
    /// UTC time, YYYY-MM-DDTHH:MM with an optional trailing Z.
    pub time: String,

    /// Commit message.
    #[arg(short = 'm', long = "message", conflicts_with_all = ["push", "add"])]
    pub message: Option<String>,

    /// Files to include; repeat the flag or pass a comma-separated list.
    #[arg(short = 'f', long = "file")]
    pub files: Vec<String>,

    /// Push the current branch instead of committing.
    #[arg(long, conflicts_with = "add")]
    pub push: bool,

    /// Force-push.
    #[arg(long, requires = "push")]
    pub force: bool,

    /// Stage the selected files without committing.
    #[arg(long)]
    pub add: bool,
}

impl ScheduleArgs {
    /// The action to schedule and whether it ships working-tree content.
    pub fn action(&self, files: &[String]) -> Result<(JobAction, bool)> {
        if self.push {
            return Ok((JobAction::Push { force: self.force }, false));
        }
        if self.add {
            let pathspecs = if files.is_empty() {
                vec![".".to_string()]
            } else {
                files.to_vec()
            };
            return Ok((JobAction::Add { pathspecs }, true));
        }
        match self.message.as_deref().map(str::trim) {
            Some(m) if !m.is_empty() => Ok((
                JobAction::Commit {
                    message: m.to_string(),
                },
                true,
            )),
            _ => Err(CliError::Usage(
                "a commit needs -m <MESSAGE>; use --push or --add for other actions".to_string(),
            )),
        }
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let client_cfg = GitsConfig::load(Some(config_path.as_str()))?.client;
    let api = ApiClient::new(&client_cfg.api_url)?;
    let user_id = |cfg: &ClientConfig| {
        cfg.user_id.clone().ok_or_else(|| CliError::MissingConfig {
            key: "user_id",
            path: config_path.clone(),
        })
    };

    match cli.command {
        Command::Schedule(args) => {
            let user = user_id(&client_cfg)?;
            schedule(&api, &client_cfg, user, args).await
        }
        Command::Status => {
            let s = api.status(&user_id(&client_cfg)?).await?;
            println!("{}  {}  {}", s.job_id, s.schedule_time, s.status);
            Ok(())
        }
        Command::Delete { job_id } => {
            api.delete(&user_id(&client_cfg)?, &job_id).await?;
            println!("Deleted job {job_id}");
            Ok(())
        }
        Command::Jobs => {
            let jobs = api.jobs(&user_id(&client_cfg)?).await?;
            if jobs.is_empty() {
                println!("No scheduled jobs.");
            }
            for j in jobs {
                match j.error {
                    Some(e) => println!(
                        "{}  {}  {:<6}  {}  ({})",
                        j.job_id,
                        j.schedule_time,
                        j.action.kind(),
                        j.status,
                        first_line(&e)
                    ),
                    None => println!(
                        "{}  {}  {:<6}  {}",
                        j.job_id,
                        j.schedule_time,
                        j.action.kind(),
                        j.status
                    ),
                }
            }
            Ok(())
        }
    }
}

async fn schedule(
    api: &ApiClient,
    cfg: &ClientConfig,
    user_id: String,
    args: ScheduleArgs,
) -> Result<()> {
    // Same rules the gateway applies; failing here saves the round trip.
    let at = timespec::normalize(&args.time, Utc::now())?;

    let repo = Repo::discover().await?;
    let repo_url = repo.origin_url().await?;
    validate_repo_url(&repo_url).map_err(CliError::RepoUrl)?;

    let files: Vec<String> = split_file_args(&args.files)
        .iter()
        .map(|f| repo.to_root_relative(f))
        .collect();
    let (action, ships_content) = args.action(&files)?;

    let content = if ships_content {
        Some(collect_content(&repo, &files).await?)
    } else {
        None
    };

    let payload = SchedulePayload {
        user_id,
        action,
        schedule_time: at.canonical.clone(),
        repo_url,
        credential_ref: cfg.credential_ref.clone(),
        content,
    };
    let scheduled = api.schedule(&payload).await?;
    info!(job_id = %scheduled.job_id, "scheduled");

    println!(
        "Successfully scheduled {} for {} ({}), status {}",
        scheduled.job_id, scheduled.schedule_time, scheduled.cron_expression, scheduled.status
    );
    if let Some(content_ref) = scheduled.content_ref {
        debug!(content_ref = %content_ref, "content uploaded");
    }
    Ok(())
}

async fn collect_content(repo: &Repo, files: &[String]) -> Result<ContentPayload> {
    let status = repo.status().await?;
    let root: &Path = &repo.root;
    let exists = |p: &str| root.join(p).exists();

    let changes = if files.is_empty() {
        all_changes(&status, exists)?
    } else {
        selected_changes(&status, files, exists)?
    };
    debug!(
        files = changes.files.len(),
        deleted = changes.deleted.len(),
        "collected changes"
    );

    let bundle = build_bundle(root, &changes)?;
    let filename = format!("{BUNDLE_PREFIX}{}.json", Utc::now().timestamp());
    Ok(ContentPayload::new(filename, &bundle.to_bytes()?))
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or_default()
}
