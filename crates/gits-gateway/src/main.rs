use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gits_core::config::{FireAuthMode, GitsConfig};
use gits_gateway::app;
use gits_scheduler::{
    CommandGitExecutor, ContentStore, ExecutionRelay, FsContentStore, JobScheduler,
    SqliteJobStore, SqliteTriggerRegistry, TriggerClock,
};
use rusqlite::Connection;
use tracing::{info, warn};

/// HTTP front end for scheduled git actions.
#[derive(Debug, Parser)]
#[command(name = "gits-gateway", version, about)]
struct Args {
    /// Config file; defaults to ~/.gits/gits.toml.
    #[arg(long, env = "GITS_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "gits_gateway=info,gits_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let args = Args::parse();
    let config = GitsConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        GitsConfig::default()
    });

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");

    let min_lease = config.git.timeout_secs + 60;
    if config.scheduler.claim_lease_secs < min_lease {
        warn!(
            configured = config.scheduler.claim_lease_secs,
            used = min_lease,
            "claim lease must outlast the git timeout; raising it"
        );
    }
    let lease = Duration::from_secs(config.scheduler.claim_lease_secs.max(min_lease));

    // job store and trigger registry each own a connection to the same file
    let store = SqliteJobStore::new(open_db(&db_path)?)?.with_claim_lease(lease);
    let registry = SqliteTriggerRegistry::new(open_db(&db_path)?)?.with_claim_lease(lease);
    info!("database migrations complete");

    let content: Arc<dyn ContentStore> = Arc::new(FsContentStore::new(&config.content.root));

    let workdir = match &config.git.workdir {
        Some(dir) => dir.into(),
        None => std::env::current_dir()?,
    };
    info!(workdir = %workdir.display(), "git actions run in this working tree");
    let executor = CommandGitExecutor::new(workdir, Duration::from_secs(config.git.timeout_secs))
        .with_content(Arc::clone(&content));

    let scheduler = Arc::new(
        JobScheduler::new(Arc::new(store), Arc::new(registry.clone()))
            .with_content(content)
            .with_call_timeout(Duration::from_millis(config.scheduler.call_timeout_ms)),
    );
    let relay = ExecutionRelay::new(Arc::clone(&scheduler), Arc::new(executor));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    if config.gateway.local_clock {
        let (fire_tx, fire_rx) = tokio::sync::mpsc::channel(256);
        let clock = TriggerClock::new(registry, fire_tx);
        tokio::spawn(clock.run(shutdown_rx.clone()));
        tokio::spawn(relay.clone().run(fire_rx, shutdown_rx));
    } else {
        info!("local clock disabled; fires arrive on POST /fire only");
    }

    if config.fire.auth_mode == FireAuthMode::None && !is_loopback(&bind) {
        warn!(bind = %bind, "POST /fire is unauthenticated on a non-loopback address");
    }

    let state = Arc::new(app::AppState::new(config, scheduler, relay));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("gits gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    Ok(())
}

fn open_db(path: &str) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

fn is_loopback(bind: &str) -> bool {
    bind == "localhost"
        || bind
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}
