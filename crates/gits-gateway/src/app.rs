use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use gits_core::config::{GitsConfig, MAX_BODY_BYTES};
use gits_scheduler::{ExecutionRelay, JobScheduler};

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: GitsConfig,
    pub scheduler: Arc<JobScheduler>,
    /// Fire path for `/fire`; the local clock drives its own clone.
    pub relay: ExecutionRelay,
}

impl AppState {
    pub fn new(config: GitsConfig, scheduler: Arc<JobScheduler>, relay: ExecutionRelay) -> Self {
        Self {
            config,
            scheduler,
            relay,
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/schedule", post(crate::http::jobs::schedule_handler))
        .route("/delete", post(crate::http::jobs::delete_handler))
        .route("/status", get(crate::http::jobs::status_handler))
        .route("/jobs", get(crate::http::jobs::jobs_handler))
        .route("/fire", post(crate::http::fire::fire_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
