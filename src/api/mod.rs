//! HTTP API for the chime scheduler.
//!
//! A thin CRUD surface over the store plus control endpoints backed by the
//! scheduler handle. Scheduling semantics live in the core; this layer only
//! validates, shapes JSON, and forwards.

mod errors;
mod handlers;
mod responses;

pub use errors::ApiError;
pub use handlers::ApiState;
pub use responses::*;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::store::JobStore;

/// Build the API router over the given state.
pub fn router<S: JobStore + 'static>(state: ApiState<S>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health::<S>))
        .route(
            "/api/v1/jobs",
            post(handlers::create_job::<S>).get(handlers::list_jobs::<S>),
        )
        .route(
            "/api/v1/jobs/:job_id",
            get(handlers::get_job::<S>)
                .put(handlers::update_job::<S>)
                .delete(handlers::delete_job::<S>),
        )
        .route("/api/v1/jobs/:job_id/run", post(handlers::run_job::<S>))
        .route("/api/v1/jobs/:job_id/pause", post(handlers::pause_job::<S>))
        .route("/api/v1/jobs/:job_id/resume", post(handlers::resume_job::<S>))
        .route(
            "/api/v1/jobs/:job_id/executions",
            get(handlers::list_executions::<S>),
        )
        .route("/api/v1/jobs/:job_id/stats", get(handlers::job_stats::<S>))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
