//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: stores, queue and orchestrator wiring
//! - `routes/`: HTTP handlers (one file per area)
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{
    Extension, Router,
    routing::{get, post},
};
use tower::ServiceBuilder;

use canopy_infra::CanopyConfig;

use crate::middleware::{self, CallbackAuth};

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the services from configuration and the router on top of them.
pub async fn build_app(config: &CanopyConfig) -> anyhow::Result<(Router, Arc<AppServices>)> {
    let services = Arc::new(services::build_services(config).await?);
    Ok((build_router(services.clone()), services))
}

/// Full HTTP router over already-built services.
pub fn build_router(services: Arc<AppServices>) -> Router {
    let callback_auth = CallbackAuth {
        token: services.config.processing.callback_token.clone(),
    };

    let callbacks = Router::new()
        .route("/pipeline/callback", post(routes::pipeline::callback))
        .layer(axum::middleware::from_fn_with_state(
            callback_auth,
            middleware::callback_token_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/analyses", routes::analyses_router())
        .nest("/jobs", routes::jobs_router())
        .merge(callbacks)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
