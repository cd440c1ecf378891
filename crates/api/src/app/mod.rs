//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: bus backend, tier workers and the publish path
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{
    routing::{get, put},
    Extension, Router,
};

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>) -> Router {
    let trigger = format!("{}/:kind/:order", services.admin_trigger_path());

    Router::new()
        .route("/health", get(routes::system::health))
        .route("/status", get(routes::system::status))
        .route(&trigger, put(routes::admin::trigger_order_received))
        .layer(Extension(services))
}
