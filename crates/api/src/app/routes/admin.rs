//! Administrative trigger: inject a synthetic `order-received` event onto
//! the main channel.
//!
//! `kind` is informational only and ends up in the logs.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::info;

use crate::app::dto::TriggerResponse;
use crate::app::{errors, services::AppServices};

pub async fn trigger_order_received(
    Extension(services): Extension<Arc<AppServices>>,
    Path((kind, order)): Path<(String, String)>,
) -> axum::response::Response {
    info!(kind = %kind, order = %order, "admin trigger received");

    // Publishing blocks until the broker acknowledges.
    let result = tokio::task::spawn_blocking(move || services.publish_order_received(&order)).await;

    match result {
        Ok(Ok(published)) => (
            StatusCode::OK,
            Json(TriggerResponse {
                channel: published.channel,
                partition: published.position.partition,
                offset: published.position.offset,
                reference_uri: published.reference_uri,
            }),
        )
            .into_response(),
        Ok(Err(err)) => errors::trigger_error_to_response(err),
        Err(err) => errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            err.to_string(),
        ),
    }
}
