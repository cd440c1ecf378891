use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, Json};

use crate::app::dto::StatusResponse;
use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn status(Extension(services): Extension<Arc<AppServices>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        mode: services.mode(),
        namespace: services.topology().namespace().to_string(),
        tiers: services.stats(),
        recovery: services.snapshots(),
    })
}
