use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use crate::app::services::TriggerError;

pub fn trigger_error_to_response(err: TriggerError) -> axum::response::Response {
    match err {
        TriggerError::InvalidReference(e) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_order_reference", e.to_string())
        }
        TriggerError::Encoding(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "encoding_error", e.to_string())
        }
        TriggerError::Publish(e) => json_error(StatusCode::BAD_GATEWAY, "publish_error", e.to_string()),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
