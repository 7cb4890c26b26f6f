use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use clubhouse_core::LedgerError;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl AppError {
    /// Status, stable error code, client-facing message, needsSync flag.
    fn parts(&self) -> (StatusCode, &'static str, String, bool) {
        match self {
            AppError::Unauthenticated(msg) => (StatusCode::UNAUTHORIZED, "unauthenticated", msg.clone(), false),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg.clone(), false),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Rate limit exceeded".to_string(),
                false,
            ),
            AppError::Ledger(err) => match err {
                LedgerError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone(), false),
                LedgerError::InvalidAmount(msg) => (StatusCode::BAD_REQUEST, "invalid_amount", msg.clone(), false),
                LedgerError::Unauthorized(msg) => (StatusCode::FORBIDDEN, "forbidden", msg.clone(), false),
                LedgerError::NotFound { needs_sync, .. } => {
                    (StatusCode::NOT_FOUND, "not_found", err.to_string(), *needs_sync)
                }
                LedgerError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), false),
                LedgerError::External(_) => (
                    StatusCode::BAD_GATEWAY,
                    "payment_processor_error",
                    "Payment processor request failed; nothing was changed".to_string(),
                    false,
                ),
                LedgerError::Store(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal Server Error".to_string(),
                    false,
                ),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, needs_sync) = self.parts();

        let mut body = json!({
            "success": false,
            "error": message,
            "code": code,
        });

        if status == StatusCode::BAD_GATEWAY {
            tracing::warn!(error = %self, "Payment processor error");
        } else if status.is_server_error() {
            let reference = Uuid::new_v4().simple().to_string();
            tracing::error!(support_ref = %reference, error = %self, "Request failed");
            body["reference"] = json!(reference);
        }
        if needs_sync {
            body["needsSync"] = json!(true);
        }

        (status, Json(body)).into_response()
    }
}
