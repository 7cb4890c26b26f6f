use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::Value;

use crate::error::AppError;
use crate::extract::JsonBody;
use crate::response::success;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub session_id: String,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/subscriptions/verify", post(verify_subscription))
}

/// Post-checkout landing: syncs the subscription the session created.
async fn verify_subscription(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<VerifyRequest>,
) -> Result<Json<Value>, AppError> {
    let outcome = state.subscriptions.verify(&req.session_id).await?;
    Ok(success(outcome))
}
