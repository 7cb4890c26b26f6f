use axum::{extract::State, routing::post, Extension, Json, Router};
use clubhouse_core::models::DebitOutcome;
use clubhouse_core::{AuthenticatedUser, Money};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::AppError;
use crate::extract::JsonBody;
use crate::response::success;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DebitRequest {
    pub partner_id: Uuid,
    pub amount: Money,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/wallet/debit", post(debit_wallet))
}

/// The debited user is always the token subject.
async fn debit_wallet(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    JsonBody(req): JsonBody<DebitRequest>,
) -> Result<Json<Value>, AppError> {
    match state.wallet.debit(&user, req.partner_id, req.amount).await? {
        DebitOutcome::Completed(transaction) => Ok(success(transaction)),
        // Declined debits are a business outcome, not a transport error.
        DebitOutcome::InsufficientFunds { balance, requested } => Ok(Json(json!({
            "success": false,
            "error": "Insufficient wallet balance",
            "code": "insufficient_funds",
            "balance": balance,
            "requested": requested,
        }))),
    }
}
