use axum::{
    extract::State,
    http::StatusCode,
    routing::post,
    Extension, Json, Router,
};
use clubhouse_core::models::BookingStatus;
use clubhouse_core::AuthenticatedUser;
use clubhouse_ledger::RecordBooking;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppError;
use crate::extract::{JsonBody, PathParam};
use crate::middleware::require_operator;
use crate::response::success;
use crate::state::AppState;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct QuoteRequest {
    pub offer_id: Uuid,
    #[serde(default = "one")]
    pub quantity: u32,
}

#[derive(Debug, Deserialize)]
pub struct RecordBookingRequest {
    pub offer_id: Uuid,
    pub subscriber_id: Uuid,
    #[serde(default = "one")]
    pub quantity: u32,
    pub payment_intent_id: Option<String>,
    #[serde(default = "initial_status")]
    pub status: BookingStatus,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub reason: String,
}

fn one() -> u32 {
    1
}

fn initial_status() -> BookingStatus {
    BookingStatus::Pending
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/bookings/quote", post(quote))
        .route("/v1/bookings", post(record_booking))
        .route("/v1/bookings/{id}/cancel", post(cancel_booking))
}

// ============================================================================
// Handlers
// ============================================================================

async fn quote(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<QuoteRequest>,
) -> Result<Json<Value>, AppError> {
    let snapshot = state.bookings.quote(req.offer_id, req.quantity).await?;
    Ok(success(snapshot))
}

/// Called by the checkout flow once payment is collected.
async fn record_booking(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    JsonBody(req): JsonBody<RecordBookingRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    require_operator(&user)?;
    let booking = state
        .bookings
        .record(RecordBooking {
            offer_id: req.offer_id,
            subscriber_id: req.subscriber_id,
            quantity: req.quantity,
            payment_intent_id: req.payment_intent_id,
            status: req.status,
        })
        .await?;
    Ok((StatusCode::CREATED, success(booking)))
}

async fn cancel_booking(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    PathParam(booking_id): PathParam<Uuid>,
    JsonBody(req): JsonBody<CancelRequest>,
) -> Result<Json<Value>, AppError> {
    let outcome = state.cancellations.cancel(&user, booking_id, &req.reason).await?;
    Ok(success(outcome))
}
