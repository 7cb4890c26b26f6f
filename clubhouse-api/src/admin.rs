use axum::{
    extract::State,
    routing::post,
    Extension, Json, Router,
};
use chrono::{NaiveDate, Utc};
use clubhouse_core::AuthenticatedUser;
use serde::Deserialize;
use serde_json::Value;

use crate::error::AppError;
use crate::extract::QueryParams;
use crate::middleware::require_operator;
use crate::response::success;
use crate::state::AppState;

/// Batch jobs default to today's date; a date can be passed to re-run a past day.
#[derive(Debug, Default, Deserialize)]
pub struct RunDate {
    pub date: Option<NaiveDate>,
}

impl RunDate {
    fn resolve(&self) -> NaiveDate {
        self.date.unwrap_or_else(|| Utc::now().date_naive())
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/admin/payouts/generate", post(generate_payouts))
        .route("/v1/admin/payouts/execute", post(execute_payouts))
        .route("/v1/admin/installments/remind", post(remind_installments))
        .route("/v1/admin/reconciliation/sweep", post(sweep_reconciliation))
}

async fn generate_payouts(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    QueryParams(run): QueryParams<RunDate>,
) -> Result<Json<Value>, AppError> {
    require_operator(&user)?;
    let report = state.payouts.generate(run.resolve()).await?;
    Ok(success(report))
}

async fn execute_payouts(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<Value>, AppError> {
    require_operator(&user)?;
    let report = state.transfers.execute().await?;
    Ok(success(report))
}

async fn remind_installments(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    QueryParams(run): QueryParams<RunDate>,
) -> Result<Json<Value>, AppError> {
    require_operator(&user)?;
    let report = state.reminders.run(run.resolve()).await?;
    Ok(success(report))
}

async fn sweep_reconciliation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<Value>, AppError> {
    require_operator(&user)?;
    let report = state.reconciliation.sweep().await?;
    Ok(success(report))
}
