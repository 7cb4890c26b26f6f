use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Extension, Router,
};
use clubhouse_core::AuthenticatedUser;
use uuid::Uuid;

use crate::error::AppError;
use crate::extract::PathParam;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/statements/{payout_id}", get(get_statement))
}

async fn get_statement(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    PathParam(payout_id): PathParam<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let statement = state.statements.read(&user, payout_id).await?;
    Ok(([(header::CONTENT_TYPE, state.statements.content_type())], statement.content))
}
