use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{authorization::Bearer, Authorization, HeaderMapExt};
use clubhouse_core::{AuthenticatedUser, Role};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// JWT Claims
// ============================================================================

/// HS256 bearer token issued by the identity service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

impl Claims {
    pub fn into_user(self) -> Result<AuthenticatedUser, AppError> {
        let user_id = Uuid::parse_str(&self.sub)
            .map_err(|_| AppError::Unauthenticated("Token subject is not a user id".to_string()))?;
        let role = self
            .role
            .parse::<Role>()
            .map_err(|_| AppError::Unauthenticated("Token carries an unknown role".to_string()))?;
        Ok(AuthenticatedUser::new(user_id, role))
    }
}

pub fn verify_token(token: &str, secret: &str) -> Result<AuthenticatedUser, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| {
        tracing::debug!(error = %e, "Rejected bearer token");
        AppError::Unauthenticated("Invalid or expired token".to_string())
    })?;
    token_data.claims.into_user()
}

// ============================================================================
// Authentication Middleware
// ============================================================================

/// Verifies the bearer token and injects the caller as `AuthenticatedUser`.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let bearer = req
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .ok_or_else(|| AppError::Unauthenticated("Missing bearer token".to_string()))?;

    let user = verify_token(bearer.token(), &state.auth.secret)?;
    req.extensions_mut().insert(user);

    Ok(next.run(req).await)
}

/// Admin and service callers only.
pub fn require_operator(user: &AuthenticatedUser) -> Result<(), AppError> {
    if user.is_operator() {
        Ok(())
    } else {
        Err(AppError::Forbidden("Operator role required".to_string()))
    }
}
