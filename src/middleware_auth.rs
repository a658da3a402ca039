//! Admin authentication middleware
//!
//! HTTP middleware guarding the `/admin` route tree. Operator requests carry
//! a static API key in the `x-admin-key` header; anything else is rejected
//! before reaching a handler. The visitor-facing tracking and webhook routes
//! are outside this guard.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::error::AppError;

/// Validates the admin API key on every `/admin` request
pub async fn admin_auth_middleware(
    State(state): State<crate::AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let provided = request
        .headers()
        .get("x-admin-key")
        .and_then(|value| value.to_str().ok());

    match provided {
        Some(key) if key == state.config.admin.api_key => Ok(next.run(request).await),
        Some(_) => {
            warn!("Admin request with invalid API key");
            Err(AppError::Auth("Invalid admin API key".to_string()))
        }
        None => {
            warn!("Admin request without API key");
            Err(AppError::Auth("Missing admin API key".to_string()))
        }
    }
}
