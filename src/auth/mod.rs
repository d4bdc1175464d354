//! Credentials and request authorization.

pub mod password;
pub mod token;

pub use password::{hash_password, verify_password, PasswordError};
pub use token::{Claims, TokenError, TokenIssuer};

use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, State},
    http::{request::Parts, HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::AppState;

/// Extract the bearer token from request headers
fn extract_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Claims, ApiError> {
    let token = extract_token(headers)
        .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;
    state.tokens.validate(token).map_err(|e| match e {
        TokenError::Expired => ApiError::unauthorized("Session expired, please log in again"),
        _ => ApiError::unauthorized("Invalid token"),
    })
}

/// Caller identity taken from a valid bearer token
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if let Some(claims) = parts.extensions.get::<Claims>() {
            return Ok(AuthUser(claims.clone()));
        }
        authenticate(state, &parts.headers).map(AuthUser)
    }
}

/// Middleware guarding administrator routes
pub async fn admin_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let claims = authenticate(&state, request.headers())?;
    if !claims.role.is_admin() {
        tracing::warn!(user_id = %claims.id, role = claims.role.as_str(), "Non-admin tried an admin route");
        return Err(ApiError::forbidden("Administrator access required"));
    }
    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}
