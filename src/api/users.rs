use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use super::error::ApiError;
use crate::auth::AuthUser;
use crate::store::UserResponse;
use crate::AppState;

/// GET /api/users/:id - administrators, or the account owner
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<UserResponse>, ApiError> {
    if !claims.can_access_user(&id) {
        return Err(ApiError::forbidden("You can only view your own account"));
    }

    let user = state
        .accounts
        .user(&id)
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(Json(user.into()))
}
