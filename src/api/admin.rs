//! Administrator endpoints. Every route here sits behind `admin_middleware`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{validate_email, validate_id, validate_name, validate_optional_name};
use crate::auth::AuthUser;
use crate::lifecycle::{Delivery, LinkIssued, NewAccount};
use crate::store::{Role, UserResponse, UserStatus};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListUsersQuery {
    /// `pending` (default), `approved`, `rejected`, `denied` or `all`
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountRequest {
    pub email: String,
    pub first_name: String,
    #[serde(default)]
    pub middle_name: Option<String>,
    pub last_name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub department_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FacultyLinkRequest {
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignDepartmentRequest {
    pub department_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkResponse {
    pub message: String,
    pub user: UserResponse,
    pub expires_at: DateTime<Utc>,
    pub email_sent: bool,
}

impl From<Delivery<LinkIssued>> for LinkResponse {
    fn from(receipt: Delivery<LinkIssued>) -> Self {
        let message = if receipt.delivered {
            "Verification link sent"
        } else {
            "Verification link created but the email could not be sent"
        };
        Self {
            message: message.to_string(),
            user: receipt.value.user.into(),
            expires_at: receipt.value.expires_at,
            email_sent: receipt.delivered,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeniedResponse {
    pub message: String,
    pub id: String,
    pub email: String,
}

fn parse_status_filter(raw: Option<&str>) -> Result<Option<UserStatus>, ApiError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(Some(UserStatus::Pending)),
        Some(s) if s.eq_ignore_ascii_case("all") => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e: String| ApiError::validation_field("status", e)),
    }
}

fn check_user_id(id: &str) -> Result<(), ApiError> {
    validate_id(id, "User ID").map_err(|m| ApiError::validation_field("id", m))
}

/// GET /api/admin/users?status=
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListUsersQuery>,
) -> Result<Json<Vec<UserResponse>>, ApiError> {
    let status = parse_status_filter(query.status.as_deref())?;
    let users = state
        .accounts
        .users(status)
        .into_iter()
        .map(UserResponse::from)
        .collect();
    Ok(Json(users))
}

/// POST /api/admin/users
pub async fn create_account(
    State(state): State<Arc<AppState>>,
    AuthUser(admin): AuthUser,
    Json(req): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<LinkResponse>), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    errors
        .check("email", validate_email(&req.email))
        .check("firstName", validate_name(&req.first_name, "First name"))
        .check("middleName", validate_optional_name(&req.middle_name, "Middle name"))
        .check("lastName", validate_name(&req.last_name, "Last name"));
    let role = match req.role.as_deref() {
        None | Some("") => Role::Faculty,
        Some(raw) => match raw.parse::<Role>() {
            Ok(role) => role,
            Err(e) => {
                errors.add("role", e);
                Role::Faculty
            }
        },
    };
    errors.finish()?;

    let receipt = state
        .accounts
        .create_account(
            &admin,
            NewAccount {
                email: req.email,
                first_name: req.first_name.trim().to_string(),
                middle_name: req.middle_name,
                last_name: req.last_name.trim().to_string(),
                role,
                department_id: req.department_id,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(receipt.into())))
}

/// POST /api/admin/users/:id/approve
pub async fn approve_user(
    State(state): State<Arc<AppState>>,
    AuthUser(admin): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<UserResponse>, ApiError> {
    check_user_id(&id)?;
    let user = state.accounts.approve(&admin, &id).await?;
    Ok(Json(user.into()))
}

/// POST /api/admin/users/:id/reject
pub async fn reject_user(
    State(state): State<Arc<AppState>>,
    AuthUser(admin): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<UserResponse>, ApiError> {
    check_user_id(&id)?;
    let user = state.accounts.reject(&admin, &id).await?;
    Ok(Json(user.into()))
}

/// DELETE /api/admin/users/:id
pub async fn deny_user(
    State(state): State<Arc<AppState>>,
    AuthUser(admin): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<DeniedResponse>, ApiError> {
    check_user_id(&id)?;
    let user = state.accounts.deny(&admin, &id).await?;
    Ok(Json(DeniedResponse {
        message: "Registration denied and removed".to_string(),
        id: user.id,
        email: user.email,
    }))
}

/// POST /api/admin/users/:id/faculty-link
pub async fn issue_faculty_link(
    State(state): State<Arc<AppState>>,
    AuthUser(admin): AuthUser,
    Path(id): Path<String>,
    body: Option<Json<FacultyLinkRequest>>,
) -> Result<Json<LinkResponse>, ApiError> {
    check_user_id(&id)?;
    let req = body.map(|Json(b)| b).unwrap_or_default();
    if let Some(email) = req.email.as_deref() {
        validate_email(email).map_err(|m| ApiError::validation_field("email", m))?;
    }

    let receipt = state
        .accounts
        .issue_faculty_link(&admin, &id, req.email.as_deref())
        .await?;
    Ok(Json(receipt.into()))
}

/// PUT /api/admin/users/:id/department
pub async fn assign_department(
    State(state): State<Arc<AppState>>,
    AuthUser(admin): AuthUser,
    Path(id): Path<String>,
    Json(req): Json<AssignDepartmentRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    errors
        .check("id", validate_id(&id, "User ID"))
        .check("departmentId", validate_id(&req.department_id, "Department ID"));
    errors.finish()?;

    let user = state
        .accounts
        .assign_department(&admin, &id, req.department_id.trim())
        .await?;
    Ok(Json(user.into()))
}
