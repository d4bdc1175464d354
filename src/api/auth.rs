//! Public account endpoints: registration, code verification, sign-in and
//! faculty link completion.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{
    validate_code, validate_email, validate_name, validate_optional_name,
    validate_password_present,
};
use crate::auth::AuthUser;
use crate::lifecycle::{LoginOutcome, Registration, Session};
use crate::store::UserResponse;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub first_name: String,
    #[serde(default)]
    pub middle_name: Option<String>,
    pub last_name: String,
    #[serde(default)]
    pub department_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub message: String,
    pub user: UserResponse,
    pub email_sent: bool,
}

#[derive(Debug, Deserialize)]
pub struct EmailCodeRequest {
    pub email: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct FacultyCompleteRequest {
    pub token: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_sent: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub user: UserResponse,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            token: session.token,
            user: session.user.into(),
        }
    }
}

/// Either a session or a request for the emailed second factor
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum LoginResponse {
    Session(SessionResponse),
    #[serde(rename_all = "camelCase")]
    TwoFactor {
        two_factor_required: bool,
        email: String,
        message: String,
        email_sent: bool,
    },
}

/// POST /api/auth/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    errors
        .check("email", validate_email(&req.email))
        .check("password", validate_password_present(&req.password))
        .check("firstName", validate_name(&req.first_name, "First name"))
        .check("middleName", validate_optional_name(&req.middle_name, "Middle name"))
        .check("lastName", validate_name(&req.last_name, "Last name"));
    errors.finish()?;

    let receipt = state
        .accounts
        .register(Registration {
            email: req.email,
            password: req.password,
            first_name: req.first_name.trim().to_string(),
            middle_name: req.middle_name,
            last_name: req.last_name.trim().to_string(),
            department_id: req.department_id,
        })
        .await?;

    let message = if receipt.delivered {
        "Registration successful. Check your email for a verification code."
    } else {
        "Registration successful, but the verification email could not be sent. Request a new code."
    };

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: message.to_string(),
            user: receipt.value.into(),
            email_sent: receipt.delivered,
        }),
    ))
}

/// POST /api/auth/verify-code
pub async fn verify_code(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EmailCodeRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    errors
        .check("email", validate_email(&req.email))
        .check("code", validate_code(&req.code));
    errors.finish()?;

    let user = state.accounts.verify_code(&req.email, &req.code).await?;
    Ok(Json(MessageResponse {
        message: "Email verified. An administrator will review your account.".to_string(),
        user: Some(user.into()),
        email_sent: None,
    }))
}

/// POST /api/auth/resend-code
pub async fn resend_code(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EmailRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    validate_email(&req.email).map_err(|m| ApiError::validation_field("email", m))?;

    let receipt = state.accounts.resend_code(&req.email).await?;
    Ok(Json(MessageResponse {
        message: "A new verification code has been issued.".to_string(),
        user: None,
        email_sent: Some(receipt.delivered),
    }))
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    errors
        .check("email", validate_email(&req.email))
        .check("password", validate_password_present(&req.password));
    errors.finish()?;

    let response = match state.accounts.login(&req.email, &req.password).await? {
        LoginOutcome::Authenticated(session) => LoginResponse::Session(session.into()),
        LoginOutcome::TwoFactorRequired { email, delivered } => LoginResponse::TwoFactor {
            two_factor_required: true,
            message: if delivered {
                "A login code has been sent to your email.".to_string()
            } else {
                "A login code was issued but could not be emailed. Try again shortly.".to_string()
            },
            email,
            email_sent: delivered,
        },
    };
    Ok(Json(response))
}

/// POST /api/auth/verify-2fa
pub async fn verify_two_factor(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EmailCodeRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    errors
        .check("email", validate_email(&req.email))
        .check("code", validate_code(&req.code));
    errors.finish()?;

    let session = state.accounts.verify_two_factor(&req.email, &req.code).await?;
    Ok(Json(session.into()))
}

/// POST /api/auth/faculty/complete
pub async fn complete_faculty_link(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FacultyCompleteRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if req.token.trim().is_empty() {
        errors.add("token", "Token is required");
    }
    errors.check("password", validate_password_present(&req.password));
    errors.finish()?;

    let session = state
        .accounts
        .complete_faculty_link(&req.token, &req.password)
        .await?;
    Ok(Json(session.into()))
}

/// GET /api/auth/me
pub async fn me(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
) -> Result<Json<UserResponse>, ApiError> {
    let user = state
        .accounts
        .user(&claims.id)
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(Json(user.into()))
}
