mod admin;
pub mod auth;
pub mod error;
mod users;
pub mod validation;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Auth routes (public, except /me which reads the bearer token itself)
    let auth_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/verify-code", post(auth::verify_code))
        .route("/resend-code", post(auth::resend_code))
        .route("/login", post(auth::login))
        .route("/verify-2fa", post(auth::verify_two_factor))
        .route("/faculty/complete", post(auth::complete_faculty_link))
        .route("/me", get(auth::me));

    // Administrator routes
    let admin_routes = Router::new()
        .route("/users", get(admin::list_users))
        .route("/users", post(admin::create_account))
        .route("/users/:id", delete(admin::deny_user))
        .route("/users/:id/approve", post(admin::approve_user))
        .route("/users/:id/reject", post(admin::reject_user))
        .route("/users/:id/faculty-link", post(admin::issue_faculty_link))
        .route("/users/:id/department", put(admin::assign_department))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::admin_middleware,
        ));

    let user_routes = Router::new().route("/users/:id", get(users::get_user));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/auth", auth_routes)
        .nest("/api/admin", admin_routes)
        .nest("/api", user_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
