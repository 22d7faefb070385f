//! HTTP surface: routes, request/response contracts, authentication
//! middleware, and audit logging.
//!
//! Job routes sit behind a bearer-token route layer; registration endpoints
//! check admin basic-auth themselves since self-registration may be open.
//! Every response passes through the audit middleware.

mod audit;
mod handlers;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;

use crate::auth::AuthService;
use crate::config::{SecurityConfig, API_REQUEST_BODY_MAX_SIZE_BYTES};
use crate::executor::Executor;
use crate::jobs::JobStore;

/// Client identity resolved by authentication, attached to responses for the
/// audit log.
#[derive(Debug, Clone)]
pub struct ClientId(pub String);

/// Error string attached to failed responses for the audit log.
#[derive(Debug, Clone)]
pub struct ErrorMessage(pub String);

#[derive(Clone)]
pub struct AppState {
    pub security: SecurityConfig,
    pub image_registry: String,
    pub auth: Arc<AuthService>,
    pub job_store: JobStore,
    pub executor: Arc<dyn Executor>,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Job routes: authenticated via the bearer-token route layer.
        .route("/jobs/init", post(handlers::init_jobs))
        .route("/jobs", post(handlers::create_job))
        .route(
            "/jobs/{id}",
            get(handlers::get_job).delete(handlers::delete_job),
        )
        .route("/jobs/{id}/stop", post(handlers::stop_job))
        .route("/jobs/{id}/logs", get(handlers::get_job_logs))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            bearer_auth_middleware,
        ))
        // Public routes (added after the layer).
        .route("/version", get(handlers::get_version))
        .route("/login", post(handlers::login))
        .route("/register", post(handlers::register))
        .route("/unregister", post(handlers::unregister))
        .layer(middleware::from_fn(audit::audit_middleware))
        .layer(DefaultBodyLimit::max(API_REQUEST_BODY_MAX_SIZE_BYTES))
        .with_state(state)
}

/// Error response carrying the status code and a message, rendered as
/// `{"error": "...", "code": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": self.message,
            "code": self.status.as_u16().to_string(),
        }));
        let mut resp = (self.status, body).into_response();
        resp.extensions_mut().insert(ErrorMessage(self.message));
        resp
    }
}

/// Resolve the bearer token through the session cache and stash the client
/// identity for handlers and the audit log.
async fn bearer_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let client_id = bearer_token(req.headers())
        .and_then(|token| state.auth.authenticate_token(&token).ok());

    let Some(client_id) = client_id else {
        return ApiError::unauthorized().into_response();
    };

    req.extensions_mut().insert(ClientId(client_id.clone()));
    let mut resp = next.run(req).await;
    resp.extensions_mut().insert(ClientId(client_id));
    resp
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

/// Whether the request carries basic-auth credentials matching the admin
/// secret. Only meaningful when admin access is enabled.
fn admin_basic_auth_ok(headers: &HeaderMap, security: &SecurityConfig) -> bool {
    if !security.enable_admin || security.admin_secret_key.is_empty() {
        return false;
    }
    let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(creds) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((_, password)) = creds.split_once(':') else {
        return false;
    };
    password == security.admin_secret_key
}

/// Job ids are 12 lowercase-alphanumeric characters; anything else 404s
/// before touching the store.
fn valid_job_id(id: &str) -> bool {
    id.len() == 12
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}
