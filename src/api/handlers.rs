//! Request handlers for the HTTP surface.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, ExecutorError, StoreError};
use crate::jobs::{self, Job, JobConfig, ServiceConfig, StopCb};
use crate::version::VersionInfo;

use super::{admin_basic_auth_ok, valid_job_id, ApiError, AppState, ClientId};

#[derive(Debug, Deserialize)]
struct CredentialsRequest {
    #[serde(rename = "clientID")]
    client_id: String,
    #[serde(rename = "authKey", default)]
    auth_key: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    #[serde(rename = "bearerToken")]
    bearer_token: String,
}

pub(crate) async fn get_version() -> Json<VersionInfo> {
    Json(VersionInfo::current())
}

pub(crate) async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ApiError> {
    if !admin_basic_auth_ok(&headers, &state.security)
        && !state.security.allow_self_registration
    {
        return Err(ApiError::unauthorized());
    }

    let req: CredentialsRequest = decode_json(body)?;

    state.auth.register(&req.client_id, &req.auth_key).map_err(
        |e| match e {
            AuthError::EmptyClientId | AuthError::KeyTooShort | AuthError::AlreadyRegistered => {
                ApiError::bad_request(format!("registration failed: {e}"))
            }
            other => ApiError::internal(format!("registration failed: {other}")),
        },
    )?;

    let mut resp = StatusCode::CREATED.into_response();
    resp.extensions_mut().insert(ClientId(req.client_id));
    Ok(resp)
}

pub(crate) async fn unregister(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ApiError> {
    if !admin_basic_auth_ok(&headers, &state.security) {
        return Err(ApiError::unauthorized());
    }

    let req: CredentialsRequest = decode_json(body)?;

    state.auth.unregister(&req.client_id).map_err(|e| match e {
        AuthError::NotFound | AuthError::EmptyClientId => {
            ApiError::bad_request(format!("unregister failed: {e}"))
        }
        other => ApiError::internal(format!("unregister failed: {other}")),
    })?;

    let mut resp = StatusCode::OK.into_response();
    resp.extensions_mut().insert(ClientId(req.client_id));
    Ok(resp)
}

pub(crate) async fn login(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ApiError> {
    let req: CredentialsRequest = decode_json(body)?;

    let token = state
        .auth
        .login(&req.client_id, &req.auth_key)
        .map_err(|e| {
            ApiError::new(
                StatusCode::UNAUTHORIZED,
                format!("login failed: {e}"),
            )
        })?;

    let mut resp = Json(LoginResponse {
        bearer_token: token,
    })
    .into_response();
    resp.extensions_mut().insert(ClientId(req.client_id));
    Ok(resp)
}

pub(crate) async fn init_jobs(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<StatusCode, ApiError> {
    let cfg: ServiceConfig = decode_json(body)?;

    state
        .executor
        .init(cfg)
        .await
        .map_err(|e| match e {
            ExecutorError::InvalidConfig(msg) => ApiError::bad_request(msg),
            other => ApiError::internal(format!("failed to init jobs: {other}")),
        })?;

    Ok(StatusCode::OK)
}

pub(crate) async fn create_job(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<Job>, ApiError> {
    let cfg: JobConfig = decode_json(body)?;

    if let Err(e) = cfg.is_valid(&state.image_registry) {
        return Err(ApiError::bad_request(e.to_string()));
    }

    let job = state
        .executor
        .create_job(cfg, default_stop_cb(&state))
        .await
        .map_err(|e| match e {
            ExecutorError::InvalidConfig(msg) => ApiError::bad_request(msg),
            other => ApiError::internal(format!("failed to create job: {other}")),
        })?;

    state
        .job_store
        .save(&job)
        .map_err(|e| ApiError::internal(format!("failed to save job: {e}")))?;

    Ok(Json(job))
}

pub(crate) async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = load_job(&state, &id)?;
    Ok(Json(job))
}

pub(crate) async fn stop_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let mut job = load_job(&state, &id)?;

    state.executor.stop_job(&id).await.map_err(|e| match e {
        ExecutorError::NotFound => ApiError::not_found("not found"),
        other => ApiError::internal(format!("failed to stop job: {other}")),
    })?;

    job.stop_at = jobs::now_millis();
    state
        .job_store
        .save(&job)
        .map_err(|e| ApiError::internal(format!("failed to save job: {e}")))?;

    Ok(StatusCode::OK)
}

pub(crate) async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let job = load_job(&state, &id)?;

    if job.stop_at == 0 {
        return Err(ApiError::bad_request("job is running"));
    }

    state.executor.delete_job(&id).await.map_err(|e| match e {
        ExecutorError::NotFound => ApiError::not_found("not found"),
        other => ApiError::internal(format!("failed to delete job: {other}")),
    })?;

    Ok(StatusCode::OK)
}

pub(crate) async fn get_job_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if !valid_job_id(id.as_str()) {
        return Err(ApiError::not_found("not found"));
    }

    // The job process logs to stderr; stdout is discarded.
    let mut stdout = std::io::sink();
    let mut stderr = Vec::new();
    state
        .executor
        .job_logs(&id, &mut stdout, &mut stderr)
        .await
        .map_err(|e| {
            ApiError::new(
                StatusCode::FORBIDDEN,
                format!("failed to get job logs: {e}"),
            )
        })?;

    Ok(stderr.into_response())
}

/// The default stop callback: finalize the record, and clean up both the
/// workload and the record on success. Failed jobs are left in place for
/// inspection; retention deletes them later.
fn default_stop_cb(state: &AppState) -> StopCb {
    let job_store = state.job_store.clone();
    let executor = state.executor.clone();

    Arc::new(move |job: Job, success: bool| {
        let job_store = job_store.clone();
        let executor = executor.clone();
        Box::pin(async move {
            tracing::info!(job_id = %job.id, success, "job stopped");

            let mut job = job_store.get(&job.id)?;

            if job.stop_at == 0 {
                job.stop_at = jobs::now_millis();
                job_store.save(&job)?;
            }

            if success {
                tracing::debug!(job_id = %job.id, "job completed successfully, removing");
                executor
                    .delete_job(&job.id)
                    .await
                    .map_err(|e| anyhow::anyhow!("failed to delete job: {e}"))?;
                job_store.delete(&job.id)?;
            }

            Ok(())
        })
    })
}

fn load_job(state: &AppState, id: &str) -> Result<Job, ApiError> {
    if !valid_job_id(id) {
        return Err(ApiError::not_found("not found"));
    }
    state.job_store.get(id).map_err(|e| match e {
        StoreError::NotFound => ApiError::not_found("not found"),
        other => ApiError::internal(format!("failed to get job: {other}")),
    })
}

/// Decode a JSON body, surfacing oversized or unreadable bodies and decode
/// failures as 400s.
fn decode_json<T: DeserializeOwned>(body: Result<Bytes, BytesRejection>) -> Result<T, ApiError> {
    let body =
        body.map_err(|e| ApiError::bad_request(format!("failed to read request body: {e}")))?;
    serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("failed to decode request body: {e}")))
}
