//! Typed HTTP client for the offloader API.
//!
//! Mirrors the service routes one-to-one: admin operations use basic auth
//! with the configured key, job operations use the bearer token captured by
//! [`Client::login`].

use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::jobs::{Job, JobConfig, ServiceConfig};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to parse config: {0}")]
    Config(String),

    #[error("not logged in")]
    NotAuthenticated,

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request failed: {0}")]
    Request(String),

    #[error("request failed with status {0}")]
    Status(StatusCode),
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub url: String,
    pub client_id: String,
    pub auth_key: String,
}

impl ClientConfig {
    pub fn parse(&self) -> Result<(), ClientError> {
        if self.url.is_empty() {
            return Err(ClientError::Config(
                "invalid URL value: should not be empty".to_string(),
            ));
        }

        let u = url::Url::parse(&self.url)
            .map_err(|e| ClientError::Config(format!("failed to parse url: {e}")))?;

        if u.host_str().unwrap_or_default().is_empty() {
            return Err(ClientError::Config(
                "invalid url host: should not be empty".to_string(),
            ));
        }

        match u.scheme() {
            "http" | "https" => Ok(()),
            scheme => Err(ClientError::Config(format!(
                "invalid url scheme: {scheme:?} is not valid"
            ))),
        }
    }
}

#[derive(Debug)]
pub struct Client {
    cfg: ClientConfig,
    http: reqwest::Client,
    auth_token: Option<String>,
}

impl Client {
    pub fn new(cfg: ClientConfig) -> Result<Self, ClientError> {
        cfg.parse()?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2 * 60))
            .build()?;

        Ok(Self {
            cfg,
            http,
            auth_token: None,
        })
    }

    pub fn url(&self) -> &str {
        &self.cfg.url
    }

    pub async fn register(&self, client_id: &str, auth_key: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .post(format!("{}/register", self.cfg.url))
            .basic_auth(&self.cfg.client_id, Some(&self.cfg.auth_key))
            .json(&credentials(client_id, auth_key))
            .send()
            .await?;

        expect_status(resp, StatusCode::CREATED).await.map(|_| ())
    }

    pub async fn unregister(&self, client_id: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .post(format!("{}/unregister", self.cfg.url))
            .basic_auth(&self.cfg.client_id, Some(&self.cfg.auth_key))
            .json(&serde_json::json!({ "clientID": client_id }))
            .send()
            .await?;

        expect_status(resp, StatusCode::OK).await.map(|_| ())
    }

    /// Authenticate and keep the returned bearer token for job operations.
    pub async fn login(&mut self, client_id: &str, auth_key: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .post(format!("{}/login", self.cfg.url))
            .json(&credentials(client_id, auth_key))
            .send()
            .await?;

        let resp = expect_status(resp, StatusCode::OK).await?;
        let data: serde_json::Value = resp.json().await?;
        self.auth_token = data
            .get("bearerToken")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Ok(())
    }

    pub async fn init(&self, cfg: &ServiceConfig) -> Result<(), ClientError> {
        let resp = self
            .authed(reqwest::Method::POST, "/jobs/init")?
            .json(cfg)
            .send()
            .await?;
        expect_status(resp, StatusCode::OK).await.map(|_| ())
    }

    pub async fn create_job(&self, cfg: &JobConfig) -> Result<Job, ClientError> {
        let resp = self
            .authed(reqwest::Method::POST, "/jobs")?
            .json(cfg)
            .send()
            .await?;
        let resp = expect_status(resp, StatusCode::OK).await?;
        Ok(resp.json().await?)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job, ClientError> {
        let resp = self
            .authed(reqwest::Method::GET, &format!("/jobs/{job_id}"))?
            .send()
            .await?;
        let resp = expect_status(resp, StatusCode::OK).await?;
        Ok(resp.json().await?)
    }

    pub async fn stop_job(&self, job_id: &str) -> Result<(), ClientError> {
        let resp = self
            .authed(reqwest::Method::POST, &format!("/jobs/{job_id}/stop"))?
            .send()
            .await?;
        expect_status(resp, StatusCode::OK).await.map(|_| ())
    }

    pub async fn delete_job(&self, job_id: &str) -> Result<(), ClientError> {
        let resp = self
            .authed(reqwest::Method::DELETE, &format!("/jobs/{job_id}"))?
            .send()
            .await?;
        expect_status(resp, StatusCode::OK).await.map(|_| ())
    }

    pub async fn get_job_logs(&self, job_id: &str) -> Result<Vec<u8>, ClientError> {
        let resp = self
            .authed(reqwest::Method::GET, &format!("/jobs/{job_id}/logs"))?
            .send()
            .await?;
        let resp = expect_status(resp, StatusCode::OK).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    fn authed(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, ClientError> {
        let token = self
            .auth_token
            .as_deref()
            .ok_or(ClientError::NotAuthenticated)?;
        Ok(self
            .http
            .request(method, format!("{}{path}", self.cfg.url))
            .bearer_auth(token))
    }
}

fn credentials(client_id: &str, auth_key: &str) -> impl Serialize {
    serde_json::json!({
        "clientID": client_id,
        "authKey": auth_key,
    })
}

/// Surface the server's `{"error": "..."}` body on unexpected statuses.
async fn expect_status(
    resp: reqwest::Response,
    expected: StatusCode,
) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status == expected {
        return Ok(resp);
    }

    if let Ok(data) = resp.json::<serde_json::Value>().await {
        if let Some(msg) = data.get("error").and_then(|v| v.as_str()) {
            return Err(ClientError::Request(msg.to_string()));
        }
    }

    Err(ClientError::Status(status))
}
