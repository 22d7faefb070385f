//! Error types shared across the service.
//!
//! Each domain carries its own enum; the HTTP surface is the only place where
//! errors are mapped to status codes. Upstream failures are wrapped with a
//! short verb phrase identifying the failing step and never replaced.

use thiserror::Error;

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(std::io::Error),

    #[error("failed to decode config file: {0}")]
    Decode(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),

    #[error("failed to parse {var}: {reason}")]
    Env { var: String, reason: String },
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn env(var: &str, reason: impl std::fmt::Display) -> Self {
        Self::Env {
            var: var.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// KV store failures. `NotFound` is distinguished so callers can map missing
/// records to semantic responses.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("error: empty key")]
    EmptyKey,

    #[error("{context}: {reason}")]
    Failed { context: String, reason: String },
}

impl StoreError {
    pub fn failed(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Failed {
            context: context.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Authentication and registration failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid empty clientID")]
    EmptyClientId,

    #[error("key not long enough")]
    KeyTooShort,

    #[error("already registered")]
    AlreadyRegistered,

    #[error("not found")]
    NotFound,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            other => Self::Store(other),
        }
    }
}

/// Executor failures surfaced by `CreateJob` and friends.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("{0}")]
    InvalidConfig(String),

    #[error("max concurrent jobs reached")]
    MaxConcurrentJobs,

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Failed(String),
}

impl ExecutorError {
    /// Wrap an upstream failure with the failing step, e.g.
    /// `failed to create container: <cause>`.
    pub fn failed(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Failed(format!("{context}: {err}"))
    }
}
