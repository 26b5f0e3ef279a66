//! Unified application error model and mapping helpers.
//! Every subsystem (fabric, sessions, login, deployment) reports through
//! `AppError`; the HTTP glue maps it to a status and the binary to an exit code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("cluster fabric unavailable: {0}")]
    FabricUnavailable(String),
    #[error("authentication backend unavailable: {0}")]
    AuthBackendUnavailable(String),
    #[error("authentication denied for {0}")]
    AuthDenied(String),
    #[error("artifact fetch failed for {app}: {reason}")]
    ArtifactFetchFailed { app: String, reason: String },
    #[error("context start failed for {app}: {reason}")]
    ContextStartFailed { app: String, reason: String },
    #[error("document database unavailable: {0}")]
    DatabaseUnavailable(String),
    #[error("session conflict on {0}")]
    SessionConflict(String),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code_str(&self) -> &'static str {
        match self {
            AppError::ConfigInvalid(_) => "config_invalid",
            AppError::FabricUnavailable(_) => "fabric_unavailable",
            AppError::AuthBackendUnavailable(_) => "auth_backend_unavailable",
            AppError::AuthDenied(_) => "auth_denied",
            AppError::ArtifactFetchFailed { .. } => "artifact_fetch_failed",
            AppError::ContextStartFailed { .. } => "context_start_failed",
            AppError::DatabaseUnavailable(_) => "database_unavailable",
            AppError::SessionConflict(_) => "session_conflict",
            AppError::Codec(_) => "codec_error",
            AppError::Io(_) => "io_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    pub fn fabric<S: Into<String>>(msg: S) -> Self { AppError::FabricUnavailable(msg.into()) }
    pub fn backend<S: Into<String>>(msg: S) -> Self { AppError::AuthBackendUnavailable(msg.into()) }
    pub fn config<S: Into<String>>(msg: S) -> Self { AppError::ConfigInvalid(msg.into()) }
    pub fn database<S: Into<String>>(msg: S) -> Self { AppError::DatabaseUnavailable(msg.into()) }
    pub fn internal<S: Into<String>>(msg: S) -> Self { AppError::Internal(msg.into()) }
    pub fn fetch<A: Into<String>, R: Into<String>>(app: A, reason: R) -> Self {
        AppError::ArtifactFetchFailed { app: app.into(), reason: reason.into() }
    }
    pub fn start<A: Into<String>, R: Into<String>>(app: A, reason: R) -> Self {
        AppError::ContextStartFailed { app: app.into(), reason: reason.into() }
    }

    /// Transient failures are absorbed by retry-and-log; everything else is structural.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::FabricUnavailable(_)
                | AppError::AuthBackendUnavailable(_)
                | AppError::ArtifactFetchFailed { .. }
                | AppError::DatabaseUnavailable(_)
                | AppError::SessionConflict(_)
        )
    }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::AuthDenied(_) => 401,
            AppError::FabricUnavailable(_) | AppError::AuthBackendUnavailable(_) | AppError::DatabaseUnavailable(_) => 503,
            AppError::SessionConflict(_) => 409,
            _ => 500,
        }
    }

    /// Process exit code used by the server binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::ConfigInvalid(_) => 2,
            AppError::FabricUnavailable(_) => 3,
            AppError::AuthBackendUnavailable(_) => 4,
            _ => 1,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod error_tests;
