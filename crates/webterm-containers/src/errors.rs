use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("required binary '{0}' not found in PATH")]
    MissingBinary(String),
    #[error("command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error("no free port available at or above {0}")]
    PortsExhausted(u16),
    #[error("listener on {host}:{port} not ready after {waited_secs}s")]
    ReadyTimeout {
        host: String,
        port: u16,
        waited_secs: u64,
    },
    #[error("container {0} not found")]
    NotFound(String),
    #[error("image build failed: {0}")]
    ImageBuild(String),
    #[error("failed to create container: {0}")]
    Create(String),
    #[error("container service error: {0}")]
    Remote(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for ContainerError {
    fn into_response(self) -> Response {
        let (status, code) = match self {
            ContainerError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ContainerError::MissingBinary(_) => (StatusCode::SERVICE_UNAVAILABLE, "missing_dependency"),
            ContainerError::CommandFailed { .. } => (StatusCode::BAD_GATEWAY, "command_failed"),
            ContainerError::PortsExhausted(_) => (StatusCode::INSUFFICIENT_STORAGE, "ports_exhausted"),
            ContainerError::ReadyTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "ready_timeout"),
            ContainerError::ImageBuild(_) => (StatusCode::BAD_GATEWAY, "image_build_failed"),
            ContainerError::Create(_) => (StatusCode::BAD_GATEWAY, "container_create_failed"),
            ContainerError::Remote(_) => (StatusCode::BAD_GATEWAY, "remote_service_error"),
            ContainerError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = ErrorBody {
            code: code.to_string(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

pub type ContainerResult<T> = Result<T, ContainerError>;
