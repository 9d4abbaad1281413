//! RPC error surface: compact machine-readable codes plus human messages.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rocketship_types::{EngineError, ErrorKind, Issue};
use serde::Serialize;
use thiserror::Error;

/// Status vocabulary carried in every error payload.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcCode {
    InvalidArgument,
    NotFound,
    Unauthenticated,
    PermissionDenied,
    Internal,
}

impl RpcCode {
    fn http_status(self) -> StatusCode {
        match self {
            RpcCode::InvalidArgument => StatusCode::UNPROCESSABLE_ENTITY,
            RpcCode::NotFound => StatusCode::NOT_FOUND,
            RpcCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            RpcCode::PermissionDenied => StatusCode::FORBIDDEN,
            RpcCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// An RPC failure as returned to callers.
#[derive(Debug, Clone, Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: RpcCode,
    pub message: String,
    /// Validator findings attached to `VALIDATION_ERROR` responses.
    pub issues: Vec<Issue>,
}

impl ApiError {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            issues: Vec::new(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(RpcCode::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RpcCode::NotFound, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Unauthenticated, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Internal, message)
    }

    pub fn validation(issues: Vec<Issue>) -> Self {
        Self {
            code: RpcCode::InvalidArgument,
            message: format!("suite validation failed with {} issue(s)", issues.len()),
            issues,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        let code = match error.kind {
            ErrorKind::ParseError | ErrorKind::ValidationError => RpcCode::InvalidArgument,
            ErrorKind::Cancelled => RpcCode::Internal,
            _ => RpcCode::Internal,
        };
        Self::new(code, format!("{}: {}", error.kind, error.message))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: RpcCode,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    issues: Vec<Issue>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.code.http_status();
        if status.is_server_error() {
            tracing::error!(code = ?self.code, message = %self.message, "rpc error");
        }
        let body = ErrorBody {
            code: self.code,
            message: self.message,
            issues: self.issues,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
