use std::time::Duration;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::responses::RequestMeta;

pub const E_BAD_AMOUNT: &str = "BAD_AMOUNT";
pub const E_DB_FAILURE: &str = "DB_FAILURE";
pub const E_PURCHASE_CONFLICT: &str = "PURCHASE_CONFLICT";
pub const E_PROCESS_FAILURE: &str = "PROCESS_FAILURE";
pub const E_VALIDATION: &str = "VALIDATION";
pub const E_CONFLICT: &str = "CONFLICT";
pub const E_INSUFFICIENT_BALANCE: &str = "INSUFFICIENT_BALANCE";
pub const E_NOT_FOUND: &str = "NOT_FOUND";
pub const E_TRANSPORT: &str = "TRANSPORT";
pub const E_TIMEOUT: &str = "TIMEOUT";
pub const E_DATA_INTEGRITY: &str = "DATA_INTEGRITY";
pub const E_BUSY: &str = "BUSY";
pub const E_FETCH_IN_FLIGHT: &str = "FETCH_IN_FLIGHT";

/// Errors raised by the graph, ledger and withdrawal engines.
///
/// The `Display` output is the human-readable message surfaced to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(
        "insufficient balance: available {available}, requested {requested}, retention floor {floor}"
    )]
    InsufficientBalance {
        available: i64,
        requested: i64,
        floor: i64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    #[error("operation already in progress: {0}")]
    Busy(String),
}

impl EngineError {
    /// Machine-readable code used in API responses.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => E_VALIDATION,
            EngineError::Conflict(_) => E_CONFLICT,
            EngineError::InsufficientBalance { .. } => E_INSUFFICIENT_BALANCE,
            EngineError::NotFound(_) => E_NOT_FOUND,
            EngineError::Transport(_) => E_TRANSPORT,
            EngineError::Timeout(_) => E_TIMEOUT,
            EngineError::DataIntegrity(_) => E_DATA_INTEGRITY,
            EngineError::Busy(_) => E_BUSY,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => EngineError::NotFound("row not found".into()),
            other => EngineError::Transport(other.to_string()),
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    Unavailable(String),
    Internal(anyhow::Error),
}

#[derive(Debug)]
pub struct ApiErrorWithMeta {
    error: ApiError,
    meta: RequestMeta,
    code: Option<String>,
}

impl ApiError {
    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        ApiErrorWithMeta {
            error: self,
            meta,
            code: None,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let msg = err.to_string();
        match err {
            EngineError::Validation(_) => ApiError::BadRequest(msg),
            EngineError::NotFound(_) => ApiError::NotFound(msg),
            EngineError::Conflict(_) | EngineError::Busy(_) => ApiError::Conflict(msg),
            EngineError::InsufficientBalance { .. } => ApiError::Unprocessable(msg),
            EngineError::Transport(_) | EngineError::Timeout(_) => ApiError::Unavailable(msg),
            EngineError::DataIntegrity(_) => ApiError::Internal(anyhow::Error::new(err)),
        }
    }
}

impl ApiErrorWithMeta {
    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    /// Wraps an engine error, keeping its code.
    pub fn engine(err: EngineError, meta: RequestMeta) -> Self {
        let code = err.code();
        ApiError::from(err).with_meta(meta).with_code(code)
    }
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.error {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Unavailable(msg) => {
                error!("upstream unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
            ApiError::Internal(e) => {
                error!("internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let mut body = json!({
            "request_id": self.meta.request_id,
            "error": error_message,
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }

        (status, Json(body)).into_response()
    }
}
