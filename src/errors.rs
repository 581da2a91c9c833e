//! Error types surfaced at the crate's public seams

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use thiserror::Error;

use crate::connector::{ConnectorError, ErrorReason};
use crate::persistence::StoreError;

/// Fatal construction/startup failures
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("unknown persistence type '{0}'")]
    UnknownPersistence(String),
    #[error("policy engine '{0}' is not registered")]
    PolicyEngineNotRegistered(String),
    #[error("invalid policy engine config: {0}")]
    PolicyEngineConfig(String),
    #[error("persistence initialization failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("block listener registration failed: {0}")]
    BlockListener(ConnectorError),
    #[error("API server bind failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures mapped onto the HTTP surface
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Downstream(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Downstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_response(&self) -> HttpResponse {
        HttpResponse::build(self.status()).json(serde_json::json!({
            "error": self.to_string()
        }))
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(format!("persistence error: {}", e))
    }
}

impl From<ConnectorError> for ApiError {
    fn from(e: ConnectorError) -> Self {
        match e.reason {
            ErrorReason::InvalidInputs => ApiError::BadRequest(e.message),
            ErrorReason::NotFound => ApiError::NotFound(e.message),
            _ => ApiError::Downstream(e.message),
        }
    }
}
