//! HTTP error mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use decision_engine::DecisionError;
use flux_gateway::FluxError;
use orbital_mechanics::OrbitalError;
use serde::Serialize;
use thiserror::Error;
use tle_ingest::IngestError;
use tracing::error;

use crate::config::ConfigError;

#[derive(Serialize)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("flux model failed: {0}")]
    Upstream(String),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            AppError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        if status.is_server_error() {
            error!("{} {}", status, self);
        }
        let body = ApiError {
            code,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<IngestError> for AppError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::InvalidConfig(msg) => AppError::BadRequest(msg),
            IngestError::DataSource(e) => AppError::Unavailable(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<OrbitalError> for AppError {
    fn from(e: OrbitalError) -> Self {
        match e {
            OrbitalError::InvalidStep(_)
            | OrbitalError::InvalidConfig(_)
            | OrbitalError::TooManyPoints { .. } => AppError::BadRequest(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<FluxError> for AppError {
    fn from(e: FluxError) -> Self {
        match e {
            FluxError::InvalidConfig(_) => AppError::BadRequest(e.to_string()),
            FluxError::Process(_) | FluxError::Timeout(_) | FluxError::Malformed(_) => {
                AppError::Upstream(e.to_string())
            }
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<DecisionError> for AppError {
    fn from(e: DecisionError) -> Self {
        match e {
            DecisionError::InvalidConfig(_) => AppError::BadRequest(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Io(e) => AppError::Internal(e.to_string()),
            other => AppError::BadRequest(other.to_string()),
        }
    }
}
