//! JSON error responses: `{ "error": ..., "details"?: ... }`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::voice::provider::ProviderError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    /// A required credential or setting is absent on the server.
    #[error("Server config missing")]
    ConfigMissing(String),

    #[error("{error}")]
    Upstream {
        error: &'static str,
        details: String,
    },
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl ApiError {
    /// Map a capability failure. `error` is the short message for this
    /// route, e.g. "TTS failed".
    pub fn from_provider(error: &'static str, err: ProviderError) -> Self {
        match err {
            ProviderError::Config(key) => Self::ConfigMissing(key),
            other => Self::Upstream {
                error,
                details: other.user_message(),
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::ConfigMissing(_) | Self::Upstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorBody {
        let details = match self {
            Self::ConfigMissing(key) => Some(key.clone()),
            Self::Upstream { details, .. } => Some(details.clone()),
            Self::BadRequest(_) | Self::Unauthorized => None,
        };
        ErrorBody {
            error: self.to_string(),
            details,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            Self::ConfigMissing(key) => error!(%key, "Server config missing"),
            Self::Upstream { error, details } => warn!(%error, %details, "Upstream failure"),
            Self::BadRequest(_) | Self::Unauthorized => {}
        }
        (self.status(), Json(self.body())).into_response()
    }
}
