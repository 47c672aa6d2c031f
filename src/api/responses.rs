//! Error envelope and response translation for the HTTP facade.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Stable error body for every 4xx/5xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Stable error code, e.g. `AMT_VERSION`.
    pub code: String,

    /// Free-text detail.
    pub details: String,
}

impl ErrorEnvelope {
    /// Build an envelope from parts.
    pub fn new(code: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            details: details.into(),
        }
    }
}

/// Core errors lifted into HTTP responses.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            CoreError::UnknownRootAnalysis(_) | CoreError::UnknownAlertSystem(_) => {
                StatusCode::NOT_FOUND
            }
            CoreError::Io(_)
            | CoreError::Serialization(_)
            | CoreError::Invariant(_)
            | CoreError::Deadlock(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let envelope = ErrorEnvelope::new(self.0.code(), self.0.to_string());
        (self.status(), Json(envelope)).into_response()
    }
}

/// 404 with the envelope shape, for missing resources surfaced as
/// `Option::None` rather than errors.
pub fn not_found(code: &str, details: impl Into<String>) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorEnvelope::new(code, details)),
    )
        .into_response()
}
