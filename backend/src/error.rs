//! API error taxonomy and its HTTP mapping.
//!
//! Every failure a handler can produce collapses into one of these variants;
//! the response body is always `{"detail": "..."}` so clients get a uniform
//! shape. Authentication failures deliberately share one message, so a caller
//! cannot distinguish bad password / expired token / disabled user.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Bad credentials, invalid/expired token, disabled user.
    #[error("could not validate credentials")]
    Unauthorized,

    /// Caller attempts an action scoped to another user.
    #[error("{0}")]
    Forbidden(String),

    /// Unknown user, session, or caller with no location.
    #[error("{0}")]
    NotFound(String),

    /// Session past its TTL; the entry has been removed.
    #[error("session expired")]
    Gone,

    /// Action not permitted in the current session state.
    #[error("invalid session status ({0})")]
    State(String),

    /// Malformed payload, out-of-range coordinate, bad group element.
    #[error("{0}")]
    Validation(String),

    /// Datastore failure. Logged with detail, surfaced without it.
    #[error("internal error")]
    Upstream(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Gone => StatusCode::GONE,
            ApiError::State(_) | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self {
            // Never leak upstream detail to the wire.
            ApiError::Upstream(inner) => {
                error!(error = %inner, "datastore failure");
                self.to_string()
            }
            _ => self.to_string(),
        };
        let body = Json(json!({ "detail": detail }));
        if status == StatusCode::UNAUTHORIZED {
            (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}
