//! Error types for wikifed
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.
//! Storage errors are translated here so callers never match on raw
//! sqlx errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// A required protocol property is absent (400)
    #[error("Missing property: {0}")]
    MissingProperty(String),

    /// A property is present but unusable, e.g. an IRI where an object was required (422)
    #[error("Unprocessable property value: {0}")]
    UnprocessablePropValue(String),

    /// Referenced object is neither cached nor resolvable (404)
    #[error("Unknown IRI: {0}")]
    NotFoundIri(String),

    /// Activity or object type this node does not handle (501)
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Duplicate local resource, e.g. an article title already in use (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Actor is not allowed to perform this action (403)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unprocessable entity (422)
    #[error("Unprocessable entity: {0}")]
    Unprocessable(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Remote peer answered with an error status (502)
    #[error("Remote returned {status}: {body}")]
    RemoteStatus { status: u16, body: String },

    /// Signature verification failed (401)
    #[error("Invalid signature")]
    InvalidSignature,

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether a remote peer refused the request outright (4xx).
    pub fn is_client_rejection(&self) -> bool {
        matches!(self, AppError::RemoteStatus { status, .. } if (400..500).contains(status))
    }

    /// Whether retrying the same work can never succeed: the activity
    /// itself is malformed or not allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppError::MissingProperty(_)
                | AppError::UnprocessablePropValue(_)
                | AppError::NotFoundIri(_)
                | AppError::Unsupported(_)
                | AppError::Conflict(_)
                | AppError::Forbidden(_)
                | AppError::Validation(_)
                | AppError::Unprocessable(_)
        )
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::MissingProperty(_) => "missing_property",
            AppError::UnprocessablePropValue(_) => "unprocessable_prop_value",
            AppError::NotFoundIri(_) => "not_found_iri",
            AppError::Unsupported(_) => "unsupported",
            AppError::Conflict(_) => "conflict",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::Validation(_) => "validation",
            AppError::Unprocessable(_) => "unprocessable",
            AppError::Database(_) => "database",
            AppError::HttpClient(_) => "http_client",
            AppError::RemoteStatus { .. } => "remote_status",
            AppError::InvalidSignature => "invalid_signature",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound,
            other => AppError::Database(other),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Unprocessable(format!("invalid JSON: {}", err))
    }
}

impl IntoResponse for AppError {
    /// Maps each error variant to an HTTP status and a JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let status = match &self {
            AppError::MissingProperty(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::UnprocessablePropValue(_) | AppError::Unprocessable(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AppError::NotFoundIri(_) | AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Unauthorized | AppError::InvalidSignature => StatusCode::UNAUTHORIZED,
            AppError::HttpClient(_) | AppError::RemoteStatus { .. } => StatusCode::BAD_GATEWAY,
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let error_message = match &self {
            AppError::Database(_) => "Database error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL
            .with_label_values(&[self.kind(), "http"])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_translates_to_not_found() {
        let err: AppError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, AppError::NotFound));
    }

    #[test]
    fn remote_4xx_is_client_rejection() {
        let gone = AppError::RemoteStatus {
            status: 410,
            body: "gone".to_string(),
        };
        let unavailable = AppError::RemoteStatus {
            status: 503,
            body: String::new(),
        };
        assert!(gone.is_client_rejection());
        assert!(!unavailable.is_client_rejection());
    }

    #[test]
    fn validation_kinds_map_to_client_statuses() {
        let cases = [
            (AppError::MissingProperty("id".into()), StatusCode::BAD_REQUEST),
            (AppError::Forbidden("actor".into()), StatusCode::FORBIDDEN),
            (AppError::Conflict("title".into()), StatusCode::CONFLICT),
            (AppError::Unsupported("Like".into()), StatusCode::NOT_IMPLEMENTED),
            (AppError::InvalidSignature, StatusCode::UNAUTHORIZED),
        ];
        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }

    #[test]
    fn remote_failures_are_retryable() {
        assert!(AppError::MissingProperty("actor".into()).is_terminal());
        assert!(AppError::Forbidden("owner".into()).is_terminal());
        assert!(
            !AppError::RemoteStatus {
                status: 404,
                body: String::new()
            }
            .is_terminal()
        );
        assert!(!AppError::InvalidSignature.is_terminal());
    }
}
