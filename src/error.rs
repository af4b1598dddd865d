//! Error taxonomy shared by the HTTP surface and the request pipeline.
//!
//! Every failure that reaches a caller is rendered by [`ApiError`]'s
//! `ResponseError` impl as `{"error": {"message", "type", "code"}}`.

use actix_web::{HttpResponse, ResponseError};
use http::StatusCode;
use thiserror::Error;

/// Caller-facing errors. The `code` string of each variant is part of the wire contract.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    ProviderNotFound(String),

    #[error("{0}")]
    ProviderExists(String),

    #[error("{message}")]
    ProviderResponse { status: StatusCode, message: String },

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::ProviderNotFound(_) => "provider_not_found",
            ApiError::ProviderExists(_) => "provider_exists",
            ApiError::ProviderResponse { .. } => "provider_response_error",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) | ApiError::ProviderExists(_) => StatusCode::BAD_REQUEST,
            ApiError::ProviderNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ProviderResponse { status, .. } => *status,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Build the upstream-failure variant from the raw status and body text.
    pub fn provider_response(
        provider: &str,
        model: &str,
        status: StatusCode,
        body: &str,
    ) -> Self {
        ApiError::ProviderResponse {
            status,
            message: format!(
                "Error from provider({},{}: {}): {}",
                provider,
                model,
                status.as_u16(),
                body
            ),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        actix_web::http::StatusCode::from_u16(self.status().as_u16())
            .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        tracing::error!(code = self.code(), status = self.status().as_u16(), "{}", self);
        error_response(self.status(), &self.to_string(), self.code())
    }
}

/// Errors raised by a transformer capability. They reach the caller unmodified
/// in message: a body the transformer cannot read is the caller's
/// `invalid_request`, anything else is `internal_error`.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transformer {name} failed: {message}")]
    Failed { name: String, message: String },
}

impl From<TransformError> for ApiError {
    fn from(err: TransformError) -> Self {
        match err {
            TransformError::InvalidPayload(_) => ApiError::InvalidRequest(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

/// Build a JSON error envelope with the given HTTP status, message and code.
pub fn error_response(status: StatusCode, msg: &str, code: &str) -> HttpResponse {
    let body = serde_json::json!({
        "error": {
            "message": msg,
            "type": "api_error",
            "code": code,
        }
    });
    let status = actix_web::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(body)
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_follow_taxonomy() {
        let cases = [
            (ApiError::InvalidRequest("x".into()), 400, "invalid_request"),
            (ApiError::ProviderNotFound("x".into()), 404, "provider_not_found"),
            (ApiError::ProviderExists("x".into()), 400, "provider_exists"),
            (ApiError::Internal("x".into()), 500, "internal_error"),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status().as_u16(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn provider_response_mirrors_upstream_status() {
        let err = ApiError::provider_response(
            "openrouter",
            "anthropic/claude-sonnet-4.5",
            StatusCode::TOO_MANY_REQUESTS,
            "rate limited",
        );
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.code(), "provider_response_error");
        let msg = err.to_string();
        assert!(msg.contains("429"));
        assert!(msg.contains("rate limited"));
    }

    #[test]
    fn transform_error_classification() {
        let err: ApiError = TransformError::InvalidPayload("missing messages".into()).into();
        assert_eq!(err.code(), "invalid_request");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("missing messages"));

        let err: ApiError = TransformError::Failed {
            name: "maxtoken".into(),
            message: "boom".into(),
        }
        .into();
        assert_eq!(err.code(), "internal_error");
        assert!(err.to_string().contains("boom"));
    }
}
