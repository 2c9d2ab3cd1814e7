use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Caller-facing failure of a delivery request. Component errors are folded
/// into these at the pipeline boundary; none of their detail reaches the body.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },
    #[error("rate limiter unavailable")]
    RateLimitUnavailable,
    #[error("invalid metadata envelope")]
    InvalidEnvelope,
    #[error("metadata decryption failed")]
    DecryptionFailed,
    #[error("url signing unavailable")]
    SigningUnavailable,
    #[error("not found")]
    NotFound,
    #[error("catalog store unavailable")]
    StoreUnavailable,
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl PipelineError {
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::Unauthenticated => StatusCode::UNAUTHORIZED,
            PipelineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::RateLimitUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::InvalidEnvelope | PipelineError::DecryptionFailed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            PipelineError::SigningUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::NotFound => StatusCode::NOT_FOUND,
            PipelineError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Stable machine-readable code for the response body.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Unauthenticated => "unauthenticated",
            PipelineError::RateLimited { .. } => "rate_limited",
            PipelineError::RateLimitUnavailable => "rate_limit_unavailable",
            // Both cipher failures look the same from outside
            PipelineError::InvalidEnvelope | PipelineError::DecryptionFailed => "internal",
            PipelineError::SigningUnavailable => "signing_unavailable",
            PipelineError::NotFound => "not_found",
            PipelineError::StoreUnavailable => "store_unavailable",
            PipelineError::BadRequest(_) => "bad_request",
        }
    }

    fn public_message(&self) -> String {
        match self {
            PipelineError::Unauthenticated => "Invalid or missing identity token".to_string(),
            PipelineError::RateLimited { .. } => "Too many requests".to_string(),
            PipelineError::RateLimitUnavailable => "Service temporarily unavailable".to_string(),
            PipelineError::InvalidEnvelope | PipelineError::DecryptionFailed => {
                "Internal server error".to_string()
            }
            PipelineError::SigningUnavailable => "Service temporarily unavailable".to_string(),
            PipelineError::NotFound => "Not found".to_string(),
            PipelineError::StoreUnavailable => "Service temporarily unavailable".to_string(),
            PipelineError::BadRequest(reason) => reason.clone(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    ok: bool,
    error: ErrorDetail,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let retry_after_seconds = match self {
            PipelineError::RateLimited {
                retry_after_seconds,
            } => Some(retry_after_seconds),
            _ => None,
        };

        let body = ErrorBody {
            ok: false,
            error: ErrorDetail {
                code: self.code(),
                message: self.public_message(),
                retry_after_seconds,
            },
        };

        let mut response = (self.status(), Json(body)).into_response();
        if let Some(secs) = retry_after_seconds {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
