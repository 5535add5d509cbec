//! Standardized API error responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Machine-readable error code for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    NotFound,
    BadRequest,
    QuotaNotAcceptable,
    InternalError,
}

/// A quota edit rejected by the validation pipeline, with the acceptable
/// range when a constraint or admin maximum produced the rejection.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaUpdateIssue {
    pub service_type: String,
    pub resource_name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_acceptable_quota: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_acceptable_quota: Option<u64>,
    pub unit: String,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<QuotaUpdateIssue>,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: ApiErrorCode::NotFound,
            message: message.into(),
            errors: Vec::new(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: ApiErrorCode::BadRequest,
            message: message.into(),
            errors: Vec::new(),
        }
    }

    pub fn unprocessable(issues: Vec<QuotaUpdateIssue>) -> Self {
        Self {
            code: ApiErrorCode::QuotaNotAcceptable,
            message: "quota values violate constraints".to_string(),
            errors: issues,
        }
    }

    pub fn internal(error: &anyhow::Error) -> Self {
        Self {
            code: ApiErrorCode::InternalError,
            message: format!("{error:#}"),
            errors: Vec::new(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self.code {
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::QuotaNotAcceptable => StatusCode::UNPROCESSABLE_ENTITY,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal(&error)
    }
}
