//! Problem+json error bodies for the API.

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::state::AppError;
use crate::store::StoreError;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: ProblemDetails,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, detail: impl Into<String>) -> Self {
        Self {
            status,
            problem: ProblemDetails {
                r#type: format!("https://bosun.dev/problems/{code}"),
                title: status
                    .canonical_reason()
                    .unwrap_or("Unknown Error")
                    .to_string(),
                status: status.as_u16(),
                detail: detail.into(),
                code: code.to_string(),
            },
        }
    }

    pub fn bad_request(code: &str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", detail)
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match &err {
            AppError::Validation(_) | AppError::Id(_) => {
                Self::new(StatusCode::BAD_REQUEST, "validation", err.to_string())
            }
            AppError::InvalidState(_) => {
                Self::new(StatusCode::CONFLICT, "invalid_state", err.to_string())
            }
            AppError::NotFound(_) => Self::not_found(err.to_string()),
            AppError::AlreadyExists(_) => {
                Self::new(StatusCode::CONFLICT, "already_exists", err.to_string())
            }
            AppError::Store(StoreError::NotLeader) | AppError::SchedulerUnavailable => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "not_leader",
                err.to_string(),
            ),
            AppError::Store(_) | AppError::Ipam(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage",
                err.to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
