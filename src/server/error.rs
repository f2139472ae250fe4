// API 错误 -> HTTP 响应

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

use crate::archive::{CreateError, RegistryError, ResolveError};

use super::handlers::ApiResponse;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("缺少调用方身份 (X-Owner-Id)")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("ARCHIVE_NOT_READY")]
    ArchiveNotReady,
    #[error("{0}")]
    Gone(String),
    #[error("{0}")]
    TooManyRequests(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ArchiveNotReady => StatusCode::CONFLICT,
            ApiError::Gone(_) => StatusCode::GONE,
            ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CreateError> for ApiError {
    fn from(e: CreateError) -> Self {
        match e {
            CreateError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            CreateError::Registry(e @ RegistryError::TooManyConcurrentDownloads { .. }) => {
                ApiError::TooManyRequests(e.to_string())
            }
            CreateError::Registry(e) => ApiError::Internal(e.to_string()),
            CreateError::Resolve(e @ (ResolveError::SelectionEmpty | ResolveError::NotFound(_))) => {
                ApiError::NotFound(e.to_string())
            }
            CreateError::Resolve(e @ ResolveError::AccessDenied(_)) => {
                ApiError::Forbidden(e.to_string())
            }
            CreateError::Resolve(e @ ResolveError::Store(_)) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API 内部错误: {}", self);
        }

        let body = Json(ApiResponse::<()>::error(
            i32::from(status.as_u16()),
            self.to_string(),
        ));
        (status, body).into_response()
    }
}
