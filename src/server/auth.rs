// 调用方身份
//
// 认证由上游网关完成，这里只读取已认证的调用方ID

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use super::error::ApiError;

/// 调用方ID请求头
pub const OWNER_HEADER: &str = "x-owner-id";

/// 已认证的调用方
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| CallerId(v.to_string()))
            .ok_or(ApiError::Unauthorized)
    }
}
