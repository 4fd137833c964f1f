//! API 错误响应

use crate::downloader::{ErrorClass, RegistryError};
use crate::server::handlers::ApiResponse;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

/// 业务错误码
pub mod codes {
    pub const BAD_REQUEST: i32 = 400;
    pub const NOT_FOUND: i32 = 404;
    pub const ALREADY_ACTIVE: i32 = 1001;
    pub const INVALID_TRANSITION: i32 = 1002;
    pub const DELETE_FAILED: i32 = 1003;
    pub const MANAGER_STOPPED: i32 = 1004;
    pub const INTERNAL: i32 = 500;
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// API 错误：HTTP 状态码 + 业务错误码 + 消息
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: i32,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, message)
    }

    pub fn internal(err: anyhow::Error) -> Self {
        error!("内部错误: {:#}", err);
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::INTERNAL,
            format!("{:#}", err),
        )
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let message = err.to_string();
        match err {
            RegistryError::AlreadyActive(_) => {
                Self::new(StatusCode::CONFLICT, codes::ALREADY_ACTIVE, message)
            }
            RegistryError::NotFound(_) => Self::not_found(message),
            RegistryError::InvalidTransition { .. } => {
                Self::new(StatusCode::CONFLICT, codes::INVALID_TRANSITION, message)
            }
            RegistryError::DeleteFailed { ref source, .. } => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::DELETE_FAILED,
                format!("{} ({}): {}", message, ErrorClass::Filesystem, source),
            ),
            RegistryError::ManagerStopped => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, codes::MANAGER_STOPPED, message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiResponse::<()>::error(self.code, self.message)),
        )
            .into_response()
    }
}
