use crate::server::{ApiError, ApiResult, AppState};
use axum::{extract::State, response::Json};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

use super::ApiResponse;

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadDirPayload {
    pub download_dir: PathBuf,
}

/// GET /api/v1/config/download-dir
pub async fn get_download_dir(State(app_state): State<AppState>) -> ApiResult<DownloadDirPayload> {
    let download_dir = app_state.config.snapshot().download.download_dir;
    Ok(Json(ApiResponse::success(DownloadDirPayload { download_dir })))
}

/// PUT /api/v1/config/download-dir
/// 修改下载目录，进行中的任务不受影响，之后的文件操作使用新目录
pub async fn update_download_dir(
    State(app_state): State<AppState>,
    Json(payload): Json<DownloadDirPayload>,
) -> ApiResult<DownloadDirPayload> {
    if payload.download_dir.as_os_str().is_empty() {
        return Err(ApiError::bad_request("下载目录不能为空"));
    }

    info!("API: 更新下载目录 {:?}", payload.download_dir);
    app_state
        .config
        .set_download_dir(payload.download_dir.clone())
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(ApiResponse::success(payload)))
}
