use crate::downloader::{DownloadRequest, DownloadTask, RegistrySnapshot};
use crate::server::{ApiError, ApiResult, AppState};
use axum::{
    extract::{Path, State},
    response::Json,
};
use tracing::info;

use super::ApiResponse;

/// POST /api/v1/downloads
/// 提交下载请求
pub async fn create_download(
    State(app_state): State<AppState>,
    Json(req): Json<DownloadRequest>,
) -> ApiResult<DownloadTask> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("应用名称不能为空"));
    }

    info!("API: 提交下载 {}", req.identity());
    let task = app_state.download_manager.submit(req).await?;
    Ok(Json(ApiResponse::success(task)))
}

/// POST /api/v1/downloads/catalog/:identity
/// 按应用目录中的元数据提交下载
pub async fn create_catalog_download(
    State(app_state): State<AppState>,
    Path(identity): Path<String>,
) -> ApiResult<DownloadTask> {
    let item = app_state
        .catalog
        .find(&identity)
        .ok_or_else(|| ApiError::not_found(format!("应用目录中不存在: {}", identity)))?;

    info!("API: 从应用目录提交下载 {}", identity);
    let task = app_state.download_manager.submit(item.to_request()).await?;
    Ok(Json(ApiResponse::success(task)))
}

/// GET /api/v1/downloads
/// 获取所有分区的任务
pub async fn list_downloads(State(app_state): State<AppState>) -> ApiResult<RegistrySnapshot> {
    let snapshot = app_state.download_manager.snapshot().await?;
    Ok(Json(ApiResponse::success(snapshot)))
}

/// GET /api/v1/downloads/:identity
pub async fn get_download(
    State(app_state): State<AppState>,
    Path(identity): Path<String>,
) -> ApiResult<DownloadTask> {
    match app_state.download_manager.get(&identity).await? {
        Some(task) => Ok(Json(ApiResponse::success(task))),
        None => Err(ApiError::not_found(format!("任务不存在: {}", identity))),
    }
}

/// POST /api/v1/downloads/:identity/cancel
pub async fn cancel_download(
    State(app_state): State<AppState>,
    Path(identity): Path<String>,
) -> ApiResult<String> {
    app_state.download_manager.cancel(&identity).await?;
    Ok(Json(ApiResponse::success(identity)))
}

/// POST /api/v1/downloads/:identity/redownload
pub async fn redownload(
    State(app_state): State<AppState>,
    Path(identity): Path<String>,
) -> ApiResult<DownloadTask> {
    let task = app_state.download_manager.redownload(&identity).await?;
    Ok(Json(ApiResponse::success(task)))
}

/// DELETE /api/v1/downloads/:identity
/// 删除已完成任务的产物文件
pub async fn delete_download(
    State(app_state): State<AppState>,
    Path(identity): Path<String>,
) -> ApiResult<String> {
    app_state.download_manager.delete_artifact(&identity).await?;
    info!("API: 已删除 {}", identity);
    Ok(Json(ApiResponse::success(identity)))
}
