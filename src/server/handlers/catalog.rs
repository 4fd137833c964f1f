use crate::catalog::{CatalogItem, CatalogSort};
use crate::downloader::TaskState;
use crate::server::{ApiError, ApiResult, AppState};
use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};

use super::ApiResponse;

#[derive(Debug, Deserialize)]
pub struct CatalogQuery {
    pub category: Option<String>,
    pub keyword: Option<String>,
    #[serde(default)]
    pub sort: CatalogSort,
}

/// 目录条目 + 下载状态
#[derive(Debug, Serialize)]
pub struct CatalogEntry {
    pub identity: String,
    #[serde(flatten)]
    pub item: CatalogItem,
    pub downloaded: bool,
    pub downloading: bool,
}

/// GET /api/v1/catalog
/// 下载状态取自注册表快照，不单独维护
pub async fn list_catalog(
    State(app_state): State<AppState>,
    Query(query): Query<CatalogQuery>,
) -> ApiResult<Vec<CatalogEntry>> {
    let snapshot = app_state.download_manager.snapshot().await?;

    let entries = app_state
        .catalog
        .search(
            query.category.as_deref(),
            query.keyword.as_deref(),
            query.sort,
        )
        .into_iter()
        .map(|item| {
            let identity = item.identity();
            let state = snapshot.state_of(&identity);
            CatalogEntry {
                downloaded: state == Some(TaskState::Completed),
                downloading: state == Some(TaskState::Active),
                identity,
                item,
            }
        })
        .collect();

    Ok(Json(ApiResponse::success(entries)))
}

/// POST /api/v1/catalog/reload
pub async fn reload_catalog(State(app_state): State<AppState>) -> ApiResult<usize> {
    let count = app_state.catalog.reload().map_err(ApiError::internal)?;
    Ok(Json(ApiResponse::success(count)))
}
