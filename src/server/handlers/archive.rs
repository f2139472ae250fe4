// 归档下载 API 处理器

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, Request, State},
    http::{header, HeaderValue},
    response::Response,
    Json,
};
use serde::{Deserialize, Serialize};
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, info};

use crate::archive::{CreateArchiveRequest, DownloadJob, JobKind, JobStatus};
use crate::server::auth::CallerId;
use crate::server::error::{ApiError, ApiResult};
use crate::server::AppState;

use super::ApiResponse;

/// 创建归档请求体
#[derive(Debug, Deserialize)]
pub struct CreateArchiveBody {
    pub kind: JobKind,
    #[serde(alias = "sourceIds")]
    pub source_ids: Vec<String>,
    #[serde(default)]
    pub options: ArchiveOptions,
}

/// 可选参数
#[derive(Debug, Default, Deserialize)]
pub struct ArchiveOptions {
    /// 是否保留目录结构（不传则使用配置）
    #[serde(default, alias = "preserveStructure")]
    pub preserve_structure: Option<bool>,
}

/// 创建归档响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateArchiveResponse {
    pub download_id: String,
    pub filename: String,
    pub total_files: usize,
    /// 预估大小，仅供参考
    pub estimated_size: u64,
    /// 归档内容地址（完成后可下载）
    pub download_url: String,
}

/// POST /api/v1/archives
/// 创建归档任务，打包在后台进行
pub async fn create_archive(
    State(state): State<AppState>,
    CallerId(owner): CallerId,
    payload: Result<Json<CreateArchiveBody>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<CreateArchiveResponse>>> {
    let Json(body) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    info!(
        "API: 创建归档 owner={}, kind={:?}, sources={}",
        owner,
        body.kind,
        body.source_ids.len()
    );

    let request = CreateArchiveRequest {
        kind: body.kind,
        source_ids: body.source_ids,
        preserve_structure: body.options.preserve_structure,
    };
    // 后台任务自行把结果写回注册表
    let (created, _handle) = state.service.create(&owner, request).await?;

    Ok(Json(ApiResponse::success(CreateArchiveResponse {
        download_url: format!("/api/v1/archives/{}/content", created.job_id),
        download_id: created.job_id,
        filename: created.filename,
        total_files: created.total_files,
        estimated_size: created.estimated_size,
    })))
}

/// GET /api/v1/archives
/// 获取调用方的所有归档任务
pub async fn list_archives(
    State(state): State<AppState>,
    CallerId(owner): CallerId,
) -> Json<ApiResponse<Vec<DownloadJob>>> {
    Json(ApiResponse::success(state.registry.list(&owner)))
}

/// GET /api/v1/archives/:id
/// 获取任务进度快照
pub async fn get_archive(
    State(state): State<AppState>,
    CallerId(owner): CallerId,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<DownloadJob>>> {
    let job = owned_job(&state, &owner, &id)?;
    Ok(Json(ApiResponse::success(job)))
}

/// GET|HEAD /api/v1/archives/:id/content
/// 下载归档内容，支持 Range
pub async fn get_archive_content(
    State(state): State<AppState>,
    CallerId(owner): CallerId,
    Path(id): Path<String>,
    request: Request,
) -> ApiResult<Response> {
    let job = owned_job(&state, &owner, &id)?;
    let path = match job.status {
        JobStatus::Active => return Err(ApiError::ArchiveNotReady),
        JobStatus::Failed => {
            return Err(ApiError::Gone(
                job.error
                    .unwrap_or_else(|| "归档生成失败".to_string()),
            ))
        }
        JobStatus::Completed => job
            .archive_path
            .clone()
            .ok_or_else(|| ApiError::Internal(format!("归档路径缺失: {}", id)))?,
    };

    state.registry.touch(&id);
    debug!(
        "API: 下载归档 id={}, range={:?}",
        id,
        request.headers().get(header::RANGE)
    );

    let response = match ServeFile::new(&path).oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    let mut response = response.map(Body::new);

    if response.status().is_success() {
        let filename = job
            .archive_name
            .unwrap_or_else(|| format!("{}.zip", job.job_id));
        if let Ok(value) = HeaderValue::from_str(&content_disposition(&filename)) {
            response
                .headers_mut()
                .insert(header::CONTENT_DISPOSITION, value);
        }
    }
    Ok(response)
}

/// 其他用户的任务一律按不存在处理
fn owned_job(state: &AppState, owner: &str, id: &str) -> ApiResult<DownloadJob> {
    state
        .registry
        .get(id)
        .filter(|job| job.owner_id == owner)
        .ok_or_else(|| ApiError::NotFound(format!("任务不存在: {}", id)))
}

/// `attachment; filename="ascii"; filename*=UTF-8''percent-encoded`
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(filename)
    )
}
