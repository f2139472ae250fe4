//! archive-fetch: 等待归档任务完成后断点续传下载
//!
//! Ctrl+C 暂停（保留进度），再次运行同样的命令继续；`--cancel` 放弃并清理

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use bulk_archive::{
    archive::{DownloadJob, JobStatus},
    config::{AppConfig, LogConfig},
    logging,
    resumable::{
        FileStateStore, HttpRangeSource, ResumableDownloader, TransferOutcome, TransferRequest,
    },
    server::auth::OWNER_HEADER,
};
use clap::Parser;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "archive-fetch", version, about = "下载（可续传）一个归档")]
struct Args {
    /// 服务地址，如 http://127.0.0.1:18890
    base_url: String,

    /// 归档任务ID（创建归档时返回的 downloadId）
    archive_id: String,

    /// 调用方ID
    #[arg(long, env = "BULK_ARCHIVE_OWNER")]
    owner: String,

    /// 配置文件（读取 [client] 默认值）
    #[arg(short, long, default_value = "config/app.toml")]
    config: PathBuf,

    /// 输出目录
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// 传输状态目录
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// 分段大小（字节）
    #[arg(long)]
    segment_size: Option<u64>,

    /// 轮询任务状态的间隔（毫秒）
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// 放弃传输并删除本地状态
    #[arg(long)]
    cancel: bool,

    /// 输出调试日志
    #[arg(short, long)]
    verbose: bool,
}

/// 服务端统一响应
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i32,
    message: String,
    data: Option<T>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _log_guard = logging::init_logging(&LogConfig {
        enabled: false,
        level: if args.verbose { "debug" } else { "info" }.to_string(),
        ..LogConfig::default()
    });

    let client_config = match AppConfig::load_from_file(&args.config.to_string_lossy()).await {
        Ok(config) => config.client,
        Err(_) => AppConfig::default().client,
    };
    let output_dir = args.output_dir.clone().unwrap_or(client_config.output_dir);
    let state_dir = args.state_dir.clone().unwrap_or(client_config.state_dir);
    let segment_size = args.segment_size.unwrap_or(client_config.segment_size);
    if segment_size == 0 {
        bail!("--segment-size 必须大于 0");
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        OWNER_HEADER,
        HeaderValue::from_str(&args.owner).context("调用方ID包含非法字符")?,
    );
    let http = reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .context("创建HTTP客户端失败")?;

    let base_url = args.base_url.trim_end_matches('/').to_string();
    let job_url = format!("{}/api/v1/archives/{}", base_url, args.archive_id);
    let content_url = format!("{}/content", job_url);

    let downloader = ResumableDownloader::new(
        Arc::new(HttpRangeSource::new(http.clone(), content_url)),
        Arc::new(FileStateStore::new(state_dir)),
        output_dir,
        segment_size,
    );

    if args.cancel {
        // 本地没有状态时，按服务端记录的文件名清理遗留的 .part
        let filename = match fetch_job(&http, &job_url).await {
            Ok(job) => Some(archive_filename(&job)),
            Err(e) => {
                warn!("查询任务失败，只清理本地状态: {:#}", e);
                None
            }
        };
        if downloader.cancel(&args.archive_id, filename.as_deref()).await? {
            info!("已放弃传输并清理本地状态: {}", args.archive_id);
        } else {
            info!("没有找到传输状态: {}", args.archive_id);
        }
        return Ok(());
    }

    let Some(job) = wait_for_archive(
        &http,
        &job_url,
        Duration::from_millis(args.poll_interval_ms.max(100)),
    )
    .await?
    else {
        return Ok(());
    };

    let filename = archive_filename(&job);
    if job.progress.error_count > 0 {
        warn!(
            "归档包含 {} 个失败文件，详见归档内 _errors/ 目录",
            job.progress.error_count
        );
    }

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到 Ctrl+C，当前分段完成后暂停...");
            ctrl_c_token.cancel();
        }
    });

    let request = TransferRequest {
        download_id: args.archive_id.clone(),
        filename,
        expected_sha256: job.archive_sha256.clone(),
    };
    match downloader.download(&request, &cancel).await? {
        TransferOutcome::Completed {
            path,
            bytes,
            fetched_segments,
            resumable,
        } => {
            info!(
                "下载完成: {:?} ({} bytes, 本次拉取分段 {}, 分段模式 {})",
                path, bytes, fetched_segments, resumable
            );
        }
        TransferOutcome::Paused {
            retrieved_segments,
            total_segments,
        } => {
            info!(
                "已暂停: {}/{} 分段已保存，重新运行同样的命令即可继续",
                retrieved_segments, total_segments
            );
        }
    }

    Ok(())
}

/// 本地输出文件名
fn archive_filename(job: &DownloadJob) -> String {
    job.archive_name
        .as_deref()
        .and_then(|name| Path::new(name).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}.zip", job.job_id))
}

/// 查询一次任务状态
async fn fetch_job(http: &reqwest::Client, job_url: &str) -> anyhow::Result<DownloadJob> {
    let resp = http
        .get(job_url)
        .send()
        .await
        .with_context(|| format!("查询任务状态失败: {}", job_url))?;
    let status = resp.status();
    let envelope: Envelope<DownloadJob> = resp
        .json()
        .await
        .with_context(|| format!("解析任务状态失败 (HTTP {})", status))?;
    match envelope.data {
        Some(job) if envelope.code == 0 => Ok(job),
        _ => bail!("查询任务失败 ({}): {}", envelope.code, envelope.message),
    }
}

/// 轮询任务直到完成；Ctrl+C 时返回 None
async fn wait_for_archive(
    http: &reqwest::Client,
    job_url: &str,
    poll_interval: Duration,
) -> anyhow::Result<Option<DownloadJob>> {
    loop {
        let job = fetch_job(http, job_url).await?;

        match job.status {
            JobStatus::Completed => return Ok(Some(job)),
            JobStatus::Failed => bail!(
                "归档生成失败: {}",
                job.error.as_deref().unwrap_or("未知原因")
            ),
            JobStatus::Active => {
                info!(
                    "打包中: {}/{} ({:.1}%), 失败 {}",
                    job.progress.processed_files,
                    job.progress.total_files,
                    job.progress.percentage,
                    job.progress.error_count
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("收到 Ctrl+C，停止等待");
                return Ok(None);
            }
        }
    }
}
