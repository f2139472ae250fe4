//! 断点续传下载器
//!
//! 流程：
//! 1. 探测数据源是否支持 Range 以及总大小
//! 2. 支持时按分段下载，每个分段直接写入预分配的 `.part` 文件对应偏移，
//!    写完后追加 WAL 记录；中断后重新运行只拉取缺失的分段
//! 3. 不支持时整体下载（不可续传）
//! 4. 全部完成后校验 SHA-256，重命名为最终文件名并清除状态

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::TransferClientError;
use super::segment::SegmentPlan;
use super::source::RangeSource;
use super::state::{TransferState, TransferStateStore};
use crate::checksum::sha256_file;

const PART_SUFFIX: &str = ".part";

/// 单次传输请求
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// 传输ID（同时是状态文件名）
    pub download_id: String,
    /// 输出文件名
    pub filename: String,
    /// 期望的 SHA-256（十六进制），None 表示不校验
    pub expected_sha256: Option<String>,
}

/// 传输结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed {
        path: PathBuf,
        bytes: u64,
        /// 本次运行实际拉取的分段数
        fetched_segments: usize,
        /// 是否走分段模式
        resumable: bool,
    },
    /// 被取消，状态已保留
    Paused {
        retrieved_segments: usize,
        total_segments: usize,
    },
}

/// 断点续传下载器
pub struct ResumableDownloader {
    source: Arc<dyn RangeSource>,
    store: Arc<dyn TransferStateStore>,
    output_dir: PathBuf,
    segment_size: u64,
}

impl ResumableDownloader {
    pub fn new(
        source: Arc<dyn RangeSource>,
        store: Arc<dyn TransferStateStore>,
        output_dir: impl Into<PathBuf>,
        segment_size: u64,
    ) -> Self {
        Self {
            source,
            store,
            output_dir: output_dir.into(),
            segment_size: segment_size.max(1),
        }
    }

    fn part_path(&self, filename: &str) -> PathBuf {
        self.output_dir.join(format!("{}{}", filename, PART_SUFFIX))
    }

    /// 删除 `.part` 文件，不存在时返回 false
    async fn remove_part(&self, filename: &str) -> Result<bool, TransferClientError> {
        match fs::remove_file(self.part_path(filename)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// 执行（或继续）一次传输
    pub async fn download(
        &self,
        request: &TransferRequest,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferClientError> {
        fs::create_dir_all(&self.output_dir).await?;

        let info = self.source.inspect().await?;
        match info.total_bytes {
            Some(total) if info.accepts_ranges && total > 0 => {
                self.download_segmented(request, total, cancel).await
            }
            _ => {
                info!(
                    "数据源不支持分段下载，改为整体下载: {} (accepts_ranges={}, total={:?})",
                    self.source.url(),
                    info.accepts_ranges,
                    info.total_bytes
                );
                self.download_whole(request, cancel).await
            }
        }
    }

    async fn download_segmented(
        &self,
        request: &TransferRequest,
        total_bytes: u64,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferClientError> {
        let plan = SegmentPlan::new(total_bytes, self.segment_size);
        let part_path = self.part_path(&request.filename);

        let (mut state, mut file) = self.prepare(request, total_bytes, &part_path).await?;
        let mut fetched = 0usize;

        for segment in plan.segments() {
            if state.is_retrieved(segment.index) {
                continue;
            }
            if cancel.is_cancelled() {
                file.flush().await?;
                info!(
                    "传输已暂停: id={}, 已完成 {}/{} 分段",
                    request.download_id,
                    state.retrieved_count(),
                    plan.len()
                );
                return Ok(TransferOutcome::Paused {
                    retrieved_segments: state.retrieved_count(),
                    total_segments: plan.len(),
                });
            }

            let data = self.source.fetch_range(segment).await?;
            file.seek(SeekFrom::Start(segment.range.start)).await?;
            file.write_all(&data).await?;
            file.flush().await?;
            file.sync_data().await?;

            // 数据落盘后再写 WAL
            self.store.mark_retrieved(&request.download_id, segment.index)?;
            state.mark_retrieved(segment.index);
            fetched += 1;
            debug!(
                "分段完成: id={}, #{} ({} bytes)",
                request.download_id,
                segment.index,
                segment.size()
            );
        }

        file.sync_all().await?;
        drop(file);

        let path = self.finalize(request, &part_path).await?;
        info!(
            "传输完成: id={}, {} bytes, 本次拉取 {} 个分段",
            request.download_id, total_bytes, fetched
        );
        Ok(TransferOutcome::Completed {
            path,
            bytes: total_bytes,
            fetched_segments: fetched,
            resumable: true,
        })
    }

    /// 加载或新建传输状态，并打开 `.part` 文件
    async fn prepare(
        &self,
        request: &TransferRequest,
        total_bytes: u64,
        part_path: &Path,
    ) -> Result<(TransferState, File), TransferClientError> {
        let existing = self.store.load(&request.download_id)?;

        if let Some(state) = existing {
            let part_len = fs::metadata(part_path).await.ok().map(|m| m.len());
            let stale = state.total_bytes != total_bytes
                || state.segment_size != self.segment_size
                || state.filename != request.filename
                || part_len != Some(total_bytes);

            if !stale {
                if state.is_complete() {
                    info!("所有分段均已下载，直接校验: id={}", request.download_id);
                } else {
                    info!(
                        "继续传输: id={}, 已完成 {}/{} 分段",
                        request.download_id,
                        state.retrieved_count(),
                        state.total_segments()
                    );
                }
                let file = OpenOptions::new().write(true).open(part_path).await?;
                return Ok((state, file));
            }

            warn!(
                "传输状态与数据源不一致，重新开始: id={} (记录 {} bytes / 分段 {}, 现在 {} bytes / 分段 {})",
                request.download_id,
                state.total_bytes,
                state.segment_size,
                total_bytes,
                self.segment_size
            );
            if state.filename != request.filename && self.remove_part(&state.filename).await? {
                debug!("已删除旧的分段文件: {}{}", state.filename, PART_SUFFIX);
            }
            self.store.clear(&request.download_id)?;
        }

        let state = TransferState::new(
            request.download_id.clone(),
            self.source.url(),
            request.filename.clone(),
            total_bytes,
            self.segment_size,
        );
        self.store.save(&state)?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(part_path)
            .await?;
        file.set_len(total_bytes).await?;
        debug!("已预分配文件: {:?} ({} bytes)", part_path, total_bytes);

        Ok((state, file))
    }

    async fn download_whole(
        &self,
        request: &TransferRequest,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferClientError> {
        if cancel.is_cancelled() {
            return Ok(TransferOutcome::Paused {
                retrieved_segments: 0,
                total_segments: 0,
            });
        }

        // 旧的分段状态对整体下载没有意义
        self.store.clear(&request.download_id)?;

        let part_path = self.part_path(&request.filename);
        let mut file = File::create(&part_path).await?;
        let mut stream = self.source.fetch_full().await?;
        let mut bytes = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            bytes += chunk.len() as u64;
        }
        file.sync_all().await?;
        drop(file);

        let path = self.finalize(request, &part_path).await?;
        info!("整体下载完成: id={}, {} bytes", request.download_id, bytes);
        Ok(TransferOutcome::Completed {
            path,
            bytes,
            fetched_segments: 0,
            resumable: false,
        })
    }

    /// 校验、重命名并清除状态；校验失败时保留 `.part` 和状态
    async fn finalize(
        &self,
        request: &TransferRequest,
        part_path: &Path,
    ) -> Result<PathBuf, TransferClientError> {
        if let Some(expected) = &request.expected_sha256 {
            let path = part_path.to_path_buf();
            let actual = tokio::task::spawn_blocking(move || sha256_file(&path))
                .await
                .map_err(|e| TransferClientError::Worker(e.to_string()))??;
            if !actual.eq_ignore_ascii_case(expected) {
                warn!(
                    "校验和不匹配: id={}, 期望 {}, 实际 {}",
                    request.download_id, expected, actual
                );
                return Err(TransferClientError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let final_path = self.output_dir.join(&request.filename);
        if fs::metadata(&final_path).await.is_ok() {
            fs::remove_file(&final_path).await?;
        }
        fs::rename(part_path, &final_path).await?;
        self.store.clear(&request.download_id)?;
        Ok(final_path)
    }

    /// 放弃传输：删除状态和 `.part` 文件
    ///
    /// 没有状态时按 `filename` 删除遗留的 `.part`；返回是否清理了任何东西
    pub async fn cancel(
        &self,
        download_id: &str,
        filename: Option<&str>,
    ) -> Result<bool, TransferClientError> {
        let Some(state) = self.store.load(download_id)? else {
            let removed = match filename {
                Some(filename) => self.remove_part(filename).await?,
                None => false,
            };
            if removed {
                info!("已删除遗留的分段文件: id={}", download_id);
            }
            return Ok(removed);
        };

        self.remove_part(&state.filename).await?;
        if let Some(filename) = filename.filter(|f| *f != state.filename) {
            self.remove_part(filename).await?;
        }
        self.store.clear(download_id)?;
        info!("已取消传输: id={}", download_id);
        Ok(true)
    }
}
