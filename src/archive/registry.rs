//! 下载任务注册表
//!
//! 所有任务条目的唯一所有者：
//! - 创建任务时按用户检查并发上限（写锁内完成，不存在竞态）
//! - 打包过程中的进度 / 错误账本 / 终态都通过 `update` 写入
//! - 后台清理任务按保留策略删除过期条目及其归档文件

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::error::RegistryError;
use super::job::{ArchiveInfo, DownloadJob, ErrorLedgerEntry, JobKind, JobProgress, JobStatus};
use crate::config::RegistryConfig;

/// 解析完成后写入的一次性信息
#[derive(Debug, Clone)]
pub struct ResolvedTotals {
    pub total_files: usize,
    pub total_bytes_estimate: u64,
    pub archive_name: String,
}

/// 终态转换
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(ArchiveInfo),
    Failed(String),
}

/// 任务的部分更新
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub resolved: Option<ResolvedTotals>,
    pub progress: Option<JobProgress>,
    pub ledger_entries: Vec<ErrorLedgerEntry>,
    pub outcome: Option<JobOutcome>,
}

impl JobUpdate {
    pub fn progress(progress: JobProgress) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn ledger_entry(entry: ErrorLedgerEntry) -> Self {
        Self {
            ledger_entries: vec![entry],
            ..Default::default()
        }
    }
}

/// 下载任务注册表
#[derive(Debug)]
pub struct DownloadJobRegistry {
    jobs: RwLock<HashMap<String, DownloadJob>>,
    config: RegistryConfig,
}

impl DownloadJobRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// 创建任务
    ///
    /// 用户已有的进行中任务数达到上限时拒绝，且不会创建任何条目
    pub fn start(
        &self,
        kind: JobKind,
        owner_id: &str,
        source_ids: Vec<String>,
    ) -> Result<String, RegistryError> {
        let mut jobs = self.jobs.write();

        let active = jobs
            .values()
            .filter(|job| job.owner_id == owner_id && job.is_active())
            .count();
        let limit = self.config.max_active_jobs_per_owner;
        if active >= limit {
            warn!(
                "用户 {} 进行中的任务已达上限 ({}/{})，拒绝新任务",
                owner_id, active, limit
            );
            return Err(RegistryError::TooManyConcurrentDownloads { active, limit });
        }

        let job = DownloadJob::new(kind, owner_id.to_string(), source_ids);
        let job_id = job.job_id.clone();
        info!(
            "创建下载任务: id={}, owner={}, kind={:?}, sources={}",
            job_id,
            owner_id,
            kind,
            job.source_ids.len()
        );
        jobs.insert(job_id.clone(), job);

        Ok(job_id)
    }

    /// 获取任务快照
    pub fn get(&self, job_id: &str) -> Option<DownloadJob> {
        self.jobs.read().get(job_id).cloned()
    }

    /// 列出用户的任务，最新的在前
    pub fn list(&self, owner_id: &str) -> Vec<DownloadJob> {
        let mut jobs: Vec<DownloadJob> = self
            .jobs
            .read()
            .values()
            .filter(|job| job.owner_id == owner_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        jobs
    }

    /// 应用部分更新
    pub fn update(&self, job_id: &str, update: JobUpdate) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| RegistryError::JobNotFound(job_id.to_string()))?;

        if job.status.is_terminal() {
            return Err(RegistryError::JobFinished(job_id.to_string()));
        }

        if let Some(resolved) = update.resolved {
            if job.archive_name.is_some() {
                return Err(RegistryError::TotalFilesFixed(job_id.to_string()));
            }
            job.total_files = resolved.total_files;
            job.total_bytes_estimate = resolved.total_bytes_estimate;
            job.archive_name = Some(resolved.archive_name);
            job.progress = JobProgress::new(0, resolved.total_files, 0);
        }

        if let Some(progress) = update.progress {
            // 已处理数只增不减
            if progress.processed_files >= job.progress.processed_files {
                job.progress = JobProgress {
                    total_files: job.total_files,
                    ..progress
                };
            }
        }

        job.error_ledger.extend(update.ledger_entries);

        let now = chrono::Utc::now().timestamp_millis();
        match update.outcome {
            Some(JobOutcome::Completed(info)) => {
                info!(
                    "任务完成: id={}, size={} bytes, 失败文件={}",
                    job_id,
                    info.size,
                    job.error_ledger.len()
                );
                job.status = JobStatus::Completed;
                job.finished_at = Some(now);
                job.archive_size = Some(info.size);
                job.archive_sha256 = Some(info.sha256);
                job.archive_path = Some(info.path);
            }
            Some(JobOutcome::Failed(reason)) => {
                error!("任务失败: id={}, 原因: {}", job_id, reason);
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
                job.error = Some(reason);
            }
            None => {}
        }

        job.last_update = now;
        Ok(())
    }

    pub fn complete(&self, job_id: &str, info: ArchiveInfo) -> Result<(), RegistryError> {
        self.update(
            job_id,
            JobUpdate {
                outcome: Some(JobOutcome::Completed(info)),
                ..Default::default()
            },
        )
    }

    pub fn fail(&self, job_id: &str, reason: impl Into<String>) -> Result<(), RegistryError> {
        self.update(
            job_id,
            JobUpdate {
                outcome: Some(JobOutcome::Failed(reason.into())),
                ..Default::default()
            },
        )
    }

    /// 刷新最后访问时间（归档正在被下载时保持存活）
    pub fn touch(&self, job_id: &str) -> bool {
        match self.jobs.write().get_mut(job_id) {
            Some(job) => {
                job.last_update = chrono::Utc::now().timestamp_millis();
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // 清理
    // ========================================================================

    /// 按当前时间清理，并删除被移除任务的归档文件
    pub fn sweep(&self) -> Vec<DownloadJob> {
        let removed = self.sweep_at(chrono::Utc::now().timestamp_millis());
        for job in &removed {
            if let Some(path) = &job.archive_path {
                match std::fs::remove_file(path) {
                    Ok(()) => debug!("已删除过期归档: {:?}", path),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("删除过期归档失败: {:?}, 错误: {}", path, e),
                }
            }
        }
        removed
    }

    /// 按给定时间移除过期任务，返回被移除的任务
    ///
    /// 进行中的任务永不移除；已完成任务超过宽限期移除；失败任务超过保留期移除
    pub fn sweep_at(&self, now_ms: i64) -> Vec<DownloadJob> {
        let grace = self.config.completion_grace_ms();
        let retention = self.config.retention_ms();

        let mut jobs = self.jobs.write();
        let expired: Vec<String> = jobs
            .values()
            .filter(|job| {
                let idle = now_ms - job.last_update;
                match job.status {
                    JobStatus::Active => false,
                    JobStatus::Completed => idle > grace,
                    JobStatus::Failed => idle > retention,
                }
            })
            .map(|job| job.job_id.clone())
            .collect();

        let removed: Vec<DownloadJob> = expired
            .iter()
            .filter_map(|id| jobs.remove(id))
            .collect();

        if !removed.is_empty() {
            info!("清理过期任务: {} 个, 剩余 {} 个", removed.len(), jobs.len());
        }
        removed
    }

    /// 启动后台清理任务，收到关闭信号后退出
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // 第一次 tick 立即返回，跳过它
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = registry.sweep();
                        debug!("任务清理检查完成，移除 {} 个", removed.len());
                    }
                    _ = shutdown_rx.recv() => {
                        info!("收到关闭信号，任务清理循环退出");
                        break;
                    }
                }
            }
        })
    }
}
