//! 下载任务数据结构

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 选择类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// 整个文件夹（递归）
    Folder,
    /// 显式文件ID列表
    Files,
    /// 整个项目
    Project,
}

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// 打包中
    Active,
    /// 已完成（可能含部分失败文件）
    Completed,
    /// 失败
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Active)
    }
}

/// 错误账本条目，每个最终失败的文件恰好一条
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorLedgerEntry {
    pub file_id: String,
    pub file_name: String,
    /// 失败原因
    pub reason: String,
    /// 放弃时的尝试次数（从 1 开始）
    pub attempt: u32,
}

/// 进度快照
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobProgress {
    /// 已处理文件数（成功 + 失败）
    pub processed_files: usize,
    pub total_files: usize,
    /// 最近处理完的文件
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    /// 百分比 0.0 ~ 100.0
    pub percentage: f64,
    pub error_count: usize,
}

impl JobProgress {
    pub fn new(processed_files: usize, total_files: usize, error_count: usize) -> Self {
        let percentage = if total_files == 0 {
            0.0
        } else {
            processed_files as f64 / total_files as f64 * 100.0
        };
        Self {
            processed_files,
            total_files,
            current_file: None,
            percentage,
            error_count,
        }
    }
}

/// 完成后的归档信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    /// 服务端归档文件路径
    pub path: PathBuf,
    /// 归档大小（字节）
    pub size: u64,
    /// 归档 SHA-256（十六进制）
    pub sha256: String,
}

/// 下载任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    /// 任务ID
    pub job_id: String,
    /// 所有者ID
    pub owner_id: String,
    pub kind: JobKind,
    /// 选择的源ID（文件夹 / 文件 / 项目）
    pub source_ids: Vec<String>,
    /// 解析出的文件总数，解析后不再变化
    pub total_files: usize,
    /// 预估大小（仅供参考）
    pub total_bytes_estimate: u64,
    pub status: JobStatus,
    /// 开始时间 (Unix 毫秒时间戳)
    pub started_at: i64,
    /// 最后更新时间 (Unix 毫秒时间戳)
    pub last_update: i64,
    /// 结束时间 (Unix 毫秒时间戳)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    pub progress: JobProgress,
    pub error_ledger: Vec<ErrorLedgerEntry>,
    /// 致命错误原因（仅 failed）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 下载文件名
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_sha256: Option<String>,
    /// 服务端归档路径，不对外暴露
    #[serde(skip)]
    pub archive_path: Option<PathBuf>,
}

impl DownloadJob {
    pub fn new(kind: JobKind, owner_id: String, source_ids: Vec<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            job_id: Uuid::new_v4().to_string(),
            owner_id,
            kind,
            source_ids,
            total_files: 0,
            total_bytes_estimate: 0,
            status: JobStatus::Active,
            started_at: now,
            last_update: now,
            finished_at: None,
            progress: JobProgress::default(),
            error_ledger: Vec::new(),
            error: None,
            archive_name: None,
            archive_size: None,
            archive_sha256: None,
            archive_path: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == JobStatus::Active
    }
}
