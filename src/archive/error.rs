//! 归档子系统错误类型

use std::time::Duration;

use thiserror::Error;

use crate::metadata::MetadataError;
use crate::storage::ObjectStoreError;

/// 选择解析错误（致命，任务直接失败）
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("选择内容为空，没有可下载的文件")]
    SelectionEmpty,
    #[error("未找到: {0}")]
    NotFound(String),
    #[error("无权访问: {0}")]
    AccessDenied(String),
    #[error("元数据查询失败: {0}")]
    Store(#[from] MetadataError),
}

/// 单个文件拉取错误（只影响该文件）
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("对象不存在: {0}")]
    Missing(String),
    #[error("拉取超时 ({0:?})")]
    Timeout(Duration),
    #[error("临时错误: {0}")]
    Transient(String),
}

impl FetchError {
    /// 只有"对象不存在"不重试
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Missing(_))
    }
}

impl From<ObjectStoreError> for FetchError {
    fn from(e: ObjectStoreError) -> Self {
        match e {
            ObjectStoreError::NotFound(key) => FetchError::Missing(key),
            ObjectStoreError::Timeout(d) => FetchError::Timeout(d),
            ObjectStoreError::Transient(msg) => FetchError::Transient(msg),
        }
    }
}

/// 归档输出错误（致命，归档无法挽救）
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("归档写入IO错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("ZIP 写入错误: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("归档已经完成，不能再写入")]
    AlreadyFinalized,
    #[error("当前没有打开的归档条目")]
    NoOpenEntry,
    #[error("归档写入线程异常: {0}")]
    Worker(String),
}

/// 打包错误
#[derive(Debug, Error)]
pub enum PackError {
    #[error("选择内容为空，没有可打包的文件")]
    SelectionEmpty,
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// 任务注册表错误
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("同时进行的下载任务过多 ({active}/{limit})")]
    TooManyConcurrentDownloads { active: usize, limit: usize },
    #[error("任务不存在: {0}")]
    JobNotFound(String),
    #[error("任务已结束，不能再修改: {0}")]
    JobFinished(String),
    #[error("任务文件总数已确定，不能修改: {0}")]
    TotalFilesFixed(String),
}
