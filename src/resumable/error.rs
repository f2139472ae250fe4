//! 断点续传客户端错误

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferClientError {
    #[error("HTTP请求失败: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP错误: {0}")]
    Status(u16),
    #[error("服务器忽略了 Range 请求 (bytes={start}-{end})")]
    RangeIgnored { start: u64, end: u64 },
    #[error("分段长度不符: 期望 {expected} bytes, 实际 {actual} bytes")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("校验和不匹配: 期望 {expected}, 实际 {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("后台线程异常: {0}")]
    Worker(String),
}

impl TransferClientError {
    /// 网络层面的失败，调用方可以从当前进度重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferClientError::Request(_)
                | TransferClientError::Status(_)
                | TransferClientError::LengthMismatch { .. }
        )
    }
}
