//! 对象存储网关
//!
//! 打包引擎只通过 `ObjectStore` 读取对象字节，具体后端由配置选择：
//! - `LocalObjectStore`: 本地目录，键为根目录下的相对路径
//! - `HttpObjectStore`: 远端 HTTP 服务，`HEAD`/`GET {base_url}/{key}`

pub mod http;
pub mod local;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

pub use http::HttpObjectStore;
pub use local::LocalObjectStore;

/// 对象元信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    /// 对象是否存在
    pub exists: bool,
    /// 对象大小（不存在时为 0）
    pub size: u64,
}

impl ObjectMeta {
    pub fn missing() -> Self {
        Self {
            exists: false,
            size: 0,
        }
    }
}

/// 对象存储错误
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("对象不存在: {0}")]
    NotFound(String),
    #[error("打开对象超时 ({0:?})")]
    Timeout(Duration),
    #[error("对象存储暂时不可用: {0}")]
    Transient(String),
}

/// 对象字节流
pub type ByteStream = BoxStream<'static, Result<Bytes, ObjectStoreError>>;

/// 对象存储接口
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// 查询对象是否存在及其大小
    async fn head_metadata(&self, key: &str) -> Result<ObjectMeta, ObjectStoreError>;

    /// 打开对象读取流，打开过程受 `timeout` 约束
    async fn open_read_stream(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<ByteStream, ObjectStoreError>;
}
