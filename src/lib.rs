// Bulk Archive Library
// 批量归档下载服务核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 元数据（文件 / 文件夹 / 项目）模块
pub mod metadata;

// 对象存储网关模块
pub mod storage;

// 归档模块：选择解析、并发拉取打包、任务注册表
pub mod archive;

// 断点续传客户端模块
pub mod resumable;

// Web服务器模块
pub mod server;

// 文件校验
pub mod checksum;

// 导出常用类型
pub use archive::{
    ArchiveService, DownloadJob, DownloadJobRegistry, JobKind, JobStatus, PackEngine,
    SelectionResolver,
};
pub use config::AppConfig;
pub use metadata::{MetadataStore, SqliteMetadataStore};
pub use resumable::{FileStateStore, HttpRangeSource, ResumableDownloader, TransferOutcome};
pub use server::AppState;
pub use storage::{HttpObjectStore, LocalObjectStore, ObjectStore};
