//! 归档子系统
//!
//! 选择解析 → 并发拉取打包 → 任务注册表，`service` 把三者串成一次下载请求

pub mod engine;
pub mod error;
pub mod job;
pub mod naming;
pub mod registry;
pub mod resolver;
pub mod service;
pub mod sink;

pub use engine::{PackEngine, PackEvent, PackOptions, PackReport};
pub use error::{FetchError, PackError, RegistryError, ResolveError, SinkError};
pub use job::{ArchiveInfo, DownloadJob, ErrorLedgerEntry, JobKind, JobProgress, JobStatus};
pub use naming::{sanitize_component, EntryNamer};
pub use registry::{DownloadJobRegistry, JobOutcome, JobUpdate, ResolvedTotals};
pub use resolver::{ResolvedFile, ResolvedSelection, Selection, SelectionResolver};
pub use service::{ArchiveService, CreateArchiveRequest, CreateError, CreatedArchive};
pub use sink::{ArchiveSink, ZipArchiveSink};
