//! 归档下载服务
//!
//! 一次请求的完整流程：
//! 1. 注册任务（检查用户并发上限）
//! 2. 解析选择，失败则任务进入 failed
//! 3. 写入文件总数 / 预估大小 / 文件名
//! 4. 后台打包到 `{archive_dir}/{job_id}.zip`，进度实时写回注册表
//! 5. 完成后计算 SHA-256 并标记 completed；归档写入失败则删除半成品并标记 failed

use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::engine::{PackEngine, PackEvent};
use super::error::{RegistryError, ResolveError};
use super::job::{ArchiveInfo, JobKind};
use super::naming::sanitize_component;
use super::registry::{DownloadJobRegistry, JobUpdate, ResolvedTotals};
use super::resolver::{ResolvedFile, Selection, SelectionResolver};
use super::sink::ZipArchiveSink;
use crate::checksum::sha256_file;
use crate::config::ArchiveConfig;

/// 创建归档请求
#[derive(Debug, Clone)]
pub struct CreateArchiveRequest {
    pub kind: JobKind,
    pub source_ids: Vec<String>,
    /// 覆盖配置中的 preserve_structure
    pub preserve_structure: Option<bool>,
}

/// 创建成功后返回给调用方的信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedArchive {
    pub job_id: String,
    pub filename: String,
    pub total_files: usize,
    /// 预估大小，仅供参考
    pub estimated_size: u64,
}

/// 创建归档失败
#[derive(Debug, Error)]
pub enum CreateError {
    #[error("请求参数错误: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// 归档下载服务
#[derive(Clone)]
pub struct ArchiveService {
    registry: Arc<DownloadJobRegistry>,
    resolver: SelectionResolver,
    engine: PackEngine,
    config: ArchiveConfig,
}

impl ArchiveService {
    pub fn new(
        registry: Arc<DownloadJobRegistry>,
        resolver: SelectionResolver,
        engine: PackEngine,
        config: ArchiveConfig,
    ) -> Self {
        Self {
            registry,
            resolver,
            engine,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<DownloadJobRegistry> {
        &self.registry
    }

    /// 创建归档任务并在后台开始打包
    ///
    /// 返回的 JoinHandle 在打包结束（成功或失败）后完成
    pub async fn create(
        &self,
        owner_id: &str,
        request: CreateArchiveRequest,
    ) -> Result<(CreatedArchive, JoinHandle<()>), CreateError> {
        let selection = to_selection(&request)?;

        let job_id = self
            .registry
            .start(request.kind, owner_id, request.source_ids.clone())?;

        let resolved = match self.resolver.resolve(owner_id, &selection).await {
            Ok(resolved) => resolved,
            Err(e) => {
                if let Err(update_err) = self.registry.fail(&job_id, e.to_string()) {
                    warn!("标记任务失败时出错: {}", update_err);
                }
                return Err(e.into());
            }
        };

        let filename = format!("{}.zip", sanitize_component(&resolved.root_name, 120));
        let total_files = resolved.files.len();
        let estimated_size = (resolved.total_bytes() as f64 * self.config.estimate_ratio) as u64;

        self.registry.update(
            &job_id,
            JobUpdate {
                resolved: Some(ResolvedTotals {
                    total_files,
                    total_bytes_estimate: estimated_size,
                    archive_name: filename.clone(),
                }),
                ..Default::default()
            },
        )?;

        let engine = match request.preserve_structure {
            Some(preserve) => self.engine.with_preserve_structure(preserve),
            None => self.engine.clone(),
        };
        let registry = Arc::clone(&self.registry);
        let archive_path = self.config.archive_dir.join(format!("{}.zip", job_id));
        let build_job_id = job_id.clone();
        let files = resolved.files;

        let handle = tokio::spawn(async move {
            build_archive(registry, engine, build_job_id, files, archive_path).await;
        });

        info!(
            "归档任务已创建: id={}, 文件名={}, 文件数={}, 预估大小={} bytes",
            job_id, filename, total_files, estimated_size
        );

        Ok((
            CreatedArchive {
                job_id,
                filename,
                total_files,
                estimated_size,
            },
            handle,
        ))
    }
}

fn to_selection(request: &CreateArchiveRequest) -> Result<Selection, CreateError> {
    let ids: Vec<String> = request
        .source_ids
        .iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();

    match request.kind {
        JobKind::Files if ids.is_empty() => Err(CreateError::InvalidRequest(
            "source_ids 不能为空".to_string(),
        )),
        JobKind::Files => Ok(Selection::Files(ids)),
        JobKind::Folder | JobKind::Project if ids.len() != 1 => Err(CreateError::InvalidRequest(
            "文件夹 / 项目下载必须且只能指定一个 source_id".to_string(),
        )),
        JobKind::Folder => Ok(Selection::Folder(ids[0].clone())),
        JobKind::Project => Ok(Selection::Project(ids[0].clone())),
    }
}

/// 后台打包，所有结果都写回注册表
async fn build_archive(
    registry: Arc<DownloadJobRegistry>,
    engine: PackEngine,
    job_id: String,
    files: Vec<ResolvedFile>,
    archive_path: PathBuf,
) {
    match pack_to_file(&registry, &engine, &job_id, &files, &archive_path).await {
        Ok(info) => {
            if let Err(e) = registry.complete(&job_id, info) {
                warn!("标记任务完成时出错: {}", e);
            }
        }
        Err(e) => {
            error!("归档生成失败: id={}, 错误: {:#}", job_id, e);
            if let Err(rm_err) = std::fs::remove_file(&archive_path) {
                if rm_err.kind() != std::io::ErrorKind::NotFound {
                    warn!("删除未完成的归档失败: {:?}, {}", archive_path, rm_err);
                }
            }
            if let Err(update_err) = registry.fail(&job_id, format!("{:#}", e)) {
                warn!("标记任务失败时出错: {}", update_err);
            }
        }
    }
}

async fn pack_to_file(
    registry: &DownloadJobRegistry,
    engine: &PackEngine,
    job_id: &str,
    files: &[ResolvedFile],
    archive_path: &Path,
) -> anyhow::Result<ArchiveInfo> {
    use anyhow::Context;

    if let Some(parent) = archive_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("创建归档目录失败")?;
    }
    let file = tokio::fs::File::create(archive_path)
        .await
        .context("创建归档文件失败")?
        .into_std()
        .await;
    let sink = ZipArchiveSink::new(BufWriter::new(file), engine.options().compression);

    let on_event = |event: PackEvent| {
        let update = match event {
            PackEvent::FileFailed(entry) => JobUpdate::ledger_entry(entry),
            PackEvent::Progress(progress) => JobUpdate::progress(progress),
        };
        if let Err(e) = registry.update(job_id, update) {
            warn!("更新任务进度失败: {}", e);
        }
    };

    let (report, _sink) = engine.pack(files, sink, on_event).await?;

    let path = archive_path.to_path_buf();
    let sha256 = tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .context("校验线程异常")?
        .context("计算归档校验和失败")?;

    Ok(ArchiveInfo {
        path: archive_path.to_path_buf(),
        size: report.archive_bytes,
        sha256,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::engine::PackOptions;
    use crate::archive::job::JobStatus;
    use crate::config::RegistryConfig;
    use crate::metadata::{FileRecord, FolderRecord, SqliteMetadataStore};
    use crate::storage::LocalObjectStore;
    use std::io::Read;

    struct Fixture {
        service: ArchiveService,
        _objects: tempfile::TempDir,
        archives: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let objects = tempfile::tempdir().unwrap();
        let archives = tempfile::tempdir().unwrap();

        let metadata = SqliteMetadataStore::open_in_memory().unwrap();
        metadata
            .insert_folder(&FolderRecord {
                id: "docs".to_string(),
                owner_id: "alice".to_string(),
                parent_id: None,
                name: "Docs".to_string(),
                project_id: None,
                deleted_at: None,
            })
            .unwrap();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            metadata
                .insert_file(&FileRecord {
                    id: id.to_string(),
                    owner_id: "alice".to_string(),
                    name: format!("{}.txt", id),
                    size: 5,
                    storage_key: format!("blobs/{}", id),
                    folder_id: Some("docs".to_string()),
                    project_id: None,
                    created_at: i as i64,
                    deleted_at: None,
                })
                .unwrap();
        }
        // b 在对象存储中缺失
        std::fs::create_dir_all(objects.path().join("blobs")).unwrap();
        std::fs::write(objects.path().join("blobs/a"), b"aaaaa").unwrap();
        std::fs::write(objects.path().join("blobs/c"), b"ccccc").unwrap();

        let config = ArchiveConfig {
            archive_dir: archives.path().to_path_buf(),
            retry_base_delay_ms: 1,
            ..ArchiveConfig::default()
        };
        let store = Arc::new(LocalObjectStore::new(objects.path()));
        let engine = PackEngine::new(store, PackOptions::from_config(&config));
        let registry = Arc::new(DownloadJobRegistry::new(RegistryConfig::default()));
        let resolver = SelectionResolver::new(Arc::new(metadata));

        Fixture {
            service: ArchiveService::new(registry, resolver, engine, config),
            _objects: objects,
            archives,
        }
    }

    fn folder_request(id: &str) -> CreateArchiveRequest {
        CreateArchiveRequest {
            kind: JobKind::Folder,
            source_ids: vec![id.to_string()],
            preserve_structure: None,
        }
    }

    #[tokio::test]
    async fn test_folder_with_one_missing_object() {
        let fx = fixture();
        let (created, handle) = fx
            .service
            .create("alice", folder_request("docs"))
            .await
            .unwrap();
        assert_eq!(created.filename, "Docs.zip");
        assert_eq!(created.total_files, 3);
        assert_eq!(created.estimated_size, 12);
        handle.await.unwrap();

        let job = fx.service.registry().get(&created.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.total_files, 3);
        assert_eq!(job.error_ledger.len(), 1);
        assert_eq!(job.progress.processed_files, 3);
        assert_eq!(job.progress.error_count, 1);

        let path = job.archive_path.clone().unwrap();
        assert_eq!(path, fx.archives.path().join(format!("{}.zip", created.job_id)));
        assert_eq!(job.archive_sha256.unwrap(), sha256_file(&path).unwrap());
        assert_eq!(job.archive_size.unwrap(), std::fs::metadata(&path).unwrap().len());

        let mut archive = zip::ZipArchive::new(std::fs::File::open(&path).unwrap()).unwrap();
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        assert_eq!(names.len(), 3);
        let mut content = String::new();
        archive
            .by_name("a.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "aaaaa");
        assert!(archive.by_name("_errors/b.txt.txt").is_ok());
    }

    #[tokio::test]
    async fn test_resolve_failure_marks_job_failed() {
        let fx = fixture();
        let err = fx
            .service
            .create("mallory", folder_request("docs"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CreateError::Resolve(ResolveError::AccessDenied(_))
        ));

        let jobs = fx.service.registry().list("mallory");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(jobs[0].error.is_some());
    }

    #[tokio::test]
    async fn test_invalid_requests_create_no_job() {
        let fx = fixture();
        let err = fx
            .service
            .create(
                "alice",
                CreateArchiveRequest {
                    kind: JobKind::Folder,
                    source_ids: vec!["a".to_string(), "b".to_string()],
                    preserve_structure: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CreateError::InvalidRequest(_)));

        let err = fx
            .service
            .create(
                "alice",
                CreateArchiveRequest {
                    kind: JobKind::Files,
                    source_ids: vec![" ".to_string()],
                    preserve_structure: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CreateError::InvalidRequest(_)));
        assert!(fx.service.registry().list("alice").is_empty());
    }
}
