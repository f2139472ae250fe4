// 应用状态

use std::sync::Arc;

use anyhow::Context;

use crate::archive::{ArchiveService, DownloadJobRegistry, PackEngine, PackOptions, SelectionResolver};
use crate::config::{AppConfig, StorageBackend};
use crate::metadata::{MetadataStore, SqliteMetadataStore};
use crate::storage::{HttpObjectStore, LocalObjectStore, ObjectStore};

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 应用配置
    pub config: Arc<AppConfig>,
    /// 下载任务注册表
    pub registry: Arc<DownloadJobRegistry>,
    /// 归档服务
    pub service: Arc<ArchiveService>,
}

impl AppState {
    /// 用已经构造好的存储创建应用状态
    pub fn new(
        config: AppConfig,
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        let registry = Arc::new(DownloadJobRegistry::new(config.registry.clone()));
        let engine = PackEngine::new(objects, PackOptions::from_config(&config.archive));
        let service = ArchiveService::new(
            Arc::clone(&registry),
            SelectionResolver::new(metadata),
            engine,
            config.archive.clone(),
        );

        Self {
            config: Arc::new(config),
            registry,
            service: Arc::new(service),
        }
    }

    /// 按配置打开元数据库和对象存储
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let metadata = SqliteMetadataStore::open(&config.storage.metadata_db).with_context(|| {
            format!("打开元数据库失败: {:?}", config.storage.metadata_db)
        })?;

        let objects: Arc<dyn ObjectStore> = match config.storage.backend {
            StorageBackend::Local => {
                tracing::info!("对象存储: 本地目录 {:?}", config.storage.root);
                Arc::new(LocalObjectStore::new(config.storage.root.clone()))
            }
            StorageBackend::Http => {
                let base_url = config
                    .storage
                    .base_url
                    .clone()
                    .context("storage.backend = \"http\" 时必须配置 storage.base_url")?;
                tracing::info!("对象存储: HTTP {}", base_url);
                Arc::new(
                    HttpObjectStore::new(base_url)
                        .with_head_timeout(config.archive.fetch_timeout()),
                )
            }
        };

        Ok(Self::new(config, Arc::new(metadata), objects))
    }
}
