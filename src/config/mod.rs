// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 打包配置
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// 任务注册表配置
    #[serde(default)]
    pub registry: RegistryConfig,
    /// 存储后端配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 断点续传客户端配置
    #[serde(default)]
    pub client: ClientConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

// ============================================================================
// 日志
// ============================================================================

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

// ============================================================================
// 服务器
// ============================================================================

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS允许的源
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18890
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

// ============================================================================
// 打包
// ============================================================================

/// ZIP 条目压缩方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Deflated,
    Stored,
}

/// 打包配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// 归档输出目录
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    /// 拉取缓冲临时文件目录（None 使用系统临时目录）
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
    /// 每批并发拉取数
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// 单个文件最多尝试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试基础延迟（毫秒），每次翻倍
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 打开单个对象的超时（秒）
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// 条目名最大字符数
    #[serde(default = "default_max_name_length")]
    pub max_name_length: usize,
    /// 是否保留目录结构
    #[serde(default = "default_preserve_structure")]
    pub preserve_structure: bool,
    #[serde(default)]
    pub compression: Compression,
    /// 预估压缩比（仅用于展示预估大小）
    #[serde(default = "default_estimate_ratio")]
    pub estimate_ratio: f64,
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("data/archives")
}

fn default_concurrency() -> usize {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_max_name_length() -> usize {
    200
}

fn default_preserve_structure() -> bool {
    true
}

fn default_estimate_ratio() -> f64 {
    0.8
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            archive_dir: default_archive_dir(),
            spool_dir: None,
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_name_length: default_max_name_length(),
            preserve_structure: default_preserve_structure(),
            compression: Compression::default(),
            estimate_ratio: default_estimate_ratio(),
        }
    }
}

impl ArchiveConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

// ============================================================================
// 任务注册表
// ============================================================================

/// 任务注册表配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// 每个用户同时进行的任务上限
    #[serde(default = "default_max_active_jobs_per_owner")]
    pub max_active_jobs_per_owner: usize,
    /// 失败任务保留时间（分钟）
    #[serde(default = "default_retention_minutes")]
    pub retention_minutes: u64,
    /// 完成任务宽限期（分钟）
    #[serde(default = "default_completion_grace_minutes")]
    pub completion_grace_minutes: u64,
    /// 清理间隔（秒）
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_active_jobs_per_owner() -> usize {
    10
}

fn default_retention_minutes() -> u64 {
    60
}

fn default_completion_grace_minutes() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_active_jobs_per_owner: default_max_active_jobs_per_owner(),
            retention_minutes: default_retention_minutes(),
            completion_grace_minutes: default_completion_grace_minutes(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl RegistryConfig {
    pub fn retention_ms(&self) -> i64 {
        (self.retention_minutes * 60 * 1000) as i64
    }

    pub fn completion_grace_ms(&self) -> i64 {
        (self.completion_grace_minutes * 60 * 1000) as i64
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

// ============================================================================
// 存储后端
// ============================================================================

/// 对象存储后端类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    Http,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// 本地后端根目录
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// HTTP 后端地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// 元数据 SQLite 路径
    #[serde(default = "default_metadata_db")]
    pub metadata_db: PathBuf,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("data/objects")
}

fn default_metadata_db() -> PathBuf {
    PathBuf::from("data/metadata.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            root: default_storage_root(),
            base_url: None,
            metadata_db: default_metadata_db(),
        }
    }
}

// ============================================================================
// 客户端
// ============================================================================

/// 断点续传客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 分段大小（字节，默认 5MB）
    #[serde(default = "default_segment_size")]
    pub segment_size: u64,
    /// 传输状态目录
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// 下载输出目录
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_segment_size() -> u64 {
    crate::resumable::DEFAULT_SEGMENT_SIZE
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("data/transfers")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("downloads")
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            segment_size: default_segment_size(),
            state_dir: default_state_dir(),
            output_dir: default_output_dir(),
        }
    }
}

// ============================================================================
// 加载 / 保存
// ============================================================================

impl AppConfig {
    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.archive.concurrency == 0 {
            anyhow::bail!("archive.concurrency 必须大于 0");
        }
        if self.archive.max_retries == 0 {
            anyhow::bail!("archive.max_retries 必须大于 0");
        }
        if self.client.segment_size == 0 {
            anyhow::bail!("client.segment_size 必须大于 0");
        }
        if !(self.archive.estimate_ratio > 0.0 && self.archive.estimate_ratio <= 1.0) {
            anyhow::bail!(
                "archive.estimate_ratio 必须在 (0, 1] 之间，当前: {}",
                self.archive.estimate_ratio
            );
        }
        if self.storage.backend == StorageBackend::Http && self.storage.base_url.is_none() {
            anyhow::bail!("storage.backend = \"http\" 时必须配置 storage.base_url");
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 尝试保存默认配置
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}
