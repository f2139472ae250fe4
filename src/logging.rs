//! 日志系统
//!
//! 控制台输出 + 可选的文件输出。文件按启动时间命名、按大小滚动：
//! `bulk-archive.YYYY-MM-DD-HHMMSS.log`, `bulk-archive.YYYY-MM-DD-HHMMSS_1.log`, ...
//! 启动时删除超过保留天数的旧文件

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LogConfig;

/// 日志文件名前缀
pub const LOG_PREFIX: &str = "bulk-archive";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

// ============================================================================
// 滚动文件
// ============================================================================

struct RotatingFile {
    dir: PathBuf,
    /// 启动时间戳 YYYY-MM-DD-HHMMSS
    stamp: String,
    /// 0 为基础文件，之后每次滚动加一
    index: u32,
    max_size: u64,
    written: u64,
    file: File,
}

impl RotatingFile {
    fn open(dir: PathBuf, max_size: u64) -> io::Result<Self> {
        let stamp = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let file = Self::open_index(&dir, &stamp, 0)?;
        Ok(Self {
            dir,
            stamp,
            index: 0,
            max_size: max_size.max(1),
            written: 0,
            file,
        })
    }

    fn path_for(dir: &Path, stamp: &str, index: u32) -> PathBuf {
        match index {
            0 => dir.join(format!("{}.{}.log", LOG_PREFIX, stamp)),
            n => dir.join(format!("{}.{}_{}.log", LOG_PREFIX, stamp, n)),
        }
    }

    fn open_index(dir: &Path, stamp: &str, index: u32) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::path_for(dir, stamp, index))
    }

    fn write_record(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件不滚动，单条超大记录也要写得进去
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.file.flush()?;
            self.index += 1;
            self.file = Self::open_index(&self.dir, &self.stamp, self.index)?;
            self.written = 0;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

/// 线程安全的滚动文件写入器
#[derive(Clone)]
pub struct RotatingWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl RotatingWriter {
    pub fn new(dir: PathBuf, max_size: u64) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RotatingFile::open(dir, max_size)?)),
        })
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_record(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().file.flush()
    }
}

// ============================================================================
// 初始化
// ============================================================================

/// 日志守卫，drop 后文件写入线程退出
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统，`RUST_LOG` 优先于配置中的级别
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()));

    let file_writer = if config.enabled {
        match fs::create_dir_all(&config.log_dir)
            .and_then(|_| RotatingWriter::new(config.log_dir.clone(), config.max_file_size))
        {
            Ok(writer) => Some(tracing_appender::non_blocking(writer)),
            Err(e) => {
                eprintln!(
                    "日志文件初始化失败，仅输出到控制台: {:?}, 错误: {}",
                    config.log_dir, e
                );
                None
            }
        }
    } else {
        None
    };

    let (file_layer, file_guard) = match file_writer {
        Some((writer, guard)) => (
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                    .with_writer(writer),
            ),
            Some(guard),
        ),
        None => (None, None),
    };
    let has_file = file_layer.is_some();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if has_file {
        info!(
            "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
            config.log_dir,
            config.retention_days,
            config.level,
            config.max_file_size as f64 / 1024.0 / 1024.0
        );
        let removed = prune_expired_logs(
            &config.log_dir,
            config.retention_days,
            Local::now().date_naive(),
        );
        if removed > 0 {
            info!("已清理 {} 个过期日志文件", removed);
        }
    } else {
        info!("日志系统初始化完成（仅控制台输出）");
    }

    LogGuard {
        _file_guard: file_guard,
    }
}

// ============================================================================
// 过期清理
// ============================================================================

/// 文件名里的日期: `bulk-archive.2024-05-01-120000_2.log` -> 2024-05-01
fn log_file_date(filename: &str) -> Option<NaiveDate> {
    let rest = filename
        .strip_prefix(LOG_PREFIX)?
        .strip_prefix('.')?
        .strip_suffix(".log")?;
    let date = rest.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// 删除早于 `today - retention_days` 的日志文件，返回删除数量
///
/// 文件名无法解析日期时按修改时间判断
pub fn prune_expired_logs(log_dir: &Path, retention_days: u32, today: NaiveDate) -> usize {
    let retention = chrono::Duration::days(i64::from(retention_days));
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !path.is_file() || !name.starts_with(LOG_PREFIX) || !name.ends_with(".log") {
            continue;
        }

        let expired = match log_file_date(name) {
            Some(date) => today.signed_duration_since(date) > retention,
            None => entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|modified| {
                    let modified: chrono::DateTime<Local> = modified.into();
                    today.signed_duration_since(modified.date_naive()) > retention
                })
                .unwrap_or(false),
        };

        if expired {
            match fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    tracing::debug!("已删除过期日志文件: {:?}", path);
                }
                Err(e) => tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }
    removed
}
