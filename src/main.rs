use std::path::PathBuf;

use anyhow::Context;
use bulk_archive::{config::LogConfig, logging, server, AppConfig, AppState};
use clap::Parser;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

/// 批量归档下载服务
#[derive(Debug, Parser)]
#[command(name = "bulk-archive", version, about)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, env = "BULK_ARCHIVE_CONFIG", default_value = "config/app.toml")]
    config: PathBuf,
}

/// 加载日志配置
///
/// 日志要在完整配置加载之前初始化，这里只读取 `[log]` 表，失败时返回默认配置
async fn load_log_config(config_path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(config_path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = args.config.to_string_lossy().into_owned();

    // 必须保持 _log_guard 存活
    let log_config = load_log_config(&config_path).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("Bulk Archive v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(&config_path).await;
    tokio::fs::create_dir_all(&config.archive.archive_dir)
        .await
        .with_context(|| format!("创建归档目录失败: {:?}", config.archive.archive_dir))?;
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let cors = server::cors_layer(&config.server);
    let app_state = AppState::from_config(config).context("应用状态初始化失败")?;
    info!("应用状态初始化完成");

    // 过期任务清理
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let sweeper = app_state
        .registry
        .spawn_sweeper(shutdown_tx.subscribe());

    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors);
    let app = server::build_router(app_state).layer(middleware);

    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1", addr);
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("监听地址失败: {}", addr))?;

    // 🔥 使用 select! 监听关闭信号，支持优雅关闭
    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    info!("正在停止任务清理...");
    let _ = shutdown_tx.send(());
    if let Err(e) = sweeper.await {
        tracing::warn!("任务清理循环异常退出: {}", e);
    }
    info!("应用已安全退出");

    Ok(())
}
