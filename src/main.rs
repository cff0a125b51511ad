use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use video_drop_uploader::{
    config::{AppConfig, LogConfig, DEFAULT_CONFIG_PATH},
    logging,
    proxy::ProxyClient,
    uploader::{UploadEngine, UploadManager, UploadOptions, VideoFile},
};

/// 营销视频上传工具：分片上传到存储代理，完成后通知自动化 webhook
#[derive(Parser, Debug)]
#[command(name = "video-drop-uploader")]
#[command(version)]
struct Cli {
    /// 待上传的视频文件（mp4 / mov / webm / mpeg）
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// 配置文件路径
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 存储代理地址（覆盖配置文件）
    #[arg(long, env = "VIDEO_DROP_PROXY")]
    proxy: Option<String>,

    /// 完成通知 webhook（覆盖配置文件）
    #[arg(long, env = "VIDEO_DROP_WEBHOOK")]
    webhook: Option<String>,

    /// 跳过上传前的代理健康检查
    #[arg(long)]
    skip_health_check: bool,
}

/// 读取配置文件中的日志配置，失败时使用默认配置
async fn load_log_config(config_path: &str) -> LogConfig {
    let Ok(content) = tokio::fs::read_to_string(config_path).await else {
        return LogConfig::default();
    };
    toml::from_str::<toml::Value>(&content)
        .ok()
        .and_then(|v| v.get("log").cloned())
        .and_then(|log| log.try_into::<LogConfig>().ok())
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 🔥 日志守卫必须保持存活
    let log_config = load_log_config(&cli.config).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("video-drop-uploader v{} 启动", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load_or_default(&cli.config).await;
    if let Some(proxy) = cli.proxy {
        config.proxy.storage_proxy_base = proxy;
    }
    if let Some(webhook) = cli.webhook {
        config.proxy.notification_webhook_url = Some(webhook);
    }
    config.validate().context("配置无效")?;

    let destination = config.proxy.to_destination();
    let options = UploadOptions::from(&config.upload);

    if destination.notification_webhook_url.is_none() {
        warn!("未配置完成通知 webhook，上传完成后不会通知自动化流程");
    }

    if !cli.skip_health_check {
        let client = ProxyClient::new(destination.storage_proxy_base.clone(), options.timeouts)?;
        let health = client
            .health()
            .await
            .with_context(|| format!("存储代理健康检查失败: {}", client.base_url()))?;
        info!(
            "存储代理可用: status={}, version={}",
            health.status,
            health.version.as_deref().unwrap_or("unknown")
        );
    }

    // 读取文件信息，无法读取的文件直接记为失败
    let mut files = Vec::new();
    let mut failed = 0usize;
    for path in &cli.files {
        match VideoFile::from_path(path).await {
            Ok(file) => files.push(file),
            Err(e) => {
                error!("无法读取文件 {:?}: {}", path, e);
                println!("✗ {} - {}", path.display(), e);
                failed += 1;
            }
        }
    }

    let engine = UploadEngine::new(destination, options)?;
    let manager = Arc::new(UploadManager::new(engine, config.upload.max_concurrent_files));

    // Ctrl+C 取消所有任务
    let ctrl_c_manager = manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到 Ctrl+C，取消所有上传...");
            ctrl_c_manager.cancel_all();
        }
    });

    for (task_id, result) in manager.upload_batch(files).await {
        let name = manager
            .get_task(&task_id)
            .map(|t| t.file_name)
            .unwrap_or_else(|| task_id.clone());
        match result {
            Ok(outcome) => println!(
                "✓ {} - {} ({} bytes) video_id={} url={}",
                name,
                outcome.strategy.as_str(),
                outcome.size,
                outcome.video_id.as_deref().unwrap_or("-"),
                outcome.video_url.as_deref().unwrap_or("-"),
            ),
            Err(e) => {
                println!("✗ {} - {}", name, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} 个文件上传失败", failed);
    }

    info!("全部上传完成");
    Ok(())
}
