// 配置管理模块

use crate::proxy::{DestinationConfig, NotificationRoute, ProxyTimeouts, DEFAULT_NOTIFY_TIMEOUT};
use crate::uploader::{RetryPolicy, UploadOptions, ALLOWED_VIDEO_TYPES, DEFAULT_MIME_TYPE};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

const MB: u64 = 1024 * 1024;

/// 分片下限 (MB)，S3/R2 对非末尾分片的要求
const MIN_PART_SIZE_MB: u64 = 5;

/// 代理单个请求体上限 (MB)
const MAX_REQUEST_BODY_MB: u64 = 100;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 存储代理与通知配置
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 存储代理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// 存储代理根地址
    #[serde(default = "default_storage_proxy_base")]
    pub storage_proxy_base: String,
    /// 自动化 webhook 地址（为空时不发送完成通知）
    #[serde(default)]
    pub notification_webhook_url: Option<String>,
    /// 完成通知由客户端发送还是由代理转发
    #[serde(default)]
    pub notification_route: NotificationRoute,
}

fn default_storage_proxy_base() -> String {
    "http://127.0.0.1:8787".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            storage_proxy_base: default_storage_proxy_base(),
            notification_webhook_url: None,
            notification_route: NotificationRoute::Client,
        }
    }
}

impl ProxyConfig {
    pub fn to_destination(&self) -> DestinationConfig {
        let destination = DestinationConfig::new(self.storage_proxy_base.clone());
        match &self.notification_webhook_url {
            Some(url) if !url.trim().is_empty() => {
                destination.with_webhook(url.trim(), self.notification_route)
            }
            _ => destination,
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// 小于该值走单次上传 (MB)
    pub single_shot_limit_mb: u64,
    /// 分片大小 (MB)
    pub part_size_mb: u64,
    /// 每批并发分片数
    pub concurrency: usize,
    /// 最大尝试次数（分片级与整体级）
    pub max_attempts: u32,
    /// 线性退避基数（毫秒）
    pub retry_base_delay_ms: u64,
    /// 4xx 是否重试
    pub retry_client_errors: bool,
    /// 单个分片超时（秒）
    pub part_timeout_secs: u64,
    /// 单次上传超时（秒）
    pub single_timeout_secs: u64,
    /// start / complete 等 JSON 请求超时（秒）
    pub request_timeout_secs: u64,
    /// 完成通知超时（秒）
    pub notify_timeout_secs: u64,
    /// 最大同时上传文件数
    pub max_concurrent_files: usize,
    /// 允许的 MIME 类型
    pub allowed_mime_types: Vec<String>,
    /// 文件类型为空时使用的类型
    pub default_mime_type: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            single_shot_limit_mb: 95,
            part_size_mb: 95,
            concurrency: 6,
            max_attempts: 3,
            retry_base_delay_ms: 2000,
            retry_client_errors: true,
            part_timeout_secs: 600,
            single_timeout_secs: 900,
            request_timeout_secs: 120,
            notify_timeout_secs: DEFAULT_NOTIFY_TIMEOUT.as_secs(),
            max_concurrent_files: 1,
            allowed_mime_types: ALLOWED_VIDEO_TYPES.iter().map(|s| s.to_string()).collect(),
            default_mime_type: DEFAULT_MIME_TYPE.to_string(),
        }
    }
}

impl From<&UploadConfig> for UploadOptions {
    fn from(config: &UploadConfig) -> Self {
        Self {
            single_shot_limit: config.single_shot_limit_mb * MB,
            part_size: config.part_size_mb * MB,
            concurrency: config.concurrency,
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                base_delay: Duration::from_millis(config.retry_base_delay_ms),
                retry_client_errors: config.retry_client_errors,
            },
            timeouts: ProxyTimeouts {
                part: Duration::from_secs(config.part_timeout_secs),
                single: Duration::from_secs(config.single_timeout_secs),
                request: Duration::from_secs(config.request_timeout_secs),
            },
            notify_timeout: Duration::from_secs(config.notify_timeout_secs),
            allowed_mime_types: config.allowed_mime_types.clone(),
            default_mime_type: config.default_mime_type.clone(),
        }
    }
}

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

impl AppConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        let base = self.proxy.storage_proxy_base.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            anyhow::bail!("存储代理地址必须以 http:// 或 https:// 开头: {}", base);
        }

        let upload = &self.upload;
        if upload.part_size_mb == 0 {
            anyhow::bail!("分片大小不能为 0");
        }
        if upload.part_size_mb < MIN_PART_SIZE_MB {
            anyhow::bail!(
                "分片大小 {}MB 小于下限 {}MB",
                upload.part_size_mb,
                MIN_PART_SIZE_MB
            );
        }
        if upload.part_size_mb > MAX_REQUEST_BODY_MB {
            anyhow::bail!(
                "分片大小 {}MB 超过代理请求体上限 {}MB",
                upload.part_size_mb,
                MAX_REQUEST_BODY_MB
            );
        }
        if upload.single_shot_limit_mb > MAX_REQUEST_BODY_MB {
            anyhow::bail!(
                "单次上传上限 {}MB 超过代理请求体上限 {}MB",
                upload.single_shot_limit_mb,
                MAX_REQUEST_BODY_MB
            );
        }
        if upload.concurrency == 0 {
            anyhow::bail!("分片并发数不能为 0");
        }
        if upload.max_attempts == 0 {
            anyhow::bail!("最大尝试次数不能为 0");
        }
        if upload.max_concurrent_files == 0 {
            anyhow::bail!("同时上传文件数不能为 0");
        }
        if upload.allowed_mime_types.is_empty() {
            anyhow::bail!("允许的文件类型列表为空");
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

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

                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}
