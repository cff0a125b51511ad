// 存储代理 API 数据类型

use crate::uploader::UploadStrategy;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// 原始文件名
pub const HEADER_FILENAME: &str = "X-Filename";
/// 文件 MIME 类型
pub const HEADER_FILETYPE: &str = "X-Filetype";
/// 分片会话 ID
pub const HEADER_UPLOAD_ID: &str = "X-Upload-Id";
/// 分片编号
pub const HEADER_PART_NUMBER: &str = "X-Part-Number";
/// 由代理转发完成通知时的 webhook 地址
pub const HEADER_FORWARDING_WEBHOOK: &str = "X-Forwarding-Webhook";

/// 完成通知由谁发送
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationRoute {
    /// 客户端上传成功后自己发送
    #[default]
    Client,
    /// 把 webhook 地址交给代理，由代理发送
    Proxy,
}

/// 上传目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationConfig {
    /// 存储代理根地址（不带末尾 /）
    pub storage_proxy_base: String,
    /// 完成通知 webhook，为 None 时不通知
    pub notification_webhook_url: Option<String>,
    pub notification_route: NotificationRoute,
}

impl DestinationConfig {
    pub fn new(storage_proxy_base: impl Into<String>) -> Self {
        Self {
            storage_proxy_base: storage_proxy_base.into().trim_end_matches('/').to_string(),
            notification_webhook_url: None,
            notification_route: NotificationRoute::Client,
        }
    }

    pub fn with_webhook(mut self, url: impl Into<String>, route: NotificationRoute) -> Self {
        self.notification_webhook_url = Some(url.into());
        self.notification_route = route;
        self
    }

    /// 拼接代理接口地址
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.storage_proxy_base, path.trim_start_matches('/'))
    }

    /// 需要交给代理转发的 webhook
    pub fn forwarding_webhook(&self) -> Option<&str> {
        match self.notification_route {
            NotificationRoute::Proxy => self.notification_webhook_url.as_deref(),
            NotificationRoute::Client => None,
        }
    }

    /// 需要客户端自己通知的 webhook
    pub fn client_webhook(&self) -> Option<&str> {
        match self.notification_route {
            NotificationRoute::Client => self.notification_webhook_url.as_deref(),
            NotificationRoute::Proxy => None,
        }
    }
}

/// 单次上传参数
#[derive(Debug, Clone)]
pub struct SingleUploadParams {
    pub file_name: String,
    pub mime_type: String,
    pub forwarding_webhook: Option<String>,
}

/// POST /start 请求体
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub file_name: String,
    pub mime_type: String,
    pub file_size: u64,
}

/// POST /start 响应
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub upload_id: String,
    /// 存储对象 key
    pub key: String,
    #[serde(default)]
    pub original_filename: Option<String>,
}

/// POST /upload-part 参数
#[derive(Debug, Clone)]
pub struct PartUploadParams {
    pub upload_id: String,
    pub key: String,
    pub part_number: u32,
}

/// POST /upload-part 响应
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUploadResponse {
    #[serde(default)]
    pub part_number: Option<u32>,
    pub etag: String,
}

/// 已上传分片（合并请求中的一项）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPartRef {
    pub part_number: u32,
    pub etag: String,
}

/// POST /complete 请求体
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub upload_id: String,
    pub key: String,
    /// 按分片编号升序
    pub parts: Vec<CompletedPartRef>,
    pub original_filename: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarding_webhook: Option<String>,
}

/// 代理返回的存储对象
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StoredObject {
    #[serde(default, deserialize_with = "lenient_id")]
    pub video_id: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// GET /health 响应
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// 发给自动化 webhook 的完成通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionNotice {
    pub video_id: Option<String>,
    pub video_url: Option<String>,
    pub video_filename: String,
    pub upload_method: UploadStrategy,
    /// RFC 3339
    pub timestamp: String,
}

impl CompletionNotice {
    pub fn new(object: &StoredObject, file_name: &str, strategy: UploadStrategy) -> Self {
        Self {
            video_id: object.video_id.clone(),
            video_url: object.video_url.clone(),
            video_filename: file_name.to_string(),
            upload_method: strategy,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// id 字段可能是字符串也可能是数字
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
