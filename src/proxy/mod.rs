// 存储代理与完成通知
//
// 上传流水线只依赖这里的两个 trait，真实实现走 HTTP，测试可以换成内存实现

pub mod client;
pub mod notify;
pub mod types;

pub use client::{ProxyClient, ProxyTimeouts};
pub use notify::{send_completion_notice, WebhookNotifier, DEFAULT_NOTIFY_TIMEOUT};
pub use types::{
    CompleteRequest, CompletedPartRef, CompletionNotice, DestinationConfig, HealthResponse,
    NotificationRoute, PartUploadParams, PartUploadResponse, SingleUploadParams, StartRequest,
    StartResponse, StoredObject,
};

use crate::uploader::{BytesSentCallback, UploadBody, UploadError};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// 存储代理的四个接口
#[async_trait]
pub trait StorageProxy: Send + Sync {
    /// POST /upload：整个文件一次上传
    async fn upload_single(
        &self,
        params: SingleUploadParams,
        body: UploadBody,
        on_bytes_sent: BytesSentCallback,
        cancel: &CancellationToken,
    ) -> Result<StoredObject, UploadError>;

    /// POST /start：创建分片上传会话
    async fn start_multipart(
        &self,
        request: StartRequest,
        cancel: &CancellationToken,
    ) -> Result<StartResponse, UploadError>;

    /// POST /upload-part：上传一个分片
    async fn upload_part(
        &self,
        params: PartUploadParams,
        body: UploadBody,
        on_bytes_sent: BytesSentCallback,
        cancel: &CancellationToken,
    ) -> Result<PartUploadResponse, UploadError>;

    /// POST /complete：合并分片
    async fn complete_multipart(
        &self,
        request: CompleteRequest,
        cancel: &CancellationToken,
    ) -> Result<StoredObject, UploadError>;
}

/// 完成通知发送方
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn notify(&self, webhook_url: &str, notice: &CompletionNotice) -> Result<(), UploadError>;
}
