// 完成通知（自动化 webhook）

use crate::proxy::types::CompletionNotice;
use crate::proxy::CompletionNotifier;
use crate::uploader::UploadError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

/// 默认通知超时: 15 秒
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(15);

/// 通过 HTTP POST 发送完成通知
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl CompletionNotifier for WebhookNotifier {
    async fn notify(&self, webhook_url: &str, notice: &CompletionNotice) -> Result<(), UploadError> {
        let resp = self
            .client
            .post(webhook_url)
            .json(notice)
            .send()
            .await
            .map_err(|e| UploadError::from_transport(e, self.timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(UploadError::ServerRejected {
                status: status.as_u16(),
                message: text,
            });
        }
        Ok(())
    }
}

/// 发送完成通知，失败只记录日志，不影响上传结果
pub async fn send_completion_notice(
    notifier: &dyn CompletionNotifier,
    webhook_url: &str,
    notice: &CompletionNotice,
) -> bool {
    match notifier.notify(webhook_url, notice).await {
        Ok(()) => {
            info!(
                "[通知] 已发送完成通知: file={}, video_id={:?}",
                notice.video_filename, notice.video_id
            );
            true
        }
        Err(e) => {
            warn!(
                "[通知] 完成通知发送失败（忽略）: file={}, 错误: {}",
                notice.video_filename, e
            );
            false
        }
    }
}
