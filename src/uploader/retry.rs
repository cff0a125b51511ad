// 重试执行器
//
// 同时用于两个层级：
// - 分片级：单个分片失败后原地重试
// - 整体级：整个上传（包括重新 start 分片会话）重新开始
//
// 退避为线性：第 n 次失败后等待 base_delay * n

use crate::uploader::UploadError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 默认最大尝试次数
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// 默认退避基数（毫秒）
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2000;

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大尝试次数（包含第一次）
    pub max_attempts: u32,
    /// 退避基数
    pub base_delay: Duration,
    /// 4xx 是否重试（默认重试所有非 2xx）
    pub retry_client_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            retry_client_errors: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            retry_client_errors: true,
        }
    }

    /// 第 attempt 次（从 1 开始）失败后的等待时间
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// 错误是否值得再试一次
    pub fn should_retry(&self, error: &UploadError) -> bool {
        if !error.kind().is_retriable() {
            return false;
        }
        if !self.retry_client_errors && error.is_client_error() {
            return false;
        }
        true
    }
}

/// 带重试执行异步操作
///
/// # 参数
/// * `policy` - 重试策略
/// * `label` - 日志标签
/// * `cancel` - 取消令牌（退避等待期间也会响应取消）
/// * `on_reset` - 每次重试前调用，用于清零本次尝试的进度
/// * `operation` - 被执行的操作，参数为当前尝试序号（从 1 开始）
pub async fn with_retry<T, R, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    cancel: &CancellationToken,
    mut on_reset: R,
    mut operation: F,
) -> Result<T, UploadError>
where
    R: FnMut(),
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, UploadError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1u32;

    loop {
        if cancel.is_cancelled() {
            return Err(UploadError::Aborted);
        }

        let error = match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} 第 {} 次尝试成功", label, attempt);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !policy.should_retry(&error) {
            debug!("{} 失败（不可重试）: {}", label, error);
            return Err(error);
        }

        if attempt >= max_attempts {
            warn!("{} 已达最大尝试次数 ({}): {}", label, max_attempts, error);
            // 下层已耗尽的错误直接取其底层原因，避免多层嵌套
            let last = match error {
                UploadError::RetriesExhausted { last, .. } => last,
                other => Box::new(other),
            };
            return Err(UploadError::RetriesExhausted {
                attempts: max_attempts,
                last,
            });
        }

        let delay = policy.backoff(attempt);
        warn!(
            "{} 失败，等待 {}ms 后重试 ({}/{}): {}",
            label,
            delay.as_millis(),
            attempt,
            max_attempts,
            error
        );

        on_reset();

        tokio::select! {
            _ = cancel.cancelled() => return Err(UploadError::Aborted),
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}
