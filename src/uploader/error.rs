// 上传错误分类
//
// 所有上传层（分片请求、重试、批次调度、分片会话、整体编排）统一返回 UploadError，
// 由 UploadEngine 负责把错误转换为任务状态

use std::time::Duration;
use thiserror::Error;

/// 上传错误
#[derive(Debug, Error)]
pub enum UploadError {
    /// 输入无效（空文件、不支持的类型、源文件不可读），不重试
    #[error("无效输入: {0}")]
    InvalidInput(String),

    /// 传输层错误（DNS、连接重置等）
    #[error("网络错误: {0}")]
    Network(String),

    /// 超过请求的墙钟超时
    #[error("请求超时（{}s）", .0.as_secs())]
    Timeout(Duration),

    /// 代理返回非 2xx，或返回 success=false
    #[error("服务器拒绝请求: HTTP {status} - {message}")]
    ServerRejected { status: u16, message: String },

    /// 2xx 响应缺少必要字段
    #[error("响应格式错误: {0}")]
    MalformedResponse(String),

    /// 分片上传会话启动失败
    #[error("分片上传会话启动失败: {0}")]
    SessionStartFailed(#[source] Box<UploadError>),

    /// 分片上传会话合并失败
    #[error("分片上传会话完成失败: {0}")]
    SessionCompleteFailed(#[source] Box<UploadError>),

    /// 重试次数耗尽，携带最后一次的底层错误
    #[error("重试 {attempts} 次后仍失败: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<UploadError>,
    },

    /// 用户取消，任何一层都不重试
    #[error("上传已取消")]
    Aborted,

    /// 任务异常或非法的会话状态转换
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 上传错误类型（扁平枚举，用于日志和重试判断）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadErrorKind {
    InvalidInput,
    Network,
    Timeout,
    ServerRejected,
    MalformedResponse,
    SessionStartFailed,
    SessionCompleteFailed,
    RetriesExhausted,
    Aborted,
    Internal,
}

impl UploadErrorKind {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            UploadErrorKind::InvalidInput | UploadErrorKind::Aborted | UploadErrorKind::Internal
        )
    }
}

impl UploadError {
    pub fn kind(&self) -> UploadErrorKind {
        match self {
            UploadError::InvalidInput(_) => UploadErrorKind::InvalidInput,
            UploadError::Network(_) => UploadErrorKind::Network,
            UploadError::Timeout(_) => UploadErrorKind::Timeout,
            UploadError::ServerRejected { .. } => UploadErrorKind::ServerRejected,
            UploadError::MalformedResponse(_) => UploadErrorKind::MalformedResponse,
            UploadError::SessionStartFailed(_) => UploadErrorKind::SessionStartFailed,
            UploadError::SessionCompleteFailed(_) => UploadErrorKind::SessionCompleteFailed,
            UploadError::RetriesExhausted { .. } => UploadErrorKind::RetriesExhausted,
            UploadError::Aborted => UploadErrorKind::Aborted,
            UploadError::Internal(_) => UploadErrorKind::Internal,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, UploadError::Aborted)
    }

    /// 沿包装链向下找到最底层的错误
    pub fn root_cause(&self) -> &UploadError {
        match self {
            UploadError::SessionStartFailed(inner)
            | UploadError::SessionCompleteFailed(inner)
            | UploadError::RetriesExhausted { last: inner, .. } => inner.root_cause(),
            other => other,
        }
    }

    /// 最底层错误是否为 4xx 客户端错误
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.root_cause(),
            UploadError::ServerRejected { status, .. } if (400..500).contains(status)
        )
    }

    /// 将 reqwest 错误归类为超时或网络错误
    pub(crate) fn from_transport(error: reqwest::Error, timeout: Duration) -> Self {
        if error.is_timeout() {
            UploadError::Timeout(timeout)
        } else {
            UploadError::Network(error.to_string())
        }
    }
}
