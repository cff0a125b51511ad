// 单个 HTTP 上传请求
//
// 负责一次 POST：流式发送字节、上报已发送字节数、硬超时、取消。
// 不做重试，重试由 with_retry 在外层包装

use crate::uploader::file::{ByteStream, UploadBody};
use crate::uploader::UploadError;
use bytes::Bytes;
use futures::stream::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_LENGTH};
use reqwest::{Body, Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 流式发送的单块大小: 256KB
pub const PIECE_SIZE: usize = 256 * 1024;

/// 错误消息中保留的响应体最大长度
const MAX_ERROR_BODY: usize = 200;

/// 已发送字节回调 (loaded, total)
pub type BytesSentCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// 空回调
pub fn ignore_bytes_sent() -> BytesSentCallback {
    Arc::new(|_, _| {})
}

/// 上传请求
#[derive(Debug, Clone)]
pub struct PartRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: UploadBody,
    pub timeout: Duration,
}

/// 响应体
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    /// 非 JSON 的 2xx 响应，按成功处理
    Raw(String),
}

/// 上传响应
#[derive(Debug, Clone)]
pub struct PartResponse {
    pub status: u16,
    pub body: ResponseBody,
}

impl PartResponse {
    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Json(v) => Some(v),
            ResponseBody::Raw(_) => None,
        }
    }
}

/// 分片上传器
#[derive(Debug, Clone)]
pub struct PartUploader {
    client: Client,
}

impl PartUploader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// 发送一个字节范围
    ///
    /// # 参数
    /// * `request` - 目标地址、请求头、数据、超时
    /// * `on_bytes_sent` - 每交给传输层一块数据回调一次，loaded 单调递增
    /// * `cancel` - 取消令牌
    pub async fn send(
        &self,
        request: PartRequest,
        on_bytes_sent: BytesSentCallback,
        cancel: &CancellationToken,
    ) -> Result<PartResponse, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Aborted);
        }

        let PartRequest {
            url,
            headers,
            body,
            timeout,
        } = request;
        let total = body.len();
        let body_stream = piece_stream(body.open().await?, total, on_bytes_sent, cancel.clone());

        let req = self
            .client
            .post(&url)
            .headers(headers)
            .header(CONTENT_LENGTH, total)
            .body(Body::wrap_stream(body_stream));

        debug!("发送上传请求: url={}, size={} bytes", url, total);

        let exchange = async {
            let resp = req.send().await?;
            let status = resp.status();
            let text = resp.text().await?;
            Ok::<(StatusCode, String), reqwest::Error>((status, text))
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("上传请求已取消: {}", url);
                return Err(UploadError::Aborted);
            }
            r = tokio::time::timeout(timeout, exchange) => r,
        };

        let (status, text) = match outcome {
            Err(_) => {
                warn!("上传请求超时 ({}s): {}", timeout.as_secs(), url);
                return Err(UploadError::Timeout(timeout));
            }
            Ok(Err(e)) => {
                // 数据流因取消中断时 reqwest 报的是传输错误
                if cancel.is_cancelled() {
                    return Err(UploadError::Aborted);
                }
                return Err(UploadError::from_transport(e, timeout));
            }
            Ok(Ok(v)) => v,
        };

        let body = classify_response(status, text)?;
        Ok(PartResponse {
            status: status.as_u16(),
            body,
        })
    }
}

/// 包装数据流：每块交出时回调进度并检查取消
fn piece_stream(
    pieces: ByteStream,
    total: u64,
    on_bytes_sent: BytesSentCallback,
    cancel: CancellationToken,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync + 'static {
    let mut loaded = 0u64;
    pieces.map(move |piece| {
        if cancel.is_cancelled() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "上传已取消",
            ));
        }
        let piece = piece?;
        loaded += piece.len() as u64;
        on_bytes_sent(loaded, total);
        Ok(piece)
    })
}

/// 解析响应：2xx 尝试解析 JSON（失败则保留原文），非 2xx 转为 ServerRejected
pub(crate) fn classify_response(status: StatusCode, text: String) -> Result<ResponseBody, UploadError> {
    let body = match serde_json::from_str::<Value>(&text) {
        Ok(v) => ResponseBody::Json(v),
        Err(_) => ResponseBody::Raw(text),
    };

    if status.is_success() {
        return Ok(body);
    }

    let message = match &body {
        ResponseBody::Json(v) => v
            .get("error")
            .and_then(|e| e.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| truncate(&v.to_string())),
        ResponseBody::Raw(raw) if !raw.trim().is_empty() => truncate(raw.trim()),
        ResponseBody::Raw(_) => status
            .canonical_reason()
            .unwrap_or("Unknown")
            .to_string(),
    };

    Err(UploadError::ServerRejected {
        status: status.as_u16(),
        message,
    })
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= MAX_ERROR_BODY {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(MAX_ERROR_BODY).collect();
        out.push_str("...");
        out
    }
}
