// 存储代理 HTTP 客户端

use crate::proxy::types::{
    CompleteRequest, HealthResponse, PartUploadParams, PartUploadResponse, SingleUploadParams,
    StartRequest, StartResponse, StoredObject, HEADER_FILENAME, HEADER_FILETYPE,
    HEADER_FORWARDING_WEBHOOK, HEADER_PART_NUMBER, HEADER_UPLOAD_ID,
};
use crate::proxy::StorageProxy;
use crate::uploader::part::classify_response;
use crate::uploader::{
    BytesSentCallback, PartRequest, PartUploader, ResponseBody, UploadBody, UploadError,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 请求超时设置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyTimeouts {
    /// 单个分片: 10 分钟
    pub part: Duration,
    /// 单次上传整个文件: 15 分钟
    pub single: Duration,
    /// start / complete / health
    pub request: Duration,
}

impl Default for ProxyTimeouts {
    fn default() -> Self {
        Self {
            part: Duration::from_secs(600),
            single: Duration::from_secs(900),
            request: Duration::from_secs(120),
        }
    }
}

/// 存储代理客户端
#[derive(Debug, Clone)]
pub struct ProxyClient {
    base_url: String,
    client: Client,
    uploader: PartUploader,
    timeouts: ProxyTimeouts,
}

impl ProxyClient {
    /// 创建代理客户端
    ///
    /// # 参数
    /// * `base_url` - 代理根地址
    /// * `timeouts` - 各类请求的超时
    pub fn new(base_url: impl Into<String>, timeouts: ProxyTimeouts) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        // 超时由每个请求单独设置，这里只限制建连
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("video-drop-uploader/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        info!("初始化存储代理客户端: {}", base_url);

        Ok(Self {
            base_url,
            uploader: PartUploader::new(client.clone()),
            client,
            timeouts,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// GET /health
    pub async fn health(&self) -> Result<HealthResponse, UploadError> {
        let url = self.endpoint("health");
        let resp = self
            .client
            .get(&url)
            .timeout(self.timeouts.request)
            .send()
            .await
            .map_err(|e| UploadError::from_transport(e, self.timeouts.request))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| UploadError::from_transport(e, self.timeouts.request))?;

        match classify_response(status, text)? {
            ResponseBody::Json(v) => parse_payload(v, "health"),
            ResponseBody::Raw(raw) => Err(UploadError::MalformedResponse(format!(
                "health 响应不是 JSON: {}",
                raw
            ))),
        }
    }

    /// 发送 JSON 请求并返回 success 校验后的响应体
    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<Value, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Aborted);
        }

        let url = self.endpoint(path);
        let timeout = self.timeouts.request;
        let req = self.client.post(&url).json(body).timeout(timeout);

        let exchange = async {
            let resp = req.send().await?;
            let status = resp.status();
            let text = resp.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };

        let (status, text) = tokio::select! {
            _ = cancel.cancelled() => return Err(UploadError::Aborted),
            r = exchange => r.map_err(|e| UploadError::from_transport(e, timeout))?,
        };

        debug!("POST {} -> HTTP {}", url, status.as_u16());

        match classify_response(status, text)? {
            ResponseBody::Json(v) => {
                check_success(status.as_u16(), &v)?;
                Ok(v)
            }
            ResponseBody::Raw(raw) => Err(UploadError::MalformedResponse(format!(
                "{} 响应不是 JSON: {}",
                path, raw
            ))),
        }
    }
}

#[async_trait]
impl StorageProxy for ProxyClient {
    async fn upload_single(
        &self,
        params: SingleUploadParams,
        body: UploadBody,
        on_bytes_sent: BytesSentCallback,
        cancel: &CancellationToken,
    ) -> Result<StoredObject, UploadError> {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, HEADER_FILENAME, &params.file_name);
        insert_header(&mut headers, HEADER_FILETYPE, &params.mime_type);
        insert_header(&mut headers, CONTENT_TYPE.as_str(), &params.mime_type);
        if let Some(webhook) = &params.forwarding_webhook {
            insert_header(&mut headers, HEADER_FORWARDING_WEBHOOK, webhook);
        }

        let response = self
            .uploader
            .send(
                PartRequest {
                    url: self.endpoint("upload"),
                    headers,
                    body,
                    timeout: self.timeouts.single,
                },
                on_bytes_sent,
                cancel,
            )
            .await?;

        match response.body {
            ResponseBody::Json(v) => {
                require_success(response.status, &v)?;
                parse_payload(v, "upload")
            }
            ResponseBody::Raw(raw) => {
                // 部分代理只返回纯文本，按成功处理
                debug!("单次上传返回非 JSON 响应，按成功处理: {}", raw);
                Ok(StoredObject::default())
            }
        }
    }

    async fn start_multipart(
        &self,
        request: StartRequest,
        cancel: &CancellationToken,
    ) -> Result<StartResponse, UploadError> {
        let v = self.post_json("start", &request, cancel).await?;
        parse_payload(v, "start")
    }

    async fn upload_part(
        &self,
        params: PartUploadParams,
        body: UploadBody,
        on_bytes_sent: BytesSentCallback,
        cancel: &CancellationToken,
    ) -> Result<PartUploadResponse, UploadError> {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, HEADER_UPLOAD_ID, &params.upload_id);
        insert_header(&mut headers, HEADER_PART_NUMBER, &params.part_number.to_string());
        insert_header(&mut headers, HEADER_FILENAME, &params.key);

        let response = self
            .uploader
            .send(
                PartRequest {
                    url: self.endpoint("upload-part"),
                    headers,
                    body,
                    timeout: self.timeouts.part,
                },
                on_bytes_sent,
                cancel,
            )
            .await?;

        match response.body {
            ResponseBody::Json(v) => {
                check_success(response.status, &v)?;
                let part: PartUploadResponse = parse_payload(v, "upload-part")?;
                if part.etag.is_empty() {
                    return Err(UploadError::MalformedResponse(format!(
                        "分片 #{} 响应缺少 etag",
                        params.part_number
                    )));
                }
                if let Some(n) = part.part_number {
                    if n != params.part_number {
                        warn!("分片编号不一致: 请求 #{}, 响应 #{}", params.part_number, n);
                    }
                }
                Ok(part)
            }
            ResponseBody::Raw(raw) => Err(UploadError::MalformedResponse(format!(
                "分片 #{} 响应不是 JSON: {}",
                params.part_number, raw
            ))),
        }
    }

    async fn complete_multipart(
        &self,
        request: CompleteRequest,
        cancel: &CancellationToken,
    ) -> Result<StoredObject, UploadError> {
        let v = self.post_json("complete", &request, cancel).await?;
        let object: StoredObject = parse_payload(v, "complete")?;
        // success 未为 false 即已合并，video_id 可以缺省
        if object.video_id.is_none() {
            warn!("complete 响应缺少 video_id，按成功处理: key={}", request.key);
        }
        Ok(object)
    }
}

/// 2xx 但 success=false 视为服务器拒绝
pub(crate) fn check_success(status: u16, body: &Value) -> Result<(), UploadError> {
    if body.get("success").and_then(|s| s.as_bool()) == Some(false) {
        let message = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("success=false")
            .to_string();
        return Err(UploadError::ServerRejected { status, message });
    }
    Ok(())
}

/// 单次上传的 JSON 响应必须带 success=true
pub(crate) fn require_success(status: u16, body: &Value) -> Result<(), UploadError> {
    check_success(status, body)?;
    if body.get("success").and_then(|s| s.as_bool()) != Some(true) {
        return Err(UploadError::ServerRejected {
            status,
            message: body
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("响应缺少 success 字段")
                .to_string(),
        });
    }
    Ok(())
}

/// 反序列化响应体，缺少必要字段时返回 MalformedResponse
pub(crate) fn parse_payload<T: DeserializeOwned>(body: Value, what: &str) -> Result<T, UploadError> {
    serde_json::from_value(body)
        .map_err(|e| UploadError::MalformedResponse(format!("{} 响应解析失败: {}", what, e)))
}

/// 写入请求头；非 ASCII 字符和控制字符替换为 '_'
///
/// HeaderValue::from_str 接受 0x80 以上的字节，必须先自行过滤
fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    let printable = |c: char| c.is_ascii_graphic() || c == ' ';
    let value = if value.chars().all(printable) {
        HeaderValue::from_str(value)
    } else {
        let sanitized: String = value
            .chars()
            .map(|c| if printable(c) { c } else { '_' })
            .collect();
        HeaderValue::from_str(&sanitized)
    };
    let Ok(value) = value else {
        return;
    };
    if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
        headers.insert(name, value);
    }
}
