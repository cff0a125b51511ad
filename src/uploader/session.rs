// 分片上传会话
//
// 状态机: Created → Started → PartsUploading → Completing → Completed
// 任何非终态都可以转入 Failed；Completed / Failed 之后拒绝任何操作。
// 会话只在一次整体尝试内有效，整体重试会重新 start 一个新会话

use crate::proxy::{
    CompleteRequest, CompletedPartRef, PartUploadParams, StartRequest, StorageProxy, StoredObject,
};
use crate::uploader::{
    with_retry, BatchScheduler, BytesSentCallback, PartDescriptor, PartProgress, RetryPolicy,
    UploadError, VideoFile,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 会话阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Created,
    Started,
    PartsUploading,
    Completing,
    Completed,
    Failed,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Completed | SessionPhase::Failed)
    }
}

/// 已上传的分片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// 分片上传会话
pub struct MultipartSession {
    proxy: Arc<dyn StorageProxy>,
    file: VideoFile,
    mime_type: String,
    cancel: CancellationToken,
    phase: SessionPhase,
    upload_id: Option<String>,
    object_key: Option<String>,
    original_filename: String,
    total_parts: u32,
    parts: BTreeMap<u32, CompletedPart>,
}

impl std::fmt::Debug for MultipartSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartSession")
            .field("file", &self.file.name)
            .field("phase", &self.phase)
            .field("upload_id", &self.upload_id)
            .field("object_key", &self.object_key)
            .field("completed_parts", &self.parts.len())
            .field("total_parts", &self.total_parts)
            .finish()
    }
}

impl MultipartSession {
    pub fn new(
        proxy: Arc<dyn StorageProxy>,
        file: VideoFile,
        mime_type: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        let original_filename = file.name.clone();
        Self {
            proxy,
            file,
            mime_type: mime_type.into(),
            cancel,
            phase: SessionPhase::Created,
            upload_id: None,
            object_key: None,
            original_filename,
            total_parts: 0,
            parts: BTreeMap::new(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    /// 已上传分片（按编号升序）
    pub fn completed_parts(&self) -> impl Iterator<Item = &CompletedPart> {
        self.parts.values()
    }

    fn expect_phase(&self, expected: SessionPhase, op: &str) -> Result<(), UploadError> {
        if self.phase != expected {
            return Err(UploadError::Internal(format!(
                "分片会话状态错误: {} 需要 {:?}，当前 {:?}",
                op, expected, self.phase
            )));
        }
        Ok(())
    }

    /// 创建会话（POST /start）
    pub async fn start(&mut self) -> Result<(), UploadError> {
        self.expect_phase(SessionPhase::Created, "start")?;

        let request = StartRequest {
            file_name: self.file.name.clone(),
            mime_type: self.mime_type.clone(),
            file_size: self.file.size,
        };

        match self.proxy.start_multipart(request, &self.cancel).await {
            Ok(resp) => {
                info!(
                    "[分片会话] 创建成功: file={}, upload_id={}, key={}",
                    self.file.name, resp.upload_id, resp.key
                );
                if let Some(name) = resp.original_filename {
                    self.original_filename = name;
                }
                self.upload_id = Some(resp.upload_id);
                self.object_key = Some(resp.key);
                self.phase = SessionPhase::Started;
                Ok(())
            }
            Err(e) => {
                self.phase = SessionPhase::Failed;
                if e.is_aborted() {
                    return Err(e);
                }
                warn!("[分片会话] 创建失败: file={}, 错误: {}", self.file.name, e);
                Err(UploadError::SessionStartFailed(Box::new(e)))
            }
        }
    }

    /// 按批次上传所有分片，每个分片单独重试
    pub async fn upload_parts(
        &mut self,
        parts: &[PartDescriptor],
        scheduler: &BatchScheduler,
        policy: &RetryPolicy,
        progress: Arc<PartProgress>,
    ) -> Result<(), UploadError> {
        self.expect_phase(SessionPhase::Started, "upload_parts")?;
        self.phase = SessionPhase::PartsUploading;
        self.total_parts = parts.len() as u32;

        let (upload_id, key) = match (&self.upload_id, &self.object_key) {
            (Some(id), Some(key)) => (id.clone(), key.clone()),
            _ => {
                self.phase = SessionPhase::Failed;
                return Err(UploadError::Internal("分片会话缺少 upload_id".to_string()));
            }
        };

        let proxy = self.proxy.clone();
        let file = self.file.clone();
        let cancel = self.cancel.clone();
        let policy = *policy;
        let worker_progress = progress.clone();

        let result = scheduler
            .run(parts.to_vec(), move |_, part| {
                upload_one_part(
                    proxy.clone(),
                    file.clone(),
                    PartUploadParams {
                        upload_id: upload_id.clone(),
                        key: key.clone(),
                        part_number: part.part_number,
                    },
                    part,
                    policy,
                    worker_progress.clone(),
                    cancel.clone(),
                )
            })
            .await;

        // 失败批次中仍在后台运行的请求不再更新进度
        progress.close();

        match result {
            Ok(done) => {
                for part in done {
                    self.parts.insert(part.part_number, part);
                }
                debug!(
                    "[分片会话] 全部分片上传完成: {}/{}",
                    self.parts.len(),
                    self.total_parts
                );
                Ok(())
            }
            Err(e) => {
                self.phase = SessionPhase::Failed;
                Err(e)
            }
        }
    }

    /// 合并分片（POST /complete），只会调用一次
    pub async fn complete(
        &mut self,
        forwarding_webhook: Option<String>,
    ) -> Result<StoredObject, UploadError> {
        self.expect_phase(SessionPhase::PartsUploading, "complete")?;

        if self.cancel.is_cancelled() {
            self.phase = SessionPhase::Failed;
            return Err(UploadError::Aborted);
        }

        if let Some(missing) = (1..=self.total_parts).find(|n| !self.parts.contains_key(n)) {
            self.phase = SessionPhase::Failed;
            return Err(UploadError::Internal(format!("缺少分片 #{}，无法合并", missing)));
        }

        self.phase = SessionPhase::Completing;

        let request = CompleteRequest {
            upload_id: self.upload_id.clone().unwrap_or_default(),
            key: self.object_key.clone().unwrap_or_default(),
            parts: self
                .parts
                .values()
                .map(|p| CompletedPartRef {
                    part_number: p.part_number,
                    etag: p.etag.clone(),
                })
                .collect(),
            original_filename: self.original_filename.clone(),
            mime_type: self.mime_type.clone(),
            forwarding_webhook,
        };

        info!(
            "[分片会话] 开始合并: file={}, 分片数={}",
            self.file.name,
            request.parts.len()
        );

        match self.proxy.complete_multipart(request, &self.cancel).await {
            Ok(object) => {
                self.phase = SessionPhase::Completed;
                info!(
                    "[分片会话] 合并完成: file={}, video_id={:?}",
                    self.file.name, object.video_id
                );
                Ok(object)
            }
            Err(e) => {
                self.phase = SessionPhase::Failed;
                if e.is_aborted() {
                    return Err(e);
                }
                warn!("[分片会话] 合并失败: file={}, 错误: {}", self.file.name, e);
                Err(UploadError::SessionCompleteFailed(Box::new(e)))
            }
        }
    }
}

/// 上传单个分片（带分片级重试）
#[allow(clippy::too_many_arguments)]
async fn upload_one_part(
    proxy: Arc<dyn StorageProxy>,
    file: VideoFile,
    params: PartUploadParams,
    part: PartDescriptor,
    policy: RetryPolicy,
    progress: Arc<PartProgress>,
    cancel: CancellationToken,
) -> Result<CompletedPart, UploadError> {
    let slot = part.slot();
    let label = format!("[分片#{}]", part.part_number);

    with_retry(
        &policy,
        &label,
        &cancel,
        || progress.reset_slot(slot),
        |attempt| {
            let proxy = proxy.clone();
            let file = file.clone();
            let params = params.clone();
            let progress = progress.clone();
            let cancel = cancel.clone();
            async move {
                let body = file.body(part.range())?;
                debug!(
                    "[分片#{}] 开始上传: bytes={}-{}, 尝试 {}",
                    part.part_number,
                    part.byte_start,
                    part.byte_end - 1,
                    attempt
                );

                let on_bytes_sent: BytesSentCallback =
                    Arc::new(move |loaded, _total| progress.update(slot, loaded));
                let resp = proxy.upload_part(params, body, on_bytes_sent, &cancel).await?;

                debug!("[分片#{}] 上传成功: etag={}", part.part_number, resp.etag);
                Ok(CompletedPart {
                    part_number: part.part_number,
                    etag: resp.etag,
                    size: part.len(),
                })
            }
        },
    )
    .await
}
