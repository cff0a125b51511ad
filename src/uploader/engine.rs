// 上传引擎
//
// 核心流程：
// 1. 校验文件（空文件、MIME 类型）
// 2. 规划：< 95MB 单次上传，否则分片上传
// 3. 在整体重试中执行上传（分片上传每次重试都会重新 start 会话）
// 4. 上传成功后发送完成通知
//
// 进度区间：
// - 单次上传：字节进度映射到 0-95，通知后 100
// - 分片上传：字节进度映射到 0-85，开始合并 85，代理确认 95，通知后 100

use crate::proxy::{
    send_completion_notice, CompletionNotice, CompletionNotifier, DestinationConfig, ProxyClient,
    ProxyTimeouts, SingleUploadParams, StorageProxy, StoredObject, WebhookNotifier,
    DEFAULT_NOTIFY_TIMEOUT,
};
use crate::uploader::file::{validate_file, ALLOWED_VIDEO_TYPES, DEFAULT_MIME_TYPE};
use crate::uploader::progress::{
    noop_sink, ProgressReporter, ProgressSink, COMPLETING_PERCENT, MULTIPART_TRANSFER_RANGE,
    SINGLE_TRANSFER_RANGE, STORED_PERCENT,
};
use crate::uploader::{
    with_retry, BatchScheduler, BytesSentCallback, MultipartSession, PartProgress, RetryPolicy,
    TransferPlan, TransferPlanner, UploadError, UploadStrategy, UploadTask, VideoFile,
    DEFAULT_CONCURRENCY, DEFAULT_PART_SIZE, SINGLE_SHOT_LIMIT,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 上传运行参数
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// 小于该值走单次上传
    pub single_shot_limit: u64,
    pub part_size: u64,
    /// 每批并发分片数
    pub concurrency: usize,
    /// 分片级与整体级共用的重试策略
    pub retry: RetryPolicy,
    pub timeouts: ProxyTimeouts,
    pub notify_timeout: Duration,
    pub allowed_mime_types: Vec<String>,
    pub default_mime_type: String,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            single_shot_limit: SINGLE_SHOT_LIMIT,
            part_size: DEFAULT_PART_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            timeouts: ProxyTimeouts::default(),
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
            allowed_mime_types: ALLOWED_VIDEO_TYPES.iter().map(|s| s.to_string()).collect(),
            default_mime_type: DEFAULT_MIME_TYPE.to_string(),
        }
    }
}

/// 一次上传请求
pub struct TransferRequest {
    pub file: VideoFile,
    pub on_progress: ProgressSink,
    pub cancel: CancellationToken,
    pub task: Option<Arc<Mutex<UploadTask>>>,
}

impl TransferRequest {
    pub fn new(file: VideoFile) -> Self {
        Self {
            file,
            on_progress: noop_sink(),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.on_progress = sink;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_task(mut self, task: Arc<Mutex<UploadTask>>) -> Self {
        self.task = Some(task);
        self
    }
}

/// 上传结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadOutcome {
    pub video_id: Option<String>,
    pub video_url: Option<String>,
    pub size: u64,
    pub strategy: UploadStrategy,
}

/// 上传引擎
#[derive(Clone)]
pub struct UploadEngine {
    proxy: Arc<dyn StorageProxy>,
    notifier: Arc<dyn CompletionNotifier>,
    destination: DestinationConfig,
    options: UploadOptions,
    planner: TransferPlanner,
}

impl std::fmt::Debug for UploadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadEngine")
            .field("destination", &self.destination)
            .field("options", &self.options)
            .finish()
    }
}

impl UploadEngine {
    /// 使用 HTTP 代理客户端和 webhook 通知创建引擎
    pub fn new(destination: DestinationConfig, options: UploadOptions) -> anyhow::Result<Self> {
        let proxy = ProxyClient::new(destination.storage_proxy_base.clone(), options.timeouts)?;
        let notifier = WebhookNotifier::new(options.notify_timeout)?;
        Ok(Self::with_backends(
            Arc::new(proxy),
            Arc::new(notifier),
            destination,
            options,
        ))
    }

    /// 指定代理与通知实现
    pub fn with_backends(
        proxy: Arc<dyn StorageProxy>,
        notifier: Arc<dyn CompletionNotifier>,
        destination: DestinationConfig,
        options: UploadOptions,
    ) -> Self {
        let planner = TransferPlanner::new(options.single_shot_limit, options.part_size);
        Self {
            proxy,
            notifier,
            destination,
            options,
            planner,
        }
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    pub fn destination(&self) -> &DestinationConfig {
        &self.destination
    }

    /// 执行上传
    ///
    /// 任务状态（如果有）在这里统一落定：完成、失败或取消
    pub async fn upload(&self, request: TransferRequest) -> Result<UploadOutcome, UploadError> {
        let TransferRequest {
            file,
            on_progress,
            cancel,
            task,
        } = request;

        let result = self.run(&file, on_progress, &cancel, task.clone()).await;

        match &result {
            Ok(outcome) => {
                info!(
                    "[整体上传] 上传完成: file={}, strategy={}, video_id={:?}",
                    file.name,
                    outcome.strategy.as_str(),
                    outcome.video_id
                );
                if let Some(task) = &task {
                    task.lock()
                        .mark_completed(outcome.video_id.clone(), outcome.video_url.clone());
                }
            }
            Err(e) if e.is_aborted() => {
                info!("[整体上传] 上传已取消: {}", file.name);
                if let Some(task) = &task {
                    task.lock().mark_cancelled();
                }
            }
            Err(e) => {
                warn!("[整体上传] 上传失败: file={}, 错误: {}", file.name, e);
                if let Some(task) = &task {
                    task.lock().mark_failed(e.to_string());
                }
            }
        }

        result
    }

    async fn run(
        &self,
        file: &VideoFile,
        on_progress: ProgressSink,
        cancel: &CancellationToken,
        task: Option<Arc<Mutex<UploadTask>>>,
    ) -> Result<UploadOutcome, UploadError> {
        let mime_type = validate_file(
            file,
            &self.options.allowed_mime_types,
            &self.options.default_mime_type,
        )?;
        let plan = self.planner.plan(file.size)?;

        info!(
            "[整体上传] 开始上传: file={}, size={} bytes, type={}, strategy={}, 分片数={}",
            file.name,
            file.size,
            mime_type,
            plan.strategy.as_str(),
            plan.part_count()
        );

        if let Some(task) = &task {
            task.lock().mark_uploading(plan.strategy);
        }

        let reporter = Arc::new(ProgressReporter::new(
            on_progress,
            file.size,
            file.name.clone(),
            task.clone(),
        ));

        let label = format!("[整体上传] {}", file.name);
        let mime_ref = mime_type.as_str();
        let plan_ref = &plan;
        let task_ref = &task;
        let attempt_reporter = reporter.clone();

        let object = with_retry(
            &self.options.retry,
            &label,
            cancel,
            || reporter.reset(),
            move |attempt| {
                if let Some(task) = task_ref {
                    let mut t = task.lock();
                    t.attempts = attempt;
                    t.mark_uploading(plan_ref.strategy);
                }
                self.attempt(file, mime_ref, plan_ref, attempt_reporter.clone(), cancel)
            },
        )
        .await?;

        // 完成通知
        if let Some(webhook) = self.destination.client_webhook() {
            let notice = CompletionNotice::new(&object, &file.name, plan.strategy);
            let notify = send_completion_notice(self.notifier.as_ref(), webhook, &notice);
            if tokio::time::timeout(self.options.notify_timeout, notify)
                .await
                .is_err()
            {
                warn!(
                    "[通知] 完成通知超时（{}s），忽略: {}",
                    self.options.notify_timeout.as_secs(),
                    file.name
                );
            }
        }

        reporter.report(100);

        Ok(UploadOutcome {
            video_id: object.video_id,
            video_url: object.video_url,
            size: object.size.unwrap_or(file.size),
            strategy: plan.strategy,
        })
    }

    /// 一次整体尝试
    async fn attempt(
        &self,
        file: &VideoFile,
        mime_type: &str,
        plan: &TransferPlan,
        reporter: Arc<ProgressReporter>,
        cancel: &CancellationToken,
    ) -> Result<StoredObject, UploadError> {
        match plan.strategy {
            UploadStrategy::Single => self.upload_single(file, mime_type, reporter, cancel).await,
            UploadStrategy::Multipart => {
                self.upload_multipart(file, mime_type, plan, reporter, cancel)
                    .await
            }
        }
    }

    async fn upload_single(
        &self,
        file: &VideoFile,
        mime_type: &str,
        reporter: Arc<ProgressReporter>,
        cancel: &CancellationToken,
    ) -> Result<StoredObject, UploadError> {
        let body = file.whole_body()?;

        let on_bytes_sent: BytesSentCallback = {
            let reporter = reporter.clone();
            Arc::new(move |loaded, _total| reporter.report_bytes(loaded, SINGLE_TRANSFER_RANGE))
        };

        let params = SingleUploadParams {
            file_name: file.name.clone(),
            mime_type: mime_type.to_string(),
            forwarding_webhook: self.destination.forwarding_webhook().map(String::from),
        };

        let object = self
            .proxy
            .upload_single(params, body, on_bytes_sent, cancel)
            .await?;

        reporter.report(SINGLE_TRANSFER_RANGE.end);
        Ok(object)
    }

    async fn upload_multipart(
        &self,
        file: &VideoFile,
        mime_type: &str,
        plan: &TransferPlan,
        reporter: Arc<ProgressReporter>,
        cancel: &CancellationToken,
    ) -> Result<StoredObject, UploadError> {
        let mut session =
            MultipartSession::new(self.proxy.clone(), file.clone(), mime_type, cancel.clone());
        session.start().await?;

        let progress = PartProgress::new(plan.part_count(), reporter.clone(), MULTIPART_TRANSFER_RANGE);
        let scheduler = BatchScheduler::new(self.options.concurrency).with_cancel(cancel.clone());

        info!(
            "[并发上传] 开始上传 {} 个分片，每批并发数: {}",
            plan.part_count(),
            scheduler.concurrency()
        );

        session
            .upload_parts(&plan.parts, &scheduler, &self.options.retry, progress)
            .await?;

        reporter.report(COMPLETING_PERCENT);
        if let Some(task) = reporter.task() {
            task.lock().mark_completing();
        }

        let object = session
            .complete(self.destination.forwarding_webhook().map(String::from))
            .await?;

        reporter.report(STORED_PERCENT);
        Ok(object)
    }
}
