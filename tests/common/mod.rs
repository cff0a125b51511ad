// 测试用内存存储代理与通知记录器

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use video_drop_uploader::proxy::{
    CompleteRequest, CompletionNotice, CompletionNotifier, PartUploadParams, PartUploadResponse,
    SingleUploadParams, StartRequest, StartResponse, StorageProxy, StoredObject,
};
use video_drop_uploader::uploader::{BytesSentCallback, ProgressSink, UploadBody, UploadError};

pub const KIB: u64 = 1024;

/// 可编排的内存代理
#[derive(Default)]
pub struct FakeProxy {
    /// start 前 N 次失败（HTTP 500）
    pub start_failures: AtomicUsize,
    /// complete 前 N 次失败（HTTP 500）
    pub complete_failures: AtomicUsize,
    /// 分片编号 -> 剩余失败次数
    pub part_failures: Mutex<HashMap<u32, usize>>,
    /// 分片编号 -> 上传耗时
    pub part_delays: Mutex<HashMap<u32, Duration>>,
    /// 未单独指定时的分片耗时
    pub default_delay: Mutex<Duration>,

    pub single_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub complete_calls: AtomicUsize,
    pub part_calls: Mutex<HashMap<u32, usize>>,

    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,

    pub single_requests: Mutex<Vec<SingleUploadParams>>,
    pub complete_requests: Mutex<Vec<CompleteRequest>>,
}

impl FakeProxy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_start(&self, times: usize) {
        self.start_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_complete(&self, times: usize) {
        self.complete_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_part(&self, part_number: u32, times: usize) {
        self.part_failures.lock().insert(part_number, times);
    }

    pub fn delay_part(&self, part_number: u32, delay: Duration) {
        self.part_delays.lock().insert(part_number, delay);
    }

    pub fn set_default_delay(&self, delay: Duration) {
        *self.default_delay.lock() = delay;
    }

    pub fn part_calls(&self, part_number: u32) -> usize {
        self.part_calls.lock().get(&part_number).copied().unwrap_or(0)
    }

    pub fn total_part_calls(&self) -> usize {
        self.part_calls.lock().values().sum()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn stored_object(size: u64) -> StoredObject {
        StoredObject {
            video_id: Some("video-42".to_string()),
            video_url: Some("https://cdn.example/videos/video-42.mp4".to_string()),
            size: Some(size),
        }
    }
}

fn server_error(message: &str) -> UploadError {
    UploadError::ServerRejected {
        status: 500,
        message: message.to_string(),
    }
}

#[async_trait]
impl StorageProxy for FakeProxy {
    async fn upload_single(
        &self,
        params: SingleUploadParams,
        body: UploadBody,
        on_bytes_sent: BytesSentCallback,
        cancel: &CancellationToken,
    ) -> Result<StoredObject, UploadError> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        self.single_requests.lock().push(params);
        if cancel.is_cancelled() {
            return Err(UploadError::Aborted);
        }

        let total = body.len();
        on_bytes_sent(total / 2, total);
        on_bytes_sent(total, total);
        Ok(Self::stored_object(total))
    }

    async fn start_multipart(
        &self,
        request: StartRequest,
        cancel: &CancellationToken,
    ) -> Result<StartResponse, UploadError> {
        let call = self.start_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if cancel.is_cancelled() {
            return Err(UploadError::Aborted);
        }
        if Self::take_failure(&self.start_failures) {
            return Err(server_error("Failed to start multipart upload"));
        }
        Ok(StartResponse {
            upload_id: format!("upload-{}", call),
            key: format!("videos/{}", request.file_name),
            original_filename: Some(request.file_name),
        })
    }

    async fn upload_part(
        &self,
        params: PartUploadParams,
        body: UploadBody,
        on_bytes_sent: BytesSentCallback,
        cancel: &CancellationToken,
    ) -> Result<PartUploadResponse, UploadError> {
        *self.part_calls.lock().entry(params.part_number).or_insert(0) += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self
            .part_delays
            .lock()
            .get(&params.part_number)
            .copied()
            .unwrap_or(*self.default_delay.lock());

        let total = body.len();
        on_bytes_sent(total / 2, total);

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(UploadError::Aborted),
            _ = tokio::time::sleep(delay) => {
                let should_fail = {
                    let mut failures = self.part_failures.lock();
                    match failures.get_mut(&params.part_number) {
                        Some(n) if *n > 0 => {
                            *n -= 1;
                            true
                        }
                        _ => false,
                    }
                };
                if should_fail {
                    Err(UploadError::Network("connection reset by peer".to_string()))
                } else {
                    on_bytes_sent(total, total);
                    Ok(PartUploadResponse {
                        part_number: Some(params.part_number),
                        etag: format!("\"etag-{}-{}\"", params.upload_id, params.part_number),
                    })
                }
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn complete_multipart(
        &self,
        request: CompleteRequest,
        cancel: &CancellationToken,
    ) -> Result<StoredObject, UploadError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(UploadError::Aborted);
        }
        self.complete_requests.lock().push(request);
        if Self::take_failure(&self.complete_failures) {
            return Err(server_error("Failed to complete multipart upload"));
        }
        Ok(Self::stored_object(0))
    }
}

/// 记录收到的完成通知
#[derive(Default)]
pub struct RecordingNotifier {
    pub notices: Mutex<Vec<(String, CompletionNotice)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl CompletionNotifier for RecordingNotifier {
    async fn notify(&self, webhook_url: &str, notice: &CompletionNotice) -> Result<(), UploadError> {
        self.notices
            .lock()
            .push((webhook_url.to_string(), notice.clone()));
        Ok(())
    }
}

/// 记录所有进度回调
pub fn recording_sink() -> (ProgressSink, Arc<Mutex<Vec<u8>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_c = seen.clone();
    let sink: ProgressSink = Arc::new(move |p| seen_c.lock().push(p));
    (sink, seen)
}

/// 每次尝试内（以 0 分段）进度单调不减
pub fn assert_monotonic_per_attempt(values: &[u8]) {
    let mut prev = 0u8;
    for &v in values {
        if v == 0 {
            prev = 0;
            continue;
        }
        assert!(v >= prev, "进度回退: {:?}", values);
        prev = v;
    }
}
