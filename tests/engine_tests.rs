// 上传引擎集成测试（内存代理）

mod common;

use bytes::Bytes;
use common::{assert_monotonic_per_attempt, recording_sink, FakeProxy, RecordingNotifier, KIB};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use video_drop_uploader::proxy::{DestinationConfig, NotificationRoute};
use video_drop_uploader::uploader::{
    RetryPolicy, TransferRequest, UploadEngine, UploadError, UploadManager, UploadOptions,
    UploadStrategy, UploadTask, UploadTaskStatus, VideoFile,
};

const WEBHOOK: &str = "https://hooks.example/video-ready";

/// 按比例缩小：95KB 单次上限，95KB 分片
fn options() -> UploadOptions {
    UploadOptions {
        single_shot_limit: 95 * KIB,
        part_size: 95 * KIB,
        concurrency: 6,
        retry: RetryPolicy::new(3, Duration::from_millis(1)),
        ..Default::default()
    }
}

fn video(name: &str, size: u64) -> VideoFile {
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    VideoFile::from_bytes(name, "video/mp4", Bytes::from(data))
}

fn engine_with(
    proxy: Arc<FakeProxy>,
    notifier: Arc<RecordingNotifier>,
    route: NotificationRoute,
    options: UploadOptions,
) -> UploadEngine {
    let destination = DestinationConfig::new("http://proxy.test").with_webhook(WEBHOOK, route);
    UploadEngine::with_backends(proxy, notifier, destination, options)
}

fn engine(proxy: Arc<FakeProxy>, notifier: Arc<RecordingNotifier>) -> UploadEngine {
    engine_with(proxy, notifier, NotificationRoute::Client, options())
}

#[tokio::test]
async fn test_small_file_uses_single_upload() {
    let proxy = FakeProxy::new();
    let notifier = RecordingNotifier::new();
    let engine = engine(proxy.clone(), notifier.clone());
    let (sink, seen) = recording_sink();

    let outcome = engine
        .upload(TransferRequest::new(video("teaser.mp4", 10 * KIB)).with_progress(sink))
        .await
        .unwrap();

    assert_eq!(outcome.strategy, UploadStrategy::Single);
    assert_eq!(outcome.video_id.as_deref(), Some("video-42"));
    assert_eq!(proxy.single_calls.load(Ordering::SeqCst), 1);
    assert_eq!(proxy.start_calls.load(Ordering::SeqCst), 0);
    assert_eq!(proxy.total_part_calls(), 0);

    let single = proxy.single_requests.lock();
    assert_eq!(single[0].file_name, "teaser.mp4");
    assert_eq!(single[0].mime_type, "video/mp4");
    assert_eq!(single[0].forwarding_webhook, None);

    let seen = seen.lock();
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.iter().all(|&p| p <= 100));
    assert!(seen.iter().filter(|&&p| p < 100).all(|&p| p <= 95));
    assert_monotonic_per_attempt(&seen);

    let notices = notifier.notices.lock();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].0, WEBHOOK);
    assert_eq!(notices[0].1.video_filename, "teaser.mp4");
    assert_eq!(notices[0].1.upload_method, UploadStrategy::Single);
}

#[tokio::test]
async fn test_large_file_uploads_three_parts_and_completes_sorted() {
    let proxy = FakeProxy::new();
    let notifier = RecordingNotifier::new();
    let engine = engine(proxy.clone(), notifier.clone());
    let (sink, seen) = recording_sink();

    let outcome = engine
        .upload(TransferRequest::new(video("launch.mp4", 250 * KIB)).with_progress(sink))
        .await
        .unwrap();

    assert_eq!(outcome.strategy, UploadStrategy::Multipart);
    assert_eq!(proxy.start_calls.load(Ordering::SeqCst), 1);
    for n in 1..=3 {
        assert_eq!(proxy.part_calls(n), 1, "part {}", n);
    }
    assert_eq!(proxy.complete_calls.load(Ordering::SeqCst), 1);

    let completes = proxy.complete_requests.lock();
    let numbers: Vec<u32> = completes[0].parts.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(completes[0].upload_id, "upload-1");
    assert_eq!(completes[0].original_filename, "launch.mp4");
    assert_eq!(completes[0].parts[1].etag, "\"etag-upload-1-2\"");

    let seen = seen.lock();
    assert_monotonic_per_attempt(&seen);
    assert!(seen.contains(&85));
    assert!(seen.contains(&95));
    assert_eq!(seen.last(), Some(&100));

    let notices = notifier.notices.lock();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].1.upload_method, UploadStrategy::Multipart);
}

#[tokio::test]
async fn test_part_retried_in_place_without_new_session() {
    let proxy = FakeProxy::new();
    proxy.fail_part(2, 2);
    let engine = engine(proxy.clone(), RecordingNotifier::new());
    let (sink, seen) = recording_sink();

    engine
        .upload(TransferRequest::new(video("retry.mp4", 250 * KIB)).with_progress(sink))
        .await
        .unwrap();

    assert_eq!(proxy.start_calls.load(Ordering::SeqCst), 1);
    assert_eq!(proxy.part_calls(1), 1);
    assert_eq!(proxy.part_calls(2), 3);
    assert_eq!(proxy.part_calls(3), 1);
    assert_eq!(proxy.complete_calls.load(Ordering::SeqCst), 1);

    // 分片 2 重试时槽位清零，整体进度不回退
    let seen = seen.lock();
    assert!(seen.windows(2).all(|w| w[1] >= w[0]), "进度回退: {:?}", seen);
    assert_eq!(seen.last(), Some(&100));
}

#[tokio::test]
async fn test_cancel_mid_batch_aborts_without_complete() {
    let proxy = FakeProxy::new();
    proxy.set_default_delay(Duration::from_secs(5));
    let engine = engine(proxy.clone(), RecordingNotifier::new());

    let cancel = CancellationToken::new();
    let task = Arc::new(Mutex::new(UploadTask::new("cancel.mp4".to_string(), 250 * KIB)));
    let request = TransferRequest::new(video("cancel.mp4", 250 * KIB))
        .with_cancel(cancel.clone())
        .with_task(task.clone());

    let handle = tokio::spawn(async move { engine.upload(request).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("取消后应尽快返回")
        .unwrap();

    assert!(matches!(result, Err(UploadError::Aborted)));
    assert_eq!(proxy.start_calls.load(Ordering::SeqCst), 1);
    assert_eq!(proxy.complete_calls.load(Ordering::SeqCst), 0);
    assert_eq!(task.lock().status, UploadTaskStatus::Cancelled);
}

#[tokio::test]
async fn test_start_failure_exhausts_transfer_retries() {
    let proxy = FakeProxy::new();
    proxy.fail_start(10);
    let engine = engine(proxy.clone(), RecordingNotifier::new());
    let task = Arc::new(Mutex::new(UploadTask::new("start.mp4".to_string(), 250 * KIB)));

    let err = engine
        .upload(TransferRequest::new(video("start.mp4", 250 * KIB)).with_task(task.clone()))
        .await
        .unwrap_err();

    match err {
        UploadError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, UploadError::SessionStartFailed(_)));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(proxy.start_calls.load(Ordering::SeqCst), 3);
    assert_eq!(proxy.total_part_calls(), 0);

    let task = task.lock();
    assert_eq!(task.status, UploadTaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert!(task.error.is_some());
}

#[tokio::test]
async fn test_complete_lists_parts_in_order_regardless_of_finish_order() {
    let proxy = FakeProxy::new();
    proxy.delay_part(1, Duration::from_millis(60));
    proxy.delay_part(2, Duration::from_millis(30));
    let engine = engine(proxy.clone(), RecordingNotifier::new());

    engine
        .upload(TransferRequest::new(video("order.mp4", 250 * KIB)))
        .await
        .unwrap();

    let completes = proxy.complete_requests.lock();
    let numbers: Vec<u32> = completes[0].parts.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_batches_never_exceed_concurrency() {
    let proxy = FakeProxy::new();
    proxy.set_default_delay(Duration::from_millis(20));
    let options = UploadOptions {
        concurrency: 3,
        ..options()
    };
    let engine = engine_with(
        proxy.clone(),
        RecordingNotifier::new(),
        NotificationRoute::Client,
        options,
    );

    // 10 个分片：3 + 3 + 3 + 1
    engine
        .upload(TransferRequest::new(video("wide.mp4", 9 * 95 * KIB + 1)))
        .await
        .unwrap();

    assert_eq!(proxy.total_part_calls(), 10);
    let peak = proxy.peak_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak in flight = {}", peak);
    assert!(peak >= 1);
}

#[tokio::test]
async fn test_complete_failure_restarts_transfer_and_resets_progress() {
    let proxy = FakeProxy::new();
    proxy.fail_complete(1);
    let engine = engine(proxy.clone(), RecordingNotifier::new());
    let (sink, seen) = recording_sink();

    let outcome = engine
        .upload(TransferRequest::new(video("again.mp4", 250 * KIB)).with_progress(sink))
        .await
        .unwrap();

    assert_eq!(outcome.strategy, UploadStrategy::Multipart);
    assert_eq!(proxy.start_calls.load(Ordering::SeqCst), 2);
    assert_eq!(proxy.complete_calls.load(Ordering::SeqCst), 2);
    assert_eq!(proxy.part_calls(1), 2);

    // 第二次会话使用新的 upload_id
    let completes = proxy.complete_requests.lock();
    assert_eq!(completes[1].upload_id, "upload-2");

    let seen = seen.lock();
    assert!(seen.contains(&0), "重试前应回调 0: {:?}", seen);
    assert_monotonic_per_attempt(&seen);
    assert_eq!(seen.last(), Some(&100));
}

#[tokio::test]
async fn test_invalid_input_is_not_retried() {
    let proxy = FakeProxy::new();
    let notifier = RecordingNotifier::new();
    let engine = engine(proxy.clone(), notifier.clone());

    let pdf = VideoFile::from_bytes("deck.pdf", "application/pdf", Bytes::from_static(b"%PDF"));
    let task = Arc::new(Mutex::new(UploadTask::new("deck.pdf".to_string(), 4)));
    let err = engine
        .upload(TransferRequest::new(pdf).with_task(task.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::InvalidInput(_)));
    assert_eq!(task.lock().status, UploadTaskStatus::Failed);

    let empty = VideoFile::from_bytes("empty.mp4", "video/mp4", Bytes::new());
    let err = engine.upload(TransferRequest::new(empty)).await.unwrap_err();
    assert!(matches!(err, UploadError::InvalidInput(_)));

    assert_eq!(proxy.single_calls.load(Ordering::SeqCst), 0);
    assert_eq!(proxy.start_calls.load(Ordering::SeqCst), 0);
    assert!(notifier.notices.lock().is_empty());
}

#[tokio::test]
async fn test_persistent_part_failure_reports_root_cause() {
    let proxy = FakeProxy::new();
    proxy.fail_part(1, usize::MAX);
    let notifier = RecordingNotifier::new();
    let engine = engine(proxy.clone(), notifier.clone());

    let err = engine
        .upload(TransferRequest::new(video("broken.mp4", 250 * KIB)))
        .await
        .unwrap_err();

    match &err {
        UploadError::RetriesExhausted { attempts, last } => {
            assert_eq!(*attempts, 3);
            assert!(matches!(**last, UploadError::Network(_)));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    // 整体 3 次 x 分片 3 次
    assert_eq!(proxy.part_calls(1), 9);
    assert_eq!(proxy.start_calls.load(Ordering::SeqCst), 3);
    assert_eq!(proxy.complete_calls.load(Ordering::SeqCst), 0);
    assert!(notifier.notices.lock().is_empty());
}

#[tokio::test]
async fn test_proxy_route_forwards_webhook_instead_of_notifying() {
    let proxy = FakeProxy::new();
    let notifier = RecordingNotifier::new();
    let engine = engine_with(
        proxy.clone(),
        notifier.clone(),
        NotificationRoute::Proxy,
        options(),
    );

    engine
        .upload(TransferRequest::new(video("fwd.mp4", 250 * KIB)))
        .await
        .unwrap();
    engine
        .upload(TransferRequest::new(video("fwd-small.mp4", 10 * KIB)))
        .await
        .unwrap();

    let completes = proxy.complete_requests.lock();
    assert_eq!(completes[0].forwarding_webhook.as_deref(), Some(WEBHOOK));
    let single = proxy.single_requests.lock();
    assert_eq!(single[0].forwarding_webhook.as_deref(), Some(WEBHOOK));
    assert!(notifier.notices.lock().is_empty());
}

#[tokio::test]
async fn test_manager_uploads_batch_and_reports_per_task() {
    let proxy = FakeProxy::new();
    let engine = engine(proxy.clone(), RecordingNotifier::new());

    let events: Arc<Mutex<Vec<(String, u8)>>> = Arc::new(Mutex::new(Vec::new()));
    let events_c = events.clone();
    let manager = UploadManager::new(engine, 2).with_progress_listener(Arc::new(
        move |id: &str, percent: u8| events_c.lock().push((id.to_string(), percent)),
    ));

    let results = manager
        .upload_batch(vec![video("a.mp4", 10 * KIB), video("b.mp4", 250 * KIB)])
        .await;

    assert_eq!(results.len(), 2);
    for (id, result) in &results {
        assert!(result.is_ok(), "{}: {:?}", id, result);
        let task = manager.get_task(id).unwrap();
        assert_eq!(task.status, UploadTaskStatus::Completed);
        assert_eq!(task.percent, 100);
        assert!(events.lock().iter().any(|(eid, p)| eid == id && *p == 100));
    }
    assert_eq!(manager.get_task(&results[0].0).unwrap().file_name, "a.mp4");
    assert_eq!(manager.active_task_count(), 0);
    assert_eq!(manager.clear_finished(), 2);
    assert!(manager.get_all_tasks().is_empty());
}
