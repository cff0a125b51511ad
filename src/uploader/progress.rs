// 上传进度汇总
//
// - ProgressReporter：把字节进度映射到 0-100 的整数百分比，保证单次尝试内单调不减
// - PartProgress：分片上传时每个分片一个原子槽位，按下标分区写入，无需加锁
// - ProgressThrottler：限制进度日志的输出频率

use crate::uploader::UploadTask;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// 进度回调（0-100）
pub type ProgressSink = Arc<dyn Fn(u8) + Send + Sync>;

/// 空进度回调
pub fn noop_sink() -> ProgressSink {
    Arc::new(|_| {})
}

/// 进度区间 [start, end]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressRange {
    pub start: u8,
    pub end: u8,
}

impl ProgressRange {
    pub const fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    /// 将 done/total 映射到区间内（向下取整）
    pub fn map(&self, done: u64, total: u64) -> u8 {
        if total == 0 {
            return self.start;
        }
        let done = done.min(total) as u128;
        let span = (self.end - self.start) as u128;
        self.start + (done * span / total as u128) as u8
    }
}

/// 单次上传的字节进度区间，[95, 100] 留给通知阶段
pub const SINGLE_TRANSFER_RANGE: ProgressRange = ProgressRange::new(0, 95);

/// 分片上传的字节进度区间，[85, 100] 留给合并与通知阶段
pub const MULTIPART_TRANSFER_RANGE: ProgressRange = ProgressRange::new(0, 85);

/// 开始合并分片
pub const COMPLETING_PERCENT: u8 = 85;

/// 存储代理确认完成
pub const STORED_PERCENT: u8 = 95;

/// 速度计算最小间隔
const SPEED_WINDOW: Duration = Duration::from_millis(500);

/// 进度日志最小间隔
const LOG_INTERVAL: Duration = Duration::from_secs(2);

// =====================================================
// 日志节流
// =====================================================

/// 进度日志节流器
///
/// 字节回调可能每 256KB 触发一次，日志只按时间间隔输出
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 上次输出时间（相对 origin 的纳秒）
    last_emit_nanos: AtomicU64,
    interval_nanos: u64,
    origin: Instant,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
            origin: Instant::now(),
        }
    }

    /// 距离上次输出超过间隔时返回 true（第一次调用总是返回 true）
    pub fn should_emit(&self) -> bool {
        // +1 保证第一次调用不为 0
        let now = self.origin.elapsed().as_nanos() as u64 + 1;
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != 0 && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    pub fn reset(&self) {
        self.last_emit_nanos.store(0, Ordering::Relaxed);
    }
}

// =====================================================
// 进度上报
// =====================================================

#[derive(Debug)]
struct ReporterState {
    /// 本次尝试已上报的最高百分比
    high_water: u8,
    /// 本次尝试已传输字节数
    transferred: u64,
    /// 上次速度计算时间与字节数
    last_speed_time: Instant,
    last_speed_bytes: u64,
    /// 当前速度 (bytes/s)
    speed: u64,
}

impl ReporterState {
    fn new() -> Self {
        Self {
            high_water: 0,
            transferred: 0,
            last_speed_time: Instant::now(),
            last_speed_bytes: 0,
            speed: 0,
        }
    }
}

/// 进度上报器
///
/// 所有回调在同一把锁内调用，保证外部看到的百分比序列有序且单调
pub struct ProgressReporter {
    sink: ProgressSink,
    total_bytes: u64,
    label: String,
    state: Mutex<ReporterState>,
    task: Option<Arc<Mutex<UploadTask>>>,
    throttler: ProgressThrottler,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("label", &self.label)
            .field("total_bytes", &self.total_bytes)
            .field("state", &self.state)
            .finish()
    }
}

impl ProgressReporter {
    /// # 参数
    /// * `sink` - 百分比回调
    /// * `total_bytes` - 文件总大小
    /// * `label` - 日志标签（一般为文件名）
    /// * `task` - 可选的任务状态记录，同步写入字节数与速度
    pub fn new(
        sink: ProgressSink,
        total_bytes: u64,
        label: impl Into<String>,
        task: Option<Arc<Mutex<UploadTask>>>,
    ) -> Self {
        Self {
            sink,
            total_bytes,
            label: label.into(),
            state: Mutex::new(ReporterState::new()),
            task,
            throttler: ProgressThrottler::new(LOG_INTERVAL),
        }
    }

    /// 当前已上报的百分比
    pub fn percent(&self) -> u8 {
        self.state.lock().high_water
    }

    /// 关联的任务记录
    pub fn task(&self) -> Option<Arc<Mutex<UploadTask>>> {
        self.task.clone()
    }

    /// 上报字节进度，映射到指定区间
    pub fn report_bytes(&self, transferred: u64, range: ProgressRange) {
        let percent = range.map(transferred, self.total_bytes);
        let mut state = self.state.lock();

        if transferred > state.transferred {
            state.transferred = transferred;
            let elapsed = state.last_speed_time.elapsed();
            if elapsed >= SPEED_WINDOW {
                let diff = transferred.saturating_sub(state.last_speed_bytes);
                state.speed = (diff as f64 / elapsed.as_secs_f64()) as u64;
                state.last_speed_time = Instant::now();
                state.last_speed_bytes = transferred;
            }
            if let Some(task) = &self.task {
                let mut t = task.lock();
                t.uploaded_size = transferred.min(t.total_size);
                if state.speed > 0 {
                    t.speed = state.speed;
                }
            }
        }

        self.emit_locked(&mut state, percent);
    }

    /// 直接上报百分比（阶段切换）
    pub fn report(&self, percent: u8) {
        let mut state = self.state.lock();
        self.emit_locked(&mut state, percent.min(100));
    }

    /// 重试前清零：回调 0，清空本次尝试的状态
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = ReporterState::new();
        if let Some(task) = &self.task {
            let mut t = task.lock();
            t.uploaded_size = 0;
            t.speed = 0;
            t.percent = 0;
        }
        self.throttler.reset();
        (self.sink)(0);
    }

    fn emit_locked(&self, state: &mut ReporterState, percent: u8) {
        // 单调：低于已上报值的更新直接忽略
        if percent <= state.high_water {
            return;
        }
        state.high_water = percent;

        if let Some(task) = &self.task {
            task.lock().percent = percent;
        }

        if percent == 100 || self.throttler.should_emit() {
            info!(
                "[进度] {}: {}% ({}/{} bytes, {} KB/s)",
                self.label,
                percent,
                state.transferred,
                self.total_bytes,
                state.speed / 1024
            );
        }

        (self.sink)(percent);
    }
}

// =====================================================
// 分片进度槽位
// =====================================================

/// 分片进度槽位
///
/// 每个分片只写自己的槽位；汇总值交给 ProgressReporter 做单调处理。
/// 一次尝试结束后调用 close()，之后迟到的回调（批次失败后仍在后台运行的请求）被忽略
#[derive(Debug)]
pub struct PartProgress {
    slots: Vec<AtomicU64>,
    closed: AtomicBool,
    reporter: Arc<ProgressReporter>,
    range: ProgressRange,
}

impl PartProgress {
    pub fn new(part_count: usize, reporter: Arc<ProgressReporter>, range: ProgressRange) -> Arc<Self> {
        Arc::new(Self {
            slots: (0..part_count).map(|_| AtomicU64::new(0)).collect(),
            closed: AtomicBool::new(false),
            reporter,
            range,
        })
    }

    /// 更新某个分片的已发送字节数并刷新总进度
    pub fn update(&self, slot: usize, loaded: u64) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(s) = self.slots.get(slot) {
            s.store(loaded, Ordering::Release);
            self.reporter.report_bytes(self.transferred(), self.range);
        }
    }

    /// 分片重试前清零该槽位（已上报的百分比不回退）
    pub fn reset_slot(&self, slot: usize) {
        if let Some(s) = self.slots.get(slot) {
            s.store(0, Ordering::Release);
        }
    }

    pub fn slot(&self, slot: usize) -> u64 {
        self.slots
            .get(slot)
            .map(|s| s.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// 所有槽位之和
    pub fn transferred(&self) -> u64 {
        self.slots.iter().map(|s| s.load(Ordering::Acquire)).sum()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_sink() -> (ProgressSink, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_c = seen.clone();
        let sink: ProgressSink = Arc::new(move |p| seen_c.lock().push(p));
        (sink, seen)
    }

    #[test]
    fn test_range_mapping() {
        assert_eq!(SINGLE_TRANSFER_RANGE.map(0, 1000), 0);
        assert_eq!(SINGLE_TRANSFER_RANGE.map(500, 1000), 47);
        assert_eq!(SINGLE_TRANSFER_RANGE.map(1000, 1000), 95);
        assert_eq!(MULTIPART_TRANSFER_RANGE.map(1000, 1000), 85);
        // 超出总量时截断
        assert_eq!(MULTIPART_TRANSFER_RANGE.map(5000, 1000), 85);
        assert_eq!(ProgressRange::new(10, 20).map(1, 0), 10);
    }

    #[test]
    fn test_reporter_is_monotonic() {
        let (sink, seen) = recording_sink();
        let reporter = ProgressReporter::new(sink, 100, "clip.mp4", None);

        reporter.report_bytes(50, ProgressRange::new(0, 100));
        reporter.report_bytes(30, ProgressRange::new(0, 100));
        reporter.report_bytes(50, ProgressRange::new(0, 100));
        reporter.report_bytes(80, ProgressRange::new(0, 100));
        reporter.report(100);

        assert_eq!(*seen.lock(), vec![50, 80, 100]);
        assert_eq!(reporter.percent(), 100);
    }

    #[test]
    fn test_reset_emits_zero_and_restarts() {
        let (sink, seen) = recording_sink();
        let reporter = ProgressReporter::new(sink, 100, "clip.mp4", None);

        reporter.report_bytes(60, ProgressRange::new(0, 100));
        reporter.reset();
        reporter.report_bytes(20, ProgressRange::new(0, 100));

        assert_eq!(*seen.lock(), vec![60, 0, 20]);
    }

    #[test]
    fn test_reporter_updates_task() {
        let (sink, _) = recording_sink();
        let task = Arc::new(Mutex::new(UploadTask::new("clip.mp4".to_string(), 200)));
        let reporter = ProgressReporter::new(sink, 200, "clip.mp4", Some(task.clone()));

        reporter.report_bytes(100, SINGLE_TRANSFER_RANGE);
        {
            let t = task.lock();
            assert_eq!(t.uploaded_size, 100);
            assert_eq!(t.percent, 47);
        }

        reporter.reset();
        assert_eq!(task.lock().uploaded_size, 0);
        assert_eq!(task.lock().percent, 0);
    }

    #[test]
    fn test_part_slots_aggregate() {
        let (sink, seen) = recording_sink();
        let reporter = Arc::new(ProgressReporter::new(sink, 300, "clip.mp4", None));
        let progress = PartProgress::new(3, reporter, ProgressRange::new(0, 100));

        progress.update(0, 100);
        progress.update(2, 50);
        assert_eq!(progress.transferred(), 150);

        // 分片重试清零槽位，已上报的百分比不回退
        progress.reset_slot(2);
        assert_eq!(progress.slot(2), 0);
        progress.update(1, 20);
        assert_eq!(progress.transferred(), 120);

        progress.update(2, 100);
        progress.update(1, 100);
        assert_eq!(*seen.lock(), vec![33, 50, 73, 100]);
    }

    #[test]
    fn test_closed_progress_ignores_late_updates() {
        let (sink, seen) = recording_sink();
        let reporter = Arc::new(ProgressReporter::new(sink, 100, "clip.mp4", None));
        let progress = PartProgress::new(2, reporter, ProgressRange::new(0, 100));

        progress.update(0, 10);
        progress.close();
        progress.update(1, 90);

        assert_eq!(*seen.lock(), vec![10]);
    }

    #[test]
    fn test_throttler() {
        let throttler = ProgressThrottler::new(Duration::from_secs(60));
        assert!(throttler.should_emit());
        assert!(!throttler.should_emit());

        throttler.reset();
        assert!(throttler.should_emit());
    }
}
