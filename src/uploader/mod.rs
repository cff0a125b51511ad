// 上传模块
//
// 分层（从下到上）：
// - chunk：规划单次/分片上传
// - part：单个 HTTP 上传请求（流式发送、超时、取消）
// - retry：分片级与整体级共用的重试执行器
// - scheduler：按批次并发执行分片
// - session：start / upload-part / complete 分片会话
// - engine：校验、规划、整体重试、进度、完成通知
// - manager：多文件任务管理

pub mod chunk;
pub mod engine;
pub mod error;
pub mod file;
pub mod manager;
pub mod part;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod task;

pub use chunk::{
    PartDescriptor, TransferPlan, TransferPlanner, UploadStrategy, DEFAULT_PART_SIZE,
    MIN_PART_SIZE, SINGLE_SHOT_LIMIT,
};
pub use engine::{TransferRequest, UploadEngine, UploadOptions, UploadOutcome};
pub use error::{UploadError, UploadErrorKind};
pub use file::{guess_mime_type, ByteStream, UploadBody, VideoFile, ALLOWED_VIDEO_TYPES, DEFAULT_MIME_TYPE};
pub use manager::{TaskProgressListener, UploadManager, UploadTaskInfo, DEFAULT_MAX_CONCURRENT_FILES};
pub use part::{BytesSentCallback, PartRequest, PartResponse, PartUploader, ResponseBody};
pub use progress::{PartProgress, ProgressRange, ProgressReporter, ProgressSink};
pub use retry::{with_retry, RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY_MS};
pub use scheduler::{BatchScheduler, DEFAULT_CONCURRENCY};
pub use session::{CompletedPart, MultipartSession, SessionPhase};
pub use task::{UploadTask, UploadTaskStatus};
