// Video Drop Uploader Library
// 营销视频上传核心库：分片规划、批次并发、重试、进度、完成通知

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 存储代理与完成通知
pub mod proxy;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use proxy::{DestinationConfig, NotificationRoute, ProxyClient, StorageProxy};
pub use uploader::{
    TransferRequest, UploadEngine, UploadError, UploadManager, UploadOptions, UploadOutcome,
    UploadTask, UploadTaskStatus, VideoFile,
};
