// 上传任务状态记录

use crate::uploader::UploadStrategy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadTaskStatus {
    /// 等待中
    Pending,
    /// 上传中
    Uploading,
    /// 合并分片中
    Completing,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl UploadTaskStatus {
    /// 是否已结束
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            UploadTaskStatus::Completed | UploadTaskStatus::Failed | UploadTaskStatus::Cancelled
        )
    }
}

/// 上传任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    /// 任务ID
    pub id: String,
    /// 原始文件名
    pub file_name: String,
    /// 文件大小
    pub total_size: u64,
    /// 本次尝试已上传大小
    pub uploaded_size: u64,
    /// 对外上报的百分比 (0-100)
    pub percent: u8,
    /// 任务状态
    pub status: UploadTaskStatus,
    /// 上传策略（规划之后才确定）
    pub strategy: Option<UploadStrategy>,
    /// 整体尝试次数
    pub attempts: u32,
    /// 上传速度 (bytes/s)
    pub speed: u64,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 错误信息
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
}

impl UploadTask {
    /// 创建新的上传任务
    pub fn new(file_name: String, total_size: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file_name,
            total_size,
            uploaded_size: 0,
            percent: 0,
            status: UploadTaskStatus::Pending,
            strategy: None,
            attempts: 0,
            speed: 0,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            error: None,
            video_id: None,
            video_url: None,
        }
    }

    /// 计算字节进度百分比
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.uploaded_size as f64 / self.total_size as f64) * 100.0
    }

    /// 估算剩余时间 (秒)
    pub fn eta(&self) -> Option<u64> {
        if self.speed == 0 || self.uploaded_size >= self.total_size {
            return None;
        }
        let remaining = self.total_size - self.uploaded_size;
        Some(remaining / self.speed)
    }

    /// 标记为上传中
    pub fn mark_uploading(&mut self, strategy: UploadStrategy) {
        self.status = UploadTaskStatus::Uploading;
        self.strategy = Some(strategy);
        self.error = None;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为合并分片中
    pub fn mark_completing(&mut self) {
        self.status = UploadTaskStatus::Completing;
        self.uploaded_size = self.total_size;
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self, video_id: Option<String>, video_url: Option<String>) {
        self.status = UploadTaskStatus::Completed;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.uploaded_size = self.total_size;
        self.percent = 100;
        self.speed = 0;
        self.video_id = video_id;
        self.video_url = video_url;
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = UploadTaskStatus::Failed;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.speed = 0;
        self.error = Some(error);
    }

    /// 标记为已取消
    pub fn mark_cancelled(&mut self) {
        self.status = UploadTaskStatus::Cancelled;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.speed = 0;
    }
}
