// 上传管理器
//
// 负责管理多个上传任务：
// - 任务表（DashMap）
// - 文件级并发控制（Semaphore，默认一次只传一个文件）
// - 取消单个任务或全部任务
// - 清理已结束的任务

use crate::uploader::{
    TransferRequest, UploadEngine, UploadError, UploadOutcome, UploadTask, UploadTaskStatus,
    VideoFile,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 默认同时上传的文件数
pub const DEFAULT_MAX_CONCURRENT_FILES: usize = 1;

/// 任务进度监听 (task_id, percent)
pub type TaskProgressListener = Arc<dyn Fn(&str, u8) + Send + Sync>;

/// 上传任务信息
#[derive(Debug, Clone)]
pub struct UploadTaskInfo {
    /// 任务
    pub task: Arc<Mutex<UploadTask>>,
    /// 待上传文件
    pub file: VideoFile,
    /// 取消令牌
    pub cancel_token: CancellationToken,
}

/// 上传管理器
pub struct UploadManager {
    engine: Arc<UploadEngine>,
    /// 所有任务（task_id -> TaskInfo）
    tasks: Arc<DashMap<String, UploadTaskInfo>>,
    /// 文件级并发控制
    file_semaphore: Arc<Semaphore>,
    max_concurrent_files: usize,
    listener: Option<TaskProgressListener>,
}

impl UploadManager {
    /// # 参数
    /// * `engine` - 上传引擎
    /// * `max_concurrent_files` - 同时上传的文件数（至少为 1）
    pub fn new(engine: UploadEngine, max_concurrent_files: usize) -> Self {
        let max_concurrent_files = max_concurrent_files.max(1);
        info!("创建上传管理器: 最大同时上传文件数={}", max_concurrent_files);
        Self {
            engine: Arc::new(engine),
            tasks: Arc::new(DashMap::new()),
            file_semaphore: Arc::new(Semaphore::new(max_concurrent_files)),
            max_concurrent_files,
            listener: None,
        }
    }

    /// 设置进度监听
    pub fn with_progress_listener(mut self, listener: TaskProgressListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn max_concurrent_files(&self) -> usize {
        self.max_concurrent_files
    }

    pub fn engine(&self) -> &UploadEngine {
        &self.engine
    }

    /// 创建上传任务，返回任务 ID
    pub fn create_task(&self, file: VideoFile) -> String {
        let task = UploadTask::new(file.name.clone(), file.size);
        let task_id = task.id.clone();

        info!(
            "创建上传任务: id={}, file={}, size={} bytes",
            task_id, file.name, file.size
        );

        self.tasks.insert(
            task_id.clone(),
            UploadTaskInfo {
                task: Arc::new(Mutex::new(task)),
                file,
                cancel_token: CancellationToken::new(),
            },
        );
        task_id
    }

    /// 执行上传任务（等待文件级许可后开始）
    pub async fn run_task(&self, task_id: &str) -> Result<UploadOutcome, UploadError> {
        // 不跨 await 持有 DashMap 引用
        let info = self
            .tasks
            .get(task_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| UploadError::InvalidInput(format!("任务不存在: {}", task_id)))?;

        {
            let task = info.task.lock();
            if task.status != UploadTaskStatus::Pending {
                return match task.status {
                    UploadTaskStatus::Cancelled => Err(UploadError::Aborted),
                    status => Err(UploadError::Internal(format!(
                        "任务状态为 {:?}，无法开始: {}",
                        status, task_id
                    ))),
                };
            }
        }

        let _permit = tokio::select! {
            _ = info.cancel_token.cancelled() => {
                info.task.lock().mark_cancelled();
                return Err(UploadError::Aborted);
            }
            permit = self.file_semaphore.clone().acquire_owned() => {
                permit.map_err(|_| UploadError::Internal("文件并发信号量已关闭".to_string()))?
            }
        };

        let mut request = TransferRequest::new(info.file.clone())
            .with_cancel(info.cancel_token.clone())
            .with_task(info.task.clone());

        if let Some(listener) = &self.listener {
            let listener = listener.clone();
            let id = task_id.to_string();
            request = request.with_progress(Arc::new(move |percent| listener(&id, percent)));
        }

        self.engine.upload(request).await
    }

    /// 批量上传，结果与输入顺序一致
    pub async fn upload_batch(
        &self,
        files: Vec<VideoFile>,
    ) -> Vec<(String, Result<UploadOutcome, UploadError>)> {
        let ids: Vec<String> = files.into_iter().map(|f| self.create_task(f)).collect();

        info!(
            "批量上传 {} 个文件，同时上传数: {}",
            ids.len(),
            self.max_concurrent_files
        );

        let results = futures::future::join_all(ids.iter().map(|id| self.run_task(id))).await;
        ids.into_iter().zip(results).collect()
    }

    /// 取消上传任务
    pub fn cancel_task(&self, task_id: &str) -> Result<(), UploadError> {
        let info = self
            .tasks
            .get(task_id)
            .ok_or_else(|| UploadError::InvalidInput(format!("任务不存在: {}", task_id)))?;

        info.cancel_token.cancel();

        // 还没开始的任务直接标记，进行中的任务由引擎落定状态
        let mut task = info.task.lock();
        if task.status == UploadTaskStatus::Pending {
            task.mark_cancelled();
        }

        info!("取消上传任务: {}", task_id);
        Ok(())
    }

    /// 取消所有任务
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.tasks.iter() {
            let mut task = entry.task.lock();
            if task.status.is_finished() {
                continue;
            }
            entry.cancel_token.cancel();
            if task.status == UploadTaskStatus::Pending {
                task.mark_cancelled();
            }
            count += 1;
        }
        if count > 0 {
            warn!("已取消 {} 个上传任务", count);
        }
        count
    }

    /// 获取任务状态
    pub fn get_task(&self, task_id: &str) -> Option<UploadTask> {
        self.tasks.get(task_id).map(|entry| entry.task.lock().clone())
    }

    /// 获取所有任务（按创建时间排序）
    pub fn get_all_tasks(&self) -> Vec<UploadTask> {
        let mut tasks: Vec<UploadTask> = self
            .tasks
            .iter()
            .map(|entry| entry.task.lock().clone())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// 进行中的任务数
    pub fn active_task_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|entry| {
                matches!(
                    entry.task.lock().status,
                    UploadTaskStatus::Uploading | UploadTaskStatus::Completing
                )
            })
            .count()
    }

    /// 清除已结束（完成、失败、取消）的任务
    pub fn clear_finished(&self) -> usize {
        let to_remove: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| entry.task.lock().status.is_finished())
            .map(|entry| entry.key().clone())
            .collect();

        for task_id in &to_remove {
            self.tasks.remove(task_id);
        }

        if !to_remove.is_empty() {
            info!("清除 {} 个已结束的上传任务", to_remove.len());
        }
        to_remove.len()
    }
}
