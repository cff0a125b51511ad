// 分片批次调度器
//
// 调度规则：
// - 按 concurrency 大小把任务切成顺序批次
// - 同一批次内的任务全部并发执行（tokio::spawn）
// - 批次内任一任务失败，整批失败（取第一个失败）
// - 第 N+1 批只在第 N 批全部结束后开始
// - 批次失败时不主动中止同批仍在进行的请求：JoinHandle 被丢弃后任务在后台跑完，结果丢弃
// - 输出顺序与输入顺序一致，与完成顺序无关

use crate::uploader::UploadError;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// 默认批次并发数（对齐浏览器同源连接数上限）
pub const DEFAULT_CONCURRENCY: usize = 6;

/// 批次调度器
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    concurrency: usize,
    cancel_token: Option<CancellationToken>,
}

impl Default for BatchScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl BatchScheduler {
    /// 创建调度器（并发数至少为 1）
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            cancel_token: None,
        }
    }

    /// 每个批次开始前检查取消
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// 按批次执行所有任务
    ///
    /// # 参数
    /// * `items` - 待处理任务
    /// * `worker` - 处理函数，参数为 (原始下标, 任务)
    ///
    /// # 返回
    /// 与 items 顺序一致的结果列表
    pub async fn run<T, R, F, Fut>(&self, items: Vec<T>, worker: F) -> Result<Vec<R>, UploadError>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(usize, T) -> Fut,
        Fut: Future<Output = Result<R, UploadError>> + Send + 'static,
    {
        let total = items.len();
        let mut results: Vec<Option<R>> = std::iter::repeat_with(|| None).take(total).collect();
        let mut pending = items.into_iter().enumerate().peekable();
        let mut batch_no = 0usize;

        while pending.peek().is_some() {
            if let Some(token) = &self.cancel_token {
                if token.is_cancelled() {
                    return Err(UploadError::Aborted);
                }
            }

            batch_no += 1;
            let mut in_flight = FuturesUnordered::new();
            for (index, item) in pending.by_ref().take(self.concurrency) {
                let handle = tokio::spawn(worker(index, item));
                in_flight.push(async move { (index, handle.await) });
            }

            debug!(
                "[批次#{}] 开始执行 {} 个任务 (总数 {})",
                batch_no,
                in_flight.len(),
                total
            );

            while let Some((index, joined)) = in_flight.next().await {
                match joined {
                    Ok(Ok(value)) => results[index] = Some(value),
                    Ok(Err(e)) => {
                        debug!("[批次#{}] 任务 #{} 失败，整批失败: {}", batch_no, index, e);
                        return Err(e);
                    }
                    Err(e) => {
                        error!("[批次#{}] 任务 #{} 异常: {}", batch_no, index, e);
                        return Err(UploadError::Internal(format!("批次任务异常: {}", e)));
                    }
                }
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                value.ok_or_else(|| UploadError::Internal(format!("任务 #{} 缺少结果", index)))
            })
            .collect()
    }
}
