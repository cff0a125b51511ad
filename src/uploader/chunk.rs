// 上传分片规划
//
// 存储代理（Cloudflare Worker 一类）单个请求体有上限，规则如下：
// - 文件 < 95MB：单次上传，直接 POST /upload
// - 文件 >= 95MB：分片上传，每片固定 95MB，最后一片为余数
// - 分片编号从 1 开始，连续无空洞

use crate::uploader::UploadError;
use std::ops::Range;
use tracing::debug;

/// 单次上传上限: 95MB（留出代理请求体上限的余量）
pub const SINGLE_SHOT_LIMIT: u64 = 95 * 1024 * 1024;

/// 默认分片大小: 95MB
pub const DEFAULT_PART_SIZE: u64 = 95 * 1024 * 1024;

/// 最小分片大小: 5MB（S3/R2 兼容存储对非末尾分片的下限）
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// 上传策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStrategy {
    /// 单次上传
    Single,
    /// 分片上传
    Multipart,
}

impl UploadStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStrategy::Single => "single",
            UploadStrategy::Multipart => "multipart",
        }
    }
}

/// 分片描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartDescriptor {
    /// 分片编号（从 1 开始）
    pub part_number: u32,
    /// 起始字节（包含）
    pub byte_start: u64,
    /// 结束字节（不包含）
    pub byte_end: u64,
}

impl PartDescriptor {
    /// 分片大小
    pub fn len(&self) -> u64 {
        self.byte_end - self.byte_start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 字节范围
    pub fn range(&self) -> Range<u64> {
        self.byte_start..self.byte_end
    }

    /// 在进度槽位数组中的下标
    pub fn slot(&self) -> usize {
        (self.part_number - 1) as usize
    }
}

/// 分片规划结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub strategy: UploadStrategy,
    /// 单次上传时为空
    pub parts: Vec<PartDescriptor>,
}

impl TransferPlan {
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }
}

/// 分片规划器（纯函数，无 I/O）
#[derive(Debug, Clone, Copy)]
pub struct TransferPlanner {
    single_shot_limit: u64,
    part_size: u64,
}

impl Default for TransferPlanner {
    fn default() -> Self {
        Self::new(SINGLE_SHOT_LIMIT, DEFAULT_PART_SIZE)
    }
}

impl TransferPlanner {
    /// # 参数
    /// * `single_shot_limit` - 小于该值的文件走单次上传
    /// * `part_size` - 分片大小
    pub fn new(single_shot_limit: u64, part_size: u64) -> Self {
        Self {
            single_shot_limit,
            part_size,
        }
    }

    pub fn single_shot_limit(&self) -> u64 {
        self.single_shot_limit
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// 根据文件大小选择上传策略并计算分片
    pub fn plan(&self, file_size: u64) -> Result<TransferPlan, UploadError> {
        if file_size == 0 {
            return Err(UploadError::InvalidInput("文件大小为 0".to_string()));
        }
        if self.part_size == 0 {
            return Err(UploadError::InvalidInput("分片大小为 0".to_string()));
        }

        if file_size < self.single_shot_limit {
            debug!(
                "规划为单次上传: size={} bytes, 上限={} bytes",
                file_size, self.single_shot_limit
            );
            return Ok(TransferPlan {
                strategy: UploadStrategy::Single,
                parts: Vec::new(),
            });
        }

        let parts = Self::calculate_parts(file_size, self.part_size);
        debug!(
            "规划为分片上传: size={} bytes, 分片大小={} bytes, 分片数量={}",
            file_size,
            self.part_size,
            parts.len()
        );

        Ok(TransferPlan {
            strategy: UploadStrategy::Multipart,
            parts,
        })
    }

    /// 计算分片
    fn calculate_parts(total_size: u64, part_size: u64) -> Vec<PartDescriptor> {
        let mut parts = Vec::with_capacity(total_size.div_ceil(part_size) as usize);
        let mut offset = 0u64;
        let mut part_number = 1u32;

        while offset < total_size {
            let end = std::cmp::min(offset + part_size, total_size);
            parts.push(PartDescriptor {
                part_number,
                byte_start: offset,
                byte_end: end,
            });
            offset = end;
            part_number += 1;
        }

        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_small_file_single_shot() {
        let plan = TransferPlanner::default().plan(10 * MIB).unwrap();
        assert_eq!(plan.strategy, UploadStrategy::Single);
        assert!(plan.parts.is_empty());
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let planner = TransferPlanner::default();

        let plan = planner.plan(SINGLE_SHOT_LIMIT - 1).unwrap();
        assert_eq!(plan.strategy, UploadStrategy::Single);

        // 恰好等于上限时走分片上传（单片）
        let plan = planner.plan(SINGLE_SHOT_LIMIT).unwrap();
        assert_eq!(plan.strategy, UploadStrategy::Multipart);
        assert_eq!(plan.part_count(), 1);
        assert_eq!(plan.parts[0].len(), SINGLE_SHOT_LIMIT);
    }

    #[test]
    fn test_250mib_three_parts() {
        let plan = TransferPlanner::default().plan(250 * MIB).unwrap();
        assert_eq!(plan.strategy, UploadStrategy::Multipart);
        assert_eq!(plan.part_count(), 3);

        let sizes: Vec<u64> = plan.parts.iter().map(|p| p.len() / MIB).collect();
        assert_eq!(sizes, vec![95, 95, 60]);

        let numbers: Vec<u32> = plan.parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(plan.parts[2].range(), (190 * MIB)..(250 * MIB));
        assert_eq!(plan.parts[2].slot(), 2);
    }

    #[test]
    fn test_zero_size_rejected() {
        let err = TransferPlanner::default().plan(0).unwrap_err();
        assert!(matches!(err, UploadError::InvalidInput(_)));

        let err = TransferPlanner::new(10, 0).plan(100).unwrap_err();
        assert!(matches!(err, UploadError::InvalidInput(_)));
    }

    proptest! {
        #[test]
        fn prop_parts_cover_file_exactly(
            file_size in 1u64..50_000_000,
            part_size in 4096u64..5_000_000,
        ) {
            // 上限设为 1，强制走分片
            let plan = TransferPlanner::new(1, part_size).plan(file_size).unwrap();

            prop_assert_eq!(plan.strategy, UploadStrategy::Multipart);
            prop_assert_eq!(plan.part_count() as u64, file_size.div_ceil(part_size));

            let mut expected_start = 0u64;
            for (i, part) in plan.parts.iter().enumerate() {
                prop_assert_eq!(part.part_number as usize, i + 1);
                prop_assert_eq!(part.byte_start, expected_start);
                prop_assert!(!part.is_empty());
                prop_assert!(part.len() <= part_size);
                if i + 1 < plan.part_count() {
                    prop_assert_eq!(part.len(), part_size);
                }
                expected_start = part.byte_end;
            }
            prop_assert_eq!(expected_start, file_size);
        }
    }
}
