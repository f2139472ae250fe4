//! 分段规划
//!
//! 把 `total_bytes` 切成固定大小的分段，最后一段可能不满

use std::ops::Range;

use tracing::debug;

/// 默认分段大小: 5MB
pub const DEFAULT_SEGMENT_SIZE: u64 = 5 * 1024 * 1024;

/// 单个分段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// 分段索引
    pub index: usize,
    /// 字节范围（左闭右开）
    pub range: Range<u64>,
}

impl Segment {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self { index, range }
    }

    /// 分段大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// HTTP Range 头的值
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.range.start, self.range.end - 1)
    }
}

/// 分段规划
#[derive(Debug, Clone)]
pub struct SegmentPlan {
    segments: Vec<Segment>,
    total_bytes: u64,
    segment_size: u64,
}

impl SegmentPlan {
    pub fn new(total_bytes: u64, segment_size: u64) -> Self {
        let segment_size = segment_size.max(1);
        let segments = Self::calculate_segments(total_bytes, segment_size);
        debug!(
            "分段规划: 总大小={} bytes, 分段大小={} bytes, 分段数={}",
            total_bytes,
            segment_size,
            segments.len()
        );
        Self {
            segments,
            total_bytes,
            segment_size,
        }
    }

    /// ceil(total / size)
    pub fn segment_count_for(total_bytes: u64, segment_size: u64) -> usize {
        let segment_size = segment_size.max(1);
        (total_bytes / segment_size + u64::from(total_bytes % segment_size != 0)) as usize
    }

    fn calculate_segments(total_bytes: u64, segment_size: u64) -> Vec<Segment> {
        let mut segments = Vec::with_capacity(Self::segment_count_for(total_bytes, segment_size));
        let mut offset = 0u64;
        let mut index = 0;

        while offset < total_bytes {
            let end = std::cmp::min(offset + segment_size, total_bytes);
            segments.push(Segment::new(index, offset..end));
            offset = end;
            index += 1;
        }

        segments
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_division() {
        let plan = SegmentPlan::new(10_000_000, 1_000_000);
        assert_eq!(plan.len(), 10);
        assert_eq!(plan.segments()[0].range, 0..1_000_000);
        assert_eq!(plan.segments()[9].range, 9_000_000..10_000_000);
    }

    #[test]
    fn test_partial_last_segment() {
        let plan = SegmentPlan::new(105, 10);
        assert_eq!(plan.len(), 11);
        assert_eq!(plan.segments()[10].range, 100..105);
        assert_eq!(plan.segments()[10].size(), 5);
        assert_eq!(plan.segments()[10].range_header(), "bytes=100-104");
    }

    #[test]
    fn test_segment_count() {
        assert_eq!(SegmentPlan::segment_count_for(0, 10), 0);
        assert_eq!(SegmentPlan::segment_count_for(1, 10), 1);
        assert_eq!(SegmentPlan::segment_count_for(10, 10), 1);
        assert_eq!(SegmentPlan::segment_count_for(11, 10), 2);
        assert!(SegmentPlan::new(0, 10).is_empty());
    }
}
