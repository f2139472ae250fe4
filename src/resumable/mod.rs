//! 断点续传客户端

pub mod client;
pub mod error;
pub mod segment;
pub mod source;
pub mod state;

pub use client::{ResumableDownloader, TransferOutcome, TransferRequest};
pub use error::TransferClientError;
pub use segment::{Segment, SegmentPlan, DEFAULT_SEGMENT_SIZE};
pub use source::{HttpRangeSource, RangeSource, SourceInfo};
pub use state::{FileStateStore, TransferState, TransferStateStore};
