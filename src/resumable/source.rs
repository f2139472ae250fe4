//! 分段数据源
//!
//! `RangeSource` 抽象出客户端需要的三种请求：探测、按范围读取、整体读取

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::error::TransferClientError;
use super::segment::Segment;

/// 探测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
    /// 是否支持按范围读取
    pub accepts_ranges: bool,
    /// 总大小（未知为 None）
    pub total_bytes: Option<u64>,
}

pub type BodyStream = BoxStream<'static, Result<Bytes, TransferClientError>>;

/// 分段数据源
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// 数据源地址（记录在传输状态中）
    fn url(&self) -> &str;

    async fn inspect(&self) -> Result<SourceInfo, TransferClientError>;

    /// 读取一个分段，返回的长度必须与分段大小一致
    async fn fetch_range(&self, segment: &Segment) -> Result<Bytes, TransferClientError>;

    /// 整体读取
    async fn fetch_full(&self) -> Result<BodyStream, TransferClientError>;
}

/// HTTP 数据源
#[derive(Debug, Clone)]
pub struct HttpRangeSource {
    client: Client,
    url: String,
    headers: HeaderMap,
}

impl HttpRangeSource {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    /// 每个请求都附带的请求头（如调用方身份）
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

fn header_u64(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// 解析 `Content-Range: bytes 0-0/12345` 中的总大小
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('/').next())
        .and_then(|total| total.trim().parse().ok())
}

#[async_trait]
impl RangeSource for HttpRangeSource {
    fn url(&self) -> &str {
        &self.url
    }

    async fn inspect(&self) -> Result<SourceInfo, TransferClientError> {
        let resp = self
            .client
            .head(&self.url)
            .headers(self.headers.clone())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(TransferClientError::Status(resp.status().as_u16()));
        }

        let accepts_ranges = resp
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("bytes"))
            .unwrap_or(false);
        let head_length = header_u64(resp.headers(), CONTENT_LENGTH);

        if accepts_ranges && head_length.unwrap_or(0) > 0 {
            return Ok(SourceInfo {
                accepts_ranges,
                total_bytes: head_length,
            });
        }

        // HEAD 信息不全时，用单字节 Range 请求确认
        let resp = self
            .client
            .get(&self.url)
            .headers(self.headers.clone())
            .header(RANGE, "bytes=0-0")
            .send()
            .await?;
        let info = match resp.status() {
            StatusCode::PARTIAL_CONTENT => SourceInfo {
                accepts_ranges: true,
                total_bytes: content_range_total(resp.headers()).or(head_length),
            },
            status if status.is_success() => SourceInfo {
                accepts_ranges: false,
                total_bytes: head_length.or_else(|| header_u64(resp.headers(), CONTENT_LENGTH)),
            },
            status => return Err(TransferClientError::Status(status.as_u16())),
        };

        debug!("探测结果: {} -> {:?}", self.url, info);
        Ok(info)
    }

    async fn fetch_range(&self, segment: &Segment) -> Result<Bytes, TransferClientError> {
        let (start, end) = (segment.range.start, segment.range.end.saturating_sub(1));
        let resp = self
            .client
            .get(&self.url)
            .headers(self.headers.clone())
            .header(RANGE, segment.range_header())
            .send()
            .await?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK => return Err(TransferClientError::RangeIgnored { start, end }),
            status => return Err(TransferClientError::Status(status.as_u16())),
        }

        let body = resp.bytes().await?;
        let expected = segment.size();
        if body.len() as u64 != expected {
            return Err(TransferClientError::LengthMismatch {
                expected,
                actual: body.len() as u64,
            });
        }
        Ok(body)
    }

    async fn fetch_full(&self) -> Result<BodyStream, TransferClientError> {
        let resp = self
            .client
            .get(&self.url)
            .headers(self.headers.clone())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(TransferClientError::Status(resp.status().as_u16()));
        }

        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransferClientError::from))
            .boxed())
    }
}
