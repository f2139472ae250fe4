//! HTTP 对象存储
//!
//! 对象键映射为 `{base_url}/{key}`，键的每个路径分量单独做 URL 编码

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::{ByteStream, ObjectMeta, ObjectStore, ObjectStoreError};

/// 默认 HEAD 超时
const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP 后端对象存储
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: Client,
    base_url: String,
    head_timeout: Duration,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            head_timeout: DEFAULT_HEAD_TIMEOUT,
        }
    }

    pub fn with_head_timeout(mut self, timeout: Duration) -> Self {
        self.head_timeout = timeout;
        self
    }

    fn object_url(&self, key: &str) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .filter(|part| !part.is_empty())
            .map(|part| urlencoding::encode(part).into_owned())
            .collect();
        format!("{}/{}", self.base_url, encoded.join("/"))
    }
}

fn map_request_error(timeout: Duration, e: reqwest::Error) -> ObjectStoreError {
    if e.is_timeout() {
        ObjectStoreError::Timeout(timeout)
    } else {
        ObjectStoreError::Transient(e.to_string())
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn head_metadata(&self, key: &str) -> Result<ObjectMeta, ObjectStoreError> {
        let url = self.object_url(key);
        let timeout = self.head_timeout;
        let resp = tokio::time::timeout(timeout, self.client.head(&url).send())
            .await
            .map_err(|_| ObjectStoreError::Timeout(timeout))?
            .map_err(|e| map_request_error(timeout, e))?;

        match resp.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(ObjectMeta::missing()),
            status if status.is_success() => Ok(ObjectMeta {
                exists: true,
                // HEAD 响应没有正文，content_length() 总是 0，直接读响应头
                size: resp
                    .headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            }),
            status => Err(ObjectStoreError::Transient(format!(
                "HEAD {} 返回 {}",
                url, status
            ))),
        }
    }

    async fn open_read_stream(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<ByteStream, ObjectStoreError> {
        let url = self.object_url(key);
        debug!("打开远端对象: {}", url);

        // 超时只约束到响应头返回为止，正文按流读取
        let resp = tokio::time::timeout(timeout, self.client.get(&url).send())
            .await
            .map_err(|_| ObjectStoreError::Timeout(timeout))?
            .map_err(|e| map_request_error(timeout, e))?;

        match resp.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                return Err(ObjectStoreError::NotFound(key.to_string()))
            }
            status if !status.is_success() => {
                return Err(ObjectStoreError::Transient(format!(
                    "GET {} 返回 {}",
                    url, status
                )))
            }
            _ => {}
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ObjectStoreError::Transient(e.to_string())))
            .boxed();
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_object_url_encodes_segments() {
        let store = HttpObjectStore::new("http://store.local/objects/");
        assert_eq!(
            store.object_url("a b/c#d.txt"),
            "http://store.local/objects/a%20b/c%23d.txt"
        );
    }

    #[tokio::test]
    async fn test_head_and_stream() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/k/one"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-length", "3"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/k/one"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
            .mount(&server)
            .await;

        let store = HttpObjectStore::new(server.uri());
        let meta = store.head_metadata("k/one").await.unwrap();
        assert!(meta.exists);

        let mut stream = store
            .open_read_stream("k/one", Duration::from_secs(5))
            .await
            .unwrap();
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(data, b"abc");
    }

    #[tokio::test]
    async fn test_missing_object() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = HttpObjectStore::new(server.uri());
        assert!(!store.head_metadata("gone").await.unwrap().exists);
        let err = store
            .open_read_stream("gone", Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ObjectStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_slow_open_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"late".to_vec())
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let store = HttpObjectStore::new(server.uri());
        let err = store
            .open_read_stream("slow", Duration::from_millis(50))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ObjectStoreError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_gone_object_is_missing() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let store = HttpObjectStore::new(server.uri());
        assert_eq!(
            store.head_metadata("purged").await.unwrap(),
            ObjectMeta::missing()
        );
        let err = store
            .open_read_stream("purged", Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ObjectStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = HttpObjectStore::new(server.uri());
        let err = store.head_metadata("busy").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::Transient(_)));
        let err = store
            .open_read_stream("busy", Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ObjectStoreError::Transient(_)));
    }

    #[tokio::test]
    async fn test_slow_head_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let store =
            HttpObjectStore::new(server.uri()).with_head_timeout(Duration::from_millis(50));
        let err = store.head_metadata("slow").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::Timeout(d) if d == Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_client_timeout_maps_to_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        // reqwest 自身的超时同样映射为 Timeout
        let client = Client::builder()
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let store = HttpObjectStore::with_client(client, server.uri());
        let err = store
            .open_read_stream("slow", Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ObjectStoreError::Timeout(_)));
    }
}
