//! 本地目录对象存储

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{ByteStream, ObjectMeta, ObjectStore, ObjectStoreError};

/// 以本地目录为后端的对象存储
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// 把对象键映射为根目录下的路径
    ///
    /// 只接受普通路径分量，`..`、绝对路径一律视为不存在
    fn resolve(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        let relative = Path::new(key);
        let mut path = self.root.clone();
        let mut has_component = false;

        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    path.push(part);
                    has_component = true;
                }
                Component::CurDir => {}
                _ => return Err(ObjectStoreError::NotFound(key.to_string())),
            }
        }

        if !has_component {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }
        Ok(path)
    }
}

fn map_io_error(key: &str, e: std::io::Error) -> ObjectStoreError {
    match e.kind() {
        ErrorKind::NotFound => ObjectStoreError::NotFound(key.to_string()),
        _ => ObjectStoreError::Transient(format!("{}: {}", key, e)),
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn head_metadata(&self, key: &str) -> Result<ObjectMeta, ObjectStoreError> {
        let path = match self.resolve(key) {
            Ok(path) => path,
            Err(_) => return Ok(ObjectMeta::missing()),
        };

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(ObjectMeta {
                exists: true,
                size: meta.len(),
            }),
            Ok(_) => Ok(ObjectMeta::missing()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(ObjectMeta::missing()),
            Err(e) => Err(map_io_error(key, e)),
        }
    }

    async fn open_read_stream(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<ByteStream, ObjectStoreError> {
        let path = self.resolve(key)?;
        debug!("打开本地对象: {:?}", path);

        let file = tokio::time::timeout(timeout, tokio::fs::File::open(&path))
            .await
            .map_err(|_| ObjectStoreError::Timeout(timeout))?
            .map_err(|e| map_io_error(key, e))?;

        let owned_key = key.to_string();
        let stream = ReaderStream::new(file)
            .map(move |chunk| chunk.map_err(|e| map_io_error(&owned_key, e)))
            .boxed();
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_head_and_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/b.bin"), b"hello world").unwrap();

        let store = LocalObjectStore::new(dir.path());
        let meta = store.head_metadata("a/b.bin").await.unwrap();
        assert!(meta.exists);
        assert_eq!(meta.size, 11);

        let mut stream = store
            .open_read_stream("a/b.bin", Duration::from_secs(5))
            .await
            .unwrap();
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn test_missing_and_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        assert!(!store.head_metadata("nope").await.unwrap().exists);
        assert!(!store.head_metadata("../etc/passwd").await.unwrap().exists);

        let err = store
            .open_read_stream("../etc/passwd", Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ObjectStoreError::NotFound(_)));

        let err = store
            .open_read_stream("nope", Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ObjectStoreError::NotFound(_)));
    }
}
