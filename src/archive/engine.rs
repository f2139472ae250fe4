//! 并发拉取打包引擎
//!
//! 按批次并发拉取对象（每批 `concurrency` 个，信号量限制同时打开的读取流），
//! 每个对象先落盘到匿名临时文件，整批结束后按解析顺序追加进归档。
//!
//! 单个文件失败不会中断归档：写入 `_errors/` 下的占位条目并记入错误账本。
//! 所有批次处理完后 `finish` 恰好调用一次，即使全部文件都失败。

use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::{FetchError, PackError, SinkError};
use super::job::{ErrorLedgerEntry, JobProgress};
use super::naming::EntryNamer;
use super::resolver::ResolvedFile;
use super::sink::ArchiveSink;
use crate::config::{ArchiveConfig, Compression};
use crate::metadata::FileRecord;
use crate::storage::ObjectStore;

/// 打包参数
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// 每批并发数，同时也是读取流上限
    pub concurrency: usize,
    /// 单个文件最多尝试次数
    pub max_attempts: u32,
    /// 重试基础延迟，每次翻倍
    pub retry_base_delay: Duration,
    /// 单次拉取超时（打开流、每次读取）
    pub fetch_timeout: Duration,
    pub max_name_length: usize,
    /// 是否按目录路径放置条目
    pub preserve_structure: bool,
    /// 落盘临时文件目录
    pub spool_dir: Option<PathBuf>,
    /// 归档条目压缩方式
    pub compression: Compression,
}

impl PackOptions {
    pub fn from_config(config: &ArchiveConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            max_attempts: config.max_retries.max(1),
            retry_base_delay: config.retry_base_delay(),
            fetch_timeout: config.fetch_timeout(),
            max_name_length: config.max_name_length,
            preserve_structure: config.preserve_structure,
            spool_dir: config.spool_dir.clone(),
            compression: config.compression,
        }
    }
}

impl Default for PackOptions {
    fn default() -> Self {
        Self::from_config(&ArchiveConfig::default())
    }
}

/// 打包过程中的事件
#[derive(Debug, Clone)]
pub enum PackEvent {
    /// 文件最终失败（先于对应的进度事件）
    FileFailed(ErrorLedgerEntry),
    /// 每处理完一个文件发出一次
    Progress(JobProgress),
}

/// 打包结果
#[derive(Debug, Clone)]
pub struct PackReport {
    pub total_files: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub error_ledger: Vec<ErrorLedgerEntry>,
    /// 归档总字节数
    pub archive_bytes: u64,
}

/// 单个文件的拉取结果
enum FetchOutcome {
    Fetched { spool: std::fs::File, bytes: u64 },
    Failed { error: FetchError, attempt: u32 },
}

/// 拉取打包引擎
#[derive(Clone)]
pub struct PackEngine {
    store: Arc<dyn ObjectStore>,
    options: PackOptions,
}

impl PackEngine {
    pub fn new(store: Arc<dyn ObjectStore>, options: PackOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &PackOptions {
        &self.options
    }

    /// 单个请求覆盖目录结构选项
    pub fn with_preserve_structure(&self, preserve_structure: bool) -> Self {
        let mut engine = self.clone();
        engine.options.preserve_structure = preserve_structure;
        engine
    }

    /// 把文件列表打包写入 sink
    ///
    /// 成功时返回报告和已完成的 sink；sink 写入失败是致命错误，直接返回
    pub async fn pack<S, F>(
        &self,
        files: &[ResolvedFile],
        sink: S,
        mut on_event: F,
    ) -> Result<(PackReport, S), PackError>
    where
        S: ArchiveSink + 'static,
        F: FnMut(PackEvent) + Send,
    {
        if files.is_empty() {
            return Err(PackError::SelectionEmpty);
        }

        let total = files.len();
        let concurrency = self.options.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut namer = EntryNamer::new(self.options.max_name_length);
        let mut sink = sink;
        let mut ledger = Vec::new();
        let mut succeeded = 0usize;
        let mut processed = 0usize;

        info!(
            "开始打包: 文件数={}, 并发={}, 最多尝试={}次",
            total, concurrency, self.options.max_attempts
        );

        for (batch_index, batch) in files.chunks(concurrency).enumerate() {
            debug!("批次 #{}: {} 个文件", batch_index, batch.len());

            // 立即 spawn 整批拉取任务，任务内部等待 permit
            let mut handles = FetchBatch(
                batch
                    .iter()
                    .map(|file| {
                        let store = Arc::clone(&self.store);
                        let options = self.options.clone();
                        let semaphore = Arc::clone(&semaphore);
                        let record = file.record.clone();
                        tokio::spawn(async move {
                            fetch_with_retry(store, &record, &options, semaphore).await
                        })
                    })
                    .collect(),
            );

            // 按解析顺序追加，与完成顺序无关
            for (file, handle) in batch.iter().zip(handles.0.iter_mut()) {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("拉取任务异常: {}, 文件: {}", e, file.record.id);
                        FetchOutcome::Failed {
                            error: FetchError::Transient(format!("拉取任务异常: {}", e)),
                            attempt: 1,
                        }
                    }
                };

                match outcome {
                    FetchOutcome::Fetched { spool, bytes } => {
                        let folder = if self.options.preserve_structure {
                            file.folder_path.as_str()
                        } else {
                            ""
                        };
                        let name = namer.assign(folder, &file.record.name);
                        let (next, written) =
                            append_blocking(sink, name.clone(), Box::new(spool)).await?;
                        sink = next;
                        succeeded += 1;
                        debug!("已写入条目: {} ({} bytes, 拉取 {} bytes)", name, written, bytes);
                    }
                    FetchOutcome::Failed { error, attempt } => {
                        let name = namer.assign_placeholder(&file.record.name);
                        let text = placeholder_text(&file.record, &error, attempt);
                        let (next, _) =
                            append_blocking(sink, name.clone(), Box::new(Cursor::new(text)))
                                .await?;
                        sink = next;

                        warn!(
                            "文件最终失败，已写入占位条目 {}: id={}, 原因: {}",
                            name, file.record.id, error
                        );
                        let entry = ErrorLedgerEntry {
                            file_id: file.record.id.clone(),
                            file_name: file.record.name.clone(),
                            reason: error.to_string(),
                            attempt,
                        };
                        ledger.push(entry.clone());
                        on_event(PackEvent::FileFailed(entry));
                    }
                }

                processed += 1;
                let mut progress = JobProgress::new(processed, total, ledger.len());
                progress.current_file = Some(file.record.name.clone());
                on_event(PackEvent::Progress(progress));
            }
        }

        let (sink, archive_bytes) = finish_blocking(sink).await?;

        info!(
            "打包完成: 成功 {} 个, 失败 {} 个, 归档大小 {} bytes",
            succeeded,
            ledger.len(),
            archive_bytes
        );

        let report = PackReport {
            total_files: total,
            succeeded,
            failed: ledger.len(),
            error_ledger: ledger,
            archive_bytes,
        };
        Ok((report, sink))
    }
}

// ============================================================================
// 拉取
// ============================================================================

/// 一批拉取任务；提前返回（sink 写入失败）时中止未完成的任务，释放读取流和临时文件
struct FetchBatch(Vec<JoinHandle<FetchOutcome>>);

impl Drop for FetchBatch {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// 第 n 次失败后的等待时间：base * 2^(n-1)
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor)
}

async fn fetch_with_retry(
    store: Arc<dyn ObjectStore>,
    record: &FileRecord,
    options: &PackOptions,
    semaphore: Arc<Semaphore>,
) -> FetchOutcome {
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        // 每次尝试单独持有 permit，退避等待期间不占用
        let result = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(_permit) => fetch_once(store.as_ref(), record, options).await,
            Err(_) => Err(FetchError::Transient("拉取信号量已关闭".to_string())),
        };

        match result {
            Ok((spool, bytes)) => return FetchOutcome::Fetched { spool, bytes },
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = backoff_delay(options.retry_base_delay, attempt);
                warn!(
                    "拉取失败，{:?} 后重试 ({}/{}): id={}, 错误: {}",
                    delay, attempt, max_attempts, record.id, e
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return FetchOutcome::Failed { error, attempt },
        }
    }
}

/// 单次拉取：查询元信息 → 打开流 → 写入临时文件
async fn fetch_once(
    store: &dyn ObjectStore,
    record: &FileRecord,
    options: &PackOptions,
) -> Result<(std::fs::File, u64), FetchError> {
    let timeout = options.fetch_timeout;
    let key = record.storage_key.as_str();

    let meta = tokio::time::timeout(timeout, store.head_metadata(key))
        .await
        .map_err(|_| FetchError::Timeout(timeout))??;
    if !meta.exists {
        return Err(FetchError::Missing(key.to_string()));
    }

    let mut stream = tokio::time::timeout(timeout, store.open_read_stream(key, timeout))
        .await
        .map_err(|_| FetchError::Timeout(timeout))??;

    let spool = match &options.spool_dir {
        Some(dir) => tempfile::tempfile_in(dir),
        None => tempfile::tempfile(),
    }
    .map_err(|e| FetchError::Transient(format!("创建临时文件失败: {}", e)))?;
    let mut spool = tokio::fs::File::from_std(spool);

    let mut bytes = 0u64;
    loop {
        let next = tokio::time::timeout(timeout, stream.next())
            .await
            .map_err(|_| FetchError::Timeout(timeout))?;
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk?;
        spool
            .write_all(&chunk)
            .await
            .map_err(|e| FetchError::Transient(format!("写入临时文件失败: {}", e)))?;
        bytes += chunk.len() as u64;
    }
    drop(stream);

    spool
        .flush()
        .await
        .map_err(|e| FetchError::Transient(format!("写入临时文件失败: {}", e)))?;
    let mut spool = spool.into_std().await;
    spool
        .seek(SeekFrom::Start(0))
        .map_err(|e| FetchError::Transient(format!("临时文件定位失败: {}", e)))?;

    if bytes != record.size {
        debug!(
            "对象实际大小与记录不符: id={}, 记录={}, 实际={}",
            record.id, record.size, bytes
        );
    }

    Ok((spool, bytes))
}

// ============================================================================
// 归档写入（阻塞线程池）
// ============================================================================

async fn append_blocking<S: ArchiveSink + 'static>(
    sink: S,
    name: String,
    mut reader: Box<dyn Read + Send>,
) -> Result<(S, u64), SinkError> {
    let (sink, result) = tokio::task::spawn_blocking(move || {
        let mut sink = sink;
        let result = sink.append_from(&name, &mut reader);
        (sink, result)
    })
    .await
    .map_err(|e| SinkError::Worker(e.to_string()))?;

    Ok((sink, result?))
}

async fn finish_blocking<S: ArchiveSink + 'static>(sink: S) -> Result<(S, u64), SinkError> {
    let (sink, result) = tokio::task::spawn_blocking(move || {
        let mut sink = sink;
        let result = sink.finish();
        (sink, result)
    })
    .await
    .map_err(|e| SinkError::Worker(e.to_string()))?;

    Ok((sink, result?))
}

/// 占位条目内容，只依赖文件信息和错误，不含时间等易变信息
fn placeholder_text(record: &FileRecord, error: &FetchError, attempt: u32) -> Vec<u8> {
    format!(
        "This file could not be included in the archive.\n\
         \n\
         name: {}\n\
         id: {}\n\
         storage key: {}\n\
         error: {}\n\
         attempts: {}\n",
        record.name, record.id, record.storage_key, error, attempt
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::sink::ZipArchiveSink;
    use crate::storage::{ByteStream, ObjectMeta, ObjectStoreError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::Stream;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};

    // ------------------------------------------------------------------
    // 带计数的对象存储桩
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct StubStore {
        objects: HashMap<String, Vec<u8>>,
        /// 每个键的读取延迟
        delays: HashMap<String, Duration>,
        /// 每个键剩余的临时失败次数
        transient_failures: Mutex<HashMap<String, u32>>,
        /// 打开流之前的延迟（用于触发超时）
        open_delay: Option<Duration>,
        open_now: Arc<AtomicUsize>,
        open_max: Arc<AtomicUsize>,
        open_calls: Mutex<HashMap<String, usize>>,
    }

    impl StubStore {
        fn with(mut self, key: &str, data: &[u8]) -> Self {
            self.objects.insert(key.to_string(), data.to_vec());
            self
        }

        fn delay(mut self, key: &str, delay: Duration) -> Self {
            self.delays.insert(key.to_string(), delay);
            self
        }

        fn fail_times(self, key: &str, times: u32) -> Self {
            self.transient_failures.lock().insert(key.to_string(), times);
            self
        }

        fn opens(&self, key: &str) -> usize {
            self.open_calls.lock().get(key).copied().unwrap_or(0)
        }
    }

    struct OpenGuard(Arc<AtomicUsize>);

    impl Drop for OpenGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct TrackedStream {
        inner: ByteStream,
        _guard: OpenGuard,
    }

    impl Stream for TrackedStream {
        type Item = Result<Bytes, ObjectStoreError>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.inner.poll_next_unpin(cx)
        }
    }

    #[async_trait]
    impl ObjectStore for StubStore {
        async fn head_metadata(&self, key: &str) -> Result<ObjectMeta, ObjectStoreError> {
            Ok(match self.objects.get(key) {
                Some(data) => ObjectMeta {
                    exists: true,
                    size: data.len() as u64,
                },
                None => ObjectMeta::missing(),
            })
        }

        async fn open_read_stream(
            &self,
            key: &str,
            _timeout: Duration,
        ) -> Result<ByteStream, ObjectStoreError> {
            *self.open_calls.lock().entry(key.to_string()).or_default() += 1;

            if let Some(delay) = self.open_delay {
                tokio::time::sleep(delay).await;
            }

            {
                let mut failures = self.transient_failures.lock();
                if let Some(left) = failures.get_mut(key) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(ObjectStoreError::Transient("connection reset".into()));
                    }
                }
            }

            let data = self
                .objects
                .get(key)
                .cloned()
                .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))?;
            let delay = self.delays.get(key).copied().unwrap_or_default();

            let now = self.open_now.fetch_add(1, Ordering::SeqCst) + 1;
            self.open_max.fetch_max(now, Ordering::SeqCst);

            let inner = futures::stream::once(async move {
                tokio::time::sleep(delay).await;
                Ok(Bytes::from(data))
            })
            .boxed();
            Ok(TrackedStream {
                inner,
                _guard: OpenGuard(Arc::clone(&self.open_now)),
            }
            .boxed())
        }
    }

    // ------------------------------------------------------------------
    // 记录型 sink
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct RecordingSink {
        entries: Vec<(String, Vec<u8>)>,
        finish_calls: usize,
        fail_on_entry: Option<usize>,
    }

    impl ArchiveSink for RecordingSink {
        fn start_entry(&mut self, name: &str) -> Result<(), SinkError> {
            if self.finish_calls > 0 {
                return Err(SinkError::AlreadyFinalized);
            }
            if self.fail_on_entry == Some(self.entries.len()) {
                return Err(SinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.entries.push((name.to_string(), Vec::new()));
            Ok(())
        }

        fn write_all(&mut self, data: &[u8]) -> Result<(), SinkError> {
            let entry = self.entries.last_mut().ok_or(SinkError::NoOpenEntry)?;
            entry.1.extend_from_slice(data);
            Ok(())
        }

        fn finish(&mut self) -> Result<u64, SinkError> {
            self.finish_calls += 1;
            Ok(self.entries.iter().map(|(_, d)| d.len() as u64).sum())
        }
    }

    // ------------------------------------------------------------------
    // 辅助函数
    // ------------------------------------------------------------------

    fn resolved(id: &str, name: &str, folder_path: &str, size: u64) -> ResolvedFile {
        ResolvedFile {
            record: FileRecord {
                id: id.to_string(),
                owner_id: "alice".to_string(),
                name: name.to_string(),
                size,
                storage_key: format!("k/{}", id),
                folder_id: None,
                project_id: None,
                created_at: 0,
                deleted_at: None,
            },
            folder_path: folder_path.to_string(),
        }
    }

    fn fast_options(concurrency: usize) -> PackOptions {
        PackOptions {
            concurrency,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(5),
            fetch_timeout: Duration::from_secs(5),
            max_name_length: 200,
            preserve_structure: true,
            spool_dir: None,
            compression: Compression::Stored,
        }
    }

    fn names(sink: &RecordingSink) -> Vec<&str> {
        sink.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    // ------------------------------------------------------------------
    // 测试
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_missing_object_becomes_placeholder() {
        let store = Arc::new(
            StubStore::default()
                .with("k/a", b"aaa")
                .with("k/c", b"ccc"),
        );
        let engine = PackEngine::new(store.clone(), fast_options(5));
        let files = vec![
            resolved("a", "a.txt", "", 3),
            resolved("b", "b.txt", "", 3),
            resolved("c", "c.txt", "", 3),
        ];

        let (report, sink) = engine
            .pack(&files, RecordingSink::default(), |_| {})
            .await
            .unwrap();

        assert_eq!(report.total_files, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.error_ledger.len(), 1);
        assert_eq!(report.error_ledger[0].file_id, "b");
        assert_eq!(report.error_ledger[0].attempt, 1);

        assert_eq!(names(&sink), vec!["a.txt", "_errors/b.txt.txt", "c.txt"]);
        assert_eq!(sink.finish_calls, 1);

        let placeholder = String::from_utf8(sink.entries[1].1.clone()).unwrap();
        assert!(placeholder.contains("b.txt"));
        assert!(placeholder.contains("k/b"));

        // 对象不存在时不打开流、不重试
        assert_eq!(store.opens("k/b"), 0);
    }

    #[tokio::test]
    async fn test_open_streams_never_exceed_concurrency() {
        let mut store = StubStore::default();
        let mut files = Vec::new();
        for i in 0..12 {
            let key = format!("k/f{}", i);
            store = store
                .with(&key, b"data")
                .delay(&key, Duration::from_millis(20));
            files.push(resolved(&format!("f{}", i), "same.bin", "", 4));
        }
        let store = Arc::new(store);
        let engine = PackEngine::new(store.clone(), fast_options(3));

        let (report, sink) = engine
            .pack(&files, RecordingSink::default(), |_| {})
            .await
            .unwrap();

        assert_eq!(report.succeeded, 12);
        let max = store.open_max.load(Ordering::SeqCst);
        assert!(max >= 1 && max <= 3, "max open streams = {}", max);
        assert_eq!(store.open_now.load(Ordering::SeqCst), 0);

        // 同名文件全部唯一
        let mut unique = names(&sink);
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 12);
    }

    #[tokio::test]
    async fn test_entries_follow_resolved_order() {
        // 越靠前的文件越慢，完成顺序与解析顺序相反
        let store = Arc::new(
            StubStore::default()
                .with("k/1", b"1")
                .delay("k/1", Duration::from_millis(60))
                .with("k/2", b"2")
                .delay("k/2", Duration::from_millis(30))
                .with("k/3", b"3"),
        );
        let engine = PackEngine::new(store, fast_options(3));
        let files = vec![
            resolved("1", "one", "x", 1),
            resolved("2", "two", "", 1),
            resolved("3", "three", "x/y", 1),
        ];

        let (_, sink) = engine
            .pack(&files, RecordingSink::default(), |_| {})
            .await
            .unwrap();
        assert_eq!(names(&sink), vec!["x/one", "two", "x/y/three"]);
        assert_eq!(sink.entries[0].1, b"1");
    }

    #[tokio::test]
    async fn test_flat_layout_when_structure_not_preserved() {
        let store = Arc::new(StubStore::default().with("k/1", b"1").with("k/2", b"2"));
        let mut options = fast_options(2);
        options.preserve_structure = false;
        let engine = PackEngine::new(store, options);
        let files = vec![
            resolved("1", "a.txt", "x", 1),
            resolved("2", "a.txt", "y", 1),
        ];

        let (_, sink) = engine
            .pack(&files, RecordingSink::default(), |_| {})
            .await
            .unwrap();
        assert_eq!(names(&sink), vec!["a.txt", "a_1.txt"]);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let store = Arc::new(
            StubStore::default()
                .with("k/flaky", b"ok")
                .fail_times("k/flaky", 2)
                .with("k/broken", b"never")
                .fail_times("k/broken", 10),
        );
        let engine = PackEngine::new(store.clone(), fast_options(2));
        let files = vec![
            resolved("flaky", "flaky.txt", "", 2),
            resolved("broken", "broken.txt", "", 5),
        ];

        let (report, sink) = engine
            .pack(&files, RecordingSink::default(), |_| {})
            .await
            .unwrap();

        assert_eq!(store.opens("k/flaky"), 3);
        assert_eq!(store.opens("k/broken"), 3);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.error_ledger[0].file_id, "broken");
        assert_eq!(report.error_ledger[0].attempt, 3);
        assert_eq!(names(&sink), vec!["flaky.txt", "_errors/broken.txt.txt"]);
    }

    #[tokio::test]
    async fn test_open_timeout_is_retried_then_recorded() {
        let store = StubStore {
            open_delay: Some(Duration::from_millis(200)),
            ..StubStore::default()
        }
        .with("k/slow", b"zzz");
        let store = Arc::new(store);

        let mut options = fast_options(1);
        options.fetch_timeout = Duration::from_millis(20);
        options.max_attempts = 2;
        let engine = PackEngine::new(store.clone(), options);

        let (report, _) = engine
            .pack(
                &[resolved("slow", "slow.txt", "", 3)],
                RecordingSink::default(),
                |_| {},
            )
            .await
            .unwrap();

        assert_eq!(store.opens("k/slow"), 2);
        assert_eq!(report.failed, 1);
        assert!(report.error_ledger[0].reason.contains("超时"));
    }

    #[tokio::test]
    async fn test_all_failed_still_finalizes_once() {
        let engine = PackEngine::new(Arc::new(StubStore::default()), fast_options(2));
        let files = vec![
            resolved("a", "a", "", 1),
            resolved("b", "b", "", 1),
            resolved("c", "c", "", 1),
        ];

        let (report, sink) = engine
            .pack(&files, RecordingSink::default(), |_| {})
            .await
            .unwrap();

        assert_eq!(report.failed, 3);
        assert_eq!(report.succeeded + report.failed, report.total_files);
        assert_eq!(sink.finish_calls, 1);
        assert!(names(&sink).iter().all(|n| n.starts_with("_errors/")));
    }

    #[tokio::test]
    async fn test_empty_input_is_rejected() {
        let engine = PackEngine::new(Arc::new(StubStore::default()), fast_options(2));
        let result = engine.pack(&[], RecordingSink::default(), |_| {}).await;
        assert!(matches!(result, Err(PackError::SelectionEmpty)));
    }

    #[tokio::test]
    async fn test_zero_size_file_is_included() {
        let store = Arc::new(StubStore::default().with("k/empty", b""));
        let engine = PackEngine::new(store, fast_options(2));

        let (report, sink) = engine
            .pack(
                &[resolved("empty", "empty.txt", "", 0)],
                RecordingSink::default(),
                |_| {},
            )
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(sink.entries, vec![("empty.txt".to_string(), Vec::new())]);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let store = Arc::new(StubStore::default().with("k/a", b"a").with("k/c", b"c"));
        let engine = PackEngine::new(store, fast_options(2));
        let files = vec![
            resolved("a", "a", "", 1),
            resolved("b", "b", "", 1),
            resolved("c", "c", "", 1),
        ];

        let mut events = Vec::new();
        engine
            .pack(&files, RecordingSink::default(), |e| events.push(e))
            .await
            .unwrap();

        let progress: Vec<JobProgress> = events
            .iter()
            .filter_map(|e| match e {
                PackEvent::Progress(p) => Some(p.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(progress.len(), 3);
        assert!(progress
            .windows(2)
            .all(|w| w[0].processed_files < w[1].processed_files));
        let last = progress.last().unwrap();
        assert_eq!(last.processed_files, 3);
        assert_eq!(last.percentage, 100.0);
        assert_eq!(last.error_count, 1);

        let failed = events
            .iter()
            .filter(|e| matches!(e, PackEvent::FileFailed(_)))
            .count();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn test_sink_failure_is_fatal() {
        let store = Arc::new(StubStore::default().with("k/a", b"a").with("k/b", b"b"));
        let engine = PackEngine::new(store, fast_options(2));
        let sink = RecordingSink {
            fail_on_entry: Some(1),
            ..RecordingSink::default()
        };

        let result = engine
            .pack(
                &[resolved("a", "a", "", 1), resolved("b", "b", "", 1)],
                sink,
                |_| {},
            )
            .await;
        assert!(matches!(result, Err(PackError::Sink(SinkError::Io(_)))));
    }

    #[tokio::test]
    async fn test_sink_failure_aborts_pending_fetches() {
        let store = Arc::new(
            StubStore::default()
                .with("k/a", b"a")
                .with("k/slow", b"slow")
                .delay("k/slow", Duration::from_secs(30)),
        );
        let engine = PackEngine::new(store.clone(), fast_options(2));
        let sink = RecordingSink {
            fail_on_entry: Some(0),
            ..RecordingSink::default()
        };

        let result = engine
            .pack(
                &[resolved("a", "a", "", 1), resolved("slow", "slow", "", 4)],
                sink,
                |_| {},
            )
            .await;
        assert!(matches!(result, Err(PackError::Sink(_))));

        // 慢速读取流随任务中止一起释放，而不是等到 30 秒后
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.open_now.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("fetch task still holds its stream");
    }

    #[tokio::test]
    async fn test_zip_output_is_openable() {
        let store = Arc::new(
            StubStore::default()
                .with("k/a", b"alpha")
                .with("k/b", b"beta"),
        );
        let engine = PackEngine::new(store, fast_options(2));
        let files = vec![
            resolved("a", "notes.txt", "docs", 5),
            resolved("b", "notes.txt", "docs", 4),
            resolved("m", "missing.pdf", "", 9),
        ];
        let sink = ZipArchiveSink::new(std::io::Cursor::new(Vec::new()), Compression::Deflated);

        let (report, sink) = engine.pack(&files, sink, |_| {}).await.unwrap();
        let bytes = sink.into_inner().unwrap().into_inner();
        assert_eq!(report.archive_bytes, bytes.len() as u64);

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"docs/notes.txt".to_string()));
        assert!(names.contains(&"docs/notes_1.txt".to_string()));
        assert!(names.contains(&"_errors/missing.pdf.txt".to_string()));

        let mut content = String::new();
        archive
            .by_name("docs/notes_1.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "beta");
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
    }
}
