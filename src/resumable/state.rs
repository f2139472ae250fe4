//! 传输状态持久化
//!
//! 每个传输在状态目录下有两个文件：
//! - `{download_id}.meta`: JSON 头信息，先写临时文件再原子重命名
//! - `{download_id}.wal`: 每完成一个分段追加一行 `{segment_index},{timestamp_ms}`
//!
//! 加载时由两者重建 `TransferState`，WAL 中无法解析或越界的行跳过

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use bit_set::BitSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::segment::SegmentPlan;

const META_EXTENSION: &str = "meta";
const WAL_EXTENSION: &str = "wal";

/// 传输状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferState {
    pub download_id: String,
    pub url: String,
    pub filename: String,
    pub total_bytes: u64,
    pub segment_size: u64,
    /// 已取回的分段（来自 WAL，不写入 meta）
    #[serde(skip)]
    pub retrieved_segments: BitSet,
    /// 创建时间 (Unix 毫秒时间戳)
    pub created_at: i64,
    pub updated_at: i64,
}

impl TransferState {
    pub fn new(
        download_id: impl Into<String>,
        url: impl Into<String>,
        filename: impl Into<String>,
        total_bytes: u64,
        segment_size: u64,
    ) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let segment_size = segment_size.max(1);
        Self {
            download_id: download_id.into(),
            url: url.into(),
            filename: filename.into(),
            total_bytes,
            segment_size,
            retrieved_segments: BitSet::with_capacity(SegmentPlan::segment_count_for(
                total_bytes,
                segment_size,
            )),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn total_segments(&self) -> usize {
        SegmentPlan::segment_count_for(self.total_bytes, self.segment_size)
    }

    pub fn retrieved_count(&self) -> usize {
        self.retrieved_segments.len()
    }

    pub fn is_retrieved(&self, index: usize) -> bool {
        self.retrieved_segments.contains(index)
    }

    /// 标记分段完成，越界索引忽略
    pub fn mark_retrieved(&mut self, index: usize) -> bool {
        if index >= self.total_segments() {
            return false;
        }
        self.updated_at = chrono::Utc::now().timestamp_millis();
        self.retrieved_segments.insert(index)
    }

    pub fn is_complete(&self) -> bool {
        self.retrieved_count() == self.total_segments()
    }
}

/// 传输状态存储
pub trait TransferStateStore: Send + Sync {
    fn load(&self, download_id: &str) -> io::Result<Option<TransferState>>;

    /// 保存头信息（不改动已记录的分段）
    fn save(&self, state: &TransferState) -> io::Result<()>;

    /// 记录一个分段已完成
    fn mark_retrieved(&self, download_id: &str, index: usize) -> io::Result<()>;

    /// 删除全部状态
    fn clear(&self, download_id: &str) -> io::Result<()>;
}

/// 基于文件的状态存储
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, download_id: &str, extension: &str) -> io::Result<PathBuf> {
        let valid = !download_id.is_empty()
            && download_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("非法的传输ID: {:?}", download_id),
            ));
        }
        Ok(self.dir.join(format!("{}.{}", download_id, extension)))
    }

    fn ensure_dir(&self) -> io::Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
            debug!("已创建状态目录: {:?}", self.dir);
        }
        Ok(())
    }

    fn read_wal(&self, path: &Path, state: &mut TransferState) -> io::Result<()> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut skipped = 0;
        for (line_number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let index = line
                .split(',')
                .next()
                .and_then(|field| field.trim().parse::<usize>().ok());
            match index {
                Some(index) if index < state.total_segments() => {
                    state.mark_retrieved(index);
                }
                _ => {
                    warn!(
                        "WAL 记录无效 (行 {}): {:?} in {:?}",
                        line_number + 1,
                        line,
                        path
                    );
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            warn!("WAL 读取完成，跳过 {} 行无效记录 in {:?}", skipped, path);
        }
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

impl TransferStateStore for FileStateStore {
    fn load(&self, download_id: &str) -> io::Result<Option<TransferState>> {
        let meta_path = self.path(download_id, META_EXTENSION)?;
        let file = match File::open(&meta_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut state: TransferState = match serde_json::from_reader(BufReader::new(file)) {
            Ok(state) => state,
            Err(e) => {
                warn!("传输状态文件损坏，忽略: {:?}, 错误: {}", meta_path, e);
                return Ok(None);
            }
        };
        state.retrieved_segments = BitSet::with_capacity(state.total_segments());

        let wal_path = self.path(download_id, WAL_EXTENSION)?;
        self.read_wal(&wal_path, &mut state)?;

        debug!(
            "已加载传输状态: id={}, 已完成 {}/{} 分段",
            download_id,
            state.retrieved_count(),
            state.total_segments()
        );
        Ok(Some(state))
    }

    fn save(&self, state: &TransferState) -> io::Result<()> {
        self.ensure_dir()?;
        let path = self.path(&state.download_id, META_EXTENSION)?;

        // 先写入临时文件，再原子重命名
        let temp_path = path.with_extension("meta.tmp");
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        serde_json::to_writer_pretty(&mut writer, state).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("序列化传输状态失败: {}", e),
            )
        })?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, &path)?;
        debug!("已保存传输状态: {:?}", path);
        Ok(())
    }

    fn mark_retrieved(&self, download_id: &str, index: usize) -> io::Result<()> {
        self.ensure_dir()?;
        let path = self.path(download_id, WAL_EXTENSION)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(
            file,
            "{},{}",
            index,
            chrono::Utc::now().timestamp_millis()
        )?;
        file.flush()?;
        Ok(())
    }

    fn clear(&self, download_id: &str) -> io::Result<()> {
        remove_if_exists(&self.path(download_id, META_EXTENSION)?)?;
        remove_if_exists(&self.path(download_id, WAL_EXTENSION)?)?;
        debug!("已清除传输状态: {}", download_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_round_trip_with_wal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state"));

        let state = TransferState::new("dl-1", "http://h/a", "a.zip", 10_000_000, 1_000_000);
        store.save(&state).unwrap();
        store.mark_retrieved("dl-1", 0).unwrap();
        store.mark_retrieved("dl-1", 7).unwrap();
        store.mark_retrieved("dl-1", 7).unwrap();

        let loaded = store.load("dl-1").unwrap().unwrap();
        assert_eq!(loaded.total_segments(), 10);
        assert_eq!(loaded.retrieved_count(), 2);
        assert!(loaded.is_retrieved(0));
        assert!(loaded.is_retrieved(7));
        assert_eq!(loaded.filename, "a.zip");
    }

    #[test]
    fn test_invalid_wal_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        store
            .save(&TransferState::new("dl", "u", "f", 30, 10))
            .unwrap();
        std::fs::write(dir.path().join("dl.wal"), "1,100\ngarbage\n99,5\n\n2,7\n").unwrap();

        let loaded = store.load("dl").unwrap().unwrap();
        assert_eq!(loaded.retrieved_count(), 2);
        assert!(!loaded.is_retrieved(0));
    }

    #[test]
    fn test_clear_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(store.load("nothing").unwrap().is_none());

        store.save(&TransferState::new("x", "u", "f", 5, 1)).unwrap();
        store.mark_retrieved("x", 0).unwrap();
        store.clear("x").unwrap();
        assert!(store.load("x").unwrap().is_none());
        assert!(!dir.path().join("x.wal").exists());
        // 重复清除不报错
        store.clear("x").unwrap();
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(store.load("../etc").is_err());
        assert!(store.mark_retrieved("a/b", 0).is_err());
    }

    #[test]
    fn test_out_of_range_marks_are_ignored() {
        let mut state = TransferState::new("s", "u", "f", 25, 10);
        assert_eq!(state.total_segments(), 3);
        assert!(!state.mark_retrieved(3));
        assert!(state.mark_retrieved(2));
        assert!(!state.is_complete());
    }
}
