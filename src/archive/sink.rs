//! 归档输出
//!
//! `ArchiveSink` 是打包引擎写入的目标，同步接口，由引擎放在阻塞线程池里调用。
//! `finish` 恰好调用一次，之后任何写入都返回 `SinkError::AlreadyFinalized`

use std::io::{Read, Seek, SeekFrom, Write};

use tracing::debug;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::error::SinkError;
use crate::config::Compression;

/// 追加条目时的读取缓冲
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// 归档输出接口
pub trait ArchiveSink: Send {
    /// 开始一个新条目，之前的条目自动结束
    fn start_entry(&mut self, name: &str) -> Result<(), SinkError>;

    /// 向当前条目写入数据
    fn write_all(&mut self, data: &[u8]) -> Result<(), SinkError>;

    /// 完成归档，返回归档总字节数
    fn finish(&mut self) -> Result<u64, SinkError>;

    /// 把 reader 的全部内容写成一个条目，返回写入的字节数
    fn append_from(&mut self, name: &str, reader: &mut dyn Read) -> Result<u64, SinkError> {
        self.start_entry(name)?;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut written = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.write_all(&buf[..n])?;
            written += n as u64;
        }
        Ok(written)
    }
}

/// ZIP 归档输出（支持 ZIP64）
pub struct ZipArchiveSink<W: Write + Seek + Send> {
    writer: Option<ZipWriter<W>>,
    finished: Option<W>,
    options: FileOptions,
    entry_open: bool,
    entries: usize,
}

impl<W: Write + Seek + Send> ZipArchiveSink<W> {
    pub fn new(inner: W, compression: Compression) -> Self {
        let method = match compression {
            Compression::Deflated => CompressionMethod::Deflated,
            Compression::Stored => CompressionMethod::Stored,
        };
        let options = FileOptions::default()
            .compression_method(method)
            .large_file(true)
            .unix_permissions(0o644);

        Self {
            writer: Some(ZipWriter::new(inner)),
            finished: None,
            options,
            entry_open: false,
            entries: 0,
        }
    }

    /// 取回底层 writer（仅在 finish 之后可用）
    pub fn into_inner(self) -> Option<W> {
        self.finished
    }

    fn writer(&mut self) -> Result<&mut ZipWriter<W>, SinkError> {
        self.writer.as_mut().ok_or(SinkError::AlreadyFinalized)
    }
}

impl<W: Write + Seek + Send> ArchiveSink for ZipArchiveSink<W> {
    fn start_entry(&mut self, name: &str) -> Result<(), SinkError> {
        let options = self.options;
        self.writer()?.start_file(name, options)?;
        self.entry_open = true;
        self.entries += 1;
        debug!("写入归档条目: {}", name);
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), SinkError> {
        if !self.entry_open {
            return Err(if self.writer.is_none() {
                SinkError::AlreadyFinalized
            } else {
                SinkError::NoOpenEntry
            });
        }
        Write::write_all(self.writer()?, data)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<u64, SinkError> {
        let mut writer = self.writer.take().ok_or(SinkError::AlreadyFinalized)?;
        self.entry_open = false;

        let mut inner = writer.finish()?;
        let size = inner.seek(SeekFrom::End(0))?;
        inner.flush()?;
        self.finished = Some(inner);

        debug!("归档完成: {} 个条目, {} bytes", self.entries, size);
        Ok(size)
    }
}
