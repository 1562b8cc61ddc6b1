//! 로컬 binlog 세그먼트 파일 및 인덱스 파일 기록
//!
//! 순서 보장:
//!   1. 새 파일은 매직 헤더를 먼저 쓰고 flush (durable 모드면 fsync)
//!   2. 그 다음 인덱스에 파일명을 추가하고 flush (durable 모드면 fsync)
//!   3. 이후에만 이벤트 바이트를 추가
//!
//! 모든 I/O 실패는 `ReplicaError::Io`이며 재시도하지 않습니다.

use crate::error::{ReplicaError, Result};
use crate::events::{BINLOG_MAGIC, BIN_LOG_HEADER_SIZE};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 세그먼트 파일 열기 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// 기존 내용을 버리고 새로 씀
    Truncate,
    /// 기존 파일 뒤에 이어 씀. `truncate_to`보다 긴 꼬리는 잘라냄
    Append { truncate_to: Option<u64> },
}

/// 생성한 파일명을 한 줄씩 기록하는 인덱스
pub struct IndexFile {
    path: PathBuf,
    file: File,
    entries: Vec<String>,
}

impl IndexFile {
    pub fn open(path: &Path) -> Result<Self> {
        let entries = match fs::read_to_string(path) {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(IndexFile {
            path: path.to_path_buf(),
            file,
            entries,
        })
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn last_entry(&self) -> Option<&str> {
        self.entries.last().map(String::as_str)
    }

    /// 파일명 추가. 마지막 항목과 같으면 기록하지 않고 false
    pub fn append(&mut self, name: &str, durable: bool) -> Result<bool> {
        if self.last_entry() == Some(name) {
            return Ok(false);
        }
        self.file.write_all(format!("{}\n", name).as_bytes())?;
        self.file.flush()?;
        if durable {
            self.file.sync_data()?;
        }
        self.entries.push(name.to_string());
        debug!(index = %self.path.display(), file = name, "Index entry appended");
        Ok(true)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.entries.clear();
        Ok(())
    }
}

/// 현재 기록 중인 세그먼트 파일
struct OutputFile {
    name: String,
    file: BufWriter<File>,
    len: u64,
}

/// 세그먼트 파일 + 인덱스 기록기
pub struct BinlogWriter {
    dir: PathBuf,
    index: IndexFile,
    current: Option<OutputFile>,
    durable: bool,
}

impl BinlogWriter {
    /// 출력 디렉토리를 만들고 인덱스를 엽니다
    pub fn open(dir: &Path, index_name: &str, durable: bool) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            ReplicaError::Config(format!("cannot create binlog_dir {}: {}", dir.display(), e))
        })?;
        let index = IndexFile::open(&dir.join(index_name))?;
        Ok(BinlogWriter {
            dir: dir.to_path_buf(),
            index,
            current: None,
            durable,
        })
    }

    pub fn index(&self) -> &IndexFile {
        &self.index
    }

    pub fn segment_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn current_name(&self) -> Option<&str> {
        self.current.as_ref().map(|out| out.name.as_str())
    }

    /// 현재 파일에 기록된 바이트 수 (매직 헤더 포함)
    pub fn current_len(&self) -> Option<u64> {
        self.current.as_ref().map(|out| out.len)
    }

    /// `name` 파일을 `mode`로 엽니다. 이미 같은 파일이 열려 있으면 그대로 사용
    pub fn ensure_open(&mut self, name: &str, mode: OpenMode) -> Result<()> {
        if self.current_name() == Some(name) {
            return Ok(());
        }
        self.close()?;

        let path = self.segment_path(name);
        let output = match mode {
            OpenMode::Truncate => {
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&path)?;
                self.start_file(name, file)?
            }
            OpenMode::Append { truncate_to } => {
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                let mut len = file.metadata()?.len();
                if let Some(limit) = truncate_to {
                    if len > limit {
                        warn!(file = name, from = len, to = limit, "Discarding partial tail");
                        file.set_len(limit)?;
                        len = limit;
                    }
                }
                if len < BIN_LOG_HEADER_SIZE {
                    file.set_len(0)?;
                    self.start_file(name, file)?
                } else {
                    OutputFile {
                        name: name.to_string(),
                        file: BufWriter::new(file),
                        len,
                    }
                }
            }
        };

        info!(file = name, mode = ?mode, offset = output.len, "Opened binlog file");
        self.current = Some(output);
        Ok(())
    }

    /// 매직 헤더 기록 후 인덱스에 추가
    fn start_file(&mut self, name: &str, file: File) -> Result<OutputFile> {
        let mut file = BufWriter::new(file);
        file.write_all(&BINLOG_MAGIC)?;
        file.flush()?;
        if self.durable {
            file.get_ref().sync_data()?;
        }
        self.index.append(name, self.durable)?;
        Ok(OutputFile {
            name: name.to_string(),
            file,
            len: BIN_LOG_HEADER_SIZE,
        })
    }

    /// 현재 파일에 이벤트 바이트 추가
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let out = self.current.as_mut().ok_or_else(|| {
            ReplicaError::Io(std::io::Error::new(
                ErrorKind::Other,
                "no binlog file is open",
            ))
        })?;
        out.file.write_all(bytes)?;
        out.len += bytes.len() as u64;
        Ok(())
    }

    /// 버퍼를 비우고, durable 모드면 fsync
    pub fn sync_if_configured(&mut self) -> Result<()> {
        if let Some(out) = self.current.as_mut() {
            out.file.flush()?;
            if self.durable {
                out.file.get_ref().sync_data()?;
            }
        }
        Ok(())
    }

    /// 현재 파일을 flush 후 닫음
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut out) = self.current.take() {
            out.file.flush()?;
            if self.durable {
                out.file.get_ref().sync_all()?;
            }
            debug!(file = %out.name, bytes = out.len, "Closed binlog file");
        }
        Ok(())
    }

    /// 인덱스에 있는 모든 파일을 지우고 인덱스를 비움
    pub fn reset(&mut self) -> Result<()> {
        self.close()?;
        for name in self.index.entries().to_vec() {
            let path = self.segment_path(&name);
            match fs::remove_file(&path) {
                Ok(()) => debug!(file = %path.display(), "Removed binlog file"),
                Err(e) => warn!(file = %path.display(), "Could not remove binlog file: {}", e),
            }
        }
        self.index.clear()?;
        info!(dir = %self.dir.display(), "Local binlog state reset");
        Ok(())
    }
}
