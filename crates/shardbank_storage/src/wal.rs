//! Append-only, checksummed record file shared by the shard store and the
//! coordinator's intent log.
//!
//! File layout: `[magic:4][version:4]` header followed by records framed as
//! `[len:4][crc32:4][bincode payload:len]`. Replay stops at the first torn or
//! corrupt record; everything before it is trusted.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use shardbank_common::error::StorageError;

/// Bump when a record enum changes incompatibly.
pub const WAL_FORMAT_VERSION: u32 = 1;

/// Magic bytes at the start of every file.
pub const WAL_MAGIC: &[u8; 4] = b"SBNK";

/// Size of the file header: magic (4) + format version (4) = 8 bytes.
pub const WAL_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    None,
    FSync,
    FDataSync,
}

impl SyncMode {
    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s.to_lowercase().as_str() {
            "none" => Ok(SyncMode::None),
            "fsync" => Ok(SyncMode::FSync),
            "fdatasync" => Ok(SyncMode::FDataSync),
            other => Err(StorageError::Wal(format!(
                "invalid sync mode '{}': expected fsync, fdatasync, or none",
                other
            ))),
        }
    }
}

/// Single-file record writer. Every `append` is flushed and synced before
/// it returns, so a successful append is durable.
///
/// A failed append may leave part or all of its frame in the file or in the
/// write buffer. The writer then truncates back to the end of the last
/// durable frame before it writes anything else.
pub struct WalWriter<R> {
    path: PathBuf,
    writer: BufWriter<File>,
    sync_mode: SyncMode,
    records_written: u64,
    /// File length after the last successful append or rewrite.
    durable_len: u64,
    needs_repair: bool,
    fail_next_sync: bool,
    _record: PhantomData<fn(R)>,
}

impl<R: Serialize> WalWriter<R> {
    pub fn open(path: &Path, sync_mode: SyncMode) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let is_new_file = file.metadata().map(|m| m.len()).unwrap_or(0) == 0;
        let mut writer = BufWriter::new(file);
        if is_new_file {
            writer.write_all(WAL_MAGIC)?;
            writer.write_all(&WAL_FORMAT_VERSION.to_le_bytes())?;
            writer.flush()?;
        }
        let durable_len = writer.get_ref().metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            sync_mode,
            records_written: 0,
            durable_len,
            needs_repair: false,
            fail_next_sync: false,
            _record: PhantomData,
        })
    }

    /// Append one record and make it durable.
    pub fn append(&mut self, record: &R) -> Result<(), StorageError> {
        let data = encode(record)?;
        if self.needs_repair {
            self.repair()?;
        }
        let written = self
            .writer
            .write_all(&data)
            .map_err(StorageError::from)
            .and_then(|()| self.sync());
        if let Err(e) = written {
            self.needs_repair = true;
            return Err(e);
        }
        self.durable_len += data.len() as u64;
        self.records_written += 1;
        Ok(())
    }

    /// Make the next append fail after its frame has been flushed to the
    /// file but before it is synced.
    pub fn fail_next_sync(&mut self) {
        self.fail_next_sync = true;
    }

    /// True while the file may hold bytes of a failed append.
    pub fn needs_repair(&self) -> bool {
        self.needs_repair
    }

    /// Drop buffered bytes of a failed append and truncate the file to the
    /// last durable frame.
    fn repair(&mut self) -> Result<(), StorageError> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back unwritten bytes instead of flushing them.
        let (_, _unwritten) = stale.into_parts();
        self.writer.get_ref().set_len(self.durable_len)?;
        self.writer.get_ref().sync_all()?;
        self.needs_repair = false;
        tracing::warn!(
            path = %self.path.display(),
            len = self.durable_len,
            "WAL truncated after failed append"
        );
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.writer.flush()?;
        if std::mem::take(&mut self.fail_next_sync) {
            return Err(StorageError::Wal("injected sync failure".into()));
        }
        match self.sync_mode {
            SyncMode::None => {}
            SyncMode::FSync => self.writer.get_ref().sync_all()?,
            SyncMode::FDataSync => self.writer.get_ref().sync_data()?,
        }
        Ok(())
    }

    /// Atomically replace the file contents with `records`
    /// (write to a temp file, then rename over the original).
    pub fn rewrite(&mut self, records: &[R]) -> Result<(), StorageError> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            tmp.write_all(WAL_MAGIC)?;
            tmp.write_all(&WAL_FORMAT_VERSION.to_le_bytes())?;
            for record in records {
                tmp.write_all(&encode(record)?)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let (_, _unwritten) = stale.into_parts();
        self.durable_len = self.writer.get_ref().metadata()?.len();
        self.needs_repair = false;
        tracing::debug!(
            path = %self.path.display(),
            records = records.len(),
            "WAL compacted"
        );
        Ok(())
    }

    /// Records appended through this writer since it was opened.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }
}

fn encode<R: Serialize>(record: &R) -> Result<Vec<u8>, StorageError> {
    let payload =
        bincode::serialize(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
    let mut data = Vec::with_capacity(8 + payload.len());
    data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    data.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    data.extend_from_slice(&payload);
    Ok(data)
}

/// Read every intact record from `path`. A missing file yields no records.
pub fn read_records<R: DeserializeOwned>(path: &Path) -> Result<Vec<R>, StorageError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = fs::read(path)?;
    let mut records = Vec::new();
    parse_records(&data, &mut records)?;
    Ok(records)
}

fn parse_records<R: DeserializeOwned>(data: &[u8], records: &mut Vec<R>) -> Result<(), StorageError> {
    if data.is_empty() {
        return Ok(());
    }
    if data.len() < WAL_HEADER_SIZE || &data[0..4] != WAL_MAGIC.as_slice() {
        return Err(StorageError::Wal("missing or invalid file header".into()));
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != WAL_FORMAT_VERSION {
        return Err(StorageError::Wal(format!(
            "unsupported format version {} (expected {})",
            version, WAL_FORMAT_VERSION
        )));
    }

    let mut pos = WAL_HEADER_SIZE;
    while pos + 8 <= data.len() {
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let checksum =
            u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        pos += 8;

        if pos + len > data.len() {
            tracing::warn!("WAL truncated at position {}, stopping replay", pos);
            break;
        }

        let record_data = &data[pos..pos + len];
        if crc32fast::hash(record_data) != checksum {
            tracing::warn!("WAL checksum mismatch at position {}, stopping replay", pos);
            break;
        }

        match bincode::deserialize::<R>(record_data) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!("WAL deserialization error at position {}: {}", pos, e);
                break;
            }
        }
        pos += len;
    }
    Ok(())
}
