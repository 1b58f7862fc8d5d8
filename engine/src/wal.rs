//! Write-ahead log.
//!
//! One append-only `<table>.wal` file per table. Every mutation is made
//! durable here before it touches the page cache.
//!
//! # Record format
//!
//! ```text
//! +----------+------------------------------------------------+
//! | 0-7      | lsn (8 bytes) - byte offset of this record     |
//! | 8        | kind (1 byte)                                  |
//! | 9-N      | payload (variable, depends on kind)            |
//! | N+1-N+4  | CRC32 checksum over everything before it       |
//! +----------+------------------------------------------------+
//! ```
//!
//! Payloads: INSERT and UPDATE carry `u64 key, u32 len, len bytes`;
//! DELETE carries `u64 key`; CHECKPOINT and VACUUM carry
//! `u32 root_page, u32 next_page_id`.
//!
//! An LSN is the byte offset at which its record begins, so LSNs are
//! strictly increasing and replay can verify framing. A suffix that fails
//! to parse (length, kind, LSN, or CRC) is a torn tail from a crash and is
//! discarded.
//!
//! # Single writer
//!
//! Exactly one task owns the file handle. Callers submit batches over a
//! channel and block on a oneshot completion; the writer assigns LSNs from
//! the current file length, writes every record in the batch, fsyncs once,
//! and then completes the batch. This serializes LSN assignment no matter
//! how many tasks mutate the table, and guarantees the record is durable
//! before the mutation proceeds to the tree.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{CodecError, Reader, Writer};
use crate::page::PageId;

/// Log sequence number: the byte offset of a record in the WAL file.
pub type Lsn = u64;

/// Capacity of the writer's command channel.
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Record kind discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalKind {
    Insert = 0,
    Delete = 1,
    /// Reserved; written by no current code path but accepted by replay.
    Update = 2,
    Vacuum = 3,
    Checkpoint = 4,
}

impl TryFrom<u8> for WalKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Insert),
            1 => Ok(Self::Delete),
            2 => Ok(Self::Update),
            3 => Ok(Self::Vacuum),
            4 => Ok(Self::Checkpoint),
            _ => Err(value),
        }
    }
}

/// Payload of a log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalPayload {
    Insert { key: u64, record: Vec<u8> },
    Delete { key: u64 },
    Update { key: u64, record: Vec<u8> },
    Vacuum { root_page: PageId, next_page_id: PageId },
    Checkpoint { root_page: PageId, next_page_id: PageId },
}

impl WalPayload {
    #[must_use]
    pub const fn kind(&self) -> WalKind {
        match self {
            Self::Insert { .. } => WalKind::Insert,
            Self::Delete { .. } => WalKind::Delete,
            Self::Update { .. } => WalKind::Update,
            Self::Vacuum { .. } => WalKind::Vacuum,
            Self::Checkpoint { .. } => WalKind::Checkpoint,
        }
    }
}

/// A complete log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub lsn: Lsn,
    pub payload: WalPayload,
}

impl WalRecord {
    /// Serialize with the trailing CRC32.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u64(self.lsn);
        w.put_u8(self.payload.kind() as u8);
        match &self.payload {
            WalPayload::Insert { key, record } | WalPayload::Update { key, record } => {
                w.put_u64(*key);
                w.put_len_prefixed(record);
            }
            WalPayload::Delete { key } => w.put_u64(*key),
            WalPayload::Vacuum {
                root_page,
                next_page_id,
            }
            | WalPayload::Checkpoint {
                root_page,
                next_page_id,
            } => {
                w.put_u32(*root_page);
                w.put_u32(*next_page_id);
            }
        }
        let checksum = crc32fast::hash(w.as_bytes());
        w.put_u32(checksum);
        w.into_bytes()
    }

    /// Parse one record from the start of `bytes`, verifying the CRC.
    /// Returns the record and the number of bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), WalError> {
        let mut r = Reader::new(bytes);
        let lsn = r.read_u64()?;
        let kind = WalKind::try_from(r.read_u8()?).map_err(WalError::InvalidRecordKind)?;
        let payload = match kind {
            WalKind::Insert => WalPayload::Insert {
                key: r.read_u64()?,
                record: r.read_len_prefixed()?.to_vec(),
            },
            WalKind::Update => WalPayload::Update {
                key: r.read_u64()?,
                record: r.read_len_prefixed()?.to_vec(),
            },
            WalKind::Delete => WalPayload::Delete { key: r.read_u64()? },
            WalKind::Vacuum => WalPayload::Vacuum {
                root_page: r.read_u32()?,
                next_page_id: r.read_u32()?,
            },
            WalKind::Checkpoint => WalPayload::Checkpoint {
                root_page: r.read_u32()?,
                next_page_id: r.read_u32()?,
            },
        };

        let body_len = r.position();
        let stored = r.read_u32()?;
        let computed = crc32fast::hash(&bytes[..body_len]);
        if stored != computed {
            return Err(WalError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        Ok((Self { lsn, payload }, body_len + 4))
    }
}

/// Read every intact record from a WAL file. Parsing stops at the first
/// record that fails framing, kind, LSN, or CRC validation; such a suffix
/// is a torn tail from a crash mid-append and is discarded.
pub fn read_log(path: &Path) -> Result<Vec<WalRecord>, WalError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read(path).map_err(WalError::Io)?;

    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        match WalRecord::from_bytes(&data[offset..]) {
            Ok((record, consumed)) if record.lsn == offset as u64 => {
                records.push(record);
                offset += consumed;
            }
            Ok(_) | Err(_) => {
                tracing::warn!(
                    offset,
                    len = data.len(),
                    "discarding torn WAL tail"
                );
                break;
            }
        }
    }
    Ok(records)
}

/// Commands accepted by the writer task.
enum WalCommand {
    Append {
        payloads: Vec<WalPayload>,
        done: oneshot::Sender<Result<Lsn, WalError>>,
    },
    Truncate {
        done: oneshot::Sender<Result<(), WalError>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Client handle to the WAL writer task.
#[derive(Debug)]
pub struct WalHandle {
    tx: mpsc::Sender<WalCommand>,
    path: PathBuf,
}

impl WalHandle {
    /// Append a batch of records and wait until they are on disk.
    /// Returns the LSN of the last record in the batch.
    pub async fn append(&self, payloads: Vec<WalPayload>) -> Result<Lsn, WalError> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(WalCommand::Append { payloads, done })
            .await
            .map_err(|_| WalError::Closed)?;
        wait.await.map_err(|_| WalError::Closed)?
    }

    /// Truncate the log to zero length (after a checkpoint has made its
    /// contents redundant).
    pub async fn truncate(&self) -> Result<(), WalError> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(WalCommand::Truncate { done })
            .await
            .map_err(|_| WalError::Closed)?;
        wait.await.map_err(|_| WalError::Closed)?
    }

    /// Ask the writer task to exit after the commands already queued.
    pub async fn shutdown(&self) -> Result<(), WalError> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(WalCommand::Shutdown { done })
            .await
            .map_err(|_| WalError::Closed)?;
        wait.await.map_err(|_| WalError::Closed)
    }

    /// Path of the log file this handle writes to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Open (or create) the log file and spawn the writer task that owns it.
pub fn spawn_writer(path: &Path) -> Result<(WalHandle, JoinHandle<()>), WalError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(WalError::Io)?;
    let len = file.metadata().map_err(WalError::Io)?.len();

    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let task = tokio::spawn(writer_loop(file, len, rx));
    Ok((
        WalHandle {
            tx,
            path: path.to_path_buf(),
        },
        task,
    ))
}

/// The writer task: the only code that touches the WAL file. Exits when
/// every handle is dropped (after draining queued commands) or on an
/// explicit shutdown command.
async fn writer_loop(mut file: File, mut len: u64, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            WalCommand::Append { payloads, done } => {
                let result = append_batch(&mut file, &mut len, payloads);
                let _ = done.send(result);
            }
            WalCommand::Truncate { done } => {
                let result = truncate_file(&mut file, &mut len);
                let _ = done.send(result);
            }
            WalCommand::Shutdown { done } => {
                let _ = done.send(());
                break;
            }
        }
    }
}

/// Write every record of one batch, then fsync once.
fn append_batch(file: &mut File, len: &mut u64, payloads: Vec<WalPayload>) -> Result<Lsn, WalError> {
    let mut last_lsn = *len;
    for payload in payloads {
        let record = WalRecord { lsn: *len, payload };
        let bytes = record.to_bytes();
        file.write_all(&bytes).map_err(WalError::Io)?;
        last_lsn = record.lsn;
        *len += bytes.len() as u64;
    }
    file.sync_data().map_err(WalError::Io)?;
    Ok(last_lsn)
}

fn truncate_file(file: &mut File, len: &mut u64) -> Result<(), WalError> {
    file.set_len(0).map_err(WalError::Io)?;
    file.sync_data().map_err(WalError::Io)?;
    *len = 0;
    Ok(())
}

/// Errors from WAL operations.
#[derive(Debug)]
pub enum WalError {
    /// I/O failure in the writer task or replay reader.
    Io(std::io::Error),
    /// Truncated or malformed record bytes.
    Codec(CodecError),
    /// Unknown record kind byte.
    InvalidRecordKind(u8),
    /// Stored CRC does not match the record bytes.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// The writer task is gone.
    Closed,
}

impl std::fmt::Display for WalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "WAL I/O error: {e}"),
            Self::Codec(e) => write!(f, "WAL codec error: {e}"),
            Self::InvalidRecordKind(k) => write!(f, "invalid WAL record kind: {k}"),
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "WAL checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}"
            ),
            Self::Closed => write!(f, "WAL writer has shut down"),
        }
    }
}

impl std::error::Error for WalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for WalError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_roundtrip_insert() {
        let record = WalRecord {
            lsn: 128,
            payload: WalPayload::Insert {
                key: 7,
                record: b"payload".to_vec(),
            },
        };
        let bytes = record.to_bytes();
        let (decoded, consumed) = WalRecord::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_record_roundtrip_all_kinds() {
        let payloads = [
            WalPayload::Insert {
                key: 1,
                record: vec![1, 2, 3],
            },
            WalPayload::Delete { key: 2 },
            WalPayload::Update {
                key: 3,
                record: vec![],
            },
            WalPayload::Vacuum {
                root_page: 4,
                next_page_id: 17,
            },
            WalPayload::Checkpoint {
                root_page: 9,
                next_page_id: 33,
            },
        ];
        for payload in payloads {
            let record = WalRecord { lsn: 0, payload };
            let bytes = record.to_bytes();
            let (decoded, _) = WalRecord::from_bytes(&bytes).unwrap();
            assert_eq!(decoded, record);
        }
    }

    #[test]
    fn test_corrupted_record_fails_checksum() {
        let record = WalRecord {
            lsn: 0,
            payload: WalPayload::Delete { key: 9 },
        };
        let mut bytes = record.to_bytes();
        bytes[9] ^= 0xFF;
        assert!(matches!(
            WalRecord::from_bytes(&bytes),
            Err(WalError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_append_assigns_offsets_as_lsns() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("t.wal");
        let (handle, task) = spawn_writer(&path).expect("spawn");

        let first = handle
            .append(vec![WalPayload::Delete { key: 1 }])
            .await
            .expect("append");
        assert_eq!(first, 0);

        let second = handle
            .append(vec![WalPayload::Delete { key: 2 }])
            .await
            .expect("append");
        assert!(second > 0, "second record starts past the first");

        let records = read_log(&path).expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].lsn, 0);
        assert_eq!(records[1].lsn, second);

        handle.shutdown().await.expect("shutdown");
        task.await.expect("join");
    }

    #[tokio::test]
    async fn test_batch_is_contiguous() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("t.wal");
        let (handle, task) = spawn_writer(&path).expect("spawn");

        handle
            .append(vec![
                WalPayload::Insert {
                    key: 1,
                    record: b"a".to_vec(),
                },
                WalPayload::Insert {
                    key: 2,
                    record: b"b".to_vec(),
                },
                WalPayload::Delete { key: 1 },
            ])
            .await
            .expect("append");

        let records = read_log(&path).expect("read");
        assert_eq!(records.len(), 3);
        // Each record's LSN equals its byte offset.
        let mut expected = 0u64;
        for record in &records {
            assert_eq!(record.lsn, expected);
            expected += record.to_bytes().len() as u64;
        }

        handle.shutdown().await.expect("shutdown");
        task.await.expect("join");
    }

    #[tokio::test]
    async fn test_truncate_empties_the_log() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("t.wal");
        let (handle, task) = spawn_writer(&path).expect("spawn");

        handle
            .append(vec![WalPayload::Delete { key: 1 }])
            .await
            .expect("append");
        handle.truncate().await.expect("truncate");
        assert!(read_log(&path).expect("read").is_empty());

        // LSN assignment restarts at offset zero.
        let lsn = handle
            .append(vec![WalPayload::Delete { key: 2 }])
            .await
            .expect("append");
        assert_eq!(lsn, 0);

        handle.shutdown().await.expect("shutdown");
        task.await.expect("join");
    }

    #[tokio::test]
    async fn test_torn_tail_is_discarded() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("t.wal");
        let (handle, task) = spawn_writer(&path).expect("spawn");

        handle
            .append(vec![
                WalPayload::Insert {
                    key: 1,
                    record: b"kept".to_vec(),
                },
                WalPayload::Insert {
                    key: 2,
                    record: b"kept too".to_vec(),
                },
            ])
            .await
            .expect("append");
        handle.shutdown().await.expect("shutdown");
        task.await.expect("join");

        // Simulate a crash mid-append: a record missing its tail.
        let intact = std::fs::read(&path).expect("read file");
        let torn = WalRecord {
            lsn: intact.len() as u64,
            payload: WalPayload::Insert {
                key: 3,
                record: b"lost".to_vec(),
            },
        };
        let torn_bytes = torn.to_bytes();
        let mut data = intact;
        data.extend_from_slice(&torn_bytes[..torn_bytes.len() - 5]);
        std::fs::write(&path, &data).expect("write torn");

        let records = read_log(&path).expect("read");
        assert_eq!(records.len(), 2);
        assert!(matches!(
            &records[1].payload,
            WalPayload::Insert { key: 2, .. }
        ));
    }

    #[test]
    fn test_read_log_missing_file_is_empty() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("nope.wal");
        assert!(read_log(&path).expect("read").is_empty());
    }

    #[tokio::test]
    async fn test_append_after_reopen_continues_offsets() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("t.wal");

        {
            let (handle, task) = spawn_writer(&path).expect("spawn");
            handle
                .append(vec![WalPayload::Delete { key: 1 }])
                .await
                .expect("append");
            handle.shutdown().await.expect("shutdown");
            task.await.expect("join");
        }

        let (handle, task) = spawn_writer(&path).expect("respawn");
        let lsn = handle
            .append(vec![WalPayload::Delete { key: 2 }])
            .await
            .expect("append");
        assert!(lsn > 0, "LSNs continue from the existing file length");

        let records = read_log(&path).expect("read");
        assert_eq!(records.len(), 2);

        handle.shutdown().await.expect("shutdown");
        task.await.expect("join");
    }
}
