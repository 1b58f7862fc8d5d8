//! Crash recovery.
//!
//! Replay applies WAL records to the tree in log order. INSERT and DELETE
//! are idempotent under their error rules: a record whose effect already
//! reached the data file replays as `DuplicateKey` or `NotFound`, which
//! recovery counts as redundant rather than failing. CHECKPOINT records
//! carry no replay action (everything before one is already durable in the
//! data file), and VACUUM is a marker only: the rebuilt data file replaced
//! the old one atomically, so replay continues against whichever file
//! survived.

use crate::tree::{BPlusTree, TreeError};
use crate::wal::{Lsn, WalRecord, WalPayload};

/// Statistics from one replay pass.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Total records read from the log.
    pub records_scanned: usize,
    /// Inserts applied to the tree.
    pub inserts_applied: usize,
    /// Deletes applied to the tree.
    pub deletes_applied: usize,
    /// Records whose effect was already present in the data file.
    pub redundant: usize,
    /// Highest LSN seen.
    pub last_lsn: Lsn,
}

impl RecoveryReport {
    /// Whether replay changed the tree at all.
    #[must_use]
    pub const fn changed_anything(&self) -> bool {
        self.inserts_applied > 0 || self.deletes_applied > 0
    }
}

/// Apply `records` to `tree` in order.
pub fn replay(tree: &mut BPlusTree, records: &[WalRecord]) -> Result<RecoveryReport, TreeError> {
    let mut report = RecoveryReport {
        records_scanned: records.len(),
        ..RecoveryReport::default()
    };

    for record in records {
        report.last_lsn = report.last_lsn.max(record.lsn);
        match &record.payload {
            WalPayload::Insert { key, record: bytes } => {
                match tree.insert(*key, bytes) {
                    Ok(()) => report.inserts_applied += 1,
                    Err(TreeError::DuplicateKey(_)) => report.redundant += 1,
                    Err(e) => return Err(e),
                }
            }
            WalPayload::Delete { key } => match tree.delete(*key) {
                Ok(()) => report.deletes_applied += 1,
                Err(TreeError::NotFound(_)) => report.redundant += 1,
                Err(e) => return Err(e),
            },
            WalPayload::Update { key, .. } => {
                // Reserved kind; nothing writes it today.
                tracing::debug!(key = *key, lsn = record.lsn, "skipping reserved UPDATE record");
            }
            WalPayload::Checkpoint { .. } | WalPayload::Vacuum { .. } => {}
        }
    }

    if report.changed_anything() {
        tracing::info!(
            scanned = report.records_scanned,
            inserts = report.inserts_applied,
            deletes = report.deletes_applied,
            redundant = report.redundant,
            "replayed write-ahead log"
        );
    }
    Ok(report)
}
