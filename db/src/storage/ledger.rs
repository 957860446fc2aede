use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::Utc;
use tracing::{info, warn};

use crate::{
    models::{ProgressDocument, ProgressEntry},
    storage::{StoreError, lock, read_document, write_document},
};

/// Durable per-machine-code activation counters.
///
/// Counts only ever go up. Each increment is persisted immediately; if the
/// write fails the increment is kept in memory (so this process keeps
/// enforcing quotas correctly) and the next successful write carries it to
/// disk.
#[derive(Debug)]
pub struct ProgressLedger {
    path: PathBuf,
    doc: Mutex<ProgressDocument>,
}

/// Outcome of [`ProgressLedger::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// The count was incremented to the contained value.
    Incremented(u32),

    /// The count is already at the cap and was left unchanged.
    AtCap(u32),
}

impl ProgressLedger {
    /// Open the ledger at `path`. A missing file yields an empty ledger.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let doc = read_document(&path)?;
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Activation count for `machine_code`, `0` if never seen.
    pub fn count(&self, machine_code: &str) -> u32 {
        lock(&self.doc)
            .records
            .get(machine_code)
            .map(|entry| entry.count)
            .unwrap_or(0)
    }

    pub fn entry(&self, machine_code: &str) -> Option<ProgressEntry> {
        lock(&self.doc).records.get(machine_code).cloned()
    }

    pub fn snapshot(&self) -> ProgressDocument {
        lock(&self.doc).clone()
    }

    /// Record one successful activation of `machine_code` by `identity_id`,
    /// never pushing the count past `cap`.
    ///
    /// An `Err` means the increment happened in memory but could not be
    /// written; the caller should log it and carry on.
    pub fn record(
        &self,
        machine_code: &str,
        identity_id: u32,
        cap: u32,
    ) -> Result<Recorded, StoreError> {
        let mut doc = lock(&self.doc);
        let now = Utc::now();

        let entry = doc
            .records
            .entry(machine_code.to_string())
            .or_insert_with(|| ProgressEntry {
                count: 0,
                identity_id: None,
                updated_at: now,
            });

        if entry.count >= cap {
            warn!(
                machine_code = %short_code(machine_code),
                count = entry.count,
                cap,
                "machine code already at quota"
            );
            return Ok(Recorded::AtCap(entry.count));
        }

        entry.count += 1;
        entry.identity_id = Some(identity_id);
        entry.updated_at = now;
        let count = entry.count;
        doc.last_update = Some(now);

        info!(machine_code = %short_code(machine_code), count, "recorded activation");

        write_document(&self.path, &*doc)?;
        Ok(Recorded::Incremented(count))
    }

    /// Write the in-memory ledger to disk.
    pub fn save(&self) -> Result<(), StoreError> {
        let doc = lock(&self.doc);
        write_document(&self.path, &*doc)
    }

    /// One-line human summary, e.g. `3 machine codes, 5 activations total`.
    pub fn summary(&self) -> String {
        let doc = lock(&self.doc);
        format!(
            "{} machine codes, {} activations total",
            doc.records.len(),
            doc.total_activations()
        )
    }
}

/// First eight characters of a machine code, for log lines.
pub fn short_code(machine_code: &str) -> String {
    let mut short: String = machine_code.chars().take(8).collect();
    if machine_code.chars().count() > 8 {
        short.push_str("...");
    }
    short
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_in(dir: &tempfile::TempDir) -> ProgressLedger {
        ProgressLedger::open(dir.path().join("machine_codes.json")).unwrap()
    }

    #[test]
    fn test_same_code_twice_updates_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);

        assert_eq!(ledger.record("CODE-A", 1, 5).unwrap(), Recorded::Incremented(1));
        assert_eq!(ledger.record("CODE-A", 1, 5).unwrap(), Recorded::Incremented(2));

        let doc = ledger.snapshot();
        assert_eq!(doc.records.len(), 1);
        assert_eq!(doc.records["CODE-A"].count, 2);

        let raw = std::fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(raw.matches("CODE-A").count(), 1);
    }

    #[test]
    fn test_record_never_exceeds_cap() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);

        for _ in 0..5 {
            ledger.record("CODE-B", 3, 2).unwrap();
        }

        assert_eq!(ledger.count("CODE-B"), 2);
        assert_eq!(ledger.record("CODE-B", 3, 2).unwrap(), Recorded::AtCap(2));
    }

    #[test]
    fn test_counts_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);
        ledger.record("CODE-C", 4, 10).unwrap();
        ledger.record("CODE-D", 5, 10).unwrap();
        ledger.record("CODE-D", 6, 10).unwrap();

        let reopened = ledger_in(&dir);
        assert_eq!(reopened.count("CODE-C"), 1);
        assert_eq!(reopened.count("CODE-D"), 2);
        assert_eq!(reopened.entry("CODE-D").unwrap().identity_id, Some(6));
        assert!(reopened.snapshot().last_update.is_some());
    }

    #[test]
    fn test_failed_write_keeps_increment_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        let ledger = ProgressLedger::open(blocker.join("machine_codes.json")).unwrap();
        std::fs::write(&blocker, b"").unwrap();

        let err = ledger.record("CODE-E", 1, 3).unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
        assert_eq!(ledger.count("CODE-E"), 1);
    }

    #[test]
    fn test_unknown_code_counts_zero() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);

        assert_eq!(ledger.count("never-seen"), 0);
        assert!(ledger.entry("never-seen").is_none());
    }

    #[test]
    fn test_summary() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);
        ledger.record("CODE-F", 1, 5).unwrap();
        ledger.record("CODE-F", 1, 5).unwrap();
        ledger.record("CODE-G", 2, 5).unwrap();

        assert_eq!(ledger.summary(), "2 machine codes, 3 activations total");
    }

    #[test]
    fn test_short_code() {
        assert_eq!(short_code("ABCDEFGHIJ"), "ABCDEFGH...");
        assert_eq!(short_code("ABC"), "ABC");
    }
}
