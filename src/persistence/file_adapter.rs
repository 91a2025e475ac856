use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::journal::LogEntry;
use crate::persistence::{fs_escape, fs_unescape, LockGuard, LockRegistry, PersistenceAdapter};

const TRANSACTIONS_DIR: &str = "transactions";
const LOCKS_DIR: &str = "locks";
const INFORMATION_FILE: &str = "information.json";
const ENTRY_PREFIX: &str = "entry_";
const GLOBAL_LOCK: &str = "global";

/// Metadata record written once per persisted section.
#[derive(Debug, Serialize, Deserialize)]
struct SectionInformation {
    transaction_identifier: String,
    savepoint: String,
    savepoint_version: u64,
    created_at: DateTime<Utc>,
}

/// File-based persistence adapter.
///
/// Layout under the storage root:
///
/// ```text
/// transactions/<tx>/<version>/information.json
/// transactions/<tx>/<version>/entry_NNNNNN.json
/// locks/<name>.lock
/// ```
///
/// One directory per transaction, one subdirectory per section, one file
/// per entry; the entry file stem becomes the `entry_identifier`. Advisory
/// locks are file locks under `locks/`.
pub struct FileAdapter {
    root: PathBuf,
    locks: Arc<LockRegistry>,
    queue: Mutex<Vec<LogEntry>>,
}

impl FileAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(TRANSACTIONS_DIR))?;
        let locks = Arc::new(LockRegistry::new(root.join(LOCKS_DIR))?);
        Ok(Self {
            root,
            locks,
            queue: Mutex::new(Vec::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn transaction_dir(&self, transaction: &str) -> PathBuf {
        self.root.join(TRANSACTIONS_DIR).join(fs_escape(transaction))
    }

    fn section_dir(&self, transaction: &str, savepoint_version: u64) -> PathBuf {
        self.transaction_dir(transaction)
            .join(savepoint_version.to_string())
    }

    fn write_section_information(&self, dir: &Path, entry: &LogEntry) -> Result<()> {
        let path = dir.join(INFORMATION_FILE);
        if path.exists() {
            return Ok(());
        }
        let information = SectionInformation {
            transaction_identifier: entry.transaction_identifier.clone(),
            savepoint: entry.savepoint.clone(),
            savepoint_version: entry.savepoint_version,
            created_at: Utc::now(),
        };
        fs::write(&path, serde_json::to_vec_pretty(&information)?)?;
        Ok(())
    }
}

impl PersistenceAdapter for FileAdapter {
    fn enqueue(&self, entry: LogEntry) -> Result<()> {
        let mut queue = self.queue.lock();
        let duplicate = queue.iter().any(|queued| {
            queued.transaction_identifier == entry.transaction_identifier
                && queued.savepoint_version == entry.savepoint_version
                && queued.sequence == entry.sequence
        });
        if duplicate {
            return Err(Error::persistence(format!(
                "entry {}#{} is already enqueued",
                entry.savepoint, entry.sequence
            )));
        }
        queue.push(entry);
        Ok(())
    }

    fn persist(&self) -> Result<usize> {
        let entries = self.queue.lock().clone();
        if entries.is_empty() {
            return Ok(0);
        }

        for entry in &entries {
            let _transaction_lock =
                self.lock_transaction(&entry.transaction_identifier, true)?;

            let dir = self.section_dir(&entry.transaction_identifier, entry.savepoint_version);
            fs::create_dir_all(&dir)?;
            self.write_section_information(&dir, entry)?;

            let identifier = format!("{}{:06}", ENTRY_PREFIX, entry.sequence);
            let mut record = entry.clone();
            record.entry_identifier = Some(identifier.clone());
            record.transaction_persisted = true;
            fs::write(
                dir.join(format!("{}.json", identifier)),
                serde_json::to_vec_pretty(&record)?,
            )?;
        }

        let count = entries.len();
        self.queue.lock().clear();
        tracing::debug!(count, "flushed log entries to disk");
        Ok(count)
    }

    fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    fn transaction_identifiers(&self) -> Result<Vec<String>> {
        let _global = self.lock_global(true)?;

        let mut identifiers = Vec::new();
        for dir_entry in fs::read_dir(self.root.join(TRANSACTIONS_DIR))? {
            let dir_entry = dir_entry?;
            if dir_entry.file_type()?.is_dir() {
                identifiers.push(fs_unescape(&dir_entry.file_name().to_string_lossy()));
            }
        }
        identifiers.sort();
        Ok(identifiers)
    }

    fn savepoints(&self, transaction: &str) -> Result<Vec<u64>> {
        let _transaction_lock = self.lock_transaction(transaction, true)?;

        let dir = self.transaction_dir(transaction);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut versions = Vec::new();
        for dir_entry in fs::read_dir(&dir)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(version) = dir_entry.file_name().to_string_lossy().parse::<u64>() {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    fn log_entries(&self, transaction: &str, savepoint_version: u64) -> Result<Vec<LogEntry>> {
        let dir = self.section_dir(transaction, savepoint_version);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for dir_entry in fs::read_dir(&dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(ENTRY_PREFIX) && name.ends_with(".json") {
                files.push((name, dir_entry.path()));
            }
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut entries = Vec::with_capacity(files.len());
        for (_, path) in files {
            let raw = fs::read(&path)?;
            entries.push(serde_json::from_slice(&raw)?);
        }
        Ok(entries)
    }

    fn reset_transaction(&self, transaction: &str) -> Result<()> {
        let _transaction_lock = self.lock_transaction(transaction, true)?;

        self.queue
            .lock()
            .retain(|entry| entry.transaction_identifier != transaction);

        match fs::remove_dir_all(self.transaction_dir(transaction)) {
            Ok(()) => Ok(()),
            Err(cause) if cause.kind() == ErrorKind::NotFound => Ok(()),
            Err(cause) => Err(cause.into()),
        }
    }

    fn lock_global(&self, suspend: bool) -> Result<LockGuard> {
        self.locks
            .acquire(crate::error::LockKind::Global, GLOBAL_LOCK, suspend)
    }

    fn lock_transaction(&self, transaction: &str, suspend: bool) -> Result<LockGuard> {
        self.locks.acquire(
            crate::error::LockKind::Transaction,
            &format!("transaction_{}", transaction),
            suspend,
        )
    }

    fn lock_object(&self, object_key: &str, suspend: bool) -> Result<LockGuard> {
        self.locks.acquire(
            crate::error::LockKind::Object,
            &format!("object_{}", object_key),
            suspend,
        )
    }
}

impl std::fmt::Debug for FileAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAdapter")
            .field("root", &self.root)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::common;
    use crate::journal::EntryKind;

    fn entry(transaction: &str, version: u64, sequence: u64, kind: EntryKind) -> LogEntry {
        LogEntry {
            transaction_identifier: transaction.to_string(),
            savepoint: common::savepoint_name(transaction, version),
            savepoint_version: version,
            sequence,
            entry_identifier: None,
            object_key: "User/1".to_string(),
            attribute_key: Some("User/1/first".to_string()),
            new_object: false,
            object_persisted: true,
            transaction_persisted: false,
            kind,
        }
    }

    fn read_entry(transaction: &str, version: u64, sequence: u64) -> LogEntry {
        entry(
            transaction,
            version,
            sequence,
            EntryKind::AttributeRead {
                value: json!("John"),
                method: "first".to_string(),
            },
        )
    }

    fn adapter() -> (tempfile::TempDir, FileAdapter) {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileAdapter::new(dir.path().join("store")).unwrap();
        (dir, adapter)
    }

    #[test]
    fn test_persist_assigns_identifiers_and_round_trips() {
        let (_dir, adapter) = adapter();

        adapter.enqueue(read_entry("tr1", 1, 1)).unwrap();
        adapter
            .enqueue(entry(
                "tr1",
                1,
                2,
                EntryKind::AttributeChange {
                    old_value: json!("John"),
                    new_value: json!("Foo"),
                    method: "first=".to_string(),
                },
            ))
            .unwrap();

        assert_eq!(adapter.pending(), 2);
        assert_eq!(adapter.persist().unwrap(), 2);
        assert_eq!(adapter.pending(), 0);

        let reloaded = adapter.log_entries("tr1", 1).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded[0].entry_identifier.as_deref(), Some("entry_000001"));
        assert!(reloaded.iter().all(|e| e.transaction_persisted));
        assert_eq!(reloaded[1].kind.name(), "attribute_change");
    }

    #[test]
    fn test_persist_is_idempotent_on_empty_queue() {
        let (_dir, adapter) = adapter();
        assert_eq!(adapter.persist().unwrap(), 0);
        assert_eq!(adapter.persist().unwrap(), 0);
    }

    #[test]
    fn test_double_enqueue_is_a_contract_violation() {
        let (_dir, adapter) = adapter();
        adapter.enqueue(read_entry("tr1", 1, 1)).unwrap();
        let err = adapter.enqueue(read_entry("tr1", 1, 1)).unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
    }

    #[test]
    fn test_savepoints_are_sorted() {
        let (_dir, adapter) = adapter();
        for version in [2, 1, 10] {
            adapter.enqueue(read_entry("tr1", version, 1)).unwrap();
        }
        adapter.persist().unwrap();

        assert_eq!(adapter.savepoints("tr1").unwrap(), vec![1, 2, 10]);
        assert!(adapter.savepoints("unknown").unwrap().is_empty());
    }

    #[test]
    fn test_transaction_identifiers_unescape() {
        let (_dir, adapter) = adapter();
        adapter.enqueue(read_entry("tr:1", 1, 1)).unwrap();
        adapter.enqueue(read_entry("tr-2", 1, 1)).unwrap();
        adapter.persist().unwrap();

        assert_eq!(
            adapter.transaction_identifiers().unwrap(),
            vec!["tr-2".to_string(), "tr:1".to_string()]
        );
    }

    #[test]
    fn test_reset_transaction_removes_state_and_queue() {
        let (_dir, adapter) = adapter();
        adapter.enqueue(read_entry("tr1", 1, 1)).unwrap();
        adapter.persist().unwrap();
        adapter.enqueue(read_entry("tr1", 2, 1)).unwrap();

        adapter.reset_transaction("tr1").unwrap();
        assert_eq!(adapter.pending(), 0);
        assert!(adapter.savepoints("tr1").unwrap().is_empty());
        assert!(adapter.transaction_identifiers().unwrap().is_empty());

        // Resetting an unknown transaction is not an error.
        adapter.reset_transaction("tr1").unwrap();
    }

    #[test]
    fn test_log_entries_of_unknown_section_are_empty() {
        let (_dir, adapter) = adapter();
        assert!(adapter.log_entries("tr1", 1).unwrap().is_empty());
    }
}
