//! Durable persistence and advisory locking.
//!
//! An adapter stores log entries and savepoints so transactions survive
//! process boundaries, and exposes the three advisory lock scopes the
//! engine relies on. The reference implementation is the file-based
//! [`FileAdapter`]; any store honouring the [`PersistenceAdapter`]
//! contract is acceptable.

mod file_adapter;
mod file_lock;

pub use file_adapter::FileAdapter;
pub use file_lock::{LockGuard, LockRegistry};

use crate::error::Result;
use crate::journal::LogEntry;

/// Contract between the engine and a durable store.
///
/// Lock guards are RAII: release happens on drop, covering every exit path.
/// All locks are re-entrant within the holding thread and exclude other
/// threads and other processes.
pub trait PersistenceAdapter: Send + Sync {
    /// Adds an entry to the pending queue. Enqueueing the same entry
    /// (transaction, savepoint version, sequence) twice is a contract
    /// violation.
    fn enqueue(&self, entry: LogEntry) -> Result<()>;

    /// Flushes the pending queue, tagging each entry with a section-unique
    /// `entry_identifier`. The caller must hold the transaction lock.
    /// Idempotent on an empty queue; returns the number of flushed entries.
    fn persist(&self) -> Result<usize>;

    /// Number of entries currently enqueued.
    fn pending(&self) -> usize;

    /// Identifiers of all transactions with any persisted section.
    fn transaction_identifiers(&self) -> Result<Vec<String>>;

    /// Persisted savepoint versions of a transaction, ascending.
    fn savepoints(&self, transaction: &str) -> Result<Vec<u64>>;

    /// Entries previously persisted for one section, in insertion order.
    fn log_entries(&self, transaction: &str, savepoint_version: u64) -> Result<Vec<LogEntry>>;

    /// Removes all persisted state of a transaction, including anything
    /// still enqueued for it.
    fn reset_transaction(&self, transaction: &str) -> Result<()>;

    /// Serializes transaction enumeration.
    fn lock_global(&self, suspend: bool) -> Result<LockGuard>;

    /// Guards one transaction's persisted state.
    fn lock_transaction(&self, transaction: &str, suspend: bool) -> Result<LockGuard>;

    /// Guards one object during commit.
    fn lock_object(&self, object_key: &str, suspend: bool) -> Result<LockGuard>;
}

/// Escapes a name for use as a file-system path component. Alphanumerics,
/// `.`, `_`, and `-` pass through; every other byte becomes `%XX`.
pub(crate) fn fs_escape(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                escaped.push(byte as char)
            }
            other => escaped.push_str(&format!("%{:02X}", other)),
        }
    }
    escaped
}

/// Reverses [`fs_escape`].
pub(crate) fn fs_unescape(escaped: &str) -> String {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(high), Some(low)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push((high * 16 + low) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_escape_round_trip() {
        for name in ["tr1", "User/42", "object_User/new_00001", "a b%c"] {
            let escaped = fs_escape(name);
            assert!(!escaped.contains('/'));
            assert!(!escaped.contains(' '));
            assert_eq!(fs_unescape(&escaped), name);
        }
    }

    #[test]
    fn test_fs_escape_is_stable_for_plain_names() {
        assert_eq!(fs_escape("transaction_tr-1.a"), "transaction_tr-1.a");
    }
}
