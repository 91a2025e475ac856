//! Durable log entry model.
//!
//! Every effect a transaction records (reads, deferred writes, object
//! creation, persistence and destruction calls, and the user's conflict
//! resolutions) is a tagged [`LogEntry`]. Entries are self-describing
//! serde records so any adapter can persist and replay them.

mod entry;

pub use entry::{EntryKind, LogEntry};
