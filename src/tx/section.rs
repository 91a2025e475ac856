use std::collections::HashMap;
use std::sync::Arc;

use crate::common::{self, Position, Value};
use crate::error::{Error, Result};
use crate::journal::{EntryKind, LogEntry};
use crate::persistence::PersistenceAdapter;
use crate::proxy::DomainObject;

/// One contiguous execution slice of a transaction (a savepoint).
///
/// A section owns its log entries plus the state derived from them: the
/// read and write sets, the user's integrity overrides, and change vetoes.
/// The current section of a transaction is mutable until it is flushed to
/// the adapter; sections loaded back from the adapter are immutable.
#[derive(Debug, Clone)]
pub struct Section {
    transaction_identifier: String,
    savepoint_version: u64,
    entries: Vec<LogEntry>,
    read_set: HashMap<String, Value>,
    write_set: HashMap<String, Value>,
    read_integrity_overrides: HashMap<String, Value>,
    attribute_change_vetoes: HashMap<String, Value>,
    recently_initialized: Vec<String>,
    persisted: bool,
}

impl Section {
    pub fn new(transaction_identifier: &str, savepoint_version: u64) -> Self {
        Self {
            transaction_identifier: transaction_identifier.to_string(),
            savepoint_version,
            entries: Vec::new(),
            read_set: HashMap::new(),
            write_set: HashMap::new(),
            read_integrity_overrides: HashMap::new(),
            attribute_change_vetoes: HashMap::new(),
            recently_initialized: Vec::new(),
            persisted: false,
        }
    }

    /// Reconstructs a section from entries previously flushed to an
    /// adapter. Replaying the entries re-derives the read/write sets,
    /// overrides, and vetoes, so a resumed transaction observes the same
    /// effective state it persisted.
    pub fn from_persisted(
        transaction_identifier: &str,
        savepoint_version: u64,
        entries: Vec<LogEntry>,
    ) -> Self {
        let mut section = Self::new(transaction_identifier, savepoint_version);
        for entry in entries {
            section.replay(entry);
        }
        section.persisted = true;
        section
    }

    fn replay(&mut self, entry: LogEntry) {
        if let Some(attribute_key) = entry.attribute_key.clone() {
            match &entry.kind {
                EntryKind::AttributeRead { value, .. } => {
                    self.read_set.insert(attribute_key, value.clone());
                }
                EntryKind::AttributeChange { new_value, .. } => {
                    self.write_set.insert(attribute_key, new_value.clone());
                }
                EntryKind::ReadIntegrityOverride { external_value } => {
                    self.read_integrity_overrides
                        .insert(attribute_key, external_value.clone());
                }
                EntryKind::AttributeChangeVeto { external_value } => {
                    self.attribute_change_vetoes
                        .insert(attribute_key.clone(), external_value.clone());
                    self.write_set.remove(&attribute_key);
                }
                _ => {}
            }
        } else if entry.is_object_initialization() {
            self.recently_initialized.push(entry.object_key.clone());
        }
        self.entries.push(entry);
    }

    pub fn savepoint(&self) -> String {
        common::savepoint_name(&self.transaction_identifier, self.savepoint_version)
    }

    pub fn savepoint_version(&self) -> u64 {
        self.savepoint_version
    }

    pub fn persisted(&self) -> bool {
        self.persisted
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn read_set(&self) -> &HashMap<String, Value> {
        &self.read_set
    }

    pub fn write_set(&self) -> &HashMap<String, Value> {
        &self.write_set
    }

    pub fn read_integrity_overrides(&self) -> &HashMap<String, Value> {
        &self.read_integrity_overrides
    }

    pub fn attribute_change_vetoes(&self) -> &HashMap<String, Value> {
        &self.attribute_change_vetoes
    }

    pub fn recently_initialized(&self) -> &[String] {
        &self.recently_initialized
    }

    fn push_entry(
        &mut self,
        object_key: &str,
        attribute_key: Option<String>,
        new_object: bool,
        object_persisted: bool,
        kind: EntryKind,
    ) {
        let sequence = self.entries.len() as u64 + 1;
        tracing::trace!(
            savepoint = %self.savepoint(),
            sequence,
            kind = kind.name(),
            object_key,
            "logging entry"
        );
        self.entries.push(LogEntry {
            transaction_identifier: self.transaction_identifier.clone(),
            savepoint: self.savepoint(),
            savepoint_version: self.savepoint_version,
            sequence,
            entry_identifier: None,
            object_key: object_key.to_string(),
            attribute_key,
            new_object,
            object_persisted,
            transaction_persisted: false,
            kind,
        });
    }

    /// Records an attribute read. Idempotent for an attribute as long as no
    /// other entry for it intervened since an identical read.
    pub fn log_attribute_read(
        &mut self,
        object_key: &str,
        new_object: bool,
        attribute: &str,
        value: Value,
        method: &str,
    ) {
        self.log_attribute_read_entry(object_key, new_object, attribute, value, method, false);
    }

    fn log_attribute_read_entry(
        &mut self,
        object_key: &str,
        new_object: bool,
        attribute: &str,
        value: Value,
        method: &str,
        object_persisted: bool,
    ) {
        let attribute_key = common::attribute_key(object_key, attribute);

        let redundant = self
            .entries
            .iter()
            .rev()
            .find(|entry| entry.attribute_key.as_deref() == Some(attribute_key.as_str()))
            .map(|entry| matches!(&entry.kind, EntryKind::AttributeRead { value: prior, .. } if *prior == value))
            .unwrap_or(false);
        if redundant {
            return;
        }

        self.push_entry(
            object_key,
            Some(attribute_key.clone()),
            new_object,
            object_persisted,
            EntryKind::AttributeRead {
                value: value.clone(),
                method: method.to_string(),
            },
        );
        self.read_set.insert(attribute_key, value);
    }

    /// Records an attribute change.
    ///
    /// When the transaction never read the attribute, the old value is
    /// logged as a read first: the caller observed it before changing it.
    /// Writing back the identical value produces no change entry.
    pub fn log_attribute_change(
        &mut self,
        object_key: &str,
        new_object: bool,
        attribute: &str,
        old_value: Value,
        new_value: Value,
        method: &str,
        had_prior_read_in_transaction: bool,
    ) {
        let attribute_key = common::attribute_key(object_key, attribute);

        if !had_prior_read_in_transaction {
            self.log_attribute_read(object_key, new_object, attribute, old_value.clone(), attribute);
        }
        if old_value == new_value {
            return;
        }

        self.push_entry(
            object_key,
            Some(attribute_key.clone()),
            new_object,
            false,
            EntryKind::AttributeChange {
                old_value,
                new_value: new_value.clone(),
                method: method.to_string(),
            },
        );
        self.write_set.insert(attribute_key, new_value);
    }

    /// Records that an object was born in this transaction.
    pub fn log_object_initialization(&mut self, object_key: &str, method: &str) {
        self.push_entry(
            object_key,
            None,
            true,
            false,
            EntryKind::ObjectInitialization {
                method: method.to_string(),
            },
        );
        self.recently_initialized.push(object_key.to_string());
    }

    /// Records a persistence call. Every earlier entry of the object and
    /// every earlier attribute read in this section become persist-required:
    /// a persistence call commits its read dependencies too.
    pub fn log_object_persistence(
        &mut self,
        object_key: &str,
        new_object: bool,
        method: &str,
        args: Vec<Value>,
    ) {
        self.mark_object_persisted(object_key);
        self.push_entry(
            object_key,
            None,
            new_object,
            true,
            EntryKind::ObjectPersistence {
                method: method.to_string(),
                args,
            },
        );
    }

    /// Records a destruction call, with the same persistence propagation as
    /// [`log_object_persistence`](Self::log_object_persistence).
    pub fn log_object_destruction(&mut self, object_key: &str, new_object: bool, method: &str) {
        self.mark_object_persisted(object_key);
        self.push_entry(
            object_key,
            None,
            new_object,
            true,
            EntryKind::ObjectDestruction {
                method: method.to_string(),
            },
        );
    }

    fn mark_object_persisted(&mut self, object_key: &str) {
        for entry in &mut self.entries {
            if entry.object_key == object_key || entry.is_attribute_read() {
                entry.object_persisted = true;
            }
        }
    }

    /// Records the user's acknowledgment of an external change. With
    /// `update_value`, the external value also becomes the transaction's
    /// current read value.
    pub fn log_read_integrity_override(
        &mut self,
        object_key: &str,
        new_object: bool,
        attribute: &str,
        external_value: Value,
        update_value: bool,
        read_method: &str,
    ) {
        let attribute_key = common::attribute_key(object_key, attribute);
        self.push_entry(
            object_key,
            Some(attribute_key.clone()),
            new_object,
            false,
            EntryKind::ReadIntegrityOverride {
                external_value: external_value.clone(),
            },
        );
        self.read_integrity_overrides
            .insert(attribute_key, external_value.clone());

        if update_value {
            // Refreshed reads from conflict resolution must survive
            // resumption, so they are persist-marked immediately.
            self.log_attribute_read_entry(
                object_key,
                new_object,
                attribute,
                external_value,
                read_method,
                true,
            );
        }
    }

    /// Records the user's decision to discard the transaction's own change
    /// to an attribute. The external value becomes the current read value
    /// and any pending write for the attribute is dropped.
    pub fn log_attribute_change_veto(
        &mut self,
        object_key: &str,
        new_object: bool,
        attribute: &str,
        external_value: Value,
        read_method: &str,
    ) {
        let attribute_key = common::attribute_key(object_key, attribute);
        self.push_entry(
            object_key,
            Some(attribute_key.clone()),
            new_object,
            false,
            EntryKind::AttributeChangeVeto {
                external_value: external_value.clone(),
            },
        );
        self.attribute_change_vetoes
            .insert(attribute_key.clone(), external_value.clone());
        self.write_set.remove(&attribute_key);

        self.log_attribute_read_entry(
            object_key,
            new_object,
            attribute,
            external_value,
            read_method,
            true,
        );
    }

    fn latest_matching(&self, matches: impl Fn(&LogEntry) -> bool) -> Option<&LogEntry> {
        self.entries.iter().rev().find(|entry| matches(entry))
    }

    pub fn latest_read(&self, attribute_key: &str) -> Option<Position> {
        self.latest_matching(|entry| {
            entry.is_attribute_read() && entry.attribute_key.as_deref() == Some(attribute_key)
        })
        .map(LogEntry::position)
    }

    pub fn latest_change(&self, attribute_key: &str) -> Option<Position> {
        self.latest_matching(|entry| {
            entry.is_attribute_change() && entry.attribute_key.as_deref() == Some(attribute_key)
        })
        .map(LogEntry::position)
    }

    pub fn latest_veto(&self, attribute_key: &str) -> Option<Position> {
        self.latest_matching(|entry| {
            matches!(entry.kind, EntryKind::AttributeChangeVeto { .. })
                && entry.attribute_key.as_deref() == Some(attribute_key)
        })
        .map(LogEntry::position)
    }

    pub fn latest_override(&self, attribute_key: &str) -> Option<(Position, Value)> {
        self.latest_matching(|entry| {
            matches!(entry.kind, EntryKind::ReadIntegrityOverride { .. })
                && entry.attribute_key.as_deref() == Some(attribute_key)
        })
        .map(|entry| match &entry.kind {
            EntryKind::ReadIntegrityOverride { external_value } => {
                (entry.position(), external_value.clone())
            }
            _ => (entry.position(), Value::Null),
        })
    }

    /// Enqueues every persist-required entry on the adapter. Returns the
    /// number of enqueued entries.
    pub fn enqueue_persistable(&self, adapter: &dyn PersistenceAdapter) -> Result<usize> {
        let mut count = 0;
        for entry in self.entries.iter().filter(|entry| entry.persist_required()) {
            adapter.enqueue(entry.clone())?;
            count += 1;
        }
        Ok(count)
    }

    /// Marks the section as flushed. A persisted section is immutable.
    pub fn mark_persisted(&mut self) {
        self.persisted = true;
        for entry in &mut self.entries {
            if entry.persist_required() {
                entry.transaction_persisted = true;
            }
        }
    }

    /// Applies every persist-marked entry in insertion order. `resolve`
    /// yields the underlying object for an object key; `vetoed` reports
    /// whether a later veto in the transaction suppresses a change entry.
    /// Marker entries apply as no-ops, so their objects are never resolved.
    pub fn apply_log_entries(
        &self,
        resolve: &dyn Fn(&str) -> Result<Arc<dyn DomainObject>>,
        vetoed: &dyn Fn(&LogEntry) -> bool,
    ) -> Result<()> {
        for entry in self
            .entries
            .iter()
            .filter(|entry| entry.object_persisted && entry.mutates_on_apply())
        {
            let target = resolve(&entry.object_key)?;
            entry.apply(&*target, vetoed(entry))?;
        }
        Ok(())
    }

    /// Empties all pending state. Legal only while the section has not been
    /// flushed; the savepoint number is preserved.
    pub fn reset(&mut self) -> Result<()> {
        if self.persisted {
            return Err(Error::persistence(format!(
                "section {} is already persisted and cannot be reset",
                self.savepoint()
            )));
        }
        self.entries.clear();
        self.read_set.clear();
        self.write_set.clear();
        self.read_integrity_overrides.clear();
        self.attribute_change_vetoes.clear();
        self.recently_initialized.clear();
        Ok(())
    }
}
