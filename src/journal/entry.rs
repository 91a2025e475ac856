use serde::{Deserialize, Serialize};

use crate::common::{self, Position, Value};
use crate::error::Result;
use crate::proxy::DomainObject;

/// The tagged payload of a log entry.
///
/// Reads, overrides, vetoes, and initializations are validators/markers:
/// they carry information for integrity verification and state derivation
/// but perform no work when the log is applied. Changes, persistence calls,
/// and destruction calls mutate the underlying object at commit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryKind {
    AttributeRead {
        value: Value,
        method: String,
    },
    AttributeChange {
        old_value: Value,
        new_value: Value,
        method: String,
    },
    ObjectInitialization {
        method: String,
    },
    ObjectPersistence {
        method: String,
        args: Vec<Value>,
    },
    ObjectDestruction {
        method: String,
    },
    ReadIntegrityOverride {
        external_value: Value,
    },
    AttributeChangeVeto {
        external_value: Value,
    },
}

impl EntryKind {
    /// Short tag used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            EntryKind::AttributeRead { .. } => "attribute_read",
            EntryKind::AttributeChange { .. } => "attribute_change",
            EntryKind::ObjectInitialization { .. } => "object_initialization",
            EntryKind::ObjectPersistence { .. } => "object_persistence",
            EntryKind::ObjectDestruction { .. } => "object_destruction",
            EntryKind::ReadIntegrityOverride { .. } => "read_integrity_override",
            EntryKind::AttributeChangeVeto { .. } => "attribute_change_veto",
        }
    }
}

/// One record in a transaction's durable log.
///
/// `sequence` is the 1-based insertion index within the owning section;
/// together with `savepoint_version` it forms the entry's total order
/// (see [`Position`]). `entry_identifier` is assigned by the adapter when
/// the entry is flushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub transaction_identifier: String,
    pub savepoint: String,
    pub savepoint_version: u64,
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_identifier: Option<String>,
    pub object_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_key: Option<String>,
    /// Was this object born in this transaction?
    pub new_object: bool,
    /// Did a persistence method for this object run after this entry?
    pub object_persisted: bool,
    /// Has the owning section been flushed to the adapter?
    pub transaction_persisted: bool,
    #[serde(flatten)]
    pub kind: EntryKind,
}

impl LogEntry {
    pub fn position(&self) -> Position {
        Position::new(self.savepoint_version, self.sequence)
    }

    /// The attribute name component of `attribute_key`, if any.
    pub fn attribute_name(&self) -> Option<&str> {
        self.attribute_key
            .as_deref()
            .map(common::attribute_of_key)
    }

    pub fn is_attribute_read(&self) -> bool {
        matches!(self.kind, EntryKind::AttributeRead { .. })
    }

    pub fn is_attribute_change(&self) -> bool {
        matches!(self.kind, EntryKind::AttributeChange { .. })
    }

    pub fn is_object_initialization(&self) -> bool {
        matches!(self.kind, EntryKind::ObjectInitialization { .. })
    }

    pub fn is_object_destruction(&self) -> bool {
        matches!(self.kind, EntryKind::ObjectDestruction { .. })
    }

    /// True when applying this entry invokes a method on the underlying
    /// object. Reads, initializations, overrides, and vetoes are markers
    /// and do nothing at apply time.
    pub fn mutates_on_apply(&self) -> bool {
        matches!(
            self.kind,
            EntryKind::AttributeChange { .. }
                | EntryKind::ObjectPersistence { .. }
                | EntryKind::ObjectDestruction { .. }
        )
    }

    /// Overrides and vetoes only arise from exceptional paths the user
    /// explicitly resolved, so they are persisted unconditionally; everything
    /// else is persisted once a persistence method ran for it.
    pub fn persist_required(&self) -> bool {
        self.object_persisted
            || matches!(
                self.kind,
                EntryKind::ReadIntegrityOverride { .. } | EntryKind::AttributeChangeVeto { .. }
            )
    }

    /// Applies this entry to the underlying object.
    ///
    /// `vetoed` reports whether a later attribute-change veto exists in the
    /// transaction for this entry's attribute; a vetoed change is skipped.
    /// Marker kinds are no-ops.
    pub fn apply(&self, target: &dyn DomainObject, vetoed: bool) -> Result<()> {
        match &self.kind {
            EntryKind::AttributeChange {
                new_value, method, ..
            } => {
                if vetoed {
                    tracing::debug!(
                        entry = self.kind.name(),
                        attribute = ?self.attribute_key,
                        "skipping vetoed attribute change"
                    );
                    return Ok(());
                }
                target
                    .invoke(method, std::slice::from_ref(new_value))
                    .map(|_| ())
            }
            EntryKind::ObjectPersistence { method, args } => {
                target.invoke(method, args).map(|_| ())
            }
            EntryKind::ObjectDestruction { method } => target.invoke(method, &[]).map(|_| ()),
            EntryKind::AttributeRead { .. }
            | EntryKind::ObjectInitialization { .. }
            | EntryKind::ReadIntegrityOverride { .. }
            | EntryKind::AttributeChangeVeto { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::proxy::CallResult;

    fn entry(kind: EntryKind, object_persisted: bool) -> LogEntry {
        LogEntry {
            transaction_identifier: "tr1".to_string(),
            savepoint: "tr1/1".to_string(),
            savepoint_version: 1,
            sequence: 1,
            entry_identifier: None,
            object_key: "User/1".to_string(),
            attribute_key: Some("User/1/first".to_string()),
            new_object: false,
            object_persisted,
            transaction_persisted: false,
            kind,
        }
    }

    /// Records every invoked method so apply behaviour can be asserted.
    struct Recorder {
        calls: Mutex<Vec<(String, Vec<Value>)>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, Vec<Value>)> {
            self.calls.lock().clone()
        }
    }

    impl DomainObject for Recorder {
        fn class_name(&self) -> &str {
            "Recorder"
        }

        fn invoke(&self, method: &str, args: &[Value]) -> Result<CallResult> {
            self.calls.lock().push((method.to_string(), args.to_vec()));
            Ok(CallResult::Value(Value::Null))
        }
    }

    #[test]
    fn test_serde_round_trip_is_self_describing() {
        let original = entry(
            EntryKind::AttributeChange {
                old_value: json!("John"),
                new_value: json!("Foo"),
                method: "first=".to_string(),
            },
            true,
        );

        let raw = serde_json::to_string(&original).unwrap();
        assert!(raw.contains("\"kind\":\"attribute_change\""));

        let reloaded: LogEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(reloaded, original);
    }

    #[test]
    fn test_persist_required() {
        let unsaved_read = entry(
            EntryKind::AttributeRead {
                value: json!("John"),
                method: "first".to_string(),
            },
            false,
        );
        assert!(!unsaved_read.persist_required());

        let saved_read = entry(
            EntryKind::AttributeRead {
                value: json!("John"),
                method: "first".to_string(),
            },
            true,
        );
        assert!(saved_read.persist_required());

        let veto = entry(
            EntryKind::AttributeChangeVeto {
                external_value: json!("Moo"),
            },
            false,
        );
        assert!(veto.persist_required());

        let over = entry(
            EntryKind::ReadIntegrityOverride {
                external_value: json!("Olaf"),
            },
            false,
        );
        assert!(over.persist_required());
    }

    #[test]
    fn test_apply_change_invokes_writer() {
        let target = Recorder::new();
        let change = entry(
            EntryKind::AttributeChange {
                old_value: json!("John"),
                new_value: json!("Foo"),
                method: "first=".to_string(),
            },
            true,
        );

        change.apply(&*target, false).unwrap();
        assert_eq!(target.calls(), vec![("first=".to_string(), vec![json!("Foo")])]);
    }

    #[test]
    fn test_apply_vetoed_change_is_skipped() {
        let target = Recorder::new();
        let change = entry(
            EntryKind::AttributeChange {
                old_value: json!("John"),
                new_value: json!("Foo"),
                method: "first=".to_string(),
            },
            true,
        );

        change.apply(&*target, true).unwrap();
        assert!(target.calls().is_empty());
    }

    #[test]
    fn test_apply_markers_are_noops() {
        let target = Recorder::new();
        for kind in [
            EntryKind::AttributeRead {
                value: json!("x"),
                method: "first".to_string(),
            },
            EntryKind::ObjectInitialization {
                method: "new".to_string(),
            },
            EntryKind::ReadIntegrityOverride {
                external_value: json!("x"),
            },
            EntryKind::AttributeChangeVeto {
                external_value: json!("x"),
            },
        ] {
            entry(kind, true).apply(&*target, false).unwrap();
        }
        assert!(target.calls().is_empty());
    }

    #[test]
    fn test_apply_persistence_forwards_args() {
        let target = Recorder::new();
        let save = entry(
            EntryKind::ObjectPersistence {
                method: "save".to_string(),
                args: vec![json!(true)],
            },
            true,
        );

        save.apply(&*target, false).unwrap();
        assert_eq!(target.calls(), vec![("save".to_string(), vec![json!(true)])]);
    }
}
