//! Shared key and value types.
//!
//! Object and attribute keys are plain strings so that persisted log entries
//! reference objects by name rather than by pointer; proxies are rebuilt
//! from these keys on resumption.
//!
//! Key formats:
//! - object key: `<class_name>/<object_id>`
//! - attribute key: `<class_name>/<object_id>/<attribute_name>`
//! - new-object ids: `new_NNNNN` (5-digit, per transaction)

use serde::{Deserialize, Serialize};

/// Attribute values, method arguments, and externally observed values.
pub type Value = serde_json::Value;

/// Prefix of object ids allocated for objects born inside a transaction.
pub const NEW_ID_PREFIX: &str = "new_";

/// Builds an object key from a class name and object id.
pub fn object_key(class_name: &str, object_id: &str) -> String {
    format!("{}/{}", class_name, object_id)
}

/// Builds an attribute key from an object key and attribute name.
pub fn attribute_key(object_key: &str, attribute: &str) -> String {
    format!("{}/{}", object_key, attribute)
}

/// The class-name component of an object or attribute key.
pub fn class_of_key(key: &str) -> &str {
    key.split('/').next().unwrap_or(key)
}

/// The object-id component of an object key.
pub fn id_of_object_key(object_key: &str) -> &str {
    object_key.split_once('/').map(|(_, id)| id).unwrap_or("")
}

/// The object-key prefix of an attribute key.
pub fn object_key_of_attribute(attribute_key: &str) -> &str {
    attribute_key
        .rsplit_once('/')
        .map(|(obj, _)| obj)
        .unwrap_or(attribute_key)
}

/// The attribute-name component of an attribute key.
pub fn attribute_of_key(attribute_key: &str) -> &str {
    attribute_key
        .rsplit_once('/')
        .map(|(_, attr)| attr)
        .unwrap_or(attribute_key)
}

/// True if the object id was allocated for an object born in a transaction.
pub fn is_new_object_id(object_id: &str) -> bool {
    object_id.starts_with(NEW_ID_PREFIX)
}

/// True if the object key refers to an object born in a transaction.
pub fn is_new_object_key(object_key: &str) -> bool {
    is_new_object_id(id_of_object_key(object_key))
}

/// Formats a new-object id from a monotonic per-transaction index.
pub fn new_object_id(index: u64) -> String {
    format!("{}{:05}", NEW_ID_PREFIX, index)
}

/// Parses the index out of a new-object id.
pub fn parse_new_object_id(object_id: &str) -> Option<u64> {
    object_id.strip_prefix(NEW_ID_PREFIX)?.parse().ok()
}

/// The savepoint name of a transaction section.
pub fn savepoint_name(transaction_identifier: &str, savepoint_version: u64) -> String {
    format!("{}/{}", transaction_identifier, savepoint_version)
}

/// Total order over log entries: section version first, then insertion
/// sequence within the section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub savepoint_version: u64,
    pub sequence: u64,
}

impl Position {
    pub fn new(savepoint_version: u64, sequence: u64) -> Self {
        Self {
            savepoint_version,
            sequence,
        }
    }
}
