use std::sync::{Arc, Weak};

use crate::common::Value;
use crate::error::{Error, Result};
use crate::proxy::ObjectProxy;
use crate::tx::Transaction;

/// Class-level proxy: creates objects inside a transaction.
///
/// The created object exists only inside the transaction until commit; it
/// is identified by a `new_NNNNN` key and materialized for the outside
/// world when its persistence entries are applied.
pub struct ClassProxy {
    class_name: String,
    tx: Weak<Transaction>,
}

impl ClassProxy {
    pub(crate) fn new(tx: Weak<Transaction>, class_name: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            tx,
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Creates a fresh instance via the class's init method, records its
    /// initialization, and applies the given attributes through the proxy
    /// so they become regular deferred writes.
    pub fn create(&self, attributes: &[(&str, Value)]) -> Result<Arc<ObjectProxy>> {
        let transaction = self
            .tx
            .upgrade()
            .ok_or_else(|| Error::persistence("the owning transaction has already ended"))?;

        let proxy = transaction.create_object(&self.class_name, "new")?;
        for (attribute, value) in attributes {
            proxy.set(attribute, value.clone())?;
        }
        Ok(proxy)
    }
}

impl std::fmt::Debug for ClassProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassProxy")
            .field("class_name", &self.class_name)
            .finish()
    }
}
