use std::collections::HashMap;
use std::sync::Arc;

use crate::common;
use crate::error::Result;
use crate::proxy::ObjectProxy;

/// Per-transaction proxy cache.
///
/// A transaction's code must observe the same proxy for a given object key
/// throughout the transaction's life, so proxies are memoized here. The
/// cache also allocates the monotonic `new_NNNNN` ids for objects born in
/// the transaction.
pub struct ProxyCache {
    proxies: HashMap<String, Arc<ObjectProxy>>,
    next_object_index: u64,
}

impl ProxyCache {
    pub fn new() -> Self {
        Self {
            proxies: HashMap::new(),
            next_object_index: 0,
        }
    }

    /// The memoized proxy for an object key, produced on first use.
    pub fn fetch(
        &mut self,
        object_key: &str,
        produce: impl FnOnce() -> Result<Arc<ObjectProxy>>,
    ) -> Result<Arc<ObjectProxy>> {
        if let Some(proxy) = self.proxies.get(object_key) {
            return Ok(proxy.clone());
        }
        let proxy = produce()?;
        self.proxies.insert(object_key.to_string(), proxy.clone());
        Ok(proxy)
    }

    pub fn get(&self, object_key: &str) -> Option<Arc<ObjectProxy>> {
        self.proxies.get(object_key).cloned()
    }

    /// The next id for an object born in this transaction.
    pub fn next_id(&mut self) -> String {
        self.next_object_index += 1;
        common::new_object_id(self.next_object_index)
    }

    /// Raises the id allocation floor so resumed transactions never reuse
    /// an id already present in persisted entries.
    pub fn ensure_floor(&mut self, floor: u64) {
        if floor > self.next_object_index {
            self.next_object_index = floor;
        }
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn clear(&mut self) {
        self.proxies.clear();
        self.next_object_index = 0;
    }
}

impl Default for ProxyCache {
    fn default() -> Self {
        Self::new()
    }
}
