use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{self, Position, Value};
use crate::config;
use crate::error::{ReadIntegrityError, Result, WriteClashError};
use crate::journal::LogEntry;
use crate::persistence::PersistenceAdapter;
use crate::proxy::{DomainObject, ObjectProxy, ProxyCache};
use crate::tx::Section;

struct TxInner {
    identifier: String,
    /// Previous sections, ascending by savepoint version.
    older: Vec<Section>,
    current: Section,
    committed: bool,
    reset: bool,
    persisted: bool,
}

impl TxInner {
    fn sections_oldest_first(&self) -> impl Iterator<Item = &Section> {
        self.older.iter().chain(std::iter::once(&self.current))
    }

    fn sections_newest_first(&self) -> impl Iterator<Item = &Section> {
        std::iter::once(&self.current).chain(self.older.iter().rev())
    }
}

/// A named, persisted series of mutations on domain objects, committed
/// atomically.
///
/// A transaction is an ordered sequence of [`Section`]s: everything already
/// flushed to the adapter in earlier slices plus the current, mutable slice.
/// Opening a transaction with a known identifier resumes it, possibly in a
/// different process than the one that started it.
pub struct Transaction {
    identifier: String,
    adapter: Arc<dyn PersistenceAdapter>,
    inner: Mutex<TxInner>,
    cache: Mutex<ProxyCache>,
}

impl Transaction {
    /// Creates or resumes the transaction with the given identifier.
    /// Persisted sections are loaded once, under the transaction lock.
    pub fn open(identifier: String, adapter: Arc<dyn PersistenceAdapter>) -> Result<Arc<Self>> {
        let (older, persisted, next_version) = {
            let _lock = adapter.lock_transaction(&identifier, true)?;
            let versions = adapter.savepoints(&identifier)?;
            let mut older = Vec::with_capacity(versions.len());
            for version in &versions {
                let entries = adapter.log_entries(&identifier, *version)?;
                older.push(Section::from_persisted(&identifier, *version, entries));
            }
            let next_version = versions.last().copied().unwrap_or(0) + 1;
            (older, !versions.is_empty(), next_version)
        };

        if persisted {
            tracing::debug!(
                transaction = %identifier,
                sections = older.len(),
                "resumed persisted transaction"
            );
        }

        let mut cache = ProxyCache::new();
        let id_floor = older
            .iter()
            .flat_map(|section| section.entries())
            .filter_map(|entry| {
                common::parse_new_object_id(common::id_of_object_key(&entry.object_key))
            })
            .max()
            .unwrap_or(0);
        cache.ensure_floor(id_floor);

        Ok(Arc::new(Self {
            identifier: identifier.clone(),
            adapter,
            inner: Mutex::new(TxInner {
                identifier: identifier.clone(),
                older,
                current: Section::new(&identifier, next_version),
                committed: false,
                reset: false,
                persisted,
            }),
            cache: Mutex::new(cache),
        }))
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn committed(&self) -> bool {
        self.inner.lock().committed
    }

    pub fn was_reset(&self) -> bool {
        self.inner.lock().reset
    }

    /// True once any section of this transaction has been flushed.
    pub fn persisted(&self) -> bool {
        self.inner.lock().persisted
    }

    pub fn current_savepoint(&self) -> String {
        self.inner.lock().current.savepoint()
    }

    pub fn current_savepoint_version(&self) -> u64 {
        self.inner.lock().current.savepoint_version()
    }

    // ------------------------------------------------------------------
    // Cross-section queries
    // ------------------------------------------------------------------

    /// The newest pending write value for an attribute, regardless of
    /// later vetoes. Use [`attribute_value_written`](Self::attribute_value_written)
    /// to honour vetoes.
    pub fn attribute_value(&self, attribute_key: &str) -> Option<Value> {
        let inner = self.inner.lock();
        let result = inner
            .sections_newest_first()
            .find_map(|section| section.write_set().get(attribute_key).cloned());
        result
    }

    /// True iff a change for the attribute exists and no veto is newer.
    pub fn attribute_value_written(&self, attribute_key: &str) -> bool {
        let inner = self.inner.lock();
        let change = inner
            .sections_oldest_first()
            .filter_map(|section| section.latest_change(attribute_key))
            .max();
        let veto = inner
            .sections_oldest_first()
            .filter_map(|section| section.latest_veto(attribute_key))
            .max();
        match (change, veto) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(change), Some(veto)) => change > veto,
        }
    }

    /// The newest value the transaction read for an attribute.
    pub fn read_attribute_value(&self, attribute_key: &str) -> Option<Value> {
        let inner = self.inner.lock();
        let result = inner
            .sections_newest_first()
            .find_map(|section| section.read_set().get(attribute_key).cloned());
        result
    }

    /// True iff the transaction read the attribute in any section.
    pub fn has_read(&self, attribute_key: &str) -> bool {
        let inner = self.inner.lock();
        let result = inner
            .sections_oldest_first()
            .any(|section| section.read_set().contains_key(attribute_key));
        result
    }

    /// True iff the latest override for the attribute is newer than the
    /// latest read and acknowledges exactly the given external value.
    pub fn read_integrity_override_for(&self, attribute_key: &str, external_value: &Value) -> bool {
        let inner = self.inner.lock();
        let latest_override = inner
            .sections_oldest_first()
            .filter_map(|section| section.latest_override(attribute_key))
            .max_by_key(|(position, _)| *position);
        let latest_read = inner
            .sections_oldest_first()
            .filter_map(|section| section.latest_read(attribute_key))
            .max();

        match latest_override {
            Some((position, value)) => {
                let newer_than_read = latest_read.map(|read| position > read).unwrap_or(true);
                newer_than_read && value == *external_value
            }
            None => false,
        }
    }

    /// True iff the latest veto for the attribute is newer than the latest
    /// change.
    pub fn attribute_change_vetoed(&self, attribute_key: &str) -> bool {
        let inner = self.inner.lock();
        let veto = inner
            .sections_oldest_first()
            .filter_map(|section| section.latest_veto(attribute_key))
            .max();
        let change = inner
            .sections_oldest_first()
            .filter_map(|section| section.latest_change(attribute_key))
            .max();
        match (veto, change) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(veto), Some(change)) => veto > change,
        }
    }

    fn latest_veto_positions(&self) -> HashMap<String, Position> {
        let inner = self.inner.lock();
        let mut positions: HashMap<String, Position> = HashMap::new();
        for section in inner.sections_oldest_first() {
            for attribute_key in section.attribute_change_vetoes().keys() {
                if let Some(position) = section.latest_veto(attribute_key) {
                    let slot = positions.entry(attribute_key.clone()).or_insert(position);
                    if position > *slot {
                        *slot = position;
                    }
                }
            }
        }
        positions
    }

    /// Attribute keys of the combined read set, sorted for determinism.
    pub fn read_attribute_keys(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut keys: Vec<String> = inner
            .sections_oldest_first()
            .flat_map(|section| section.read_set().keys().cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        keys.sort();
        keys
    }

    // ------------------------------------------------------------------
    // Object-set queries
    // ------------------------------------------------------------------

    fn collect_object_keys(&self, matches: impl Fn(&LogEntry) -> bool) -> Vec<String> {
        let inner = self.inner.lock();
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for entry in inner
            .sections_oldest_first()
            .flat_map(|section| section.entries())
        {
            if matches(entry) && seen.insert(entry.object_key.clone()) {
                keys.push(entry.object_key.clone());
            }
        }
        keys
    }

    /// All objects carrying persist-marked entries, in order of first
    /// appearance. These are the objects mutated at commit.
    pub fn fateful_object_keys(&self) -> Vec<String> {
        self.collect_object_keys(|entry| entry.object_persisted)
    }

    /// Objects born in this transaction whose creation was persisted.
    pub fn created_object_keys(&self) -> Vec<String> {
        self.collect_object_keys(|entry| entry.is_object_initialization() && entry.object_persisted)
    }

    /// Objects born in this transaction but not yet persisted.
    pub fn initialized_object_keys(&self) -> Vec<String> {
        self.collect_object_keys(|entry| {
            entry.is_object_initialization() && !entry.object_persisted
        })
    }

    pub fn initialized_or_created_object_keys(&self) -> Vec<String> {
        self.collect_object_keys(LogEntry::is_object_initialization)
    }

    pub fn destroyed_object_keys(&self) -> Vec<String> {
        self.collect_object_keys(LogEntry::is_object_destruction)
    }

    pub fn read_object_keys(&self) -> Vec<String> {
        self.collect_object_keys(LogEntry::is_attribute_read)
    }

    // ------------------------------------------------------------------
    // Logging (proxy-facing)
    // ------------------------------------------------------------------

    pub(crate) fn log_attribute_read(
        &self,
        object_key: &str,
        new_object: bool,
        attribute: &str,
        value: Value,
        method: &str,
    ) {
        let mut inner = self.inner.lock();
        inner
            .current
            .log_attribute_read(object_key, new_object, attribute, value, method);
    }

    pub(crate) fn log_attribute_change(
        &self,
        object_key: &str,
        new_object: bool,
        attribute: &str,
        old_value: Value,
        new_value: Value,
        method: &str,
    ) {
        let attribute_key = common::attribute_key(object_key, attribute);
        let mut inner = self.inner.lock();
        let had_prior_read = inner
            .sections_oldest_first()
            .any(|section| section.read_set().contains_key(&attribute_key));
        inner.current.log_attribute_change(
            object_key,
            new_object,
            attribute,
            old_value,
            new_value,
            method,
            had_prior_read,
        );
    }

    pub(crate) fn log_object_initialization(&self, object_key: &str, method: &str) {
        self.inner
            .lock()
            .current
            .log_object_initialization(object_key, method);
    }

    pub(crate) fn log_object_persistence(
        &self,
        object_key: &str,
        new_object: bool,
        method: &str,
        args: Vec<Value>,
    ) {
        self.inner
            .lock()
            .current
            .log_object_persistence(object_key, new_object, method, args);
    }

    pub(crate) fn log_object_destruction(&self, object_key: &str, new_object: bool, method: &str) {
        self.inner
            .lock()
            .current
            .log_object_destruction(object_key, new_object, method);
    }

    // ------------------------------------------------------------------
    // Conflict resolution
    // ------------------------------------------------------------------

    /// Acknowledges an external change to a read attribute. With
    /// `update_value`, further reads observe the external value. The
    /// resolution is flushed immediately so it survives a retry or a
    /// process boundary.
    pub fn ignore_read_conflict(
        &self,
        error: &ReadIntegrityError,
        update_value: bool,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.current.log_read_integrity_override(
                &error.object_key,
                common::is_new_object_key(&error.object_key),
                &error.attribute,
                error.external_value.clone(),
                update_value,
                &error.attribute,
            );
        }
        self.persist().map(|_| ())
    }

    /// Resolves a write clash in favour of the transaction's own value.
    pub fn keep_ours(&self, error: &WriteClashError) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.current.log_read_integrity_override(
                &error.object_key,
                common::is_new_object_key(&error.object_key),
                &error.attribute,
                error.external_value.clone(),
                false,
                &error.attribute,
            );
        }
        self.persist().map(|_| ())
    }

    /// Resolves a write clash by discarding the transaction's own change.
    pub fn use_theirs(&self, error: &WriteClashError) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.current.log_attribute_change_veto(
                &error.object_key,
                common::is_new_object_key(&error.object_key),
                &error.attribute,
                error.external_value.clone(),
                &error.attribute,
            );
        }
        self.persist().map(|_| ())
    }

    // ------------------------------------------------------------------
    // Integrity verification
    // ------------------------------------------------------------------

    /// Verifies that an attribute the transaction read still carries the
    /// value it read.
    ///
    /// Skipped when the attribute was never read, when the object was born
    /// in this transaction, or (unless `force`) when instant integrity
    /// failure is disabled. A mismatch covered by a still-valid override
    /// passes; otherwise the result is a [`WriteClashError`] when the
    /// transaction also wrote the attribute and a [`ReadIntegrityError`]
    /// when it only read it.
    pub fn verify_attribute_integrity(
        &self,
        proxy: &Arc<ObjectProxy>,
        attribute: &str,
        force: bool,
    ) -> Result<()> {
        let attribute_key = common::attribute_key(proxy.object_key(), attribute);

        if !self.has_read(&attribute_key) {
            return Ok(());
        }
        if !force && !config::current().instant_read_integrity_fail {
            return Ok(());
        }
        if proxy.is_new() {
            return Ok(());
        }

        let live = proxy.read_underlying(attribute)?;
        let last_read = self
            .read_attribute_value(&attribute_key)
            .unwrap_or(Value::Null);
        if live == last_read {
            return Ok(());
        }
        if self.read_integrity_override_for(&attribute_key, &live) {
            return Ok(());
        }

        if self.attribute_value_written(&attribute_key) {
            Err(WriteClashError {
                object_key: proxy.object_key().to_string(),
                attribute: attribute.to_string(),
                our_value: self.attribute_value(&attribute_key).unwrap_or(Value::Null),
                external_value: live,
            }
            .into())
        } else {
            Err(ReadIntegrityError {
                object_key: proxy.object_key().to_string(),
                attribute: attribute.to_string(),
                last_read_value: last_read,
                external_value: live,
            }
            .into())
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Flushes the current section's persist-required entries and opens a
    /// fresh section. Returns the number of flushed entries; flushing
    /// nothing leaves the section untouched.
    pub fn persist(&self) -> Result<usize> {
        let _lock = self.adapter.lock_transaction(&self.identifier, true)?;
        let mut inner = self.inner.lock();

        let count = inner.current.enqueue_persistable(self.adapter.as_ref())?;
        if count == 0 {
            return Ok(0);
        }
        self.adapter.persist()?;

        inner.current.mark_persisted();
        inner.persisted = true;
        let next_version = inner.current.savepoint_version() + 1;
        let identifier = inner.identifier.clone();
        let finished = std::mem::replace(&mut inner.current, Section::new(&identifier, next_version));
        inner.older.push(finished);

        tracing::debug!(transaction = %self.identifier, count, "persisted section");
        Ok(count)
    }

    /// Discards the current section's pending state unless the section was
    /// already persisted (then this is a no-op). The savepoint number is
    /// preserved.
    pub fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.current.persisted() {
            return Ok(());
        }
        inner.current.reset()
    }

    /// Removes the transaction's persisted state and empties the in-memory
    /// sections.
    pub fn reset(&self) -> Result<()> {
        {
            let _lock = self.adapter.lock_transaction(&self.identifier, true)?;
            self.adapter.reset_transaction(&self.identifier)?;
        }
        let mut inner = self.inner.lock();
        inner.older.clear();
        let identifier = inner.identifier.clone();
        inner.current = Section::new(&identifier, 1);
        inner.reset = true;
        inner.persisted = false;
        drop(inner);
        self.cache.lock().clear();
        tracing::debug!(transaction = %self.identifier, "reset");
        Ok(())
    }

    /// Commits the transaction: locks the fateful objects in sorted key
    /// order, revalidates the full read set, applies every persist-marked
    /// entry in savepoint order, and removes the persisted state.
    ///
    /// Object locks are non-suspending; contention aborts the commit with a
    /// lock error and every already-held lock is released. Objects born in
    /// this transaction are not locked; nobody else can see them yet.
    pub fn commit(self: &Arc<Self>) -> Result<()> {
        tracing::debug!(transaction = %self.identifier, "commit started");
        let _transaction_lock = self.adapter.lock_transaction(&self.identifier, true)?;

        let mut fateful: Vec<String> = self
            .fateful_object_keys()
            .into_iter()
            .filter(|key| !common::is_new_object_key(key))
            .collect();
        fateful.sort();

        let mut object_locks = Vec::with_capacity(fateful.len());
        for object_key in &fateful {
            object_locks.push(self.adapter.lock_object(object_key, false)?);
        }

        // Revalidate every read while all object locks are held.
        for attribute_key in self.read_attribute_keys() {
            let object_key = common::object_key_of_attribute(&attribute_key).to_string();
            let attribute = common::attribute_of_key(&attribute_key).to_string();
            let proxy = self.proxy_for_key(&object_key)?;
            self.verify_attribute_integrity(&proxy, &attribute, true)?;
        }

        let sections: Vec<Section> = {
            let inner = self.inner.lock();
            inner.sections_oldest_first().cloned().collect()
        };
        let veto_positions = self.latest_veto_positions();
        let vetoed = |entry: &LogEntry| {
            entry.is_attribute_change()
                && entry
                    .attribute_key
                    .as_deref()
                    .and_then(|key| veto_positions.get(key))
                    .map(|position| *position > entry.position())
                    .unwrap_or(false)
        };
        let owner = self.clone();
        let resolve = move |object_key: &str| owner.object_for_key(object_key);
        for section in &sections {
            section.apply_log_entries(&resolve, &vetoed)?;
        }

        self.inner.lock().committed = true;
        self.adapter.reset_transaction(&self.identifier)?;
        tracing::debug!(transaction = %self.identifier, "commit finished");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Proxies
    // ------------------------------------------------------------------

    /// Wraps an existing domain object into this transaction's proxy for
    /// it. The same object key always yields the same proxy.
    pub fn wrap(self: &Arc<Self>, object: Arc<dyn DomainObject>) -> Result<Arc<ObjectProxy>> {
        let class_name = object.class_name().to_string();
        let resolved = config::ResolvedConfig::for_class(&class_name);
        let object_id = resolved.object_id(&*object)?;
        let object_key = common::object_key(&class_name, &object_id);

        let weak = Arc::downgrade(self);
        let mut cache = self.cache.lock();
        cache.fetch(&object_key, || {
            Ok(Arc::new(ObjectProxy::wrapped(
                weak,
                &class_name,
                &object_key,
                object.clone(),
            )))
        })
    }

    /// Creates a fresh object of the class inside this transaction and
    /// returns its proxy. The object receives the next `new_NNNNN` id.
    pub(crate) fn create_object(
        self: &Arc<Self>,
        class_name: &str,
        init_method: &str,
    ) -> Result<Arc<ObjectProxy>> {
        let resolved = config::ResolvedConfig::for_class(class_name);
        let object = resolved.init()?;

        let proxy = {
            let weak = Arc::downgrade(self);
            let mut cache = self.cache.lock();
            let object_id = cache.next_id();
            let object_key = common::object_key(class_name, &object_id);
            cache.fetch(&object_key, || {
                Ok(Arc::new(ObjectProxy::created(
                    weak,
                    class_name,
                    &object_key,
                    object,
                )))
            })?
        };

        self.log_object_initialization(proxy.object_key(), init_method);
        Ok(proxy)
    }

    /// The memoized proxy for an object key, rebuilt lazily on resumption.
    pub fn proxy_for_key(self: &Arc<Self>, object_key: &str) -> Result<Arc<ObjectProxy>> {
        let weak = Arc::downgrade(self);
        let mut cache = self.cache.lock();
        cache.fetch(object_key, || {
            Ok(Arc::new(ObjectProxy::for_key(weak, object_key)))
        })
    }

    fn object_for_key(self: &Arc<Self>, object_key: &str) -> Result<Arc<dyn DomainObject>> {
        self.proxy_for_key(object_key)?.underlying()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("identifier", &self.identifier)
            .field("sections", &(inner.older.len() + 1))
            .field("committed", &inner.committed)
            .field("persisted", &inner.persisted)
            .finish()
    }
}
