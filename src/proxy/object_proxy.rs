use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::common::{self, Value};
use crate::config::ResolvedConfig;
use crate::error::{Error, Result};
use crate::proxy::{CallResult, DomainObject};
use crate::tx::Transaction;

enum Handler {
    AttributeChange,
    AttributeRead,
    DynamicRead,
    Persistence,
    Destruction,
}

/// Transparent forwarder for one `(transaction, object)` pair.
///
/// Calls are classified against the class configuration and routed into the
/// transaction's log; unclassified calls fall through to the underlying
/// object. The underlying object is resolved lazily: a proxy rebuilt on
/// resumption starts as a placeholder and materializes its object through
/// the class's lookup method (or the init method for objects born in the
/// transaction).
pub struct ObjectProxy {
    class_name: String,
    object_key: String,
    new_object: bool,
    tx: Weak<Transaction>,
    underlying: Mutex<Option<Arc<dyn DomainObject>>>,
}

impl ObjectProxy {
    pub(crate) fn wrapped(
        tx: Weak<Transaction>,
        class_name: &str,
        object_key: &str,
        object: Arc<dyn DomainObject>,
    ) -> Self {
        Self {
            class_name: class_name.to_string(),
            object_key: object_key.to_string(),
            new_object: false,
            tx,
            underlying: Mutex::new(Some(object)),
        }
    }

    pub(crate) fn created(
        tx: Weak<Transaction>,
        class_name: &str,
        object_key: &str,
        object: Arc<dyn DomainObject>,
    ) -> Self {
        Self {
            class_name: class_name.to_string(),
            object_key: object_key.to_string(),
            new_object: true,
            tx,
            underlying: Mutex::new(Some(object)),
        }
    }

    /// A placeholder proxy for a not-yet-looked-up object, used when a
    /// resumed transaction references objects by key only.
    pub(crate) fn for_key(tx: Weak<Transaction>, object_key: &str) -> Self {
        Self {
            class_name: common::class_of_key(object_key).to_string(),
            object_key: object_key.to_string(),
            new_object: common::is_new_object_key(object_key),
            tx,
            underlying: Mutex::new(None),
        }
    }

    pub fn object_key(&self) -> &str {
        &self.object_key
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// True if the object was born in this transaction.
    pub fn is_new(&self) -> bool {
        self.new_object
    }

    fn transaction(&self) -> Result<Arc<Transaction>> {
        self.tx
            .upgrade()
            .ok_or_else(|| Error::persistence("the owning transaction has already ended"))
    }

    /// The underlying domain object, resolved lazily. Existing objects are
    /// restored through the class's lookup method; new objects are
    /// materialized through its init method.
    pub fn underlying(&self) -> Result<Arc<dyn DomainObject>> {
        if let Some(object) = self.underlying.lock().clone() {
            return Ok(object);
        }

        let resolved = ResolvedConfig::for_class(&self.class_name);
        let object = if self.new_object {
            resolved.init()?
        } else {
            resolved
                .lookup(common::id_of_object_key(&self.object_key))?
                .ok_or_else(|| {
                    Error::persistence(format!(
                        "object '{}' could not be restored via its lookup method",
                        self.object_key
                    ))
                })?
        };

        let mut slot = self.underlying.lock();
        Ok(slot.get_or_insert(object).clone())
    }

    /// Reads an attribute directly from the underlying object, bypassing
    /// the transactional log.
    pub(crate) fn read_underlying(&self, method: &str) -> Result<Value> {
        self.underlying()?.invoke(method, &[])?.into_value()
    }

    /// Dispatches a method call through the transactional machinery.
    ///
    /// The method name is classified against the class configuration into a
    /// queue of handlers (writer, reader, dynamic reader, persistence,
    /// destructor); the first handler's result is the overall result. An
    /// empty queue forwards the call to the underlying object, re-wrapping
    /// a returned object when its class allows proxying.
    pub fn call(self: &Arc<Self>, method: &str, args: &[Value]) -> Result<CallResult> {
        let resolved = ResolvedConfig::for_class(&self.class_name);

        if resolved.use_specialized_proxy() {
            if let Some(dispatch) = resolved.specialized_dispatch() {
                if let Some(result) = dispatch(self, method, args)? {
                    return Ok(result);
                }
            }
        }

        let this = self.clone();
        let produce = move || this.underlying();

        let mut handlers = Vec::new();
        if resolved.attribute_writer(method, &produce)? {
            handlers.push(Handler::AttributeChange);
        }
        if resolved.attribute_reader(method, &produce)? {
            handlers.push(Handler::AttributeRead);
        }
        if resolved.dynamic_attribute_reader(method, &produce)? {
            handlers.push(Handler::DynamicRead);
        }
        if resolved.persistence_method(method, &produce)? {
            handlers.push(Handler::Persistence);
        }
        if resolved.destruction_method(method, &produce)? {
            handlers.push(Handler::Destruction);
        }

        let mut result = None;
        for handler in handlers {
            let handled = match handler {
                Handler::AttributeChange => self.attribute_change_handler(method, args)?,
                Handler::AttributeRead => self.attribute_read_handler(method)?,
                Handler::DynamicRead => {
                    self.dynamic_attribute_read_handler(&resolved, method, args)?
                }
                Handler::Persistence => self.object_persistence_handler(method, args)?,
                Handler::Destruction => self.object_destruction_handler(method)?,
            };
            result.get_or_insert(handled);
        }

        match result {
            Some(result) => Ok(result),
            None => self.forward(method, args),
        }
    }

    /// Serves a read: the pending write value if one exists, else the value
    /// read before, else the live value (which is then logged). Values
    /// served from transactional state are integrity-checked first.
    fn attribute_read_handler(self: &Arc<Self>, method: &str) -> Result<CallResult> {
        let transaction = self.transaction()?;
        let attribute_key = common::attribute_key(&self.object_key, method);

        if transaction.attribute_value_written(&attribute_key) {
            transaction.verify_attribute_integrity(self, method, false)?;
            return Ok(CallResult::Value(
                transaction
                    .attribute_value(&attribute_key)
                    .unwrap_or(Value::Null),
            ));
        }

        if transaction.has_read(&attribute_key) {
            transaction.verify_attribute_integrity(self, method, false)?;
            return Ok(CallResult::Value(
                transaction
                    .read_attribute_value(&attribute_key)
                    .unwrap_or(Value::Null),
            ));
        }

        let live = self.read_underlying(method)?;
        transaction.log_attribute_read(
            &self.object_key,
            self.new_object,
            method,
            live.clone(),
            method,
        );
        Ok(CallResult::Value(live))
    }

    /// Logs a deferred write. The old value is the transaction's current
    /// view of the attribute; the live object is only consulted when the
    /// transaction never touched the attribute and a reader exists.
    fn attribute_change_handler(self: &Arc<Self>, method: &str, args: &[Value]) -> Result<CallResult> {
        let attribute = method.strip_suffix('=').unwrap_or(method);
        let new_value = args.first().cloned().ok_or_else(|| {
            Error::configuration(format!("writer '{}' requires a value argument", method))
        })?;

        let transaction = self.transaction()?;
        let attribute_key = common::attribute_key(&self.object_key, attribute);

        let old_value = if transaction.attribute_value_written(&attribute_key) {
            transaction
                .attribute_value(&attribute_key)
                .unwrap_or(Value::Null)
        } else if transaction.has_read(&attribute_key) {
            transaction
                .read_attribute_value(&attribute_key)
                .unwrap_or(Value::Null)
        } else {
            let resolved = ResolvedConfig::for_class(&self.class_name);
            let this = self.clone();
            let produce = move || this.underlying();
            if resolved.attribute_reader(attribute, &produce)? {
                self.read_underlying(attribute)?
            } else {
                Value::Null
            }
        };

        transaction.log_attribute_change(
            &self.object_key,
            self.new_object,
            attribute,
            old_value,
            new_value.clone(),
            method,
        );
        Ok(CallResult::Value(new_value))
    }

    /// Evaluates a dynamic reader body with the proxy as its receiver so
    /// the reads it performs are intercepted like direct reads.
    fn dynamic_attribute_read_handler(
        self: &Arc<Self>,
        resolved: &ResolvedConfig,
        method: &str,
        args: &[Value],
    ) -> Result<CallResult> {
        let body = resolved.dynamic_method(method).ok_or_else(|| {
            Error::configuration(format!(
                "dynamic attribute reader '{}' on class '{}' has no registered body",
                method, self.class_name
            ))
        })?;
        Ok(CallResult::Value(body(self, args)?))
    }

    fn object_persistence_handler(self: &Arc<Self>, method: &str, args: &[Value]) -> Result<CallResult> {
        let transaction = self.transaction()?;
        transaction.log_object_persistence(
            &self.object_key,
            self.new_object,
            method,
            args.to_vec(),
        );
        Ok(CallResult::Value(Value::Bool(true)))
    }

    fn object_destruction_handler(self: &Arc<Self>, method: &str) -> Result<CallResult> {
        let transaction = self.transaction()?;
        transaction.log_object_destruction(&self.object_key, self.new_object, method);
        Ok(CallResult::Value(Value::Bool(true)))
    }

    fn forward(self: &Arc<Self>, method: &str, args: &[Value]) -> Result<CallResult> {
        tracing::trace!(
            object_key = %self.object_key,
            method,
            "forwarding unclassified call to the underlying object"
        );
        match self.underlying()?.invoke(method, args)? {
            CallResult::Object(object) => {
                let their_class = object.class_name().to_string();
                let their_config = ResolvedConfig::for_class(&their_class);
                let probe = object.clone();
                let produce = move || -> Result<Arc<dyn DomainObject>> { Ok(probe.clone()) };
                if their_config.proxy_instances(method, &produce)? {
                    let transaction = self.transaction()?;
                    Ok(CallResult::Proxy(transaction.wrap(object)?))
                } else {
                    Ok(CallResult::Object(object))
                }
            }
            other => Ok(other),
        }
    }

    // ------------------------------------------------------------------
    // Convenience surface
    // ------------------------------------------------------------------

    /// Reads an attribute through the transactional machinery.
    pub fn get(self: &Arc<Self>, attribute: &str) -> Result<Value> {
        self.call(attribute, &[])?.into_value()
    }

    /// Writes an attribute (dispatches `<attribute>=`).
    pub fn set(self: &Arc<Self>, attribute: &str, value: Value) -> Result<Value> {
        self.call(&format!("{}=", attribute), std::slice::from_ref(&value))?
            .into_value()
    }

    /// Dispatches the conventional persistence method `save`.
    pub fn save(self: &Arc<Self>) -> Result<Value> {
        self.call("save", &[])?.into_value()
    }

    /// Dispatches the conventional destruction method `destroy`.
    pub fn destroy(self: &Arc<Self>) -> Result<Value> {
        self.call("destroy", &[])?.into_value()
    }
}

impl std::fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectProxy")
            .field("object_key", &self.object_key)
            .field("new_object", &self.new_object)
            .field("resolved", &self.underlying.lock().is_some())
            .finish()
    }
}
