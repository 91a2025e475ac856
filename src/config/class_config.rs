use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::common::Value;
use crate::error::{Error, Result};
use crate::proxy::{CallResult, DomainObject, ObjectProxy};

/// Class-level lookup: retrieves an instance by its stable identifier.
pub type LookupFn = Arc<dyn Fn(&str) -> Result<Option<Arc<dyn DomainObject>>> + Send + Sync>;

/// Class-level initializer: creates a fresh, unpublished instance.
pub type InitFn = Arc<dyn Fn() -> Result<Arc<dyn DomainObject>> + Send + Sync>;

/// Body of a dynamic attribute reader, evaluated with the proxy as its
/// receiver so reads it performs are intercepted like direct reads.
pub type DynamicFn = Arc<dyn Fn(&Arc<ObjectProxy>, &[Value]) -> Result<Value> + Send + Sync>;

/// Per-class dispatch override consulted before method classification when
/// `use_specialized_proxy` is enabled. Returning `None` falls through to the
/// regular handler queue.
pub type SpecializedDispatch =
    Arc<dyn Fn(&Arc<ObjectProxy>, &str, &[Value]) -> Result<Option<CallResult>> + Send + Sync>;

/// How to obtain an object's stable identifier.
#[derive(Clone)]
pub enum MethodRef {
    /// Invoke this instance method; the result must stringify.
    Named(String),
    /// Compute the identifier from the object directly.
    Computed(Arc<dyn Fn(&dyn DomainObject) -> Result<String> + Send + Sync>),
}

/// A configurable predicate on method names.
///
/// `Named` resolves against the object: the named method is invoked with the
/// method name under test and must return a boolean.
#[derive(Clone)]
pub enum MethodPredicate {
    Bool(bool),
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
    Named(String),
}

impl From<bool> for MethodPredicate {
    fn from(value: bool) -> Self {
        MethodPredicate::Bool(value)
    }
}

impl MethodPredicate {
    /// Matches exactly the given method names.
    pub fn one_of<S: AsRef<str>>(names: &[S]) -> Self {
        let names: HashSet<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
        MethodPredicate::Predicate(Arc::new(move |method| names.contains(method)))
    }

    /// Matches writer methods (`<attribute>=`) for the given attribute names.
    pub fn writers_of<S: AsRef<str>>(attributes: &[S]) -> Self {
        let names: HashSet<String> = attributes.iter().map(|n| n.as_ref().to_string()).collect();
        MethodPredicate::Predicate(Arc::new(move |method| {
            method
                .strip_suffix('=')
                .map(|attr| names.contains(attr))
                .unwrap_or(false)
        }))
    }

    fn evaluate(
        &self,
        class_name: &str,
        method: &str,
        object: &dyn Fn() -> Result<Arc<dyn DomainObject>>,
    ) -> Result<bool> {
        match self {
            MethodPredicate::Bool(value) => Ok(*value),
            MethodPredicate::Predicate(predicate) => Ok(predicate(method)),
            MethodPredicate::Named(name) => {
                let object = object()?;
                match object.invoke(name, &[Value::String(method.to_string())])? {
                    CallResult::Value(Value::Bool(value)) => Ok(value),
                    _ => Err(Error::configuration(format!(
                        "predicate method '{}' on class '{}' must return a boolean",
                        name, class_name
                    ))),
                }
            }
        }
    }
}

/// Per-class registry entry: identity, lookup, initialization, and the
/// method-classification predicates the proxy consults on every call.
///
/// Options left unset fall through the `inherits` chain (and, when
/// `mixin_module_proxies` is enabled, the `mixins` list) before the system
/// defaults apply.
#[derive(Clone, Default)]
pub struct ClassConfig {
    class_name: String,
    inherits: Option<String>,
    mixins: Vec<String>,
    id_method: Option<MethodRef>,
    lookup_method: Option<LookupFn>,
    init_method: Option<InitFn>,
    attribute_reader: Option<MethodPredicate>,
    attribute_writer: Option<MethodPredicate>,
    dynamic_attribute_reader: Option<MethodPredicate>,
    persistence_method: Option<MethodPredicate>,
    destruction_method: Option<MethodPredicate>,
    proxy_instances: Option<MethodPredicate>,
    mixin_module_proxies: Option<bool>,
    use_specialized_proxy: Option<bool>,
    dynamic_methods: HashMap<String, DynamicFn>,
    specialized_dispatch: Option<SpecializedDispatch>,
}

impl ClassConfig {
    pub fn new(class_name: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            ..Self::default()
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn inherits(&mut self, parent: &str) -> &mut Self {
        self.inherits = Some(parent.to_string());
        self
    }

    pub fn mixin(&mut self, module: &str) -> &mut Self {
        self.mixins.push(module.to_string());
        self
    }

    pub fn id_method(&mut self, method: &str) -> &mut Self {
        self.id_method = Some(MethodRef::Named(method.to_string()));
        self
    }

    pub fn id_with(
        &mut self,
        f: impl Fn(&dyn DomainObject) -> Result<String> + Send + Sync + 'static,
    ) -> &mut Self {
        self.id_method = Some(MethodRef::Computed(Arc::new(f)));
        self
    }

    pub fn lookup_with(
        &mut self,
        f: impl Fn(&str) -> Result<Option<Arc<dyn DomainObject>>> + Send + Sync + 'static,
    ) -> &mut Self {
        self.lookup_method = Some(Arc::new(f));
        self
    }

    pub fn init_with(
        &mut self,
        f: impl Fn() -> Result<Arc<dyn DomainObject>> + Send + Sync + 'static,
    ) -> &mut Self {
        self.init_method = Some(Arc::new(f));
        self
    }

    pub fn attribute_reader(&mut self, predicate: impl Into<MethodPredicate>) -> &mut Self {
        self.attribute_reader = Some(predicate.into());
        self
    }

    pub fn attribute_writer(&mut self, predicate: impl Into<MethodPredicate>) -> &mut Self {
        self.attribute_writer = Some(predicate.into());
        self
    }

    pub fn dynamic_attribute_reader(&mut self, predicate: impl Into<MethodPredicate>) -> &mut Self {
        self.dynamic_attribute_reader = Some(predicate.into());
        self
    }

    pub fn persistence_method(&mut self, predicate: impl Into<MethodPredicate>) -> &mut Self {
        self.persistence_method = Some(predicate.into());
        self
    }

    pub fn destruction_method(&mut self, predicate: impl Into<MethodPredicate>) -> &mut Self {
        self.destruction_method = Some(predicate.into());
        self
    }

    pub fn proxy_instances(&mut self, predicate: impl Into<MethodPredicate>) -> &mut Self {
        self.proxy_instances = Some(predicate.into());
        self
    }

    pub fn mixin_module_proxies(&mut self, enabled: bool) -> &mut Self {
        self.mixin_module_proxies = Some(enabled);
        self
    }

    pub fn use_specialized_proxy(&mut self, enabled: bool) -> &mut Self {
        self.use_specialized_proxy = Some(enabled);
        self
    }

    pub fn dynamic_method(
        &mut self,
        method: &str,
        f: impl Fn(&Arc<ObjectProxy>, &[Value]) -> Result<Value> + Send + Sync + 'static,
    ) -> &mut Self {
        self.dynamic_methods.insert(method.to_string(), Arc::new(f));
        self
    }

    pub fn specialized_dispatch(
        &mut self,
        f: impl Fn(&Arc<ObjectProxy>, &str, &[Value]) -> Result<Option<CallResult>>
            + Send
            + Sync
            + 'static,
    ) -> &mut Self {
        self.specialized_dispatch = Some(Arc::new(f));
        self
    }
}

static REGISTRY: Lazy<DashMap<String, Arc<ClassConfig>>> = Lazy::new(DashMap::new);

/// Registers or updates the configuration for a class name.
///
/// Repeated calls for the same class merge: the closure receives the
/// previously registered configuration.
pub fn configure_class(class_name: &str, f: impl FnOnce(&mut ClassConfig)) {
    let mut config = REGISTRY
        .get(class_name)
        .map(|entry| (**entry.value()).clone())
        .unwrap_or_else(|| ClassConfig::new(class_name));
    f(&mut config);
    REGISTRY.insert(class_name.to_string(), Arc::new(config));
}

/// Removes every registered class configuration. Intended for tests that
/// re-register fixtures from scratch.
pub fn clear_class_registry() {
    REGISTRY.clear();
}

/// The configuration chain for one class: the class itself, its mixins when
/// enabled, then its ancestors. Options are resolved front to back, falling
/// back to system defaults.
pub struct ResolvedConfig {
    class_name: String,
    chain: Vec<Arc<ClassConfig>>,
}

impl ResolvedConfig {
    pub fn for_class(class_name: &str) -> Self {
        let mut chain = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut cursor = Some(class_name.to_string());

        while let Some(name) = cursor.take() {
            if !seen.insert(name.clone()) {
                break;
            }
            let Some(entry) = REGISTRY.get(&name) else {
                break;
            };
            let config = entry.value().clone();
            drop(entry);

            cursor = config.inherits.clone();
            let mixins_enabled = config.mixin_module_proxies.unwrap_or(false);
            let mixins = config.mixins.clone();
            chain.push(config);

            if mixins_enabled {
                for mixin in mixins {
                    if seen.insert(mixin.clone()) {
                        if let Some(mixin_entry) = REGISTRY.get(&mixin) {
                            chain.push(mixin_entry.value().clone());
                        }
                    }
                }
            }
        }

        Self {
            class_name: class_name.to_string(),
            chain,
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    fn first<T>(&self, pick: impl Fn(&ClassConfig) -> Option<T>) -> Option<T> {
        self.chain.iter().find_map(|config| pick(config))
    }

    /// The stable identifier of an existing object. Defaults to invoking
    /// `id` when no id method is configured anywhere in the chain.
    pub fn object_id(&self, object: &dyn DomainObject) -> Result<String> {
        match self.first(|c| c.id_method.clone()) {
            Some(MethodRef::Computed(f)) => f(object),
            Some(MethodRef::Named(name)) => self.invoke_string(object, &name),
            None => self.invoke_string(object, "id"),
        }
    }

    fn invoke_string(&self, object: &dyn DomainObject, method: &str) -> Result<String> {
        match object.invoke(method, &[])? {
            CallResult::Value(Value::String(s)) => Ok(s),
            CallResult::Value(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(Error::configuration(format!(
                "id method '{}' on class '{}' must return a string or number",
                method, self.class_name
            ))),
        }
    }

    pub fn lookup(&self, object_id: &str) -> Result<Option<Arc<dyn DomainObject>>> {
        let lookup = self
            .first(|c| c.lookup_method.clone())
            .ok_or_else(|| {
                Error::configuration(format!(
                    "class '{}' has no lookup_method configured",
                    self.class_name
                ))
            })?;
        lookup(object_id)
    }

    pub fn init(&self) -> Result<Arc<dyn DomainObject>> {
        let init = self.first(|c| c.init_method.clone()).ok_or_else(|| {
            Error::configuration(format!(
                "class '{}' has no init_method configured",
                self.class_name
            ))
        })?;
        init()
    }

    fn predicate(
        &self,
        pick: impl Fn(&ClassConfig) -> Option<MethodPredicate>,
        method: &str,
        object: &dyn Fn() -> Result<Arc<dyn DomainObject>>,
        default: bool,
    ) -> Result<bool> {
        match self.first(pick) {
            Some(predicate) => predicate.evaluate(&self.class_name, method, object),
            None => Ok(default),
        }
    }

    pub fn attribute_reader(
        &self,
        method: &str,
        object: &dyn Fn() -> Result<Arc<dyn DomainObject>>,
    ) -> Result<bool> {
        self.predicate(|c| c.attribute_reader.clone(), method, object, false)
    }

    pub fn attribute_writer(
        &self,
        method: &str,
        object: &dyn Fn() -> Result<Arc<dyn DomainObject>>,
    ) -> Result<bool> {
        self.predicate(|c| c.attribute_writer.clone(), method, object, false)
    }

    pub fn dynamic_attribute_reader(
        &self,
        method: &str,
        object: &dyn Fn() -> Result<Arc<dyn DomainObject>>,
    ) -> Result<bool> {
        self.predicate(|c| c.dynamic_attribute_reader.clone(), method, object, false)
    }

    pub fn persistence_method(
        &self,
        method: &str,
        object: &dyn Fn() -> Result<Arc<dyn DomainObject>>,
    ) -> Result<bool> {
        self.predicate(|c| c.persistence_method.clone(), method, object, false)
    }

    pub fn destruction_method(
        &self,
        method: &str,
        object: &dyn Fn() -> Result<Arc<dyn DomainObject>>,
    ) -> Result<bool> {
        self.predicate(|c| c.destruction_method.clone(), method, object, false)
    }

    /// Whether objects returned from forwarded calls on this class should be
    /// wrapped in proxies automatically.
    pub fn proxy_instances(
        &self,
        method: &str,
        object: &dyn Fn() -> Result<Arc<dyn DomainObject>>,
    ) -> Result<bool> {
        self.predicate(|c| c.proxy_instances.clone(), method, object, false)
    }

    pub fn use_specialized_proxy(&self) -> bool {
        self.first(|c| c.use_specialized_proxy).unwrap_or(true)
    }

    pub fn dynamic_method(&self, method: &str) -> Option<DynamicFn> {
        self.first(|c| c.dynamic_methods.get(method).cloned())
    }

    pub fn specialized_dispatch(&self) -> Option<SpecializedDispatch> {
        self.first(|c| c.specialized_dispatch.clone())
    }
}
