//! Shared fixture: an in-memory user class and its registry, standing in
//! for the host application's domain objects.

// Not every test binary exercises every fixture helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use objtx::{CallResult, DomainObject, Error, MethodPredicate, Result};

/// In-memory registry of published users, playing the role of the
/// application's persistence layer. Lookups only find published users;
/// `save` publishes.
pub struct UserStore {
    users: Mutex<HashMap<String, Arc<SimpleUser>>>,
    next_generated: AtomicU64,
}

impl UserStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            users: Mutex::new(HashMap::new()),
            next_generated: AtomicU64::new(0),
        })
    }

    /// Creates and publishes a user with a fixed id.
    pub fn create(self: &Arc<Self>, id: &str, attributes: &[(&str, Value)]) -> Arc<SimpleUser> {
        let user = SimpleUser::detached_with_id(self, id);
        for (attribute, value) in attributes {
            user.set_attr(attribute, value.clone());
        }
        self.publish(user.clone());
        user
    }

    pub fn get(&self, id: &str) -> Option<Arc<SimpleUser>> {
        self.users.lock().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<SimpleUser>> {
        self.users.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.users.lock().len()
    }

    fn publish(&self, user: Arc<SimpleUser>) {
        self.users.lock().insert(user.id().to_string(), user);
    }

    fn remove(&self, id: &str) {
        self.users.lock().remove(id);
    }

    fn generated_id(&self) -> String {
        format!("g{}", self.next_generated.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// A plain domain object with `first`/`last` attributes, a `save`
/// persistence method, and a `destroy` destructor.
pub struct SimpleUser {
    id: String,
    attributes: Mutex<HashMap<String, Value>>,
    saved: AtomicBool,
    destroyed: AtomicBool,
    store: Weak<UserStore>,
    me: Mutex<Weak<SimpleUser>>,
}

impl SimpleUser {
    fn detached_with_id(store: &Arc<UserStore>, id: &str) -> Arc<Self> {
        let user = Arc::new(Self {
            id: id.to_string(),
            attributes: Mutex::new(HashMap::new()),
            saved: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            store: Arc::downgrade(store),
            me: Mutex::new(Weak::new()),
        });
        *user.me.lock() = Arc::downgrade(&user);
        user
    }

    /// A fresh, unpublished user, as the class's init method produces it.
    pub fn detached(store: &Arc<UserStore>) -> Arc<Self> {
        let id = store.generated_id();
        Self::detached_with_id(store, &id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Direct attribute read, bypassing any transaction ("external" view).
    pub fn attr(&self, attribute: &str) -> Value {
        self.attributes
            .lock()
            .get(attribute)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Direct attribute write, bypassing any transaction.
    pub fn set_attr(&self, attribute: &str, value: Value) {
        self.attributes.lock().insert(attribute.to_string(), value);
    }

    pub fn saved(&self) -> bool {
        self.saved.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl DomainObject for SimpleUser {
    fn class_name(&self) -> &str {
        "SimpleUser"
    }

    fn invoke(&self, method: &str, args: &[Value]) -> Result<CallResult> {
        match method {
            "id" => Ok(CallResult::Value(Value::String(self.id.clone()))),
            "save" => {
                if let (Some(store), Some(me)) = (self.store.upgrade(), self.me.lock().upgrade()) {
                    store.publish(me);
                }
                self.saved.store(true, Ordering::SeqCst);
                Ok(CallResult::Value(Value::Bool(true)))
            }
            "destroy" => {
                if let Some(store) = self.store.upgrade() {
                    store.remove(&self.id);
                }
                self.destroyed.store(true, Ordering::SeqCst);
                Ok(CallResult::Value(Value::Bool(true)))
            }
            "twin" => {
                let me = self.me.lock().upgrade().ok_or_else(|| {
                    Error::Configuration("user handle is gone".to_string())
                })?;
                Ok(CallResult::Object(me as Arc<dyn DomainObject>))
            }
            _ => {
                if let Some(attribute) = method.strip_suffix('=') {
                    let value = args.first().cloned().ok_or_else(|| {
                        Error::Configuration(format!("writer '{}' needs a value", method))
                    })?;
                    self.attributes
                        .lock()
                        .insert(attribute.to_string(), value.clone());
                    return Ok(CallResult::Value(value));
                }
                Ok(CallResult::Value(self.attr(method)))
            }
        }
    }
}

/// Coerces a fixture user into the engine's object seam.
pub fn domain(user: &Arc<SimpleUser>) -> Arc<dyn DomainObject> {
    user.clone()
}

/// Registers the `SimpleUser` class against a fresh store.
pub fn configure_simple_users(store: &Arc<UserStore>) {
    objtx::config::clear_class_registry();

    let lookup_store = store.clone();
    let init_store = store.clone();
    objtx::configure_class("SimpleUser", |c| {
        c.id_method("id")
            .lookup_with(move |id| {
                Ok(lookup_store
                    .get(id)
                    .map(|user| user as Arc<dyn DomainObject>))
            })
            .init_with(move || Ok(SimpleUser::detached(&init_store) as Arc<dyn DomainObject>))
            .attribute_reader(MethodPredicate::one_of(&["first", "last"]))
            .attribute_writer(MethodPredicate::writers_of(&["first", "last"]))
            .persistence_method(MethodPredicate::one_of(&["save"]))
            .destruction_method(MethodPredicate::one_of(&["destroy"]));
    });
}

/// Points the engine at an isolated storage directory and installs a fresh
/// user registry. Returns the guard keeping the directory alive plus the
/// store.
pub fn setup(instant_read_integrity_fail: bool) -> (tempfile::TempDir, Arc<UserStore>) {
    let dir = tempfile::tempdir().expect("failed to create a temporary storage directory");
    objtx::configure(|c| {
        c.storage_directory(dir.path().join("store"))
            .instant_read_integrity_fail(instant_read_integrity_fail);
    });
    objtx::init_logging();

    let store = UserStore::new();
    configure_simple_users(&store);
    (dir, store)
}
