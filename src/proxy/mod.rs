//! Transparent object proxies.
//!
//! The proxy layer is the public face of the engine inside a transaction:
//! every method call on an [`ObjectProxy`] is classified against the class
//! configuration and rewritten into log entries instead of touching the
//! underlying object. Domain objects stay out of scope; the host registers
//! them behind the dyn-dispatched [`DomainObject`] seam.

mod cache;
mod class_proxy;
mod object_proxy;

use std::fmt;
use std::sync::Arc;

pub use cache::ProxyCache;
pub use class_proxy::ClassProxy;
pub use object_proxy::ObjectProxy;

use crate::common::Value;
use crate::error::{Error, Result};

/// The seam between the engine and the host's domain objects.
///
/// `invoke` is the dynamic dispatch surface: the engine calls readers,
/// writers, persistence methods, and destructors by name. Writer method
/// names carry a trailing `=` by convention (`"first="`).
pub trait DomainObject: Send + Sync {
    /// The registered class name this object belongs to.
    fn class_name(&self) -> &str;

    /// Invokes a method on the object.
    fn invoke(&self, method: &str, args: &[Value]) -> Result<CallResult>;
}

impl fmt::Debug for dyn DomainObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomainObject({})", self.class_name())
    }
}

/// The result of invoking a method through a proxy or on a domain object.
///
/// Hosts return `Value` for readers and plain methods, and `Object` for
/// methods yielding further domain objects (which the proxy fallback may
/// re-wrap). `Proxy` is produced by the engine only.
pub enum CallResult {
    Value(Value),
    Object(Arc<dyn DomainObject>),
    Proxy(Arc<ObjectProxy>),
}

impl CallResult {
    /// Unwraps a plain value result.
    pub fn into_value(self) -> Result<Value> {
        match self {
            CallResult::Value(value) => Ok(value),
            CallResult::Object(object) => Err(Error::configuration(format!(
                "expected a value result, got an object of class '{}'",
                object.class_name()
            ))),
            CallResult::Proxy(proxy) => Err(Error::configuration(format!(
                "expected a value result, got a proxy for '{}'",
                proxy.object_key()
            ))),
        }
    }
}

impl fmt::Debug for CallResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallResult::Value(value) => f.debug_tuple("Value").field(value).finish(),
            CallResult::Object(object) => {
                f.debug_tuple("Object").field(&object.class_name()).finish()
            }
            CallResult::Proxy(proxy) => f.debug_tuple("Proxy").field(&proxy.object_key()).finish(),
        }
    }
}
