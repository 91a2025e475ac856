use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use uuid::Uuid;

use crate::common::{self, Value};
use crate::config;
use crate::error::{Error, ReadIntegrityError, Result, WriteClashError};
use crate::proxy::{ClassProxy, DomainObject, ObjectProxy};
use crate::tx::Transaction;

/// How a transaction block asks the manager to proceed.
///
/// Control flow out of a block is a value, not an exception: the block
/// returns one of these and the manager reacts. `Suspend` is the normal
/// ending: the current section is persisted so the transaction can be
/// resumed later under the same identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Persist the current section and leave the transaction resumable.
    Suspend,
    /// Commit all accumulated sections against the live objects.
    Commit,
    /// Discard the current section's pending state.
    Rollback,
    /// Discard the whole transaction, including persisted sections.
    Reset,
    /// Discard the current section and run the block again.
    Retry,
    /// Leave the block without persisting anything.
    Abort,
}

enum AfterBlock {
    Done,
    Restart,
}

/// Per-thread stack of active transactions.
///
/// A thread has at most one manager; it exists while at least one
/// transaction block is running and disappears when the stack empties.
/// Nested blocks stack; the innermost transaction is the current one.
pub struct TransactionManager {
    stack: RefCell<Vec<Arc<Transaction>>>,
}

thread_local! {
    static MANAGER: RefCell<Option<Rc<TransactionManager>>> = const { RefCell::new(None) };
}

impl TransactionManager {
    fn within_instance<R>(f: impl FnOnce(&Rc<TransactionManager>) -> R) -> R {
        let manager = MANAGER.with(|slot| {
            slot.borrow_mut()
                .get_or_insert_with(|| {
                    Rc::new(TransactionManager {
                        stack: RefCell::new(Vec::new()),
                    })
                })
                .clone()
        });

        let result = f(&manager);

        MANAGER.with(|slot| {
            if manager.stack.borrow().is_empty() {
                *slot.borrow_mut() = None;
            }
        });
        result
    }

    /// The innermost active transaction of the current thread.
    pub fn current_transaction() -> Option<Arc<Transaction>> {
        MANAGER.with(|slot| {
            slot.borrow()
                .as_ref()
                .and_then(|manager| manager.stack.borrow().last().cloned())
        })
    }

    /// Runs a transaction block, creating or resuming the transaction with
    /// the given identifier (a fresh UUID when absent). Returns the
    /// identifier so the caller can resume the transaction later.
    pub fn with_transaction<F>(identifier: Option<String>, mut block: F) -> Result<String>
    where
        F: FnMut(&TransactionContext) -> Result<Control>,
    {
        let identifier = identifier.unwrap_or_else(|| Uuid::new_v4().to_string());
        if identifier.is_empty() || identifier.contains('/') {
            return Err(Error::configuration(format!(
                "invalid transaction identifier '{}': must be non-empty and must not contain '/'",
                identifier
            )));
        }

        Self::within_instance(|manager| loop {
            let adapter = config::adapter()?;
            let transaction = Transaction::open(identifier.clone(), adapter)?;
            manager.stack.borrow_mut().push(transaction.clone());

            let context = TransactionContext::new(transaction.clone());
            let outcome = block(&context);
            let after = Self::conclude(&transaction, outcome);

            manager.stack.borrow_mut().pop();
            match after {
                Ok(AfterBlock::Done) => return Ok(identifier),
                Ok(AfterBlock::Restart) => continue,
                Err(error) => return Err(error),
            }
        })
    }

    fn conclude(transaction: &Arc<Transaction>, outcome: Result<Control>) -> Result<AfterBlock> {
        match outcome {
            Ok(Control::Suspend) => match transaction.persist() {
                Ok(_) => Ok(AfterBlock::Done),
                Err(error) => {
                    let _ = transaction.rollback();
                    Err(error)
                }
            },
            Ok(Control::Commit) => match transaction.commit() {
                Ok(()) => Ok(AfterBlock::Done),
                Err(error) if error.is_integrity_conflict() => {
                    let _ = transaction.reset();
                    Err(error)
                }
                // Lock contention and adapter failures leave the persisted
                // state in place so the commit can be retried later.
                Err(error) => Err(error),
            },
            Ok(Control::Rollback) => transaction.rollback().map(|_| AfterBlock::Done),
            Ok(Control::Reset) => transaction.reset().map(|_| AfterBlock::Done),
            Ok(Control::Retry) => transaction.rollback().map(|_| AfterBlock::Restart),
            Ok(Control::Abort) => Ok(AfterBlock::Done),
            Err(error) => {
                // Unresolved conflicts and unexpected errors escaping the
                // block force a full reset before propagating.
                let _ = transaction.reset();
                Err(error)
            }
        }
    }
}

/// The handle a transaction block receives.
///
/// Everything the block does with domain objects goes through here: wrapping
/// objects into proxies, creating new objects via class proxies, and
/// resolving integrity conflicts.
pub struct TransactionContext {
    transaction: Arc<Transaction>,
}

impl TransactionContext {
    pub(crate) fn new(transaction: Arc<Transaction>) -> Self {
        Self { transaction }
    }

    pub fn identifier(&self) -> &str {
        self.transaction.identifier()
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    /// Wraps a domain object into this transaction's proxy for it.
    pub fn wrap(&self, object: Arc<dyn DomainObject>) -> Result<Arc<ObjectProxy>> {
        self.transaction.wrap(object)
    }

    /// A class-level proxy used to create objects inside the transaction.
    pub fn class_proxy(&self, class_name: &str) -> ClassProxy {
        ClassProxy::new(Arc::downgrade(&self.transaction), class_name)
    }

    /// Acknowledges an external change to a read attribute; see
    /// [`Transaction::ignore_read_conflict`].
    pub fn ignore_read_conflict(
        &self,
        error: &ReadIntegrityError,
        update_value: bool,
    ) -> Result<()> {
        self.transaction.ignore_read_conflict(error, update_value)
    }

    /// Resolves a write clash keeping the transaction's value.
    pub fn keep_ours(&self, error: &WriteClashError) -> Result<()> {
        self.transaction.keep_ours(error)
    }

    /// Resolves a write clash discarding the transaction's change.
    pub fn use_theirs(&self, error: &WriteClashError) -> Result<()> {
        self.transaction.use_theirs(error)
    }

    /// The transaction's pending write value for a proxied attribute.
    pub fn write_set_value(&self, proxy: &ObjectProxy, attribute: &str) -> Option<Value> {
        self.transaction
            .attribute_value(&common::attribute_key(proxy.object_key(), attribute))
    }

    /// The transaction's last read value for a proxied attribute.
    pub fn read_set_value(&self, proxy: &ObjectProxy, attribute: &str) -> Option<Value> {
        self.transaction
            .read_attribute_value(&common::attribute_key(proxy.object_key(), attribute))
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    fn isolated_storage() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        config::configure(|c| {
            c.storage_directory(dir.path().join("store"));
        });
        dir
    }

    #[test]
    #[serial]
    fn test_generated_identifier_is_returned() {
        let _dir = isolated_storage();
        let identifier =
            TransactionManager::with_transaction(None, |_tx| Ok(Control::Abort)).unwrap();
        assert!(!identifier.is_empty());
        assert!(!identifier.contains('/'));
    }

    #[test]
    #[serial]
    fn test_identifier_with_slash_is_rejected() {
        let _dir = isolated_storage();
        let err = TransactionManager::with_transaction(Some("a/b".to_string()), |_tx| {
            Ok(Control::Abort)
        })
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    #[serial]
    fn test_retry_reruns_the_block() {
        let _dir = isolated_storage();
        let mut runs = 0;
        TransactionManager::with_transaction(Some("tr-retry".to_string()), |_tx| {
            runs += 1;
            if runs < 3 {
                Ok(Control::Retry)
            } else {
                Ok(Control::Abort)
            }
        })
        .unwrap();
        assert_eq!(runs, 3);
    }

    #[test]
    #[serial]
    fn test_manager_is_removed_when_stack_empties() {
        let _dir = isolated_storage();
        TransactionManager::with_transaction(Some("tr-stack".to_string()), |_tx| {
            assert!(TransactionManager::current_transaction().is_some());
            Ok(Control::Abort)
        })
        .unwrap();
        assert!(TransactionManager::current_transaction().is_none());
    }

    #[test]
    #[serial]
    fn test_nested_transactions_stack() {
        let _dir = isolated_storage();
        TransactionManager::with_transaction(Some("outer".to_string()), |_outer| {
            TransactionManager::with_transaction(Some("inner".to_string()), |inner| {
                assert_eq!(inner.identifier(), "inner");
                let current = TransactionManager::current_transaction().unwrap();
                assert_eq!(current.identifier(), "inner");
                Ok(Control::Abort)
            })?;
            let current = TransactionManager::current_transaction().unwrap();
            assert_eq!(current.identifier(), "outer");
            Ok(Control::Abort)
        })
        .unwrap();
    }

    #[test]
    #[serial]
    fn test_escaping_error_resets_the_transaction() {
        let _dir = isolated_storage();
        let err = TransactionManager::with_transaction(Some("tr-err".to_string()), |tx| {
            tx.transaction().log_attribute_change(
                "User/1",
                false,
                "first",
                serde_json::json!("John"),
                serde_json::json!("Foo"),
                "first=",
            );
            tx.transaction()
                .log_object_persistence("User/1", false, "save", Vec::new());
            Err(Error::configuration("boom"))
        })
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        // Nothing survived the reset.
        let adapter = config::adapter().unwrap();
        assert!(adapter.savepoints("tr-err").unwrap().is_empty());
    }
}
