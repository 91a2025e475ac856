// ObjTx - persisted, resumable transaction engine for in-memory
// application objects.
//
// Mutations performed on proxied domain objects are held in a durable log
// instead of being applied; a transaction can be suspended, resumed from
// another process under the same identifier, and finally committed
// atomically with external interference detected at commit time.

pub mod common;
pub mod config;
pub mod error;
pub mod journal;
pub mod persistence;
pub mod proxy;
pub mod tx;

use std::sync::Arc;

pub use common::Value;
pub use config::{configure, configure_class, init_logging, ClassConfig, Config, MethodPredicate};
pub use error::{Error, LockKind, ReadIntegrityError, Result, WriteClashError};
pub use proxy::{CallResult, ClassProxy, DomainObject, ObjectProxy};
pub use tx::{Control, Transaction, TransactionContext, TransactionManager};

/// Runs a transaction block, creating or resuming the transaction with the
/// given identifier. Returns the identifier (generated when absent) so the
/// transaction can be resumed later.
///
/// The block receives a [`TransactionContext`] and returns a [`Control`]
/// value deciding what happens to the accumulated state: suspend it for
/// later, commit it, discard it, or run the block again.
pub fn transaction<F>(identifier: Option<&str>, block: F) -> Result<String>
where
    F: FnMut(&TransactionContext) -> Result<Control>,
{
    TransactionManager::with_transaction(identifier.map(str::to_string), block)
}

/// Identifiers of all transactions with persisted state in the configured
/// adapter: transactions that were suspended and can be resumed or swept.
pub fn pending_transactions() -> Result<Vec<String>> {
    config::adapter()?.transaction_identifiers()
}

/// Wraps a domain object in the innermost active transaction of this
/// thread. Fails outside a transaction block.
pub fn wrap(object: Arc<dyn DomainObject>) -> Result<Arc<ObjectProxy>> {
    let transaction = TransactionManager::current_transaction()
        .ok_or_else(|| Error::Configuration("no active transaction on this thread".to_string()))?;
    transaction.wrap(object)
}
