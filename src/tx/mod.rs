//! Transactions, sections, and the per-thread manager.
//!
//! A [`Transaction`] is an ordered sequence of [`Section`]s (savepoints).
//! The [`TransactionManager`] keeps the per-thread stack of active
//! transactions and turns the [`Control`] value a block returns into the
//! matching lifecycle call.

mod manager;
mod section;
mod transaction;

pub use manager::{Control, TransactionContext, TransactionManager};
pub use section::Section;
pub use transaction::Transaction;
