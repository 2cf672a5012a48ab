//! # Platform Common Core
//!
//! Execution context and transaction propagation primitives for server
//! processes.
//!
//! ## Modules
//!
//! - [`context`]: request-scoped [`Context`] with typed values, hierarchical
//!   cancellation and deadlines
//! - [`tx_context`]: [`TxContext`], a context plus the ambient transaction
//! - [`transaction`]: the database collaborator contract ([`Transactor`],
//!   [`Transaction`]), transaction options and errors
//! - [`tx_manager`]: [`TxManager`], which runs handlers inside transactions
//!   and joins an ambient one when present
//!
//! ## Example
//!
//! ```ignore
//! use platform_common_core::{Context, TxContext, TxManager};
//!
//! let manager = TxManager::new(db);
//! let ctx = TxContext::new(Context::background());
//!
//! let order_id = manager
//!     .read_committed(&ctx, |ctx| async move {
//!         let id = orders.insert(&ctx, &order).await?;
//!         stock.reserve(&ctx, &order.items).await?;
//!         Ok::<_, AppError>(id)
//!     })
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod context;
pub mod transaction;
pub mod tx_context;
pub mod tx_manager;

pub use context::{CancelHandle, Context, ContextError};
pub use transaction::{
    AccessMode, DbError, DbFuture, IsolationLevel, Transaction, TransactionError, Transactor,
    TxOptions,
};
pub use tx_context::TxContext;
pub use tx_manager::TxManager;
