//! Ambient transaction slot.
//!
//! [`TxContext`] pairs a [`Context`] with an optional open transaction. It is
//! what transactional handlers and data-access code receive: when a
//! transaction is attached, queries run inside it and nested
//! [`TxManager`](crate::tx_manager::TxManager) calls join it instead of
//! opening a new one.
//!
//! The handle lives next to the context rather than inside its value bag so
//! the type of the transaction is known statically.

use crate::context::Context;
use std::fmt;
use std::sync::Arc;

/// A [`Context`] plus the transaction it runs in, if any.
pub struct TxContext<T> {
    ctx: Context,
    tx: Option<Arc<T>>,
}

impl<T> TxContext<T> {
    /// Wrap a context that is not (yet) inside a transaction.
    #[must_use]
    pub const fn new(ctx: Context) -> Self {
        Self { ctx, tx: None }
    }

    /// The general-purpose execution context.
    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.ctx
    }

    /// The ambient transaction, if one is attached.
    #[must_use]
    pub const fn tx(&self) -> Option<&Arc<T>> {
        self.tx.as_ref()
    }

    /// Whether a transaction is attached.
    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Derive a context with `tx` attached, replacing any current one.
    #[must_use]
    pub fn with_tx(&self, tx: Arc<T>) -> Self {
        Self {
            ctx: self.ctx.clone(),
            tx: Some(tx),
        }
    }

    /// Derive a context that swaps in `ctx` but keeps the transaction.
    ///
    /// Use this to add values or a tighter deadline inside a handler.
    #[must_use]
    pub fn with_context(&self, ctx: Context) -> Self {
        Self {
            ctx,
            tx: self.tx.clone(),
        }
    }
}

impl<T> Clone for TxContext<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<T> From<Context> for TxContext<T> {
    fn from(ctx: Context) -> Self {
        Self::new(ctx)
    }
}

impl<T> Default for TxContext<T> {
    fn default() -> Self {
        Self::new(Context::background())
    }
}

impl<T> fmt::Debug for TxContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxContext")
            .field("ctx", &self.ctx)
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}
