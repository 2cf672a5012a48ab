//! Run business logic inside a database transaction.
//!
//! [`TxManager::run_in_transaction`] executes a handler either inside the
//! transaction already carried by the [`TxContext`], or inside a fresh one
//! that it begins, commits, or rolls back itself.
//!
//! # Nesting
//!
//! Only the outermost call owns the transaction. A call whose context already
//! carries a transaction runs the handler directly and never commits or rolls
//! back, so a service method can be transactional on its own and still be
//! composed into a larger unit of work:
//!
//! ```ignore
//! let manager = TxManager::new(pg_db);
//!
//! manager
//!     .read_committed(&ctx, |ctx| async move {
//!         users.create(&ctx, &user).await?;
//!         // Joins the outer transaction: no second BEGIN.
//!         audit_service.record(&ctx, "user created").await?;
//!         Ok::<_, ServiceError>(())
//!     })
//!     .await?;
//! ```
//!
//! # Lifecycle
//!
//! `NoTransaction -> TransactionOpen -> {Committed, RolledBack}`
//!
//! - handler `Ok` → commit; a commit failure replaces the handler's result
//! - handler `Err` or panic → rollback; a rollback failure is reported
//!   together with the original error
//!
//! The manager never logs. Every failure is returned to the caller.

use crate::transaction::{
    DbError, IsolationLevel, Transaction, TransactionError, Transactor, TxOptions,
};
use crate::tx_context::TxContext;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Executes handlers inside database transactions.
///
/// Cheap to clone; clones share the same [`Transactor`].
pub struct TxManager<D> {
    db: Arc<D>,
}

impl<D> TxManager<D>
where
    D: Transactor,
{
    /// Create a manager that opens transactions through `db`.
    #[must_use]
    pub fn new(db: D) -> Self {
        Self { db: Arc::new(db) }
    }

    /// Create a manager sharing an existing transactor.
    #[must_use]
    pub const fn from_arc(db: Arc<D>) -> Self {
        Self { db }
    }

    /// The underlying transactor.
    #[must_use]
    pub fn transactor(&self) -> &D {
        &self.db
    }

    /// Run `handler` inside a transaction.
    ///
    /// If `ctx` already carries a transaction the handler runs directly with
    /// `ctx` and this call performs no transaction operations. Otherwise a
    /// transaction is begun with `options`, attached to the context passed to
    /// the handler, and committed or rolled back according to the outcome.
    ///
    /// A panic in the handler is caught and treated as a failure by the call
    /// that began the transaction. Nested calls do not catch it, so the owning
    /// call rolls back even if an intermediate handler would have swallowed
    /// the error.
    ///
    /// # Errors
    ///
    /// - [`TransactionError::Begin`]: the transaction could not be opened (or
    ///   the context had already ended); the handler did not run
    /// - [`TransactionError::Handler`]: the handler failed; rolled back
    /// - [`TransactionError::Panic`]: the handler panicked; rolled back
    /// - [`TransactionError::Rollback`]: one of the two above, and the
    ///   rollback failed as well
    /// - [`TransactionError::Commit`]: the handler succeeded, commit failed
    pub async fn run_in_transaction<F, Fut, T, E>(
        &self,
        ctx: &TxContext<D::Tx>,
        options: TxOptions,
        handler: F,
    ) -> Result<T, TransactionError<E>>
    where
        F: FnOnce(TxContext<D::Tx>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if ctx.in_transaction() {
            // A panic here unwinds to the call that owns the transaction.
            return handler(ctx.clone()).await.map_err(TransactionError::Handler);
        }

        if let Some(err) = ctx.context().err() {
            return Err(TransactionError::Begin(DbError::Context(err)));
        }

        let tx = self
            .db
            .begin_tx(ctx.context(), options)
            .await
            .map_err(TransactionError::Begin)?;
        let tx = Arc::new(tx);

        let outcome = invoke(handler, ctx.with_tx(Arc::clone(&tx))).await;

        finalize(tx.as_ref(), ctx, outcome).await
    }

    /// [`run_in_transaction`](Self::run_in_transaction) with read committed
    /// isolation.
    ///
    /// # Errors
    ///
    /// See [`run_in_transaction`](Self::run_in_transaction).
    pub async fn read_committed<F, Fut, T, E>(
        &self,
        ctx: &TxContext<D::Tx>,
        handler: F,
    ) -> Result<T, TransactionError<E>>
    where
        F: FnOnce(TxContext<D::Tx>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_in_transaction(ctx, TxOptions::read_committed(), handler)
            .await
    }

    /// [`run_in_transaction`](Self::run_in_transaction) with repeatable read
    /// isolation.
    ///
    /// # Errors
    ///
    /// See [`run_in_transaction`](Self::run_in_transaction).
    pub async fn repeatable_read<F, Fut, T, E>(
        &self,
        ctx: &TxContext<D::Tx>,
        handler: F,
    ) -> Result<T, TransactionError<E>>
    where
        F: FnOnce(TxContext<D::Tx>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let options = TxOptions::new(IsolationLevel::RepeatableRead);
        self.run_in_transaction(ctx, options, handler).await
    }

    /// [`run_in_transaction`](Self::run_in_transaction) with serializable
    /// isolation.
    ///
    /// # Errors
    ///
    /// See [`run_in_transaction`](Self::run_in_transaction).
    pub async fn serializable<F, Fut, T, E>(
        &self,
        ctx: &TxContext<D::Tx>,
        handler: F,
    ) -> Result<T, TransactionError<E>>
    where
        F: FnOnce(TxContext<D::Tx>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let options = TxOptions::new(IsolationLevel::Serializable);
        self.run_in_transaction(ctx, options, handler).await
    }
}

impl<D> Clone for TxManager<D> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
        }
    }
}

impl<D> fmt::Debug for TxManager<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxManager").finish_non_exhaustive()
    }
}

/// Call the handler, converting a panic at any point into an error.
async fn invoke<F, Fut, T, E, X>(handler: F, ctx: TxContext<X>) -> Result<T, TransactionError<E>>
where
    F: FnOnce(TxContext<X>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let fut = std::panic::catch_unwind(AssertUnwindSafe(|| handler(ctx)))
        .map_err(|payload| TransactionError::Panic(panic_message(payload.as_ref())))?;

    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result.map_err(TransactionError::Handler),
        Err(payload) => Err(TransactionError::Panic(panic_message(payload.as_ref()))),
    }
}

/// Commit on success, roll back on failure. Runs exactly once per transaction.
async fn finalize<X, T, E>(
    tx: &X,
    ctx: &TxContext<X>,
    outcome: Result<T, TransactionError<E>>,
) -> Result<T, TransactionError<E>>
where
    X: Transaction,
{
    match outcome {
        Ok(value) => {
            tx.commit(ctx.context())
                .await
                .map_err(TransactionError::Commit)?;
            Ok(value)
        }
        Err(cause) => match tx.rollback(ctx.context()).await {
            Ok(()) => Err(cause),
            Err(rollback) => Err(TransactionError::Rollback {
                cause: Box::new(cause),
                rollback,
            }),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_from_str() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
    }

    #[test]
    fn test_panic_message_from_string() {
        let payload: Box<dyn Any + Send> = Box::new(String::from("formatted boom"));
        assert_eq!(panic_message(payload.as_ref()), "formatted boom");
    }

    #[test]
    fn test_panic_message_other_payload() {
        let payload: Box<dyn Any + Send> = Box::new(17_u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
