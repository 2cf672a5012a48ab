//! Transaction handle.

use platform_common_core::{Context, DbError, DbFuture, Transaction};
use sqlx::Postgres;
use tokio::sync::{Mutex, MutexGuard};

/// An open `PostgreSQL` transaction.
///
/// Shared behind an `Arc` by everything running inside the unit of work.
/// Statements are serialized on the single underlying connection.
///
/// If the handle is dropped without being finalized, or a cancelled context
/// interrupts `commit`/`rollback`, sqlx rolls the transaction back when the
/// connection returns to the pool.
pub struct PgTx {
    inner: Mutex<Option<sqlx::Transaction<'static, Postgres>>>,
}

impl PgTx {
    pub(crate) fn new(tx: sqlx::Transaction<'static, Postgres>) -> Self {
        Self {
            inner: Mutex::new(Some(tx)),
        }
    }

    /// Lock the transaction for a statement. `None` once finalized.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Option<sqlx::Transaction<'static, Postgres>>> {
        self.inner.lock().await
    }

    /// Whether the transaction is still open.
    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    async fn take(&self) -> Result<sqlx::Transaction<'static, Postgres>, DbError> {
        self.inner
            .lock()
            .await
            .take()
            .ok_or(DbError::TransactionClosed)
    }
}

impl Transaction for PgTx {
    fn commit<'a>(&'a self, ctx: &'a Context) -> DbFuture<'a, ()> {
        Box::pin(async move {
            let tx = self.take().await?;
            ctx.run(tx.commit()).await?.map_err(crate::driver_error)
        })
    }

    fn rollback<'a>(&'a self, ctx: &'a Context) -> DbFuture<'a, ()> {
        Box::pin(async move {
            let tx = self.take().await?;
            ctx.run(tx.rollback()).await?.map_err(crate::driver_error)
        })
    }
}

impl std::fmt::Debug for PgTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // `None` while a statement holds the lock.
        let open = self.inner.try_lock().map(|guard| guard.is_some()).ok();
        f.debug_struct("PgTx").field("open", &open).finish()
    }
}
