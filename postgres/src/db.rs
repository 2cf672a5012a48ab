//! Pool-backed database handle.
//!
//! Every statement goes through the transaction carried by the
//! [`TxContext`] when there is one, and straight to the pool otherwise, so
//! repository code is written once and works both inside and outside
//! [`TxManager`](platform_common_core::TxManager) units of work.

use crate::driver_error;
use crate::query::Query;
use crate::tx::PgTx;
use platform_common_core::{Context, DbError, DbFuture, Transactor, TxContext, TxOptions};
use sqlx::postgres::{PgQueryResult, PgRow};
use sqlx::{Connection, PgPool};
use std::sync::Arc;
use tracing::debug;

/// Transaction context for the `PostgreSQL` adapter.
pub type PgTxContext = TxContext<PgTx>;

/// Database handle over a connection pool. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PgDb {
    pool: PgPool,
    log_queries: bool,
}

impl PgDb {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            log_queries: false,
        }
    }

    /// Log every statement at `debug` with its arguments inlined.
    #[must_use]
    pub const fn with_query_logging(mut self, enabled: bool) -> Self {
        self.log_queries = enabled;
        self
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Execute a statement that returns no rows.
    ///
    /// Returns the number of rows affected.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the statement fails, the context ends first, or
    /// the ambient transaction is already closed.
    pub async fn exec(&self, ctx: &PgTxContext, query: &Query) -> Result<u64, DbError> {
        self.log_query(query);
        let result = ctx.context().run(self.execute(ctx.tx(), query)).await??;
        Ok(result.rows_affected())
    }

    /// Run a query and collect every row.
    ///
    /// # Errors
    ///
    /// See [`exec`](Self::exec).
    pub async fn fetch_all(&self, ctx: &PgTxContext, query: &Query) -> Result<Vec<PgRow>, DbError> {
        self.log_query(query);
        ctx.context().run(self.all(ctx.tx(), query)).await?
    }

    /// Run a query expected to return at most one row.
    ///
    /// # Errors
    ///
    /// See [`exec`](Self::exec).
    pub async fn fetch_optional(
        &self,
        ctx: &PgTxContext,
        query: &Query,
    ) -> Result<Option<PgRow>, DbError> {
        self.log_query(query);
        ctx.context().run(self.optional(ctx.tx(), query)).await?
    }

    /// Check that a pooled connection is alive.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if no connection can be acquired or the ping fails.
    pub async fn ping(&self, ctx: &Context) -> Result<(), DbError> {
        ctx.run(self.ping_pool()).await?
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn log_query(&self, query: &Query) {
        if self.log_queries {
            debug!(sql = %query.name, query = %query.pretty(), "Executing query");
        }
    }

    async fn ping_pool(&self) -> Result<(), DbError> {
        let mut conn = self.pool.acquire().await.map_err(driver_error)?;
        conn.ping().await.map_err(driver_error)
    }

    async fn execute(&self, tx: Option<&Arc<PgTx>>, query: &Query) -> Result<PgQueryResult, DbError> {
        let statement = query.to_sqlx();
        match tx {
            Some(tx) => {
                let mut guard = tx.lock().await;
                let conn = guard.as_deref_mut().ok_or(DbError::TransactionClosed)?;
                statement.execute(conn).await.map_err(driver_error)
            }
            None => statement.execute(&self.pool).await.map_err(driver_error),
        }
    }

    async fn all(&self, tx: Option<&Arc<PgTx>>, query: &Query) -> Result<Vec<PgRow>, DbError> {
        let statement = query.to_sqlx();
        match tx {
            Some(tx) => {
                let mut guard = tx.lock().await;
                let conn = guard.as_deref_mut().ok_or(DbError::TransactionClosed)?;
                statement.fetch_all(conn).await.map_err(driver_error)
            }
            None => statement.fetch_all(&self.pool).await.map_err(driver_error),
        }
    }

    async fn optional(&self, tx: Option<&Arc<PgTx>>, query: &Query) -> Result<Option<PgRow>, DbError> {
        let statement = query.to_sqlx();
        match tx {
            Some(tx) => {
                let mut guard = tx.lock().await;
                let conn = guard.as_deref_mut().ok_or(DbError::TransactionClosed)?;
                statement.fetch_optional(conn).await.map_err(driver_error)
            }
            None => statement.fetch_optional(&self.pool).await.map_err(driver_error),
        }
    }

    async fn begin(&self, options: TxOptions) -> Result<PgTx, DbError> {
        let mut tx = self.pool.begin().await.map_err(driver_error)?;
        sqlx::query(&options.set_transaction_sql())
            .execute(&mut *tx)
            .await
            .map_err(driver_error)?;

        debug!(options = %options.set_transaction_sql(), "Transaction started");
        Ok(PgTx::new(tx))
    }
}

impl Transactor for PgDb {
    type Tx = PgTx;

    fn begin_tx<'a>(&'a self, ctx: &'a Context, options: TxOptions) -> DbFuture<'a, PgTx> {
        Box::pin(async move { ctx.run(self.begin(options)).await? })
    }
}
