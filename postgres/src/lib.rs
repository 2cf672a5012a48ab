//! `PostgreSQL` adapter for the platform-common transaction manager.
//!
//! This crate plugs a sqlx connection pool into
//! [`TxManager`](platform_common_core::TxManager):
//!
//! - [`PgDb`] implements [`Transactor`](platform_common_core::Transactor) and
//!   routes statements through the ambient transaction when there is one
//! - [`PgTx`] is the shared transaction handle
//! - [`PgClient`] owns the pool and can register its shutdown with a
//!   [`Closer`](platform_common_runtime::Closer)
//! - [`Query`] names a statement and carries its arguments; [`pretty`]
//!   renders it on one line for logs
//!
//! # Example
//!
//! ```no_run
//! use platform_common_core::{Context, TxManager};
//! use platform_common_postgres::{PgClient, PgTxContext, PostgresConfig, Query};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = PgClient::connect(&Context::background(), PostgresConfig::from_env()?).await?;
//! let db = client.db().clone();
//! let manager = TxManager::new(db.clone());
//!
//! manager
//!     .read_committed(&PgTxContext::default(), |ctx| async move {
//!         db.exec(&ctx, &Query::new("debit", "UPDATE accounts SET balance = balance - $1 WHERE id = $2").arg(10_i64).arg(1_i64)).await?;
//!         db.exec(&ctx, &Query::new("credit", "UPDATE accounts SET balance = balance + $1 WHERE id = $2").arg(10_i64).arg(2_i64)).await?;
//!         Ok::<_, platform_common_core::DbError>(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod db;
pub mod query;
pub mod tx;

pub use client::PgClient;
pub use config::{ConfigError, PostgresConfig};
pub use db::{PgDb, PgTxContext};
pub use query::{Arg, Placeholder, Query, pretty};
pub use tx::PgTx;

use platform_common_core::DbError;

#[allow(clippy::needless_pass_by_value)] // Used as a `map_err` adapter
fn driver_error(err: sqlx::Error) -> DbError {
    DbError::Driver(err.to_string())
}
