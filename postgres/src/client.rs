//! Connection setup.

use crate::config::PostgresConfig;
use crate::db::PgDb;
use platform_common_core::{Context, DbError};
use platform_common_runtime::Closer;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Owns the connection pool for one database.
///
/// ```no_run
/// use platform_common_core::Context;
/// use platform_common_postgres::{PgClient, PostgresConfig};
/// use platform_common_runtime::Closer;
///
/// # async fn example(closer: &Closer) -> Result<(), Box<dyn std::error::Error>> {
/// let client = PgClient::connect(&Context::background(), PostgresConfig::from_env()?).await?;
/// client.close_on(closer);
///
/// client.db().ping(&Context::background()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PgClient {
    db: PgDb,
}

impl PgClient {
    /// Open a pool and check that a connection can be established.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the connection fails or `ctx` ends first.
    pub async fn connect(ctx: &Context, config: PostgresConfig) -> Result<Self, DbError> {
        let pool = ctx
            .run(
                PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .acquire_timeout(config.connect_timeout())
                    .connect(&config.url),
            )
            .await?
            .map_err(|err| DbError::Driver(format!("failed to connect to db: {err}")))?;

        info!(
            max_connections = config.max_connections,
            log_queries = config.log_queries,
            "Connected to PostgreSQL"
        );

        Ok(Self::from_db(
            PgDb::new(pool).with_query_logging(config.log_queries),
        ))
    }

    /// Wrap an existing handle.
    #[must_use]
    pub const fn from_db(db: PgDb) -> Self {
        Self { db }
    }

    /// The database handle.
    #[must_use]
    pub const fn db(&self) -> &PgDb {
        &self.db
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.db.close().await;
        info!("PostgreSQL pool closed");
    }

    /// Close the pool when `closer` runs.
    pub fn close_on(&self, closer: &Closer) {
        let client = self.clone();
        closer.add_named("postgres-pool", move || async move {
            client.close().await;
            Ok::<(), DbError>(())
        });
    }
}
