//! Database collaborator contract and transaction errors.
//!
//! The transaction manager only ever needs three operations from a database
//! driver: begin a transaction, commit it, and roll it back. They are
//! expressed as two traits:
//!
//! - [`Transactor`]: something that can open a transaction (a pool, a client)
//! - [`Transaction`]: an open transaction handle
//!
//! Implementations:
//!
//! - `PgDb` / `PgTx` (in `platform-common-postgres`): production, backed by sqlx
//! - `MockTransactor` / `MockTx` (in `platform-common-testing`): call counting
//!   and failure injection for tests
//!
//! # Dyn Compatibility
//!
//! Both traits return `Pin<Box<dyn Future>>` rather than using `async fn` so
//! that handles can be stored and passed around as trait objects.

use crate::context::{Context, ContextError};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by the collaborator traits.
pub type DbFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DbError>> + Send + 'a>>;

/// Errors reported by the database collaborator.
#[derive(Error, Debug)]
pub enum DbError {
    /// The driver reported a failure.
    #[error("Database error: {0}")]
    Driver(String),

    /// The context ended before or during the operation.
    #[error("Database operation aborted: {0}")]
    Context(#[from] ContextError),

    /// The transaction was already committed or rolled back.
    #[error("Transaction already closed")]
    TransactionClosed,
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    /// Dirty reads allowed (`PostgreSQL` treats this as read committed).
    ReadUncommitted,
    /// Each statement sees only data committed before it began.
    #[default]
    ReadCommitted,
    /// All statements see a snapshot taken at the first statement.
    RepeatableRead,
    /// Full serializability; may fail with serialization errors.
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling, as used in `SET TRANSACTION ISOLATION LEVEL`.
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Whether the transaction may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccessMode {
    /// Reads and writes allowed.
    #[default]
    ReadWrite,
    /// Writes rejected by the database.
    ReadOnly,
}

impl AccessMode {
    /// SQL spelling, as used in `SET TRANSACTION`.
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::ReadWrite => "READ WRITE",
            Self::ReadOnly => "READ ONLY",
        }
    }
}

/// Options for beginning a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TxOptions {
    /// Isolation level
    pub isolation: IsolationLevel,
    /// Read/write mode
    pub access_mode: AccessMode,
    /// Only meaningful for serializable, read-only transactions
    pub deferrable: bool,
}

impl TxOptions {
    /// Options with the given isolation level and defaults otherwise.
    #[must_use]
    pub const fn new(isolation: IsolationLevel) -> Self {
        Self {
            isolation,
            access_mode: AccessMode::ReadWrite,
            deferrable: false,
        }
    }

    /// Read committed, read-write.
    #[must_use]
    pub const fn read_committed() -> Self {
        Self::new(IsolationLevel::ReadCommitted)
    }

    /// Set the access mode.
    #[must_use]
    pub const fn access_mode(mut self, access_mode: AccessMode) -> Self {
        self.access_mode = access_mode;
        self
    }

    /// Mark the transaction deferrable.
    #[must_use]
    pub const fn deferrable(mut self, deferrable: bool) -> Self {
        self.deferrable = deferrable;
        self
    }

    /// Full `SET TRANSACTION` statement for these options.
    #[must_use]
    pub fn set_transaction_sql(&self) -> String {
        let deferrable = if self.deferrable {
            "DEFERRABLE"
        } else {
            "NOT DEFERRABLE"
        };
        format!(
            "SET TRANSACTION ISOLATION LEVEL {}, {}, {deferrable}",
            self.isolation.as_sql(),
            self.access_mode.as_sql(),
        )
    }
}

/// An open database transaction.
///
/// Commit and rollback borrow the handle because it is shared (`Arc`) with
/// the handler for the duration of the unit of work. A handle must be
/// finalized at most once; later calls fail with [`DbError::TransactionClosed`].
pub trait Transaction: Send + Sync + 'static {
    /// Commit the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the commit fails, the context ended, or the
    /// transaction was already closed.
    fn commit<'a>(&'a self, ctx: &'a Context) -> DbFuture<'a, ()>;

    /// Roll the transaction back.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the rollback fails, the context ended, or the
    /// transaction was already closed.
    fn rollback<'a>(&'a self, ctx: &'a Context) -> DbFuture<'a, ()>;
}

/// Something that can open transactions.
pub trait Transactor: Send + Sync {
    /// The handle type produced by [`begin_tx`](Self::begin_tx).
    type Tx: Transaction;

    /// Begin a new transaction with the given options.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the transaction cannot be opened or the context
    /// ended first.
    fn begin_tx<'a>(
        &'a self,
        ctx: &'a Context,
        options: TxOptions,
    ) -> DbFuture<'a, Self::Tx>;
}

/// Errors returned by [`TxManager`](crate::tx_manager::TxManager).
///
/// `E` is the handler's own error type, returned unchanged inside
/// [`TransactionError::Handler`].
#[derive(Debug)]
pub enum TransactionError<E> {
    /// The collaborator could not open a transaction. The handler did not run.
    Begin(DbError),

    /// The handler returned an error.
    Handler(E),

    /// The handler panicked. The panic payload is rendered as text.
    Panic(String),

    /// Rolling back after a failure also failed.
    Rollback {
        /// The failure that triggered the rollback
        cause: Box<TransactionError<E>>,
        /// The rollback failure itself
        rollback: DbError,
    },

    /// The handler succeeded but commit failed.
    Commit(DbError),
}

impl<E: fmt::Display> fmt::Display for TransactionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Begin(err) => write!(f, "failed to begin the transaction: {err}"),
            Self::Handler(err) => {
                write!(f, "failed to execute the code inside the transaction: {err}")
            }
            Self::Panic(message) => write!(f, "panic recovered: {message}"),
            Self::Rollback { cause, rollback } => {
                write!(f, "tx rollback failed: {rollback}: {cause}")
            }
            Self::Commit(err) => write!(f, "tx commit failed: {err}"),
        }
    }
}

impl<E> std::error::Error for TransactionError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Begin(err) | Self::Commit(err) | Self::Rollback { rollback: err, .. } => {
                Some(err)
            }
            Self::Handler(err) => Some(err),
            Self::Panic(_) => None,
        }
    }
}

impl<E> TransactionError<E> {
    /// Whether the transaction could not be opened.
    #[must_use]
    pub const fn is_begin(&self) -> bool {
        matches!(self, Self::Begin(_))
    }

    /// Whether commit failed after a successful handler.
    #[must_use]
    pub const fn is_commit(&self) -> bool {
        matches!(self, Self::Commit(_))
    }

    /// Whether a rollback failed on top of another error.
    #[must_use]
    pub const fn is_rollback(&self) -> bool {
        matches!(self, Self::Rollback { .. })
    }

    /// Whether the handler panicked, directly or beneath a rollback failure.
    #[must_use]
    pub fn is_panic(&self) -> bool {
        match self {
            Self::Panic(_) => true,
            Self::Rollback { cause, .. } => cause.is_panic(),
            _ => false,
        }
    }

    /// The handler's own error, looking through a rollback failure.
    #[must_use]
    pub fn handler_error(&self) -> Option<&E> {
        match self {
            Self::Handler(err) => Some(err),
            Self::Rollback { cause, .. } => cause.handler_error(),
            _ => None,
        }
    }

    /// Consume the error and return the handler's own error, if any.
    #[must_use]
    pub fn into_handler_error(self) -> Option<E> {
        match self {
            Self::Handler(err) => Some(err),
            Self::Rollback { cause, .. } => cause.into_handler_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_read_committed() {
        let options = TxOptions::default();
        assert_eq!(options, TxOptions::read_committed());
        assert_eq!(
            options.set_transaction_sql(),
            "SET TRANSACTION ISOLATION LEVEL READ COMMITTED, READ WRITE, NOT DEFERRABLE"
        );
    }

    #[test]
    fn test_serializable_read_only_deferrable_sql() {
        let options = TxOptions::new(IsolationLevel::Serializable)
            .access_mode(AccessMode::ReadOnly)
            .deferrable(true);
        assert_eq!(
            options.set_transaction_sql(),
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE, READ ONLY, DEFERRABLE"
        );
    }

    #[test]
    fn test_rollback_error_reports_both_causes() {
        let err: TransactionError<std::io::Error> = TransactionError::Rollback {
            cause: Box::new(TransactionError::Handler(std::io::Error::other("boom"))),
            rollback: DbError::Driver("connection reset".to_string()),
        };

        let message = err.to_string();
        assert!(message.contains("boom"));
        assert!(message.contains("connection reset"));
        assert!(err.is_rollback());
        assert_eq!(
            err.handler_error().map(ToString::to_string),
            Some("boom".to_string())
        );
    }

    #[test]
    fn test_panic_is_visible_through_rollback() {
        let err: TransactionError<std::io::Error> = TransactionError::Rollback {
            cause: Box::new(TransactionError::Panic("oops".to_string())),
            rollback: DbError::TransactionClosed,
        };
        assert!(err.is_panic());
        assert!(err.handler_error().is_none());
    }
}
