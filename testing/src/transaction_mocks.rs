//! In-memory transaction collaborator for testing
//!
//! [`MockTransactor`] implements [`Transactor`] without a database. It counts
//! every begin/commit/rollback, remembers the options each transaction was
//! opened with, and can be told to fail any of the three operations.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Only poisoned locks can panic here

use platform_common_core::context::Context;
use platform_common_core::transaction::{DbError, DbFuture, Transaction, Transactor, TxOptions};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Calls observed by a [`MockTransactor`] and all of its transactions.
#[derive(Debug, Default)]
struct Calls {
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    options: Mutex<Vec<TxOptions>>,
    statements: Mutex<Vec<(usize, String)>>,
}

/// Which operations should fail, and how.
#[derive(Debug, Clone, Default)]
struct FailurePlan {
    begin: Option<String>,
    commit: Option<String>,
    rollback: Option<String>,
    begin_delay: Option<Duration>,
}

/// Mock database collaborator.
///
/// Clones share their call counters, so keep one clone for assertions and
/// hand the other to the code under test.
///
/// # Example
///
/// ```
/// use platform_common_core::{Context, TxContext, TxManager};
/// use platform_common_testing::MockTransactor;
///
/// # async fn example() {
/// let db = MockTransactor::new().fail_commit("disk full");
/// let manager = TxManager::new(db.clone());
///
/// let result = manager
///     .read_committed(&TxContext::new(Context::background()), |_ctx| async {
///         Ok::<_, std::io::Error>(())
///     })
///     .await;
///
/// assert!(result.unwrap_err().is_commit());
/// assert_eq!(db.begin_count(), 1);
/// assert_eq!(db.commit_count(), 1);
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockTransactor {
    calls: Arc<Calls>,
    plan: FailurePlan,
}

impl MockTransactor {
    /// A transactor whose operations all succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `begin_tx` fail with `message`.
    #[must_use]
    pub fn fail_begin(mut self, message: impl Into<String>) -> Self {
        self.plan.begin = Some(message.into());
        self
    }

    /// Make `commit` fail with `message`.
    #[must_use]
    pub fn fail_commit(mut self, message: impl Into<String>) -> Self {
        self.plan.commit = Some(message.into());
        self
    }

    /// Make `rollback` fail with `message`.
    #[must_use]
    pub fn fail_rollback(mut self, message: impl Into<String>) -> Self {
        self.plan.rollback = Some(message.into());
        self
    }

    /// Make `begin_tx` take `delay` before answering.
    ///
    /// The delay honours the context, so a deadline shorter than `delay`
    /// turns into [`DbError::Context`].
    #[must_use]
    pub const fn begin_delay(mut self, delay: Duration) -> Self {
        self.plan.begin_delay = Some(delay);
        self
    }

    /// Number of `begin_tx` calls, including failed ones.
    #[must_use]
    pub fn begin_count(&self) -> usize {
        self.calls.begins.load(Ordering::SeqCst)
    }

    /// Number of `commit` calls, including failed ones.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.calls.commits.load(Ordering::SeqCst)
    }

    /// Number of `rollback` calls, including failed ones.
    #[must_use]
    pub fn rollback_count(&self) -> usize {
        self.calls.rollbacks.load(Ordering::SeqCst)
    }

    /// Options passed to each successful `begin_tx`, in order.
    #[must_use]
    pub fn begun_with(&self) -> Vec<TxOptions> {
        self.calls.options.lock().unwrap().clone()
    }

    /// Statements recorded through [`MockTx::execute`], as `(tx id, sql)`.
    #[must_use]
    pub fn statements(&self) -> Vec<(usize, String)> {
        self.calls.statements.lock().unwrap().clone()
    }
}

impl Transactor for MockTransactor {
    type Tx = MockTx;

    fn begin_tx<'a>(&'a self, ctx: &'a Context, options: TxOptions) -> DbFuture<'a, MockTx> {
        Box::pin(async move {
            let id = self.calls.begins.fetch_add(1, Ordering::SeqCst);

            if let Some(delay) = self.plan.begin_delay {
                ctx.run(tokio::time::sleep(delay)).await?;
            }

            if let Some(message) = &self.plan.begin {
                return Err(DbError::Driver(message.clone()));
            }

            self.calls.options.lock().unwrap().push(options);

            Ok(MockTx {
                id,
                calls: Arc::clone(&self.calls),
                plan: self.plan.clone(),
                closed: AtomicBool::new(false),
            })
        })
    }
}

/// Transaction handle produced by [`MockTransactor`].
#[derive(Debug)]
pub struct MockTx {
    id: usize,
    calls: Arc<Calls>,
    plan: FailurePlan,
    closed: AtomicBool,
}

impl MockTx {
    /// Sequence number of this transaction (0 for the first `begin_tx`).
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Whether commit or rollback has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Record a statement as executed inside this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::TransactionClosed`] after commit or rollback.
    pub fn execute(&self, sql: impl Into<String>) -> Result<(), DbError> {
        if self.is_closed() {
            return Err(DbError::TransactionClosed);
        }
        self.calls
            .statements
            .lock()
            .unwrap()
            .push((self.id, sql.into()));
        Ok(())
    }

    fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            Err(DbError::TransactionClosed)
        } else {
            Ok(())
        }
    }
}

impl Transaction for MockTx {
    fn commit<'a>(&'a self, _ctx: &'a Context) -> DbFuture<'a, ()> {
        Box::pin(async move {
            self.calls.commits.fetch_add(1, Ordering::SeqCst);
            self.close()?;
            match &self.plan.commit {
                Some(message) => Err(DbError::Driver(message.clone())),
                None => Ok(()),
            }
        })
    }

    fn rollback<'a>(&'a self, _ctx: &'a Context) -> DbFuture<'a, ()> {
        Box::pin(async move {
            self.calls.rollbacks.fetch_add(1, Ordering::SeqCst);
            self.close()?;
            match &self.plan.rollback {
                Some(message) => Err(DbError::Driver(message.clone())),
                None => Ok(()),
            }
        })
    }
}
