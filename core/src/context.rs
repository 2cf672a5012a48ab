//! Request-scoped execution context.
//!
//! A [`Context`] is passed explicitly through every call that takes part in
//! handling one request. It carries three things:
//!
//! - **Values**: a typed, read-only bag. A child context sees every value of
//!   its parent; adding a value never changes the parent.
//! - **Cancellation**: cancelling a context cancels all contexts derived from
//!   it. Cancelling a child never reaches the parent.
//! - **Deadline**: an optional point in time after which the context counts as
//!   expired. A child's deadline is never later than its parent's.
//!
//! Cloning a context is cheap (a few `Arc` bumps).
//!
//! # Example
//!
//! ```
//! use platform_common_core::context::{Context, ContextError};
//! use std::time::Duration;
//!
//! # async fn example() {
//! #[derive(Debug, PartialEq)]
//! struct RequestId(u64);
//!
//! let root = Context::background().with_value(RequestId(7));
//! let (ctx, cancel) = root.with_cancel();
//! let ctx = ctx.with_timeout(Duration::from_secs(5));
//!
//! assert_eq!(ctx.value::<RequestId>(), Some(&RequestId(7)));
//!
//! cancel.cancel();
//! let result = ctx.run(async { 42 }).await;
//! assert_eq!(result, Err(ContextError::Cancelled));
//! # }
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Why a context stopped being usable.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// The context (or one of its ancestors) was cancelled.
    #[error("context cancelled")]
    Cancelled,

    /// The context's deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// One node of the cancellation tree.
struct CancelNode {
    state: watch::Sender<bool>,
    children: Mutex<Vec<Weak<CancelNode>>>,
}

impl CancelNode {
    fn root() -> Arc<Self> {
        let (state, _) = watch::channel(false);
        Arc::new(Self {
            state,
            children: Mutex::new(Vec::new()),
        })
    }

    fn child(parent: &Arc<Self>) -> Arc<Self> {
        let node = Self::root();

        // The parent's state is checked under the children lock so a
        // concurrent `cancel` either sees this child or we see its flag.
        let mut children = parent
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if parent.is_cancelled() {
            node.state.send_replace(true);
        } else {
            children.retain(|child| child.strong_count() > 0);
            children.push(Arc::downgrade(&node));
        }
        drop(children);

        node
    }

    fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    fn cancel(&self) {
        if self.state.send_replace(true) {
            return;
        }

        let children = std::mem::take(
            &mut *self
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }

    async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this only returns once set.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// One typed entry of the value chain.
struct ValueNode {
    type_id: TypeId,
    value: Arc<dyn Any + Send + Sync>,
    parent: Option<Arc<ValueNode>>,
}

/// Request-scoped execution context.
///
/// See the [module documentation](self) for the semantics of values,
/// cancellation and deadlines.
#[derive(Clone)]
pub struct Context {
    values: Option<Arc<ValueNode>>,
    cancel: Arc<CancelNode>,
    deadline: Option<Instant>,
}

impl Context {
    /// An empty, never-cancelled context with no deadline.
    ///
    /// Use this at the top of a request or a background job.
    #[must_use]
    pub fn background() -> Self {
        Self {
            values: None,
            cancel: CancelNode::root(),
            deadline: None,
        }
    }

    /// Derive a context that additionally carries `value`.
    ///
    /// A later value of the same type shadows an earlier one for lookups
    /// made through the derived context.
    #[must_use]
    pub fn with_value<T>(&self, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            values: Some(Arc::new(ValueNode {
                type_id: TypeId::of::<T>(),
                value: Arc::new(value),
                parent: self.values.clone(),
            })),
            cancel: Arc::clone(&self.cancel),
            deadline: self.deadline,
        }
    }

    /// Look up the closest value of type `T`.
    #[must_use]
    pub fn value<T>(&self) -> Option<&T>
    where
        T: Any + Send + Sync,
    {
        let mut node = self.values.as_deref();
        while let Some(current) = node {
            if current.type_id == TypeId::of::<T>() {
                return current.value.downcast_ref::<T>();
            }
            node = current.parent.as_deref();
        }
        None
    }

    /// Derive a context that can be cancelled independently of its parent.
    ///
    /// Cancelling the parent still cancels the derived context.
    #[must_use]
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let node = CancelNode::child(&self.cancel);
        let ctx = Self {
            values: self.values.clone(),
            cancel: Arc::clone(&node),
            deadline: self.deadline,
        };
        (ctx, CancelHandle { node })
    }

    /// Derive a context that expires at `deadline`, or at the parent's
    /// deadline if that comes first.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current <= deadline => current,
            _ => deadline,
        };
        Self {
            values: self.values.clone(),
            cancel: Arc::clone(&self.cancel),
            deadline: Some(deadline),
        }
    }

    /// Derive a context that expires after `timeout` from now.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// The effective deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether this context was cancelled (explicitly or through an ancestor).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Why the context is no longer usable, or `None` while it still is.
    ///
    /// Cancellation takes precedence over an expired deadline.
    #[must_use]
    pub fn err(&self) -> Option<ContextError> {
        if self.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolve once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => ContextError::Cancelled,
                    () = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.cancel.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// Drive `fut` to completion unless the context ends first.
    ///
    /// The future is dropped (and so aborted) when the context is cancelled
    /// or its deadline passes.
    ///
    /// # Errors
    ///
    /// Returns the [`ContextError`] that ended the context, either before
    /// `fut` was polled or while it was running.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }

        tokio::select! {
            biased;
            err = self.done() => Err(err),
            output = fut => Ok(output),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Cancels the context returned alongside it by [`Context::with_cancel`].
#[derive(Clone)]
pub struct CancelHandle {
    node: Arc<CancelNode>,
}

impl CancelHandle {
    /// Cancel the associated context and everything derived from it.
    ///
    /// Calling this more than once has no further effect.
    pub fn cancel(&self) {
        self.node.cancel();
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.node.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct UserId(u64);

    #[derive(Debug, PartialEq)]
    struct TraceId(&'static str);

    #[test]
    fn test_child_sees_parent_values() {
        let parent = Context::background().with_value(UserId(1));
        let child = parent.with_value(TraceId("abc"));

        assert_eq!(child.value::<UserId>(), Some(&UserId(1)));
        assert_eq!(child.value::<TraceId>(), Some(&TraceId("abc")));
        assert_eq!(parent.value::<TraceId>(), None);
    }

    #[test]
    fn test_later_value_shadows_earlier() {
        let parent = Context::background().with_value(UserId(1));
        let child = parent.with_value(UserId(2));

        assert_eq!(child.value::<UserId>(), Some(&UserId(2)));
        assert_eq!(parent.value::<UserId>(), Some(&UserId(1)));
    }

    #[test]
    fn test_parent_cancel_reaches_children() {
        let (parent, cancel) = Context::background().with_cancel();
        let (child, _child_cancel) = parent.with_cancel();
        let grandchild = child.with_value(UserId(3));

        cancel.cancel();

        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert_eq!(grandchild.err(), Some(ContextError::Cancelled));
    }

    #[test]
    fn test_child_cancel_does_not_reach_parent() {
        let (parent, _cancel) = Context::background().with_cancel();
        let (child, child_cancel) = parent.with_cancel();

        child_cancel.cancel();

        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let (parent, cancel) = Context::background().with_cancel();
        cancel.cancel();

        let (child, _) = parent.with_cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_takes_earliest() {
        let parent = Context::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(10));

        assert_eq!(child.deadline(), parent.deadline());

        let tighter = parent.with_timeout(Duration::from_millis(10));
        assert!(tighter.deadline().unwrap() < parent.deadline().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_returns_deadline_exceeded() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));

        let result = ctx
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await;

        assert_eq!(result, Err(ContextError::DeadlineExceeded));
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_run_aborts_on_cancel() {
        let (ctx, cancel) = Context::background().with_cancel();

        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.run(std::future::pending::<()>()).await }
        });

        tokio::task::yield_now().await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), Err(ContextError::Cancelled));
    }

    #[tokio::test]
    async fn test_run_completes_when_live() {
        let ctx = Context::background();
        assert_eq!(ctx.run(async { 5 }).await, Ok(5));
    }
}
