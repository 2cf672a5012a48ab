//! # Platform Common Testing
//!
//! Testing utilities for the platform-common crates.
//!
//! This crate provides:
//! - [`MockTransactor`] / [`MockTx`]: a database collaborator that counts
//!   begin/commit/rollback calls and fails on demand
//! - [`LogCapture`]: an in-memory `tracing` sink for asserting on log output
//!
//! ## Example
//!
//! ```ignore
//! use platform_common_testing::{LogCapture, MockTransactor};
//!
//! #[tokio::test]
//! async fn test_rolls_back_on_error() {
//!     let db = MockTransactor::new();
//!     let manager = TxManager::new(db.clone());
//!
//!     let _ = manager.read_committed(&ctx, |_| async { Err(MyError) }).await;
//!
//!     assert_eq!(db.rollback_count(), 1);
//! }
//! ```

pub mod log_capture;
pub mod transaction_mocks;

pub use log_capture::{CaptureWriter, LogCapture};
pub use transaction_mocks::{MockTransactor, MockTx};
