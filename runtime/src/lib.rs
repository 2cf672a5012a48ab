//! # Platform Common Runtime
//!
//! Process lifecycle support shared by platform services.
//!
//! ## Core Components
//!
//! - **Closer**: collects cleanup callbacks and runs them concurrently, exactly
//!   once, on shutdown
//! - **Signals**: subscription to the OS signals that request shutdown
//! - **Logging**: one-call `tracing` subscriber setup
//!
//! ## Example
//!
//! ```no_run
//! use platform_common_runtime::{Closer, ShutdownSignal, logging};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     logging::init("info")?;
//!
//!     let closer = Closer::with_signals(&ShutdownSignal::DEFAULT)?;
//!     closer.add_named("cache", || async { Ok::<_, String>(()) });
//!
//!     closer.wait().await;
//!     Ok(())
//! }
//! ```

/// Shutdown coordination
pub mod closer;

/// `tracing` subscriber setup
pub mod logging;

/// OS termination signals
pub mod signal;

pub use closer::{CleanupError, CleanupFuture, Closer, CloserConfig, CloserError};
pub use signal::{ShutdownSignal, SignalListener};
