//! Process-wide `tracing` setup.
//!
//! Binaries call [`init`] once at startup. `RUST_LOG` takes precedence over
//! the filter passed in.

use thiserror::Error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors from [`init`].
#[derive(Error, Debug)]
pub enum LoggingError {
    /// The default filter directive could not be parsed.
    #[error("invalid log filter `{filter}`: {message}")]
    InvalidFilter {
        /// The rejected directive
        filter: String,
        /// Parser message
        message: String,
    },

    /// A global subscriber is already installed.
    #[error("global tracing subscriber already set: {0}")]
    AlreadyInitialized(String),
}

/// Install a formatted `tracing` subscriber as the global default.
///
/// `default_filter` (e.g. `"info,sqlx=warn"`) is used when `RUST_LOG` is unset
/// or invalid.
///
/// # Errors
///
/// Returns [`LoggingError`] if `default_filter` is malformed or a global
/// subscriber has already been installed.
pub fn init(default_filter: &str) -> Result<(), LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter).map_err(|err| LoggingError::InvalidFilter {
            filter: default_filter.to_string(),
            message: err.to_string(),
        })?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .map_err(|err| LoggingError::AlreadyInitialized(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error() {
        // Only this test touches the global subscriber in this binary.
        let first = init("info");
        let second = init("info");

        assert!(first.is_ok() || matches!(first, Err(LoggingError::AlreadyInitialized(_))));
        assert!(matches!(second, Err(LoggingError::AlreadyInitialized(_))));
    }
}
