//! OS termination signals.
//!
//! [`SignalListener`] subscribes to a set of [`ShutdownSignal`]s up front, so
//! subscription errors surface immediately, and later resolves with whichever
//! arrives first. The subscriptions are dropped as soon as one fires.
//!
//! Tokio never restores the default disposition of a signal once it has been
//! subscribed, so a second Ctrl+C after the first does not kill the process:
//! later deliveries are absorbed by Tokio's handler with nobody listening.

use std::fmt;
use std::io;

/// Signals that can request shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownSignal {
    /// `SIGINT` (Ctrl+C)
    Interrupt,
    /// `SIGTERM`
    Terminate,
    /// `SIGQUIT` (unix only)
    Quit,
    /// `SIGHUP` (unix only)
    Hangup,
}

impl ShutdownSignal {
    /// `SIGINT` and `SIGTERM`, the usual pair for server processes.
    pub const DEFAULT: [Self; 2] = [Self::Interrupt, Self::Terminate];

    /// Conventional name, e.g. `SIGTERM`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Quit => "SIGQUIT",
            Self::Hangup => "SIGHUP",
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pending subscriptions to a set of signals.
pub struct SignalListener {
    #[cfg(unix)]
    streams: Vec<(ShutdownSignal, tokio::signal::unix::Signal)>,
    #[cfg(not(unix))]
    signals: Vec<ShutdownSignal>,
}

impl SignalListener {
    /// Subscribe to `signals`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a signal handler cannot be installed, or (on
    /// non-unix platforms) if a signal other than `Interrupt` is requested.
    #[cfg(unix)]
    pub fn subscribe(signals: &[ShutdownSignal]) -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        let streams = signals
            .iter()
            .map(|&kind| {
                let raw = match kind {
                    ShutdownSignal::Interrupt => SignalKind::interrupt(),
                    ShutdownSignal::Terminate => SignalKind::terminate(),
                    ShutdownSignal::Quit => SignalKind::quit(),
                    ShutdownSignal::Hangup => SignalKind::hangup(),
                };
                signal(raw).map(|stream| (kind, stream))
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self { streams })
    }

    /// Subscribe to `signals`.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::Unsupported`] for anything but `Interrupt`.
    #[cfg(not(unix))]
    pub fn subscribe(signals: &[ShutdownSignal]) -> io::Result<Self> {
        if let Some(kind) = signals
            .iter()
            .find(|&&kind| kind != ShutdownSignal::Interrupt)
        {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{kind} is not supported on this platform"),
            ));
        }
        Ok(Self {
            signals: signals.to_vec(),
        })
    }

    /// Wait for the first subscribed signal, then drop all subscriptions.
    ///
    /// Never resolves if the listener was created with no signals.
    #[cfg(unix)]
    pub async fn recv(mut self) -> ShutdownSignal {
        if self.streams.is_empty() {
            return std::future::pending().await;
        }

        let waits = self.streams.iter_mut().map(|(kind, stream)| {
            Box::pin(async move {
                stream.recv().await;
                *kind
            })
        });
        let (kind, _, _) = futures::future::select_all(waits).await;
        kind
    }

    /// Wait for the first subscribed signal.
    ///
    /// Never resolves if the listener was created with no signals.
    #[cfg(not(unix))]
    pub async fn recv(self) -> ShutdownSignal {
        if self.signals.is_empty() {
            return std::future::pending().await;
        }
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownSignal::Interrupt,
            Err(_) => std::future::pending().await,
        }
    }
}

impl fmt::Debug for SignalListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(unix)]
        let signals: Vec<ShutdownSignal> = self.streams.iter().map(|(kind, _)| *kind).collect();
        #[cfg(not(unix))]
        let signals = &self.signals;

        f.debug_struct("SignalListener")
            .field("signals", &signals)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert_eq!(ShutdownSignal::Interrupt.to_string(), "SIGINT");
        assert_eq!(ShutdownSignal::Terminate.name(), "SIGTERM");
        assert_eq!(ShutdownSignal::DEFAULT.len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_subscribe_default_signals() {
        let listener = SignalListener::subscribe(&ShutdownSignal::DEFAULT);
        assert!(listener.is_ok());
    }
}
