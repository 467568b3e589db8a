//! Error reporting capabilities.
//!
//! Operations that validate operator input never print anything themselves.
//! The caller hands in an [`ErrorSink`] and decides where reports go: a
//! controller session, the log, or a test buffer.

use tracing::error;

use crate::error::{BridgeError, ErrorKind};

/// Destination for error reports produced while handling a request.
pub trait ErrorSink {
    /// Delivers one error report.
    fn report(&mut self, err: &BridgeError);
}

/// Sink that forwards reports to the tracing log.
///
/// Used while loading configuration at startup, where no controller exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn report(&mut self, err: &BridgeError) {
        error!(kind = err.kind().as_str(), "{}", err);
    }
}

/// Sink that keeps every report, for tests and batch validation.
#[derive(Debug, Default, Clone)]
pub struct CollectSink {
    reports: Vec<(ErrorKind, String)>,
}

impl CollectSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the collected `(kind, message)` pairs.
    pub fn reports(&self) -> &[(ErrorKind, String)] {
        &self.reports
    }

    /// Returns true if nothing was reported.
    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Returns true if any report message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.reports.iter().any(|(_, msg)| msg.contains(needle))
    }
}

impl ErrorSink for CollectSink {
    fn report(&mut self, err: &BridgeError) {
        self.reports.push((err.kind(), err.to_string()));
    }
}
