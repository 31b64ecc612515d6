//! Error reporting for worklet failures.
//!
//! Event dispatch and mapper ticks run on the platform's own loop and never
//! return errors. Failures are handed to an [`ErrorHandler`] supplied by the
//! embedder instead.

use parking_lot::Mutex;
use std::fmt;
use tracing::error;

use crate::error::ScriptError;
use crate::handle::Handle;

/// Where a failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSource {
    /// A mapper body
    Mapper(Handle),
    /// An event handler body
    EventHandler {
        /// Handler id
        id: Handle,
        /// Event the handler was dispatched for
        event_name: String,
    },
    /// A `requestAnimationFrame` callback
    FrameCallback,
    /// A job posted through the scheduler
    ScheduledJob,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSource::Mapper(id) => write!(f, "mapper {}", id),
            ErrorSource::EventHandler { id, event_name } => {
                write!(f, "event handler {} ({})", id, event_name)
            }
            ErrorSource::FrameCallback => f.write_str("frame callback"),
            ErrorSource::ScheduledJob => f.write_str("scheduled job"),
        }
    }
}

/// A single reported failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Where it happened
    pub source: ErrorSource,
    /// What the script raised
    pub error: ScriptError,
}

impl ErrorInfo {
    /// Create a report.
    pub fn new(source: ErrorSource, error: ScriptError) -> Self {
        Self { source, error }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.source, self.error)
    }
}

/// Sink for worklet failures (developer log, red box, crash reporter...).
pub trait ErrorHandler: Send + Sync {
    /// Report a failure. Must not panic.
    fn report_error(&self, info: ErrorInfo);
}

/// Logs every report through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorHandler;

impl ErrorHandler for TracingErrorHandler {
    fn report_error(&self, info: ErrorInfo) {
        error!(
            source = %info.source,
            name = %info.error.name,
            stack = ?info.error.stack,
            "{}",
            info.error.message
        );
    }
}

/// Keeps reports in memory until they are taken.
#[derive(Debug, Default)]
pub struct CapturingErrorHandler {
    errors: Mutex<Vec<ErrorInfo>>,
}

impl CapturingErrorHandler {
    /// Create an empty handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether anything has been reported since the last `take_errors`.
    pub fn has_error(&self) -> bool {
        !self.errors.lock().is_empty()
    }

    /// Most recent report.
    pub fn last_error(&self) -> Option<ErrorInfo> {
        self.errors.lock().last().cloned()
    }

    /// Number of pending reports.
    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    /// Whether there are no pending reports.
    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }

    /// Drain all pending reports.
    pub fn take_errors(&self) -> Vec<ErrorInfo> {
        std::mem::take(&mut *self.errors.lock())
    }
}

impl ErrorHandler for CapturingErrorHandler {
    fn report_error(&self, info: ErrorInfo) {
        self.errors.lock().push(info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capturing_handler() {
        let handler = CapturingErrorHandler::new();
        assert!(!handler.has_error());

        handler.report_error(ErrorInfo::new(
            ErrorSource::Mapper(Handle::from_raw(4)),
            ScriptError::new("first"),
        ));
        handler.report_error(ErrorInfo::new(
            ErrorSource::FrameCallback,
            ScriptError::new("second"),
        ));

        assert_eq!(handler.len(), 2);
        assert_eq!(handler.last_error().unwrap().error.message, "second");

        let taken = handler.take_errors();
        assert_eq!(taken.len(), 2);
        assert!(handler.is_empty());
    }

    #[test]
    fn test_display() {
        let info = ErrorInfo::new(
            ErrorSource::EventHandler {
                id: Handle::from_raw(2),
                event_name: "onScroll".to_string(),
            },
            ScriptError::with_name("RangeError", "out of bounds"),
        );
        assert_eq!(
            info.to_string(),
            "[event handler #2 (onScroll)] RangeError: out of bounds"
        );
    }
}
