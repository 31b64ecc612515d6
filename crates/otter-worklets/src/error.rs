//! Error types for otter-worklets

use thiserror::Error;

use crate::handle::Handle;
use crate::runtime::RuntimeId;

/// A failure raised by a script closure (worklet, mapper body or event handler body).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct ScriptError {
    /// Error class name, e.g. `TypeError`
    pub name: String,
    /// Human readable message
    pub message: String,
    /// Stack trace, when the runtime provides one
    pub stack: Option<String>,
}

impl ScriptError {
    /// Create a generic `Error` with the given message
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_name("Error", message)
    }

    /// Create an error with an explicit class name
    pub fn with_name(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Attach a stack trace
    pub fn stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Build an error from a caught panic payload
    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            format!("Worklet panic: {}", s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("Worklet panic: {}", s)
        } else {
            "Worklet panic: unknown error".to_string()
        };
        Self::with_name("InternalError", message)
    }
}

/// Errors returned by the registration and lookup APIs
#[derive(Debug, Clone, Error)]
pub enum WorkletError {
    /// No entity is registered under this handle
    #[error("Unknown handle {0}")]
    UnknownHandle(Handle),

    /// An entity with this id is already registered
    #[error("Handle {0} is already registered")]
    DuplicateId(Handle),

    /// A closure was invoked on a runtime it does not belong to
    #[error("Closure belongs to runtime {expected} but was invoked on runtime {actual}")]
    RuntimeMismatch {
        /// Runtime the closure was created for
        expected: RuntimeId,
        /// Runtime the call was attempted on
        actual: RuntimeId,
    },

    /// The script closure itself failed
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// The embedder dropped the scheduler this module was created with
    #[error("Scheduler is no longer available")]
    SchedulerGone,
}

impl WorkletError {
    /// Convert into a `ScriptError` suitable for an `ErrorHandler` report
    pub fn into_script_error(self) -> ScriptError {
        match self {
            WorkletError::Script(e) => e,
            other => ScriptError::with_name("InternalError", other.to_string()),
        }
    }
}

impl From<WorkletError> for ScriptError {
    fn from(err: WorkletError) -> Self {
        err.into_script_error()
    }
}

/// Result type alias for worklet operations
pub type WorkletResult<T> = Result<T, WorkletError>;
