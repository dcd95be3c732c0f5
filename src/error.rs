//! Error types for isolate, context and locker operations.
//!
//! Script-level failures (compile and runtime errors, termination) are
//! returned from `Context::eval`. Lifecycle misuse (unmatched enter/leave,
//! operating on a disposed isolate, an `Unlocker` without an enclosing lock)
//! is reported as [`Error::InvalidState`] instead of being absorbed.

use std::fmt;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Context construction failed (bad extension list, overlay or extension source).
    #[error("initialization error: {0}")]
    Initialization(String),

    /// Script source failed to compile.
    #[error("compile error: {0}")]
    Compile(ScriptError),

    /// Script raised an error while running.
    #[error("runtime error: {0}")]
    Runtime(ScriptError),

    /// Execution was stopped by `Isolate::terminate` (or a watchdog).
    #[error("script execution terminated")]
    Terminated,

    /// Lifecycle or locking discipline was violated.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A value could not be translated between host and engine.
    #[error("marshal error: {0}")]
    Marshal(String),
}

impl Error {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// True for errors produced by the script itself (compile, runtime, termination).
    pub fn is_script_error(&self) -> bool {
        matches!(
            self,
            Error::Compile(_) | Error::Runtime(_) | Error::Terminated
        )
    }
}

/// A compile or runtime failure with its location in the original source.
///
/// Line and column already include the offsets of the `ScriptOrigin` the
/// source was compiled with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    pub message: String,
    pub script_name: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.script_name.is_empty() {
            "<anonymous>"
        } else {
            &self.script_name
        };

        match (self.line, self.column) {
            (Some(line), Some(column)) => {
                write!(f, "{} ({}:{}:{})", self.message, name, line, column)
            }
            (Some(line), None) => write!(f, "{} ({}:{})", self.message, name, line),
            _ => write!(f, "{} ({})", self.message, name),
        }
    }
}
