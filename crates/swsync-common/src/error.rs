//! Error taxonomy for event handling.
//!
//! Every engine operation returns a [`SyncResult`]. The dispatch loop looks at
//! the [`ErrorClass`] to decide how loudly to log and whether the whole engine
//! has to shut down; no error ever escapes the handling of one event.

use swsync_hal::HalError;
use thiserror::Error;

/// How the dispatch loop treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Prerequisite not there yet; a later event or subscription retries.
    Transient,
    /// Mirrored state disagrees with what the event implies; no-op.
    Inconsistency,
    /// A hardware call failed; partial work was unwound, event dropped.
    Hardware,
    /// Configuration the engines refuse to manage.
    Unsupported,
    /// The forwarding plane is gone; the engine must shut down.
    Fatal,
}

impl ErrorClass {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorClass::Fatal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("Unresolved: {what}")]
    Unresolved { what: String },

    #[error("Inconsistent state: {message}")]
    Inconsistent { message: String },

    #[error("Hardware call {op} failed: {source}")]
    Hardware {
        op: &'static str,
        #[source]
        source: HalError,
    },

    #[error("Unsupported: {what}")]
    Unsupported { what: String },

    #[error("Fatal: {message}")]
    Fatal { message: String },
}

impl SyncError {
    pub fn unresolved(what: impl Into<String>) -> Self {
        SyncError::Unresolved { what: what.into() }
    }

    pub fn inconsistent(message: impl Into<String>) -> Self {
        SyncError::Inconsistent {
            message: message.into(),
        }
    }

    pub fn hardware(op: &'static str, source: HalError) -> Self {
        SyncError::Hardware { op, source }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        SyncError::Unsupported { what: what.into() }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        SyncError::Fatal {
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Unresolved { .. } => ErrorClass::Transient,
            SyncError::Inconsistent { .. } => ErrorClass::Inconsistency,
            SyncError::Hardware { source, .. } if source.is_fatal() => ErrorClass::Fatal,
            SyncError::Hardware { .. } => ErrorClass::Hardware,
            SyncError::Unsupported { .. } => ErrorClass::Unsupported,
            SyncError::Fatal { .. } => ErrorClass::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class().is_fatal()
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Attaches the operation name to a hardware result.
pub trait HalResultExt<T> {
    fn hal(self, op: &'static str) -> SyncResult<T>;
}

impl<T> HalResultExt<T> for Result<T, HalError> {
    fn hal(self, op: &'static str) -> SyncResult<T> {
        self.map_err(|e| SyncError::hardware(op, e))
    }
}

/// Classification helpers on results.
pub trait SyncResultExt {
    /// `None` on success.
    fn error_class(&self) -> Option<ErrorClass>;
}

impl<T> SyncResultExt for SyncResult<T> {
    fn error_class(&self) -> Option<ErrorClass> {
        self.as_ref().err().map(SyncError::class)
    }
}
