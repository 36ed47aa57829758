//! Error types for stream-capture.
//!
//! Errors fall into three groups:
//! - **Configuration errors** (`InvalidArg`, `NotSupported`, `NotFound`): returned
//!   synchronously by control-plane calls and never retried.
//! - **Resource exhaustion** (`NoMem`, `NoResources`, `NotEnough`, `Timeout`):
//!   returned synchronously; producers are expected to back off.
//! - **Runtime faults**: reported asynchronously through the
//!   [`EventCallback`](crate::EventCallback), never as an error value.

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Errors returned by capture, path and queue operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// An argument was out of range or otherwise malformed.
    #[error("invalid argument: {reason}")]
    InvalidArg {
        /// What was wrong with the argument.
        reason: String,
    },

    /// An allocation failed.
    #[error("out of memory")]
    NoMem,

    /// The requested operation or format is not supported.
    #[error("not supported: {reason}")]
    NotSupported {
        /// Why the request was rejected.
        reason: String,
    },

    /// The referenced object does not exist, or no data is available.
    #[error("not found: {what}")]
    NotFound {
        /// Description of what was missing.
        what: String,
    },

    /// A fixed-size table is exhausted.
    #[error("not enough: {what}")]
    NotEnough {
        /// Description of the exhausted resource.
        what: String,
    },

    /// A bounded wait expired.
    #[error("operation timed out")]
    Timeout,

    /// The call is not allowed in the current lifecycle state.
    #[error("invalid state: {reason}")]
    InvalidState {
        /// Why the state does not allow the call.
        reason: String,
    },

    /// An internal invariant was broken.
    #[error("internal error: {0}")]
    Internal(String),

    /// A runtime resource (thread, queue) could not be created.
    #[error("no resources: {what}")]
    NoResources {
        /// Description of the missing resource.
        what: String,
    },

    /// A blocked call was woken up because its queue was disabled or closed.
    #[error("interrupted by queue wakeup")]
    Interrupted,
}

impl CaptureError {
    /// Creates an invalid argument error.
    pub fn invalid_arg(reason: impl Into<String>) -> Self {
        Self::InvalidArg {
            reason: reason.into(),
        }
    }

    /// Creates a not supported error.
    pub fn not_supported(reason: impl Into<String>) -> Self {
        Self::NotSupported {
            reason: reason.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a not enough error.
    pub fn not_enough(what: impl Into<String>) -> Self {
        Self::NotEnough { what: what.into() }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// Creates a no resources error.
    pub fn no_resources(what: impl Into<String>) -> Self {
        Self::NoResources { what: what.into() }
    }

    /// Creates an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the numeric error code used on the C-style capture surface.
    ///
    /// `0` is reserved for success; every error maps to a negative code.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidArg { .. } => -1,
            Self::NoMem => -2,
            Self::NotSupported { .. } => -3,
            Self::NotFound { .. } => -4,
            Self::NotEnough { .. } => -5,
            Self::Timeout | Self::Interrupted => -6,
            Self::InvalidState { .. } => -7,
            Self::Internal(_) => -8,
            Self::NoResources { .. } => -9,
        }
    }

    /// Returns `true` for [`CaptureError::NotSupported`].
    #[must_use]
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported { .. })
    }

    /// Returns `true` for [`CaptureError::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CaptureError::not_supported("codec AAC");
        assert_eq!(err.to_string(), "not supported: codec AAC");

        let err = CaptureError::invalid_state("capture already started");
        assert_eq!(err.to_string(), "invalid state: capture already started");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(CaptureError::invalid_arg("x").code(), -1);
        assert_eq!(CaptureError::NoMem.code(), -2);
        assert_eq!(CaptureError::not_supported("x").code(), -3);
        assert_eq!(CaptureError::not_found("x").code(), -4);
        assert_eq!(CaptureError::not_enough("x").code(), -5);
        assert_eq!(CaptureError::Timeout.code(), -6);
        assert_eq!(CaptureError::invalid_state("x").code(), -7);
        assert_eq!(CaptureError::internal("x").code(), -8);
        assert_eq!(CaptureError::no_resources("x").code(), -9);
    }

    #[test]
    fn test_error_predicates() {
        assert!(CaptureError::not_found("frame").is_not_found());
        assert!(!CaptureError::Timeout.is_not_found());
        assert!(CaptureError::not_supported("x").is_not_supported());
    }
}
