//! Error types for the bio-impedance protocol engine.
//!
//! | Category | Variants |
//! |----------|----------|
//! | Precondition | [`Error::NotReady`], [`Error::ProgramNotStarted`] |
//! | Argument | [`Error::InvalidArgument`] |
//! | Transport | [`Error::Transport`], [`Error::SessionClosed`] |
//!
//! Precondition errors are returned before any frame is written and leave the
//! session untouched.  Device-reported failures are not returned here; they
//! arrive as [`crate::types::SessionEvent::Error`].

use std::result::Result as StdResult;

use thiserror::Error;

use crate::transport::TransportError;
use crate::types::{ConnectionState, ProgramState};

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    /// The link is not in [`ConnectionState::Ready`].
    #[error("Device not ready (connection state: {state:?})")]
    NotReady {
        /// Connection state at the time of the call.
        state: ConnectionState,
    },

    /// A measurement was requested while no device program is running.
    #[error("Program not started (program state: {state:?})")]
    ProgramNotStarted {
        /// Program state at the time of the call.
        state: ProgramState,
    },

    /// A request parameter is out of range.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// Writing to the transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The frame-processing task has stopped; no further commands are accepted.
    #[error("Session closed")]
    SessionClosed,
}

impl Error {
    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns `true` for errors raised by a state guard.
    ///
    /// No frame was written and no state changed when this is `true`.
    #[inline]
    #[must_use]
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::NotReady { .. } | Self::ProgramNotStarted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NotReady {
            state: ConnectionState::Discovering,
        };
        assert_eq!(
            err.to_string(),
            "Device not ready (connection state: Discovering)"
        );

        let err = Error::invalid_argument("repeat count must be positive");
        assert_eq!(
            err.to_string(),
            "Invalid argument: repeat count must be positive"
        );
    }

    #[test]
    fn test_is_precondition() {
        assert!(Error::NotReady {
            state: ConnectionState::Disconnected
        }
        .is_precondition());
        assert!(Error::ProgramNotStarted {
            state: ProgramState::NotStarted
        }
        .is_precondition());
        assert!(!Error::SessionClosed.is_precondition());
        assert!(!Error::from(TransportError::Closed).is_precondition());
    }
}
