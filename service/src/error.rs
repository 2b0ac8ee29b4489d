//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Error types for sessions, filter chains and writes

use crate::types::SessionId;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Session and filter chain error types
///
/// Errors are cheap to clone so that they can be carried through
/// exception-caught events and stored in completion futures.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// I/O error from the underlying transport
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// A codec could not decode inbound data
    #[error("Decode error: {message}")]
    Decode {
        /// Description of the failure
        message: String,
        /// Whether the session can continue after the failure
        recoverable: bool,
    },

    /// A codec could not encode an outbound message
    #[error("Encode error: {0}")]
    Encode(String),

    /// A write failed
    #[error("Write failed: {0}")]
    Write(#[from] WriteError),

    /// The session's worker no longer accepts tasks
    #[error("Worker {0} is not accepting tasks")]
    ExecutorUnavailable(String),

    /// The session has been closed
    #[error("Session {0} is closed")]
    SessionClosed(SessionId),

    /// A filter with the given name already exists in the chain
    #[error("Filter name '{0}' is already in use")]
    NameConflict(String),

    /// No filter with the given name exists in the chain
    #[error("Filter '{0}' not found")]
    FilterNotFound(String),

    /// A filter or handler callback panicked
    #[error("Callback panicked: {0}")]
    FilterPanicked(String),

    /// An outbound connect attempt failed
    #[error("Connect to {address} failed: {reason}")]
    Connect {
        /// Resource address being connected to
        address: String,
        /// Reason for the failure
        reason: String,
    },

    /// The bridged peer session closed before the bridge was established
    #[error("Peer session {0} closed before the bridge completed")]
    PeerClosed(SessionId),

    /// No connector is registered for a resource scheme
    #[error("No connector registered for scheme '{0}'")]
    UnknownScheme(String),

    /// A resource address could not be parsed
    #[error("Invalid resource address '{0}'")]
    InvalidAddress(String),

    /// Generic error with a message
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for SessionError {
    fn from(error: std::io::Error) -> Self {
        SessionError::Io(Arc::new(error))
    }
}

impl SessionError {
    /// Check if the session can continue after this error
    ///
    /// The default terminal handler closes the session for every error
    /// that is not recoverable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::Decode {
                recoverable: true,
                ..
            }
        )
    }

    /// Check if the error must close the session without further processing
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::ExecutorUnavailable(_)
                | SessionError::FilterPanicked(_)
                | SessionError::Io(_)
                | SessionError::Decode {
                    recoverable: false,
                    ..
                }
        )
    }

    /// Check if the error is a write timeout
    pub fn is_write_timeout(&self) -> bool {
        matches!(self, SessionError::Write(WriteError::Timeout(_)))
    }
}

/// Outcome of a failed write, stored in the request's [`WriteFuture`](crate::WriteFuture)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The request was not flushed within the configured write timeout
    #[error("Write timed out after {0:?}")]
    Timeout(Duration),

    /// The session closed before the request was written
    #[error("Session closed before the write completed")]
    SessionClosed,

    /// The transport failed while flushing the request
    #[error("I/O error: {0}")]
    Io(String),

    /// The request could not be accepted by the chain or transport
    #[error("Write rejected: {0}")]
    Rejected(String),
}

impl WriteError {
    /// Check if this is a timeout failure
    pub fn is_timeout(&self) -> bool {
        matches!(self, WriteError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_recoverable() {
        let recoverable = SessionError::Decode {
            message: "line too long".into(),
            recoverable: true,
        };
        assert!(recoverable.is_recoverable());
        assert!(!recoverable.is_fatal());

        let fatal = SessionError::Decode {
            message: "bad frame".into(),
            recoverable: false,
        };
        assert!(!fatal.is_recoverable());
        assert!(fatal.is_fatal());

        assert!(SessionError::ExecutorUnavailable("w-0".into()).is_fatal());
        assert!(!SessionError::NameConflict("codec".into()).is_recoverable());
    }

    #[test]
    fn test_write_timeout_is_distinguishable() {
        let timeout = SessionError::from(WriteError::Timeout(Duration::from_secs(3)));
        let io = SessionError::from(WriteError::Io("broken pipe".into()));
        assert!(timeout.is_write_timeout());
        assert!(!io.is_write_timeout());
    }

    #[test]
    fn test_error_display() {
        let err = SessionError::SessionClosed(SessionId::new(42));
        assert_eq!(err.to_string(), "Session session-42 is closed");

        let err = SessionError::NameConflict("codec".into());
        assert_eq!(err.to_string(), "Filter name 'codec' is already in use");

        let err = WriteError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "Write timed out after 250ms");
    }
}
