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

//! Error types for the relaygate server

use relaygate_service::{SessionError, SessionId};
use thiserror::Error;

/// Result type for server operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Server error types
#[derive(Debug, Error)]
pub enum ServerError {
    /// I/O error from a listener or socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error raised by the session engine
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// No tokio runtime is available to drive the transports
    #[error("No tokio runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    /// Invalid server configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Session with the given ID was not found
    #[error("Session {0} not found")]
    SessionNotFound(SessionId),

    /// Server or acceptor is already running
    #[error("Server already running")]
    AlreadyRunning,

    /// Server or acceptor is not running
    #[error("Server not running")]
    NotRunning,

    /// Maximum number of sessions reached
    #[error("Maximum sessions ({0}) reached")]
    MaxSessionsReached(usize),

    /// Graceful shutdown did not finish in time
    #[error("Shutdown timed out with {0} sessions still open")]
    ShutdownTimeout(usize),
}

impl ServerError {
    /// Check if the error is recoverable
    ///
    /// Recoverable errors leave the server running; the failed operation
    /// may succeed when retried.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ServerError::Io(_) | ServerError::MaxSessionsReached(_) => true,
            ServerError::Session(error) => !error.is_fatal(),
            _ => false,
        }
    }

    /// Check if the error concerns a single session rather than the server
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            ServerError::Session(_) | ServerError::SessionNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_recoverable() {
        assert!(ServerError::MaxSessionsReached(10).is_recoverable());
        assert!(ServerError::Session(SessionError::SessionClosed(SessionId::new(1))).is_recoverable());
        assert!(!ServerError::NotRunning.is_recoverable());
        assert!(!ServerError::Config("bad".into()).is_recoverable());
        assert!(
            !ServerError::Session(SessionError::FilterPanicked("boom".into())).is_recoverable()
        );
    }

    #[test]
    fn test_error_is_session_error() {
        assert!(ServerError::SessionNotFound(SessionId::new(1)).is_session_error());
        assert!(ServerError::Session(SessionError::SessionClosed(SessionId::new(1))).is_session_error());
        assert!(!ServerError::AlreadyRunning.is_session_error());
    }

    #[test]
    fn test_error_display() {
        let err = ServerError::SessionNotFound(SessionId::new(42));
        assert_eq!(err.to_string(), "Session session-42 not found");

        let err = ServerError::MaxSessionsReached(1000);
        assert_eq!(err.to_string(), "Maximum sessions (1000) reached");
    }
}
