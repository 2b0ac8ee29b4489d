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

//! Core session types

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a session (monotonically increasing, never reused)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Create a session ID from a raw value
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate the next process-wide session ID
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the underlying u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Session lifecycle state (stored as atomic u8 for lock-free state management)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Transport handle exists, handshake not complete
    Created = 0,
    /// Session is open and processing events
    Opened = 1,
    /// Close has been requested and is in progress
    Closing = 2,
    /// Session is closed
    Closed = 3,
}

impl SessionState {
    /// Convert from u8 (for atomic operations)
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Opened,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Convert to u8 (for atomic operations)
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if the session is closing or closed
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Opened => write!(f, "opened"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Which direction of a session has been idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdleStatus {
    /// Nothing has been read for the reader idle time
    ReaderIdle,
    /// Nothing has been written for the writer idle time
    WriterIdle,
    /// Nothing has been read or written for the both idle time
    BothIdle,
}

impl fmt::Display for IdleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReaderIdle => write!(f, "reader-idle"),
            Self::WriterIdle => write!(f, "writer-idle"),
            Self::BothIdle => write!(f, "both-idle"),
        }
    }
}

/// Local or remote endpoint of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A socket address (TCP, UDP)
    Socket(SocketAddr),
    /// A named in-process endpoint (pipes)
    Named(Arc<str>),
}

impl Endpoint {
    /// Get the socket address, if this is a socket endpoint
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Socket(addr) => Some(*addr),
            Endpoint::Named(_) => None,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Socket(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Socket(addr) => write!(f, "{}", addr),
            Endpoint::Named(name) => write!(f, "pipe:{}", name),
        }
    }
}

/// Session information snapshot (for non-blocking queries)
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Session ID
    pub id: SessionId,
    /// Current state
    pub state: SessionState,
    /// Local endpoint
    pub local: Endpoint,
    /// Remote endpoint
    pub remote: Endpoint,
    /// When the session was created
    pub created_at: Instant,
    /// Last read timestamp
    pub last_read: Instant,
    /// Last write timestamp
    pub last_write: Instant,
    /// Total bytes read
    pub bytes_read: u64,
    /// Total bytes written
    pub bytes_written: u64,
    /// Total messages received
    pub messages_received: u64,
    /// Total messages sent
    pub messages_sent: u64,
    /// Requests waiting in the write queue
    pub queued_writes: usize,
}

impl SessionInfo {
    /// Get the session duration
    pub fn duration(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Get how long the session has gone without reading or writing
    pub fn idle_duration(&self) -> Duration {
        self.last_read.max(self.last_write).elapsed()
    }
}
