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

//! Session and worker configuration types
//!
//! # Examples
//!
//! ```
//! use relaygate_service::{SessionConfig, WorkerPoolConfig};
//! use std::time::Duration;
//!
//! let session = SessionConfig::new()
//!     .with_reader_idle_time(Some(Duration::from_secs(60)))
//!     .with_write_timeout(Duration::from_secs(5));
//!
//! let workers = WorkerPoolConfig::new(4).with_thread_name("gateway-io");
//! ```

use std::time::Duration;

/// Per-session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Buffer size used by transports for each read
    pub read_buffer_size: usize,

    /// Fire [`IdleStatus::ReaderIdle`](crate::IdleStatus) after this long without reads
    pub reader_idle_time: Option<Duration>,

    /// Fire [`IdleStatus::WriterIdle`](crate::IdleStatus) after this long without writes
    pub writer_idle_time: Option<Duration>,

    /// Fire [`IdleStatus::BothIdle`](crate::IdleStatus) after this long without any I/O
    pub both_idle_time: Option<Duration>,

    /// Maximum time a single write request may take to flush
    pub write_timeout: Duration,

    /// Install the alignment assertion filter at the head of every chain
    pub assert_alignment: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 8192,
            reader_idle_time: None,
            writer_idle_time: None,
            both_idle_time: Some(Duration::from_secs(600)), // 10 minutes
            write_timeout: Duration::from_secs(30),
            assert_alignment: cfg!(debug_assertions),
        }
    }
}

impl SessionConfig {
    /// Create a new session configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the read buffer size
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the reader idle time
    pub fn with_reader_idle_time(mut self, time: Option<Duration>) -> Self {
        self.reader_idle_time = time;
        self
    }

    /// Set the writer idle time
    pub fn with_writer_idle_time(mut self, time: Option<Duration>) -> Self {
        self.writer_idle_time = time;
        self
    }

    /// Set the both-directions idle time
    pub fn with_both_idle_time(mut self, time: Option<Duration>) -> Self {
        self.both_idle_time = time;
        self
    }

    /// Set the write timeout
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Enable or disable the alignment assertion filter
    pub fn with_assert_alignment(mut self, enabled: bool) -> Self {
        self.assert_alignment = enabled;
        self
    }
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads
    pub size: usize,

    /// Thread name prefix; workers are named `{thread_name}-{index}`
    pub thread_name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let size = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            size,
            thread_name: "relaygate-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration with the given number of workers
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            ..Default::default()
        }
    }

    /// Set the worker thread name prefix
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_builder() {
        let config = SessionConfig::new()
            .with_read_buffer_size(1024)
            .with_reader_idle_time(Some(Duration::from_secs(5)))
            .with_both_idle_time(None)
            .with_write_timeout(Duration::from_millis(500))
            .with_assert_alignment(true);

        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.reader_idle_time, Some(Duration::from_secs(5)));
        assert_eq!(config.writer_idle_time, None);
        assert_eq!(config.both_idle_time, None);
        assert_eq!(config.write_timeout, Duration::from_millis(500));
        assert!(config.assert_alignment);
    }

    #[test]
    fn test_worker_pool_config_minimum_size() {
        assert_eq!(WorkerPoolConfig::new(0).size, 1);
        let config = WorkerPoolConfig::new(3).with_thread_name("io");
        assert_eq!(config.size, 3);
        assert_eq!(config.thread_name, "io");
    }
}
