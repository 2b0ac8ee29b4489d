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

//! Server configuration

use crate::tcp::TCP_SCHEME;
use relaygate_service::{ResourceAddress, SessionConfig, WorkerPoolConfig};
use std::net::SocketAddr;
use std::time::Duration;

/// Proxy server configuration
///
/// Use the builder methods to customize the configuration.
///
/// # Example
///
/// ```
/// use relaygate_server::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::default()
///     .with_upstream("tcp://10.0.0.7:6379".parse().unwrap())
///     .with_max_sessions(500)
///     .with_idle_timeout(Some(Duration::from_secs(120)));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to accept sessions on
    pub bind_address: SocketAddr,

    /// Resource every accepted session is bridged to
    pub upstream: ResourceAddress,

    /// Maximum number of concurrent accepted sessions
    pub max_sessions: usize,

    /// How often the session manager checks for idle sessions
    pub idle_check_interval: Duration,

    /// Close accepted sessions after this long without any I/O
    pub idle_timeout: Option<Duration>,

    /// Timeout for outbound connects to the upstream
    pub connect_timeout: Duration,

    /// Timeout for graceful shutdown
    ///
    /// Sessions still open after this long are abandoned.
    pub shutdown_timeout: Duration,

    /// Configuration for every session the server creates
    pub session: SessionConfig,

    /// Worker pool sessions are dispatched on
    pub workers: WorkerPoolConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 7000)),
            upstream: ResourceAddress::new(TCP_SCHEME, "127.0.0.1:7001"),
            max_sessions: 1000,
            idle_check_interval: Duration::from_secs(1),
            idle_timeout: Some(Duration::from_secs(300)), // 5 minutes
            connect_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            session: SessionConfig::default(),
            workers: WorkerPoolConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a configuration accepting on `bind_address` and bridging to `upstream`
    pub fn new(bind_address: SocketAddr, upstream: ResourceAddress) -> Self {
        Self {
            bind_address,
            upstream,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn with_bind_address(mut self, address: SocketAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Set the upstream resource
    pub fn with_upstream(mut self, upstream: ResourceAddress) -> Self {
        self.upstream = upstream;
        self
    }

    /// Set the maximum number of concurrent sessions
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Set the idle check interval
    pub fn with_idle_check_interval(mut self, interval: Duration) -> Self {
        self.idle_check_interval = interval;
        self
    }

    /// Set the idle timeout; `None` keeps idle sessions open
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the upstream connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the shutdown timeout duration
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the per-session configuration
    pub fn with_session_config(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Set the worker pool configuration
    pub fn with_workers(mut self, workers: WorkerPoolConfig) -> Self {
        self.workers = workers;
        self
    }

    /// Session configuration with the server's idle timeout applied
    pub fn session_config(&self) -> SessionConfig {
        self.session.clone().with_both_idle_time(self.idle_timeout)
    }

    /// Validate the configuration
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_sessions == 0 {
            return Err("max_sessions must be greater than 0".to_string());
        }

        if self.workers.size == 0 {
            return Err("workers.size must be greater than 0".to_string());
        }

        if self.idle_check_interval.is_zero() {
            return Err("idle_check_interval must be greater than 0".to_string());
        }

        if self.idle_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err("idle_timeout must be greater than 0".to_string());
        }

        if self.connect_timeout.is_zero() {
            return Err("connect_timeout must be greater than 0".to_string());
        }

        if self.shutdown_timeout.is_zero() {
            return Err("shutdown_timeout must be greater than 0".to_string());
        }

        if self.session.write_timeout.is_zero() {
            return Err("session.write_timeout must be greater than 0".to_string());
        }

        if self.session.read_buffer_size == 0 {
            return Err("session.read_buffer_size must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_sessions, 1000);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.upstream.scheme(), "tcp");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = ServerConfig::default()
            .with_max_sessions(500)
            .with_idle_timeout(None)
            .with_upstream("pipe://backend".parse().unwrap());

        assert_eq!(config.max_sessions, 500);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.upstream.to_string(), "pipe://backend");
        assert_eq!(config.session_config().both_idle_time, None);
    }

    #[test]
    fn test_session_config_carries_idle_timeout() {
        let config = ServerConfig::default()
            .with_session_config(SessionConfig::new().with_read_buffer_size(512))
            .with_idle_timeout(Some(Duration::from_secs(5)));
        let session = config.session_config();
        assert_eq!(session.read_buffer_size, 512);
        assert_eq!(session.both_idle_time, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_validation() {
        let mut config = ServerConfig::default();
        assert!(config.validate().is_ok());

        config.max_sessions = 0;
        assert!(config.validate().is_err());

        config.max_sessions = 1000;
        config.idle_timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());

        config.idle_timeout = None;
        config.session.write_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
