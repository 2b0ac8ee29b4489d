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

//! Lock-free metrics for the relaygate server

use relaygate_service::SessionInfo;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free server metrics
///
/// All metrics are stored as atomics and can be accessed concurrently
/// without locks. Use the `snapshot()` method to get a view of all
/// metrics at a point in time.
///
/// Byte and message totals are folded in when a session closes, so they
/// lag behind traffic on sessions that are still open.
#[derive(Debug)]
pub struct ServerMetrics {
    // Session counts
    total_sessions: AtomicU64,
    active_sessions: AtomicU64,

    // Throughput of closed sessions
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,

    // Errors
    rejected_sessions: AtomicU64,
    accept_errors: AtomicU64,
    timeout_errors: AtomicU64,
    idle_closes: AtomicU64,

    // Timing (stored as nanoseconds)
    total_session_duration_ns: AtomicU64,

    // Server start time
    started_at: Instant,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        Self {
            total_sessions: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            rejected_sessions: AtomicU64::new(0),
            accept_errors: AtomicU64::new(0),
            timeout_errors: AtomicU64::new(0),
            idle_closes: AtomicU64::new(0),
            total_session_duration_ns: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    // Session tracking

    /// Record a new session being opened
    pub fn session_opened(&self) {
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session being closed, folding in its counters
    pub fn session_closed(&self, info: &SessionInfo) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add(info.bytes_written, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(info.bytes_read, Ordering::Relaxed);
        self.messages_sent
            .fetch_add(info.messages_sent, Ordering::Relaxed);
        self.messages_received
            .fetch_add(info.messages_received, Ordering::Relaxed);
        self.total_session_duration_ns
            .fetch_add(info.duration().as_nanos() as u64, Ordering::Relaxed);
    }

    /// Get the current number of active sessions
    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Get the total number of sessions since server start
    pub fn total_sessions(&self) -> u64 {
        self.total_sessions.load(Ordering::Relaxed)
    }

    // Error tracking

    /// Record a connection refused because the session limit was reached
    pub fn session_rejected(&self) {
        self.rejected_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed accept
    pub fn accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a write timeout
    pub fn timeout_error(&self) {
        self.timeout_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session closed for being idle
    pub fn idle_close(&self) {
        self.idle_closes.fetch_add(1, Ordering::Relaxed);
    }

    // Snapshot

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            rejected_sessions: self.rejected_sessions.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            timeout_errors: self.timeout_errors.load(Ordering::Relaxed),
            idle_closes: self.idle_closes.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
            avg_session_duration: self.average_session_duration(),
        }
    }

    fn average_session_duration(&self) -> Duration {
        let closed = self
            .total_sessions
            .load(Ordering::Relaxed)
            .saturating_sub(self.active_sessions.load(Ordering::Relaxed));
        if closed == 0 {
            return Duration::ZERO;
        }
        let total_ns = self.total_session_duration_ns.load(Ordering::Relaxed);
        Duration::from_nanos(total_ns / closed)
    }
}

/// A snapshot of server metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Total sessions since server start
    pub total_sessions: u64,
    /// Current active sessions
    pub active_sessions: u64,
    /// Bytes written by closed sessions
    pub bytes_sent: u64,
    /// Bytes read by closed sessions
    pub bytes_received: u64,
    /// Messages written by closed sessions
    pub messages_sent: u64,
    /// Messages read by closed sessions
    pub messages_received: u64,
    /// Connections refused at the session limit
    pub rejected_sessions: u64,
    /// Failed accepts
    pub accept_errors: u64,
    /// Write timeouts
    pub timeout_errors: u64,
    /// Sessions closed for being idle
    pub idle_closes: u64,
    /// Server uptime
    pub uptime: Duration,
    /// Average duration of closed sessions
    pub avg_session_duration: Duration,
}

impl MetricsSnapshot {
    /// Calculate bytes per second (sent)
    pub fn bytes_sent_per_sec(&self) -> f64 {
        if self.uptime.is_zero() {
            return 0.0;
        }
        self.bytes_sent as f64 / self.uptime.as_secs_f64()
    }

    /// Calculate bytes per second (received)
    pub fn bytes_received_per_sec(&self) -> f64 {
        if self.uptime.is_zero() {
            return 0.0;
        }
        self.bytes_received as f64 / self.uptime.as_secs_f64()
    }

    /// Calculate total error count
    pub fn total_errors(&self) -> u64 {
        self.rejected_sessions + self.accept_errors + self.timeout_errors
    }

    /// Calculate error rate (errors per second)
    pub fn error_rate(&self) -> f64 {
        if self.uptime.is_zero() {
            return 0.0;
        }
        self.total_errors() as f64 / self.uptime.as_secs_f64()
    }
}
