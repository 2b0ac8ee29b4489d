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

//! Session manager
//!
//! The SessionManager tracks every live session a server accepted. It is
//! responsible for:
//! - Registering sessions and dropping them once they close
//! - Sweeping sessions for idleness
//! - Broadcasting writes to all sessions
//! - Closing everything on shutdown within a deadline

use crate::ServerMetrics;
use bytes::Bytes;
use dashmap::DashMap;
use relaygate_service::{Session, SessionId, SessionInfo, WriteError};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Result of a broadcast operation
#[derive(Debug, Clone, Default)]
pub struct BroadcastResult {
    /// Total number of sessions written to
    pub total: usize,
    /// Number of writes that flushed
    pub succeeded: usize,
    /// Number of writes that failed
    pub failed: usize,
    /// Failures by session
    pub errors: Vec<(SessionId, WriteError)>,
}

impl BroadcastResult {
    /// Check if all broadcasts succeeded
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Get the success rate as a percentage
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            (self.succeeded as f64 / self.total as f64) * 100.0
        }
    }
}

/// Tracks live sessions
pub struct SessionManager {
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    metrics: Arc<ServerMetrics>,
}

impl SessionManager {
    /// Create a new session manager reporting into `metrics`
    pub fn new(metrics: Arc<ServerMetrics>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            metrics,
        }
    }

    /// Metrics the manager reports into
    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Start tracking a session
    ///
    /// The session is dropped from the manager when its close future
    /// resolves, including when it is already closed. A session must be
    /// registered at most once.
    pub fn register(&self, session: &Arc<Session>) {
        let id = session.id();
        self.sessions.insert(id, session.clone());
        self.metrics.session_opened();

        let sessions = self.sessions.clone();
        let metrics = self.metrics.clone();
        let weak: Weak<Session> = Arc::downgrade(session);
        session.close_future().add_listener(move |_| {
            if let Some(session) = weak.upgrade() {
                metrics.session_closed(&session.info());
            }
            sessions.remove(&id);
        });
    }

    /// Get a session by ID
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Get session info
    pub fn info(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.get(&id).map(|entry| entry.info())
    }

    /// Get all session IDs
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Get all session infos
    pub fn infos(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|entry| entry.info()).collect()
    }

    /// Get the number of live sessions
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Check if no sessions are live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Fire `session_idle` on every session whose idle interval elapsed
    ///
    /// Returns the number of idle events fired.
    pub fn sweep_idle(&self) -> usize {
        self.snapshot()
            .iter()
            .map(|session| session.poll_idle().len())
            .sum()
    }

    /// Write `data` to every live session
    ///
    /// Waits for every write to flush or fail.
    pub async fn broadcast(&self, data: Bytes) -> BroadcastResult {
        let writes: Vec<_> = self
            .snapshot()
            .into_iter()
            .map(|session| {
                let future = session.write(data.clone());
                async move { (session.id(), future.wait().await) }
            })
            .collect();

        let mut result = BroadcastResult {
            total: writes.len(),
            ..Default::default()
        };
        for (id, outcome) in futures_util::future::join_all(writes).await {
            match outcome {
                Ok(()) => result.succeeded += 1,
                Err(error) => {
                    result.failed += 1;
                    result.errors.push((id, error));
                }
            }
        }
        result
    }

    /// Close every session and wait up to `timeout` for them to finish
    ///
    /// Returns the number of sessions still open when the wait ended.
    pub async fn close_all(&self, timeout: Duration) -> usize {
        let closing: Vec<_> = self
            .snapshot()
            .iter()
            .map(|session| {
                let future = session.close_now();
                async move { future.wait().await }
            })
            .collect();
        if closing.is_empty() {
            return 0;
        }

        tracing::debug!(sessions = closing.len(), "Closing all sessions");
        if tokio::time::timeout(timeout, futures_util::future::join_all(closing))
            .await
            .is_err()
        {
            let remaining = self.count();
            tracing::warn!(remaining, ?timeout, "Sessions did not close in time");
            return remaining;
        }
        0
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("session_count", &self.count())
            .finish()
    }
}
