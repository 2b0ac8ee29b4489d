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

//! Diagnostic filter verifying thread alignment
//!
//! Installed at the head of every chain when
//! [`SessionConfig::assert_alignment`](crate::SessionConfig) is set. It
//! checks each inbound callback against the session's worker and records
//! violations; it never changes the flow of events.

use crate::{IdleStatus, IoFilter, Message, NextFilter, Session, SessionError, WriteRequest};
use metrics::counter;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Chain name under which the assertion filter is installed
pub const ALIGNMENT_ASSERTION: &str = "alignment-assertion";

/// Records inbound callbacks that run off the session's worker
#[derive(Debug, Default)]
pub struct AlignmentAssertionFilter {
    checked: AtomicU64,
    violations: AtomicU64,
}

impl AlignmentAssertionFilter {
    /// Create a filter with zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of callbacks checked
    pub fn checked(&self) -> u64 {
        self.checked.load(Ordering::Relaxed)
    }

    /// Number of callbacks that ran on the wrong thread
    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    fn check(&self, session: &Arc<Session>, event: &'static str) {
        self.checked.fetch_add(1, Ordering::Relaxed);
        if session.is_escalated() || session.worker().is_aligned() {
            return;
        }
        self.violations.fetch_add(1, Ordering::Relaxed);
        counter!("relaygate.dispatch.misaligned").increment(1);
        let thread = std::thread::current();
        tracing::error!(
            session_id = %session.id(),
            worker = %session.worker().name(),
            thread = ?thread.name(),
            event,
            "Chain callback ran off the session worker"
        );
    }
}

impl IoFilter for AlignmentAssertionFilter {
    fn session_created(&self, next: &NextFilter, session: &Arc<Session>) {
        self.check(session, "session_created");
        next.session_created(session);
    }

    fn session_opened(&self, next: &NextFilter, session: &Arc<Session>) {
        self.check(session, "session_opened");
        next.session_opened(session);
    }

    fn session_closed(&self, next: &NextFilter, session: &Arc<Session>) {
        self.check(session, "session_closed");
        next.session_closed(session);
    }

    fn session_idle(&self, next: &NextFilter, session: &Arc<Session>, status: IdleStatus) {
        self.check(session, "session_idle");
        next.session_idle(session, status);
    }

    fn message_received(&self, next: &NextFilter, session: &Arc<Session>, message: Message) {
        self.check(session, "message_received");
        next.message_received(session, message);
    }

    fn message_sent(&self, next: &NextFilter, session: &Arc<Session>, request: Arc<WriteRequest>) {
        self.check(session, "message_sent");
        next.message_sent(session, request);
    }

    fn exception_caught(&self, next: &NextFilter, session: &Arc<Session>, error: SessionError) {
        self.check(session, "exception_caught");
        next.exception_caught(session, error);
    }
}
