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

//! Transport side of a session
//!
//! A transport implements [`IoProcessor`] for the sessions it creates. The
//! chain's outbound sink calls [`flush`](IoProcessor::flush) after queueing
//! a write and [`close`](IoProcessor::close) when a close reaches the
//! head. In the other direction the transport reports I/O through the
//! session's `fire_*` methods and must call
//! [`Session::transport_closed`](crate::Session::transport_closed) once the
//! handle is gone.

use crate::{Message, Session};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Transport collaborator driving a session's I/O
#[allow(unused_variables)]
pub trait IoProcessor: Send + Sync + 'static {
    /// Short transport name used in logs
    fn name(&self) -> &'static str;

    /// Write out whatever is pending in the session's write queue
    ///
    /// Called on the session's worker; must not block.
    fn flush(&self, session: &Arc<Session>);

    /// Tear down the transport handle
    ///
    /// Must be idempotent and must eventually call
    /// [`Session::transport_closed`].
    fn close(&self, session: &Arc<Session>);

    /// Reads for the session became suspended
    fn suspend_read(&self, session: &Arc<Session>) {}

    /// Reads for the session may resume
    fn resume_read(&self, session: &Arc<Session>) {}
}

/// Inbound buffer for transports that push messages rather than poll a socket
///
/// Messages are handed to the session in arrival order and held back while
/// the session's reads are suspended. Only one thread drains at a time; a
/// push that arrives while another thread is draining (including a nested
/// push from inside the chain) is picked up by that drain.
#[derive(Debug, Default)]
pub struct ReadQueue {
    messages: Mutex<VecDeque<Message>>,
    draining: AtomicBool,
}

impl ReadQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a message and deliver what the session will accept
    pub fn push(&self, session: &Arc<Session>, message: Message) {
        self.lock().push_back(message);
        self.drain(session);
    }

    /// Deliver queued messages until the queue empties or reads are suspended
    pub fn drain(&self, session: &Arc<Session>) {
        loop {
            if self.draining.swap(true, Ordering::AcqRel) {
                return;
            }
            while !session.is_read_suspended() {
                let Some(message) = self.lock().pop_front() else {
                    break;
                };
                session.fire_message_received(message);
            }
            self.draining.store(false, Ordering::Release);

            if session.is_read_suspended() || self.lock().is_empty() {
                return;
            }
        }
    }

    /// Number of messages held back
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if nothing is held back
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop everything held back
    pub fn clear(&self) {
        self.lock().clear();
    }
}
