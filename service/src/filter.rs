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

//! Filter trait
//!
//! A filter sees every event of every session whose chain it is part of.
//! Inbound events (lifecycle, received messages, exceptions) travel from the
//! head of the chain toward the [`IoHandler`](crate::IoHandler); outbound
//! events (writes and closes) travel from the tail toward the transport.
//!
//! Every callback has a pass-through default, so a filter only overrides the
//! events it cares about. Filters are usually shared between many sessions
//! and keep per-session state in the session's
//! [`AttributeMap`](crate::AttributeMap).
//!
//! # Example
//!
//! ```
//! use relaygate_service::{IoFilter, Message, NextFilter, Session};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! #[derive(Default)]
//! struct CountingFilter {
//!     received: AtomicU64,
//! }
//!
//! impl IoFilter for CountingFilter {
//!     fn message_received(&self, next: &NextFilter, session: &Arc<Session>, message: Message) {
//!         self.received.fetch_add(1, Ordering::Relaxed);
//!         next.message_received(session, message);
//!     }
//! }
//! ```

use crate::chain::Entries;
use crate::dispatch::{self, InboundEvent, OutboundEvent};
use crate::{FilterChain, IdleStatus, Message, Result, Session, SessionError, WriteRequest};
use std::fmt;
use std::sync::Arc;

/// A stage in a session's filter chain
///
/// All event callbacks for one session run on that session's worker thread,
/// one at a time. The add and remove hooks run synchronously on the thread
/// mutating the chain.
#[allow(unused_variables)]
pub trait IoFilter: Send + Sync + 'static {
    /// Called before the filter is linked into `chain` under `name`
    ///
    /// Returning an error aborts the add and leaves the chain unchanged.
    fn on_pre_add(&self, chain: &FilterChain, name: &str) -> Result<()> {
        Ok(())
    }

    /// Called after the filter has been linked in
    ///
    /// Returning an error unlinks the filter again.
    fn on_post_add(&self, chain: &FilterChain, name: &str) -> Result<()> {
        Ok(())
    }

    /// Called before the filter is unlinked
    ///
    /// Returning an error aborts the removal.
    fn on_pre_remove(&self, chain: &FilterChain, name: &str) -> Result<()> {
        Ok(())
    }

    /// Called after the filter has been unlinked
    fn on_post_remove(&self, chain: &FilterChain, name: &str) -> Result<()> {
        Ok(())
    }

    /// The transport created the session
    fn session_created(&self, next: &NextFilter, session: &Arc<Session>) {
        next.session_created(session);
    }

    /// The session finished its handshake and is open
    fn session_opened(&self, next: &NextFilter, session: &Arc<Session>) {
        next.session_opened(session);
    }

    /// The session closed
    fn session_closed(&self, next: &NextFilter, session: &Arc<Session>) {
        next.session_closed(session);
    }

    /// The session has been idle
    fn session_idle(&self, next: &NextFilter, session: &Arc<Session>, status: IdleStatus) {
        next.session_idle(session, status);
    }

    /// A message arrived
    fn message_received(&self, next: &NextFilter, session: &Arc<Session>, message: Message) {
        next.message_received(session, message);
    }

    /// A write request was flushed by the transport
    fn message_sent(&self, next: &NextFilter, session: &Arc<Session>, request: Arc<WriteRequest>) {
        next.message_sent(session, request);
    }

    /// An error was raised for the session
    fn exception_caught(&self, next: &NextFilter, session: &Arc<Session>, error: SessionError) {
        next.exception_caught(session, error);
    }

    /// A write request is travelling toward the transport
    fn filter_write(&self, next: &NextFilter, session: &Arc<Session>, request: WriteRequest) {
        next.filter_write(session, request);
    }

    /// A close request is travelling toward the transport
    fn filter_close(&self, next: &NextFilter, session: &Arc<Session>) {
        next.filter_close(session);
    }
}

/// Continuation handed to a filter callback
///
/// It is bound to the filter's position in the chain snapshot taken when the
/// event was dispatched. Inbound methods continue toward the handler,
/// outbound methods toward the transport. Calling it from a thread other
/// than the session's worker realigns the event onto the worker.
#[derive(Clone)]
pub struct NextFilter {
    entries: Entries,
    index: usize,
}

impl NextFilter {
    pub(crate) fn new(entries: Entries, index: usize) -> Self {
        Self { entries, index }
    }

    /// Name of the filter this continuation belongs to
    pub fn name(&self) -> &str {
        self.entries[self.index].name()
    }

    fn inbound(&self, session: &Arc<Session>, event: InboundEvent) {
        dispatch::call_inbound(session, &self.entries, self.index + 1, event);
    }

    fn outbound(&self, session: &Arc<Session>, event: OutboundEvent) {
        dispatch::call_outbound(session, &self.entries, self.index, event);
    }

    /// Pass `session_created` on
    pub fn session_created(&self, session: &Arc<Session>) {
        self.inbound(session, InboundEvent::SessionCreated);
    }

    /// Pass `session_opened` on
    pub fn session_opened(&self, session: &Arc<Session>) {
        self.inbound(session, InboundEvent::SessionOpened);
    }

    /// Pass `session_closed` on
    pub fn session_closed(&self, session: &Arc<Session>) {
        self.inbound(session, InboundEvent::SessionClosed);
    }

    /// Pass `session_idle` on
    pub fn session_idle(&self, session: &Arc<Session>, status: IdleStatus) {
        self.inbound(session, InboundEvent::SessionIdle(status));
    }

    /// Pass `message_received` on
    pub fn message_received(&self, session: &Arc<Session>, message: Message) {
        self.inbound(session, InboundEvent::MessageReceived(message));
    }

    /// Pass `message_sent` on
    pub fn message_sent(&self, session: &Arc<Session>, request: Arc<WriteRequest>) {
        self.inbound(session, InboundEvent::MessageSent(request));
    }

    /// Pass `exception_caught` on
    pub fn exception_caught(&self, session: &Arc<Session>, error: SessionError) {
        self.inbound(session, InboundEvent::ExceptionCaught(error));
    }

    /// Pass `filter_write` on
    pub fn filter_write(&self, session: &Arc<Session>, request: WriteRequest) {
        self.outbound(session, OutboundEvent::FilterWrite(request));
    }

    /// Pass `filter_close` on
    pub fn filter_close(&self, session: &Arc<Session>) {
        self.outbound(session, OutboundEvent::FilterClose);
    }
}

impl fmt::Debug for NextFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NextFilter")
            .field("filter", &self.name())
            .field("index", &self.index)
            .finish()
    }
}
