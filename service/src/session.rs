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

//! Session implementation
//!
//! A [`Session`] is one logical connection. It owns the filter chain, the
//! attribute map and the write queue, and is bound to one [`IoWorker`] for
//! its whole life. Transports create sessions through [`SessionBuilder`]
//! and report I/O through the `fire_*` methods; application code writes
//! and closes through [`Session::write`] and [`Session::close_now`]. All of
//! these may be called from any thread; the dispatch layer moves the
//! resulting chain callbacks onto the worker.
//!
//! Lifecycle: `Created` when the transport handle exists, `Opened` after
//! [`Session::fire_session_opened`], `Closing` once a close was requested or
//! the transport went away, and `Closed` after `session_closed` has reached
//! the handler. Pending writes are failed with
//! [`WriteError::SessionClosed`] at that point and the close future resolves.

use crate::assertion::{ALIGNMENT_ASSERTION, AlignmentAssertionFilter};
use crate::dispatch::{self, InboundEvent, OutboundEvent};
use crate::write::fail_all;
use crate::{
    AttributeMap, CloseFuture, Endpoint, FilterChain, IdleStatus, IoHandler, IoProcessor,
    IoWorker, Message, SessionConfig, SessionError, SessionId, SessionInfo, SessionState,
    WriteError, WriteFuture, WriteRequest, WriteRequestQueue,
};
use metrics::counter;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Builder for sessions, used by transports
pub struct SessionBuilder {
    worker: Arc<IoWorker>,
    handler: Arc<dyn IoHandler>,
    processor: Arc<dyn IoProcessor>,
    local: Endpoint,
    remote: Endpoint,
    config: SessionConfig,
}

impl SessionBuilder {
    /// Start building a session aligned to `worker`
    pub fn new(
        worker: Arc<IoWorker>,
        handler: Arc<dyn IoHandler>,
        processor: Arc<dyn IoProcessor>,
    ) -> Self {
        Self {
            worker,
            handler,
            processor,
            local: Endpoint::Named("local".into()),
            remote: Endpoint::Named("remote".into()),
            config: SessionConfig::default(),
        }
    }

    /// Set the local endpoint
    pub fn with_local(mut self, local: impl Into<Endpoint>) -> Self {
        self.local = local.into();
        self
    }

    /// Set the remote endpoint
    pub fn with_remote(mut self, remote: impl Into<Endpoint>) -> Self {
        self.remote = remote.into();
        self
    }

    /// Set the session configuration
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Create the session
    ///
    /// No events are fired; the transport fires `session_created` once
    /// its own setup (and any initializer) is done.
    pub fn build(self) -> Arc<Session> {
        let assert_alignment = self.config.assert_alignment;
        let session = Arc::new_cyclic(|weak| Session {
            id: SessionId::next(),
            local: self.local,
            remote: self.remote,
            config: self.config,
            attributes: AttributeMap::new(),
            write_queue: WriteRequestQueue::new(),
            worker: self.worker,
            chain: FilterChain::new(weak.clone()),
            handler: self.handler,
            processor: self.processor,
            state: AtomicU8::new(SessionState::Created.as_u8()),
            read_suspends: AtomicUsize::new(0),
            pending_tasks: AtomicUsize::new(0),
            closed_fired: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            escalated: AtomicBool::new(false),
            close_future: CloseFuture::new(),
            created_at: Instant::now(),
            last_read: AtomicU64::new(0),
            last_write: AtomicU64::new(0),
            last_idle: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
        });

        if assert_alignment
            && let Err(error) = session
                .chain
                .add_first(ALIGNMENT_ASSERTION, Arc::new(AlignmentAssertionFilter::new()))
        {
            tracing::warn!(session_id = %session.id, error = %error, "Failed to install alignment assertion");
        }

        counter!("relaygate.sessions.created").increment(1);
        tracing::debug!(
            session_id = %session.id,
            local = %session.local,
            remote = %session.remote,
            worker = %session.worker.name(),
            transport = session.processor.name(),
            "Session created"
        );
        session
    }
}

/// A logical connection flowing through a filter chain
pub struct Session {
    id: SessionId,
    local: Endpoint,
    remote: Endpoint,
    config: SessionConfig,
    attributes: AttributeMap,
    write_queue: WriteRequestQueue,
    worker: Arc<IoWorker>,
    chain: FilterChain,
    handler: Arc<dyn IoHandler>,
    processor: Arc<dyn IoProcessor>,
    state: AtomicU8,
    read_suspends: AtomicUsize,
    pending_tasks: AtomicUsize,
    closed_fired: AtomicBool,
    finished: AtomicBool,
    escalated: AtomicBool,
    close_future: CloseFuture,
    created_at: Instant,
    /// Milliseconds since `created_at`
    last_read: AtomicU64,
    last_write: AtomicU64,
    last_idle: [AtomicU64; 3],
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
}

impl Session {
    /// Get the session ID
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Local endpoint
    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    /// Remote endpoint
    pub fn remote(&self) -> &Endpoint {
        &self.remote
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Per-session attributes
    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    /// Pending outbound requests
    pub fn write_queue(&self) -> &WriteRequestQueue {
        &self.write_queue
    }

    /// The worker all chain callbacks run on
    pub fn worker(&self) -> &Arc<IoWorker> {
        &self.worker
    }

    /// The session's filter chain
    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    /// The terminal handler
    pub fn handler(&self) -> &Arc<dyn IoHandler> {
        &self.handler
    }

    /// The transport driving this session
    pub fn processor(&self) -> &Arc<dyn IoProcessor> {
        &self.processor
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Check if the session is open
    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Opened
    }

    /// Check if a close has been requested or completed
    pub fn is_closing(&self) -> bool {
        self.state().is_terminal()
    }

    /// Check if the session is fully closed
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    fn now_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    // ===== Inbound entry points =====

    /// Report that the transport created the session
    pub fn fire_session_created(self: &Arc<Self>) {
        dispatch::fire_inbound(self, InboundEvent::SessionCreated);
    }

    /// Report that the session is open
    ///
    /// Only the first call on a session that is not closing fires the event.
    pub fn fire_session_opened(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                SessionState::Created.as_u8(),
                SessionState::Opened.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            tracing::debug!(session_id = %self.id, "Session opened");
            dispatch::fire_inbound(self, InboundEvent::SessionOpened);
        }
    }

    /// Report a received message
    pub fn fire_message_received(self: &Arc<Self>, message: Message) {
        if let Some(buffer) = message.as_buffer() {
            self.bytes_read
                .fetch_add(bytes::Buf::remaining(buffer) as u64, Ordering::Relaxed);
        }
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_read.store(self.now_ms(), Ordering::Relaxed);
        tracing::trace!(session_id = %self.id, message = ?message, "Message received");
        dispatch::fire_inbound(self, InboundEvent::MessageReceived(message));
    }

    /// Report a flushed write request
    pub fn fire_message_sent(self: &Arc<Self>, request: Arc<WriteRequest>) {
        dispatch::fire_inbound(self, InboundEvent::MessageSent(request));
    }

    /// Report an error
    pub fn fire_exception_caught(self: &Arc<Self>, error: SessionError) {
        dispatch::fire_inbound(self, InboundEvent::ExceptionCaught(error));
    }

    /// Report that the session has been idle
    pub fn fire_session_idle(self: &Arc<Self>, status: IdleStatus) {
        dispatch::fire_inbound(self, InboundEvent::SessionIdle(status));
    }

    /// Report that the transport handle is gone
    ///
    /// Fires `session_closed` exactly once, however many times it is called.
    pub fn transport_closed(self: &Arc<Self>) {
        if self.closed_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
            (state != SessionState::Closed.as_u8()).then_some(SessionState::Closing.as_u8())
        });
        dispatch::fire_inbound(self, InboundEvent::SessionClosed);
    }

    // ===== Outbound entry points =====

    /// Write a message through the chain
    ///
    /// Failures are reported through the returned future, never as a panic
    /// or error return.
    pub fn write(self: &Arc<Self>, message: impl Into<Message>) -> WriteFuture {
        self.write_request(WriteRequest::new(message.into()))
    }

    /// Write a message to a specific destination (connectionless transports)
    pub fn write_to(self: &Arc<Self>, message: impl Into<Message>, destination: SocketAddr) -> WriteFuture {
        self.write_request(WriteRequest::new(message.into()).with_destination(destination))
    }

    /// Send a prepared write request through the chain
    pub fn write_request(self: &Arc<Self>, request: WriteRequest) -> WriteFuture {
        let future = request.future().clone();
        if self.is_closing() {
            self.fail_write(request, WriteError::SessionClosed);
        } else {
            dispatch::fire_outbound(self, OutboundEvent::FilterWrite(request));
        }
        future
    }

    /// Close the session immediately, dropping unflushed writes
    ///
    /// Idempotent; every call returns the same close future.
    pub fn close_now(self: &Arc<Self>) -> CloseFuture {
        let requested = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                match SessionState::from_u8(state) {
                    SessionState::Created | SessionState::Opened => {
                        Some(SessionState::Closing.as_u8())
                    }
                    _ => None,
                }
            })
            .is_ok();
        if requested {
            tracing::debug!(session_id = %self.id, "Session close requested");
            dispatch::fire_outbound(self, OutboundEvent::FilterClose);
        }
        self.close_future.clone()
    }

    /// Future resolved once the session is fully closed
    pub fn close_future(&self) -> CloseFuture {
        self.close_future.clone()
    }

    // ===== Transport callbacks =====

    /// Report that a dequeued request was flushed
    ///
    /// For a part of a split request the future is written, and
    /// `message_sent` fired, only when the last part is flushed.
    pub fn complete_write(self: &Arc<Self>, request: WriteRequest, written: usize) {
        self.bytes_written.fetch_add(written as u64, Ordering::Relaxed);
        self.last_write.store(self.now_ms(), Ordering::Relaxed);
        if !request.finish_part() {
            return;
        }
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        if request.future().set_written() {
            self.fire_message_sent(Arc::new(request));
        }
    }

    /// Fail a request's future
    ///
    /// Does not raise an exception on the session; the transport decides
    /// whether a failed write also closes it.
    pub fn fail_write(&self, request: WriteRequest, error: WriteError) {
        if request.future().set_failed(error.clone()) {
            counter!("relaygate.writes.failed").increment(1);
            tracing::debug!(
                session_id = %self.id,
                request = request.original_id(),
                error = %error,
                "Write failed"
            );
        }
    }

    pub(crate) fn enqueue_write(self: &Arc<Self>, request: WriteRequest) {
        if self.is_closing() {
            self.fail_write(request, WriteError::SessionClosed);
            return;
        }
        match self.write_queue.offer(request) {
            Ok(()) => self.processor.flush(self),
            Err(request) => self.fail_write(request, WriteError::SessionClosed),
        }
    }

    pub(crate) fn force_close(self: &Arc<Self>) {
        let _ = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
            (state != SessionState::Closed.as_u8()).then_some(SessionState::Closing.as_u8())
        });
        self.processor.close(self);
        self.transport_closed();
    }

    /// Final cleanup once `session_closed` has been through the chain
    pub(crate) fn finish_close(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state
            .store(SessionState::Closed.as_u8(), Ordering::Release);
        let pending = self.write_queue.dispose();
        let failed = fail_all(&pending, &WriteError::SessionClosed);
        if failed > 0 {
            counter!("relaygate.writes.failed").increment(failed as u64);
        }
        counter!("relaygate.sessions.closed").increment(1);
        tracing::debug!(
            session_id = %self.id,
            failed_writes = failed,
            duration = ?self.created_at.elapsed(),
            "Session closed"
        );
        self.close_future.complete(());
    }

    // ===== Read suspension =====

    /// Suspend reads; nested calls need the same number of resumes
    pub fn suspend_read(self: &Arc<Self>) {
        if self.read_suspends.fetch_add(1, Ordering::AcqRel) == 0 {
            tracing::trace!(session_id = %self.id, "Reads suspended");
            self.processor.suspend_read(self);
        }
    }

    /// Undo one [`suspend_read`](Self::suspend_read)
    pub fn resume_read(self: &Arc<Self>) {
        match self
            .read_suspends
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
        {
            Ok(1) => {
                tracing::trace!(session_id = %self.id, "Reads resumed");
                self.processor.resume_read(self);
            }
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(session_id = %self.id, "resume_read without matching suspend_read");
            }
        }
    }

    /// Check if reads are currently suspended
    pub fn is_read_suspended(&self) -> bool {
        self.read_suspends.load(Ordering::Acquire) > 0
    }

    /// Current suspend nesting depth
    pub fn read_suspend_count(&self) -> usize {
        self.read_suspends.load(Ordering::Acquire)
    }

    // ===== Dispatch bookkeeping =====

    pub(crate) fn pending_tasks(&self) -> usize {
        self.pending_tasks.load(Ordering::Acquire)
    }

    pub(crate) fn task_queued(&self) {
        self.pending_tasks.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn task_started(&self) {
        self.pending_tasks.fetch_sub(1, Ordering::AcqRel);
    }

    /// Check if the session lost its worker and now runs events inline
    pub fn is_escalated(&self) -> bool {
        self.escalated.load(Ordering::Acquire)
    }

    /// Returns `true` for the call that escalated the session
    pub(crate) fn mark_escalated(&self) -> bool {
        !self.escalated.swap(true, Ordering::AcqRel)
    }

    // ===== Idle tracking =====

    /// Fire `session_idle` for every idle interval that has elapsed
    ///
    /// Each status fires again only after another full interval of
    /// inactivity. Returns the statuses fired.
    pub fn poll_idle(self: &Arc<Self>) -> Vec<IdleStatus> {
        if !self.is_open() {
            return Vec::new();
        }
        let now = self.now_ms();
        let last_read = self.last_read.load(Ordering::Relaxed);
        let last_write = self.last_write.load(Ordering::Relaxed);
        let checks = [
            (IdleStatus::ReaderIdle, self.config.reader_idle_time, last_read),
            (IdleStatus::WriterIdle, self.config.writer_idle_time, last_write),
            (IdleStatus::BothIdle, self.config.both_idle_time, last_read.max(last_write)),
        ];

        let mut fired = Vec::new();
        for (slot, (status, limit, last_activity)) in checks.into_iter().enumerate() {
            let Some(limit) = limit.map(|limit| limit.as_millis() as u64) else {
                continue;
            };
            let since = last_activity.max(self.last_idle[slot].load(Ordering::Relaxed));
            if limit > 0 && now.saturating_sub(since) >= limit {
                self.last_idle[slot].store(now, Ordering::Relaxed);
                fired.push(status);
                self.fire_session_idle(status);
            }
        }
        fired
    }

    /// Get a snapshot of the session's counters
    pub fn info(&self) -> SessionInfo {
        let at = |ms: &AtomicU64| self.created_at + Duration::from_millis(ms.load(Ordering::Relaxed));
        SessionInfo {
            id: self.id,
            state: self.state(),
            local: self.local.clone(),
            remote: self.remote.clone(),
            created_at: self.created_at,
            last_read: at(&self.last_read),
            last_write: at(&self.last_write),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            queued_writes: self.write_queue.len(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("worker", &self.worker.name())
            .field("chain", &self.chain)
            .finish()
    }
}
