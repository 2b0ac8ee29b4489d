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

//! Thread-aligned event dispatch
//!
//! Every chain callback for a session runs on the session's [`IoWorker`].
//! Each hop through the chain checks whether the calling thread is that
//! worker:
//!
//! - aligned: the next filter (or the handler / transport sink) is invoked
//!   directly;
//! - not aligned: the event and its chain position are packaged into an
//!   [`AlignedTask`] and queued on the worker, and the caller returns at
//!   once. A realigned `message_received` suspends reads on the session
//!   first; the task resumes them once the chain has processed the message.
//!
//! Events entering the chain (from a transport, the session API or a
//! bridge) are also queued when the worker is current but tasks for the
//! same session are still pending, so an aligned caller cannot overtake an
//! event that was realigned a moment earlier.
//!
//! A panic inside a callback is caught at the hop where it happened and
//! becomes an `exception_caught` event. If the worker refuses a task the
//! session is escalated: the exception and the close are delivered on the
//! calling thread and every later event for the session runs inline.
//!
//! [`IoWorker`]: crate::IoWorker

use crate::chain::Entries;
use crate::worker::WorkerTask;
use crate::{IdleStatus, Message, NextFilter, Session, SessionError, WriteError, WriteRequest};
use metrics::counter;
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Events travelling from the transport toward the handler
pub enum InboundEvent {
    /// Transport handle created
    SessionCreated,
    /// Handshake complete
    SessionOpened,
    /// Session closed
    SessionClosed,
    /// No traffic for the configured idle time
    SessionIdle(IdleStatus),
    /// A message arrived
    MessageReceived(Message),
    /// A write request was flushed
    MessageSent(Arc<WriteRequest>),
    /// An error was raised
    ExceptionCaught(SessionError),
}

impl InboundEvent {
    /// Short name of the event, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::SessionCreated => "session_created",
            InboundEvent::SessionOpened => "session_opened",
            InboundEvent::SessionClosed => "session_closed",
            InboundEvent::SessionIdle(_) => "session_idle",
            InboundEvent::MessageReceived(_) => "message_received",
            InboundEvent::MessageSent(_) => "message_sent",
            InboundEvent::ExceptionCaught(_) => "exception_caught",
        }
    }
}

impl fmt::Debug for InboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Events travelling from the session toward the transport
pub enum OutboundEvent {
    /// Write a request
    FilterWrite(WriteRequest),
    /// Close the session
    FilterClose,
}

impl OutboundEvent {
    /// Short name of the event, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::FilterWrite(_) => "filter_write",
            OutboundEvent::FilterClose => "filter_close",
        }
    }
}

impl fmt::Debug for OutboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Where a realigned event resumes its walk
enum Route {
    /// Deliver to the first active entry at or after `from`
    Inbound { from: usize, event: InboundEvent },
    /// Deliver to the last active entry before `before`
    Outbound { before: usize, event: OutboundEvent },
}

/// A chain event queued on a session's worker
pub(crate) struct AlignedTask {
    session: Arc<Session>,
    entries: Entries,
    route: Route,
    resume_read: bool,
}

impl AlignedTask {
    pub(crate) fn run(self) {
        let AlignedTask {
            session,
            entries,
            route,
            resume_read,
        } = self;
        session.task_started();
        match route {
            Route::Inbound { from, event } => walk_inbound(&session, &entries, from, event),
            Route::Outbound { before, event } => walk_outbound(&session, &entries, before, event),
        }
        if resume_read {
            session.resume_read();
        }
    }
}

impl fmt::Debug for AlignedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let event = match &self.route {
            Route::Inbound { event, .. } => event.kind(),
            Route::Outbound { event, .. } => event.kind(),
        };
        f.debug_struct("AlignedTask")
            .field("session", &self.session.id())
            .field("event", &event)
            .field("resume_read", &self.resume_read)
            .finish()
    }
}

fn needs_realign(session: &Session, entering: bool) -> bool {
    if session.is_escalated() {
        return false;
    }
    !session.worker().is_aligned() || (entering && session.pending_tasks() > 0)
}

/// Deliver an inbound event from the head of the session's chain
pub(crate) fn fire_inbound(session: &Arc<Session>, event: InboundEvent) {
    let entries = session.chain().snapshot();
    if needs_realign(session, true) {
        realign(session, entries, Route::Inbound { from: 0, event });
    } else {
        walk_inbound(session, &entries, 0, event);
    }
}

/// Deliver an outbound event from the tail of the session's chain
pub(crate) fn fire_outbound(session: &Arc<Session>, event: OutboundEvent) {
    let entries = session.chain().snapshot();
    let before = entries.len();
    if needs_realign(session, true) {
        realign(session, entries, Route::Outbound { before, event });
    } else {
        walk_outbound(session, &entries, before, event);
    }
}

pub(crate) fn call_inbound(session: &Arc<Session>, entries: &Entries, from: usize, event: InboundEvent) {
    if needs_realign(session, false) {
        realign(session, entries.clone(), Route::Inbound { from, event });
    } else {
        walk_inbound(session, entries, from, event);
    }
}

pub(crate) fn call_outbound(
    session: &Arc<Session>,
    entries: &Entries,
    before: usize,
    event: OutboundEvent,
) {
    if needs_realign(session, false) {
        realign(session, entries.clone(), Route::Outbound { before, event });
    } else {
        walk_outbound(session, entries, before, event);
    }
}

fn realign(session: &Arc<Session>, entries: Entries, route: Route) {
    let resume_read = matches!(
        route,
        Route::Inbound {
            event: InboundEvent::MessageReceived(_),
            ..
        }
    );
    if resume_read {
        session.suspend_read();
    }
    session.task_queued();
    counter!("relaygate.dispatch.realigned").increment(1);

    let task = AlignedTask {
        session: session.clone(),
        entries,
        route,
        resume_read,
    };
    tracing::trace!(session_id = %session.id(), task = ?task, "Realigning event onto worker");
    if let Err(WorkerTask::Aligned(task)) = session.worker().submit(WorkerTask::Aligned(task)) {
        session.task_started();
        let error = SessionError::ExecutorUnavailable(session.worker().name().to_string());
        escalate(&task.session, error, task.route, task.resume_read);
    }
}

/// The worker refused a task: surface the loss and close the session
fn escalate(session: &Arc<Session>, error: SessionError, lost: Route, resume_read: bool) {
    if resume_read {
        session.resume_read();
    }
    let first = session.mark_escalated();
    if first {
        tracing::error!(
            session_id = %session.id(),
            error = %error,
            "Worker unavailable, closing session"
        );
        counter!("relaygate.dispatch.escalated").increment(1);
    }

    let lost_close = match lost {
        Route::Outbound {
            event: OutboundEvent::FilterWrite(request),
            ..
        } => {
            session.fail_write(request, WriteError::Rejected(error.to_string()));
            false
        }
        Route::Inbound {
            event: InboundEvent::SessionClosed,
            ..
        } => true,
        _ => false,
    };

    if first {
        fire_inbound(session, InboundEvent::ExceptionCaught(error));
    }
    if lost_close {
        fire_inbound(session, InboundEvent::SessionClosed);
    } else if first {
        session.force_close();
    }
}

fn walk_inbound(session: &Arc<Session>, entries: &Entries, from: usize, event: InboundEvent) {
    let index = entries
        .iter()
        .skip(from)
        .position(|entry| entry.is_active())
        .map(|offset| from + offset);
    let is_exception = matches!(event, InboundEvent::ExceptionCaught(_));
    let is_close = matches!(event, InboundEvent::SessionClosed);

    let result = match index {
        Some(index) => {
            let entry = &entries[index];
            let next = NextFilter::new(entries.clone(), index);
            let filter = entry.filter();
            catch_unwind(AssertUnwindSafe(|| match event {
                InboundEvent::SessionCreated => filter.session_created(&next, session),
                InboundEvent::SessionOpened => filter.session_opened(&next, session),
                InboundEvent::SessionClosed => filter.session_closed(&next, session),
                InboundEvent::SessionIdle(status) => filter.session_idle(&next, session, status),
                InboundEvent::MessageReceived(message) => {
                    filter.message_received(&next, session, message)
                }
                InboundEvent::MessageSent(request) => filter.message_sent(&next, session, request),
                InboundEvent::ExceptionCaught(error) => {
                    filter.exception_caught(&next, session, error)
                }
            }))
            .map_err(|panic| (entry.name().to_string(), panic))
        }
        None => catch_unwind(AssertUnwindSafe(|| tail(session, event)))
            .map_err(|panic| ("handler".to_string(), panic)),
    };

    if let Err((origin, panic)) = result {
        let message = panic_message(panic.as_ref());
        tracing::error!(
            session_id = %session.id(),
            origin = %origin,
            panic = %message,
            "Callback panicked"
        );
        if is_exception {
            session.close_now();
        } else {
            fire_inbound(
                session,
                InboundEvent::ExceptionCaught(SessionError::FilterPanicked(format!(
                    "{}: {}",
                    origin, message
                ))),
            );
        }
    }
    // A filter may swallow session_closed; the close still completes once
    // the walk from the head returns
    if is_close && (index.is_none() || from == 0) {
        session.finish_close();
    }
}

fn walk_outbound(session: &Arc<Session>, entries: &Entries, before: usize, event: OutboundEvent) {
    let index = entries[..before.min(entries.len())]
        .iter()
        .rposition(|entry| entry.is_active());
    let pending_write = match &event {
        OutboundEvent::FilterWrite(request) => Some(request.future().clone()),
        OutboundEvent::FilterClose => None,
    };
    let is_close = matches!(event, OutboundEvent::FilterClose);

    let result = match index {
        Some(index) => {
            let entry = &entries[index];
            let next = NextFilter::new(entries.clone(), index);
            let filter = entry.filter();
            catch_unwind(AssertUnwindSafe(|| match event {
                OutboundEvent::FilterWrite(request) => filter.filter_write(&next, session, request),
                OutboundEvent::FilterClose => filter.filter_close(&next, session),
            }))
            .map_err(|panic| (entry.name().to_string(), panic))
        }
        None => catch_unwind(AssertUnwindSafe(|| head(session, event)))
            .map_err(|panic| ("transport".to_string(), panic)),
    };

    if let Err((origin, panic)) = result {
        let message = panic_message(panic.as_ref());
        tracing::error!(
            session_id = %session.id(),
            origin = %origin,
            panic = %message,
            "Callback panicked"
        );
        if let Some(future) = pending_write {
            future.set_failed(WriteError::Rejected(format!("{} panicked", origin)));
        }
        fire_inbound(
            session,
            InboundEvent::ExceptionCaught(SessionError::FilterPanicked(format!(
                "{}: {}",
                origin, message
            ))),
        );
        if is_close {
            session.processor().close(session);
        }
    }
}

/// Terminal inbound stage: the session's handler
fn tail(session: &Arc<Session>, event: InboundEvent) {
    let handler = session.handler();
    match event {
        InboundEvent::SessionCreated => handler.session_created(session),
        InboundEvent::SessionOpened => handler.session_opened(session),
        InboundEvent::SessionClosed => handler.session_closed(session),
        InboundEvent::SessionIdle(status) => handler.session_idle(session, status),
        InboundEvent::MessageReceived(message) => handler.message_received(session, message),
        InboundEvent::MessageSent(request) => handler.message_sent(session, &request),
        InboundEvent::ExceptionCaught(error) => handler.exception_caught(session, error),
    }
}

/// Terminal outbound stage: the session's write queue and transport
fn head(session: &Arc<Session>, event: OutboundEvent) {
    match event {
        OutboundEvent::FilterWrite(request) => session.enqueue_write(request),
        OutboundEvent::FilterClose => session.processor().close(session),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
