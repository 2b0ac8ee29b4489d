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

//! Terminal handler trait and a closure-based implementation

use crate::{IdleStatus, Message, Session, SessionError, WriteRequest};
use std::sync::Arc;

/// Session event handler
///
/// The handler sits behind the last filter of every chain and receives
/// fully decoded events. Callbacks run on the session's worker thread and
/// must not block it.
///
/// # Example
///
/// ```
/// use relaygate_service::{IoHandler, Message, Session};
/// use std::sync::Arc;
///
/// struct EchoHandler;
///
/// impl IoHandler for EchoHandler {
///     fn message_received(&self, session: &Arc<Session>, message: Message) {
///         session.write(message);
///     }
/// }
/// ```
#[allow(unused_variables)]
pub trait IoHandler: Send + Sync + 'static {
    /// Called when the transport has created the session
    ///
    /// Filters and attributes installed by an initializer are already present.
    fn session_created(&self, session: &Arc<Session>) {}

    /// Called when the session is open and ready for traffic
    fn session_opened(&self, session: &Arc<Session>) {}

    /// Called once when the session has closed
    fn session_closed(&self, session: &Arc<Session>) {}

    /// Called when the session has been idle for a configured interval
    fn session_idle(&self, session: &Arc<Session>, status: IdleStatus) {}

    /// Called for every message that reached the end of the chain
    fn message_received(&self, session: &Arc<Session>, message: Message) {}

    /// Called when a write request has been flushed
    fn message_sent(&self, session: &Arc<Session>, request: &WriteRequest) {}

    /// Called when an error reached the end of the chain
    ///
    /// The default closes the session unless the error is recoverable.
    fn exception_caught(&self, session: &Arc<Session>, error: SessionError) {
        if error.is_recoverable() {
            tracing::warn!(session_id = %session.id(), error = %error, "Recoverable session error");
        } else {
            tracing::debug!(session_id = %session.id(), error = %error, "Closing session after error");
            session.close_now();
        }
    }
}

type SessionCallback = Box<dyn Fn(&Arc<Session>) + Send + Sync + 'static>;

/// Callback-based handler implementation
///
/// This provides a way to implement handlers using closures instead of
/// implementing the [`IoHandler`] trait. Unset callbacks fall back to the
/// trait defaults.
///
/// # Example
///
/// ```
/// use relaygate_service::CallbackHandler;
///
/// let handler = CallbackHandler {
///     on_opened: Some(Box::new(|session| {
///         println!("{} opened", session.id());
///     })),
///     on_message: Some(Box::new(|session, message| {
///         session.write(message);
///     })),
///     ..Default::default()
/// };
/// ```
#[derive(Default)]
pub struct CallbackHandler {
    /// Called on session creation
    pub on_created: Option<SessionCallback>,
    /// Called when the session opens
    pub on_opened: Option<SessionCallback>,
    /// Called for each received message
    pub on_message: Option<Box<dyn Fn(&Arc<Session>, Message) + Send + Sync + 'static>>,
    /// Called for each flushed write
    pub on_sent: Option<Box<dyn Fn(&Arc<Session>, &WriteRequest) + Send + Sync + 'static>>,
    /// Called on idle
    pub on_idle: Option<Box<dyn Fn(&Arc<Session>, IdleStatus) + Send + Sync + 'static>>,
    /// Called on error; replaces the default close-on-error behaviour
    pub on_error: Option<Box<dyn Fn(&Arc<Session>, SessionError) + Send + Sync + 'static>>,
    /// Called when the session closes
    pub on_closed: Option<SessionCallback>,
}

impl IoHandler for CallbackHandler {
    fn session_created(&self, session: &Arc<Session>) {
        if let Some(ref f) = self.on_created {
            f(session);
        }
    }

    fn session_opened(&self, session: &Arc<Session>) {
        if let Some(ref f) = self.on_opened {
            f(session);
        }
    }

    fn session_closed(&self, session: &Arc<Session>) {
        if let Some(ref f) = self.on_closed {
            f(session);
        }
    }

    fn session_idle(&self, session: &Arc<Session>, status: IdleStatus) {
        if let Some(ref f) = self.on_idle {
            f(session, status);
        }
    }

    fn message_received(&self, session: &Arc<Session>, message: Message) {
        if let Some(ref f) = self.on_message {
            f(session, message);
        }
    }

    fn message_sent(&self, session: &Arc<Session>, request: &WriteRequest) {
        if let Some(ref f) = self.on_sent {
            f(session, request);
        }
    }

    fn exception_caught(&self, session: &Arc<Session>, error: SessionError) {
        match self.on_error {
            Some(ref f) => f(session, error),
            None => {
                if !error.is_recoverable() {
                    session.close_now();
                }
            }
        }
    }
}

impl std::fmt::Debug for CallbackHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandler")
            .field("on_created", &self.on_created.is_some())
            .field("on_opened", &self.on_opened.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_closed", &self.on_closed.is_some())
            .finish()
    }
}
