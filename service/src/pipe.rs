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

//! In-process pipe transport
//!
//! A pipe connects two sessions inside the process. Each connect to
//! `pipe://<name>` creates a server session for the handler bound under
//! `<name>` and a client session for the caller. A message written on one
//! side is delivered as `message_received` on the other; closing one side
//! closes the other.
//!
//! ```
//! use relaygate_service::{
//!     CallbackHandler, IoWorkerPool, PipeAcceptor, ResourceAddress, WorkerPoolConfig,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let workers = Arc::new(IoWorkerPool::new(&WorkerPoolConfig::new(2)).unwrap());
//! let acceptor = PipeAcceptor::new(workers);
//! let echo = CallbackHandler {
//!     on_message: Some(Box::new(|session, message| {
//!         session.write(message);
//!     })),
//!     ..Default::default()
//! };
//! acceptor.bind("echo", Arc::new(echo)).unwrap();
//!
//! let address: ResourceAddress = "pipe://echo".parse().unwrap();
//! let client = acceptor
//!     .connector()
//!     .connect_blocking(&address, Arc::new(CallbackHandler::default()), Duration::from_secs(5))
//!     .unwrap();
//! assert!(client.is_open());
//! ```

use crate::connector::run_initializer;
use crate::{
    ConnectFuture, Connector, Endpoint, IoHandler, IoProcessor, IoWorkerPool, Message, ReadQueue,
    ResourceAddress, Result, Session, SessionBuilder, SessionConfig, SessionError,
    SessionInitializer, WriteError,
};
use bytes::Buf;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// Scheme served by [`PipeConnector`]
pub const PIPE_SCHEME: &str = "pipe";

#[derive(Clone)]
struct PipeEndpoint {
    handler: Arc<dyn IoHandler>,
    initializer: Option<SessionInitializer>,
}

type Endpoints = Arc<DashMap<String, PipeEndpoint>>;

/// Named in-process endpoints that pipe connects are routed to
#[derive(Clone)]
pub struct PipeAcceptor {
    endpoints: Endpoints,
    workers: Arc<IoWorkerPool>,
    config: SessionConfig,
}

impl PipeAcceptor {
    /// Create an acceptor whose sessions run on `workers`
    pub fn new(workers: Arc<IoWorkerPool>) -> Self {
        Self {
            endpoints: Arc::new(DashMap::new()),
            workers,
            config: SessionConfig::default(),
        }
    }

    /// Configuration for sessions created on both ends of a pipe
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve `name` with `handler`
    pub fn bind(&self, name: impl Into<String>, handler: Arc<dyn IoHandler>) -> Result<()> {
        self.bind_endpoint(name.into(), PipeEndpoint { handler, initializer: None })
    }

    /// Serve `name` with `handler`, running `initializer` on each server session
    pub fn bind_with_initializer(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn IoHandler>,
        initializer: SessionInitializer,
    ) -> Result<()> {
        self.bind_endpoint(
            name.into(),
            PipeEndpoint {
                handler,
                initializer: Some(initializer),
            },
        )
    }

    fn bind_endpoint(&self, name: String, endpoint: PipeEndpoint) -> Result<()> {
        match self.endpoints.entry(name) {
            Entry::Occupied(occupied) => Err(SessionError::Other(format!(
                "pipe '{}' is already bound",
                occupied.key()
            ))),
            Entry::Vacant(vacant) => {
                tracing::debug!(name = %vacant.key(), "Pipe bound");
                vacant.insert(endpoint);
                Ok(())
            }
        }
    }

    /// Stop serving `name`; existing pipes stay open
    pub fn unbind(&self, name: &str) -> bool {
        self.endpoints.remove(name).is_some()
    }

    /// Check if `name` is served
    pub fn is_bound(&self, name: &str) -> bool {
        self.endpoints.contains_key(name)
    }

    /// Connector for `pipe://` addresses served by this acceptor
    pub fn connector(&self) -> PipeConnector {
        PipeConnector {
            endpoints: self.endpoints.clone(),
            workers: self.workers.clone(),
            config: self.config.clone(),
        }
    }
}

impl fmt::Debug for PipeAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeAcceptor")
            .field("bound", &self.endpoints.len())
            .field("workers", &self.workers.len())
            .finish()
    }
}

/// Connector for `pipe://<name>` addresses
#[derive(Clone)]
pub struct PipeConnector {
    endpoints: Endpoints,
    workers: Arc<IoWorkerPool>,
    config: SessionConfig,
}

impl PipeConnector {
    /// Connect and wait for the outcome
    ///
    /// Pipe connects complete synchronously, so the timeout only matters
    /// for a connect that is torn down by a concurrent close.
    pub fn connect_blocking(
        &self,
        address: &ResourceAddress,
        handler: Arc<dyn IoHandler>,
        timeout: Duration,
    ) -> Result<Arc<Session>> {
        self.connect(address, handler, None)
            .wait_timeout(timeout)
            .unwrap_or_else(|| {
                Err(SessionError::Connect {
                    address: address.to_string(),
                    reason: "timed out".into(),
                })
            })
    }

    fn open(
        &self,
        address: &ResourceAddress,
        handler: Arc<dyn IoHandler>,
        initializer: Option<SessionInitializer>,
    ) -> Result<Arc<Session>> {
        let name = address.authority();
        let endpoint = self
            .endpoints
            .get(name)
            .map(|endpoint| endpoint.value().clone())
            .ok_or_else(|| SessionError::Connect {
                address: address.to_string(),
                reason: "no pipe bound under that name".into(),
            })?;

        let server_processor = Arc::new(PipeProcessor::new());
        let client_processor = Arc::new(PipeProcessor::new());
        let server_name: Arc<str> = Arc::from(name);
        let client_name: Arc<str> = Arc::from(format!("{}#client", name));

        let server = SessionBuilder::new(
            self.workers.next_worker(),
            endpoint.handler.clone(),
            server_processor.clone(),
        )
        .with_local(Endpoint::Named(server_name.clone()))
        .with_remote(Endpoint::Named(client_name.clone()))
        .with_config(self.config.clone())
        .build();
        let client = SessionBuilder::new(self.workers.next_worker(), handler, client_processor.clone())
            .with_local(Endpoint::Named(client_name))
            .with_remote(Endpoint::Named(server_name))
            .with_config(self.config.clone())
            .build();
        server_processor.link(&client, &client_processor);
        client_processor.link(&server, &server_processor);

        // Hold deliveries until both sides have been opened
        server.suspend_read();
        client.suspend_read();

        let initialized = run_initializer(&server, endpoint.initializer.as_ref())
            .and_then(|()| run_initializer(&client, initializer.as_ref()));
        if let Err(error) = initialized {
            server.close_now();
            client.close_now();
            return Err(error);
        }

        server.fire_session_created();
        server.fire_session_opened();
        client.fire_session_created();
        client.fire_session_opened();
        server.resume_read();
        client.resume_read();

        tracing::debug!(
            server_id = %server.id(),
            client_id = %client.id(),
            name = %name,
            "Pipe connected"
        );
        Ok(client)
    }
}

impl Connector for PipeConnector {
    fn scheme(&self) -> &str {
        PIPE_SCHEME
    }

    fn connect(
        &self,
        address: &ResourceAddress,
        handler: Arc<dyn IoHandler>,
        initializer: Option<SessionInitializer>,
    ) -> ConnectFuture {
        ConnectFuture::completed(self.open(address, handler, initializer))
    }
}

impl fmt::Debug for PipeConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeConnector")
            .field("bound", &self.endpoints.len())
            .finish()
    }
}

/// One end of a pipe
struct PipeProcessor {
    peer: OnceLock<(Weak<Session>, Weak<PipeProcessor>)>,
    inbox: ReadQueue,
    closed: AtomicBool,
}

impl PipeProcessor {
    fn new() -> Self {
        Self {
            peer: OnceLock::new(),
            inbox: ReadQueue::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn link(&self, session: &Arc<Session>, processor: &Arc<PipeProcessor>) {
        let _ = self
            .peer
            .set((Arc::downgrade(session), Arc::downgrade(processor)));
    }

    fn peer(&self) -> Option<(Arc<Session>, Arc<PipeProcessor>)> {
        let (session, processor) = self.peer.get()?;
        Some((session.upgrade()?, processor.upgrade()?))
    }
}

impl IoProcessor for PipeProcessor {
    fn name(&self) -> &'static str {
        PIPE_SCHEME
    }

    fn flush(&self, session: &Arc<Session>) {
        while let Some(mut request) = session.write_queue().poll() {
            match self.peer() {
                Some((peer, processor)) if !peer.is_closing() => {
                    // Buffers are shared so message_sent still sees the payload
                    let message = match request.message().as_buffer() {
                        Some(buffer) => Message::Buffer(buffer.clone()),
                        None => request.take_message(),
                    };
                    let written = message.as_buffer().map_or(0, Buf::remaining);
                    processor.inbox.push(&peer, message);
                    session.complete_write(request, written);
                }
                _ => session.fail_write(request, WriteError::SessionClosed),
            }
        }
    }

    fn close(&self, session: &Arc<Session>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inbox.clear();
        session.transport_closed();
        if let Some((peer, _)) = self.peer() {
            peer.close_now();
        }
    }

    fn resume_read(&self, session: &Arc<Session>) {
        self.inbox.drain(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CallbackHandler, WorkerPoolConfig};
    use std::sync::Mutex;
    use std::sync::mpsc;

    fn acceptor() -> PipeAcceptor {
        let workers = Arc::new(IoWorkerPool::new(&WorkerPoolConfig::new(2)).unwrap());
        PipeAcceptor::new(workers)
    }

    #[test]
    fn test_unbound_pipe_fails() {
        let acceptor = acceptor();
        let result = acceptor.connector().connect_blocking(
            &"pipe://nowhere".parse().unwrap(),
            Arc::new(CallbackHandler::default()),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(SessionError::Connect { .. })));
    }

    #[test]
    fn test_double_bind_fails() {
        let acceptor = acceptor();
        acceptor.bind("a", Arc::new(CallbackHandler::default())).unwrap();
        assert!(acceptor.bind("a", Arc::new(CallbackHandler::default())).is_err());
        assert!(acceptor.unbind("a"));
        assert!(!acceptor.is_bound("a"));
    }

    #[test]
    fn test_echo_round_trip() {
        let acceptor = acceptor();
        let echo = CallbackHandler {
            on_message: Some(Box::new(|session, message| {
                session.write(message);
            })),
            ..Default::default()
        };
        acceptor.bind("echo", Arc::new(echo)).unwrap();

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let client_handler = CallbackHandler {
            on_message: Some(Box::new(move |_session, message| {
                let bytes = message.as_buffer().map(|b| b.to_bytes()).unwrap_or_default();
                tx.lock().unwrap().send(bytes).unwrap();
            })),
            ..Default::default()
        };
        let client = acceptor
            .connector()
            .connect_blocking(
                &"pipe://echo".parse().unwrap(),
                Arc::new(client_handler),
                Duration::from_secs(5),
            )
            .unwrap();

        for chunk in [&b"one"[..], b"two", b"three"] {
            client.write(chunk);
        }
        let received: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(received, vec![&b"one"[..], b"two", b"three"]);
    }

    #[test]
    fn test_close_propagates_to_peer() {
        let acceptor = acceptor();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let server_handler = CallbackHandler {
            on_opened: Some(Box::new(move |session| {
                tx.lock().unwrap().send(session.clone()).unwrap();
            })),
            ..Default::default()
        };
        acceptor.bind("svc", Arc::new(server_handler)).unwrap();

        let client = acceptor
            .connector()
            .connect_blocking(
                &"pipe://svc".parse().unwrap(),
                Arc::new(CallbackHandler::default()),
                Duration::from_secs(5),
            )
            .unwrap();
        let server = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        client.close_now().wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(server.close_future().wait_timeout(Duration::from_secs(5)), Some(()));
        assert!(server.is_closed());
    }
}
