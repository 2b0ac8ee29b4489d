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

//! TCP transport
//!
//! [`TcpAcceptor`] serves inbound TCP connections and [`TcpConnector`]
//! opens outbound ones for `tcp://host:port` addresses. Each session is
//! driven by two tokio tasks: a reader that honors read suspension and a
//! writer that drains the session's write queue with a per-request
//! timeout.

use crate::acceptor::{Binding, SessionFactory};
use crate::{Acceptor, Result, ServerError, ServerMetrics, SessionManager};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use relaygate_service::{
    ConnectFuture, Connector, Endpoint, IoHandler, IoProcessor, IoWorkerPool, Message,
    ResourceAddress, Session, SessionBuilder, SessionConfig, SessionError, SessionInitializer,
    WriteError, run_initializer,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

/// Scheme served by [`TcpConnector`]
pub const TCP_SCHEME: &str = "tcp";

/// Drives one TCP session's socket
pub(crate) struct TcpProcessor {
    write_ready: Notify,
    read_gate: watch::Sender<()>,
    shutdown: CancellationToken,
    metrics: Option<Arc<ServerMetrics>>,
}

impl TcpProcessor {
    pub(crate) fn new(metrics: Option<Arc<ServerMetrics>>) -> Self {
        Self {
            write_ready: Notify::new(),
            read_gate: watch::Sender::new(()),
            shutdown: CancellationToken::new(),
            metrics,
        }
    }

    /// Spawn the reader and writer tasks on the current runtime
    pub(crate) fn start(self: &Arc<Self>, stream: TcpStream, session: &Arc<Session>) {
        let (reader, writer) = stream.into_split();
        tokio::spawn(self.clone().read_loop(reader, session.clone()));
        tokio::spawn(self.clone().write_loop(writer, session.clone()));
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf, session: Arc<Session>) {
        let mut gate = self.read_gate.subscribe();
        let capacity = session.config().read_buffer_size;
        let mut buffer = BytesMut::with_capacity(capacity);
        loop {
            gate.borrow_and_update();
            if session.is_read_suspended() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = gate.changed() => continue,
                }
            }

            // Data read while suspended is delivered first
            if !buffer.is_empty() {
                session.fire_message_received(Message::from(buffer.split().freeze()));
                continue;
            }

            buffer.reserve(capacity);
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                read = reader.read_buf(&mut buffer) => read,
            };
            match read {
                Ok(0) => {
                    tracing::debug!(session_id = %session.id(), "Peer closed the connection");
                    break;
                }
                Ok(count) => {
                    tracing::trace!(session_id = %session.id(), bytes = count, "Read");
                }
                Err(error) => {
                    tracing::debug!(session_id = %session.id(), error = %error, "Read failed");
                    session.fire_exception_caught(SessionError::from(error));
                    break;
                }
            }
        }
        self.shutdown.cancel();
        session.transport_closed();
    }

    async fn write_loop(self: Arc<Self>, mut writer: OwnedWriteHalf, session: Arc<Session>) {
        let write_timeout = session.config().write_timeout;
        'outer: loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.write_ready.notified() => {}
            }

            while let Some(mut request) = session.write_queue().poll() {
                let Some(buffer) = request.message_mut().as_buffer_mut() else {
                    tracing::warn!(session_id = %session.id(), "Unencoded message reached the TCP transport");
                    session.fail_write(request, WriteError::Rejected("TCP writes need a buffer".into()));
                    continue;
                };
                let written = buffer.remaining();
                let outcome = tokio::select! {
                    _ = self.shutdown.cancelled() => None,
                    outcome = tokio::time::timeout(write_timeout, writer.write_all_buf(buffer)) => Some(outcome),
                };

                match outcome {
                    Some(Ok(Ok(()))) => session.complete_write(request, written),
                    Some(Ok(Err(error))) => {
                        tracing::debug!(session_id = %session.id(), error = %error, "Write failed");
                        session.fail_write(request, WriteError::Io(error.to_string()));
                        session.fire_exception_caught(SessionError::from(error));
                        session.close_now();
                        break 'outer;
                    }
                    Some(Err(_)) => {
                        tracing::warn!(session_id = %session.id(), timeout = ?write_timeout, "Write timed out");
                        if let Some(metrics) = &self.metrics {
                            metrics.timeout_error();
                        }
                        session.fail_write(request, WriteError::Timeout(write_timeout));
                        session.fire_exception_caught(SessionError::Write(WriteError::Timeout(
                            write_timeout,
                        )));
                        session.close_now();
                        break 'outer;
                    }
                    None => {
                        session.fail_write(request, WriteError::SessionClosed);
                        break 'outer;
                    }
                }
            }
        }
        let _ = writer.shutdown().await;
    }
}

impl IoProcessor for TcpProcessor {
    fn name(&self) -> &'static str {
        TCP_SCHEME
    }

    fn flush(&self, _session: &Arc<Session>) {
        self.write_ready.notify_one();
    }

    fn close(&self, session: &Arc<Session>) {
        self.shutdown.cancel();
        session.transport_closed();
    }

    fn suspend_read(&self, _session: &Arc<Session>) {
        self.read_gate.send_replace(());
    }

    fn resume_read(&self, _session: &Arc<Session>) {
        self.read_gate.send_replace(());
    }
}

/// Open a created session and start its I/O
fn open_stream(stream: TcpStream, processor: &Arc<TcpProcessor>, session: &Arc<Session>) {
    session.fire_session_created();
    session.fire_session_opened();
    processor.start(stream, session);
}

/// Accepts inbound TCP connections
pub struct TcpAcceptor {
    factory: SessionFactory,
    binding: tokio::sync::Mutex<Option<Binding>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl TcpAcceptor {
    /// Create an acceptor serving every connection with `handler`
    pub fn new(handler: Arc<dyn IoHandler>, workers: Arc<IoWorkerPool>) -> Self {
        Self {
            factory: SessionFactory::new(handler, workers),
            binding: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Configuration for accepted sessions
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.factory.config = config;
        self
    }

    /// Run `initializer` on each accepted session before it opens
    pub fn with_initializer(mut self, initializer: SessionInitializer) -> Self {
        self.factory.initializer = Some(initializer);
        self
    }

    /// Refuse connections while this many sessions are live
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.factory.max_sessions = max;
        self
    }

    /// Register accepted sessions with `manager`
    pub fn with_manager(mut self, manager: Arc<SessionManager>) -> Self {
        self.factory.manager = manager;
        self
    }

    /// The manager accepted sessions are registered with
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.factory.manager
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    fn scheme(&self) -> &'static str {
        TCP_SCHEME
    }

    #[tracing::instrument(skip(self))]
    async fn bind(&self, address: SocketAddr) -> Result<SocketAddr> {
        let mut binding = self.binding.lock().await;
        if binding.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::new(self.factory.clone()),
            shutdown.clone(),
        ));
        *binding = Some(Binding {
            local_addr,
            shutdown,
            task,
        });
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);

        tracing::info!(local = %local_addr, "TCP acceptor bound");
        Ok(local_addr)
    }

    async fn unbind(&self) -> Result<()> {
        let binding = self.binding.lock().await.take().ok_or(ServerError::NotRunning)?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;
        let local_addr = binding.local_addr;
        binding.stop().await;
        tracing::info!(local = %local_addr, "TCP acceptor unbound");
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.get_mut().take() {
            binding.shutdown.cancel();
        }
    }
}

impl fmt::Debug for TcpAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpAcceptor")
            .field("local_addr", &self.local_addr())
            .field("sessions", &self.factory.manager.count())
            .finish()
    }
}

async fn accept_loop(listener: TcpListener, factory: Arc<SessionFactory>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                tracing::debug!(remote = %remote, "Accepted connection");
                if !factory.admit(remote) {
                    drop(stream);
                    continue;
                }
                if let Err(error) = accept_stream(&factory, stream, remote) {
                    tracing::warn!(remote = %remote, error = %error, "Failed to open session");
                    factory.metrics().accept_error();
                }
            }
            Err(error) => {
                tracing::error!(error = %error, "Failed to accept connection");
                factory.metrics().accept_error();

                // Back off on errors to avoid a tight loop
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    tracing::debug!("Accept loop terminated");
}

fn accept_stream(
    factory: &SessionFactory,
    stream: TcpStream,
    remote: SocketAddr,
) -> relaygate_service::Result<Arc<Session>> {
    stream.set_nodelay(true)?;
    let local = stream.local_addr()?;
    let processor = Arc::new(TcpProcessor::new(Some(factory.metrics().clone())));
    let session = factory.create(processor.clone(), local, remote)?;
    open_stream(stream, &processor, &session);
    Ok(session)
}

/// Opens outbound TCP sessions for `tcp://host:port`
#[derive(Clone)]
pub struct TcpConnector {
    runtime: Handle,
    workers: Arc<IoWorkerPool>,
    config: SessionConfig,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Create a connector spawning its I/O on `runtime`
    ///
    /// Connects may be requested from worker threads, which are not part
    /// of any runtime, so the handle is captured up front.
    pub fn new(runtime: Handle, workers: Arc<IoWorkerPool>) -> Self {
        Self {
            runtime,
            workers,
            config: SessionConfig::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Configuration for connected sessions
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Give up on a connect after `timeout`
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[tracing::instrument(skip(self, handler, initializer), fields(address = %address))]
    async fn open(
        &self,
        address: &ResourceAddress,
        handler: Arc<dyn IoHandler>,
        initializer: Option<SessionInitializer>,
    ) -> relaygate_service::Result<Arc<Session>> {
        let connect_error = |reason: String| SessionError::Connect {
            address: address.to_string(),
            reason,
        };
        let stream = match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(address.authority()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => return Err(connect_error(error.to_string())),
            Err(_) => {
                return Err(connect_error(format!(
                    "timed out after {:?}",
                    self.connect_timeout
                )));
            }
        };
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;

        let processor = Arc::new(TcpProcessor::new(None));
        let session = SessionBuilder::new(self.workers.next_worker(), handler, processor.clone())
            .with_local(Endpoint::Socket(local))
            .with_remote(Endpoint::Socket(remote))
            .with_config(self.config.clone())
            .build();
        run_initializer(&session, initializer.as_ref())?;
        open_stream(stream, &processor, &session);
        tracing::debug!(session_id = %session.id(), remote = %remote, "TCP connected");
        Ok(session)
    }
}

impl Connector for TcpConnector {
    fn scheme(&self) -> &str {
        TCP_SCHEME
    }

    fn connect(
        &self,
        address: &ResourceAddress,
        handler: Arc<dyn IoHandler>,
        initializer: Option<SessionInitializer>,
    ) -> ConnectFuture {
        let future = ConnectFuture::new();
        let outcome = future.clone();
        let connector = self.clone();
        let address = address.clone();
        self.runtime.spawn(async move {
            outcome.complete(connector.open(&address, handler, initializer).await);
        });
        future
    }
}

impl fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnector")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}
