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

//! UDP transport
//!
//! UDP has no connections, so [`UdpAcceptor`] keys sessions by remote
//! address: the first datagram from a peer creates a session and later
//! datagrams from the same peer reuse it while it stays open. Writes go to
//! the request's destination when it has one and to the session's peer
//! otherwise.

use crate::acceptor::{Binding, SessionFactory};
use crate::{Acceptor, Result, ServerError, SessionManager};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use relaygate_service::{
    IoHandler, IoProcessor, IoWorkerPool, Message, ReadQueue, Session, SessionConfig,
    SessionError, SessionInitializer, WriteError,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Scheme name of the UDP transport
pub const UDP_SCHEME: &str = "udp";

/// Largest datagram the acceptor reads
const MAX_DATAGRAM: usize = 65_535;

type Peers = Arc<DashMap<SocketAddr, (Arc<Session>, Arc<UdpProcessor>)>>;

/// Drives one peer's session over the shared socket
struct UdpProcessor {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    peers: Peers,
    inbox: ReadQueue,
    write_ready: Notify,
    shutdown: CancellationToken,
}

impl UdpProcessor {
    fn start(self: &Arc<Self>, session: &Arc<Session>) {
        tokio::spawn(self.clone().write_loop(session.clone()));
    }

    async fn write_loop(self: Arc<Self>, session: Arc<Session>) {
        let write_timeout = session.config().write_timeout;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.write_ready.notified() => {}
            }

            while let Some(request) = session.write_queue().poll() {
                let destination = request.destination().unwrap_or(self.remote);
                let Some(buffer) = request.message().as_buffer() else {
                    session.fail_write(request, WriteError::Rejected("UDP writes need a buffer".into()));
                    continue;
                };
                let datagram = buffer.to_bytes();
                match tokio::time::timeout(write_timeout, self.socket.send_to(&datagram, destination)).await {
                    Ok(Ok(sent)) => session.complete_write(request, sent),
                    Ok(Err(error)) => {
                        tracing::debug!(session_id = %session.id(), destination = %destination, error = %error, "Send failed");
                        session.fail_write(request, WriteError::Io(error.to_string()));
                        session.fire_exception_caught(SessionError::from(error));
                    }
                    Err(_) => {
                        session.fail_write(request, WriteError::Timeout(write_timeout));
                        session.fire_exception_caught(SessionError::Write(WriteError::Timeout(
                            write_timeout,
                        )));
                    }
                }
            }
        }
    }
}

impl IoProcessor for UdpProcessor {
    fn name(&self) -> &'static str {
        UDP_SCHEME
    }

    fn flush(&self, _session: &Arc<Session>) {
        self.write_ready.notify_one();
    }

    fn close(&self, session: &Arc<Session>) {
        self.shutdown.cancel();
        self.inbox.clear();
        self.peers
            .remove_if(&self.remote, |_, (peer, _)| peer.id() == session.id());
        session.transport_closed();
    }

    fn resume_read(&self, session: &Arc<Session>) {
        self.inbox.drain(session);
    }
}

/// Accepts UDP peers, one session per remote address
pub struct UdpAcceptor {
    factory: SessionFactory,
    peers: Peers,
    binding: tokio::sync::Mutex<Option<Binding>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl UdpAcceptor {
    /// Create an acceptor serving every peer with `handler`
    pub fn new(handler: Arc<dyn IoHandler>, workers: Arc<IoWorkerPool>) -> Self {
        Self {
            factory: SessionFactory::new(handler, workers),
            peers: Arc::new(DashMap::new()),
            binding: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Configuration for peer sessions
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.factory.config = config;
        self
    }

    /// Run `initializer` on each peer session before it opens
    pub fn with_initializer(mut self, initializer: SessionInitializer) -> Self {
        self.factory.initializer = Some(initializer);
        self
    }

    /// Ignore new peers while this many sessions are live
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.factory.max_sessions = max;
        self
    }

    /// Register peer sessions with `manager`
    pub fn with_manager(mut self, manager: Arc<SessionManager>) -> Self {
        self.factory.manager = manager;
        self
    }

    /// The manager peer sessions are registered with
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.factory.manager
    }

    /// The open session for `remote`, if any
    pub fn session(&self, remote: SocketAddr) -> Option<Arc<Session>> {
        self.peers.get(&remote).map(|entry| entry.value().0.clone())
    }

    /// Number of peers with an open session
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[async_trait]
impl Acceptor for UdpAcceptor {
    fn scheme(&self) -> &'static str {
        UDP_SCHEME
    }

    #[tracing::instrument(skip(self))]
    async fn bind(&self, address: SocketAddr) -> Result<SocketAddr> {
        let mut binding = self.binding.lock().await;
        if binding.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let socket = Arc::new(UdpSocket::bind(address).await?);
        let local_addr = socket.local_addr()?;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(receive_loop(
            socket,
            Arc::new(self.factory.clone()),
            self.peers.clone(),
            shutdown.clone(),
        ));
        *binding = Some(Binding {
            local_addr,
            shutdown,
            task,
        });
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);

        tracing::info!(local = %local_addr, "UDP acceptor bound");
        Ok(local_addr)
    }

    async fn unbind(&self) -> Result<()> {
        let binding = self.binding.lock().await.take().ok_or(ServerError::NotRunning)?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;
        let local_addr = binding.local_addr;
        binding.stop().await;
        tracing::info!(local = %local_addr, "UDP acceptor unbound");
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for UdpAcceptor {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.get_mut().take() {
            binding.shutdown.cancel();
        }
    }
}

impl fmt::Debug for UdpAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpAcceptor")
            .field("local_addr", &self.local_addr())
            .field("peers", &self.peers.len())
            .finish()
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    factory: Arc<SessionFactory>,
    peers: Peers,
    shutdown: CancellationToken,
) {
    let mut datagram = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut datagram) => received,
        };

        match received {
            Ok((len, remote)) => {
                let payload = Bytes::copy_from_slice(&datagram[..len]);
                tracing::trace!(remote = %remote, bytes = len, "Datagram received");
                if let Some((session, processor)) = peer_session(&socket, &factory, &peers, remote) {
                    processor.inbox.push(&session, Message::from(payload));
                }
            }
            Err(error) => {
                // ICMP errors for earlier sends surface here; the socket stays usable
                tracing::debug!(error = %error, "Receive failed");
                factory.metrics().accept_error();
            }
        }
    }
    tracing::debug!("Receive loop terminated");
}

/// The open session for `remote`, creating one if needed
fn peer_session(
    socket: &Arc<UdpSocket>,
    factory: &SessionFactory,
    peers: &Peers,
    remote: SocketAddr,
) -> Option<(Arc<Session>, Arc<UdpProcessor>)> {
    if let Some(entry) = peers.get(&remote)
        && !entry.value().0.is_closing()
    {
        return Some(entry.value().clone());
    }
    if !factory.admit(remote) {
        return None;
    }

    let local = match socket.local_addr() {
        Ok(local) => local,
        Err(error) => {
            tracing::warn!(error = %error, "UDP socket has no local address");
            return None;
        }
    };
    let processor = Arc::new(UdpProcessor {
        socket: socket.clone(),
        remote,
        peers: peers.clone(),
        inbox: ReadQueue::new(),
        write_ready: Notify::new(),
        shutdown: CancellationToken::new(),
    });
    let session = match factory.create(processor.clone(), local, remote) {
        Ok(session) => session,
        Err(error) => {
            tracing::warn!(remote = %remote, error = %error, "Failed to open UDP session");
            factory.metrics().accept_error();
            return None;
        }
    };

    // Replaces a session that is closing but not yet removed
    peers.insert(remote, (session.clone(), processor.clone()));
    session.fire_session_created();
    session.fire_session_opened();
    processor.start(&session);
    tracing::debug!(session_id = %session.id(), remote = %remote, "UDP peer session opened");
    Some((session, processor))
}
