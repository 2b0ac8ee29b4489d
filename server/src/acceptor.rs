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

//! Listening transports
//!
//! An [`Acceptor`] binds a local address and turns every inbound peer into
//! a session served by one handler. Acceptors register their sessions with
//! a [`SessionManager`](crate::SessionManager) so the server can count,
//! sweep and close them.

use crate::{Result, ServerMetrics, SessionManager};
use async_trait::async_trait;
use relaygate_service::{
    Endpoint, IoHandler, IoProcessor, IoWorkerPool, Session, SessionBuilder, SessionConfig,
    SessionInitializer, run_initializer,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A transport accepting inbound sessions on a local address
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Transport scheme name
    fn scheme(&self) -> &'static str;

    /// Start accepting on `address`, returning the bound address
    ///
    /// Fails with [`ServerError::AlreadyRunning`](crate::ServerError) if
    /// the acceptor is already bound.
    async fn bind(&self, address: SocketAddr) -> Result<SocketAddr>;

    /// Stop accepting; sessions already accepted stay open
    async fn unbind(&self) -> Result<()>;

    /// The bound address, if bound
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Check if the acceptor is bound
    fn is_bound(&self) -> bool {
        self.local_addr().is_some()
    }
}

/// Everything an acceptor needs to turn a peer into a session
#[derive(Clone)]
pub(crate) struct SessionFactory {
    pub(crate) handler: Arc<dyn IoHandler>,
    pub(crate) initializer: Option<SessionInitializer>,
    pub(crate) workers: Arc<IoWorkerPool>,
    pub(crate) config: SessionConfig,
    pub(crate) manager: Arc<SessionManager>,
    pub(crate) max_sessions: usize,
}

impl SessionFactory {
    pub(crate) fn new(handler: Arc<dyn IoHandler>, workers: Arc<IoWorkerPool>) -> Self {
        Self {
            handler,
            initializer: None,
            workers,
            config: SessionConfig::default(),
            manager: Arc::new(SessionManager::new(Arc::new(ServerMetrics::new()))),
            max_sessions: usize::MAX,
        }
    }

    pub(crate) fn metrics(&self) -> &Arc<ServerMetrics> {
        self.manager.metrics()
    }

    /// Check the session limit, recording a rejection when it is reached
    pub(crate) fn admit(&self, remote: SocketAddr) -> bool {
        let live = self.manager.count();
        if live < self.max_sessions {
            return true;
        }
        tracing::warn!(
            max_sessions = self.max_sessions,
            remote = %remote,
            "Session limit reached, rejecting peer"
        );
        self.metrics().session_rejected();
        false
    }

    /// Build, initialize and register a session
    ///
    /// The caller fires `session_created`/`session_opened` and then starts
    /// the transport's I/O.
    pub(crate) fn create(
        &self,
        processor: Arc<dyn IoProcessor>,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> relaygate_service::Result<Arc<Session>> {
        let session = SessionBuilder::new(self.workers.next_worker(), self.handler.clone(), processor)
            .with_local(Endpoint::Socket(local))
            .with_remote(Endpoint::Socket(remote))
            .with_config(self.config.clone())
            .build();
        run_initializer(&session, self.initializer.as_ref())?;
        self.manager.register(&session);
        Ok(session)
    }
}

/// A running accept loop
pub(crate) struct Binding {
    pub(crate) local_addr: SocketAddr,
    pub(crate) shutdown: CancellationToken,
    pub(crate) task: JoinHandle<()>,
}

impl Binding {
    /// Stop the loop and wait briefly for it to exit
    pub(crate) async fn stop(self) {
        self.shutdown.cancel();
        if tokio::time::timeout(std::time::Duration::from_secs(5), self.task)
            .await
            .is_err()
        {
            tracing::warn!(local = %self.local_addr, "Accept loop did not stop in time");
        }
    }
}
