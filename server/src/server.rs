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

//! Proxy server
//!
//! The ProxyServer is the main entry point of the crate. It accepts TCP
//! sessions, bridges each one to the configured upstream resource and
//! coordinates idle sweeping and graceful shutdown through the
//! [`SessionManager`].

use crate::{
    Acceptor, Result, ServerConfig, ServerError, ServerMetrics, SessionManager, TcpAcceptor,
    TcpConnector,
};
use relaygate_service::{
    BridgeCoupler, BridgeHandler, Connector, IdleStatus, IoFilter, IoWorkerPool, NextFilter,
    ResourceAddress, Session, SessionError, SessionInitializer, TransportRegistry,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Name of the filter closing idle accepted sessions
pub const IDLE_CLOSE_FILTER: &str = "relaygate.idle-close";

/// Closes a session once both directions have been idle
struct IdleCloseFilter {
    metrics: Arc<ServerMetrics>,
}

impl IoFilter for IdleCloseFilter {
    fn session_idle(&self, next: &NextFilter, session: &Arc<Session>, status: IdleStatus) {
        if status == IdleStatus::BothIdle {
            tracing::debug!(session_id = %session.id(), "Closing idle session");
            self.metrics.idle_close();
            session.close_now();
        }
        next.session_idle(session, status);
    }
}

/// A snapshot of the server state
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    /// Current accepted sessions
    pub active_sessions: usize,
    /// Total accepted sessions since start
    pub total_sessions: u64,
    /// Bound address, if running
    pub local_addr: Option<SocketAddr>,
    /// Resource sessions are bridged to
    pub upstream: ResourceAddress,
    /// Time since the server was created
    pub uptime: Duration,
}

/// Builder for [`ProxyServer`]
pub struct ProxyServerBuilder {
    config: ServerConfig,
    connectors: Vec<Arc<dyn Connector>>,
    workers: Option<Arc<IoWorkerPool>>,
    accept_initializer: Option<SessionInitializer>,
    upstream_initializer: Option<SessionInitializer>,
}

impl ProxyServerBuilder {
    /// Register an extra connector alongside the TCP one
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connectors.push(connector);
        self
    }

    /// Run sessions on an existing worker pool instead of spawning one
    pub fn with_workers(mut self, workers: Arc<IoWorkerPool>) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Run `initializer` on every accepted session
    pub fn with_accept_initializer(mut self, initializer: SessionInitializer) -> Self {
        self.accept_initializer = Some(initializer);
        self
    }

    /// Run `initializer` on every upstream session
    pub fn with_upstream_initializer(mut self, initializer: SessionInitializer) -> Self {
        self.upstream_initializer = Some(initializer);
        self
    }

    /// Build the server
    ///
    /// Must be called from within a tokio runtime, which the transports
    /// use for their I/O. Fails if the configuration is invalid or no
    /// connector serves the upstream's scheme.
    pub fn build(self) -> Result<ProxyServer> {
        let config = self.config;
        config.validate().map_err(ServerError::Config)?;
        let runtime = Handle::try_current()?;

        let owns_workers = self.workers.is_none();
        let workers = match self.workers {
            Some(workers) => workers,
            None => Arc::new(IoWorkerPool::new(&config.workers)?),
        };
        let session_config = config.session_config();

        let tcp = TcpConnector::new(runtime, workers.clone())
            .with_config(session_config.clone())
            .with_connect_timeout(config.connect_timeout);
        let registry = Arc::new(
            self.connectors
                .into_iter()
                .fold(
                    TransportRegistry::builder().with_connector(Arc::new(tcp)),
                    |builder, connector| builder.with_connector(connector),
                )
                .build(),
        );
        if registry.connector(config.upstream.scheme()).is_none() {
            return Err(SessionError::UnknownScheme(config.upstream.scheme().to_string()).into());
        }

        let metrics = Arc::new(ServerMetrics::new());
        let manager = Arc::new(SessionManager::new(metrics.clone()));

        let mut bridge = BridgeHandler::accepting(
            BridgeCoupler::new(registry.clone()),
            config.upstream.clone(),
        );
        if let Some(initializer) = self.upstream_initializer {
            bridge = bridge.with_initializer(initializer);
        }

        let idle_metrics = metrics.clone();
        let user_initializer = self.accept_initializer;
        let accept_initializer: SessionInitializer = Arc::new(move |session: &Arc<Session>| {
            session.chain().add_last(
                IDLE_CLOSE_FILTER,
                Arc::new(IdleCloseFilter {
                    metrics: idle_metrics.clone(),
                }),
            )?;
            match &user_initializer {
                Some(initializer) => initializer(session),
                None => Ok(()),
            }
        });

        let acceptor = TcpAcceptor::new(Arc::new(bridge), workers.clone())
            .with_config(session_config)
            .with_initializer(accept_initializer)
            .with_max_sessions(config.max_sessions)
            .with_manager(manager.clone());

        Ok(ProxyServer {
            config,
            workers,
            owns_workers,
            registry,
            manager,
            metrics,
            acceptor,
            started_at: Instant::now(),
            running: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        })
    }
}

/// Proxy server bridging accepted TCP sessions to an upstream
///
/// # Example
///
/// ```no_run
/// use relaygate_server::{ProxyServer, ServerConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ServerConfig::new(
///         "0.0.0.0:6380".parse()?,
///         "tcp://10.0.0.7:6379".parse()?,
///     );
///     let server = ProxyServer::new(config)?;
///     server.start().await?;
///
///     tokio::signal::ctrl_c().await?;
///     server.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct ProxyServer {
    config: ServerConfig,
    workers: Arc<IoWorkerPool>,
    owns_workers: bool,
    registry: Arc<TransportRegistry>,
    manager: Arc<SessionManager>,
    metrics: Arc<ServerMetrics>,
    acceptor: TcpAcceptor,
    started_at: Instant,
    running: AtomicBool,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ProxyServer {
    /// Create a server with only the TCP connector registered
    pub fn new(config: ServerConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start building a server
    pub fn builder(config: ServerConfig) -> ProxyServerBuilder {
        ProxyServerBuilder {
            config,
            connectors: Vec::new(),
            workers: None,
            accept_initializer: None,
            upstream_initializer: None,
        }
    }

    /// Bind the acceptor and start sweeping for idle sessions
    ///
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let local_addr = match self.acceptor.bind(self.config.bind_address).await {
            Ok(local_addr) => local_addr,
            Err(error) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(error);
            }
        };

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(sweep_loop(
            self.manager.clone(),
            self.config.idle_check_interval,
            shutdown.clone(),
        ));
        *self.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some((shutdown, task));

        tracing::info!(
            local = %local_addr,
            upstream = %self.config.upstream,
            "Proxy server started"
        );
        Ok(local_addr)
    }

    /// Shutdown the server gracefully
    ///
    /// Stops accepting, then closes every accepted session and waits up to
    /// the configured shutdown timeout for them to finish. Closing an
    /// accepted session also closes its upstream session.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(ServerError::NotRunning);
        }

        tracing::info!("Shutting down proxy server");
        if let Err(error) = self.acceptor.unbind().await {
            tracing::warn!(error = %error, "Acceptor was not bound");
        }

        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((shutdown, task)) = sweeper {
            shutdown.cancel();
            let _ = task.await;
        }

        let remaining = self.manager.close_all(self.config.shutdown_timeout).await;
        if remaining > 0 {
            return Err(ServerError::ShutdownTimeout(remaining));
        }

        tracing::info!("Proxy server shutdown complete");
        Ok(())
    }

    /// Check if the server is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The bound address, if running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Get the number of accepted sessions
    pub fn session_count(&self) -> usize {
        self.manager.count()
    }

    /// Get a snapshot of the server state
    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            active_sessions: self.manager.count(),
            total_sessions: self.metrics.total_sessions(),
            local_addr: self.local_addr(),
            upstream: self.config.upstream.clone(),
            uptime: self.started_at.elapsed(),
        }
    }

    /// Get the server metrics
    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    /// Get the session manager
    pub fn manager(&self) -> Arc<SessionManager> {
        self.manager.clone()
    }

    /// Get the transport registry upstream connects go through
    pub fn registry(&self) -> Arc<TransportRegistry> {
        self.registry.clone()
    }

    /// Get the worker pool sessions run on
    pub fn workers(&self) -> Arc<IoWorkerPool> {
        self.workers.clone()
    }

    /// Get the server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

async fn sweep_loop(manager: Arc<SessionManager>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let fired = manager.sweep_idle();
                if fired > 0 {
                    tracing::trace!(fired, "Idle sweep");
                }
            }
        }
    }
}

impl fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyServer")
            .field("local_addr", &self.local_addr())
            .field("upstream", &self.config.upstream)
            .field("running", &self.is_running())
            .field("session_count", &self.session_count())
            .field("uptime", &self.started_at.elapsed())
            .finish()
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::warn!("ProxyServer dropped while still running");
        }
        if let Some((shutdown, _)) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            shutdown.cancel();
        }
        if self.owns_workers {
            for worker in self.workers.workers() {
                worker.shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        ServerConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            "tcp://127.0.0.1:9".parse().unwrap(),
        )
        .with_workers(relaygate_service::WorkerPoolConfig::new(2))
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let server = ProxyServer::new(config()).unwrap();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());

        let local_addr = server.start().await.unwrap();
        assert!(server.is_running());
        assert_eq!(server.local_addr(), Some(local_addr));
        assert_ne!(local_addr.port(), 0);

        server.shutdown().await.unwrap();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_double_start_and_stop() {
        let server = ProxyServer::new(config()).unwrap();
        server.start().await.unwrap();
        assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));
        server.shutdown().await.unwrap();
        assert!(matches!(server.shutdown().await, Err(ServerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_unknown_upstream_scheme_is_rejected() {
        let config = config().with_upstream("gopher://example:70".parse().unwrap());
        assert!(matches!(
            ProxyServer::new(config),
            Err(ServerError::Session(SessionError::UnknownScheme(scheme))) if scheme == "gopher"
        ));
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        assert!(matches!(
            ProxyServer::new(config()),
            Err(ServerError::Runtime(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot() {
        let server = ProxyServer::new(config()).unwrap();
        let snapshot = server.snapshot();
        assert_eq!(snapshot.active_sessions, 0);
        assert_eq!(snapshot.total_sessions, 0);
        assert_eq!(snapshot.upstream.to_string(), "tcp://127.0.0.1:9");
        assert!(snapshot.local_addr.is_none());
    }
}
