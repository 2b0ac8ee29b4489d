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

//! # Relaygate Server
//!
//! Network transports and a proxy server built on `relaygate-service`.
//!
//! ## Transports
//!
//! - [`TcpAcceptor`] and [`TcpConnector`] carry sessions over TCP. Reads
//!   honor read suspension and every write is bounded by the session's
//!   write timeout.
//! - [`UdpAcceptor`] keeps one session per remote address and sends
//!   writes to the request's destination or back to the peer.
//!
//! ## Proxy
//!
//! [`ProxyServer`] accepts TCP sessions and bridges each to a configured
//! upstream through a [`TransportRegistry`](relaygate_service::TransportRegistry).
//! A [`SessionManager`] tracks accepted sessions, sweeps them for idleness
//! and closes them on shutdown.
//!
//! ```no_run
//! use relaygate_server::{ProxyServer, ServerConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::default()
//!     .with_bind_address("0.0.0.0:8080".parse()?)
//!     .with_upstream("tcp://backend:80".parse()?);
//! let server = ProxyServer::new(config)?;
//! let local = server.start().await?;
//! println!("proxying {} -> tcp://backend:80", local);
//! # Ok(())
//! # }
//! ```

mod acceptor;
mod config;
mod error;
mod manager;
mod metrics;
mod server;
mod tcp;
mod udp;

pub use acceptor::Acceptor;
pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use manager::{BroadcastResult, SessionManager};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use server::{IDLE_CLOSE_FILTER, ProxyServer, ProxyServerBuilder, ServerSnapshot};
pub use tcp::{TCP_SCHEME, TcpAcceptor, TcpConnector};
pub use udp::{UDP_SCHEME, UdpAcceptor};
