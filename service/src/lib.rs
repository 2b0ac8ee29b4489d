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

//! Relaygate Session Engine
//!
//! This crate provides the session layer of the relaygate protocol gateway:
//! sessions with per-session filter chains, thread-aligned event dispatch,
//! outbound write queues with completion futures, and a bridge that couples
//! an accepted session to an outbound one.
//!
//! - Every chain callback for a session runs on that session's worker, one at
//!   a time, no matter which thread reported the event
//! - Inbound events keep their arrival order and writes keep submission order
//! - Write failures surface through [`WriteFuture`]s, never as panics
//! - Panicking filters are turned into `exception_caught` events
//!
//! # Architecture
//!
//! ```text
//! transport ──fire_*──▶ dispatch ──▶ [filter] ─▶ [filter] ─▶ IoHandler
//!     ▲                    │
//!     └──── IoProcessor ◀──┴──── [filter] ◀─ [filter] ◀─ session.write()
//! ```
//!
//! Transports implement [`IoProcessor`] and build sessions with
//! [`SessionBuilder`]; outbound transports also implement [`Connector`] and
//! are registered in a [`TransportRegistry`]. The in-process [`PipeAcceptor`]
//! is included; socket transports live in `relaygate-server`.
//!
//! # Example
//!
//! ```
//! use relaygate_service::{
//!     BridgeCoupler, BridgeHandler, CallbackHandler, IoWorkerPool, PipeAcceptor,
//!     TransportRegistry, WorkerPoolConfig,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let workers = Arc::new(IoWorkerPool::new(&WorkerPoolConfig::new(2)).unwrap());
//! let pipes = PipeAcceptor::new(workers);
//! let registry = Arc::new(
//!     TransportRegistry::builder()
//!         .with_connector(Arc::new(pipes.connector()))
//!         .build(),
//! );
//!
//! // Upstream service echoing everything back
//! let echo = CallbackHandler {
//!     on_message: Some(Box::new(|session, message| {
//!         session.write(message);
//!     })),
//!     ..Default::default()
//! };
//! pipes.bind("upstream", Arc::new(echo)).unwrap();
//!
//! // Front door bridging every session to the upstream
//! let bridge = BridgeHandler::accepting(
//!     BridgeCoupler::new(registry),
//!     "pipe://upstream".parse().unwrap(),
//! );
//! pipes.bind("front", Arc::new(bridge)).unwrap();
//!
//! let client = pipes
//!     .connector()
//!     .connect_blocking(
//!         &"pipe://front".parse().unwrap(),
//!         Arc::new(CallbackHandler::default()),
//!         Duration::from_secs(5),
//!     )
//!     .unwrap();
//! client.write(&b"hello"[..]);
//! ```

mod assertion;
mod attribute;
mod bridge;
mod buffer;
mod chain;
mod codec;
mod config;
mod connector;
mod dispatch;
mod error;
mod filter;
mod future;
mod handler;
mod message;
mod pipe;
mod processor;
mod registry;
mod session;
mod types;
mod worker;
mod write;

pub use assertion::{ALIGNMENT_ASSERTION, AlignmentAssertionFilter};
pub use attribute::{AttributeKey, AttributeMap};
pub use bridge::{BridgeCoupler, BridgeHandler};
pub use buffer::IoBuffer;
pub use chain::FilterChain;
pub use codec::{CodecError, ProtocolCodecFilter};
pub use config::{SessionConfig, WorkerPoolConfig};
pub use connector::{Connector, ResourceAddress, SessionInitializer, run_initializer};
pub use dispatch::{InboundEvent, OutboundEvent};
pub use error::{Result, SessionError, WriteError};
pub use filter::{IoFilter, NextFilter};
pub use future::{CloseFuture, ConnectFuture, IoFuture, WriteFuture};
pub use handler::{CallbackHandler, IoHandler};
pub use message::Message;
pub use pipe::{PIPE_SCHEME, PipeAcceptor, PipeConnector};
pub use processor::{IoProcessor, ReadQueue};
pub use registry::{TransportRegistry, TransportRegistryBuilder};
pub use session::{Session, SessionBuilder};
pub use types::{Endpoint, IdleStatus, SessionId, SessionInfo, SessionState};
pub use worker::{IoWorker, IoWorkerPool};
pub use write::{WriteRequest, WriteRequestQueue, fail_all};
