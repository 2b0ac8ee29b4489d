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

//! Session bridging
//!
//! A bridge couples an accepted session to a session connected on its
//! behalf and relays messages between them. Messages that arrive on the
//! accept side while the connect is still in flight are queued and flushed,
//! in arrival order, once the connect side exists. Closing either side
//! closes the other. A connect that completes after the accept side has
//! already closed is torn down immediately instead of being activated.
//!
//! The coupler never retries a failed connect; the accept side is closed
//! and the failure is reported through the returned future.

use crate::{
    AttributeKey, ConnectFuture, IoHandler, Message, ResourceAddress, Session, SessionError,
    SessionId, SessionInitializer, TransportRegistry,
};
use metrics::counter;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

enum LinkState {
    /// Connect in flight; holds messages to flush once it completes
    Pending(VecDeque<Message>),
    Paired(Weak<Session>),
    /// The bridge is gone; anything relayed is dropped
    Detached,
}

type Link = Arc<Mutex<LinkState>>;

static BRIDGE_LINK: AttributeKey<Link> = AttributeKey::new("relaygate.bridge.link");

fn lock(link: &Link) -> MutexGuard<'_, LinkState> {
    link.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Couples accepted sessions to outbound sessions opened through a registry
#[derive(Debug, Clone)]
pub struct BridgeCoupler {
    registry: Arc<TransportRegistry>,
}

impl BridgeCoupler {
    /// Create a coupler connecting through `registry`
    pub fn new(registry: Arc<TransportRegistry>) -> Self {
        Self { registry }
    }

    /// The registry outbound sessions are opened through
    pub fn registry(&self) -> &Arc<TransportRegistry> {
        &self.registry
    }

    /// Start bridging `accept` to a new session at `address`
    ///
    /// `initializer` runs on the connect-side session before the connect
    /// completes, so anything it installs is in place before the first
    /// message can arrive. The returned future resolves with the connect
    /// side once it is paired, or with the reason the bridge failed; in the
    /// failure case both sides end up closed.
    pub fn initiate(
        &self,
        accept: &Arc<Session>,
        address: &ResourceAddress,
        handler: Arc<dyn IoHandler>,
        initializer: Option<SessionInitializer>,
    ) -> ConnectFuture {
        let accept_id = accept.id();
        if accept.is_closing() {
            return ConnectFuture::completed(Err(SessionError::PeerClosed(accept_id)));
        }
        let link: Link = Arc::new(Mutex::new(LinkState::Pending(VecDeque::new())));
        if accept
            .attributes()
            .set_if_absent(&BRIDGE_LINK, link.clone())
            .is_some()
        {
            return ConnectFuture::completed(Err(SessionError::Other(format!(
                "{} is already bridged",
                accept_id
            ))));
        }

        accept.close_future().add_listener({
            let link = link.clone();
            move |_| {
                let peer = match std::mem::replace(&mut *lock(&link), LinkState::Detached) {
                    LinkState::Paired(peer) => peer.upgrade(),
                    LinkState::Pending(queued) if !queued.is_empty() => {
                        tracing::debug!(
                            session_id = %accept_id,
                            dropped = queued.len(),
                            "Bridge abandoned with queued messages"
                        );
                        None
                    }
                    _ => None,
                };
                if let Some(peer) = peer {
                    tracing::debug!(session_id = %accept_id, peer_id = %peer.id(), "Closing bridged peer");
                    peer.close_now();
                }
            }
        });

        tracing::debug!(session_id = %accept_id, address = %address, "Initiating bridge");
        let connecting = self.registry.connect(
            address,
            handler,
            Some(Self::connect_initializer(Arc::downgrade(accept), initializer)),
        );

        let bridged = ConnectFuture::new();
        let outcome = bridged.clone();
        let accept = Arc::downgrade(accept);
        let address = address.to_string();
        connecting.add_listener(move |result| {
            let result = match result {
                Ok(connect) => Self::activate(&link, accept_id, connect),
                Err(error) => {
                    *lock(&link) = LinkState::Detached;
                    counter!("relaygate.bridge.failed").increment(1);
                    tracing::warn!(
                        session_id = %accept_id,
                        address = %address,
                        error = %error,
                        "Bridge connect failed"
                    );
                    if let Some(accept) = accept.upgrade() {
                        accept.close_now();
                    }
                    Err(error.clone())
                }
            };
            outcome.complete(result);
        });
        bridged
    }

    /// Wrap the caller's initializer with the connect-side half of the bridge
    fn connect_initializer(
        accept: Weak<Session>,
        initializer: Option<SessionInitializer>,
    ) -> SessionInitializer {
        Arc::new(move |connect: &Arc<Session>| {
            connect.attributes().set(
                &BRIDGE_LINK,
                Arc::new(Mutex::new(LinkState::Paired(accept.clone()))),
            );
            let accept = accept.clone();
            connect.close_future().add_listener(move |_| {
                if let Some(accept) = accept.upgrade() {
                    accept.close_now();
                }
            });
            match &initializer {
                Some(initializer) => initializer(connect),
                None => Ok(()),
            }
        })
    }

    fn activate(
        link: &Link,
        accept_id: SessionId,
        connect: &Arc<Session>,
    ) -> Result<Arc<Session>, SessionError> {
        let mut state = lock(link);
        match std::mem::replace(&mut *state, LinkState::Detached) {
            LinkState::Pending(queued) => {
                // Flushed under the lock so later relays queue behind them
                let flushed = queued.len();
                for message in queued {
                    connect.write(message);
                }
                *state = LinkState::Paired(Arc::downgrade(connect));
                drop(state);
                counter!("relaygate.bridge.established").increment(1);
                tracing::debug!(
                    session_id = %accept_id,
                    peer_id = %connect.id(),
                    flushed,
                    "Bridge established"
                );
                Ok(connect.clone())
            }
            _ => {
                drop(state);
                tracing::debug!(
                    session_id = %accept_id,
                    peer_id = %connect.id(),
                    "Accept side closed before connect completed"
                );
                connect.close_now();
                Err(SessionError::PeerClosed(accept_id))
            }
        }
    }

    /// Forward `message` to the session bridged with `session`
    ///
    /// Queues the message while the connect is pending. Returns `false` if
    /// the session is not bridged or its peer is gone, in which case the
    /// message is dropped.
    pub fn relay(session: &Arc<Session>, message: Message) -> bool {
        let Some(link) = session.attributes().get(&BRIDGE_LINK) else {
            return false;
        };
        let peer = {
            let mut state = lock(&link);
            match &mut *state {
                LinkState::Pending(queued) => {
                    queued.push_back(message);
                    return true;
                }
                LinkState::Paired(peer) => peer.upgrade(),
                LinkState::Detached => None,
            }
        };
        match peer {
            Some(peer) => {
                peer.write(message);
                true
            }
            None => false,
        }
    }

    /// The session bridged with `session`, once paired
    pub fn peer(session: &Session) -> Option<Arc<Session>> {
        let link = session.attributes().get(&BRIDGE_LINK)?;
        match &*lock(&link) {
            LinkState::Paired(peer) => peer.upgrade(),
            _ => None,
        }
    }

    /// Check if `session` is waiting for its connect side
    pub fn is_pending(session: &Session) -> bool {
        session
            .attributes()
            .get(&BRIDGE_LINK)
            .is_some_and(|link| matches!(*lock(&link), LinkState::Pending(_)))
    }
}

enum BridgeMode {
    Accepting {
        coupler: BridgeCoupler,
        address: ResourceAddress,
        initializer: Option<SessionInitializer>,
        connect_handler: Arc<dyn IoHandler>,
    },
    Connecting,
}

/// Terminal handler for both halves of a bridge
///
/// The accepting half starts the bridge when its session opens; both halves
/// relay every message that reaches them to their peer.
pub struct BridgeHandler {
    mode: BridgeMode,
}

impl BridgeHandler {
    /// Handler for accepted sessions, bridging each to `address`
    pub fn accepting(coupler: BridgeCoupler, address: ResourceAddress) -> Self {
        Self {
            mode: BridgeMode::Accepting {
                coupler,
                address,
                initializer: None,
                connect_handler: Arc::new(BridgeHandler::connecting()),
            },
        }
    }

    /// Handler for the connect side of a bridge
    pub fn connecting() -> Self {
        Self {
            mode: BridgeMode::Connecting,
        }
    }

    /// Initializer run on every connect-side session
    ///
    /// Has no effect on a connecting handler.
    pub fn with_initializer(mut self, initializer: SessionInitializer) -> Self {
        if let BridgeMode::Accepting {
            initializer: slot, ..
        } = &mut self.mode
        {
            *slot = Some(initializer);
        }
        self
    }
}

impl IoHandler for BridgeHandler {
    fn session_opened(&self, session: &Arc<Session>) {
        let BridgeMode::Accepting {
            coupler,
            address,
            initializer,
            connect_handler,
        } = &self.mode
        else {
            return;
        };
        coupler.initiate(session, address, connect_handler.clone(), initializer.clone());
    }

    fn message_received(&self, session: &Arc<Session>, message: Message) {
        if !BridgeCoupler::relay(session, message) {
            tracing::debug!(session_id = %session.id(), "No bridged peer, dropping message");
        }
    }
}

impl fmt::Debug for BridgeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mode {
            BridgeMode::Accepting { address, .. } => f
                .debug_struct("BridgeHandler")
                .field("mode", &"accepting")
                .field("address", address)
                .finish(),
            BridgeMode::Connecting => f
                .debug_struct("BridgeHandler")
                .field("mode", &"connecting")
                .finish(),
        }
    }
}
