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

//! Bridge coupling tests over in-process pipes

use bytes::Bytes;
use relaygate_service::{
    BridgeCoupler, BridgeHandler, CallbackHandler, ConnectFuture, Connector, IoFilter, IoHandler,
    IoWorkerPool, Message, NextFilter, PipeAcceptor, PipeConnector, ResourceAddress, Session,
    SessionError, SessionInitializer, TransportRegistry, WorkerPoolConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(10);

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(2));
    }
}

fn closed(session: &Session) -> bool {
    session.close_future().wait_timeout(TIMEOUT).is_some() && session.is_closed()
}

/// Handler collecting received buffers
#[derive(Default)]
struct Collector {
    received: Mutex<Vec<Bytes>>,
}

impl Collector {
    fn received(&self) -> Vec<Bytes> {
        self.received.lock().unwrap().clone()
    }
}

impl IoHandler for Collector {
    fn message_received(&self, _session: &Arc<Session>, message: Message) {
        if let Some(buffer) = message.as_buffer() {
            self.received.lock().unwrap().push(buffer.to_bytes());
        }
    }
}

/// Echo handler handing each opened session to the test
fn echo(opened: mpsc::Sender<Arc<Session>>) -> CallbackHandler {
    let opened = Mutex::new(opened);
    CallbackHandler {
        on_opened: Some(Box::new(move |session| {
            let _ = opened.lock().unwrap().send(session.clone());
        })),
        on_message: Some(Box::new(|session, message| {
            session.write(message);
        })),
        ..Default::default()
    }
}

/// Connector whose connects stay pending until the test releases them
#[derive(Default)]
struct DeferredConnector {
    pending: Mutex<Vec<(Arc<dyn IoHandler>, Option<SessionInitializer>, ConnectFuture)>>,
}

impl DeferredConnector {
    fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Complete every pending connect by opening `target` through `pipes`
    fn release(&self, pipes: &PipeConnector, target: &ResourceAddress) {
        let pending: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
        for (handler, initializer, future) in pending {
            let result = pipes.connect(target, handler, initializer).wait_timeout(TIMEOUT);
            future.complete(result.unwrap());
        }
    }
}

impl Connector for DeferredConnector {
    fn scheme(&self) -> &str {
        "slow"
    }

    fn connect(
        &self,
        _address: &ResourceAddress,
        handler: Arc<dyn IoHandler>,
        initializer: Option<SessionInitializer>,
    ) -> ConnectFuture {
        let future = ConnectFuture::new();
        self.pending
            .lock()
            .unwrap()
            .push((handler, initializer, future.clone()));
        future
    }
}

struct Fixture {
    pipes: PipeAcceptor,
    registry: Arc<TransportRegistry>,
    deferred: Arc<DeferredConnector>,
    upstream: mpsc::Receiver<Arc<Session>>,
}

impl Fixture {
    fn new() -> Self {
        let workers = Arc::new(IoWorkerPool::new(&WorkerPoolConfig::new(3)).unwrap());
        let pipes = PipeAcceptor::new(workers);
        let deferred = Arc::new(DeferredConnector::default());
        let registry = Arc::new(
            TransportRegistry::builder()
                .with_connector(Arc::new(pipes.connector()))
                .with_connector(deferred.clone())
                .build(),
        );
        let (tx, upstream) = mpsc::channel();
        pipes.bind("upstream", Arc::new(echo(tx))).unwrap();
        Self {
            pipes,
            registry,
            deferred,
            upstream,
        }
    }

    fn coupler(&self) -> BridgeCoupler {
        BridgeCoupler::new(self.registry.clone())
    }

    fn connect(&self, name: &str, handler: Arc<dyn IoHandler>) -> Arc<Session> {
        self.pipes
            .connector()
            .connect_blocking(&format!("pipe://{}", name).parse().unwrap(), handler, TIMEOUT)
            .unwrap()
    }

    fn upstream_session(&self) -> Arc<Session> {
        self.upstream.recv_timeout(TIMEOUT).unwrap()
    }
}

/// Counts messages passing the connect-side chain
struct Tap {
    seen: Arc<AtomicUsize>,
}

impl IoFilter for Tap {
    fn message_received(&self, next: &NextFilter, session: &Arc<Session>, message: Message) {
        self.seen.fetch_add(1, Ordering::SeqCst);
        next.message_received(session, message);
    }
}

#[test]
fn test_messages_relay_both_ways_in_order() {
    let fixture = Fixture::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let connect_side = Arc::new(Mutex::new(None));
    let initializer: SessionInitializer = {
        let seen = seen.clone();
        let connect_side = connect_side.clone();
        Arc::new(move |session: &Arc<Session>| {
            *connect_side.lock().unwrap() = Some(session.clone());
            session.chain().add_last("tap", Arc::new(Tap { seen: seen.clone() }))
        })
    };
    let bridge = BridgeHandler::accepting(fixture.coupler(), "pipe://upstream".parse().unwrap())
        .with_initializer(initializer);
    fixture.pipes.bind("front", Arc::new(bridge)).unwrap();

    let collector = Arc::new(Collector::default());
    let client = fixture.connect("front", collector.clone());
    let sent: Vec<Bytes> = (0..20)
        .map(|i| Bytes::from(format!("message-{:02}", i)))
        .collect();
    for message in &sent {
        client.write(message.clone());
    }

    wait_until(|| collector.received().len() == sent.len());
    assert_eq!(collector.received(), sent);
    assert_eq!(seen.load(Ordering::SeqCst), sent.len());

    let connect = connect_side.lock().unwrap().clone().unwrap();
    let accept = BridgeCoupler::peer(&connect).unwrap();
    assert!(Arc::ptr_eq(&BridgeCoupler::peer(&accept).unwrap(), &connect));
    assert!(!BridgeCoupler::is_pending(&accept));
}

#[test]
fn test_closing_accept_side_closes_connect_side() {
    let fixture = Fixture::new();
    let bridge = BridgeHandler::accepting(fixture.coupler(), "pipe://upstream".parse().unwrap());
    fixture.pipes.bind("front", Arc::new(bridge)).unwrap();

    let client = fixture.connect("front", Arc::new(Collector::default()));
    let upstream = fixture.upstream_session();

    client.close_now();
    assert!(closed(&client));
    assert!(closed(&upstream), "close crossed the bridge");
}

#[test]
fn test_closing_connect_side_closes_accept_side() {
    let fixture = Fixture::new();
    let bridge = BridgeHandler::accepting(fixture.coupler(), "pipe://upstream".parse().unwrap());
    fixture.pipes.bind("front", Arc::new(bridge)).unwrap();

    let client = fixture.connect("front", Arc::new(Collector::default()));
    let upstream = fixture.upstream_session();

    upstream.close_now();
    assert!(closed(&upstream));
    assert!(closed(&client), "close crossed the bridge");
}

#[test]
fn test_messages_queued_while_connect_pending_flush_in_order() {
    let fixture = Fixture::new();
    let bridge = BridgeHandler::accepting(fixture.coupler(), "slow://upstream".parse().unwrap());
    fixture.pipes.bind("front", Arc::new(bridge)).unwrap();

    let collector = Arc::new(Collector::default());
    let client = fixture.connect("front", collector.clone());
    wait_until(|| fixture.deferred.pending() == 1);

    for chunk in ["early-1", "early-2", "early-3"] {
        client.write(Bytes::from_static(chunk.as_bytes()));
    }
    // Nothing can come back before the connect side exists
    thread::sleep(Duration::from_millis(50));
    assert!(collector.received().is_empty());

    fixture
        .deferred
        .release(&fixture.pipes.connector(), &"pipe://upstream".parse().unwrap());
    wait_until(|| collector.received().len() == 3);
    assert_eq!(collector.received(), vec!["early-1", "early-2", "early-3"]);
}

#[test]
fn test_connect_completing_after_accept_closed_is_torn_down() {
    let fixture = Fixture::new();
    let (tx, plain) = mpsc::channel();
    fixture
        .pipes
        .bind("plain", Arc::new(echo(tx)))
        .unwrap();
    let client = fixture.connect("plain", Arc::new(Collector::default()));
    let accept = plain.recv_timeout(TIMEOUT).unwrap();

    let bridged = fixture.coupler().initiate(
        &accept,
        &"slow://upstream".parse().unwrap(),
        Arc::new(BridgeHandler::connecting()),
        None,
    );
    assert!(BridgeCoupler::is_pending(&accept));

    accept.close_now();
    assert!(closed(&accept));
    assert!(closed(&client));
    assert!(!bridged.is_done());

    fixture
        .deferred
        .release(&fixture.pipes.connector(), &"pipe://upstream".parse().unwrap());
    let result = bridged.wait_timeout(TIMEOUT).unwrap();
    assert!(matches!(result, Err(SessionError::PeerClosed(id)) if id == accept.id()));

    // The late connect side and its far end were closed instead of activated
    let upstream = fixture.upstream_session();
    assert!(closed(&upstream));
}

#[test]
fn test_connect_failure_closes_accept_side() {
    let fixture = Fixture::new();
    let bridge = BridgeHandler::accepting(fixture.coupler(), "pipe://missing".parse().unwrap());
    fixture.pipes.bind("front", Arc::new(bridge)).unwrap();

    let client = fixture.connect("front", Arc::new(Collector::default()));
    assert!(closed(&client));
}

#[test]
fn test_unknown_scheme_fails_the_bridge() {
    let fixture = Fixture::new();
    let (tx, plain) = mpsc::channel();
    fixture.pipes.bind("plain", Arc::new(echo(tx))).unwrap();
    let _client = fixture.connect("plain", Arc::new(Collector::default()));
    let accept = plain.recv_timeout(TIMEOUT).unwrap();

    let result = fixture
        .coupler()
        .initiate(
            &accept,
            &"gopher://upstream".parse().unwrap(),
            Arc::new(BridgeHandler::connecting()),
            None,
        )
        .wait_timeout(TIMEOUT)
        .unwrap();
    assert!(matches!(result, Err(SessionError::UnknownScheme(_))));
    assert!(closed(&accept));
}
