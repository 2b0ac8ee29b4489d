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

//! Filter chain topology tests

use relaygate_service::{
    ALIGNMENT_ASSERTION, FilterChain, IoFilter, IoHandler, IoProcessor, IoWorker, Message,
    NextFilter, Result, Session, SessionBuilder, SessionConfig, SessionError, WriteRequest,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

struct NullProcessor;

impl IoProcessor for NullProcessor {
    fn name(&self) -> &'static str {
        "null"
    }

    fn flush(&self, session: &Arc<Session>) {
        while let Some(request) = session.write_queue().poll() {
            session.complete_write(request, 0);
        }
    }

    fn close(&self, session: &Arc<Session>) {
        session.transport_closed();
    }
}

struct NullHandler;
impl IoHandler for NullHandler {}

type Log = Arc<Mutex<Vec<String>>>;

/// Filter logging hook calls and tagging messages as they pass
struct TracingFilter {
    label: &'static str,
    log: Log,
    fail_pre_add: bool,
    fail_post_add: bool,
}

impl TracingFilter {
    fn new(label: &'static str, log: &Log) -> Arc<Self> {
        Self::refusing(label, log, false, false)
    }

    fn refusing(label: &'static str, log: &Log, pre_add: bool, post_add: bool) -> Arc<Self> {
        Arc::new(Self {
            label,
            log: log.clone(),
            fail_pre_add: pre_add,
            fail_post_add: post_add,
        })
    }

    fn record(&self, event: &str) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.label, event));
    }
}

impl IoFilter for TracingFilter {
    fn on_pre_add(&self, chain: &FilterChain, name: &str) -> Result<()> {
        assert!(!chain.contains(name));
        self.record("pre_add");
        if self.fail_pre_add {
            return Err(SessionError::Other("refused".into()));
        }
        Ok(())
    }

    fn on_post_add(&self, chain: &FilterChain, name: &str) -> Result<()> {
        assert!(chain.contains(name));
        self.record("post_add");
        if self.fail_post_add {
            return Err(SessionError::Other("refused".into()));
        }
        Ok(())
    }

    fn on_pre_remove(&self, chain: &FilterChain, name: &str) -> Result<()> {
        assert!(chain.contains(name));
        self.record("pre_remove");
        Ok(())
    }

    fn on_post_remove(&self, chain: &FilterChain, name: &str) -> Result<()> {
        assert!(!chain.contains(name));
        self.record("post_remove");
        Ok(())
    }

    fn message_received(&self, next: &NextFilter, session: &Arc<Session>, message: Message) {
        self.record("received");
        next.message_received(session, message);
    }

    fn filter_write(&self, next: &NextFilter, session: &Arc<Session>, request: WriteRequest) {
        self.record("write");
        next.filter_write(session, request);
    }
}

fn session() -> Arc<Session> {
    let worker = IoWorker::spawn("chain-test").unwrap();
    SessionBuilder::new(worker, Arc::new(NullHandler), Arc::new(NullProcessor))
        .with_config(SessionConfig::new().with_assert_alignment(false))
        .build()
}

#[test]
fn test_positions() {
    let log = Log::default();
    let session = session();
    let chain = session.chain();

    chain.add_last("b", TracingFilter::new("b", &log)).unwrap();
    chain.add_first("a", TracingFilter::new("a", &log)).unwrap();
    chain.add_last("d", TracingFilter::new("d", &log)).unwrap();
    chain.add_before("d", "c", TracingFilter::new("c", &log)).unwrap();
    chain.add_after("d", "e", TracingFilter::new("e", &log)).unwrap();

    assert_eq!(chain.names(), vec!["a", "b", "c", "d", "e"]);
    assert!(matches!(
        chain.add_after("missing", "f", TracingFilter::new("f", &log)),
        Err(SessionError::FilterNotFound(name)) if name == "missing"
    ));
    assert_eq!(chain.len(), 5);
}

#[test]
fn test_name_conflict_leaves_chain_unchanged() {
    let log = Log::default();
    let session = session();
    let chain = session.chain();
    chain.add_last("x", TracingFilter::new("x1", &log)).unwrap();
    chain.add_last("y", TracingFilter::new("y", &log)).unwrap();
    let before = chain.names();
    log.lock().unwrap().clear();

    for result in [
        chain.add_first("x", TracingFilter::new("x2", &log)),
        chain.add_last("x", TracingFilter::new("x2", &log)),
        chain.add_before("y", "x", TracingFilter::new("x2", &log)),
    ] {
        assert!(matches!(result, Err(SessionError::NameConflict(name)) if name == "x"));
    }

    assert_eq!(chain.names(), before);
    assert_eq!(chain.len(), 2);
    assert!(log.lock().unwrap().is_empty(), "no hooks ran for a rejected add");
}

#[test]
fn test_hook_order() {
    let log = Log::default();
    let session = session();
    let chain = session.chain();

    chain.add_last("f", TracingFilter::new("f", &log)).unwrap();
    chain.remove("f").unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["f:pre_add", "f:post_add", "f:pre_remove", "f:post_remove"]
    );
    assert!(chain.is_empty());
    assert!(matches!(chain.remove("f"), Err(SessionError::FilterNotFound(_))));
}

#[test]
fn test_failed_hooks_abort_the_add() {
    let log = Log::default();
    let session = session();
    let chain = session.chain();

    let refuses_early = TracingFilter::refusing("early", &log, true, false);
    assert!(chain.add_last("early", refuses_early).is_err());
    assert!(!chain.contains("early"));

    let refuses_late = TracingFilter::refusing("late", &log, false, true);
    assert!(chain.add_last("late", refuses_late).is_err());
    assert!(!chain.contains("late"), "post_add failure unlinks the filter");
    assert!(chain.is_empty());
}

#[test]
fn test_event_direction() {
    let log = Log::default();
    let session = session();
    let chain = session.chain();
    chain.add_last("outer", TracingFilter::new("outer", &log)).unwrap();
    chain.add_last("inner", TracingFilter::new("inner", &log)).unwrap();
    session.fire_session_opened();

    let (tx, rx) = mpsc::channel();
    session
        .write(&b"out"[..])
        .add_listener(move |_| tx.send(()).unwrap());
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let (tx, rx) = mpsc::channel();
    session.fire_message_received(Message::buffer(&b"in"[..]));
    session.worker().execute(move || tx.send(()).unwrap()).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Writes travel tail to head, reads head to tail
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "outer:pre_add",
            "outer:post_add",
            "inner:pre_add",
            "inner:post_add",
            "inner:write",
            "outer:write",
            "outer:received",
            "inner:received",
        ]
    );
}

#[test]
fn test_assertion_filter_installed_at_head_when_enabled() {
    let worker = IoWorker::spawn("assert-test").unwrap();
    let session = SessionBuilder::new(worker, Arc::new(NullHandler), Arc::new(NullProcessor))
        .with_config(SessionConfig::new().with_assert_alignment(true))
        .build();
    session.chain().add_first("first", Arc::new(NullFilter)).unwrap();
    assert_eq!(session.chain().names(), vec!["first", ALIGNMENT_ASSERTION]);
}

struct NullFilter;
impl IoFilter for NullFilter {}

/// Handler appending to the shared log
struct LogHandler {
    log: Log,
}

impl IoHandler for LogHandler {
    fn message_received(&self, _session: &Arc<Session>, message: Message) {
        let text = message
            .as_buffer()
            .map(|buffer| String::from_utf8_lossy(buffer.as_slice()).into_owned())
            .unwrap_or_default();
        self.log
            .lock()
            .unwrap()
            .push(format!("handler:received:{}", text));
    }
}

/// Swaps `b` for `late` while the first message passes through
struct Rewirer {
    log: Log,
    done: AtomicBool,
}

impl IoFilter for Rewirer {
    fn message_received(&self, next: &NextFilter, session: &Arc<Session>, message: Message) {
        if !self.done.swap(true, Ordering::SeqCst) {
            session.chain().remove("b").unwrap();
            session
                .chain()
                .add_last("late", TracingFilter::new("late", &self.log))
                .unwrap();
        }
        next.message_received(session, message);
    }
}

/// Block until everything queued on the worker has run
fn drain(session: &Session) {
    let (tx, rx) = mpsc::channel();
    session.worker().execute(move || tx.send(()).unwrap()).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
}

#[test]
fn test_chain_changes_during_dispatch() {
    let log = Log::default();
    let worker = IoWorker::spawn("rewire-test").unwrap();
    let session = SessionBuilder::new(
        worker,
        Arc::new(LogHandler { log: log.clone() }),
        Arc::new(NullProcessor),
    )
    .with_config(SessionConfig::new().with_assert_alignment(false))
    .build();
    let rewirer = Arc::new(Rewirer {
        log: log.clone(),
        done: AtomicBool::new(false),
    });
    session.chain().add_last("rewire", rewirer).unwrap();
    session.chain().add_last("b", TracingFilter::new("b", &log)).unwrap();
    session.fire_session_opened();
    drain(&session);
    log.lock().unwrap().clear();

    session.fire_message_received(Message::buffer(&b"one"[..]));
    drain(&session);
    session.fire_message_received(Message::buffer(&b"two"[..]));
    drain(&session);

    // The removed filter misses the message already in flight; the filter
    // added meanwhile only sees the next one
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "b:pre_remove",
            "b:post_remove",
            "late:pre_add",
            "late:post_add",
            "handler:received:one",
            "late:received",
            "handler:received:two",
        ]
    );
    assert_eq!(session.chain().names(), vec!["rewire", "late"]);
}

/// Drops session_closed instead of passing it on
struct SwallowClose;

impl IoFilter for SwallowClose {
    fn session_closed(&self, _next: &NextFilter, _session: &Arc<Session>) {}
}

#[test]
fn test_close_completes_when_a_filter_swallows_session_closed() {
    let session = session();
    session.chain().add_last("swallow", Arc::new(SwallowClose)).unwrap();
    session.fire_session_opened();

    assert_eq!(
        session.close_now().wait_timeout(Duration::from_secs(5)),
        Some(())
    );
    assert!(session.is_closed());
    assert!(session.write_queue().is_disposed());
}

/// Refuses its post-remove hook
struct RefusesPostRemove;

impl IoFilter for RefusesPostRemove {
    fn on_post_remove(&self, _chain: &FilterChain, _name: &str) -> Result<()> {
        Err(SessionError::Other("refused".into()))
    }
}

#[test]
fn test_failed_post_remove_still_removes() {
    let session = session();
    let chain = session.chain();
    chain.add_last("sticky", Arc::new(RefusesPostRemove)).unwrap();

    assert!(chain.remove("sticky").is_ok());
    assert!(!chain.contains("sticky"));
    assert!(chain.is_empty());
}
