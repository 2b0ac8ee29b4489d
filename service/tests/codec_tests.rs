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

//! Protocol codec filter tests

use bytes::{Bytes, BytesMut};
use relaygate_service::{
    CodecError, IoHandler, IoProcessor, IoWorker, Message, ProtocolCodecFilter, Session,
    SessionBuilder, SessionConfig, SessionError, WriteRequest,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::codec::{Decoder, Encoder, LinesCodec};

const TIMEOUT: Duration = Duration::from_secs(10);

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(2));
    }
}

#[derive(Default)]
struct WireProcessor {
    wire: Mutex<Vec<Bytes>>,
}

impl IoProcessor for WireProcessor {
    fn name(&self) -> &'static str {
        "wire"
    }

    fn flush(&self, session: &Arc<Session>) {
        while let Some(request) = session.write_queue().poll() {
            let bytes = request
                .message()
                .as_buffer()
                .map(|buffer| buffer.to_bytes())
                .unwrap_or_default();
            let written = bytes.len();
            self.wire.lock().unwrap().push(bytes);
            session.complete_write(request, written);
        }
    }

    fn close(&self, session: &Arc<Session>) {
        session.transport_closed();
    }
}

#[derive(Default)]
struct LineHandler {
    lines: Mutex<Vec<String>>,
    errors: Mutex<Vec<SessionError>>,
    sent: Mutex<Vec<String>>,
}

impl LineHandler {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl IoHandler for LineHandler {
    fn message_received(&self, _session: &Arc<Session>, message: Message) {
        match message.downcast::<String>() {
            Ok(line) => self.lines.lock().unwrap().push(line),
            Err(other) => panic!("undecoded message reached the handler: {:?}", other),
        }
    }

    fn message_sent(&self, _session: &Arc<Session>, request: &WriteRequest) {
        assert!(!request.is_wrapped(), "handler sees its own request");
        if let Some(line) = request.message().downcast_ref::<String>() {
            self.sent.lock().unwrap().push(line.clone());
        }
    }

    fn exception_caught(&self, session: &Arc<Session>, error: SessionError) {
        let recoverable = error.is_recoverable();
        self.errors.lock().unwrap().push(error);
        if !recoverable {
            session.close_now();
        }
    }
}

fn session_with<C>(codec: C) -> (Arc<Session>, Arc<LineHandler>, Arc<WireProcessor>)
where
    C: Decoder<Item = String> + Encoder<String> + Clone + Send + Sync + 'static,
    <C as Decoder>::Error: Into<CodecError>,
    <C as Encoder<String>>::Error: Into<CodecError>,
{
    let handler = Arc::new(LineHandler::default());
    let processor = Arc::new(WireProcessor::default());
    let session = SessionBuilder::new(
        IoWorker::spawn("codec-test").unwrap(),
        handler.clone(),
        processor.clone(),
    )
    .with_config(SessionConfig::new().with_assert_alignment(false))
    .build();
    session
        .chain()
        .add_last("lines", Arc::new(ProtocolCodecFilter::<_, String>::new(codec)))
        .unwrap();
    session.fire_session_opened();
    (session, handler, processor)
}

#[test]
fn test_decodes_across_fragmented_reads() {
    let (session, handler, _processor) = session_with(LinesCodec::new());
    for fragment in [&b"hel"[..], b"lo\nwor", b"ld\n", b"tail"] {
        session.fire_message_received(Message::from(fragment));
    }
    wait_until(|| handler.lines().len() == 2);
    assert_eq!(handler.lines(), vec!["hello", "world"]);

    // The partial line is flushed when the session closes
    session.close_now().wait_timeout(TIMEOUT).unwrap();
    assert_eq!(handler.lines(), vec!["hello", "world", "tail"]);
}

#[test]
fn test_recoverable_error_keeps_session_open() {
    let (session, handler, _processor) = session_with(LinesCodec::new_with_max_length(8));
    session.fire_message_received(Message::from(&b"this line is too long\nok\n"[..]));
    wait_until(|| handler.lines() == vec!["ok"]);

    let errors = handler.errors.lock().unwrap().clone();
    assert!(matches!(
        errors.as_slice(),
        [SessionError::Decode { recoverable: true, .. }]
    ));
    assert!(session.is_open());
}

/// Line codec treating lines that start with `!` as unrecoverable
#[derive(Clone, Default)]
struct StrictLines {
    inner: LinesCodec,
}

impl Decoder for StrictLines {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, CodecError> {
        match self.inner.decode(src)? {
            Some(line) if line.starts_with('!') => Err(CodecError::Fatal(line)),
            other => Ok(other),
        }
    }
}

impl Encoder<String> for StrictLines {
    type Error = CodecError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), CodecError> {
        self.inner.encode(item, dst).map_err(CodecError::from)
    }
}

#[test]
fn test_fatal_error_closes_session() {
    let (session, handler, _processor) = session_with(StrictLines::default());
    session.fire_message_received(Message::from(&b"good\n!bad\nnever\n"[..]));

    assert_eq!(session.close_future().wait_timeout(TIMEOUT), Some(()));
    assert_eq!(handler.lines(), vec!["good"]);
    let errors = handler.errors.lock().unwrap().clone();
    assert!(matches!(
        errors.as_slice(),
        [SessionError::Decode { recoverable: false, message }] if message.contains("!bad")
    ));
}

#[test]
fn test_encodes_items_and_passes_buffers_through() {
    let (session, handler, processor) = session_with(LinesCodec::new());

    let line = session.write(Message::object(String::from("hello")));
    let raw = session.write(&b"raw"[..]);
    assert_eq!(line.wait_timeout(TIMEOUT), Some(Ok(())));
    assert_eq!(raw.wait_timeout(TIMEOUT), Some(Ok(())));

    assert_eq!(*processor.wire.lock().unwrap(), vec!["hello\n", "raw"]);
    wait_until(|| handler.sent.lock().unwrap().len() == 1);
    assert_eq!(*handler.sent.lock().unwrap(), vec!["hello"]);
}
