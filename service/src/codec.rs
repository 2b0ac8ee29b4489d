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

//! Protocol codec filter
//!
//! [`ProtocolCodecFilter`] plugs any `tokio_util` codec into a filter
//! chain. Inbound buffers are accumulated per session and decoded into
//! application objects; outbound objects of the codec's item type are
//! encoded into buffers. The codec itself classifies decode failures
//! through [`CodecError`]: a recoverable failure is reported and decoding
//! continues, a fatal one is reported and the rest of the input is dropped
//! (the default handler then closes the session).
//!
//! # Example
//!
//! ```
//! use relaygate_service::ProtocolCodecFilter;
//! use std::sync::Arc;
//! use tokio_util::codec::LinesCodec;
//!
//! let lines = Arc::new(ProtocolCodecFilter::<_, String>::new(LinesCodec::new_with_max_length(1024)));
//! // session.chain().add_last("lines", lines)?;
//! ```

use crate::{
    AttributeKey, FilterChain, IoBuffer, IoFilter, Message, NextFilter, Result, Session,
    SessionError, WriteError, WriteRequest,
};
use bytes::BytesMut;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LinesCodecError};

static NEXT_CODEC_ID: AtomicU64 = AtomicU64::new(1);

/// Codec failure, classified by whether the session can continue
#[derive(Debug, Error)]
pub enum CodecError {
    /// Bad input was skipped; the session continues
    #[error("Recoverable codec error: {0}")]
    Recoverable(String),

    /// The stream cannot be decoded any further
    #[error("Fatal codec error: {0}")]
    Fatal(String),

    /// I/O error raised by the codec
    #[error("Codec I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Check if decoding can continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::Recoverable(_))
    }

    /// Convert into the session error carried by `exception_caught`
    pub fn into_decode_error(self) -> SessionError {
        SessionError::Decode {
            recoverable: self.is_recoverable(),
            message: self.to_string(),
        }
    }
}

impl From<LinesCodecError> for CodecError {
    fn from(error: LinesCodecError) -> Self {
        match error {
            LinesCodecError::MaxLineLengthExceeded => {
                CodecError::Recoverable("line length limit exceeded".into())
            }
            LinesCodecError::Io(error) => CodecError::Io(error),
        }
    }
}

struct CodecState<C> {
    codec: C,
    pending: BytesMut,
}

type SharedState<C> = Arc<Mutex<CodecState<C>>>;

/// Filter adapting a `Decoder` + `Encoder<I>` pair
///
/// `C` is cloned once per session; `I` is the outbound item type that the
/// filter encodes. Outbound messages of any other type pass through.
pub struct ProtocolCodecFilter<C, I> {
    id: u64,
    codec: C,
    state: AttributeKey<SharedState<C>>,
    _item: PhantomData<fn(I)>,
}

impl<C, I> ProtocolCodecFilter<C, I>
where
    C: Decoder + Encoder<I> + Clone + Send + Sync + 'static,
    <C as Decoder>::Item: Any + Send + Sync,
    <C as Decoder>::Error: Into<CodecError>,
    <C as Encoder<I>>::Error: Into<CodecError>,
    I: Any + Clone + Send + Sync,
{
    /// Create a filter using `codec` as the per-session prototype
    pub fn new(codec: C) -> Self {
        let id = NEXT_CODEC_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            codec,
            state: AttributeKey::named(format!("relaygate.codec.{}", id)),
            _item: PhantomData,
        }
    }

    fn session_state(&self, session: &Session) -> SharedState<C> {
        session.attributes().get_or_insert_with(&self.state, || {
            Arc::new(Mutex::new(CodecState {
                codec: self.codec.clone(),
                pending: BytesMut::new(),
            }))
        })
    }

    /// Decode as much of `pending` as possible
    ///
    /// Runs with the state locked; events are fired by the caller afterwards
    /// so a re-entrant chain cannot deadlock on the codec state.
    fn decode_all(
        state: &mut CodecState<C>,
        eof: bool,
    ) -> Vec<std::result::Result<<C as Decoder>::Item, CodecError>> {
        let CodecState { codec, pending } = state;
        let mut results = Vec::new();
        let mut stalled = false;
        loop {
            let before = pending.len();
            let result = if eof {
                codec.decode_eof(pending)
            } else {
                codec.decode(pending)
            };
            match result {
                Ok(Some(item)) => {
                    stalled = false;
                    results.push(Ok(item));
                }
                Ok(None) => break,
                Err(error) => {
                    let error: CodecError = error.into();
                    let recoverable = error.is_recoverable();
                    results.push(Err(error));
                    if !recoverable {
                        pending.clear();
                        break;
                    }
                    // Give the codec one more pass to resynchronise
                    if pending.len() == before {
                        if stalled {
                            break;
                        }
                        stalled = true;
                    }
                }
            }
        }
        results
    }

    fn deliver(
        next: &NextFilter,
        session: &Arc<Session>,
        results: Vec<std::result::Result<<C as Decoder>::Item, CodecError>>,
    ) {
        for result in results {
            match result {
                Ok(item) => next.message_received(session, Message::object(item)),
                Err(error) => {
                    tracing::debug!(session_id = %session.id(), error = %error, "Decode failed");
                    next.exception_caught(session, error.into_decode_error());
                }
            }
        }
    }
}

impl<C, I> IoFilter for ProtocolCodecFilter<C, I>
where
    C: Decoder + Encoder<I> + Clone + Send + Sync + 'static,
    <C as Decoder>::Item: Any + Send + Sync,
    <C as Decoder>::Error: Into<CodecError>,
    <C as Encoder<I>>::Error: Into<CodecError>,
    I: Any + Clone + Send + Sync,
{
    fn on_post_remove(&self, chain: &FilterChain, _name: &str) -> Result<()> {
        if let Some(session) = chain.session() {
            session.attributes().remove(&self.state);
        }
        Ok(())
    }

    fn message_received(&self, next: &NextFilter, session: &Arc<Session>, message: Message) {
        let buffer = match message {
            Message::Buffer(buffer) => buffer,
            other => return next.message_received(session, other),
        };
        let state = self.session_state(session);
        let results = {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            state.pending.extend_from_slice(buffer.as_slice());
            Self::decode_all(&mut state, false)
        };
        Self::deliver(next, session, results);
    }

    fn session_closed(&self, next: &NextFilter, session: &Arc<Session>) {
        if let Some(state) = session.attributes().remove(&self.state) {
            let results = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                Self::decode_all(&mut state, true)
            };
            Self::deliver(next, session, results);
        }
        next.session_closed(session);
    }

    fn filter_write(&self, next: &NextFilter, session: &Arc<Session>, request: WriteRequest) {
        let Some(item) = request.message().downcast_ref::<I>().cloned() else {
            return next.filter_write(session, request);
        };
        let state = self.session_state(session);
        let mut encoded = BytesMut::new();
        let result = {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            state.codec.encode(item, &mut encoded)
        };
        match result {
            Ok(()) => {
                let buffer = Message::Buffer(IoBuffer::new(encoded.freeze()));
                next.filter_write(session, request.wrap_tagged(buffer, Some(self.id)));
            }
            Err(error) => {
                let error: CodecError = error.into();
                session.fail_write(request, WriteError::Rejected(error.to_string()));
                session.fire_exception_caught(SessionError::Encode(error.to_string()));
            }
        }
    }

    fn message_sent(&self, next: &NextFilter, session: &Arc<Session>, request: Arc<WriteRequest>) {
        match request.parent() {
            Some(parent) if request.tag() == Some(self.id) => {
                next.message_sent(session, parent.clone())
            }
            _ => next.message_sent(session, request),
        }
    }
}

impl<C, I> fmt::Debug for ProtocolCodecFilter<C, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolCodecFilter")
            .field("id", &self.id)
            .field("codec", &std::any::type_name::<C>())
            .finish()
    }
}
