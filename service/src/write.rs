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

//! Write requests and the per-session write queue
//!
//! A [`WriteRequest`] is created by [`Session::write`](crate::Session::write)
//! and travels toward the transport through the filter chain. Filters that
//! change the payload wrap the request; every wrapper shares the original's
//! [`WriteFuture`] and keeps a link back to it so failures can be reported
//! once per original request. Parts produced by a split also share a count
//! of parts still in flight; the future is written only once the last part
//! has been flushed.

use crate::{IoBuffer, Message, WriteError, WriteFuture};
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// An outbound message with its completion future
#[derive(Debug)]
pub struct WriteRequest {
    id: u64,
    message: Message,
    destination: Option<SocketAddr>,
    future: WriteFuture,
    parent: Option<Arc<WriteRequest>>,
    tag: Option<u64>,
    parts: Option<Arc<AtomicUsize>>,
}

impl WriteRequest {
    /// Create a request with a fresh future
    pub fn new(message: Message) -> Self {
        Self::with_future(message, WriteFuture::new())
    }

    /// Create a request completing `future`
    pub fn with_future(message: Message, future: WriteFuture) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            message,
            destination: None,
            future,
            parent: None,
            tag: None,
            parts: None,
        }
    }

    /// Set the destination for connectionless transports
    pub fn with_destination(mut self, destination: SocketAddr) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Unique id of this request instance
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The payload
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The payload, mutably
    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    /// Take the payload, leaving an empty buffer in its place
    pub fn take_message(&mut self) -> Message {
        std::mem::replace(&mut self.message, Message::empty())
    }

    /// Destination address, if any
    pub fn destination(&self) -> Option<SocketAddr> {
        self.destination
    }

    /// The completion future shared with every wrapper of this request
    pub fn future(&self) -> &WriteFuture {
        &self.future
    }

    /// The request this one wraps, if any
    pub fn parent(&self) -> Option<&Arc<WriteRequest>> {
        self.parent.as_ref()
    }

    /// Tag set by the filter that created this wrapper
    pub fn tag(&self) -> Option<u64> {
        self.tag
    }

    /// Walk the wrapper links to the innermost request
    pub fn original(&self) -> &WriteRequest {
        let mut current = self;
        while let Some(parent) = current.parent.as_deref() {
            current = parent;
        }
        current
    }

    /// Id of the innermost request
    pub fn original_id(&self) -> u64 {
        self.original().id
    }

    /// Check if this request wraps another one
    pub fn is_wrapped(&self) -> bool {
        self.parent.is_some()
    }

    /// Parts of the original request not yet flushed
    ///
    /// Always 1 for a request that was never split.
    pub fn pending_parts(&self) -> usize {
        self.parts
            .as_ref()
            .map_or(1, |parts| parts.load(Ordering::Acquire))
    }

    /// Account for this part being flushed
    ///
    /// Returns `true` when it was the last part of its original request.
    pub(crate) fn finish_part(&self) -> bool {
        match &self.parts {
            Some(parts) => parts.fetch_sub(1, Ordering::AcqRel) == 1,
            None => true,
        }
    }

    /// Wrap this request around a transformed payload
    pub fn wrap(self, message: Message) -> WriteRequest {
        self.wrap_tagged(message, None)
    }

    /// Wrap this request, tagging the wrapper so the wrapping filter can recognise it later
    pub fn wrap_tagged(self, message: Message, tag: Option<u64>) -> WriteRequest {
        let future = self.future.clone();
        let destination = self.destination;
        let parts = self.parts.clone();
        WriteRequest {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            message,
            destination,
            future,
            parent: Some(Arc::new(self)),
            tag,
            parts,
        }
    }

    /// Split this request into several wrappers sharing one original
    ///
    /// The original's future is written once every part has been flushed
    /// and fails as soon as any part fails. Splitting into no parts counts
    /// as flushing this one.
    pub fn split(self, messages: Vec<Message>) -> Vec<WriteRequest> {
        let count = messages.len();
        if count == 0 {
            if self.finish_part() {
                self.future.set_written();
            }
            return Vec::new();
        }
        let parts = match &self.parts {
            Some(parts) => {
                parts.fetch_add(count - 1, Ordering::AcqRel);
                parts.clone()
            }
            None => Arc::new(AtomicUsize::new(count)),
        };
        let future = self.future.clone();
        let destination = self.destination;
        let parent = Arc::new(self);
        messages
            .into_iter()
            .map(|message| WriteRequest {
                id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
                message,
                destination,
                future: future.clone(),
                parent: Some(parent.clone()),
                tag: None,
                parts: Some(parts.clone()),
            })
            .collect()
    }

    /// Restore the payload buffer to the checkpoint taken when it left the queue
    ///
    /// Returns `false` when the payload is not a buffer or was never checkpointed.
    pub fn rewind(&mut self) -> bool {
        self.message
            .as_buffer_mut()
            .map(IoBuffer::reset)
            .unwrap_or(false)
    }

    fn checkpoint(&mut self) {
        if let Some(buffer) = self.message.as_buffer_mut() {
            buffer.mark();
        }
    }
}

/// Fail every request, resolving each distinct original request once
///
/// Returns the number of distinct original requests that were failed.
pub fn fail_all<I>(requests: I, error: &WriteError) -> usize
where
    I: IntoIterator,
    I::Item: std::borrow::Borrow<WriteRequest>,
{
    use std::borrow::Borrow;
    let mut seen = HashSet::new();
    for request in requests {
        let request: &WriteRequest = request.borrow();
        if seen.insert(request.original_id()) {
            request.future().set_failed(error.clone());
        }
    }
    seen.len()
}

/// FIFO queue of pending write requests
#[derive(Debug, Default)]
pub struct WriteRequestQueue {
    requests: Mutex<VecDeque<WriteRequest>>,
    disposed: AtomicBool,
}

impl WriteRequestQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<WriteRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a request to the tail
    ///
    /// A disposed queue hands the request back.
    pub fn offer(&self, request: WriteRequest) -> Result<(), WriteRequest> {
        let mut requests = self.lock();
        if self.disposed.load(Ordering::Acquire) {
            return Err(request);
        }
        requests.push_back(request);
        Ok(())
    }

    /// Put a request back at the head, ahead of everything queued
    pub fn offer_front(&self, request: WriteRequest) -> Result<(), WriteRequest> {
        let mut requests = self.lock();
        if self.disposed.load(Ordering::Acquire) {
            return Err(request);
        }
        requests.push_front(request);
        Ok(())
    }

    /// Remove the head request
    ///
    /// A buffer payload is checkpointed as it leaves the queue; the thread
    /// that dequeued it owns the cursor from here on and may
    /// [`rewind`](WriteRequest::rewind) it after a failed flush.
    pub fn poll(&self) -> Option<WriteRequest> {
        let mut request = self.lock().pop_front()?;
        request.checkpoint();
        Some(request)
    }

    /// Check if no requests are pending
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of pending requests
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Drop every pending request without resolving its future
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Remove and return every pending request
    pub fn drain(&self) -> Vec<WriteRequest> {
        self.lock().drain(..).collect()
    }

    /// Refuse further requests and return whatever was still pending
    ///
    /// Idempotent; calls after the first return nothing.
    pub fn dispose(&self) -> Vec<WriteRequest> {
        let mut requests = self.lock();
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        requests.drain(..).collect()
    }

    /// Check if the queue has been disposed
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}
