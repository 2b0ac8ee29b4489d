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

//! Shareable byte buffer with a read cursor and a restore mark
//!
//! The bytes are reference counted and never copied when the buffer is
//! cloned. The cursor and the mark belong to whoever holds the buffer; a
//! write request's buffer is checkpointed by the write queue at the moment
//! the request is dequeued so that a failed flush can rewind it.

use bytes::{Buf, Bytes};
use std::fmt;

/// Byte buffer with position and mark
#[derive(Clone, Default, PartialEq, Eq)]
pub struct IoBuffer {
    data: Bytes,
    position: usize,
    mark: Option<usize>,
}

impl IoBuffer {
    /// Wrap bytes in a buffer positioned at the start
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            position: 0,
            mark: None,
        }
    }

    /// Create an empty buffer
    pub fn empty() -> Self {
        Self::default()
    }

    /// Current cursor position
    pub fn position(&self) -> usize {
        self.position
    }

    /// Total number of bytes, consumed or not
    pub fn limit(&self) -> usize {
        self.data.len()
    }

    /// Remember the current position
    pub fn mark(&mut self) {
        self.mark = Some(self.position);
    }

    /// The marked position, if any
    pub fn marked_position(&self) -> Option<usize> {
        self.mark
    }

    /// Move the cursor back to the mark
    ///
    /// Returns `false` if no mark has been set.
    pub fn reset(&mut self) -> bool {
        match self.mark {
            Some(mark) => {
                self.position = mark;
                true
            }
            None => false,
        }
    }

    /// The bytes between the cursor and the limit
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.position..]
    }

    /// The unconsumed bytes, without copying
    pub fn to_bytes(&self) -> Bytes {
        self.data.slice(self.position..)
    }
}

impl Buf for IoBuffer {
    fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    fn chunk(&self) -> &[u8] {
        self.as_slice()
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.remaining(),
            "cannot advance past the buffer limit ({} > {})",
            cnt,
            self.remaining()
        );
        self.position += cnt;
    }
}

impl From<Bytes> for IoBuffer {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<Vec<u8>> for IoBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&'static [u8]> for IoBuffer {
    fn from(data: &'static [u8]) -> Self {
        Self::new(Bytes::from_static(data))
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("position", &self.position)
            .field("limit", &self.data.len())
            .field("mark", &self.mark)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_reset() {
        let mut buf = IoBuffer::from(&b"hello world"[..]);
        buf.advance(2);
        assert!(!buf.reset());
        buf.mark();
        buf.advance(4);
        assert_eq!(buf.as_slice(), b" world");
        assert!(buf.reset());
        assert_eq!(buf.position(), 2);
        assert_eq!(buf.remaining(), 9);
    }

    #[test]
    fn test_clone_shares_bytes_not_cursor() {
        let mut a = IoBuffer::from(vec![1, 2, 3, 4]);
        let b = a.clone();
        a.advance(3);
        assert_eq!(a.remaining(), 1);
        assert_eq!(b.remaining(), 4);
        assert_eq!(a.to_bytes(), Bytes::from_static(&[4]));
    }

    #[test]
    #[should_panic(expected = "cannot advance")]
    fn test_advance_past_limit_panics() {
        let mut buf = IoBuffer::from(vec![1]);
        buf.advance(2);
    }
}
