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

//! Messages flowing through a filter chain

use crate::IoBuffer;
use bytes::Bytes;
use std::any::Any;
use std::fmt;

/// A message travelling through a filter chain
///
/// Transports produce and consume [`Message::Buffer`]; codec filters turn
/// buffers into typed application objects and back.
pub enum Message {
    /// Raw bytes
    Buffer(IoBuffer),
    /// A decoded application object
    Object(Box<dyn Any + Send + Sync>),
}

impl Message {
    /// Create a buffer message
    pub fn buffer(data: impl Into<Bytes>) -> Self {
        Message::Buffer(IoBuffer::new(data))
    }

    /// Create an object message
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Message::Object(Box::new(value))
    }

    /// Create an empty buffer message
    pub fn empty() -> Self {
        Message::Buffer(IoBuffer::empty())
    }

    /// Check if this is a buffer message
    pub fn is_buffer(&self) -> bool {
        matches!(self, Message::Buffer(_))
    }

    /// Borrow the buffer, if this is a buffer message
    pub fn as_buffer(&self) -> Option<&IoBuffer> {
        match self {
            Message::Buffer(buf) => Some(buf),
            Message::Object(_) => None,
        }
    }

    /// Mutably borrow the buffer, if this is a buffer message
    pub fn as_buffer_mut(&mut self) -> Option<&mut IoBuffer> {
        match self {
            Message::Buffer(buf) => Some(buf),
            Message::Object(_) => None,
        }
    }

    /// Take the buffer out of the message
    pub fn into_buffer(self) -> Result<IoBuffer, Self> {
        match self {
            Message::Buffer(buf) => Ok(buf),
            other => Err(other),
        }
    }

    /// Borrow the object as `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Message::Object(object) => object.downcast_ref::<T>(),
            Message::Buffer(_) => None,
        }
    }

    /// Take the object out of the message as `T`
    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        match self {
            Message::Object(object) => match object.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(object) => Err(Message::Object(object)),
            },
            other => Err(other),
        }
    }
}

impl From<IoBuffer> for Message {
    fn from(buf: IoBuffer) -> Self {
        Message::Buffer(buf)
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Message::buffer(data)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::buffer(data)
    }
}

impl From<&'static [u8]> for Message {
    fn from(data: &'static [u8]) -> Self {
        Message::Buffer(IoBuffer::from(data))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Buffer(buf) => f.debug_tuple("Buffer").field(buf).finish(),
            Message::Object(_) => f.write_str("Object(..)"),
        }
    }
}
