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

//! Resolve-once completion futures
//!
//! An [`IoFuture`] is completed exactly once by the side performing the
//! operation and observed by any number of waiters. Waiters may block a
//! thread ([`IoFuture::wait_timeout`]), await from async code
//! ([`IoFuture::wait`]), or register a listener that runs on the completing
//! thread.

use crate::{Session, SessionError, WriteError};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

type Listener<T> = Box<dyn FnOnce(&T) + Send>;

struct Inner<T> {
    value: OnceLock<T>,
    listeners: Mutex<Vec<Listener<T>>>,
    condvar: Condvar,
    notify: Notify,
}

/// A completion cell resolved exactly once
pub struct IoFuture<T> {
    inner: Arc<Inner<T>>,
}

/// Outcome of a write request
pub type WriteFuture = IoFuture<std::result::Result<(), WriteError>>;

/// Completes when a session has fully closed
pub type CloseFuture = IoFuture<()>;

/// Outcome of a connect attempt
pub type ConnectFuture = IoFuture<std::result::Result<Arc<Session>, SessionError>>;

impl<T: Clone + Send + Sync + 'static> IoFuture<T> {
    /// Create an unresolved future
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                value: OnceLock::new(),
                listeners: Mutex::new(Vec::new()),
                condvar: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Create a future that is already resolved
    pub fn completed(value: T) -> Self {
        let future = Self::new();
        future.complete(value);
        future
    }

    /// Resolve the future
    ///
    /// Returns `false` if the future was already resolved, in which case
    /// `value` is discarded. Listeners run on the calling thread.
    pub fn complete(&self, value: T) -> bool {
        let listeners = {
            let mut listeners = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.inner.value.set(value).is_err() {
                return false;
            }
            std::mem::take(&mut *listeners)
        };
        self.inner.condvar.notify_all();
        self.inner.notify.notify_waiters();
        if let Some(value) = self.inner.value.get() {
            for listener in listeners {
                listener(value);
            }
        }
        true
    }

    /// Check if the future has been resolved
    pub fn is_done(&self) -> bool {
        self.inner.value.get().is_some()
    }

    /// Get the resolved value, if any
    pub fn get(&self) -> Option<T> {
        self.inner.value.get().cloned()
    }

    /// Run `listener` once the future resolves
    ///
    /// If the future is already resolved the listener runs immediately on
    /// the calling thread.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        {
            let mut listeners = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.inner.value.get().is_none() {
                listeners.push(Box::new(listener));
                return;
            }
        }
        if let Some(value) = self.inner.value.get() {
            listener(value);
        }
    }

    /// Block the calling thread until the future resolves or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let guard = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _guard = self
            .inner
            .condvar
            .wait_timeout_while(guard, timeout, |_| self.inner.value.get().is_none())
            .unwrap_or_else(PoisonError::into_inner);
        self.get()
    }

    /// Wait asynchronously for the future to resolve
    pub async fn wait(&self) -> T {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(value) = self.get() {
                return value;
            }
            notified.await;
        }
    }
}

impl WriteFuture {
    /// Mark the write as flushed
    pub fn set_written(&self) -> bool {
        self.complete(Ok(()))
    }

    /// Mark the write as failed
    pub fn set_failed(&self, error: WriteError) -> bool {
        self.complete(Err(error))
    }

    /// Check if the write completed successfully
    pub fn is_written(&self) -> bool {
        matches!(self.inner.value.get(), Some(Ok(())))
    }

    /// Get the failure, if the write failed
    pub fn error(&self) -> Option<WriteError> {
        match self.inner.value.get() {
            Some(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for IoFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for IoFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> IoFuture<T> {
    /// Check if two handles refer to the same future
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> fmt::Debug for IoFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoFuture")
            .field("done", &self.inner.value.get().is_some())
            .finish()
    }
}
