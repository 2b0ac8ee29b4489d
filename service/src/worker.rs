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

//! I/O worker threads
//!
//! An [`IoWorker`] is a single OS thread draining an unbounded task queue in
//! submission order. Every session is assigned one worker at creation and
//! all of its filter chain callbacks run there. Workers are shared: one
//! worker serves many sessions, and the queue gives each of them FIFO
//! execution without a per-session lock.
//!
//! The worker thread never dies because of a task: aligned chain tasks catch
//! callback panics themselves and plain tasks are wrapped here.

use crate::dispatch::AlignedTask;
use crate::{Result, SessionError, WorkerPoolConfig};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::mpsc;

/// Work submitted to a worker
pub(crate) enum WorkerTask {
    /// A chain event realigned onto the worker
    Aligned(AlignedTask),
    /// An arbitrary closure
    Run(Box<dyn FnOnce() + Send>),
    /// Stop accepting tasks, run what is queued, then exit
    Shutdown,
}

impl fmt::Debug for WorkerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerTask::Aligned(task) => f.debug_tuple("Aligned").field(task).finish(),
            WorkerTask::Run(_) => f.write_str("Run(..)"),
            WorkerTask::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// A single-threaded executor that sessions are aligned to
pub struct IoWorker {
    name: String,
    thread_id: ThreadId,
    sender: mpsc::UnboundedSender<WorkerTask>,
    accepting: AtomicBool,
    processed: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IoWorker {
    /// Spawn a worker thread with the given name
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Arc<Self>> {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let processed = Arc::new(AtomicU64::new(0));
        let counter = processed.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(receiver, counter))?;
        tracing::debug!(worker = %name, "I/O worker started");
        Ok(Arc::new(Self {
            name,
            thread_id: handle.thread().id(),
            sender,
            accepting: AtomicBool::new(true),
            processed,
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Worker thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the calling thread is this worker's thread
    #[inline]
    pub fn is_aligned(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Check if the worker still accepts tasks
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Number of tasks the worker has run
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Run `task` on the worker thread after everything already queued
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(WorkerTask::Run(Box::new(task)))
            .map_err(|_| SessionError::ExecutorUnavailable(self.name.clone()))
    }

    /// Queue a task, handing it back if the worker no longer accepts work
    pub(crate) fn submit(&self, task: WorkerTask) -> std::result::Result<(), WorkerTask> {
        if !self.is_accepting() {
            return Err(task);
        }
        self.sender.send(task).map_err(|error| error.0)
    }

    /// Stop accepting tasks
    ///
    /// Tasks queued before the call still run. Later submissions fail with
    /// [`SessionError::ExecutorUnavailable`].
    pub fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            let _ = self.sender.send(WorkerTask::Shutdown);
            tracing::debug!(worker = %self.name, "I/O worker shutting down");
        }
    }

    /// Wait for the worker thread to exit
    ///
    /// Does nothing when called from the worker itself.
    pub fn join(&self) {
        if self.is_aligned() {
            return;
        }
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            tracing::error!(worker = %self.name, "I/O worker thread panicked");
        }
    }
}

fn run(mut receiver: mpsc::UnboundedReceiver<WorkerTask>, processed: Arc<AtomicU64>) {
    while let Some(task) = receiver.blocking_recv() {
        match task {
            WorkerTask::Aligned(task) => task.run(),
            WorkerTask::Run(task) => {
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    tracing::error!("Worker task panicked");
                }
            }
            WorkerTask::Shutdown => {
                receiver.close();
                continue;
            }
        }
        processed.fetch_add(1, Ordering::Relaxed);
    }
    tracing::debug!("I/O worker stopped");
}

impl fmt::Debug for IoWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoWorker")
            .field("name", &self.name)
            .field("accepting", &self.is_accepting())
            .field("processed", &self.processed())
            .finish()
    }
}

/// A fixed set of workers handing out sessions round-robin
pub struct IoWorkerPool {
    workers: Vec<Arc<IoWorker>>,
    next: AtomicUsize,
}

impl IoWorkerPool {
    /// Spawn `config.size` workers
    pub fn new(config: &WorkerPoolConfig) -> std::io::Result<Self> {
        let workers = (0..config.size.max(1))
            .map(|index| IoWorker::spawn(format!("{}-{}", config.thread_name, index)))
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    /// The worker the next session should be aligned to
    pub fn next_worker(&self) -> Arc<IoWorker> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].clone()
    }

    /// All workers in the pool
    pub fn workers(&self) -> &[Arc<IoWorker>] {
        &self.workers
    }

    /// Number of workers
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Always false; a pool has at least one worker
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Shut down every worker and wait for their threads
    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.shutdown();
        }
        for worker in &self.workers {
            worker.join();
        }
    }
}

impl fmt::Debug for IoWorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoWorkerPool")
            .field("workers", &self.workers)
            .finish()
    }
}
