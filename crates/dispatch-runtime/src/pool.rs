//! Worker pool - N OS threads draining the task queue
//!
//! Workers block in `TaskQueue::dequeue_blocking` and exit when it returns
//! `Stop`. Each dequeued task is passed to the processing function and
//! dropped afterwards no matter what the function did, including panic.
//!
//! No dynamic scaling. The pool size is fixed at spawn time.

use crate::signal::BlockedSignals;
use dispatch_core::error::HandlerError;
use dispatch_core::queue::{Dequeued, TaskQueue};
use dispatch_core::{DispatchError, Result};

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Processing function invoked by workers. Borrowed access only; the
/// worker owns and releases the task.
pub type ProcessFn<T> = dyn Fn(&mut T) -> std::result::Result<(), HandlerError> + Send + Sync;

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

/// Snapshot of worker outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks whose processing returned `Ok`
    pub processed: u64,
    /// Tasks whose processing returned `Err`
    pub failed: u64,
    /// Tasks whose processing panicked
    pub panicked: u64,
}

impl PoolStats {
    /// Every task a worker claimed, whatever the outcome
    pub fn claimed(&self) -> u64 {
        self.processed + self.failed + self.panicked
    }
}

/// Shared state between the pool handle and its workers.
struct PoolShared<T> {
    queue: Arc<TaskQueue<T>>,
    process: Arc<ProcessFn<T>>,
    /// Workers that have not yet returned from their loop
    live: AtomicUsize,
    counters: Counters,
}

pub struct WorkerPool<T> {
    shared: Arc<PoolShared<T>>,
    handles: Vec<JoinHandle<()>>,
    size: usize,
}

impl<T: Send + fmt::Debug + 'static> WorkerPool<T> {
    /// Spawn `size` workers named `{name}-worker-{i}`.
    ///
    /// Workers start with SIGINT/SIGTERM blocked. If any spawn fails, the
    /// workers already running are stopped and joined before returning.
    pub fn spawn(
        name: &str,
        size: usize,
        queue: Arc<TaskQueue<T>>,
        process: Arc<ProcessFn<T>>,
    ) -> Result<Self> {
        if size == 0 {
            return Err(DispatchError::Config("workers must be at least 1"));
        }

        let shared = Arc::new(PoolShared {
            queue,
            process,
            live: AtomicUsize::new(0),
            counters: Counters::default(),
        });
        let mut pool = Self {
            shared,
            handles: Vec::with_capacity(size),
            size,
        };

        let _blocked = BlockedSignals::termination().map_err(DispatchError::Signal)?;
        for id in 0..size {
            let shared = Arc::clone(&pool.shared);
            shared.live.fetch_add(1, Ordering::AcqRel);
            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{}", name, id))
                .spawn(move || worker_loop(shared, id));
            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(source) => {
                    pool.shared.live.fetch_sub(1, Ordering::AcqRel);
                    tracing::error!(worker = id, error = %source, "worker spawn failed");
                    pool.shutdown();
                    return Err(DispatchError::WorkerSpawn { id, source });
                }
            }
        }

        tracing::debug!(workers = size, "worker pool started");
        Ok(pool)
    }
}

impl<T> WorkerPool<T> {
    /// Configured pool size
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers still inside their loop
    #[inline]
    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            processed: c.processed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue<T>> {
        &self.shared.queue
    }

    /// Set `shutting_down` on the queue, wake everyone and join every worker.
    ///
    /// Blocks until in-flight processing has finished. Does not drain the
    /// queue. Returns the number of workers joined; 0 on repeat calls.
    pub fn shutdown(&mut self) -> usize {
        self.shared.queue.begin_shutdown();
        let mut joined = 0;
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                tracing::error!(worker = ?name, "worker terminated abnormally");
            }
            joined += 1;
        }
        joined
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Worker thread main loop.
fn worker_loop<T: fmt::Debug>(shared: Arc<PoolShared<T>>, id: usize) {
    tracing::debug!(worker = id, "worker started");

    while let Dequeued::Task(mut task) = shared.queue.dequeue_blocking() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (shared.process)(&mut task)));
        match outcome {
            Ok(Ok(())) => {
                shared.counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(worker = id, ?task, error = %e, "processing failed");
            }
            Err(payload) => {
                shared.counters.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    worker = id,
                    ?task,
                    panic = panic_message(payload.as_ref()),
                    "processing panicked"
                );
            }
        }
        drop(task);
    }

    shared.live.fetch_sub(1, Ordering::AcqRel);
    tracing::debug!(worker = id, "worker exiting");
}
