//! # Dispatcher - startup and the shutdown coordinator
//!
//! ```text
//!   SIGINT/SIGTERM ──► flag + eventfd ─┐
//!   StopHandle::stop ──► eventfd ──────┤
//!                                      ▼
//!   ┌──────────────── readiness thread ────────────────┐
//!   │ epoll_pwait ─► accept* ─► Task ─► queue.enqueue  │
//!   └──────────────────────────┬───────────────────────┘
//!                              ▼
//!   ┌──────── TaskQueue (Mutex + Condvar) ────────┐
//!   └──────┬──────────────┬──────────────┬────────┘
//!          ▼              ▼              ▼
//!      worker-0       worker-1  ...  worker-N-1   (handler, then close)
//! ```
//!
//! Shutdown, each step a precondition for the next:
//! 1. running flag cleared (readiness loop leaves its wait and returns)
//! 2. `shutting_down` set under the queue lock, all workers woken
//! 3. every worker joined (in-flight tasks finish first)
//! 4. remaining queued tasks drained and closed, never processed
//! 5. listener, epoll and eventfd closed
//!
//! Joining before draining means no queued task can be touched by both a
//! worker and the drain.

use crate::listener::bind_listener;
use crate::poller::Poller;
use crate::pool::{PoolStats, ProcessFn, WorkerPool};
use crate::readiness::{LoopCounters, LoopStats, ReadinessLoop};
use crate::run_flag::{RunFlag, StopHandle};
use crate::signal;

use dispatch_core::handler::ConnectionHandler;
use dispatch_core::queue::TaskQueue;
use dispatch_core::task::Task;
use dispatch_core::{DispatchConfig, DispatchError, Result, SERVER_NAME};

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::thread::JoinHandleExt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// What happened over the dispatcher's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub readiness: LoopStats,
    pub workers: PoolStats,
    /// Workers joined during shutdown
    pub workers_joined: usize,
    /// Queued tasks closed without processing
    pub drained: usize,
}

/// A bound, not yet running dispatcher.
///
/// Construction performs all fallible OS setup (socket, epoll, eventfd);
/// nothing is spawned until `run` or `spawn`.
pub struct Dispatcher {
    config: DispatchConfig,
    listener: TcpListener,
    poller: Poller,
    run: Arc<RunFlag>,
    queue: Arc<TaskQueue<Task>>,
    handler: Arc<dyn ConnectionHandler>,
    watch_signals: bool,
}

impl Dispatcher {
    /// Validate `config`, bind the listener and create the poller.
    ///
    /// On failure everything acquired so far is closed before returning.
    pub fn bind<H: ConnectionHandler>(config: DispatchConfig, handler: H) -> Result<Self> {
        config.validate()?;
        let listener = bind_listener(&config)?;
        let poller = Poller::new(config.event_batch).map_err(DispatchError::Poller)?;
        let run = RunFlag::new().map_err(DispatchError::Waker)?;
        let queue = Arc::new(TaskQueue::with_capacity(config.max_queue_depth));

        Ok(Self {
            config,
            listener,
            poller,
            run,
            queue,
            handler: Arc::new(handler),
            watch_signals: false,
        })
    }

    /// Install SIGINT/SIGTERM handling; either signal stops the dispatcher.
    ///
    /// Works with both `run` and `spawn`, whichever thread the signal is
    /// delivered to. Termination is process-wide and never reset: once a
    /// signal has arrived, any dispatcher started with `handle_signals`
    /// stops immediately without serving.
    pub fn handle_signals(mut self) -> Result<Self> {
        signal::install_termination_handler().map_err(DispatchError::Signal)?;
        self.watch_signals = true;
        Ok(self)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(Arc::clone(&self.run))
    }

    /// Run on the calling thread until stopped, then shut down.
    pub fn run(self) -> Result<ShutdownReport> {
        let (pool, readiness) = self.start()?;
        let coordinator = ShutdownCoordinator { pool, readiness };
        Ok(coordinator.run_to_completion())
    }

    /// Run the readiness loop on its own thread.
    ///
    /// Workers are spawned before this returns, so a pool failure is
    /// reported here and no readiness thread is started.
    pub fn spawn(self) -> Result<RunningDispatcher> {
        let stop = self.stop_handle();
        let queue = Arc::clone(&self.queue);
        let local_addr = self.local_addr()?;
        let (pool, readiness) = self.start()?;
        let counters = readiness.counters();

        let coordinator = ShutdownCoordinator { pool, readiness };
        let thread = thread::Builder::new()
            .name("dispatch-readiness".into())
            .spawn(move || coordinator.run_to_completion())
            .map_err(DispatchError::Io)?;

        Ok(RunningDispatcher {
            stop,
            queue,
            counters,
            local_addr,
            thread,
        })
    }

    fn start(self) -> Result<(WorkerPool<Task>, ReadinessLoop)> {
        let local = self.listener.local_addr()?;
        tracing::info!(
            server = SERVER_NAME,
            addr = %local,
            workers = self.config.workers,
            event_batch = self.config.event_batch,
            max_queue = ?self.config.max_queue_depth,
            handler = self.handler.name(),
            "server starting"
        );

        let handler = Arc::clone(&self.handler);
        let process: Arc<ProcessFn<Task>> = Arc::new(move |task: &mut Task| {
            let (stream, peer) = task.parts_mut();
            handler.handle(stream, peer)
        });
        let pool = WorkerPool::spawn("dispatch", self.config.workers, Arc::clone(&self.queue), process)?;

        let readiness = ReadinessLoop::new(self.listener, self.poller, self.run, self.queue)?
            .watch_signals(self.watch_signals)?;
        Ok((pool, readiness))
    }
}

/// Owns everything that must be torn down, in order.
struct ShutdownCoordinator {
    pool: WorkerPool<Task>,
    readiness: ReadinessLoop,
}

impl ShutdownCoordinator {
    fn run_to_completion(mut self) -> ShutdownReport {
        let readiness = match self.readiness.run() {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(error = %e, "readiness loop failed, shutting down");
                self.readiness.counters().snapshot()
            }
        };
        tracing::info!("shutdown signal received");
        self.shutdown(readiness)
    }

    fn shutdown(self, readiness: LoopStats) -> ShutdownReport {
        let Self { mut pool, readiness: rl } = self;
        let queue = Arc::clone(pool.queue());

        // 1. Running flag (no-op if the loop already saw it cleared)
        rl.run_flag().stop();

        // 2 + 3. shutting_down under the lock, wake all, join all
        let workers_joined = pool.shutdown();
        debug_assert_eq!(pool.live_workers(), 0);

        // 4. Only now is the queue ours alone
        let drained = queue.drain_with(|task| {
            tracing::debug!(task = %task.id(), peer = %task.peer(), "discarding unprocessed task");
            task.release();
        });
        if drained > 0 {
            tracing::info!(drained, "closed queued connections without processing");
        }

        // 5. Listener, epoll, eventfd
        rl.close();

        let report = ShutdownReport {
            readiness,
            workers: pool.stats(),
            workers_joined,
            drained,
        };
        tracing::info!(?report, "server closed");
        report
    }
}

/// Dispatcher running on a background readiness thread.
pub struct RunningDispatcher {
    stop: StopHandle,
    queue: Arc<TaskQueue<Task>>,
    counters: Arc<LoopCounters>,
    local_addr: SocketAddr,
    thread: JoinHandle<ShutdownReport>,
}

impl RunningDispatcher {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Tasks waiting for a worker
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }

    pub fn loop_stats(&self) -> LoopStats {
        self.counters.snapshot()
    }

    /// pthread id of the readiness thread (for directed signals)
    pub fn readiness_thread(&self) -> libc::pthread_t {
        self.thread.as_pthread_t()
    }

    /// Request shutdown and wait for it to complete.
    pub fn shutdown(self) -> Result<ShutdownReport> {
        self.stop.stop();
        self.join()
    }

    /// Wait for the dispatcher to stop on its own (signal or stop handle).
    pub fn join(self) -> Result<ShutdownReport> {
        self.thread.join().map_err(|_| {
            DispatchError::Io(io::Error::other("readiness thread panicked"))
        })
    }
}
