//! # Readiness loop - the single producer
//!
//! Runs on one dedicated thread:
//! 1. Waits on epoll (no timeout) for the listener or the stop eventfd
//! 2. On listener readiness, accepts until `WouldBlock`
//! 3. Wraps each connection in a `Task` and enqueues it
//! 4. Exits once the running flag is cleared, without waiting again
//!
//! `EINTR` while still running is not an error: the wait is re-entered.
//!
//! When accept fails with EMFILE/ENFILE the pending connection would keep
//! the level-triggered listener ready forever. The loop holds one spare
//! descriptor for that case: close it, accept and close the connection,
//! reopen the spare.

use crate::poller::{Poller, Token};
use crate::run_flag::RunFlag;
use crate::signal::{self, BlockedSignals};

use dispatch_core::queue::TaskQueue;
use dispatch_core::task::{Task, TaskIdGen};
use dispatch_core::{DispatchError, Result};

use nix::sys::signal::SigSet;
use std::fs::File;
use std::io;
use std::net::TcpListener;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const LISTENER: Token = 0;
const WAKER: Token = 1;
const SIGNAL: Token = 2;

fn open_spare() -> Option<File> {
    match File::open("/dev/null") {
        Ok(f) => Some(f),
        Err(e) => {
            tracing::warn!(error = %e, "cannot reserve spare descriptor");
            None
        }
    }
}

/// Loop state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Waiting,
    Accepting,
    Stopped,
}

/// Live counters, readable from other threads while the loop runs.
#[derive(Debug, Default)]
pub struct LoopCounters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    accept_errors: AtomicU64,
    interrupted: AtomicU64,
    shed: AtomicU64,
}

/// Snapshot of `LoopCounters`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Connections accepted and turned into tasks
    pub accepted: u64,
    /// Tasks the queue refused (bound, shutdown, allocation); closed at once
    pub rejected: u64,
    /// accept(2) failures that produced no task
    pub accept_errors: u64,
    /// Waits interrupted by a signal
    pub interrupted: u64,
    /// Connections closed unprocessed because descriptors ran out
    pub shed: u64,
}

impl LoopCounters {
    pub fn snapshot(&self) -> LoopStats {
        LoopStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
            shed: self.shed.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Errors that cost one connection but never stop the loop.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(
            libc::ECONNABORTED
                | libc::ECONNRESET
                | libc::EPROTO
                | libc::EPERM
                | libc::EMFILE
                | libc::ENFILE
                | libc::ENOBUFS
                | libc::ENOMEM
                | libc::ENETDOWN
                | libc::ENETUNREACH
                | libc::EHOSTUNREACH
                | libc::EHOSTDOWN
                | libc::ENONET
                | libc::EOPNOTSUPP
                | libc::ETIMEDOUT
        )
    )
}

pub struct ReadinessLoop {
    listener: TcpListener,
    poller: Poller,
    run: Arc<RunFlag>,
    queue: Arc<TaskQueue<Task>>,
    ids: TaskIdGen,
    counters: Arc<LoopCounters>,
    /// Reserved for shedding connections on descriptor exhaustion
    spare: Option<File>,
    /// Stop on SIGINT/SIGTERM (requires the handler to be installed)
    watch_signals: bool,
}

impl ReadinessLoop {
    /// Register the listener and the stop eventfd with `poller`.
    pub fn new(
        listener: TcpListener,
        poller: Poller,
        run: Arc<RunFlag>,
        queue: Arc<TaskQueue<Task>>,
    ) -> Result<Self> {
        poller
            .register(listener.as_fd(), LISTENER)
            .map_err(DispatchError::Poller)?;
        run.with_waker_fd(|fd| poller.register(fd, WAKER))
            .ok_or(DispatchError::AlreadyShutDown)?
            .map_err(DispatchError::Poller)?;

        Ok(Self {
            listener,
            poller,
            run,
            queue,
            ids: TaskIdGen::new(),
            counters: Arc::new(LoopCounters::default()),
            spare: open_spare(),
            watch_signals: false,
        })
    }

    /// Treat SIGINT/SIGTERM as a stop request.
    ///
    /// Fails unless the termination handler is installed, since the loop
    /// relies on its eventfd to wake on process-directed signals.
    pub fn watch_signals(mut self, enable: bool) -> Result<Self> {
        if enable && !self.watch_signals {
            let fd = signal::termination_fd().ok_or_else(|| {
                DispatchError::Signal(io::Error::other("termination handler not installed"))
            })?;
            self.poller.register(fd, SIGNAL).map_err(DispatchError::Poller)?;
        }
        self.watch_signals = self.watch_signals || enable;
        Ok(self)
    }

    pub fn counters(&self) -> Arc<LoopCounters> {
        Arc::clone(&self.counters)
    }

    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }

    pub fn run_flag(&self) -> &Arc<RunFlag> {
        &self.run
    }

    /// Close the listener, the epoll instance and the stop eventfd.
    pub fn close(self) {
        let Self { listener, poller, run, .. } = self;
        drop(listener);
        drop(poller);
        run.release_waker();
    }

    /// Run until the running flag is cleared.
    ///
    /// Only fails if epoll itself fails; the caller must still shut down.
    pub fn run(&mut self) -> Result<LoopStats> {
        // Termination signals stay blocked on this thread outside the wait.
        let (_blocked, wait_mask) = if self.watch_signals {
            let guard = BlockedSignals::termination().map_err(DispatchError::Signal)?;
            let mask = guard.wait_mask();
            (Some(guard), Some(mask))
        } else {
            (None, None)
        };

        let mut state = LoopState::Waiting;
        loop {
            state = match state {
                LoopState::Waiting => self.wait(wait_mask.as_ref())?,
                LoopState::Accepting => {
                    self.accept_ready();
                    LoopState::Waiting
                }
                LoopState::Stopped => break,
            };
        }

        let stats = self.counters.snapshot();
        tracing::debug!(?stats, "readiness loop stopped");
        Ok(stats)
    }

    fn wait(&mut self, mask: Option<&SigSet>) -> Result<LoopState> {
        // Catches a signal delivered before this thread blocked them.
        if self.watch_signals && signal::termination_requested() && self.run.stop() {
            tracing::info!("termination signal received");
        }
        if !self.run.is_running() {
            return Ok(LoopState::Stopped);
        }

        let mut listener_ready = false;
        let mut woken = false;
        match self.poller.wait(mask) {
            Ok(tokens) => {
                for token in tokens {
                    match token {
                        LISTENER => listener_ready = true,
                        WAKER => woken = true,
                        // Flag already set; seen by the next pre-wait check
                        SIGNAL => {}
                        _ => {}
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                LoopCounters::bump(&self.counters.interrupted);
                // Waiting re-checks the flags before blocking again
                return Ok(LoopState::Waiting);
            }
            Err(e) => {
                tracing::error!(error = %e, "readiness wait failed");
                return Err(DispatchError::Poller(e));
            }
        }

        if woken {
            self.run.acknowledge_wake();
        }
        Ok(if listener_ready {
            LoopState::Accepting
        } else {
            LoopState::Waiting
        })
    }

    /// Accept every connection that is ready right now.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    // Accepted sockets do not inherit O_NONBLOCK on Linux; make sure.
                    if let Err(e) = stream.set_nonblocking(false) {
                        LoopCounters::bump(&self.counters.accept_errors);
                        tracing::warn!(%peer, error = %e, "dropping connection");
                        continue;
                    }
                    LoopCounters::bump(&self.counters.accepted);
                    let task = Task::new(self.ids.next(), stream, peer);
                    tracing::trace!(task = %task.id(), %peer, "accepted");

                    if let Err(rejected) = self.queue.enqueue(task) {
                        LoopCounters::bump(&self.counters.rejected);
                        tracing::warn!(reason = rejected.reason(), %peer, "task rejected, closing");
                        rejected.into_inner().release();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.raw_os_error(), Some(libc::EMFILE | libc::ENFILE)) => {
                    LoopCounters::bump(&self.counters.accept_errors);
                    tracing::warn!(error = %e, "out of descriptors");
                    // Without a spare the listener stays ready; nothing more to do this round
                    if !self.shed_one() {
                        break;
                    }
                }
                Err(e) if is_transient_accept_error(&e) => {
                    LoopCounters::bump(&self.counters.accept_errors);
                    tracing::warn!(error = %e, "accept failed, skipping");
                }
                Err(e) => {
                    LoopCounters::bump(&self.counters.accept_errors);
                    tracing::error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Free the spare descriptor, accept one pending connection and close
    /// it, then reserve the spare again.
    ///
    /// Returns `false` if there was no spare to give up.
    fn shed_one(&mut self) -> bool {
        let Some(spare) = self.spare.take() else {
            return false;
        };
        drop(spare);
        match self.listener.accept() {
            Ok((stream, peer)) => {
                LoopCounters::bump(&self.counters.shed);
                tracing::warn!(%peer, "closing connection, no descriptors left");
                drop(stream);
            }
            Err(e) => tracing::debug!(error = %e, "nothing to shed"),
        }
        self.spare = open_spare();
        true
    }
}
