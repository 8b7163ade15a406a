//! Running flag shared by the readiness loop and stop handles
//!
//! Starts `true`, is cleared exactly once (signal path or `StopHandle`),
//! never reset. Clearing it from outside the readiness thread also writes
//! the eventfd so a parked loop returns from its wait.

use crate::waker::Waker;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub struct RunFlag {
    running: AtomicBool,
    /// `None` once the coordinator released it
    waker: Mutex<Option<Waker>>,
}

impl RunFlag {
    pub fn new() -> io::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            running: AtomicBool::new(true),
            waker: Mutex::new(Some(Waker::new()?)),
        }))
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clear the flag and wake the readiness loop.
    ///
    /// Returns `true` only for the call that actually cleared it.
    pub fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        let guard = self.waker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(waker) = guard.as_ref() {
            if let Err(e) = waker.wake() {
                tracing::warn!(error = %e, "failed to wake readiness loop");
            }
        }
        true
    }

    /// Reset the eventfd counter after the loop saw it ready.
    pub(crate) fn acknowledge_wake(&self) {
        let guard = self.waker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(waker) = guard.as_ref() {
            waker.reset();
        }
    }

    /// Run `f` with the eventfd (for epoll registration).
    pub(crate) fn with_waker_fd<R>(&self, f: impl FnOnce(BorrowedFd<'_>) -> R) -> Option<R> {
        let guard = self.waker.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(|w| f(w.as_fd()))
    }

    /// Close the eventfd. Later `stop()` calls only flip the flag.
    pub(crate) fn release_waker(&self) -> bool {
        self.waker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }
}

/// Cloneable handle for stopping a dispatcher from another thread.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<RunFlag>,
}

impl StopHandle {
    pub(crate) fn new(flag: Arc<RunFlag>) -> Self {
        Self { flag }
    }

    /// Request shutdown. Returns `false` if it was already requested.
    pub fn stop(&self) -> bool {
        self.flag.stop()
    }

    pub fn is_running(&self) -> bool {
        self.flag.is_running()
    }
}
