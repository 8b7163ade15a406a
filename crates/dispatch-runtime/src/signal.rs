//! SIGINT / SIGTERM handling
//!
//! The handler stores `true` into a static atomic and bumps a process-wide
//! eventfd (`write(2)` is async-signal-safe). Everything else (logging,
//! stopping) happens on the readiness thread once its wait returns.
//!
//! Delivery model:
//! - Worker threads are spawned with SIGINT/SIGTERM blocked and never
//!   unblock them.
//! - The readiness thread keeps them blocked too, except inside
//!   `epoll_pwait`, which swaps in a mask with them unblocked.
//! - Any other thread (the caller of `Dispatcher::spawn`, the main thread)
//!   may take a process-directed signal. The eventfd sits in every
//!   signal-watching epoll set, so the readiness wait returns either way.
//!
//! The eventfd is never read back or closed: once set, termination stays
//! requested for the life of the process.

use nix::sys::signal::{
    pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use crate::waker::Waker;
use std::io;
use std::os::fd::{BorrowedFd, IntoRawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static TERMINATE: AtomicBool = AtomicBool::new(false);
static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);
/// eventfd written by the handler; -1 until installed
static TERMINATE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_terminate(_sig: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
    let fd = TERMINATE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let val: u64 = 1;
        // Safety: write(2) and errno access are async-signal-safe
        unsafe {
            let errno = libc::__errno_location();
            let saved = *errno;
            libc::write(
                fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
            *errno = saved;
        }
    }
}

fn termination_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set
}

/// Install the SIGINT/SIGTERM handler and ignore SIGPIPE.
///
/// `SA_RESTART` is deliberately absent. Idempotent.
pub fn install_termination_handler() -> io::Result<()> {
    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    if TERMINATE_FD.load(Ordering::SeqCst) < 0 {
        match Waker::new() {
            // Lives for the rest of the process
            Ok(waker) => TERMINATE_FD.store(waker.into_raw_fd(), Ordering::SeqCst),
            Err(e) => {
                HANDLER_INSTALLED.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
    }

    let action = SigAction::new(
        SigHandler::Handler(on_terminate),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());

    // Safety: the handler only performs an atomic store
    let result = unsafe {
        sigaction(Signal::SIGINT, &action)
            .and_then(|_| sigaction(Signal::SIGTERM, &action))
            .and_then(|_| sigaction(Signal::SIGPIPE, &ignore))
    };
    if let Err(e) = result {
        HANDLER_INSTALLED.store(false, Ordering::SeqCst);
        return Err(e.into());
    }
    Ok(())
}

/// Whether a termination signal has been delivered since startup
#[inline]
pub fn termination_requested() -> bool {
    TERMINATE.load(Ordering::SeqCst)
}

/// eventfd that becomes readable on SIGINT/SIGTERM, once the handler is installed.
pub(crate) fn termination_fd() -> Option<BorrowedFd<'static>> {
    let fd = TERMINATE_FD.load(Ordering::SeqCst);
    // Safety: the descriptor is never closed after install
    (fd >= 0).then(|| unsafe { BorrowedFd::borrow_raw(fd) })
}

/// Blocks SIGINT/SIGTERM on the current thread until dropped.
///
/// Threads spawned while the guard is alive inherit the blocked mask.
pub struct BlockedSignals {
    previous: SigSet,
}

impl BlockedSignals {
    pub fn termination() -> io::Result<Self> {
        let mut previous = SigSet::empty();
        pthread_sigmask(
            SigmaskHow::SIG_BLOCK,
            Some(&termination_set()),
            Some(&mut previous),
        )?;
        Ok(Self { previous })
    }

    /// Mask to install during the readiness wait: the mask this thread
    /// had before the guard, with SIGINT/SIGTERM explicitly unblocked.
    pub fn wait_mask(&self) -> SigSet {
        let mut mask = self.previous;
        mask.remove(Signal::SIGINT);
        mask.remove(Signal::SIGTERM);
        mask
    }
}

impl Drop for BlockedSignals {
    fn drop(&mut self) {
        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn current_mask() -> SigSet {
        SigSet::thread_get_mask().unwrap()
    }

    #[test]
    fn test_install_publishes_termination_fd() {
        install_termination_handler().unwrap();
        let first = termination_fd().map(|fd| fd.as_raw_fd());
        assert!(first.is_some());
        // Idempotent: same descriptor on repeat installs
        install_termination_handler().unwrap();
        assert_eq!(termination_fd().map(|fd| fd.as_raw_fd()), first);
    }

    #[test]
    fn test_guard_blocks_and_restores() {
        std::thread::spawn(|| {
            assert!(!current_mask().contains(Signal::SIGTERM));
            {
                let guard = BlockedSignals::termination().unwrap();
                let mask = current_mask();
                assert!(mask.contains(Signal::SIGINT));
                assert!(mask.contains(Signal::SIGTERM));
                assert!(!guard.wait_mask().contains(Signal::SIGTERM));
            }
            assert!(!current_mask().contains(Signal::SIGTERM));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_spawned_thread_inherits_block() {
        std::thread::spawn(|| {
            let _guard = BlockedSignals::termination().unwrap();
            std::thread::spawn(|| current_mask().contains(Signal::SIGTERM))
                .join()
                .unwrap()
        })
        .join()
        .map(|inherited| assert!(inherited))
        .unwrap();
    }
}
