//! epoll wrapper for the readiness loop
//!
//! Registration goes through `nix::sys::epoll`. The wait itself calls
//! `epoll_pwait` so the caller can atomically unblock termination signals
//! for the duration of the wait: a SIGTERM that arrives while the loop is
//! busy accepting stays pending and interrupts the next wait instead of
//! being lost between "check flag" and "block".

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use nix::sys::signal::SigSet;
use std::io;
use std::os::fd::{AsFd, AsRawFd};

/// Opaque registration token returned with each ready event
pub type Token = u64;

pub struct Poller {
    epoll: Epoll,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    /// Create an epoll instance that reports at most `batch` events per wait.
    pub fn new(batch: usize) -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let batch = batch.max(1);
        Ok(Self {
            epoll,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; batch],
        })
    }

    /// Register `fd` for level-triggered read readiness.
    pub fn register<F: AsFd>(&self, fd: F, token: Token) -> io::Result<()> {
        self.epoll
            .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, token))
            .map_err(io::Error::from)
    }

    pub fn batch(&self) -> usize {
        self.events.len()
    }

    /// Block with no timeout until at least one registered fd is ready.
    ///
    /// `mask` replaces the thread's signal mask for the duration of the
    /// wait. Interruption surfaces as `ErrorKind::Interrupted`; the caller
    /// decides whether to retry.
    pub fn wait(&mut self, mask: Option<&SigSet>) -> io::Result<impl Iterator<Item = Token> + '_> {
        let sigmask = match mask {
            Some(set) => set.as_ref() as *const libc::sigset_t,
            None => std::ptr::null(),
        };
        let n = unsafe {
            libc::epoll_pwait(
                self.epoll.0.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                -1,
                sigmask,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(self.events[..n as usize].iter().map(|ev| ev.u64))
    }
}
