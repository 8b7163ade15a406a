//! Task - one accepted connection waiting for a worker
//!
//! A `Task` owns its `TcpStream`. Ownership moves readiness loop → queue →
//! one worker (or the drain), and the stream is closed when the task is
//! dropped. There is no other release path, so a task cannot be closed
//! twice or leaked without being closed.

use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic task identifier (observability only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Hands out increasing task ids, starting at 1. One per readiness loop.
#[derive(Debug)]
pub struct TaskIdGen {
    next: AtomicU64,
}

impl TaskIdGen {
    pub const fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    #[inline]
    pub fn next(&self) -> TaskId {
        TaskId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// An accepted connection awaiting processing.
pub struct Task {
    id: TaskId,
    stream: TcpStream,
    peer: SocketAddr,
}

impl Task {
    pub fn new(id: TaskId, stream: TcpStream, peer: SocketAddr) -> Self {
        Self { id, stream, peer }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Split borrow for handlers: mutable stream plus peer metadata.
    #[inline]
    pub fn parts_mut(&mut self) -> (&mut TcpStream, SocketAddr) {
        (&mut self.stream, self.peer)
    }

    /// Close the connection. Equivalent to dropping the task.
    pub fn release(self) {
        tracing::trace!(task = %self.id, peer = %self.peer, "released");
    }
}

impl Default for TaskIdGen {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    fn loopback_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (client, server, peer)
    }

    #[test]
    fn test_id_gen_monotonic() {
        let ids = TaskIdGen::new();
        let a = ids.next();
        let b = ids.next();
        assert!(a < b);
        assert_eq!(a.as_u64(), 1);
        assert_eq!(b.to_string(), "task#2");
    }

    #[test]
    fn test_release_closes_stream() {
        let (mut client, server, peer) = loopback_pair();
        let task = Task::new(TaskId::new(7), server, peer);
        assert_eq!(task.peer(), peer);
        task.release();

        // Peer observes EOF once the server side is closed
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_debug_hides_stream() {
        let (_client, server, peer) = loopback_pair();
        let task = Task::new(TaskId::new(3), server, peer);
        let dbg = format!("{:?}", task);
        assert!(dbg.contains("TaskId(3)"));
        assert!(!dbg.contains("TcpStream"));
    }
}
