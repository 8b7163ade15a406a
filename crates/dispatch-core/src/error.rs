//! Error types for the dispatcher

use std::io;
use thiserror::Error;

/// Errors that can abort dispatcher startup or shutdown.
///
/// Everything in here is fatal for the caller. Recoverable conditions
/// (accept errors, interrupted waits, handler failures) are logged where
/// they happen and never surface as a `DispatchError`.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    /// Creating, binding or listening on the socket failed.
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// epoll setup or registration failed.
    #[error("poller: {0}")]
    Poller(#[source] io::Error),

    /// eventfd creation or write failed.
    #[error("waker: {0}")]
    Waker(#[source] io::Error),

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker {id}: {source}")]
    WorkerSpawn {
        id: usize,
        #[source]
        source: io::Error,
    },

    /// Installing a signal disposition or mask failed.
    #[error("signal setup: {0}")]
    Signal(#[source] io::Error),

    /// The pool was already shut down.
    #[error("worker pool already shut down")]
    AlreadyShutDown,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failure reported by a [`ConnectionHandler`](crate::handler::ConnectionHandler).
///
/// Always recoverable: the worker logs it, releases the connection and
/// moves on to the next task.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

/// Result type for dispatcher operations
pub type Result<T> = std::result::Result<T, DispatchError>;
