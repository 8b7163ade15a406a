//! Connection handler - the per-connection capability a worker invokes
//!
//! The handler borrows the stream. The worker closes it once `handle`
//! returns, whatever the outcome, so a handler must not try to release
//! the descriptor itself.

use crate::error::HandlerError;
use std::net::{SocketAddr, TcpStream};

/// Processing capability invoked once per dequeued task.
///
/// Implementations run concurrently on every worker thread. A returned
/// error or a panic is logged by the worker and does not stop it.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, stream: &mut TcpStream, peer: SocketAddr) -> Result<(), HandlerError>;

    /// Short name used in log lines
    fn name(&self) -> &'static str {
        "handler"
    }
}

impl<F> ConnectionHandler for F
where
    F: Fn(&mut TcpStream, SocketAddr) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, stream: &mut TcpStream, peer: SocketAddr) -> Result<(), HandlerError> {
        self(stream, peer)
    }

    fn name(&self) -> &'static str {
        "closure"
    }
}

/// Default body: log the connection and let the worker close it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAndClose;

impl ConnectionHandler for LogAndClose {
    fn handle(&self, stream: &mut TcpStream, peer: SocketAddr) -> Result<(), HandlerError> {
        let local = stream.local_addr()?;
        tracing::info!(%peer, %local, "connection accepted, closing");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log-and-close"
    }
}
