//! # dispatch-core
//!
//! Platform-agnostic building blocks for the connection dispatcher.
//! No OS-specific code lives here; the epoll loop, worker threads and
//! signal handling are in `dispatch-runtime`.
//!
//! ## Modules
//!
//! - `queue` - `TaskQueue<T>`, the Mutex + Condvar FIFO between the
//!   readiness loop (producer) and the worker pool (consumers)
//! - `task` - `Task`, one owned accepted connection plus peer address
//! - `handler` - `ConnectionHandler`, the pluggable per-connection body
//! - `config` - `DispatchConfig` with env overrides
//! - `error` - `DispatchError` / `HandlerError`

pub mod config;
pub mod error;
pub mod handler;
pub mod queue;
pub mod task;

pub use config::{DispatchConfig, MAX_WORKERS, SERVER_NAME};
pub use error::{DispatchError, HandlerError, Result};
pub use handler::{ConnectionHandler, LogAndClose};
pub use queue::{Dequeued, EnqueueError, TaskQueue};
pub use task::{Task, TaskId, TaskIdGen};
