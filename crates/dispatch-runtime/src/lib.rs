//! # dispatch-runtime: epoll accept loop feeding a fixed worker pool
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │          Readiness thread (one)                          │
//! │   epoll_pwait(listener, eventfd)  ← no timeout           │
//! │   accept until WouldBlock → Task → TaskQueue::enqueue    │
//! └──────────────────┬──────────────────────────────────────┘
//!                    │ Mutex + Condvar FIFO
//!                    ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          Worker threads (N, fixed)                       │
//! │   dequeue_blocking → ConnectionHandler::handle → close   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use dispatch_core::{DispatchConfig, LogAndClose};
//! use dispatch_runtime::Dispatcher;
//!
//! fn main() -> dispatch_core::Result<()> {
//!     let config = DispatchConfig::from_env().workers(4);
//!     let report = Dispatcher::bind(config, LogAndClose)?
//!         .handle_signals()?
//!         .run()?;   // returns after Ctrl-C, fully shut down
//!     println!("{:?}", report);
//!     Ok(())
//! }
//! ```

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod dispatcher;
        pub mod listener;
        pub mod poller;
        pub mod pool;
        pub mod readiness;
        pub mod run_flag;
        pub mod signal;
        mod waker;

        pub use dispatcher::{Dispatcher, RunningDispatcher, ShutdownReport};
        pub use pool::{PoolStats, WorkerPool};
        pub use readiness::{LoopState, LoopStats};
        pub use run_flag::StopHandle;
    } else {
        compile_error!("dispatch-runtime requires Linux (epoll, eventfd)");
    }
}
