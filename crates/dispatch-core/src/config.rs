//! Dispatcher configuration
//!
//! All values are fixed at startup. Defaults match the reference server:
//! port 8080 on every interface, backlog 128, `SO_REUSEADDR` on.
//!
//! # Environment Variables
//!
//! - `DISPATCH_BIND` - bind address (default `0.0.0.0`)
//! - `DISPATCH_PORT` - listening port (default 8080)
//! - `DISPATCH_WORKERS` - worker pool size (default: CPU count)
//! - `DISPATCH_EVENT_BATCH` - max readiness events per wait (default 64)
//! - `DISPATCH_BACKLOG` - listen backlog (default 128)
//! - `DISPATCH_MAX_QUEUE` - queue bound, unset or 0 = unbounded

use crate::error::{DispatchError, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Hard cap on pool size
pub const MAX_WORKERS: usize = 256;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BACKLOG: i32 = 128;
pub const DEFAULT_EVENT_BATCH: usize = 64;

/// Name reported in the startup banner
pub const SERVER_NAME: &str = "CServer/0.1";

/// Listener, pool and readiness-loop settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Address to bind
    pub bind_addr: IpAddr,

    /// Port to listen on (0 = kernel-assigned)
    pub port: u16,

    /// Number of worker threads (defaults to CPU count)
    pub workers: usize,

    /// Max events returned by one readiness wait
    pub event_batch: usize,

    /// Listen queue length
    pub backlog: i32,

    /// Set `SO_REUSEADDR` before bind
    pub reuse_addr: bool,

    /// Optional queue bound. `None` keeps the queue unbounded.
    pub max_queue_depth: Option<usize>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            workers: num_cpus.min(MAX_WORKERS),
            event_batch: DEFAULT_EVENT_BATCH,
            backlog: DEFAULT_BACKLOG,
            reuse_addr: true,
            max_queue_depth: None,
        }
    }
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `DISPATCH_*` environment variables.
    ///
    /// Unparseable values fall back to the default silently.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind_addr: env_get("DISPATCH_BIND", d.bind_addr),
            port: env_get("DISPATCH_PORT", d.port),
            workers: env_get("DISPATCH_WORKERS", d.workers).min(MAX_WORKERS),
            event_batch: env_get("DISPATCH_EVENT_BATCH", d.event_batch),
            backlog: env_get("DISPATCH_BACKLOG", d.backlog),
            reuse_addr: d.reuse_addr,
            max_queue_depth: env_get_opt::<usize>("DISPATCH_MAX_QUEUE").filter(|&n| n > 0),
        }
    }

    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set number of worker threads
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n.min(MAX_WORKERS);
        self
    }

    pub fn event_batch(mut self, n: usize) -> Self {
        self.event_batch = n;
        self
    }

    pub fn backlog(mut self, n: i32) -> Self {
        self.backlog = n;
        self
    }

    pub fn reuse_addr(mut self, enable: bool) -> Self {
        self.reuse_addr = enable;
        self
    }

    /// Bound the task queue. Tasks past the bound are rejected and closed.
    pub fn max_queue_depth(mut self, depth: Option<usize>) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Socket address the listener binds to
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(DispatchError::Config("workers must be at least 1"));
        }
        if self.workers > MAX_WORKERS {
            return Err(DispatchError::Config("workers exceeds maximum"));
        }
        if self.event_batch == 0 {
            return Err(DispatchError::Config("event_batch must be at least 1"));
        }
        if self.backlog <= 0 {
            return Err(DispatchError::Config("backlog must be positive"));
        }
        if self.max_queue_depth == Some(0) {
            return Err(DispatchError::Config("max_queue_depth must be at least 1"));
        }
        Ok(())
    }
}

/// Get environment variable parsed as `T`, or return default
fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = DispatchConfig::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.backlog, 128);
        assert!(cfg.reuse_addr);
        assert!(cfg.max_queue_depth.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let cfg = DispatchConfig::new()
            .port(9000)
            .workers(2)
            .event_batch(16)
            .bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(cfg.socket_addr(), "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.event_batch, 16);
    }

    #[test]
    fn test_workers_capped() {
        let cfg = DispatchConfig::new().workers(10_000);
        assert_eq!(cfg.workers, MAX_WORKERS);
    }

    #[test]
    fn test_validate_rejects_zero() {
        assert!(DispatchConfig::new().workers(0).validate().is_err());
        assert!(DispatchConfig::new().event_batch(0).validate().is_err());
        assert!(DispatchConfig::new().backlog(0).validate().is_err());
        assert!(DispatchConfig::new().max_queue_depth(Some(0)).validate().is_err());
    }

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__DISPATCH_TEST_UNSET__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__DISPATCH_TEST_INVALID__", "not_a_number");
        let val: u16 = env_get("__DISPATCH_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__DISPATCH_TEST_INVALID__");
    }

    #[test]
    fn test_env_get_trims() {
        std::env::set_var("__DISPATCH_TEST_PORT__", " 9090 ");
        let val: u16 = env_get("__DISPATCH_TEST_PORT__", 1);
        assert_eq!(val, 9090);
        std::env::remove_var("__DISPATCH_TEST_PORT__");
    }
}
