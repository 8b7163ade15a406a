//! dispatchd: TCP connection dispatcher
//!
//! One epoll readiness thread accepts connections and queues them; a fixed
//! pool of worker threads takes them off the queue, runs the handler and
//! closes them. Ctrl-C / SIGTERM shuts down cleanly: in-flight connections
//! finish, queued ones are closed unprocessed.
//!
//! Usage:
//!     cargo build --release -p dispatchd
//!     ./target/release/dispatchd [--port 8080] [--workers 4]
//!
//! Configuration: `DISPATCH_*` environment variables first, then CLI flags
//! override them. Log filter from `DISPATCH_LOG` (default `info`).
//!
//! Test with:
//!     for i in $(seq 1 100); do nc -z localhost 8080 & done

use clap::Parser;
use dispatch_core::{DispatchConfig, LogAndClose};
use dispatch_runtime::Dispatcher;
use std::net::IpAddr;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dispatchd", version, about = "TCP connection dispatcher")]
struct Cli {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Worker pool size
    #[arg(short, long)]
    workers: Option<usize>,

    /// Max readiness events per wait
    #[arg(long)]
    event_batch: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    backlog: Option<i32>,

    /// Bound the task queue (connections past it are closed at once)
    #[arg(long)]
    max_queue: Option<usize>,
}

impl Cli {
    /// Env-derived defaults, overridden by whatever was passed on the command line.
    fn into_config(self) -> DispatchConfig {
        let mut config = DispatchConfig::from_env();
        if let Some(port) = self.port {
            config = config.port(port);
        }
        if let Some(addr) = self.bind {
            config = config.bind_addr(addr);
        }
        if let Some(n) = self.workers {
            config = config.workers(n);
        }
        if let Some(n) = self.event_batch {
            config = config.event_batch(n);
        }
        if let Some(n) = self.backlog {
            config = config.backlog(n);
        }
        if let Some(n) = self.max_queue {
            config = config.max_queue_depth(Some(n));
        }
        config
    }
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env("DISPATCH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed CLI arguments");
    let config = cli.into_config();

    let dispatcher = match Dispatcher::bind(config, LogAndClose).and_then(Dispatcher::handle_signals) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(error = %e, "cannot start server");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("server running, Ctrl+C to shut down");
    match dispatcher.run() {
        Ok(report) => {
            tracing::info!(
                accepted = report.readiness.accepted,
                processed = report.workers.processed,
                failed = report.workers.failed + report.workers.panicked,
                drained = report.drained,
                "bye"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "dispatcher failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from(["dispatchd", "--port", "9001", "-w", "3", "--max-queue", "10"]);
        let config = cli.into_config();
        assert_eq!(config.port, 9001);
        assert_eq!(config.workers, 3);
        assert_eq!(config.max_queue_depth, Some(10));
    }

    #[test]
    fn test_cli_rejects_bad_port() {
        assert!(Cli::try_parse_from(["dispatchd", "--port", "70000"]).is_err());
    }
}
