//! Listener setup (startup only)
//!
//! socket → `SO_REUSEADDR` → bind → listen, all through `nix::sys::socket`.
//! The socket is created non-blocking so the readiness loop can accept
//! until `WouldBlock`. Any failure drops the half-built descriptor and
//! returns `DispatchError::Bind`.

use dispatch_core::{DispatchConfig, DispatchError, Result};
use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockType,
    SockaddrStorage,
};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsRawFd;

/// Create a listening socket per `config`.
pub fn bind_listener(config: &DispatchConfig) -> Result<TcpListener> {
    let addr = config.socket_addr();
    build(addr, config.backlog, config.reuse_addr).map_err(|source| DispatchError::Bind {
        addr: addr.to_string(),
        source,
    })
}

fn build(addr: SocketAddr, backlog: i32, reuse_addr: bool) -> io::Result<TcpListener> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd = socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;

    if reuse_addr {
        setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    }

    bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))?;
    listen(&fd, Backlog::new(backlog)?)?;

    Ok(TcpListener::from(fd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, TcpStream};

    fn loopback() -> DispatchConfig {
        DispatchConfig::new()
            .bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .port(0)
    }

    #[test]
    fn test_bind_ephemeral_and_accept() {
        let listener = bind_listener(&loopback()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        // Non-blocking: nothing pending yet
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        let _client = TcpStream::connect(addr).unwrap();
        let mut accepted = None;
        for _ in 0..500 {
            match listener.accept() {
                Ok(pair) => {
                    accepted = Some(pair);
                    break;
                }
                Err(_) => std::thread::sleep(std::time::Duration::from_millis(2)),
            }
        }
        assert!(accepted.is_some());
    }

    #[test]
    fn test_bind_conflict_is_error() {
        let first = bind_listener(&loopback().reuse_addr(false)).unwrap();
        let port = first.local_addr().unwrap().port();
        let err = bind_listener(&loopback().port(port).reuse_addr(false)).unwrap_err();
        assert!(matches!(err, DispatchError::Bind { .. }));
    }
}
