//! Serving strategies.
//!
//! Two readiness-based reactors share one set of connection handlers:
//! - `select`: bitmap backend, bounded by `FD_SETSIZE`
//! - `mio`: epoll on Linux, kqueue on macOS
//!
//! Both share common abstractions:
//! - `SendBuffer`: fixed-capacity outgoing queue
//! - `Connection`: per-peer protocol state and handlers
//! - `Interest`: what a connection wants next
//!
//! The blocking strategies (sequential, thread-per-connection) live in
//! `blocking` and reuse only the protocol and sink.

mod backend;
mod blocking;
mod buffer;
mod connection;
mod interest;
mod reactor;

pub(crate) use backend::{MioBackend, SelectBackend};
pub(crate) use reactor::Reactor;

use crate::config::{Config, Strategy};
use crate::sink::SinkDir;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use tracing::info;

/// Listen backlog, as in the classic socket utilities.
const BACKLOG: i32 = 64;

/// Process-fatal serving errors.
///
/// Anything scoped to one peer is handled inside the strategies and never
/// surfaces here.
#[derive(Debug)]
pub enum ServerError {
    /// Creating or binding the listening socket failed.
    Bind(SocketAddr, io::Error),
    /// Configuring the bound listener failed.
    Listener(io::Error),
    /// Creating the backend or registering the listener failed.
    Backend(io::Error),
    /// Waiting for readiness failed.
    Wait(io::Error),
    /// Accept failed with a non-transient error.
    Accept(io::Error),
    /// The sink directory could not be created.
    SinkDir(PathBuf, io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind(addr, e) => write!(f, "failed to listen on {addr}: {e}"),
            ServerError::Listener(e) => write!(f, "failed to configure listener: {e}"),
            ServerError::Backend(e) => write!(f, "backend error: {e}"),
            ServerError::Wait(e) => write!(f, "readiness wait failed: {e}"),
            ServerError::Accept(e) => write!(f, "accept failed: {e}"),
            ServerError::SinkDir(dir, e) => {
                write!(f, "failed to create sink directory {}: {e}", dir.display())
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(_, e)
            | ServerError::Listener(e)
            | ServerError::Backend(e)
            | ServerError::Wait(e)
            | ServerError::Accept(e)
            | ServerError::SinkDir(_, e) => Some(e),
        }
    }
}

/// Run the configured strategy until a process-fatal error occurs.
pub fn run(config: Config) -> Result<(), ServerError> {
    let sinks = prepare_sinks(&config.sink_dir)?;
    let listener = bind_listener(config.listen)?;

    info!(
        addr = %config.listen,
        strategy = ?config.strategy,
        sink_dir = %sinks.dir().display(),
        "Serving"
    );

    match config.strategy {
        Strategy::Sequential => blocking::serve_sequential(listener, &sinks),
        Strategy::Threaded => blocking::serve_threaded(listener, &sinks),
        Strategy::Select => {
            Reactor::new(SelectBackend::new(), listener, sinks, config.max_connections)?.run()
        }
        Strategy::Mio => {
            let backend = MioBackend::new(config.events).map_err(ServerError::Backend)?;
            Reactor::new(backend, listener, sinks, config.max_connections)?.run()
        }
    }
}

/// Make sure the sink directory exists before any peer is served.
pub fn prepare_sinks(dir: &Path) -> Result<SinkDir, ServerError> {
    let sinks = SinkDir::new(dir);
    sinks
        .create()
        .map_err(|e| ServerError::SinkDir(dir.to_path_buf(), e))?;
    Ok(sinks)
}

/// Create a bound, listening TCP socket with SO_REUSEADDR.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let bind = || -> io::Result<TcpListener> {
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(BACKLOG)?;

        Ok(socket.into())
    };

    bind().map_err(|e| ServerError::Bind(addr, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listener_ephemeral() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_prepare_sinks_creates_missing_dir() {
        let dir = crate::sink::scratch_dir("prepare").join("nested").join("sinks");
        assert!(!dir.exists());

        let sinks = prepare_sinks(&dir).unwrap();
        assert!(dir.is_dir());
        assert_eq!(sinks.dir(), dir.as_path());
    }

    #[test]
    fn test_prepare_sinks_failure_is_fatal() {
        // A regular file where the directory should go.
        let file = crate::sink::scratch_dir("prepare-file").join("not-a-dir");
        std::fs::write(&file, b"").unwrap();

        let err = prepare_sinks(&file).unwrap_err();
        assert!(matches!(err, ServerError::SinkDir(ref p, _) if *p == file));
        assert!(err.to_string().contains("sink directory"));
    }

    #[test]
    fn test_bind_conflict_is_fatal() {
        let first = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = first.local_addr().unwrap();
        let err = bind_listener(addr).unwrap_err();
        assert!(matches!(err, ServerError::Bind(a, _) if a == addr));
        assert!(err.to_string().contains(&addr.to_string()));
    }
}
