//! Single-threaded reactor.
//!
//! Owns the listener, the backend and the connection table. Every wait is
//! followed by a dispatch pass: listener readiness accepts one peer,
//! connection readiness runs the handlers, and whatever interest a handler
//! returns is immediately re-submitted to the backend (or the connection is
//! torn down on `Close`). Socket I/O is non-blocking throughout; the only
//! blocking point is `Backend::wait`.
//!
//! Within one event, read is serviced before write. Write is only serviced
//! if the interest returned by the read still asks for it.

use crate::runtime::backend::{Backend, Readiness};
use crate::runtime::buffer::SEND_CAPACITY;
use crate::runtime::connection::{ConnError, Connection, ConnectionRegistry};
use crate::runtime::interest::Interest;
use crate::runtime::ServerError;
use crate::sink::SinkDir;
use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const LISTENER_TOKEN: usize = usize::MAX;

/// A registered connection: the socket plus its protocol record.
struct Peer {
    stream: TcpStream,
    fd: RawFd,
    conn: Connection,
}

pub struct Reactor<B: Backend> {
    backend: B,
    listener: TcpListener,
    listener_fd: RawFd,
    connections: ConnectionRegistry<Peer>,
    sinks: SinkDir,
    scratch: Box<[u8]>,
    ready: Vec<Readiness>,
}

impl<B: Backend> Reactor<B> {
    /// Take ownership of a bound listener and register it with `backend`.
    pub fn new(
        mut backend: B,
        listener: TcpListener,
        sinks: SinkDir,
        max_connections: usize,
    ) -> Result<Self, ServerError> {
        listener.set_nonblocking(true).map_err(ServerError::Listener)?;
        let listener_fd = listener.as_raw_fd();
        backend
            .register(listener_fd, LISTENER_TOKEN, Interest::ReadOnly)
            .map_err(ServerError::Backend)?;

        Ok(Self {
            backend,
            listener,
            listener_fd,
            connections: ConnectionRegistry::new(max_connections),
            sinks,
            scratch: vec![0u8; SEND_CAPACITY].into_boxed_slice(),
            ready: Vec::new(),
        })
    }

    /// Serve forever. Returns only on a process-fatal error.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let addr = self.local_addr().map_err(ServerError::Listener)?;
        info!(
            addr = %addr,
            backend = self.backend.name(),
            max_connections = self.connections.capacity(),
            "Reactor started"
        );
        loop {
            self.turn(None)?;
        }
    }

    /// One wait followed by dispatch of everything it reported.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<(), ServerError> {
        self.backend
            .wait(&mut self.ready, timeout)
            .map_err(ServerError::Wait)?;

        let ready = mem::take(&mut self.ready);
        for event in &ready {
            if event.token == LISTENER_TOKEN {
                self.accept()?;
            } else {
                self.dispatch(*event);
            }
        }
        self.ready = ready;

        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept a single pending peer.
    fn accept(&mut self) -> Result<(), ServerError> {
        match self.listener.accept() {
            Ok((stream, addr)) => self.admit(stream, addr),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("accept would block");
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted
                ) =>
            {
                warn!(error = %e, "Accept failed, continuing");
            }
            Err(e) => return Err(ServerError::Accept(e)),
        }

        // Re-arm so peers still queued in the backlog are reported again.
        self.backend
            .reregister(self.listener_fd, LISTENER_TOKEN, Interest::ReadOnly)
            .map_err(ServerError::Backend)
    }

    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(peer = %addr, error = %e, "Failed to make socket non-blocking");
            return;
        }

        let fd = stream.as_raw_fd();
        let (conn, interest) = Connection::accept(addr, self.sinks.open(fd));
        let conn_id = match self.connections.insert(Peer { stream, fd, conn }) {
            Ok(id) => id,
            Err(_) => {
                warn!(peer = %addr, "Connection limit reached, rejecting");
                return;
            }
        };

        if let Err(e) = self.backend.register(fd, conn_id, interest) {
            warn!(peer = %addr, fd, error = %e, "Backend rejected connection");
            self.connections.remove(conn_id);
            return;
        }

        info!(peer = %addr, fd, conn_id, "Peer connected");
    }

    fn dispatch(&mut self, event: Readiness) {
        let conn_id = event.token;
        let mut current = None;
        trace!(
            conn_id,
            ready = ?Interest::from_flags(event.readable, event.writable),
            "Dispatching"
        );

        if event.readable {
            let Some(peer) = self.connections.get_mut(conn_id) else {
                return;
            };
            let result = peer.conn.on_readable(&mut peer.stream, &mut self.scratch);
            match self.apply(conn_id, result) {
                Some(interest) => current = Some(interest),
                None => return,
            }
        }

        if event.writable {
            if current.is_some_and(|interest| !interest.wants_write()) {
                return;
            }
            let Some(peer) = self.connections.get_mut(conn_id) else {
                return;
            };
            let result = peer.conn.on_writable(&mut peer.stream);
            self.apply(conn_id, result);
        }
    }

    /// Reconcile a handler result with the backend. Returns the interest now
    /// registered, or `None` if the connection was closed.
    fn apply(&mut self, conn_id: usize, result: Result<Interest, ConnError>) -> Option<Interest> {
        let interest = match result {
            Ok(interest) => interest,
            Err(e) => {
                warn!(conn_id, error = %e, "Connection failed");
                self.close(conn_id);
                return None;
            }
        };

        if interest.is_close() {
            self.close(conn_id);
            return None;
        }

        let fd = self.connections.get_mut(conn_id)?.fd;
        if let Err(e) = self.backend.reregister(fd, conn_id, interest) {
            warn!(conn_id, fd, error = %e, "Failed to update interest");
            self.close(conn_id);
            return None;
        }

        Some(interest)
    }

    fn close(&mut self, conn_id: usize) {
        let Some(mut peer) = self.connections.remove(conn_id) else {
            return;
        };

        if let Err(e) = self.backend.deregister(peer.fd, conn_id) {
            debug!(conn_id, fd = peer.fd, error = %e, "Deregister failed");
        }
        if let Err(e) = peer.conn.finish() {
            warn!(conn_id, error = %e, "Failed to flush sink");
        }

        debug!(
            conn_id,
            state = ?peer.conn.state(),
            unsent = peer.conn.pending().len(),
            sink = %peer.conn.sink().path().display(),
            "Releasing connection"
        );
        info!(
            fd = peer.fd,
            peer = %peer.conn.peer(),
            conn_id,
            open = self.connection_count(),
            "Socket closing"
        );
        // Dropping the stream closes the descriptor.
    }
}
