//! Connection record and the readiness handlers shared by every backend.
//!
//! Each connection tracks its protocol state, the bytes it still owes the
//! peer, and its persistence sink. The handlers never block: they perform at
//! most one receive or one send per call and report, through the returned
//! [`Interest`], what the connection needs next.

use crate::protocol::{Action, ProtoState, Session, GREETING};
use crate::runtime::buffer::SendBuffer;
use crate::runtime::interest::Interest;
use crate::sink::FileSink;
use slab::Slab;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Failure scoped to a single connection. The reactor closes the connection
/// and keeps serving the others.
#[derive(Debug)]
pub enum ConnError {
    /// Receive failed with something other than would-block.
    Recv(io::Error),
    /// Send failed with something other than would-block.
    Send(io::Error),
    /// Send accepted zero bytes while output was pending.
    WriteZero,
    /// Appending payload to the persistence sink failed.
    Sink(io::Error),
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnError::Recv(e) => write!(f, "recv failed: {e}"),
            ConnError::Send(e) => write!(f, "send failed: {e}"),
            ConnError::WriteZero => write!(f, "send returned 0 with output pending"),
            ConnError::Sink(e) => write!(f, "sink write failed: {e}"),
        }
    }
}

impl std::error::Error for ConnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnError::Recv(e) | ConnError::Send(e) | ConnError::Sink(e) => Some(e),
            ConnError::WriteZero => None,
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Per-connection state retained across readiness events.
pub struct Connection<K = FileSink> {
    session: Session,
    send: SendBuffer,
    peer: SocketAddr,
    sink: K,
}

impl<K: Write> Connection<K> {
    /// Set up a freshly accepted connection with its greeting queued.
    ///
    /// The returned interest is always `WriteOnly`: nothing may be read until
    /// the greeting has gone out.
    pub fn accept(peer: SocketAddr, sink: K) -> (Self, Interest) {
        let mut send = SendBuffer::new();
        send.push(GREETING);

        let conn = Self {
            session: Session::new(),
            send,
            peer,
            sink,
        };
        (conn, Interest::WriteOnly)
    }

    /// Handle read readiness.
    ///
    /// Performs at most one receive of up to `scratch.len()` bytes, feeding
    /// each byte through the protocol. Nothing is read while the greeting or
    /// earlier output is still pending.
    pub fn on_readable<S: Read>(
        &mut self,
        socket: &mut S,
        scratch: &mut [u8],
    ) -> Result<Interest, ConnError> {
        if self.session.state() == ProtoState::AwaitingGreetingFlush || !self.send.is_drained() {
            return Ok(Interest::WriteOnly);
        }

        let chunk = scratch.len().min(self.send.capacity());
        let n = match socket.read(&mut scratch[..chunk]) {
            Ok(0) => return Ok(Interest::Close),
            Ok(n) => n,
            Err(ref e) if is_transient(e) => return Ok(Interest::ReadOnly),
            Err(e) => return Err(ConnError::Recv(e)),
        };

        // Payload is compacted to the front of `scratch` as it is consumed.
        let mut kept = 0;
        for i in 0..n {
            if let Action::Payload { persist, echo } = self.session.consume(scratch[i]) {
                scratch[kept] = persist;
                kept += 1;
                self.send.push(echo);
            }
        }

        if kept == 0 {
            return Ok(Interest::ReadOnly);
        }

        self.sink
            .write_all(&scratch[..kept])
            .map_err(ConnError::Sink)?;
        Ok(Interest::WriteOnly)
    }

    /// Handle write readiness.
    ///
    /// Performs at most one send of the pending output.
    pub fn on_writable<S: Write>(&mut self, socket: &mut S) -> Result<Interest, ConnError> {
        if self.send.is_drained() {
            return Ok(Interest::ReadWrite);
        }

        let pending = self.send.pending().len();
        let n = match socket.write(self.send.pending()) {
            Ok(0) => return Err(ConnError::WriteZero),
            Ok(n) => n,
            Err(ref e) if is_transient(e) => return Ok(Interest::WriteOnly),
            Err(e) => return Err(ConnError::Send(e)),
        };

        self.send.advance(n);
        if n < pending {
            return Ok(Interest::WriteOnly);
        }

        self.session.greeting_flushed();
        Ok(Interest::ReadOnly)
    }

    /// Current protocol state.
    pub fn state(&self) -> ProtoState {
        self.session.state()
    }

    /// Bytes queued but not yet sent.
    pub fn pending(&self) -> &[u8] {
        self.send.pending()
    }

    /// Remote address of the peer.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Get a reference to the persistence sink.
    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Flush the sink before the connection is dropped.
    pub fn finish(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

/// Table of live connections using slab allocation.
///
/// Keys are dense `usize` tokens handed to the backend. O(1) insert, lookup
/// and remove; the only bound is `max_connections`.
pub struct ConnectionRegistry<T> {
    connections: Slab<T>,
    max_connections: usize,
}

impl<T> ConnectionRegistry<T> {
    /// Create a registry holding at most `max_connections` entries.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection.
    ///
    /// Returns the entry back if the registry is at capacity.
    pub fn insert(&mut self, conn: T) -> Result<usize, T> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.connections.get_mut(id)
    }

    /// Remove a connection, returning it if it was present.
    pub fn remove(&mut self, id: usize) -> Option<T> {
        self.connections.try_remove(id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Maximum number of connections.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    /// Scripted socket: hands out queued input and accepts at most
    /// `accept_per_write` bytes per send.
    struct FakeSocket {
        input: Vec<u8>,
        reads: usize,
        forbid_reads: bool,
        accept_per_write: usize,
        block_next_write: bool,
        written: Vec<u8>,
    }

    impl FakeSocket {
        fn new(input: &[u8]) -> Self {
            Self {
                input: input.to_vec(),
                reads: 0,
                forbid_reads: false,
                accept_per_write: usize::MAX,
                block_next_write: false,
                written: Vec::new(),
            }
        }
    }

    impl Read for FakeSocket {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            assert!(!self.forbid_reads, "read attempted while output pending");
            self.reads += 1;
            if self.input.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.input.len());
            buf[..n].copy_from_slice(&self.input[..n]);
            self.input.drain(..n);
            Ok(n)
        }
    }

    impl Write for FakeSocket {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.block_next_write {
                self.block_next_write = false;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.accept_per_write);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct EofSocket;

    impl Read for EofSocket {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    struct ResetSocket;

    impl Read for ResetSocket {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::ConnectionReset.into())
        }
    }

    impl Write for ResetSocket {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn greeted(socket: &mut FakeSocket) -> Connection<Vec<u8>> {
        let (mut conn, interest) = Connection::accept(peer(), Vec::new());
        assert_eq!(interest, Interest::WriteOnly);
        assert_eq!(conn.on_writable(socket).unwrap(), Interest::ReadOnly);
        assert_eq!(conn.state(), ProtoState::WaitingForStart);
        conn
    }

    #[test]
    fn test_accept_queues_greeting() {
        let (conn, interest) = Connection::accept(peer(), Vec::new());
        assert_eq!(interest, Interest::WriteOnly);
        assert_eq!(conn.pending(), b"*");
        assert_eq!(conn.state(), ProtoState::AwaitingGreetingFlush);
        assert_eq!(conn.peer(), peer());
    }

    #[test]
    fn test_no_read_before_greeting_flush() {
        let (mut conn, _) = Connection::accept(peer(), Vec::new());
        let mut socket = FakeSocket::new(b"^ab$");
        socket.forbid_reads = true;
        let mut scratch = [0u8; 64];

        let interest = conn.on_readable(&mut socket, &mut scratch).unwrap();
        assert_eq!(interest, Interest::WriteOnly);
        assert_eq!(socket.reads, 0);
    }

    #[test]
    fn test_no_read_while_output_pending() {
        let mut socket = FakeSocket::new(b"^ab$");
        let mut conn = greeted(&mut socket);
        let mut scratch = [0u8; 64];

        assert_eq!(
            conn.on_readable(&mut socket, &mut scratch).unwrap(),
            Interest::WriteOnly
        );

        socket.input = b"^cd$".to_vec();
        socket.forbid_reads = true;
        assert_eq!(
            conn.on_readable(&mut socket, &mut scratch).unwrap(),
            Interest::WriteOnly
        );
        assert_eq!(conn.pending(), b"bc");
    }

    #[test]
    fn test_round_trip_scenario() {
        let mut socket = FakeSocket::new(b"^ab$");
        let mut conn = greeted(&mut socket);
        let mut scratch = [0u8; 64];

        assert_eq!(
            conn.on_readable(&mut socket, &mut scratch).unwrap(),
            Interest::WriteOnly
        );
        assert_eq!(conn.on_writable(&mut socket).unwrap(), Interest::ReadOnly);

        assert_eq!(socket.written, b"*bc");
        assert_eq!(conn.sink(), b"ab");

        // Nothing more to read yet.
        assert_eq!(
            conn.on_readable(&mut socket, &mut scratch).unwrap(),
            Interest::ReadOnly
        );
    }

    #[test]
    fn test_out_of_frame_input_stays_read_only() {
        let mut socket = FakeSocket::new(b"noise$$");
        let mut conn = greeted(&mut socket);
        let mut scratch = [0u8; 64];

        assert_eq!(
            conn.on_readable(&mut socket, &mut scratch).unwrap(),
            Interest::ReadOnly
        );
        assert!(conn.pending().is_empty());
        assert!(conn.sink().is_empty());
    }

    #[test]
    fn test_frame_split_across_receives() {
        let mut socket = FakeSocket::new(b"^x$^y$");
        let mut conn = greeted(&mut socket);
        // Two-byte chunks split both frames mid-way.
        let mut scratch = [0u8; 2];

        let mut rounds = 0;
        while !socket.input.is_empty() {
            match conn.on_readable(&mut socket, &mut scratch).unwrap() {
                Interest::WriteOnly => {
                    assert_eq!(conn.on_writable(&mut socket).unwrap(), Interest::ReadOnly);
                }
                Interest::ReadOnly => {}
                other => panic!("unexpected interest {other:?}"),
            }
            rounds += 1;
        }

        assert_eq!(rounds, 3);
        assert_eq!(socket.written, b"*yz");
        assert_eq!(conn.sink(), b"xy");
    }

    #[test]
    fn test_partial_sends_converge() {
        let mut input = vec![b'^'];
        input.extend((0u8..200).filter(|b| *b != b'$'));
        input.push(b'$');
        let expected_sink: Vec<u8> = input[1..input.len() - 1].to_vec();
        let expected_echo: Vec<u8> = expected_sink.iter().map(|b| b.wrapping_add(1)).collect();

        let mut socket = FakeSocket::new(&input);
        socket.accept_per_write = 7;
        let (mut conn, _) = Connection::accept(peer(), Vec::new());
        let mut scratch = [0u8; 1024];

        assert_eq!(conn.on_writable(&mut socket).unwrap(), Interest::ReadOnly);
        assert_eq!(
            conn.on_readable(&mut socket, &mut scratch).unwrap(),
            Interest::WriteOnly
        );

        let mut cycles = 0;
        loop {
            cycles += 1;
            if cycles % 5 == 0 {
                socket.block_next_write = true;
            }
            match conn.on_writable(&mut socket).unwrap() {
                Interest::WriteOnly => continue,
                Interest::ReadOnly => break,
                other => panic!("unexpected interest {other:?}"),
            }
        }

        assert!(cycles > 1);
        assert_eq!(&socket.written[..1], b"*");
        assert_eq!(&socket.written[1..], &expected_echo[..]);
        assert_eq!(conn.sink(), &expected_sink);
    }

    #[test]
    fn test_partial_greeting_keeps_write_interest() {
        let mut socket = FakeSocket::new(b"");
        socket.block_next_write = true;
        let (mut conn, _) = Connection::accept(peer(), Vec::new());

        assert_eq!(conn.on_writable(&mut socket).unwrap(), Interest::WriteOnly);
        assert_eq!(conn.state(), ProtoState::AwaitingGreetingFlush);
        assert_eq!(conn.on_writable(&mut socket).unwrap(), Interest::ReadOnly);
        assert_eq!(socket.written, b"*");
    }

    #[test]
    fn test_idle_writable_wants_both() {
        let mut socket = FakeSocket::new(b"");
        let mut conn = greeted(&mut socket);
        assert_eq!(conn.on_writable(&mut socket).unwrap(), Interest::ReadWrite);
        assert_eq!(socket.written, b"*");
    }

    #[test]
    fn test_eof_closes() {
        let mut socket = FakeSocket::new(b"");
        let mut conn = greeted(&mut socket);
        let mut scratch = [0u8; 16];
        assert_eq!(
            conn.on_readable(&mut EofSocket, &mut scratch).unwrap(),
            Interest::Close
        );
    }

    #[test]
    fn test_spurious_wakeup_stays_read_only() {
        let mut socket = FakeSocket::new(b"");
        let mut conn = greeted(&mut socket);
        let mut scratch = [0u8; 16];
        assert_eq!(
            conn.on_readable(&mut socket, &mut scratch).unwrap(),
            Interest::ReadOnly
        );
        assert_eq!(socket.reads, 1);
    }

    #[test]
    fn test_hard_errors_are_connection_scoped() {
        let mut socket = FakeSocket::new(b"");
        let mut conn = greeted(&mut socket);
        let mut scratch = [0u8; 16];
        assert!(matches!(
            conn.on_readable(&mut ResetSocket, &mut scratch),
            Err(ConnError::Recv(_))
        ));

        let (mut fresh, _) = Connection::accept(peer(), Vec::new());
        assert!(matches!(
            fresh.on_writable(&mut ResetSocket),
            Err(ConnError::Send(_))
        ));
    }

    #[test]
    fn test_write_zero_is_an_error() {
        let (mut conn, _) = Connection::accept(peer(), Vec::new());
        let mut socket = FakeSocket::new(b"");
        socket.accept_per_write = 0;
        assert!(matches!(
            conn.on_writable(&mut socket),
            Err(ConnError::WriteZero)
        ));
    }

    #[test]
    fn test_full_chunk_of_payload_fits() {
        let mut input = vec![b'^'];
        input.extend(std::iter::repeat(b'a').take(2048));
        let mut socket = FakeSocket::new(&input);
        let mut conn = greeted(&mut socket);
        let mut scratch = vec![0u8; 4096];

        // Chunk is clamped to the send buffer capacity.
        assert_eq!(
            conn.on_readable(&mut socket, &mut scratch).unwrap(),
            Interest::WriteOnly
        );
        assert_eq!(conn.pending().len(), 1023);
        assert_eq!(conn.on_writable(&mut socket).unwrap(), Interest::ReadOnly);
        assert_eq!(
            conn.on_readable(&mut socket, &mut scratch).unwrap(),
            Interest::WriteOnly
        );
        assert_eq!(conn.pending().len(), 1024);
    }

    #[test]
    fn test_registry_capacity() {
        let mut registry = ConnectionRegistry::new(2);

        let id1 = registry.insert("a").unwrap();
        let id2 = registry.insert("b").unwrap();
        assert_ne!(id1, id2);

        // At capacity
        assert_eq!(registry.insert("c"), Err("c"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.capacity(), 2);

        assert_eq!(registry.remove(id1), Some("a"));
        assert_eq!(registry.remove(id1), None);
        assert_eq!(registry.get_mut(id2), Some(&mut "b"));
    }
}
