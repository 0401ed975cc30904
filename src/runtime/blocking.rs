//! Blocking strategies: sequential and thread-per-connection.
//!
//! Both hand concurrency to the OS scheduler and use ordinary blocking
//! calls. The greeting is written synchronously before any input is read,
//! so sessions start in `WaitingForStart`.

use crate::protocol::{Action, Session, GREETING};
use crate::runtime::buffer::SEND_CAPACITY;
use crate::runtime::ServerError;
use crate::sink::SinkDir;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::thread;
use tracing::{debug, info, warn};

/// Serve one peer at a time on the calling thread.
pub fn serve_sequential(listener: TcpListener, sinks: &SinkDir) -> Result<(), ServerError> {
    loop {
        let (stream, peer) = match accept(&listener)? {
            Some(accepted) => accepted,
            None => continue,
        };
        info!(peer = %peer, "Peer connected");

        let sink = sinks.open(stream.as_raw_fd());
        match serve_connection(stream, sink) {
            Ok(()) => info!(peer = %peer, "Peer done"),
            Err(e) => warn!(peer = %peer, error = %e, "Connection failed"),
        }
    }
}

/// Serve every peer on its own OS thread.
pub fn serve_threaded(listener: TcpListener, sinks: &SinkDir) -> Result<(), ServerError> {
    let mut next_id: u64 = 0;
    loop {
        let (stream, peer) = match accept(&listener)? {
            Some(accepted) => accepted,
            None => continue,
        };
        info!(peer = %peer, "Peer connected");

        let sink = sinks.open(stream.as_raw_fd());
        let name = format!("conn-{next_id}");
        next_id += 1;

        let spawned = thread::Builder::new().name(name).spawn(move || {
            debug!(peer = %peer, "Thread started");
            match serve_connection(stream, sink) {
                Ok(()) => info!(peer = %peer, "Peer done"),
                Err(e) => warn!(peer = %peer, error = %e, "Connection failed"),
            }
        });

        // The stream moved into the closure is dropped (closed) on failure.
        if let Err(e) = spawned {
            warn!(peer = %peer, error = %e, "Failed to spawn connection thread");
        }
    }
}

/// Blocking accept; transient failures yield `None`.
fn accept(listener: &TcpListener) -> Result<Option<(TcpStream, SocketAddr)>, ServerError> {
    match listener.accept() {
        Ok(accepted) => Ok(Some(accepted)),
        Err(ref e)
            if matches!(
                e.kind(),
                io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted
            ) =>
        {
            warn!(error = %e, "Accept failed, continuing");
            Ok(None)
        }
        Err(e) => Err(ServerError::Accept(e)),
    }
}

/// Run the protocol over a blocking stream until the peer half-closes.
pub fn serve_connection<S, K>(mut stream: S, mut sink: K) -> io::Result<()>
where
    S: Read + Write,
    K: Write,
{
    stream.write_all(&[GREETING])?;

    let mut session = Session::streaming();
    let mut buf = [0u8; SEND_CAPACITY];
    let mut echo = Vec::with_capacity(SEND_CAPACITY);

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        echo.clear();
        let mut kept = 0;
        for i in 0..n {
            if let Action::Payload { persist, echo: out } = session.consume(buf[i]) {
                buf[kept] = persist;
                kept += 1;
                echo.push(out);
            }
        }

        if kept > 0 {
            sink.write_all(&buf[..kept])?;
            stream.write_all(&echo)?;
        }
    }

    sink.flush()
}
