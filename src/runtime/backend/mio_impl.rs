//! mio backend.
//!
//! Interest is kept in the kernel's readiness queue (epoll on Linux, kqueue
//! on macOS) and a wait only returns handles that are actually ready.
//!
//! mio registers edge-triggered. Each `reregister` re-arms the kernel
//! registration and re-evaluates current readiness, so a handle that is
//! still readable or writable is reported again after the reactor
//! re-submits its interest. That gives the reactor the same level-triggered
//! view as the select backend.

use super::{close_not_registrable, Backend, Readiness};
use crate::runtime::interest::Interest;
use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct MioBackend {
    poll: Poll,
    events: Events,
}

impl MioBackend {
    /// Create a backend that reports at most `capacity` events per wait.
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.max(1)),
        })
    }
}

fn to_mio(interest: Interest) -> io::Result<mio::Interest> {
    match interest {
        Interest::ReadOnly => Ok(mio::Interest::READABLE),
        Interest::WriteOnly => Ok(mio::Interest::WRITABLE),
        Interest::ReadWrite => Ok(mio::Interest::READABLE | mio::Interest::WRITABLE),
        Interest::Close => Err(close_not_registrable()),
    }
}

impl Backend for MioBackend {
    fn register(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let interest = to_mio(interest)?;
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(token), interest)
    }

    fn reregister(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let interest = to_mio(interest)?;
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(token), interest)
    }

    fn deregister(&mut self, fd: RawFd, _token: usize) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn wait(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        ready.clear();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            // Hang-ups and socket errors are surfaced as readiness so the
            // next recv/send observes EOF or the pending error.
            let error = event.is_error();
            ready.push(Readiness {
                token: event.token().0,
                readable: event.is_readable() || event.is_read_closed() || error,
                writable: event.is_writable() || event.is_write_closed() || error,
            });
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "mio"
    }
}
