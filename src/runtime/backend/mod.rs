//! Readiness multiplexing backends.
//!
//! Two interchangeable adapters behind one interface:
//! - `select`: bitmap of descriptors, `O(highest fd)` per wait, capped at
//!   `FD_SETSIZE`
//! - `mio_impl`: kernel readiness queue (epoll on Linux, kqueue on macOS),
//!   `O(ready)` per wait
//!
//! Both deliver level-triggered semantics to the reactor as long as it
//! re-submits interest after every handler call, which it always does.

mod mio_impl;
mod select;

pub use mio_impl::MioBackend;
pub use select::SelectBackend;

use crate::runtime::interest::Interest;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// One ready handle reported by [`Backend::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
}

/// Uniform registration interface over a readiness notification primitive.
///
/// `token` is the caller's identifier for `fd` and is what `wait` reports.
/// [`Interest::Close`] is never a valid registration.
pub trait Backend {
    /// Start watching `fd`.
    fn register(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()>;

    /// Replace the interest of an already registered `fd`.
    fn reregister(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()>;

    /// Stop watching `fd`.
    fn deregister(&mut self, fd: RawFd, token: usize) -> io::Result<()>;

    /// Block until at least one registered handle is ready (or `timeout`
    /// elapses) and replace the contents of `ready` with what fired.
    ///
    /// An interrupted wait returns `Ok` with `ready` empty.
    fn wait(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()>;

    /// Short name for diagnostics.
    fn name(&self) -> &'static str;
}

fn close_not_registrable() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        "close is not a registrable interest",
    )
}
