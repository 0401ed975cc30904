//! Readiness interest returned by the connection handlers.

/// What a connection wants to be woken up for next.
///
/// Handlers return one of these after every invocation and the reactor
/// re-submits it to the backend. `Close` is never registered; it tells the
/// reactor to tear the connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    ReadOnly,
    WriteOnly,
    ReadWrite,
    Close,
}

impl Interest {
    /// Build from a pair of flags. Neither flag set means `Close`.
    pub fn from_flags(read: bool, write: bool) -> Self {
        match (read, write) {
            (true, false) => Interest::ReadOnly,
            (false, true) => Interest::WriteOnly,
            (true, true) => Interest::ReadWrite,
            (false, false) => Interest::Close,
        }
    }

    pub fn wants_read(self) -> bool {
        matches!(self, Interest::ReadOnly | Interest::ReadWrite)
    }

    pub fn wants_write(self) -> bool {
        matches!(self, Interest::WriteOnly | Interest::ReadWrite)
    }

    pub fn is_close(self) -> bool {
        self == Interest::Close
    }
}
