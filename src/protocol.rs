//! Marker-delimited echo protocol.
//!
//! Pure per-connection state machine with no I/O awareness:
//!
//! ```text
//! Server:  *                      (greeting, before any input is processed)
//! Client:  junk^ab$more^c$
//! Server:  bcd                    (each payload byte incremented, mod 256)
//! Sink:    abc                    (each payload byte, unmodified)
//! ```
//!
//! Bytes outside a `^ ... $` frame are ignored. Marker bytes are never
//! echoed or persisted.

/// First byte sent to every peer.
pub const GREETING: u8 = b'*';
/// Opens a message frame.
pub const START_MARKER: u8 = b'^';
/// Closes a message frame.
pub const END_MARKER: u8 = b'$';

/// Protocol state of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoState {
    /// The greeting has not been fully sent yet. No input may be consumed.
    AwaitingGreetingFlush,
    /// Outside a frame; everything but `^` is discarded.
    WaitingForStart,
    /// Inside a frame; everything but `$` is payload.
    InMessage,
}

/// Outcome of consuming one input byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Marker or out-of-frame byte: nothing to send or persist.
    Skip,
    /// Payload byte: persist `persist`, send `echo`.
    Payload { persist: u8, echo: u8 },
}

/// Per-connection protocol state machine.
#[derive(Debug, Clone)]
pub struct Session {
    state: ProtoState,
}

impl Session {
    /// A fresh session whose greeting still has to be flushed.
    pub fn new() -> Self {
        Self {
            state: ProtoState::AwaitingGreetingFlush,
        }
    }

    /// A session for callers that send the greeting synchronously before
    /// reading anything.
    pub fn streaming() -> Self {
        Self {
            state: ProtoState::WaitingForStart,
        }
    }

    pub fn state(&self) -> ProtoState {
        self.state
    }

    /// Record that the greeting has left the send buffer.
    pub fn greeting_flushed(&mut self) {
        if self.state == ProtoState::AwaitingGreetingFlush {
            self.state = ProtoState::WaitingForStart;
        }
    }

    /// Advance the machine by one received byte.
    ///
    /// # Panics
    /// Panics if called before the greeting was flushed. Callers must not
    /// read from the peer while the greeting is still pending.
    pub fn consume(&mut self, byte: u8) -> Action {
        match self.state {
            ProtoState::AwaitingGreetingFlush => {
                panic!("input consumed before the greeting was flushed")
            }
            ProtoState::WaitingForStart => {
                if byte == START_MARKER {
                    self.state = ProtoState::InMessage;
                }
                Action::Skip
            }
            ProtoState::InMessage => {
                if byte == END_MARKER {
                    self.state = ProtoState::WaitingForStart;
                    Action::Skip
                } else {
                    Action::Payload {
                        persist: byte,
                        echo: byte.wrapping_add(1),
                    }
                }
            }
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
