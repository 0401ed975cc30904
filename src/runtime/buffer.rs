//! Fixed-capacity send buffer.
//!
//! Holds bytes queued for a peer between readiness events. The buffer never
//! grows: the handlers only read from a peer once the previous output has
//! fully drained, and every received byte produces at most one output byte,
//! so a receive of at most `capacity` bytes always fits.

/// Capacity of each connection's send buffer, and the receive chunk size.
pub const SEND_CAPACITY: usize = 1024;

/// Bounded outgoing byte queue with a send cursor.
///
/// Invariant: `0 <= cursor <= end <= capacity`.
pub struct SendBuffer {
    data: Box<[u8]>,
    /// Next byte to transmit.
    cursor: usize,
    /// One past the last queued byte.
    end: usize,
}

impl SendBuffer {
    /// Create an empty buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(SEND_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            cursor: 0,
            end: 0,
        }
    }

    /// Queue one byte.
    ///
    /// # Panics
    /// Panics if the buffer is full. That can only happen if a caller reads
    /// more than `capacity` bytes ahead of its own unsent output.
    pub fn push(&mut self, byte: u8) {
        assert!(
            self.end < self.data.len(),
            "send buffer overflow (capacity {})",
            self.data.len()
        );
        self.data[self.end] = byte;
        self.end += 1;
    }

    /// Bytes queued but not yet sent.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.cursor..self.end]
    }

    /// True when nothing is waiting to be sent.
    pub fn is_drained(&self) -> bool {
        self.cursor >= self.end
    }

    /// Record that `n` pending bytes were sent. Once everything queued has
    /// gone out both indices rewind to zero.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.end - self.cursor, "advanced past end");
        self.cursor = (self.cursor + n).min(self.end);
        if self.cursor == self.end {
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        self.end = 0;
    }

    #[cfg(test)]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[cfg(test)]
    pub fn end(&self) -> usize {
        self.end
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::new()
    }
}
