use bytes::{Buf, BytesMut};

/// Size of one non-blocking read from the socket
pub const READ_CHUNK: usize = 16 * 1024;

/// A set of reusable buffers for PostgreSQL protocol communication
///
/// `Conn` uses a single `BufferSet` for all its operations.
#[derive(Debug, Default)]
pub struct BufferSet {
    /// Bytes received but not yet parsed into backend messages.
    pub read_buffer: BytesMut,

    /// Encoded frontend messages not yet accepted by the socket.
    /// Messages are appended at the back; flushing consumes from the front.
    write_buffer: BytesMut,
}

impl BufferSet {
    /// Create a new empty buffer set
    pub fn new() -> Self {
        Self::default()
    }

    /// Get mutable access to the write buffer for appending messages.
    #[inline]
    pub fn write_buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.write_buffer
    }

    /// Bytes still waiting to be written.
    #[inline]
    pub fn pending_output(&self) -> &[u8] {
        &self.write_buffer
    }

    /// Drop `written` bytes from the front after the socket accepted them.
    #[inline]
    pub fn advance_output(&mut self, written: usize) {
        self.write_buffer.advance(written);
    }

    #[inline]
    pub fn has_pending_output(&self) -> bool {
        !self.write_buffer.is_empty()
    }
}
