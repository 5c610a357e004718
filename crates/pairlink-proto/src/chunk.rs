//! Chunk framing.
//!
//! A message larger than the transport's maximum message size is split into
//! chunks that share a message id and carry increasing serial numbers. The
//! last chunk sets [`ChunkFlags::END_OF_MESSAGE`].
//!
//! # Layout
//!
//! ```text
//! offset  size  field
//! 0       1     options (ChunkFlags)
//! 1       4     message id, big endian
//! 5       4     serial, big endian
//! 9       ..    payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    errors::{ProtocolError, Result},
    flags::ChunkFlags,
};

/// Size of the fixed chunk header in bytes.
pub const CHUNK_HEADER_SIZE: usize = 9;

/// Parsed chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Options byte
    pub flags: ChunkFlags,
    /// Message this chunk belongs to
    pub message_id: u32,
    /// Position of this chunk within its message, starting at 0
    pub serial: u32,
}

impl ChunkHeader {
    /// Whether this is the final chunk of its message.
    pub fn is_end(&self) -> bool {
        self.flags.is_end()
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.message_id);
        buf.put_u32(self.serial);
    }
}

/// One chunk: header plus a slice of the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk header
    pub header: ChunkHeader,
    /// Payload bytes (may be empty for an empty message)
    pub payload: Bytes,
}

impl Chunk {
    /// Parse a chunk received from the wire.
    ///
    /// # Errors
    ///
    /// Returns `ChunkTooShort` if fewer than [`CHUNK_HEADER_SIZE`] bytes are
    /// present.
    pub fn parse(mut bytes: Bytes) -> Result<Self> {
        if bytes.len() < CHUNK_HEADER_SIZE {
            return Err(ProtocolError::ChunkTooShort(bytes.len()));
        }

        let flags = ChunkFlags::from_bits_retain(bytes.get_u8());
        let message_id = bytes.get_u32();
        let serial = bytes.get_u32();

        Ok(Self { header: ChunkHeader { flags, message_id, serial }, payload: bytes })
    }

    /// Serialize header and payload into one buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE + self.payload.len());
        self.header.put(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Splits outgoing messages into chunks.
///
/// Each call to [`Chunker::chunk`] consumes one message id. Ids wrap at
/// `u32::MAX`; the reassembler only needs them to be distinct among messages
/// in flight.
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    next_message_id: u32,
}

impl Chunker {
    /// Create a chunker starting at message id 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `message` into encoded chunks of at most `chunk_size` bytes.
    ///
    /// An empty message still produces one (empty, final) chunk.
    ///
    /// # Errors
    ///
    /// Returns `ChunkSizeTooSmall` if `chunk_size` cannot hold the header
    /// plus at least one payload byte.
    pub fn chunk(&mut self, message: &[u8], chunk_size: usize) -> Result<Vec<Bytes>> {
        if chunk_size <= CHUNK_HEADER_SIZE {
            return Err(ProtocolError::ChunkSizeTooSmall(chunk_size));
        }

        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);

        let per_chunk = chunk_size - CHUNK_HEADER_SIZE;
        if message.is_empty() {
            let header = ChunkHeader { flags: ChunkFlags::END_OF_MESSAGE, message_id, serial: 0 };
            return Ok(vec![Chunk { header, payload: Bytes::new() }.encode()]);
        }

        let count = message.len().div_ceil(per_chunk);
        let chunks = message
            .chunks(per_chunk)
            .enumerate()
            .map(|(index, piece)| {
                let flags =
                    if index + 1 == count { ChunkFlags::END_OF_MESSAGE } else { ChunkFlags::empty() };
                let header = ChunkHeader { flags, message_id, serial: index as u32 };
                Chunk { header, payload: Bytes::copy_from_slice(piece) }.encode()
            })
            .collect();

        Ok(chunks)
    }
}
