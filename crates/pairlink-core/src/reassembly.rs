//! Chunk reassembly.
//!
//! Chunks of one message share a message id and arrive with serial numbers
//! 0..=end. Delivery may interleave chunks of different messages, and nothing
//! forbids reordering within a message, so chunks are keyed by serial and a
//! message completes once the end chunk and every serial before it are
//! present.
//!
//! The total number of buffered payload bytes is capped. Crossing the cap is
//! reported as resource exhaustion so the connection can tell the peer it ran
//! out of memory before it fails.

use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use bytes::Bytes;
use pairlink_proto::Chunk;

use crate::error::ReassemblyError;

#[derive(Debug)]
struct PartialMessage {
    chunks: BTreeMap<u32, Bytes>,
    end_serial: Option<u32>,
    size: usize,
    last_update: Instant,
}

impl PartialMessage {
    fn new(now: Instant) -> Self {
        Self { chunks: BTreeMap::new(), end_serial: None, size: 0, last_update: now }
    }

    fn is_complete(&self) -> bool {
        self.end_serial.is_some_and(|end| self.chunks.len() == end as usize + 1)
    }

    fn into_message(self) -> Vec<u8> {
        let mut message = Vec::with_capacity(self.size);
        for payload in self.chunks.into_values() {
            message.extend_from_slice(&payload);
        }
        message
    }
}

/// Reassembles chunked messages for one data channel.
#[derive(Debug)]
pub struct Unchunker {
    messages: HashMap<u32, PartialMessage>,
    buffered: usize,
    max_buffered: usize,
}

impl Unchunker {
    /// Create a reassembler holding at most `max_buffered` payload bytes.
    pub fn new(max_buffered: usize) -> Self {
        Self { messages: HashMap::new(), buffered: 0, max_buffered }
    }

    /// Payload bytes currently held for incomplete messages.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    /// Number of incomplete messages.
    pub fn pending_messages(&self) -> usize {
        self.messages.len()
    }

    /// Add one raw chunk.
    ///
    /// Returns the complete message once its last missing chunk arrives.
    ///
    /// # Errors
    ///
    /// - `Chunk` if the chunk header cannot be parsed
    /// - `DuplicateChunk` / `BeyondEnd` for inconsistent serials
    /// - `TooLarge` if buffering the chunk would exceed the ceiling; the
    ///   partial message is discarded
    pub fn add(&mut self, raw: Bytes, now: Instant) -> Result<Option<Vec<u8>>, ReassemblyError> {
        let Chunk { header, payload } = Chunk::parse(raw)?;
        let message_id = header.message_id;

        let size = self.buffered + payload.len();
        if size > self.max_buffered {
            if let Some(partial) = self.messages.remove(&message_id) {
                self.buffered -= partial.size;
            }
            return Err(ReassemblyError::TooLarge { size, max: self.max_buffered });
        }

        let partial = self.messages.entry(message_id).or_insert_with(|| PartialMessage::new(now));

        if let Some(end) = partial.end_serial
            && header.serial > end
        {
            return Err(ReassemblyError::BeyondEnd { message_id, serial: header.serial, end });
        }
        if header.is_end() {
            if let Some(highest) = partial.chunks.keys().next_back()
                && *highest > header.serial
            {
                return Err(ReassemblyError::BeyondEnd {
                    message_id,
                    serial: *highest,
                    end: header.serial,
                });
            }
            partial.end_serial = Some(header.serial);
        }
        if partial.chunks.contains_key(&header.serial) {
            return Err(ReassemblyError::DuplicateChunk { message_id, serial: header.serial });
        }

        let len = payload.len();
        partial.size += len;
        partial.last_update = now;
        partial.chunks.insert(header.serial, payload);
        self.buffered += len;

        if !partial.is_complete() {
            return Ok(None);
        }

        let Some(partial) = self.messages.remove(&message_id) else {
            return Ok(None);
        };
        self.buffered -= partial.size;
        Ok(Some(partial.into_message()))
    }

    /// Drop incomplete messages untouched for longer than `max_age`.
    ///
    /// Returns the number of messages dropped.
    pub fn gc(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.messages.len();
        let mut freed = 0;
        self.messages.retain(|_, partial| {
            let keep = now.saturating_duration_since(partial.last_update) <= max_age;
            if !keep {
                freed += partial.size;
            }
            keep
        });
        self.buffered -= freed;
        before - self.messages.len()
    }
}

#[cfg(test)]
mod tests {
    use pairlink_proto::{ChunkFlags, ChunkHeader, Chunker};

    use super::*;

    fn raw(message_id: u32, serial: u32, end: bool, payload: &[u8]) -> Bytes {
        let flags = if end { ChunkFlags::END_OF_MESSAGE } else { ChunkFlags::empty() };
        let header = ChunkHeader { flags, message_id, serial };
        Chunk { header, payload: Bytes::copy_from_slice(payload) }.encode()
    }

    #[test]
    fn reassembles_in_order() {
        let now = Instant::now();
        let mut unchunker = Unchunker::new(1024);
        let mut chunker = Chunker::new();

        let chunks = chunker.chunk(b"hello world", 12).expect("chunking");
        let mut result = None;
        for chunk in chunks {
            result = unchunker.add(chunk, now).expect("valid chunk");
        }

        assert_eq!(result.as_deref(), Some(&b"hello world"[..]));
        assert_eq!(unchunker.buffered_bytes(), 0);
        assert_eq!(unchunker.pending_messages(), 0);
    }

    #[test]
    fn reassembles_out_of_order_and_interleaved() {
        let now = Instant::now();
        let mut unchunker = Unchunker::new(1024);

        assert_eq!(unchunker.add(raw(1, 1, true, b"cd"), now), Ok(None));
        assert_eq!(unchunker.add(raw(2, 0, true, b"xy"), now), Ok(Some(b"xy".to_vec())));
        assert_eq!(unchunker.add(raw(1, 0, false, b"ab"), now), Ok(Some(b"abcd".to_vec())));
    }

    #[test]
    fn ceiling_is_resource_exhaustion() {
        let now = Instant::now();
        let mut unchunker = Unchunker::new(4);

        assert_eq!(unchunker.add(raw(1, 0, false, b"abc"), now), Ok(None));
        let err = unchunker.add(raw(1, 1, false, b"de"), now).expect_err("over ceiling");

        assert!(err.is_resource_exhaustion());
        assert_eq!(unchunker.buffered_bytes(), 0);
        assert_eq!(unchunker.pending_messages(), 0);
    }

    #[test]
    fn duplicate_serial_rejected() {
        let now = Instant::now();
        let mut unchunker = Unchunker::new(64);

        unchunker.add(raw(3, 0, false, b"a"), now).expect("first");
        let err = unchunker.add(raw(3, 0, false, b"a"), now).expect_err("duplicate");
        assert_eq!(err, ReassemblyError::DuplicateChunk { message_id: 3, serial: 0 });
        assert!(!err.is_resource_exhaustion());
    }

    #[test]
    fn serial_beyond_end_rejected() {
        let now = Instant::now();
        let mut unchunker = Unchunker::new(64);

        unchunker.add(raw(4, 1, true, b"b"), now).expect("end");
        let err = unchunker.add(raw(4, 2, false, b"c"), now).expect_err("beyond end");
        assert!(matches!(err, ReassemblyError::BeyondEnd { end: 1, .. }));
    }

    #[test]
    fn gc_drops_stale_partials() {
        let start = Instant::now();
        let mut unchunker = Unchunker::new(64);

        unchunker.add(raw(1, 0, false, b"old"), start).expect("chunk");
        let later = start + Duration::from_secs(30);
        unchunker.add(raw(2, 0, false, b"new"), later).expect("chunk");

        let dropped = unchunker.gc(start + Duration::from_secs(61), Duration::from_secs(60));

        assert_eq!(dropped, 1);
        assert_eq!(unchunker.pending_messages(), 1);
        assert_eq!(unchunker.buffered_bytes(), 3);
    }

    #[test]
    fn garbage_chunk_is_parse_error() {
        let mut unchunker = Unchunker::new(64);
        let err = unchunker.add(Bytes::from_static(&[1, 2]), Instant::now()).expect_err("short");
        assert!(matches!(err, ReassemblyError::Chunk(_)));
    }
}
