//! Reassembly of arbitrary chunk streams stays within its ceiling and never
//! panics, and chunked messages come back intact whatever the delivery order.

#![no_main]

use std::time::Instant;

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use pairlink_core::reassembly::Unchunker;
use pairlink_proto::Chunker;

const CEILING: usize = 64 * 1024;

#[derive(Debug, Arbitrary)]
struct Input {
    /// Raw frames fed straight to the reassembler
    raw: Vec<Vec<u8>>,
    /// Messages chunked properly, then delivered in a permuted order
    messages: Vec<Vec<u8>>,
    chunk_size: u8,
    order: Vec<u16>,
}

fuzz_target!(|input: Input| {
    let now = Instant::now();

    let mut unchunker = Unchunker::new(CEILING);
    for frame in input.raw {
        let _ = unchunker.add(Bytes::from(frame), now);
        assert!(unchunker.buffered_bytes() <= CEILING);
    }

    let chunk_size = usize::from(input.chunk_size).max(16);
    let mut chunker = Chunker::new();
    let mut frames = Vec::new();
    for message in &input.messages {
        let Ok(chunks) = chunker.chunk(message, chunk_size) else {
            return;
        };
        frames.extend(chunks);
    }
    for (i, swap) in input.order.iter().enumerate() {
        if frames.is_empty() {
            break;
        }
        let a = i % frames.len();
        let b = usize::from(*swap) % frames.len();
        frames.swap(a, b);
    }

    let mut unchunker = Unchunker::new(usize::MAX);
    let mut delivered = Vec::new();
    for frame in frames {
        if let Some(message) = unchunker.add(frame, now).expect("well-formed chunk") {
            delivered.push(message);
        }
    }

    let mut expected = input.messages;
    expected.sort();
    delivered.sort();
    assert_eq!(delivered, expected);
    assert_eq!(unchunker.pending_messages(), 0);
});
