//! Unbounded flow-controlled sender.
//!
//! A data channel accepts writes until its native buffer reaches the high
//! water mark. Past that point frames wait in an unbounded local queue and
//! are released once the native side reports that its buffered amount fell
//! to the low water mark.
//!
//! The sender never blocks and never drops. Backpressure shows up as a
//! growing [`FlowControlledSender::queued_bytes`].

use std::collections::VecDeque;

use bytes::Bytes;

/// Queue in front of one data channel.
#[derive(Debug)]
pub struct FlowControlledSender {
    low_water_mark: usize,
    high_water_mark: usize,
    buffered: usize,
    queue: VecDeque<Bytes>,
    queued: usize,
}

impl FlowControlledSender {
    /// Create a sender with the given water marks (bytes).
    pub fn new(low_water_mark: usize, high_water_mark: usize) -> Self {
        Self {
            low_water_mark,
            high_water_mark: high_water_mark.max(low_water_mark),
            buffered: 0,
            queue: VecDeque::new(),
            queued: 0,
        }
    }

    /// Low water mark to register as the native buffered-amount-low threshold.
    pub fn low_water_mark(&self) -> usize {
        self.low_water_mark
    }

    /// Bytes waiting locally.
    pub fn queued_bytes(&self) -> usize {
        self.queued
    }

    /// Frames waiting locally.
    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    /// Offer a frame. Returns the frames that may go to the channel now.
    ///
    /// Frames leave in the order they were written.
    pub fn write(&mut self, frame: Bytes) -> Vec<Bytes> {
        if !self.queue.is_empty() || self.buffered >= self.high_water_mark {
            self.queued += frame.len();
            self.queue.push_back(frame);
            return Vec::new();
        }

        self.buffered += frame.len();
        vec![frame]
    }

    /// Native buffered amount changed. Returns frames released by the drain.
    pub fn buffered_amount_changed(&mut self, amount: usize) -> Vec<Bytes> {
        self.buffered = amount;
        if amount > self.low_water_mark {
            return Vec::new();
        }

        let mut ready = Vec::new();
        while self.buffered < self.high_water_mark {
            let Some(frame) = self.queue.pop_front() else { break };
            self.queued -= frame.len();
            self.buffered += frame.len();
            ready.push(frame);
        }
        ready
    }
}
