//! Chunk option flags.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Options byte at the start of every chunk.
    ///
    /// Only the lowest bit is defined. Unknown bits are preserved on parse
    /// and ignored by reassembly.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ChunkFlags: u8 {
        /// This chunk carries the last bytes of its message
        const END_OF_MESSAGE = 0b0000_0001;
    }
}

impl ChunkFlags {
    /// Check whether the end-of-message bit is set.
    pub fn is_end(self) -> bool {
        self.contains(Self::END_OF_MESSAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_bit() {
        assert!(ChunkFlags::END_OF_MESSAGE.is_end());
        assert!(!ChunkFlags::empty().is_end());
        assert!(ChunkFlags::from_bits_retain(0b1000_0001).is_end());
    }
}
