//! # Persistent Region Layout and Management
//!
//! This module owns the memory-mapped region every other component builds
//! on: one backing file divided into fixed-size blocks, fronted by a
//! superblock and an allocation bitmap.
//!
//! ## Region Layout
//!
//! ```text
//! Offset  Size                 Content
//! ------  -------------------  ---------------------------------------
//! 0       64                   Superblock (magic, config, root, checksum)
//! 64      8 * ceil(blocks/64)  Allocation bitmap, LSB-first per word
//! ...     padding              up to the next block boundary
//! k*bs    block_size each      Tree blocks, addressed by byte offset
//! ```
//!
//! The blocks covering the superblock and the bitmap are reserved at
//! creation and can never be freed; offset 0 doubles as the null sentinel
//! for tree links, which works precisely because the superblock occupies it
//! and no node can ever be placed there.
//!
//! ## Integrity
//!
//! Two checksums guard the region:
//!
//! - a whole-region checksum in the superblock: XOR over every 8-byte
//!   little-endian word of `rotate_left(word, 1)`, skipping the checksum
//!   word itself. Rotation makes each word's position matter, so zero runs
//!   and swapped words still flip the sum, and skipping the field lets it
//!   live inside the region it covers;
//! - a per-node CRC-32 stored in each node header (see [`crate::tree`]).
//!
//! On reopen the whole-region checksum is recomputed and compared; a
//! mismatch (or a bad magic) is reported to the log sink and the open
//! continues, so a corrupted region stays inspectable. Callers that want
//! strictness check [`Manager::verify_integrity`] themselves.
//!
//! ## Module Organization
//!
//! - `superblock`: the 64-byte on-media metadata struct
//! - `manager`: mapping lifecycle, block allocation, checksums, durability
//!   wrappers

mod manager;
mod superblock;

pub use manager::Manager;
pub use superblock::{
    Superblock, REGION_MAGIC, REGION_VERSION, SUPERBLOCK_CHECKSUM_OFFSET, SUPERBLOCK_SIZE,
};

use std::fmt;

/// Byte offset of the allocation bitmap (the superblock rounded up to 8).
pub const BITMAP_OFFSET: usize = align_up_8(SUPERBLOCK_SIZE);

/// Number of 64-bit bitmap words needed to track `block_count` blocks.
pub const fn bitmap_words(block_count: usize) -> usize {
    block_count.div_ceil(64)
}

/// Rounds `value` up to the next multiple of 8.
pub const fn align_up_8(value: usize) -> usize {
    (value + 7) & !7
}

/// Returned by [`Manager::alloc_block`] when every block is allocated.
///
/// Carried inside [`eyre::Report`]; callers distinguish exhaustion from
/// other failures with `err.downcast_ref::<OutOfSpace>()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfSpace {
    /// Total number of blocks in the region, all of them allocated.
    pub block_count: usize,
}

impl fmt::Display for OutOfSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "region out of space: all {} blocks allocated",
            self.block_count
        )
    }
}

impl std::error::Error for OutOfSpace {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_starts_at_superblock_end() {
        assert_eq!(BITMAP_OFFSET, 64);
    }

    #[test]
    fn bitmap_words_rounds_up() {
        assert_eq!(bitmap_words(1), 1);
        assert_eq!(bitmap_words(64), 1);
        assert_eq!(bitmap_words(65), 2);
        assert_eq!(bitmap_words(256), 4);
    }

    #[test]
    fn align_up_8_is_idempotent_on_multiples() {
        assert_eq!(align_up_8(0), 0);
        assert_eq!(align_up_8(1), 8);
        assert_eq!(align_up_8(8), 8);
        assert_eq!(align_up_8(63), 64);
    }

    #[test]
    fn out_of_space_downcasts_through_eyre() {
        let report = eyre::Report::new(OutOfSpace { block_count: 16 });

        let err = report.downcast_ref::<OutOfSpace>().unwrap();
        assert_eq!(err.block_count, 16);
        assert!(report.to_string().contains("16 blocks"));
    }
}
