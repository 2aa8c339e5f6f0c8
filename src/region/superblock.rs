//! # Superblock Definition
//!
//! The superblock is the 64-byte metadata record at offset 0 of the region.
//! It carries the magic tag, format version, the committed root offset, the
//! region geometry, the tree configuration, and the whole-region checksum.
//!
//! ## Layout (little-endian, 64 bytes)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -------------
//! 0       8     magic (0x4154524545)
//! 8       4     version (=1)
//! 12      4     padding
//! 16      8     root_offset
//! 24      8     block_count
//! 32      8     block_size
//! 40      4     max_keys
//! 44      4     min_keys
//! 48      4     leaf_capacity
//! 52      4     reserved
//! 56      8     checksum
//! ```
//!
//! ## Zerocopy Safety
//!
//! The struct derives the zerocopy traits so it can be read and written
//! directly in the mapped region without copying: `FromBytes` (safe to view
//! over arbitrary bytes), `IntoBytes`, `Immutable`, `KnownLayout`, and
//! `Unaligned` (every field type tolerates the 1-byte alignment mmap slices
//! guarantee).
//!
//! Parsing never validates the magic: the recovery policy is permissive, so
//! the opener inspects [`Superblock::has_valid_magic`] and reports rather
//! than fails.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Identifies an nvtree region ("ATREE" in ASCII).
pub const REGION_MAGIC: u64 = 0x41_54_52_45_45;

/// Current on-media format version.
pub const REGION_VERSION: u32 = 1;

/// Size of the superblock in bytes.
pub const SUPERBLOCK_SIZE: usize = 64;

/// Byte offset of the checksum field, the one word the whole-region
/// checksum skips.
pub const SUPERBLOCK_CHECKSUM_OFFSET: usize = 56;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Superblock {
    magic: U64,
    version: U32,
    padding: U32,
    root_offset: U64,
    block_count: U64,
    block_size: U64,
    max_keys: U32,
    min_keys: U32,
    leaf_capacity: U32,
    reserved: U32,
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<Superblock>() == SUPERBLOCK_SIZE);

impl Superblock {
    pub fn new(block_count: u64, block_size: u64) -> Self {
        Self {
            magic: U64::new(REGION_MAGIC),
            version: U32::new(REGION_VERSION),
            padding: U32::new(0),
            root_offset: U64::new(0),
            block_count: U64::new(block_count),
            block_size: U64::new(block_size),
            max_keys: U32::new(0),
            min_keys: U32::new(0),
            leaf_capacity: U32::new(0),
            reserved: U32::new(0),
            checksum: U64::new(0),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= SUPERBLOCK_SIZE,
            "buffer too small for Superblock: {} < {}",
            bytes.len(),
            SUPERBLOCK_SIZE
        );

        Self::ref_from_bytes(&bytes[..SUPERBLOCK_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse Superblock: {:?}", e))
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            bytes.len() >= SUPERBLOCK_SIZE,
            "buffer too small for Superblock: {} < {}",
            bytes.len(),
            SUPERBLOCK_SIZE
        );

        Self::mut_from_bytes(&mut bytes[..SUPERBLOCK_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse Superblock: {:?}", e))
    }

    pub fn magic(&self) -> u64 {
        self.magic.get()
    }

    pub fn has_valid_magic(&self) -> bool {
        self.magic.get() == REGION_MAGIC
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn root_offset(&self) -> u64 {
        self.root_offset.get()
    }

    pub fn set_root_offset(&mut self, offset: u64) {
        self.root_offset = U64::new(offset);
    }

    pub fn block_count(&self) -> u64 {
        self.block_count.get()
    }

    pub fn block_size(&self) -> u64 {
        self.block_size.get()
    }

    pub fn max_keys(&self) -> u32 {
        self.max_keys.get()
    }

    pub fn min_keys(&self) -> u32 {
        self.min_keys.get()
    }

    pub fn leaf_capacity(&self) -> u32 {
        self.leaf_capacity.get()
    }

    pub fn set_tree_config(&mut self, max_keys: u32, min_keys: u32, leaf_capacity: u32) {
        self.max_keys = U32::new(max_keys);
        self.min_keys = U32::new(min_keys);
        self.leaf_capacity = U32::new(leaf_capacity);
    }

    pub fn checksum(&self) -> u64 {
        self.checksum.get()
    }

    pub fn set_checksum(&mut self, checksum: u64) {
        self.checksum = U64::new(checksum);
    }
}
