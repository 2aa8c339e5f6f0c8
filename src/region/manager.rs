//! # Region Manager
//!
//! `Manager` owns the mapping of one backing file that emulates a
//! byte-addressable persistent-memory region. It divides the region into
//! fixed-size blocks, tracks them in the in-region allocation bitmap,
//! commits the tree root through the superblock, and maintains the
//! whole-region checksum.
//!
//! ## Open / Create
//!
//! Creating truncates the file to the region size, maps it read-write,
//! reserves the blocks covering the superblock and bitmap, stamps the
//! superblock, and persists everything. Reopening maps the existing file,
//! rebuilds the allocated-block count by popcount over the bitmap, and
//! validates magic and checksum. Validation failures are *reported, not
//! thrown*: the region stays open so its contents can be inspected, and
//! strict callers consult [`Manager::verify_integrity`].
//!
//! ## Allocation
//!
//! `alloc_block` is a first-fit scan: the first bitmap word with a zero bit
//! wins, and the lowest zero bit within it (count-trailing-zeros of the
//! inverted word) selects the block. Freeing clears the bit and leaves the
//! block bytes untouched, so a freed block remains inspectable and the
//! whole-region checksum only changes where the bitmap did. Reserved
//! metadata blocks can never be freed.
//!
//! ## Durability Wrappers
//!
//! All flushes the tree issues go through `flush_range` / `persist_range` /
//! `publish_u64`, which bound-check the range against the mapping and bump
//! the monotonic persisted-bytes telemetry counter.
//!
//! ## Safety Model
//!
//! Block access hands out plain slices of the mapping, bounds- and
//! alignment-checked. The region is never remapped after open, so no
//! reference can dangle; the borrow checker enforces exclusivity between
//! readers and the single writer within this process.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use crate::pmem;

use super::superblock::{Superblock, SUPERBLOCK_CHECKSUM_OFFSET, SUPERBLOCK_SIZE};
use super::{bitmap_words, OutOfSpace, BITMAP_OFFSET};

#[derive(Debug)]
pub struct Manager {
    _file: File,
    mmap: MmapMut,
    region_size: usize,
    block_size: usize,
    block_count: usize,
    bitmap_words: usize,
    reserved_blocks: usize,
    allocated_blocks: usize,
    persisted_bytes: u64,
}

impl Manager {
    /// Opens a persistent region, creating and formatting it when
    /// `create_new` is set.
    pub fn open<P: AsRef<Path>>(
        path: P,
        region_size: usize,
        block_size: usize,
        create_new: bool,
    ) -> Result<Self> {
        let path = path.as_ref();

        ensure!(block_size >= 64, "block size {} too small", block_size);
        ensure!(
            block_size % 8 == 0,
            "block size {} is not 8-byte aligned",
            block_size
        );
        ensure!(
            region_size % block_size == 0,
            "region size {} is not a multiple of block size {}",
            region_size,
            block_size
        );

        let block_count = region_size / block_size;
        let words = bitmap_words(block_count);
        let bitmap_bytes = words * 8;
        let reserved_bytes = BITMAP_OFFSET + bitmap_bytes;
        let reserved_blocks = reserved_bytes.div_ceil(block_size);

        ensure!(
            reserved_blocks < block_count,
            "region of {} blocks has no room beyond its {} metadata blocks",
            block_count,
            reserved_blocks
        );

        if create_new {
            Self::create(path, region_size, block_size, block_count, words, reserved_blocks)
        } else {
            Self::reopen(path, region_size, block_size, block_count, words, reserved_blocks)
        }
    }

    fn create(
        path: &Path,
        region_size: usize,
        block_size: usize,
        block_count: usize,
        words: usize,
        reserved_blocks: usize,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create region file '{}'", path.display()))?;

        file.set_len(region_size as u64)
            .wrap_err_with(|| format!("failed to size region file to {} bytes", region_size))?;

        // SAFETY: MmapMut::map_mut is unsafe because externally modified
        // files invalidate the mapping's contents. This is safe because:
        // 1. The file was just created with truncate, so no other view exists
        // 2. Region files are single-owner by contract (single writer model)
        // 3. The mmap lifetime is tied to Manager, preventing use-after-unmap
        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let superblock = Superblock::new(block_count as u64, block_size as u64);
        mmap[..SUPERBLOCK_SIZE].copy_from_slice(zerocopy::IntoBytes::as_bytes(&superblock));

        let mut manager = Self {
            _file: file,
            mmap,
            region_size,
            block_size,
            block_count,
            bitmap_words: words,
            reserved_blocks,
            allocated_blocks: reserved_blocks,
            persisted_bytes: 0,
        };

        for block_idx in 0..reserved_blocks {
            manager.set_bit(block_idx);
        }

        manager.update_persistent_checksum();
        manager.persist_range(0, BITMAP_OFFSET + words * 8)?;

        Ok(manager)
    }

    fn reopen(
        path: &Path,
        region_size: usize,
        block_size: usize,
        block_count: usize,
        words: usize,
        reserved_blocks: usize,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open region file '{}'", path.display()))?;

        let metadata = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?;

        ensure!(
            metadata.len() == region_size as u64,
            "region file '{}' is {} bytes, expected {}",
            path.display(),
            metadata.len(),
            region_size
        );

        // SAFETY: MmapMut::map_mut is unsafe because externally modified
        // files invalidate the mapping's contents. This is safe because:
        // 1. Region files are single-owner by contract (single writer model)
        // 2. The file size was validated to cover the whole region
        // 3. The mmap lifetime is tied to Manager, preventing use-after-unmap
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let mut manager = Self {
            _file: file,
            mmap,
            region_size,
            block_size,
            block_count,
            bitmap_words: words,
            reserved_blocks,
            allocated_blocks: 0,
            persisted_bytes: 0,
        };

        manager.allocated_blocks = manager.popcount_bitmap();

        if !manager.superblock().has_valid_magic() {
            tracing::error!(
                path = %path.display(),
                magic = manager.superblock().magic(),
                "region magic mismatch, contents are untrusted"
            );
        } else if manager.calculate_checksum() != manager.superblock().checksum() {
            tracing::error!(
                path = %path.display(),
                "region integrity failure, checksum mismatch on reopen"
            );
        }

        Ok(manager)
    }

    /// Allocates the lowest-numbered free block and returns its byte offset.
    ///
    /// The returned block's contents are undefined; callers initialize it
    /// before persisting. Fails with [`OutOfSpace`] when the bitmap has no
    /// zero bit, without mutating anything.
    pub fn alloc_block(&mut self) -> Result<u64> {
        for word_idx in 0..self.bitmap_words {
            let word = self.bitmap_word(word_idx);
            if word == u64::MAX {
                continue;
            }

            let bit = (!word).trailing_zeros() as usize;
            let block_idx = word_idx * 64 + bit;
            if block_idx >= self.block_count {
                break;
            }

            self.set_bitmap_word(word_idx, word | (1u64 << bit));
            self.allocated_blocks += 1;
            return Ok((block_idx * self.block_size) as u64);
        }

        Err(OutOfSpace {
            block_count: self.block_count,
        }
        .into())
    }

    /// Frees the block containing `offset`. Idempotent; out-of-range
    /// offsets and the reserved metadata blocks are no-ops. The block's
    /// bytes are left untouched.
    pub fn free_block(&mut self, offset: u64) {
        if offset as usize >= self.region_size {
            return;
        }

        let block_idx = (offset / self.block_size as u64) as usize;
        if block_idx < self.reserved_blocks {
            return;
        }

        let word_idx = block_idx / 64;
        let bit = 1u64 << (block_idx % 64);
        let word = self.bitmap_word(word_idx);

        if word & bit != 0 {
            self.set_bitmap_word(word_idx, word & !bit);
            self.allocated_blocks -= 1;
        }
    }

    /// Commits a new root offset: stores it, refreshes the whole-region
    /// checksum, and persists the superblock. This is the publication point
    /// for tree-height growth.
    pub fn set_root_offset(&mut self, offset: u64) -> Result<()> {
        self.superblock_mut().set_root_offset(offset);
        self.update_persistent_checksum();
        self.persist_range(0, SUPERBLOCK_SIZE)
    }

    pub fn root_offset(&self) -> u64 {
        self.superblock().root_offset()
    }

    /// Stamps the tree configuration into the superblock and persists it.
    pub fn set_tree_config(&mut self, max_keys: u32, min_keys: u32, leaf_capacity: u32) -> Result<()> {
        self.superblock_mut()
            .set_tree_config(max_keys, min_keys, leaf_capacity);
        self.persist_range(0, SUPERBLOCK_SIZE)
    }

    pub fn max_keys(&self) -> u32 {
        self.superblock().max_keys()
    }

    pub fn min_keys(&self) -> u32 {
        self.superblock().min_keys()
    }

    pub fn leaf_capacity(&self) -> u32 {
        self.superblock().leaf_capacity()
    }

    /// Returns the block starting at `offset`.
    pub fn block(&self, offset: u64) -> Result<&[u8]> {
        self.check_block_offset(offset)?;
        let start = offset as usize;
        Ok(&self.mmap[start..start + self.block_size])
    }

    /// Returns the block starting at `offset` for mutation.
    pub fn block_mut(&mut self, offset: u64) -> Result<&mut [u8]> {
        self.check_block_offset(offset)?;
        let start = offset as usize;
        Ok(&mut self.mmap[start..start + self.block_size])
    }

    fn check_block_offset(&self, offset: u64) -> Result<()> {
        ensure!(
            offset % self.block_size as u64 == 0,
            "offset {} is not aligned to block size {}",
            offset,
            self.block_size
        );
        ensure!(
            offset as usize + self.block_size <= self.region_size,
            "offset {} out of bounds (region_size={})",
            offset,
            self.region_size
        );
        Ok(())
    }

    /// Flushes the cache lines covering `[offset, offset + len)`.
    pub fn flush_range(&mut self, offset: u64, len: usize) -> Result<()> {
        let start = offset as usize;
        ensure!(
            start + len <= self.region_size,
            "flush range {}..{} out of bounds (region_size={})",
            start,
            start + len,
            self.region_size
        );

        pmem::flush(&self.mmap[start..start + len]);
        self.persisted_bytes += len as u64;
        Ok(())
    }

    /// Flushes `[offset, offset + len)` and fences.
    pub fn persist_range(&mut self, offset: u64, len: usize) -> Result<()> {
        self.flush_range(offset, len)?;
        pmem::fence();
        Ok(())
    }

    /// Atomically exchanges the 8-byte slot at `slot_offset` and persists
    /// it. The single-instruction exchange plus the trailing persist is the
    /// publication primitive for the leaf chain and the root pointer.
    pub fn publish_u64(&mut self, slot_offset: u64, new_value: u64) -> Result<u64> {
        let start = slot_offset as usize;
        ensure!(
            slot_offset % 8 == 0,
            "publish slot {} is not 8-byte aligned",
            slot_offset
        );
        ensure!(
            start + 8 <= self.region_size,
            "publish slot {} out of bounds (region_size={})",
            slot_offset,
            self.region_size
        );

        let old = pmem::atomic_swap_u64(&mut self.mmap[start..start + 8], new_value);
        pmem::persist(&self.mmap[start..start + 8]);
        self.persisted_bytes += 8;
        Ok(old)
    }

    /// XOR over every 8-byte little-endian word of the region of
    /// `rotate_left(word, 1)`, skipping the superblock checksum word.
    pub fn calculate_checksum(&self) -> u64 {
        let mut checksum = 0u64;

        for (word_idx, chunk) in self.mmap.chunks_exact(8).enumerate() {
            if word_idx * 8 == SUPERBLOCK_CHECKSUM_OFFSET {
                continue;
            }

            let word = u64::from_le_bytes(chunk.try_into().unwrap());
            checksum ^= word.rotate_left(1);
        }

        checksum
    }

    /// Recomputes the whole-region checksum, stores it in the superblock,
    /// and persists the checksum word.
    pub fn update_persistent_checksum(&mut self) {
        let checksum = self.calculate_checksum();
        self.superblock_mut().set_checksum(checksum);

        pmem::persist(&self.mmap[SUPERBLOCK_CHECKSUM_OFFSET..SUPERBLOCK_CHECKSUM_OFFSET + 8]);
        self.persisted_bytes += 8;
    }

    /// True when the magic matches and the stored whole-region checksum
    /// equals a fresh recomputation.
    pub fn verify_integrity(&self) -> bool {
        self.superblock().has_valid_magic()
            && self.calculate_checksum() == self.superblock().checksum()
    }

    pub fn is_allocated(&self, block_idx: usize) -> bool {
        if block_idx >= self.block_count {
            return false;
        }
        self.bitmap_word(block_idx / 64) & (1u64 << (block_idx % 64)) != 0
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn reserved_blocks(&self) -> usize {
        self.reserved_blocks
    }

    pub fn allocated_blocks(&self) -> usize {
        self.allocated_blocks
    }

    /// Monotonic count of bytes ever flushed through this manager.
    pub fn persisted_bytes(&self) -> u64 {
        self.persisted_bytes
    }

    fn superblock(&self) -> &Superblock {
        Superblock::from_bytes(&self.mmap[..SUPERBLOCK_SIZE])
            .expect("mapped region shorter than a superblock")
    }

    fn superblock_mut(&mut self) -> &mut Superblock {
        Superblock::from_bytes_mut(&mut self.mmap[..SUPERBLOCK_SIZE])
            .expect("mapped region shorter than a superblock")
    }

    fn bitmap_word(&self, word_idx: usize) -> u64 {
        let start = BITMAP_OFFSET + word_idx * 8;
        u64::from_le_bytes(self.mmap[start..start + 8].try_into().unwrap())
    }

    fn set_bitmap_word(&mut self, word_idx: usize, word: u64) {
        let start = BITMAP_OFFSET + word_idx * 8;
        self.mmap[start..start + 8].copy_from_slice(&word.to_le_bytes());
    }

    fn set_bit(&mut self, block_idx: usize) {
        let word = self.bitmap_word(block_idx / 64);
        self.set_bitmap_word(block_idx / 64, word | (1u64 << (block_idx % 64)));
    }

    fn popcount_bitmap(&self) -> usize {
        (0..self.bitmap_words)
            .map(|i| self.bitmap_word(i).count_ones() as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const REGION_SIZE: usize = 1 << 20;
    const BLOCK_SIZE: usize = 4096;

    fn create_manager(dir: &tempfile::TempDir) -> Manager {
        let path = dir.path().join("region.nvm");
        Manager::open(path, REGION_SIZE, BLOCK_SIZE, true).unwrap()
    }

    #[test]
    fn create_reserves_metadata_blocks() {
        let dir = tempdir().unwrap();
        let manager = create_manager(&dir);

        assert_eq!(manager.block_count(), 256);
        assert_eq!(manager.reserved_blocks(), 1);
        assert_eq!(manager.allocated_blocks(), 1);
        assert!(manager.is_allocated(0));
        assert!(!manager.is_allocated(1));
        assert_eq!(manager.root_offset(), 0);
    }

    #[test]
    fn fresh_region_passes_integrity_check() {
        let dir = tempdir().unwrap();
        let manager = create_manager(&dir);

        assert!(manager.verify_integrity());
    }

    #[test]
    fn alloc_returns_block_aligned_offsets_in_order() {
        let dir = tempdir().unwrap();
        let mut manager = create_manager(&dir);

        let first = manager.alloc_block().unwrap();
        let second = manager.alloc_block().unwrap();

        assert_eq!(first, BLOCK_SIZE as u64);
        assert_eq!(second, 2 * BLOCK_SIZE as u64);
        assert_eq!(manager.allocated_blocks(), 3);
    }

    #[test]
    fn alloc_reuses_freed_blocks_lowest_first() {
        let dir = tempdir().unwrap();
        let mut manager = create_manager(&dir);

        let a = manager.alloc_block().unwrap();
        let b = manager.alloc_block().unwrap();
        manager.free_block(a);

        let c = manager.alloc_block().unwrap();

        assert_eq!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn alloc_exhaustion_surfaces_out_of_space() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiny.nvm");
        let mut manager = Manager::open(path, 8 * 64, 64, true).unwrap();

        let free_blocks = manager.block_count() - manager.reserved_blocks();
        for _ in 0..free_blocks {
            manager.alloc_block().unwrap();
        }
        let allocated_before = manager.allocated_blocks();

        let err = manager.alloc_block().unwrap_err();

        assert!(err.downcast_ref::<OutOfSpace>().is_some());
        assert_eq!(manager.allocated_blocks(), allocated_before);
    }

    #[test]
    fn free_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut manager = create_manager(&dir);

        let offset = manager.alloc_block().unwrap();
        manager.free_block(offset);
        manager.free_block(offset);

        assert_eq!(manager.allocated_blocks(), manager.reserved_blocks());
    }

    #[test]
    fn free_of_reserved_blocks_is_a_no_op() {
        let dir = tempdir().unwrap();
        let mut manager = create_manager(&dir);

        manager.free_block(0);

        assert!(manager.is_allocated(0));
        assert_eq!(manager.allocated_blocks(), 1);
    }

    #[test]
    fn free_out_of_range_is_a_no_op() {
        let dir = tempdir().unwrap();
        let mut manager = create_manager(&dir);

        manager.free_block(REGION_SIZE as u64 + BLOCK_SIZE as u64);

        assert_eq!(manager.allocated_blocks(), 1);
    }

    #[test]
    fn block_access_validates_alignment_and_bounds() {
        let dir = tempdir().unwrap();
        let manager = create_manager(&dir);

        assert!(manager.block(BLOCK_SIZE as u64).is_ok());
        assert!(manager.block(17).is_err());
        assert!(manager.block(REGION_SIZE as u64).is_err());
    }

    #[test]
    fn set_root_offset_commits_and_keeps_integrity() {
        let dir = tempdir().unwrap();
        let mut manager = create_manager(&dir);

        manager.set_root_offset(4096).unwrap();

        assert_eq!(manager.root_offset(), 4096);
        assert!(manager.verify_integrity());
    }

    #[test]
    fn checksum_flips_on_unpersisted_mutation() {
        let dir = tempdir().unwrap();
        let mut manager = create_manager(&dir);

        let offset = manager.alloc_block().unwrap();
        {
            let block = manager.block_mut(offset).unwrap();
            block[0] = 0xFF;
        }

        assert!(!manager.verify_integrity());

        manager.update_persistent_checksum();
        assert!(manager.verify_integrity());
    }

    #[test]
    fn reopen_restores_root_and_allocation_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("region.nvm");

        let (root, allocated) = {
            let mut manager = Manager::open(&path, REGION_SIZE, BLOCK_SIZE, true).unwrap();
            let offset = manager.alloc_block().unwrap();
            manager.set_root_offset(offset).unwrap();
            (offset, manager.allocated_blocks())
        };

        let manager = Manager::open(&path, REGION_SIZE, BLOCK_SIZE, false).unwrap();

        assert_eq!(manager.root_offset(), root);
        assert_eq!(manager.allocated_blocks(), allocated);
        assert!(manager.verify_integrity());
    }

    #[test]
    fn reopen_with_wrong_size_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("region.nvm");
        Manager::open(&path, REGION_SIZE, BLOCK_SIZE, true).unwrap();

        let result = Manager::open(&path, REGION_SIZE * 2, BLOCK_SIZE, false);

        assert!(result.is_err());
    }

    #[test]
    fn reopen_of_corrupted_region_still_opens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("region.nvm");

        {
            let mut manager = Manager::open(&path, REGION_SIZE, BLOCK_SIZE, true).unwrap();
            let offset = manager.alloc_block().unwrap();
            let block = manager.block_mut(offset).unwrap();
            block[0] = 0xAB;
            // checksum deliberately not refreshed
        }

        let manager = Manager::open(&path, REGION_SIZE, BLOCK_SIZE, false).unwrap();

        assert!(!manager.verify_integrity());
    }

    #[test]
    fn persisted_bytes_counter_is_monotonic() {
        let dir = tempdir().unwrap();
        let mut manager = create_manager(&dir);

        let after_create = manager.persisted_bytes();
        assert!(after_create > 0);

        manager.persist_range(4096, 64).unwrap();
        assert!(manager.persisted_bytes() >= after_create + 64);

        manager.publish_u64(4096, 7).unwrap();
        assert!(manager.persisted_bytes() >= after_create + 72);
    }

    #[test]
    fn publish_swaps_and_returns_old_value() {
        let dir = tempdir().unwrap();
        let mut manager = create_manager(&dir);

        let offset = manager.alloc_block().unwrap();
        {
            let block = manager.block_mut(offset).unwrap();
            block[..8].copy_from_slice(&99u64.to_le_bytes());
        }

        let old = manager.publish_u64(offset, 123).unwrap();

        assert_eq!(old, 99);
        let block = manager.block(offset).unwrap();
        assert_eq!(u64::from_le_bytes(block[..8].try_into().unwrap()), 123);
    }

    #[test]
    fn publish_rejects_misaligned_slots() {
        let dir = tempdir().unwrap();
        let mut manager = create_manager(&dir);

        assert!(manager.publish_u64(4097, 1).is_err());
    }
}
