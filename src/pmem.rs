//! # Persistent-Memory Durability Primitives
//!
//! This module provides the three durability operations every mutation in
//! nvtree is built from, plus the single atomic the publication protocol
//! requires:
//!
//! - [`flush`]: write back every cache line covering a byte range
//! - [`fence`]: order prior flushes before subsequent stores
//! - [`persist`]: `flush` followed by `fence`
//! - [`atomic_swap_u64`]: 8-byte naturally-aligned atomic exchange
//!
//! ## Durability Contract
//!
//! A store to the mapped region is not durable until the cache line holding
//! it has been written back and a store fence has ordered that write-back
//! against everything that follows. Callers therefore end every mutation
//! they want to survive a crash with `persist` over the modified range, and
//! perform every *publishing* store (one that makes a new structure
//! reachable) as a naturally-aligned 8-byte write followed by `persist`.
//!
//! ```text
//! write entry bytes ──> flush(entry) ──> fence ──> bump count ──> persist(node)
//!                                    │
//!                                    └─ crash before here: entry bytes are
//!                                       garbage beyond key_count, invisible
//! ```
//!
//! ## Platform Behavior
//!
//! On x86/x86_64 these compile to `clflush` per 64-byte line and `sfence`,
//! which is the instruction sequence persistent-memory runtimes use. On
//! other targets `flush` is a no-op and `fence` falls back to a sequentially
//! consistent atomic fence: the mapped file still receives every store, so
//! the emulation stays correct, it only loses line-granular write-back
//! ordering no non-x86 CI target can express anyway.
//!
//! ## Telemetry
//!
//! These functions are stateless. The monotonic persisted-bytes counter
//! lives in [`crate::region::Manager`], which wraps every flush it issues.

use std::sync::atomic::{AtomicU64, Ordering};

/// Write-back granularity of the durability model.
pub const CACHE_LINE_SIZE: usize = 64;

/// Writes back every cache line covering `bytes`.
///
/// The starting address is aligned down to a line boundary, so the first
/// flushed line may begin before `bytes` does; mapped regions are page
/// aligned, which keeps the aligned-down address inside the mapping.
pub fn flush(bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        let start = bytes.as_ptr() as usize & !(CACHE_LINE_SIZE - 1);
        let end = bytes.as_ptr() as usize + bytes.len();

        let mut line = start;
        while line < end {
            // SAFETY: clflush does not modify memory and is valid for any
            // mapped address. `line` stays within [start, end), and aligning
            // down from a pointer into a page-aligned mapping cannot leave
            // the mapping.
            unsafe {
                #[cfg(target_arch = "x86_64")]
                std::arch::x86_64::_mm_clflush(line as *const u8);
                #[cfg(target_arch = "x86")]
                std::arch::x86::_mm_clflush(line as *const u8);
            }
            line += CACHE_LINE_SIZE;
        }
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    std::sync::atomic::compiler_fence(Ordering::SeqCst);
}

/// Issues a store fence ordering prior flushes before subsequent stores.
pub fn fence() {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    // SAFETY: sfence has no memory operands and no preconditions.
    unsafe {
        #[cfg(target_arch = "x86_64")]
        std::arch::x86_64::_mm_sfence();
        #[cfg(target_arch = "x86")]
        std::arch::x86::_mm_sfence();
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    std::sync::atomic::fence(Ordering::SeqCst);
}

/// Flushes `bytes` and fences.
pub fn persist(bytes: &[u8]) {
    flush(bytes);
    fence();
}

/// Atomically exchanges the 8-byte value in `slot`, returning the previous
/// value.
///
/// This is the publication primitive: on x86-class hardware a naturally
/// aligned 8-byte exchange is a single instruction and is failure-atomic, so
/// a crash observes either the old or the new value, never a torn mix.
///
/// # Panics
///
/// Panics if `slot` is not exactly 8 bytes or not 8-byte aligned. Both are
/// static properties of the call site, not runtime conditions.
pub fn atomic_swap_u64(slot: &mut [u8], new_value: u64) -> u64 {
    assert_eq!(slot.len(), 8, "atomic swap target must be 8 bytes");
    assert_eq!(
        slot.as_ptr() as usize % 8,
        0,
        "atomic swap target must be 8-byte aligned"
    );

    let ptr = slot.as_mut_ptr().cast::<u64>();

    // SAFETY: the assertions above guarantee `ptr` is valid for 8 bytes and
    // naturally aligned, and the exclusive borrow of `slot` guarantees no
    // other Rust reference aliases it for the duration of the swap.
    let atom = unsafe { AtomicU64::from_ptr(ptr) };
    atom.swap(new_value, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_empty_range_is_a_no_op() {
        flush(&[]);
    }

    #[test]
    fn flush_and_fence_cover_arbitrary_ranges() {
        let buf = vec![0xA5u8; 1000];

        flush(&buf[3..7]);
        flush(&buf[..]);
        flush(&buf[999..]);
        fence();
        persist(&buf[100..200]);
    }

    #[test]
    fn atomic_swap_returns_previous_value() {
        let mut buf = [0u8; 16];
        let aligned = (buf.as_ptr() as usize) % 8;
        let start = if aligned == 0 { 0 } else { 8 - aligned };
        buf[start..start + 8].copy_from_slice(&0xDEAD_BEEFu64.to_le_bytes());

        let old = atomic_swap_u64(&mut buf[start..start + 8], 0x1234_5678);

        assert_eq!(old, 0xDEAD_BEEF);
        assert_eq!(
            u64::from_le_bytes(buf[start..start + 8].try_into().unwrap()),
            0x1234_5678
        );
    }

    #[test]
    #[should_panic(expected = "8 bytes")]
    fn atomic_swap_rejects_short_slices() {
        let mut buf = [0u8; 4];
        atomic_swap_u64(&mut buf, 1);
    }
}
