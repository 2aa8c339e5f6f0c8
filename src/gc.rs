//! # Mark-Sweep Garbage Collection
//!
//! Shadow splits leak on purpose: a crash between allocating a new sibling
//! and installing it leaves a fully-written block no pointer reaches. The
//! collector reclaims those orphans by walking the tree that *is* reachable
//! from the committed root and freeing every allocated block the walk never
//! touched.
//!
//! ## Algorithm
//!
//! - **Mark**: depth-first walk from the root over child offsets and
//!   `next_leaf` links, recording visited block indices in a transient
//!   vector. The tree is acyclic and the leaf chain is singly linked left
//!   to right, so the walk terminates without cycle detection.
//! - **Sweep**: every allocated, unmarked block outside the reserved
//!   metadata prefix is freed. The superblock and bitmap blocks are
//!   allocated but never reachable from the root, which is exactly why the
//!   sweep must not consider them.
//! - **Publish**: if anything was freed, the whole-region checksum is
//!   refreshed so the bitmap mutation stays covered.
//!
//! ## Scheduling Discipline
//!
//! The collector assumes a quiescent writer. Between the chain install and
//! the parent pivot install of a leaf split, the new leaf is reachable only
//! through the chain of a node the parent still owns; running the collector
//! inside that window would be correct, but running it between allocation
//! and install would reclaim a block the writer is about to publish.
//! Callers therefore never interleave `collect` with an in-flight insert.

use eyre::Result;
use smallvec::SmallVec;

use crate::region::Manager;
use crate::tree::node::{InternalNode, LeafNode, NodeHeader};
use crate::tree::BTreeConfig;

/// Outcome of one collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectStats {
    /// Blocks reachable from the root.
    pub marked: usize,
    /// Blocks reclaimed by the sweep.
    pub freed: usize,
}

#[derive(Debug)]
pub struct GarbageCollector<'a> {
    manager: &'a mut Manager,
}

impl<'a> GarbageCollector<'a> {
    pub fn new(manager: &'a mut Manager) -> Self {
        Self { manager }
    }

    /// Marks every block reachable from `root_offset`, sweeps the rest,
    /// and refreshes the persistent checksum when anything was freed.
    pub fn collect(&mut self, root_offset: u64, config: BTreeConfig) -> Result<CollectStats> {
        let block_size = self.manager.block_size() as u64;
        let block_count = self.manager.block_count();
        let max_keys = config.max_keys as usize;
        let capacity = config.leaf_capacity as usize;

        let mut reachable = vec![false; block_count];
        let mut stack: SmallVec<[u64; 64]> = SmallVec::new();
        if root_offset != 0 {
            stack.push(root_offset);
        }

        let mut marked = 0;
        while let Some(offset) = stack.pop() {
            let block_idx = (offset / block_size) as usize;
            if block_idx >= block_count || reachable[block_idx] {
                continue;
            }

            reachable[block_idx] = true;
            marked += 1;

            let block = self.manager.block(offset)?;
            let header = NodeHeader::from_bytes(block)?;

            if header.is_leaf() {
                let leaf = LeafNode::from_block(block, capacity)?;
                let next = leaf.next_leaf();
                if next != 0 {
                    stack.push(next);
                }
            } else {
                let node = InternalNode::from_block(block, max_keys)?;
                for index in 0..=node.key_count() {
                    let child = node.child_at(index)?;
                    if child != 0 {
                        stack.push(child);
                    }
                }
            }
        }

        let mut freed = 0;
        for block_idx in self.manager.reserved_blocks()..block_count {
            if self.manager.is_allocated(block_idx) && !reachable[block_idx] {
                self.manager.free_block(block_idx as u64 * block_size);
                freed += 1;
            }
        }

        if freed > 0 {
            self.manager.update_persistent_checksum();
            tracing::debug!(marked, freed, "reclaimed unreachable blocks");
        }

        Ok(CollectStats { marked, freed })
    }
}
