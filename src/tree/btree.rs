//! # B+Tree Operations
//!
//! This module implements insert, search, and erase over the offset-addressed
//! nodes defined in [`super::node`], with every mutation ordered so that a
//! crash at any instruction boundary leaves a tree the recovery path accepts.
//!
//! ## Insert
//!
//! Recursive descent with bottom-up split propagation. A leaf with room
//! takes the entry in two durably-ordered steps:
//!
//! ```text
//! write entries[key_count] -> flush entry, fence -> key_count += 1 -> persist node
//! ```
//!
//! The fence between the entry store and the count bump is the atomicity
//! hinge: a crash before the bump leaves bytes beyond `key_count` that no
//! search can observe; a crash after leaves a valid leaf with one more entry.
//!
//! ## Shadow Leaf Split
//!
//! A full leaf is split without ever mutating reachable state in place:
//!
//! ```text
//! 1. allocate the new right sibling
//! 2. copy all entries to a scratch buffer, sort by key
//! 3. place the upper half in the new leaf, split_key = buffer[mid].key
//! 4. new.next_leaf = old.next_leaf
//! 5. persist the new leaf in full
//! 6. atomically swap old.next_leaf <- new leaf offset, persist the slot
//! 7. rewrite the old leaf's lower half, key_count = mid, persist
//! ```
//!
//! Crash outcomes: before step 6 the new leaf is an unreachable orphan the
//! collector reclaims; between 6 and 7 both leaves are chain-reachable and
//! the upper-half entries exist in both, which point lookups never observe
//! because the parent still routes to the old leaf; after 7 but before the
//! parent installs the pivot, lookups of moved keys miss until the pivot
//! lands. The collector must not run inside that window.
//!
//! ## Internal Split and Root Growth
//!
//! A full parent promotes `keys[mid]` and moves the tail keys and children
//! into a fresh sibling; the pending pivot then lands in whichever half its
//! key ordering selects. Cascading splits end either at an ancestor with
//! room or at a fresh root committed by a single `set_root_offset`.
//!
//! ## Erase
//!
//! Lazy swap-with-last: overwrite the victim with the last live entry,
//! flush, fence, decrement `key_count`, persist. The decrement is the commit
//! point. No merging, no rebalancing, no parent mutation; a leaf may fall
//! below `min_keys` and stay there.

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::region::Manager;

use super::node::{
    leaf_entry_offset, leaf_next_offset, stamp_node_crc, InternalNode, InternalNodeMut, LeafEntry,
    LeafNode, LeafNodeMut, NodeHeader, LEAF_ENTRY_SIZE,
};
use super::BTreeConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertResult {
    Ok,
    Split { split_key: i32, new_child: u64 },
}

#[derive(Debug)]
pub struct BTree<'a> {
    manager: &'a mut Manager,
    config: BTreeConfig,
    root_offset: u64,
}

impl<'a> BTree<'a> {
    /// Attaches to the tree in `manager`, bootstrapping an empty root leaf
    /// on a fresh region. On an existing region the stored configuration
    /// wins and `config` is ignored.
    pub fn new(manager: &'a mut Manager, config: BTreeConfig) -> Result<Self> {
        let stored_root = manager.root_offset();

        let config = if stored_root == 0 {
            config
        } else {
            BTreeConfig::new(
                manager.max_keys(),
                manager.min_keys(),
                manager.leaf_capacity(),
            )
        };
        config.validate(manager.block_size())?;

        let mut tree = Self {
            manager,
            config,
            root_offset: stored_root,
        };

        if stored_root == 0 {
            tree.bootstrap_root()?;
        }

        Ok(tree)
    }

    fn bootstrap_root(&mut self) -> Result<()> {
        let root = self.manager.alloc_block()?;

        {
            let block = self.manager.block_mut(root)?;
            LeafNodeMut::init(block, self.config.leaf_capacity as usize)?;
        }

        self.manager.set_tree_config(
            self.config.max_keys,
            self.config.min_keys,
            self.config.leaf_capacity,
        )?;
        self.persist_node(root)?;

        self.root_offset = root;
        self.manager.set_root_offset(root)
    }

    pub fn root_offset(&self) -> u64 {
        self.root_offset
    }

    pub fn config(&self) -> BTreeConfig {
        self.config
    }

    pub fn insert(&mut self, key: i32, value: i32) -> Result<()> {
        let result = self.insert_at(self.root_offset, key, value)?;

        if let InsertResult::Split {
            split_key,
            new_child,
        } = result
        {
            let new_root = self.manager.alloc_block()?;

            {
                let block = self.manager.block_mut(new_root)?;
                let mut root = InternalNodeMut::init(block, self.config.max_keys as usize)?;
                root.set_key(0, split_key)?;
                root.set_child(0, self.root_offset)?;
                root.set_child(1, new_child)?;
                root.set_key_count(1)?;
            }
            self.persist_node(new_root)?;

            self.root_offset = new_root;
            self.manager.set_root_offset(new_root)?;
        }

        Ok(())
    }

    pub fn search(&self, key: i32) -> Result<Option<i32>> {
        let max_keys = self.config.max_keys as usize;
        let capacity = self.config.leaf_capacity as usize;
        let mut current = self.root_offset;

        loop {
            let block = self.manager.block(current)?;
            let header = NodeHeader::from_bytes(block)?;

            if header.is_leaf() {
                let leaf = LeafNode::from_block(block, capacity)?;
                return match leaf.find_key(key)? {
                    Some(index) => Ok(Some(leaf.entry(index)?.value())),
                    None => Ok(None),
                };
            }

            let node = InternalNode::from_block(block, max_keys)?;
            let child = node.child_at(node.find_child_index(key)?)?;
            ensure!(
                child != 0,
                "internal node at offset {} routes to null child",
                current
            );
            current = child;
        }
    }

    pub fn erase(&mut self, key: i32) -> Result<bool> {
        let max_keys = self.config.max_keys as usize;
        let capacity = self.config.leaf_capacity as usize;
        let mut current = self.root_offset;

        loop {
            let block = self.manager.block(current)?;
            let header = NodeHeader::from_bytes(block)?;
            if header.is_leaf() {
                break;
            }

            let node = InternalNode::from_block(block, max_keys)?;
            let child = node.child_at(node.find_child_index(key)?)?;
            ensure!(
                child != 0,
                "internal node at offset {} routes to null child",
                current
            );
            current = child;
        }

        let (found, count) = {
            let block = self.manager.block(current)?;
            let leaf = LeafNode::from_block(block, capacity)?;
            (leaf.find_key(key)?, leaf.key_count())
        };

        let found_index = match found {
            Some(index) => index,
            None => return Ok(false),
        };

        if found_index != count - 1 {
            {
                let block = self.manager.block_mut(current)?;
                let mut leaf = LeafNodeMut::from_block(block, capacity)?;
                let last = leaf.entry(count - 1)?;
                leaf.set_entry(found_index, last)?;
            }
            // The moved entry must be durable before the decrement hides
            // the slot it came from.
            self.manager.persist_range(
                current + leaf_entry_offset(found_index) as u64,
                LEAF_ENTRY_SIZE,
            )?;
        }

        {
            let block = self.manager.block_mut(current)?;
            let mut leaf = LeafNodeMut::from_block(block, capacity)?;
            leaf.set_key_count(count - 1)?;
        }
        self.persist_node(current)?;

        Ok(true)
    }

    fn insert_at(&mut self, node_offset: u64, key: i32, value: i32) -> Result<InsertResult> {
        let is_leaf = {
            let block = self.manager.block(node_offset)?;
            NodeHeader::from_bytes(block)?.is_leaf()
        };

        if is_leaf {
            self.insert_into_leaf(node_offset, key, value)
        } else {
            self.insert_into_internal(node_offset, key, value)
        }
    }

    fn insert_into_leaf(&mut self, leaf_offset: u64, key: i32, value: i32) -> Result<InsertResult> {
        let capacity = self.config.leaf_capacity as usize;
        let count = {
            let block = self.manager.block(leaf_offset)?;
            LeafNode::from_block(block, capacity)?.key_count()
        };

        if count < capacity {
            {
                let block = self.manager.block_mut(leaf_offset)?;
                let mut leaf = LeafNodeMut::from_block(block, capacity)?;
                leaf.set_entry(count, LeafEntry::new(key, value))?;
            }
            // The entry must be durable before the count bump exposes it.
            self.manager
                .persist_range(leaf_offset + leaf_entry_offset(count) as u64, LEAF_ENTRY_SIZE)?;

            {
                let block = self.manager.block_mut(leaf_offset)?;
                let mut leaf = LeafNodeMut::from_block(block, capacity)?;
                leaf.set_key_count(count + 1)?;
            }
            self.persist_node(leaf_offset)?;

            return Ok(InsertResult::Ok);
        }

        let (split_key, new_leaf) = self.split_leaf(leaf_offset)?;

        // Both halves have room now, so the recursive insert cannot split.
        if key >= split_key {
            self.insert_into_leaf(new_leaf, key, value)?;
        } else {
            self.insert_into_leaf(leaf_offset, key, value)?;
        }

        Ok(InsertResult::Split {
            split_key,
            new_child: new_leaf,
        })
    }

    fn insert_into_internal(
        &mut self,
        node_offset: u64,
        key: i32,
        value: i32,
    ) -> Result<InsertResult> {
        let max_keys = self.config.max_keys as usize;

        let (descent_index, child_offset, count) = {
            let block = self.manager.block(node_offset)?;
            let node = InternalNode::from_block(block, max_keys)?;
            let index = node.find_child_index(key)?;
            (index, node.child_at(index)?, node.key_count())
        };
        ensure!(
            child_offset != 0,
            "internal node at offset {} routes to null child",
            node_offset
        );

        let child_result = self.insert_at(child_offset, key, value)?;

        let (split_key, new_child) = match child_result {
            InsertResult::Ok => return Ok(InsertResult::Ok),
            InsertResult::Split {
                split_key,
                new_child,
            } => (split_key, new_child),
        };

        if count < max_keys {
            {
                let block = self.manager.block_mut(node_offset)?;
                let mut node = InternalNodeMut::from_block(block, max_keys)?;
                node.insert_pivot(descent_index, split_key, new_child)?;
            }
            self.persist_node(node_offset)?;

            return Ok(InsertResult::Ok);
        }

        let (promoted_key, new_node) = self.split_internal(node_offset)?;

        // The pending pivot lands in whichever half its ordering selects.
        let target = if split_key < promoted_key {
            node_offset
        } else {
            new_node
        };
        {
            let block = self.manager.block_mut(target)?;
            let mut node = InternalNodeMut::from_block(block, max_keys)?;
            let index = node.find_child_index(split_key)?;
            node.insert_pivot(index, split_key, new_child)?;
        }
        self.persist_node(target)?;

        Ok(InsertResult::Split {
            split_key: promoted_key,
            new_child: new_node,
        })
    }

    /// Splits a full leaf with the shadow-paging publication sequence
    /// documented at module level. Returns `(split_key, new_leaf_offset)`.
    fn split_leaf(&mut self, old_offset: u64) -> Result<(i32, u64)> {
        let capacity = self.config.leaf_capacity as usize;
        let new_offset = self.manager.alloc_block()?;

        let (mut buffer, old_next) = {
            let block = self.manager.block(old_offset)?;
            let leaf = LeafNode::from_block(block, capacity)?;

            let mut buffer: SmallVec<[LeafEntry; 32]> = SmallVec::with_capacity(leaf.key_count());
            for index in 0..leaf.key_count() {
                buffer.push(leaf.entry(index)?);
            }
            (buffer, leaf.next_leaf())
        };

        buffer.sort_by_key(|entry| entry.key());
        let total = buffer.len();
        let mid = total / 2;
        let split_key = buffer[mid].key();

        {
            let block = self.manager.block_mut(new_offset)?;
            let mut new_leaf = LeafNodeMut::init(block, capacity)?;
            for (slot, entry) in buffer[mid..].iter().enumerate() {
                new_leaf.set_entry(slot, *entry)?;
            }
            new_leaf.set_key_count(total - mid)?;
            // The successor link must be correct before the leaf becomes
            // reachable, not after.
            new_leaf.set_next_leaf(old_next);
        }
        self.persist_node(new_offset)?;

        // Publication point: one 8-byte atomic store makes the new leaf
        // reachable through the chain while the parent still routes all
        // traffic to the old leaf.
        let next_slot = old_offset + leaf_next_offset(capacity) as u64;
        self.manager.publish_u64(next_slot, new_offset)?;

        {
            let block = self.manager.block_mut(old_offset)?;
            let mut old_leaf = LeafNodeMut::from_block(block, capacity)?;
            for (slot, entry) in buffer[..mid].iter().enumerate() {
                old_leaf.set_entry(slot, *entry)?;
            }
            old_leaf.set_key_count(mid)?;
        }
        self.persist_node(old_offset)?;

        Ok((split_key, new_offset))
    }

    /// Splits a full internal node, promoting its middle key. Returns
    /// `(promoted_key, new_node_offset)`.
    fn split_internal(&mut self, old_offset: u64) -> Result<(i32, u64)> {
        let max_keys = self.config.max_keys as usize;
        let new_offset = self.manager.alloc_block()?;

        let (keys, children) = {
            let block = self.manager.block(old_offset)?;
            let node = InternalNode::from_block(block, max_keys)?;
            let count = node.key_count();

            let mut keys: SmallVec<[i32; 16]> = SmallVec::with_capacity(count);
            let mut children: SmallVec<[u64; 17]> = SmallVec::with_capacity(count + 1);
            for index in 0..count {
                keys.push(node.key_at(index)?);
            }
            for index in 0..=count {
                children.push(node.child_at(index)?);
            }
            (keys, children)
        };

        let total = keys.len();
        let mid = total / 2;
        let promoted_key = keys[mid];
        let move_count = total - 1 - mid;

        {
            let block = self.manager.block_mut(new_offset)?;
            let mut new_node = InternalNodeMut::init(block, max_keys)?;
            for slot in 0..move_count {
                new_node.set_key(slot, keys[mid + 1 + slot])?;
                new_node.set_child(slot, children[mid + 1 + slot])?;
            }
            new_node.set_child(move_count, children[total])?;
            new_node.set_key_count(move_count)?;
        }
        self.persist_node(new_offset)?;

        {
            let block = self.manager.block_mut(old_offset)?;
            let mut old_node = InternalNodeMut::from_block(block, max_keys)?;
            old_node.set_key_count(mid)?;
        }
        self.persist_node(old_offset)?;

        Ok((promoted_key, new_offset))
    }

    /// Stamps the per-node CRC, persists the whole block, and refreshes the
    /// whole-region checksum.
    fn persist_node(&mut self, offset: u64) -> Result<()> {
        let block_size = self.manager.block_size();

        {
            let block = self.manager.block_mut(offset)?;
            stamp_node_crc(block)?;
        }
        self.manager.persist_range(offset, block_size)?;
        self.manager.update_persistent_checksum();

        Ok(())
    }
}
