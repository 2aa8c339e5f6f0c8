//! # Crash-Consistent B+Tree
//!
//! This module implements the ordered index built on the persistent region:
//! fixed-size nodes addressed by block offset, leaves chained in ascending
//! key order, and a publication protocol in which every structural change
//! becomes visible through exactly one 8-byte atomic store.
//!
//! ## Node Shapes
//!
//! Every node occupies one block and starts with a 16-byte header (leaf
//! flag, key count, per-node CRC-32). The payload depends on the shape:
//!
//! ```text
//! Internal:  [keys: max_keys x i32] [8-align] [children: (max_keys+1) x u64]
//! Leaf:      [entries: leaf_capacity x (i32 key, i32 value)] [next_leaf: u64]
//! ```
//!
//! Internal keys are sorted; child `i` covers keys `< keys[i]` and the last
//! child covers the rest. Leaf entries are **unsorted**: inserts append at
//! `key_count`, so a leaf write is one 8-byte entry store plus a count bump,
//! with a fence between them as the atomicity hinge. Sorting happens only
//! when a full leaf is split.
//!
//! ## Descent Convention
//!
//! Every descent (insert, search, erase) advances right while
//! `key >= keys[i]`, so `keys[i]` is the smallest key of child `i+1` and a
//! key equal to a pivot always lives in the right sibling.
//!
//! ## Configuration
//!
//! [`BTreeConfig`] carries the three layout parameters. They are stamped
//! into the superblock when a tree is bootstrapped and reloaded verbatim on
//! reopen; the configuration a caller passes for an existing tree is
//! ignored.
//!
//! ## Module Organization
//!
//! - `node`: header struct, layout offsets, typed node views, per-node CRC
//! - `btree`: insert / search / erase / split / root growth

pub mod btree;
pub mod node;

pub use btree::BTree;

use eyre::{ensure, Result};

use node::{internal_footprint, leaf_footprint};

/// Default fan-out used by freshly created trees.
pub const DEFAULT_MAX_KEYS: u32 = 16;
pub const DEFAULT_MIN_KEYS: u32 = 8;
pub const DEFAULT_LEAF_CAPACITY: u32 = 32;

/// Layout parameters of a tree.
///
/// `min_keys` is recorded for telemetry and future rebalancing; deletion is
/// lazy and never enforces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeConfig {
    pub max_keys: u32,
    pub min_keys: u32,
    pub leaf_capacity: u32,
}

impl BTreeConfig {
    pub fn new(max_keys: u32, min_keys: u32, leaf_capacity: u32) -> Self {
        Self {
            max_keys,
            min_keys,
            leaf_capacity,
        }
    }

    /// Checks that both node shapes fit inside `block_size` and that the
    /// split arithmetic has room to work with.
    pub fn validate(&self, block_size: usize) -> Result<()> {
        ensure!(self.max_keys >= 2, "max_keys {} too small", self.max_keys);
        ensure!(
            self.leaf_capacity >= 2,
            "leaf_capacity {} too small",
            self.leaf_capacity
        );
        ensure!(
            self.min_keys <= self.max_keys,
            "min_keys {} exceeds max_keys {}",
            self.min_keys,
            self.max_keys
        );

        let internal = internal_footprint(self.max_keys as usize);
        ensure!(
            internal <= block_size,
            "internal node layout ({} bytes for max_keys={}) exceeds block size {}",
            internal,
            self.max_keys,
            block_size
        );

        let leaf = leaf_footprint(self.leaf_capacity as usize);
        ensure!(
            leaf <= block_size,
            "leaf node layout ({} bytes for leaf_capacity={}) exceeds block size {}",
            leaf,
            self.leaf_capacity,
            block_size
        );

        Ok(())
    }
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self {
            max_keys: DEFAULT_MAX_KEYS,
            min_keys: DEFAULT_MIN_KEYS,
            leaf_capacity: DEFAULT_LEAF_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fits_default_blocks() {
        BTreeConfig::default().validate(4096).unwrap();
    }

    #[test]
    fn split_stress_config_fits_default_blocks() {
        BTreeConfig::new(4, 2, 8).validate(4096).unwrap();
    }

    #[test]
    fn oversized_config_is_rejected() {
        let config = BTreeConfig::new(4096, 2, 8);

        assert!(config.validate(4096).is_err());
    }

    #[test]
    fn degenerate_configs_are_rejected() {
        assert!(BTreeConfig::new(1, 1, 8).validate(4096).is_err());
        assert!(BTreeConfig::new(4, 2, 1).validate(4096).is_err());
        assert!(BTreeConfig::new(4, 8, 8).validate(4096).is_err());
    }
}
