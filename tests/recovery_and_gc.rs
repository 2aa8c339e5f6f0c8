use nvtree::{BTree, BTreeConfig, GarbageCollector, Manager};
use tempfile::tempdir;

const REGION_SIZE: usize = 4 << 20;
const BLOCK_SIZE: usize = 4096;

#[test]
fn reopen_recovers_committed_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("recover.nvm");

    {
        let mut manager = Manager::open(&path, REGION_SIZE, BLOCK_SIZE, true).unwrap();
        let mut tree = BTree::new(&mut manager, BTreeConfig::default()).unwrap();

        tree.insert(10, 100).unwrap();
        tree.insert(20, 200).unwrap();
        tree.insert(30, 300).unwrap();
        assert!(tree.erase(20).unwrap());
    }

    let mut manager = Manager::open(&path, REGION_SIZE, BLOCK_SIZE, false).unwrap();
    assert!(manager.verify_integrity());

    let tree = BTree::new(&mut manager, BTreeConfig::default()).unwrap();
    assert_eq!(tree.search(10).unwrap(), Some(100));
    assert_eq!(tree.search(30).unwrap(), Some(300));
    assert_eq!(tree.search(20).unwrap(), None);
}

#[test]
fn reopen_preserves_the_full_mapping_across_splits() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mapping.nvm");
    let config = BTreeConfig::new(4, 2, 8);

    {
        let mut manager = Manager::open(&path, REGION_SIZE, BLOCK_SIZE, true).unwrap();
        let mut tree = BTree::new(&mut manager, config).unwrap();

        for key in 0..300 {
            tree.insert(key, key * 7).unwrap();
        }
        for key in (0..300).step_by(3) {
            assert!(tree.erase(key).unwrap());
        }
    }

    let mut manager = Manager::open(&path, REGION_SIZE, BLOCK_SIZE, false).unwrap();
    assert!(manager.verify_integrity());

    let tree = BTree::new(&mut manager, BTreeConfig::default()).unwrap();
    assert_eq!(tree.config(), config);

    for key in 0..300 {
        let expected = if key % 3 == 0 { None } else { Some(key * 7) };
        assert_eq!(tree.search(key).unwrap(), expected, "key {}", key);
    }
}

#[test]
fn reopen_across_three_sessions_accumulates_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sessions.nvm");

    {
        let mut manager = Manager::open(&path, REGION_SIZE, BLOCK_SIZE, true).unwrap();
        let mut tree = BTree::new(&mut manager, BTreeConfig::new(4, 2, 8)).unwrap();
        for key in 0..50 {
            tree.insert(key, key).unwrap();
        }
    }

    {
        let mut manager = Manager::open(&path, REGION_SIZE, BLOCK_SIZE, false).unwrap();
        let mut tree = BTree::new(&mut manager, BTreeConfig::default()).unwrap();
        for key in 50..100 {
            tree.insert(key, key).unwrap();
        }
        assert!(tree.erase(0).unwrap());
    }

    let mut manager = Manager::open(&path, REGION_SIZE, BLOCK_SIZE, false).unwrap();
    let tree = BTree::new(&mut manager, BTreeConfig::default()).unwrap();

    assert_eq!(tree.search(0).unwrap(), None);
    for key in 1..100 {
        assert_eq!(tree.search(key).unwrap(), Some(key), "key {}", key);
    }
}

#[test]
fn collection_after_split_workload_reaches_closure() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("gc.nvm");
    let config = BTreeConfig::new(4, 2, 8);

    let mut manager = Manager::open(&path, REGION_SIZE, BLOCK_SIZE, true).unwrap();
    let root = {
        let mut tree = BTree::new(&mut manager, config).unwrap();
        for key in 1..=50 {
            tree.insert(key, key * 10).unwrap();
        }
        for key in 10..=20 {
            assert!(tree.erase(key).unwrap());
        }
        tree.root_offset()
    };

    let stats = GarbageCollector::new(&mut manager)
        .collect(root, config)
        .unwrap();

    // Every allocated block is either reserved metadata or root-reachable.
    assert_eq!(
        manager.allocated_blocks(),
        manager.reserved_blocks() + stats.marked
    );

    let again = GarbageCollector::new(&mut manager)
        .collect(root, config)
        .unwrap();
    assert_eq!(again.freed, 0);
    assert_eq!(again.marked, stats.marked);

    assert!(manager.verify_integrity());

    let tree = BTree::new(&mut manager, config).unwrap();
    for key in 21..=50 {
        assert_eq!(tree.search(key).unwrap(), Some(key * 10));
    }
}

#[test]
fn collected_region_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("gc_reopen.nvm");
    let config = BTreeConfig::new(4, 2, 8);

    {
        let mut manager = Manager::open(&path, REGION_SIZE, BLOCK_SIZE, true).unwrap();
        let root = {
            let mut tree = BTree::new(&mut manager, config).unwrap();
            for key in 1..=100 {
                tree.insert(key, key).unwrap();
            }
            tree.root_offset()
        };

        GarbageCollector::new(&mut manager)
            .collect(root, config)
            .unwrap();
    }

    let mut manager = Manager::open(&path, REGION_SIZE, BLOCK_SIZE, false).unwrap();
    assert!(manager.verify_integrity());

    let tree = BTree::new(&mut manager, BTreeConfig::default()).unwrap();
    for key in 1..=100 {
        assert_eq!(tree.search(key).unwrap(), Some(key));
    }
}

#[test]
fn persisted_bytes_grow_with_every_operation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("telemetry.nvm");

    let mut manager = Manager::open(&path, REGION_SIZE, BLOCK_SIZE, true).unwrap();
    let after_create = manager.persisted_bytes();

    let mut tree = BTree::new(&mut manager, BTreeConfig::default()).unwrap();
    tree.insert(1, 1).unwrap();
    tree.insert(2, 2).unwrap();
    let after_inserts = {
        drop(tree);
        manager.persisted_bytes()
    };
    assert!(after_inserts > after_create);

    let mut tree = BTree::new(&mut manager, BTreeConfig::default()).unwrap();
    assert!(tree.erase(1).unwrap());
    drop(tree);

    assert!(manager.persisted_bytes() > after_inserts);
}
