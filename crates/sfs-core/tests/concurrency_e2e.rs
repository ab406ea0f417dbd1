#![forbid(unsafe_code)]
//! Concurrency scenarios for the COW engine.
//!
//! Exercised with real threads over the in-memory device:
//! 1. Concurrent COWers of distinct blocks in one group share a single
//!    COW-bitmap materialization and both preserve their pre-images.
//! 2. Concurrent COWers of the *same* block produce exactly one copy.
//! 3. The pending-COW rendezvous keeps late arrivals off half-written
//!    copies.

use sfs_block::{BlockDevice, MemBlockDevice};
use sfs_core::snapshot::{ctl, read};
use sfs_core::{FormatParams, FsContext, MountOptions, format};
use sfs_types::{BlockNr, GroupNr, InodeNr, SnapFlags};
use std::sync::{Arc, Barrier};
use std::thread;

fn mount_fresh() -> Arc<FsContext> {
    let dev = Arc::new(MemBlockDevice::new(512));
    let params = FormatParams {
        blocks: 512,
        blocks_per_group: 128,
        inodes_per_group: 16,
        volume_name: "scratch".into(),
    };
    format(dev.as_ref(), &params).unwrap();
    FsContext::mount(dev, MountOptions::default()).unwrap()
}

fn take_snapshot(fs: &Arc<FsContext>) -> InodeNr {
    let (mode, flags) = ctl::snapshot_file_template();
    let ino = {
        let handle = fs.journal().start(64);
        fs.new_inode(&handle, mode, flags).unwrap().ino
    };
    fs.journal().commit_transaction();
    ctl::set_flags(fs, ino, flags.bits() | SnapFlags::LIST).unwrap();
    ino
}

/// Two in-use metadata blocks of the same group, not covered by any
/// take-time copy (group 1 holds no special inodes).
fn group1_targets(fs: &FsContext) -> (BlockNr, BlockNr) {
    let desc = fs.group_desc(GroupNr(1)).unwrap();
    (desc.inode_bitmap, desc.inode_table)
}

#[test]
fn concurrent_cows_of_distinct_blocks_share_one_materialization() {
    let fs = mount_fresh();
    let a = take_snapshot(&fs);
    let (block1, block2) = group1_targets(&fs);
    let original1 = fs.device().read_block(block1).unwrap().into_inner();
    let original2 = fs.device().read_block(block2).unwrap().into_inner();

    let barrier = Arc::new(Barrier::new(2));
    let workers: Vec<_> = [(block1, 0xD1u8), (block2, 0xD2u8)]
        .into_iter()
        .map(|(block, tag)| {
            let fs = Arc::clone(&fs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let handle = fs.journal().start(64);
                barrier.wait();
                fs.metadata_write(&handle, block, &vec![tag; 4096]).unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    fs.journal().commit_transaction();

    // Both writes landed and both pre-images are preserved.
    assert_eq!(fs.device().read_block(block1).unwrap().as_slice()[0], 0xD1);
    assert_eq!(fs.device().read_block(block2).unwrap().as_slice()[0], 0xD2);

    let snap = fs.iget(a).unwrap();
    let image1 = read::read_snapshot_block(&fs, &snap, block1.snapshot_iblock()).unwrap();
    let image2 = read::read_snapshot_block(&fs, &snap, block2.snapshot_iblock()).unwrap();
    assert_eq!(image1.as_slice(), &original1[..]);
    assert_eq!(image2.as_slice(), &original2[..]);

    // Exactly one COW bitmap exists for the group.
    let bitmap_blk = fs.group_desc(GroupNr(1)).unwrap().block_bitmap;
    assert!(snap.mapping(bitmap_blk.snapshot_iblock()).is_some());
}

#[test]
fn concurrent_cows_of_same_block_copy_once() {
    let fs = mount_fresh();
    let a = take_snapshot(&fs);
    let (_, target) = group1_targets(&fs);
    let original = fs.device().read_block(target).unwrap().into_inner();
    let map_len_before = fs.iget(a).unwrap().with_state(|state| state.map.len());

    let barrier = Arc::new(Barrier::new(4));
    let workers: Vec<_> = (0..4u8)
        .map(|i| {
            let fs = Arc::clone(&fs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let handle = fs.journal().start(64);
                barrier.wait();
                fs.metadata_write(&handle, target, &vec![0xE0 + i; 4096])
                    .unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    fs.journal().commit_transaction();

    // One winner allocated the copy; everyone else rendezvoused with
    // it. The snapshot map grew by exactly two entries: the group's COW
    // bitmap and the single copy.
    let snap = fs.iget(a).unwrap();
    let map_len_after = snap.with_state(|state| state.map.len());
    assert_eq!(map_len_after, map_len_before + 2);
    assert!(snap.mapping(target.snapshot_iblock()).is_some());
    let image = read::read_snapshot_block(&fs, &snap, target.snapshot_iblock()).unwrap();
    assert_eq!(image.as_slice(), &original[..]);
}

#[test]
fn many_writers_preserve_every_pre_image() {
    let fs = mount_fresh();
    let a = take_snapshot(&fs);

    // Every group-2 and group-3 metadata block gets its own writer.
    let mut targets = Vec::new();
    for g in [2u32, 3u32] {
        let desc = fs.group_desc(GroupNr(g)).unwrap();
        targets.push(desc.inode_bitmap);
        targets.push(desc.inode_table);
    }
    let originals: Vec<Vec<u8>> = targets
        .iter()
        .map(|&b| fs.device().read_block(b).unwrap().into_inner())
        .collect();

    let barrier = Arc::new(Barrier::new(targets.len()));
    let workers: Vec<_> = targets
        .iter()
        .enumerate()
        .map(|(i, &block)| {
            let fs = Arc::clone(&fs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let handle = fs.journal().start(64);
                barrier.wait();
                fs.metadata_write(&handle, block, &vec![i as u8; 4096]).unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let snap = fs.iget(a).unwrap();
    for (i, &block) in targets.iter().enumerate() {
        let image = read::read_snapshot_block(&fs, &snap, block.snapshot_iblock()).unwrap();
        assert_eq!(image.as_slice(), &originals[i][..], "block {}", block.0);
    }
}
