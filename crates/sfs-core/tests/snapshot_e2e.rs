#![forbid(unsafe_code)]
//! End-to-end scenarios for the snapshot core.
//!
//! Covers the full life cycle on an in-memory volume: take, COW and
//! move-on-write preservation, image read routing across the chain,
//! lifecycle permission rules, shrink/merge/remove reconciliation, and
//! mount-time chain loading.

use sfs_block::{BlockDevice, MemBlockDevice};
use sfs_core::snapshot::{ctl, hooks, read};
use sfs_core::{FormatParams, FsContext, MountOptions, format};
use sfs_error::SfsError;
use sfs_ondisk::{MODE_REGULAR, Superblock};
use sfs_types::{
    BlockNr, FEATURE_RO_COMPAT_HAS_SNAPSHOT, FEATURE_RO_COMPAT_IS_SNAPSHOT, GroupNr, InodeNr,
    SnapFlags,
};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn small_params() -> FormatParams {
    FormatParams {
        blocks: 512,
        blocks_per_group: 128,
        inodes_per_group: 16,
        volume_name: "scratch".into(),
    }
}

fn mount_fresh() -> (Arc<MemBlockDevice>, Arc<FsContext>) {
    let dev = Arc::new(MemBlockDevice::new(512));
    format(dev.as_ref(), &small_params()).unwrap();
    let fs = FsContext::mount(dev.clone(), MountOptions::default()).unwrap();
    (dev, fs)
}

fn patt(tag: u8) -> Vec<u8> {
    vec![tag; 4096]
}

/// Create an empty snapshot file and run the full take sequence.
fn take_snapshot(fs: &Arc<FsContext>) -> InodeNr {
    let (mode, flags) = ctl::snapshot_file_template();
    let ino = {
        let handle = fs.journal().start(64);
        let inode = fs.new_inode(&handle, mode, flags).unwrap();
        inode.ino
    };
    fs.journal().commit_transaction();
    ctl::set_flags(fs, ino, flags.bits() | SnapFlags::LIST).unwrap();
    ino
}

/// Create a regular file with `blocks` data blocks filled with `tag`.
fn create_file(fs: &Arc<FsContext>, blocks: u32, tag: u8) -> InodeNr {
    let ino = {
        let handle = fs.journal().start(64);
        let inode = fs
            .new_inode(&handle, MODE_REGULAR, SnapFlags::default())
            .unwrap();
        inode.ino
    };
    for logical in 0..blocks {
        let handle = fs.journal().start(64);
        fs.file_write_block(&handle, ino, logical, &patt(tag)).unwrap();
    }
    fs.journal().commit_transaction();
    ino
}

fn snapshot_delete(fs: &Arc<FsContext>, ino: InodeNr) {
    let flags = ctl::get_flags(fs, ino).unwrap();
    ctl::set_flags(fs, ino, flags & !SnapFlags::LIST).unwrap();
}

fn read_image(fs: &Arc<FsContext>, snapshot: InodeNr, iblock: u32) -> Vec<u8> {
    let inode = fs.iget(snapshot).unwrap();
    read::read_snapshot_block(fs, &inode, iblock)
        .unwrap()
        .into_inner()
}

// ---------------------------------------------------------------------------
// S1: move-on-write preserves file data at take time
// ---------------------------------------------------------------------------

#[test]
fn mow_preserves_overwritten_file_block() {
    let (_dev, fs) = mount_fresh();
    let file = create_file(&fs, 4, 0xAA);
    let phys = fs.iget(file).unwrap().mapping(2).unwrap();

    let a = take_snapshot(&fs);

    let handle = fs.journal().start(64);
    fs.file_write_block(&handle, file, 2, &patt(0xBB)).unwrap();
    drop(handle);
    fs.journal().commit_transaction();

    // The live file sees the new data.
    assert_eq!(fs.file_read_block(file, 2).unwrap().as_slice()[0], 0xBB);

    // The snapshot serves the pre-write contents, and the moved block
    // now lives in the snapshot's map at the shifted logical position.
    let image = read_image(&fs, a, phys.snapshot_iblock());
    assert!(image.iter().all(|&b| b == 0xAA));
    assert_eq!(
        fs.iget(a).unwrap().mapping(phys.snapshot_iblock()),
        Some(phys)
    );
}

#[test]
fn freed_file_blocks_are_moved_not_lost() {
    let (_dev, fs) = mount_fresh();
    let file = create_file(&fs, 3, 0x55);
    let phys = fs.iget(file).unwrap().mapping(1).unwrap();

    let a = take_snapshot(&fs);

    let handle = fs.journal().start(64);
    fs.file_free_blocks(&handle, file, 1, 1).unwrap();
    drop(handle);
    fs.journal().commit_transaction();

    // The file lost the mapping, but the snapshot still serves the data
    // and the block stayed allocated on the volume.
    assert!(fs.iget(file).unwrap().mapping(1).is_none());
    let image = read_image(&fs, a, phys.snapshot_iblock());
    assert!(image.iter().all(|&b| b == 0x55));

    let (group, rel) = fs.geometry().absolute_to_group_block(phys);
    let bitmap = fs
        .device()
        .read_block(fs.group_desc(group).unwrap().block_bitmap)
        .unwrap();
    assert!(sfs_alloc::bitmap_get(bitmap.as_slice(), rel));
}

// ---------------------------------------------------------------------------
// Metadata COW and lazy bitmap materialization
// ---------------------------------------------------------------------------

#[test]
fn cow_preserves_metadata_and_materializes_lazily() {
    let (_dev, fs) = mount_fresh();
    let a = take_snapshot(&fs);

    // Group 1's inode table block is in-use metadata that no take-time
    // triplet covers, so this COW must materialize group 1's COW bitmap
    // from scratch.
    let desc = fs.group_desc(GroupNr(1)).unwrap();
    let target = desc.inode_table;
    let original = fs.device().read_block(target).unwrap().into_inner();

    let handle = fs.journal().start(64);
    fs.metadata_write(&handle, target, &patt(0xCD)).unwrap();
    drop(handle);
    fs.journal().commit_transaction();

    assert_eq!(fs.device().read_block(target).unwrap().as_slice()[0], 0xCD);
    assert_eq!(read_image(&fs, a, target.snapshot_iblock()), original);

    // The materialized COW bitmap lives in the snapshot file.
    let snap = fs.iget(a).unwrap();
    assert!(snap.mapping(desc.block_bitmap.snapshot_iblock()).is_some());
}

#[test]
fn cow_happens_once_per_block() {
    let (_dev, fs) = mount_fresh();
    let a = take_snapshot(&fs);

    let desc = fs.group_desc(GroupNr(1)).unwrap();
    let target = desc.inode_table;
    let original = fs.device().read_block(target).unwrap().into_inner();

    // Two writes in the same transaction, then another after commit:
    // only the first performs a copy.
    let handle = fs.journal().start(64);
    fs.metadata_write(&handle, target, &patt(0x01)).unwrap();
    let copy = fs.iget(a).unwrap().mapping(target.snapshot_iblock());
    fs.metadata_write(&handle, target, &patt(0x02)).unwrap();
    drop(handle);
    fs.journal().commit_transaction();

    let handle = fs.journal().start(64);
    fs.metadata_write(&handle, target, &patt(0x03)).unwrap();
    drop(handle);
    fs.journal().commit_transaction();

    assert_eq!(fs.iget(a).unwrap().mapping(target.snapshot_iblock()), copy);
    assert_eq!(read_image(&fs, a, target.snapshot_iblock()), original);
}

#[test]
fn blocks_free_at_take_time_are_not_preserved() {
    let (_dev, fs) = mount_fresh();
    let a = take_snapshot(&fs);

    // A file created after the take writes into blocks that were free
    // at take time; nothing is preserved for them.
    let file = create_file(&fs, 2, 0x11);
    let phys = fs.iget(file).unwrap().mapping(0).unwrap();

    let handle = fs.journal().start(64);
    fs.file_write_block(&handle, file, 0, &patt(0x22)).unwrap();
    drop(handle);
    fs.journal().commit_transaction();

    assert!(fs.iget(a).unwrap().mapping(phys.snapshot_iblock()).is_none());
}

// ---------------------------------------------------------------------------
// S2: read-through across the chain
// ---------------------------------------------------------------------------

#[test]
fn older_snapshot_reads_through_newer_snapshot() {
    let (_dev, fs) = mount_fresh();
    let file = create_file(&fs, 4, 0xAA);
    let a = take_snapshot(&fs);
    let b = take_snapshot(&fs);

    let phys = fs.iget(file).unwrap().mapping(3).unwrap();
    let handle = fs.journal().start(64);
    fs.file_write_block(&handle, file, 3, &patt(0xEE)).unwrap();
    drop(handle);
    fs.journal().commit_transaction();

    // The pre-image lives in B (the active snapshot); A has no own copy
    // and routes through B.
    assert!(fs.iget(b).unwrap().mapping(phys.snapshot_iblock()).is_some());
    assert!(fs.iget(a).unwrap().mapping(phys.snapshot_iblock()).is_none());
    let via_a = read_image(&fs, a, phys.snapshot_iblock());
    assert!(via_a.iter().all(|&byte| byte == 0xAA));
}

#[test]
fn active_snapshot_reads_through_to_device() {
    let (_dev, fs) = mount_fresh();
    let file = create_file(&fs, 2, 0x77);
    let a = take_snapshot(&fs);

    // Unmodified block: the active snapshot has no copy, so the image
    // read falls through to the live device.
    let phys = fs.iget(file).unwrap().mapping(0).unwrap();
    let via_a = read_image(&fs, a, phys.snapshot_iblock());
    assert!(via_a.iter().all(|&byte| byte == 0x77));
}

#[test]
fn image_presents_point_in_time_block_bitmap() {
    let (_dev, fs) = mount_fresh();
    let a = take_snapshot(&fs);

    // Fill group 0 so allocations spill into group 1 after the take;
    // the live bitmap there changes but the image's view must not.
    let desc = fs.group_desc(GroupNr(1)).unwrap();
    let before = read_image(&fs, a, desc.block_bitmap.snapshot_iblock());
    create_file(&fs, 125, 0x99);
    let live = fs.device().read_block(desc.block_bitmap).unwrap();
    assert_ne!(live.as_slice(), &before[..], "expected spill into group 1");
    let after = read_image(&fs, a, desc.block_bitmap.snapshot_iblock());
    assert_eq!(before, after);
}

// ---------------------------------------------------------------------------
// Image self-consistency
// ---------------------------------------------------------------------------

#[test]
fn image_superblock_is_standalone() {
    let (_dev, fs) = mount_fresh();
    let a = take_snapshot(&fs);

    let image_sb = Superblock::decode(&read_image(&fs, a, 0)).unwrap();
    assert!(!image_sb.has_compat(sfs_types::FEATURE_COMPAT_HAS_JOURNAL));
    assert!(!image_sb.has_ro_compat(FEATURE_RO_COMPAT_HAS_SNAPSHOT));
    assert!(image_sb.has_ro_compat(FEATURE_RO_COMPAT_IS_SNAPSHOT));
    assert_eq!(image_sb.journal_inum, 0);
    assert!(image_sb.last_snapshot_ino.is_none());
    assert!(image_sb.active_snapshot_ino.is_none());
}

// ---------------------------------------------------------------------------
// S5 and lifecycle permission rules
// ---------------------------------------------------------------------------

#[test]
fn snapshot_files_reject_writes() {
    let (_dev, fs) = mount_fresh();
    let a = take_snapshot(&fs);
    let flags = ctl::get_flags(&fs, a).unwrap();
    ctl::set_flags(&fs, a, flags | SnapFlags::ENABLED).unwrap();

    let handle = fs.journal().start(64);
    let err = fs
        .file_write_block(&handle, a, 100, &patt(0x00))
        .unwrap_err();
    assert!(matches!(err, SfsError::NotPermitted(_)));
}

#[test]
fn lifecycle_permission_rules() {
    let (_dev, fs) = mount_fresh();
    let a = take_snapshot(&fs);
    let b = take_snapshot(&fs);

    // Enable, then deleting while enabled is refused.
    let flags = ctl::get_flags(&fs, a).unwrap();
    ctl::set_flags(&fs, a, flags | SnapFlags::ENABLED).unwrap();
    let flags = ctl::get_flags(&fs, a).unwrap();
    assert!(matches!(
        ctl::set_flags(&fs, a, flags & !SnapFlags::LIST),
        Err(SfsError::NotPermitted(_))
    ));

    // Disabling an open snapshot is refused.
    let inode = fs.iget(a).unwrap();
    inode.open();
    let flags = ctl::get_flags(&fs, a).unwrap();
    assert!(flags & SnapFlags::OPEN != 0);
    assert!(matches!(
        ctl::set_flags(&fs, a, flags & !SnapFlags::ENABLED),
        Err(SfsError::NotPermitted(_))
    ));
    inode.release();

    // Delete B (disabled), then enabling a deleted snapshot is refused.
    snapshot_delete(&fs, b);
    let flags = ctl::get_flags(&fs, b).unwrap();
    assert!(matches!(
        ctl::set_flags(&fs, b, flags | SnapFlags::ENABLED),
        Err(SfsError::NotPermitted(_))
    ));
}

#[test]
fn create_rejects_non_empty_and_recycled_files() {
    let (_dev, fs) = mount_fresh();
    take_snapshot(&fs);

    // A non-empty snapfile cannot become a snapshot.
    let file = create_file(&fs, 1, 0x10);
    let handle = fs.journal().start(8);
    fs.iget(file).unwrap().with_state_mut(|state| {
        state.flags.set(SnapFlags::SNAPFILE);
        fs.persist_inode(&handle, file, state)
    })
    .unwrap();
    drop(handle);
    let flags = ctl::get_flags(&fs, file).unwrap();
    assert!(matches!(
        ctl::set_flags(&fs, file, flags | SnapFlags::LIST),
        Err(SfsError::Invalid(_))
    ));
}

// ---------------------------------------------------------------------------
// S3: shrink keeps what older enabled snapshots still need
// ---------------------------------------------------------------------------

#[test]
fn shrink_frees_unneeded_blocks_and_keeps_needed_ones() {
    let (_dev, fs) = mount_fresh();
    let file = create_file(&fs, 4, 0xAA);

    let a = take_snapshot(&fs);
    let flags = ctl::get_flags(&fs, a).unwrap();
    ctl::set_flags(&fs, a, flags | SnapFlags::ENABLED).unwrap();

    // A new block allocated after A's take: not in A's view.
    let handle = fs.journal().start(64);
    fs.file_write_block(&handle, file, 9, &patt(0x44)).unwrap();
    drop(handle);
    fs.journal().commit_transaction();
    let phys_new = fs.iget(file).unwrap().mapping(9).unwrap();

    let b = take_snapshot(&fs);

    // Overwrite both an old block (in A's view) and the new one; both
    // pre-images land in B.
    let phys_old = fs.iget(file).unwrap().mapping(2).unwrap();
    let handle = fs.journal().start(64);
    fs.file_write_block(&handle, file, 2, &patt(0xBB)).unwrap();
    fs.file_write_block(&handle, file, 9, &patt(0x45)).unwrap();
    drop(handle);
    fs.journal().commit_transaction();
    assert!(fs.iget(b).unwrap().mapping(phys_old.snapshot_iblock()).is_some());
    assert!(fs.iget(b).unwrap().mapping(phys_new.snapshot_iblock()).is_some());

    let _c = take_snapshot(&fs);
    snapshot_delete(&fs, b);

    // B stays on the chain: still needed by the enabled A, but shrunk.
    let flags = SnapFlags::new(ctl::get_flags(&fs, b).unwrap());
    assert!(flags.contains(SnapFlags::LIST));
    assert!(flags.contains(SnapFlags::DELETED));
    assert!(flags.contains(SnapFlags::SHRUNK));
    assert!(flags.contains(SnapFlags::INUSE));

    // The copy A needs survives; the one nobody needs was freed.
    let b_inode = fs.iget(b).unwrap();
    assert!(b_inode.mapping(phys_old.snapshot_iblock()).is_some());
    assert!(b_inode.mapping(phys_new.snapshot_iblock()).is_none());

    // A still reads the old contents through B.
    let via_a = read_image(&fs, a, phys_old.snapshot_iblock());
    assert!(via_a.iter().all(|&byte| byte == 0xAA));
}

// ---------------------------------------------------------------------------
// S4: removing every snapshot restores the volume
// ---------------------------------------------------------------------------

fn collect_bitmaps(fs: &FsContext) -> Vec<Vec<u8>> {
    (0..fs.group_count())
        .map(|g| {
            let desc = fs.group_desc(GroupNr(g)).unwrap();
            fs.device()
                .read_block(desc.block_bitmap)
                .unwrap()
                .into_inner()
        })
        .collect()
}

#[test]
fn removing_all_snapshots_restores_live_bitmaps() {
    let (_dev, fs) = mount_fresh();
    let baseline_bitmaps = collect_bitmaps(&fs);
    let baseline_free = fs.free_blocks_total();

    let a = take_snapshot(&fs);
    let b = take_snapshot(&fs);

    snapshot_delete(&fs, a);
    assert!(!fs.chain().contains(&a));

    snapshot_delete(&fs, b);
    assert!(fs.chain().is_empty());
    assert!(fs.active().is_none());
    assert!(fs.superblock().active_snapshot_ino.is_none());
    assert!(fs.superblock().last_snapshot_ino.is_none());

    // A further reconciliation pass has nothing left to do.
    ctl::snapshot_update(&fs, true).unwrap();

    assert_eq!(collect_bitmaps(&fs), baseline_bitmaps);
    assert_eq!(fs.free_blocks_total(), baseline_free);
}

// ---------------------------------------------------------------------------
// Chain invariants
// ---------------------------------------------------------------------------

#[test]
fn single_active_snapshot_at_chain_head_with_monotonic_ids() {
    let (_dev, fs) = mount_fresh();
    let _a = take_snapshot(&fs);
    let _b = take_snapshot(&fs);
    let c = take_snapshot(&fs);

    let chain = fs.chain();
    assert_eq!(chain.first(), Some(&c));
    assert_eq!(fs.active().map(|a| a.ino), Some(c));
    assert_eq!(fs.superblock().active_snapshot_ino, c);
    assert_eq!(fs.superblock().last_snapshot_ino, c);

    let mut active_count = 0;
    let mut last_id = 0;
    for &ino in chain.iter().rev() {
        let inode = fs.iget(ino).unwrap();
        if inode.flags().contains(SnapFlags::ACTIVE) {
            active_count += 1;
        }
        let id = inode.generation().0;
        assert!(id > last_id, "snapshot ids must strictly increase");
        last_id = id;
    }
    assert_eq!(active_count, 1);
    assert_eq!(fs.superblock().snapshot_id.0, last_id);
}

#[test]
fn snapshot_blocks_are_always_excluded() {
    let (_dev, fs) = mount_fresh();
    let file = create_file(&fs, 3, 0xA0);
    let _a = take_snapshot(&fs);
    let _b = take_snapshot(&fs);

    let handle = fs.journal().start(64);
    fs.file_write_block(&handle, file, 1, &patt(0xA1)).unwrap();
    drop(handle);
    fs.journal().commit_transaction();

    for ino in fs.chain() {
        let inode = fs.iget(ino).unwrap();
        let blocks: Vec<BlockNr> = inode.with_state(|state| {
            state
                .map
                .values()
                .copied()
                .chain(state.map_chain.iter().copied())
                .collect()
        });
        for block in blocks {
            let (group, rel) = fs.geometry().absolute_to_group_block(block);
            let bitmap = fs
                .read_exclude_bitmap(group)
                .unwrap()
                .expect("exclude bitmap allocated at mount");
            assert!(
                sfs_alloc::bitmap_get(bitmap.as_slice(), rel),
                "snapshot block {} not excluded",
                block.0
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Journal hook contracts
// ---------------------------------------------------------------------------

#[test]
fn undo_access_never_tolerates_needed_cow() {
    let (_dev, fs) = mount_fresh();
    take_snapshot(&fs);

    // An in-use block with no snapshot copy: the undo hook must fail
    // hard, while the create hook only warns.
    let target = fs.group_desc(GroupNr(2)).unwrap().inode_table;
    let current = fs.device().read_block(target).unwrap();

    let handle = fs.journal().start(64);
    assert!(matches!(
        hooks::get_undo_access(&fs, &handle, target, current.as_slice()),
        Err(SfsError::Corruption { .. })
    ));
    hooks::get_create_access(&fs, &handle, target).unwrap();

    // Bitmap blocks are fine: materialization preserves them itself.
    let bitmap_blk = fs.group_desc(GroupNr(2)).unwrap().block_bitmap;
    let current = fs.device().read_block(bitmap_blk).unwrap();
    hooks::get_undo_access(&fs, &handle, bitmap_blk, current.as_slice()).unwrap();
}

#[test]
fn inconsistent_exclude_bitmap_forces_read_only() {
    let (_dev, fs) = mount_fresh();

    // Mislabel a populated regular file as a snapshot file without
    // excluding its blocks, then take a snapshot: the file's blocks
    // land in the COW bitmap, which an excluded inode's blocks must
    // never do.
    let file = create_file(&fs, 2, 0x33);
    let phys = fs.iget(file).unwrap().mapping(0).unwrap();
    let handle = fs.journal().start(8);
    fs.iget(file).unwrap().with_state_mut(|state| {
        state.flags.set(SnapFlags::SNAPFILE);
        fs.persist_inode(&handle, file, state)
    })
    .unwrap();
    drop(handle);
    take_snapshot(&fs);

    let handle = fs.journal().start(64);
    let err = hooks::get_write_access(&fs, &handle, phys, Some(file)).unwrap_err();
    assert!(matches!(err, SfsError::ExcludeInconsistent { .. }));
    drop(handle);

    assert!(fs.is_read_only());
    let sb = fs.superblock();
    assert!(sb.feature_ro_compat & sfs_types::FEATURE_RO_COMPAT_FIX_EXCLUDE != 0);
}

// ---------------------------------------------------------------------------
// Mount-time chain loading
// ---------------------------------------------------------------------------

#[test]
fn remount_reloads_chain_and_active_snapshot() {
    let (dev, fs) = mount_fresh();
    let file = create_file(&fs, 4, 0xAA);
    let a = take_snapshot(&fs);
    let b = take_snapshot(&fs);

    let phys = fs.iget(file).unwrap().mapping(1).unwrap();
    let handle = fs.journal().start(64);
    fs.file_write_block(&handle, file, 1, &patt(0xAB)).unwrap();
    drop(handle);
    fs.journal().commit_transaction();

    fs.unmount();
    drop(fs);

    let fs = FsContext::mount(dev, MountOptions::default()).unwrap();
    assert_eq!(fs.chain(), vec![b, a]);
    assert_eq!(fs.active().map(|s| s.ino), Some(b));
    assert!(fs.iget(b).unwrap().flags().contains(SnapFlags::ACTIVE));
    assert!(fs.iget(a).unwrap().flags().contains(SnapFlags::LIST));

    // Preservation still routes correctly after remount.
    let via_a = read_image(&fs, a, phys.snapshot_iblock());
    assert!(via_a.iter().all(|&byte| byte == 0xAA));
}

#[test]
fn stale_snapshot_files_are_unreadable() {
    let (_dev, fs) = mount_fresh();
    let a = take_snapshot(&fs);
    let b = take_snapshot(&fs);
    let _keep = b;

    snapshot_delete(&fs, a);
    // A was removed from the chain (nothing depends on it); reading it
    // now is refused.
    assert!(!fs.chain().contains(&a));
    let inode = fs.iget(a).unwrap();
    assert!(matches!(
        read::read_snapshot_block(&fs, &inode, 100),
        Err(SfsError::NotPermitted(_))
    ));
}
