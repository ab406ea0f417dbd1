//! Per-group COW-bitmap cache (lazy materialization).
//!
//! The COW bitmap of a group is `block_bitmap & !exclude_bitmap`,
//! captured at the moment the active snapshot was taken. It is
//! materialized on first access per (group, active snapshot): the first
//! caller claims the group descriptor's cache field with the
//! in-progress marker, builds the bitmap from the journal's *committed*
//! copy of the block bitmap (the snapshot must reflect pre-transaction
//! state), stores it in a snapshot-file block, and publishes the block
//! number. Late arrivals either wait out the in-progress marker with
//! short sleeps or read the published block.

use crate::context::{ActiveSnapshot, CowCacheState, FsContext};
use crate::inode::{Inode, MapIntent};
use sfs_alloc::{bitmap_and_not, bitmap_get};
use sfs_block::BlockBuf;
use sfs_error::{Result, SfsError};
use sfs_journal::Handle;
use sfs_types::{BlockNr, FEATURE_COMPAT_EXCLUDE_INODE, GroupNr, InodeNr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Read the active snapshot's COW bitmap for `group`, materializing it
/// on first access.
pub fn read_cow_bitmap(
    fs: &FsContext,
    handle: &Handle<'_>,
    active: &Arc<Inode>,
    group: GroupNr,
) -> Result<BlockBuf> {
    loop {
        match fs.cow_cache_load_or_claim(group)? {
            CowCacheState::Done(block) => return fs.device().read_block(block),
            CowCacheState::Busy => {
                // At most one materialization per (group, snapshot), so
                // a short sleep beats a wait queue.
                trace!(target: "sfs::bitmap", group = group.0, "waiting for pending COW bitmap");
                thread::sleep(Duration::from_millis(1));
            }
            CowCacheState::Claimed => break,
        }
    }

    let result = materialize(fs, handle, active, group);
    match &result {
        Ok(block) => fs.cow_cache_publish(group, Some(*block))?,
        Err(err) => {
            warn!(
                target: "sfs::bitmap",
                group = group.0,
                error = %err,
                "COW bitmap materialization failed"
            );
            fs.cow_cache_publish(group, None)?;
        }
    }
    fs.device().read_block(result?)
}

fn materialize(
    fs: &FsContext,
    handle: &Handle<'_>,
    active: &Arc<Inode>,
    group: GroupNr,
) -> Result<BlockNr> {
    let bitmap_blk = fs.group_desc(group)?.block_bitmap;
    let iblock = bitmap_blk.snapshot_iblock();

    // A copy may already exist: the take pass pre-copies the bitmap
    // blocks of every chain inode's group, masked the same way.
    let mapped = fs.map_blocks(handle, active, iblock, 1, MapIntent::Read)?;
    if let Some(block) = mapped.first {
        return Ok(block);
    }

    let alloc = fs.map_blocks(handle, active, iblock, 1, MapIntent::Bitmap)?;
    let Some(cow_blk) = alloc.first else {
        return Err(SfsError::Corruption {
            block: bitmap_blk.0,
            detail: "COW bitmap allocation returned no block".into(),
        });
    };
    if !alloc.new_allocation {
        // The pending-COW claim should have kept everyone else out.
        warn!(target: "sfs::bitmap", group = group.0, "COW bitmap mapped behind our claim");
        return Err(SfsError::Corruption {
            block: bitmap_blk.0,
            detail: "concurrent COW bitmap mapping".into(),
        });
    }

    // The mapper registered the pending marker before publishing the
    // mapping; hold it until the bitmap contents are on the device.
    let result = write_cow_bitmap(fs, group, bitmap_blk, cow_blk);
    fs.journal().end_pending_cow(cow_blk);
    result?;

    debug!(
        target: "sfs::bitmap",
        group = group.0,
        block = cow_blk.0,
        snapshot = active.generation().0,
        "COW bitmap materialized"
    );
    Ok(cow_blk)
}

fn write_cow_bitmap(
    fs: &FsContext,
    group: GroupNr,
    bitmap_blk: BlockNr,
    cow_blk: BlockNr,
) -> Result<()> {
    let mut out = vec![0u8; fs.geometry().block_size as usize];
    compute_view(fs, group, bitmap_blk, &mut out)?;
    fs.device().write_block(cow_blk, &out)?;
    // The bitmap copy is the basis of every preservation decision for
    // this group; push it to stable storage before publishing.
    fs.device().sync()
}

/// Synthesize the COW-bitmap contents into a caller-provided buffer.
///
/// Used by the image read router so a snapshot image presents its
/// point-in-time block bitmap rather than the live one.
pub fn read_block_bitmap_for_image(fs: &FsContext, group: GroupNr, dst: &mut [u8]) -> Result<()> {
    let bitmap_blk = fs.group_desc(group)?.block_bitmap;
    compute_view(fs, group, bitmap_blk, dst)
}

fn compute_view(fs: &FsContext, group: GroupNr, bitmap_blk: BlockNr, dst: &mut [u8]) -> Result<()> {
    // Another task may be allocating active-snapshot blocks in this
    // bitmap right now; the committed copy is free of those, because
    // every allocator takes undo access before touching a bit.
    let src = match fs.journal().committed_copy(bitmap_blk) {
        Some(committed) => committed,
        None => fs.device().read_block(bitmap_blk)?.into_inner(),
    };
    let mask = fs.read_exclude_bitmap(group)?;
    match mask {
        Some(mask) => bitmap_and_not(dst, &src, mask.as_slice()),
        None => dst.copy_from_slice(&src[..dst.len()]),
    }
    Ok(())
}

/// Test how many of `count` consecutive blocks starting at `block` are
/// in use by the active snapshot.
///
/// `excluded` names the owning inode when the caller knows the blocks
/// belong to an excluded (snapshot-subsystem) file; a set COW bit for
/// such a block means the exclude bitmap is inconsistent, which marks
/// the filesystem for fsck.
pub fn test_cow_bitmap(
    fs: &FsContext,
    handle: &Handle<'_>,
    active_info: &ActiveSnapshot,
    active: &Arc<Inode>,
    block: BlockNr,
    count: u32,
    excluded: Option<InodeNr>,
) -> Result<u32> {
    if block.0 >= active_info.blocks {
        // Past the last block at take time; the volume was resized
        // after the snapshot was taken.
        return Ok(0);
    }

    let (group, bit) = fs.geometry().absolute_to_group_block(block);
    let cow = read_cow_bitmap(fs, handle, active, group)?;
    let blocks_in_group = fs.geometry().blocks_in_group(group);

    let mut inuse = 0;
    while inuse < count && bit + inuse < blocks_in_group {
        if bitmap_get(cow.as_slice(), bit + inuse) {
            inuse += 1;
        } else {
            break;
        }
    }

    if inuse > 0 {
        if let Some(ino) = excluded {
            if !fs.superblock().has_compat(FEATURE_COMPAT_EXCLUDE_INODE) {
                // No exclude machinery on this volume; nothing to be
                // inconsistent with.
                return Ok(0);
            }
            // Excluded file blocks must never appear in the COW bitmap.
            let err = SfsError::ExcludeInconsistent { group: group.0, bit };
            warn!(
                target: "sfs::bitmap",
                ino = ino.0,
                group = group.0,
                bit,
                "excluded file block not excluded, run fsck"
            );
            fs.mark_fs_error(&err);
            return Err(err);
        }
    }
    Ok(inuse)
}

/// Idempotently mark `count` blocks starting at `start` in the exclude
/// bitmap; returns how many bits were newly set.
pub fn exclude_blocks(
    fs: &FsContext,
    handle: &Handle<'_>,
    start: BlockNr,
    count: u32,
) -> Result<u32> {
    let newly = fs.exclude_blocks(handle, start, count)?;
    if newly > 0 {
        trace!(
            target: "sfs::bitmap",
            start = start.0,
            count,
            newly,
            "blocks excluded"
        );
    }
    Ok(newly)
}
