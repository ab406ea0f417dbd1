//! COW and move-on-write decision paths.
//!
//! `test_and_cow` preserves a metadata block's pre-image in the active
//! snapshot before the host overwrites or frees it. `test_and_move`
//! does the same for regular-file data blocks by re-parenting them into
//! the snapshot without copying. Both run inside the caller's journal
//! handle; the handle's `cowing` flag keeps the blocks we allocate
//! while COWing from being COWed recursively.

use crate::context::FsContext;
use crate::inode::{Inode, MapIntent};
use crate::snapshot::bitmap;
use sfs_error::{Result, SfsError};
use sfs_journal::{COW_TRANS_BLOCKS, Handle};
use sfs_types::{BlockNr, EXCLUDE_INO, InodeNr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Re-entrancy guard: clears the handle's `cowing` flag on every exit
/// path, including errors.
struct CowGuard<'a, 'j> {
    handle: &'a Handle<'j>,
}

impl<'a, 'j> CowGuard<'a, 'j> {
    fn begin(handle: &'a Handle<'j>) -> Self {
        if !handle.has_credits(COW_TRANS_BLOCKS) {
            // The credit estimate is a lower-bound heuristic; this may
            // be a false alarm, but the caller should have extended.
            warn!(
                target: "sfs::cow",
                credits = handle.credits(),
                "low journal credits entering COW"
            );
        }
        handle.set_cowing(true);
        Self { handle }
    }
}

impl Drop for CowGuard<'_, '_> {
    fn drop(&mut self) {
        self.handle.set_cowing(false);
    }
}

/// Wait for in-flight tracked reads of the source block, then publish
/// the finished copy.
fn complete_cow(fs: &FsContext, snapshot_block: BlockNr, source: Option<BlockNr>) {
    if let Some(source) = source {
        while fs.read_tracker().readers(source) > 0 {
            // Extremely improbable; msleep-style waiting is sufficient.
            trace!(
                target: "sfs::cow",
                block = source.0,
                "waiting for tracked reads before completing COW"
            );
            thread::sleep(Duration::from_millis(1));
        }
    }
    fs.journal().end_pending_cow(snapshot_block);
}

/// Preserve `block` in the active snapshot before the host modifies it.
///
/// `inode` identifies the owning inode for data/indirect writes, `None`
/// for global metadata. With `may_cow` false this only probes and
/// reports [`SfsError::NeedsCow`] when a copy would have been made.
pub fn test_and_cow(
    fs: &FsContext,
    handle: &Handle<'_>,
    inode: Option<&Arc<Inode>>,
    block: BlockNr,
    buf: Option<&[u8]>,
    may_cow: bool,
) -> Result<()> {
    let Some(active_info) = fs.active() else {
        return Ok(());
    };

    // Exclude-bitmap updates never COW.
    if let Some(owner) = inode {
        if owner.ino == InodeNr(EXCLUDE_INO) {
            return Ok(());
        }
    }

    if handle.cowing() {
        // Blocks allocated while COWing belong to the active snapshot.
        return Ok(());
    }
    if let Some(owner) = inode {
        if owner.ino == active_info.ino {
            trace!(target: "sfs::cow", block = block.0, "active snapshot access denied");
            return Err(SfsError::NotPermitted(
                "active snapshot is modified only through COW",
            ));
        }
    }

    if fs.journal().test_cowed(block, handle.tid()) {
        // Already handled in this transaction.
        return Ok(());
    }

    let active = fs.iget(active_info.ino)?;
    let _guard = CowGuard::begin(handle);

    // Snapshot-subsystem files are excluded: never copied, and their
    // blocks are (re)marked in the exclude bitmap instead.
    let excluded = inode
        .filter(|owner| owner.is_snapshot_file())
        .map(|owner| owner.ino);
    let may_cow = may_cow && excluded.is_none();

    let inuse = bitmap::test_cow_bitmap(fs, handle, &active_info, &active, block, 1, excluded)?;
    if inuse == 0 {
        // Free at take time; nothing to preserve.
        fs.journal().mark_cowed(block, handle.tid());
        if excluded.is_some() {
            bitmap::exclude_blocks(fs, handle, block, 1)?;
        }
        return Ok(());
    }

    // In use by the snapshot; is a copy already mapped?
    let iblock = block.snapshot_iblock();
    let mapped = fs.map_blocks(handle, &active, iblock, 1, MapIntent::Read)?;
    if let Some(snapshot_blk) = mapped.first {
        // Another COWer got here first; rendezvous with its copy.
        fs.journal().wait_pending_cow(snapshot_blk);
        fs.journal().mark_cowed(block, handle.tid());
        if excluded.is_some() {
            bitmap::exclude_blocks(fs, handle, block, 1)?;
        }
        return Ok(());
    }

    if !may_cow {
        return Err(SfsError::NeedsCow);
    }

    // Make sure we hold an uptodate source image.
    let src = match buf {
        Some(data) => data.to_vec(),
        None => fs.device().read_block(block)?.into_inner(),
    };

    handle.use_credits(COW_TRANS_BLOCKS);
    let alloc = fs.map_blocks(handle, &active, iblock, 1, MapIntent::Cow)?;
    let Some(snapshot_blk) = alloc.first else {
        return Err(SfsError::Corruption {
            block: block.0,
            detail: "COW allocation returned no block".into(),
        });
    };

    if alloc.new_allocation {
        // The mapper registered the pending marker before publishing
        // the mapping; clear it once the copy lands.
        if let Err(err) = fs.device().write_block(snapshot_blk, &src) {
            fs.journal().end_pending_cow(snapshot_blk);
            return Err(err);
        }
        complete_cow(fs, snapshot_blk, Some(block));
        debug!(
            target: "sfs::cow",
            block = block.0,
            copy = snapshot_blk.0,
            snapshot = active_info.id.0,
            "block COWed"
        );
    } else {
        // Lost the allocation race; wait for the winner's copy.
        fs.journal().wait_pending_cow(snapshot_blk);
    }

    fs.journal().mark_cowed(block, handle.tid());
    if excluded.is_some() {
        bitmap::exclude_blocks(fs, handle, block, 1)?;
    }
    Ok(())
}

/// Move up to `maxblocks` data blocks starting at `block` into the
/// active snapshot instead of copying them.
///
/// Returns the number of blocks moved, or with `may_move` false the
/// number that would need moving. Zero means the range is not in use by
/// the snapshot (or is already preserved).
pub fn test_and_move(
    fs: &FsContext,
    handle: &Handle<'_>,
    inode: Option<&Arc<Inode>>,
    block: BlockNr,
    maxblocks: u32,
    may_move: bool,
) -> Result<u32> {
    let Some(active_info) = fs.active() else {
        return Ok(0);
    };

    if handle.cowing() {
        return Err(SfsError::Invalid("block move attempted inside a COW".into()));
    }
    if let Some(owner) = inode {
        if owner.ino == active_info.ino {
            return Err(SfsError::NotPermitted(
                "active snapshot is modified only through COW",
            ));
        }
    }

    let active = fs.iget(active_info.ino)?;
    let _guard = CowGuard::begin(handle);

    let excluded = inode
        .filter(|owner| owner.is_snapshot_file())
        .map(|owner| owner.ino);
    let may_move = may_move && excluded.is_none();

    let count =
        bitmap::test_cow_bitmap(fs, handle, &active_info, &active, block, maxblocks, excluded)?;
    if count == 0 {
        return Ok(0);
    }

    let Some(owner) = inode else {
        // A group extend "freeing" blocks it just added; those cannot
        // be in use by the snapshot and must not be moved.
        warn!(
            target: "sfs::cow",
            block = block.0,
            "move of ownerless blocks requested, skipping"
        );
        return Ok(0);
    };

    let iblock = block.snapshot_iblock();
    let mapped = fs.map_blocks(handle, &active, iblock, 1, MapIntent::Read)?;
    if mapped.count > 0 {
        // Already preserved.
        return Ok(0);
    }

    if !may_move {
        return Ok(count);
    }

    handle.use_credits(COW_TRANS_BLOCKS);
    let moved = fs
        .map_blocks(handle, &active, iblock, count, MapIntent::Move)?
        .count;

    // The live owner is no longer charged for these blocks; the
    // snapshot owner was charged at map time.
    owner.with_state_mut(|state| {
        state.blocks_charged = state.blocks_charged.saturating_sub(moved);
    });
    bitmap::exclude_blocks(fs, handle, block, moved)?;

    debug!(
        target: "sfs::cow",
        block = block.0,
        moved,
        snapshot = active_info.id.0,
        "blocks moved to snapshot"
    );
    Ok(moved)
}
