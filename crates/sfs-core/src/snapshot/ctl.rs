//! Snapshot lifecycle manager and flag-driven control surface.
//!
//! Snapshot files move through their life cycle by flag changes: adding
//! the list flag creates the snapshot, `snapshot_take` captures the
//! volume state and activates it, the enabled flag exposes it for loop
//! mount, clearing the list flag marks it deleted, and the update pass
//! reconciles the chain: removing unused deleted snapshots, shrinking
//! and merging the rest.
//!
//! Everything here runs under the snapshot mutex; take and deactivation
//! additionally hold the journal update barrier so the active-snapshot
//! pointer only changes with no transaction in flight.

use crate::context::{ActiveSnapshot, FsContext};
use crate::inode::{Inode, MapIntent};
use crate::snapshot::read::read_snapshot_block;
use sfs_alloc::bitmap_and_not;
use sfs_alloc::bitmap_get;
use sfs_error::{Result, SfsError};
use sfs_journal::{Handle, MAX_TRANS_DATA};
use sfs_ondisk::{DiskInode, INODE_RECORD_SIZE, MODE_REGULAR};
use sfs_types::{
    BlockNr, EXCLUDE_INO, FEATURE_COMPAT_BIG_JOURNAL, FEATURE_COMPAT_EXCLUDE_INODE,
    FEATURE_COMPAT_RECOVER, FEATURE_RO_COMPAT_HAS_SNAPSHOT, GroupNr, InodeNr, JOURNAL_INO,
    SNAPSHOT_RESERVED_BLOCKS, SnapFlags, SnapshotId,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ── Control surface ─────────────────────────────────────────────────────────

/// Apply a user flag change, dispatching the lifecycle transitions the
/// change implies. Returns the resulting flag bits.
pub fn set_flags(fs: &FsContext, ino: InodeNr, requested: u32) -> Result<u32> {
    if fs.is_read_only() {
        return Err(SfsError::ReadOnly);
    }
    let _guard = fs.lock_snapshots();
    let inode = fs.iget(ino)?;
    let old = inode.flags();

    if !inode.is_snapshot_file() {
        // The only snapshot bit a plain file may gain is the snapfile
        // identity itself (inherited from its directory at birth).
        let toggled = (requested ^ old.bits()) & SnapFlags::ALL;
        if toggled == SnapFlags::SNAPFILE && requested & SnapFlags::SNAPFILE != 0 {
            let handle = fs.journal().start(8);
            inode.with_state_mut(|state| {
                state.flags.set(SnapFlags::SNAPFILE);
                fs.persist_inode(&handle, ino, state)
            })?;
            return Ok(inode.flags().bits());
        }
        if toggled != 0 {
            return Err(SfsError::Invalid(
                "snapshot flags cannot be changed on a non-snapshot file".into(),
            ));
        }
        return Ok(old.bits());
    }

    // Enable/disable first, then list transitions, mirroring the order
    // user tooling toggles them in.
    let toggled = (requested ^ old.bits()) & SnapFlags::ALL;
    if toggled & SnapFlags::SNAPFILE != 0 {
        return Err(SfsError::NotPermitted(
            "a snapshot file cannot shed the snapfile flag",
        ));
    }
    if toggled & SnapFlags::ENABLED != 0 {
        if requested & SnapFlags::ENABLED != 0 {
            snapshot_enable(fs, &inode)?;
        } else {
            snapshot_disable(fs, &inode)?;
        }
    }
    if toggled & SnapFlags::LIST != 0 {
        if requested & SnapFlags::LIST != 0 {
            // Setting the list flag is the whole "take a snapshot"
            // sequence: link the file on the chain, then capture the
            // volume state. A failure between the two leaves the file
            // on the chain for the update pass to reap.
            snapshot_create(fs, &inode)?;
            take_inner(fs, &inode)?;
        } else {
            snapshot_delete(fs, &inode)?;
        }
    } else if toggled & SnapFlags::DELETED != 0 && requested & SnapFlags::DELETED != 0 {
        snapshot_delete(fs, &inode)?;
    }

    update(fs, true)?;
    Ok(inode.flags().bits())
}

/// Report a snapshot's flags with the dynamic open state recomputed.
pub fn get_flags(fs: &FsContext, ino: InodeNr) -> Result<u32> {
    let inode = fs.iget(ino)?;
    let open = inode.open_count() > 0;
    inode.with_state_mut(|state| {
        if open && state.flags.contains(SnapFlags::LIST) {
            state.flags.set(SnapFlags::OPEN);
        } else {
            state.flags.clear(SnapFlags::OPEN);
        }
        state.flags.bits()
    });
    Ok(inode.flags().bits())
}

// ── Create ──────────────────────────────────────────────────────────────────

/// Initialize a snapshot file and link it at the head of the chain.
///
/// The file must be an empty, freshly flagged snapfile, and the current
/// chain head (if any) must be the active snapshot; anything else is a
/// recycled or half-taken file and is refused.
pub(crate) fn snapshot_create(fs: &FsContext, inode: &Arc<Inode>) -> Result<()> {
    if let Some(head) = fs.chain_head() {
        if fs.active().map(|a| a.ino) != Some(head) {
            warn!(
                target: "sfs::ctl",
                head = head.0,
                "cannot add snapshot: last snapshot is not active"
            );
            return Err(SfsError::Invalid(
                "last snapshot on the chain is not active".into(),
            ));
        }
    }

    let (flags, links, empty) = inode.with_state(|state| {
        (
            state.flags,
            state.links,
            state.size == 0 && state.disksize == 0,
        )
    });
    let empty = empty && inode.block_count() == 0;
    if links == 0 {
        return Err(SfsError::Invalid("snapshot file has no links".into()));
    }
    if flags.bits() & SnapFlags::ALL != SnapFlags::SNAPFILE {
        return Err(SfsError::Invalid(format!(
            "snapshot file has stale snapshot flags ({:#x})",
            flags.bits()
        )));
    }
    if !empty {
        return Err(SfsError::Invalid("snapshot file is not empty".into()));
    }

    let handle = fs.journal().start(MAX_TRANS_DATA);
    let sb = fs.superblock();
    let generation = next_snapshot_id(sb.snapshot_id);

    // Record identity and on-disk size; the file stays disabled
    // (zero i_size) until explicitly enabled.
    let old_head = fs.chain_head().unwrap_or(InodeNr::NONE);
    inode.with_state_mut(|state| {
        state.generation = generation;
        state.disksize = u64::from(sb.blocks_count) * 4096;
        state.size = 0;
        state.flags.set(SnapFlags::LIST);
        state.next_snapshot = old_head;
        fs.persist_inode(&handle, inode.ino, state)
    })?;

    fs.with_sb(|sb| {
        sb.last_snapshot_ino = inode.ino;
        sb.feature_ro_compat |= FEATURE_RO_COMPAT_HAS_SNAPSHOT;
    });
    fs.write_sb(Some(&handle))?;
    fs.chain_insert_head(inode.ino);

    let result = preallocate(fs, &handle, inode);
    if let Err(err) = result {
        // Leave the half-created snapshot on the chain; the update pass
        // reaps snapshots newer than the active one.
        warn!(
            target: "sfs::ctl",
            ino = inode.ino.0,
            error = %err,
            "snapshot create failed after chain insert"
        );
        return Err(err);
    }

    drop(handle);
    fs.journal().commit_transaction();
    info!(
        target: "sfs::ctl",
        ino = inode.ino.0,
        id = generation.0,
        "snapshot created"
    );
    Ok(())
}

/// Pre-allocate the reserved header blocks and the critical-path blocks
/// every image read needs: for the journal inode and each chain inode,
/// the block bitmap, inode bitmap, and containing inode-table block of
/// its group.
fn preallocate(fs: &FsContext, handle: &Handle<'_>, inode: &Arc<Inode>) -> Result<()> {
    let sb = fs.superblock();
    let zero = vec![0u8; fs.geometry().block_size as usize];

    // Header: superblock copy slot plus the group-descriptor copies.
    for slot in 0..=u32::from(sb.gdt_blocks) {
        handle.extend_or_restart(MAX_TRANS_DATA)?;
        let alloc = fs.map_blocks(handle, inode, slot, 1, MapIntent::Write)?;
        let Some(block) = alloc.first else {
            return Err(SfsError::NoSpace);
        };
        if alloc.new_allocation {
            fs.device().write_block(block, &zero)?;
        }
    }

    // Critical-path triplets, deduplicated by inode-table block.
    let mut inos = vec![InodeNr(JOURNAL_INO)];
    inos.extend(fs.chain());
    let mut seen_tables = HashSet::new();
    for ino in inos {
        let (table_block, _) = fs.inode_record_location(ino)?;
        if !seen_tables.insert(table_block.0) {
            continue;
        }
        let (group, _) = fs
            .geometry()
            .absolute_to_group_block(table_block);
        let desc = fs.group_desc(group)?;

        for phys in [desc.block_bitmap, desc.inode_bitmap, table_block] {
            handle.extend_or_restart(MAX_TRANS_DATA)?;
            let alloc =
                fs.map_blocks(handle, inode, phys.snapshot_iblock(), 1, MapIntent::Write)?;
            if alloc.first.is_none() {
                return Err(SfsError::NoSpace);
            }
        }
    }
    Ok(())
}

// ── Take ────────────────────────────────────────────────────────────────────

/// Capture the volume state into the newest created snapshot and make
/// it the active one.
pub fn snapshot_take(fs: &FsContext, ino: InodeNr) -> Result<()> {
    if fs.is_read_only() {
        return Err(SfsError::ReadOnly);
    }
    let _guard = fs.lock_snapshots();
    let inode = fs.iget(ino)?;
    take_inner(fs, &inode)?;
    update(fs, true)
}

fn take_inner(fs: &FsContext, inode: &Arc<Inode>) -> Result<()> {
    if fs.chain_head() != Some(inode.ino) || !inode.flags().contains(SnapFlags::LIST) {
        return Err(SfsError::Invalid(
            "only the newest created snapshot can be taken".into(),
        ));
    }
    if inode.flags().contains(SnapFlags::ACTIVE) {
        return Err(SfsError::Invalid("snapshot is already active".into()));
    }

    // Verify enough free space for expected snapshot growth before
    // committing to the take.
    let reserve = reserve_estimate(fs)?;
    if fs.free_blocks_total() < reserve {
        return Err(SfsError::NoSpace);
    }

    // Freeze: no transaction may be in flight while the volume state is
    // captured and the active pointer swapped.
    let updates = fs.journal().lock_updates();
    let result = take_frozen(fs, inode, reserve, &updates);
    drop(updates);
    result?;

    info!(
        target: "sfs::ctl",
        ino = inode.ino.0,
        id = inode.generation().0,
        "snapshot taken"
    );
    Ok(())
}

fn take_frozen(
    fs: &FsContext,
    inode: &Arc<Inode>,
    reserve: u32,
    updates: &sfs_journal::UpdatesLock<'_>,
) -> Result<()> {
    let sb = fs.superblock();
    fs.with_sb(|sb| sb.feature_compat &= !FEATURE_COMPAT_RECOVER);

    // Patched superblock copy into header slot 0: the image presents as
    // a standalone read-only filesystem.
    let Some(sb_copy_blk) = inode.mapping(0) else {
        return Err(SfsError::Corruption {
            block: 0,
            detail: "snapshot superblock slot not allocated".into(),
        });
    };
    let mut patched = sb.clone();
    patched.patch_for_image();
    let mut block = vec![0u8; fs.geometry().block_size as usize];
    patched.encode_into(&mut block);
    fs.device().write_block(sb_copy_blk, &block)?;

    // Group-descriptor copies into header slots 1..=gdt.
    for i in 0..u32::from(sb.gdt_blocks) {
        let Some(copy_blk) = inode.mapping(1 + i) else {
            return Err(SfsError::Corruption {
                block: 1 + i,
                detail: "snapshot descriptor slot not allocated".into(),
            });
        };
        let src = fs.device().read_block(BlockNr(1 + i))?;
        fs.device().write_block(copy_blk, src.as_slice())?;
    }

    // Critical-path triplets for the journal inode and every chain
    // snapshot, with the image fix-ups applied.
    copy_inode_triplets(fs, inode)?;
    fs.device().sync()?;

    // Commit the new id and active pointer in one superblock write,
    // then swap the in-memory pointer.
    let generation = inode.generation();
    fs.with_sb(|sb| {
        sb.snapshot_id = next_snapshot_id(sb.snapshot_id);
        sb.active_snapshot_ino = inode.ino;
        sb.snapshot_reserved_blocks = reserve;
    });
    fs.write_sb(None)?;

    if let Some(old) = fs.active() {
        if let Ok(old_inode) = fs.iget(old.ino) {
            old_inode.with_state_mut(|state| state.flags.clear(SnapFlags::ACTIVE));
            debug!(target: "sfs::ctl", id = old.id.0, "snapshot deactivated");
        }
    }
    inode.with_state_mut(|state| state.flags.set(SnapFlags::ACTIVE | SnapFlags::LIST));
    fs.set_active(
        updates,
        Some(ActiveSnapshot {
            ino: inode.ino,
            id: generation,
            blocks: sb.blocks_count,
        }),
    );

    // COW bitmaps re-materialize lazily against the new snapshot.
    fs.reset_cow_caches();
    Ok(())
}

/// Copy each relevant inode's block-bitmap/inode-bitmap/inode-table
/// triplet into the new snapshot and rewrite the copies so the image is
/// consistent on its own: the journal inode is zeroed, and snapshot
/// inodes are pruned of block references (their blocks are excluded
/// from the image's bitmap).
fn copy_inode_triplets(fs: &FsContext, snapshot: &Arc<Inode>) -> Result<()> {
    let mut inos = vec![InodeNr(JOURNAL_INO)];
    inos.extend(fs.chain());

    let mut seen_tables = HashSet::new();
    for ino in &inos {
        let (table_block, _) = fs.inode_record_location(*ino)?;
        if !seen_tables.insert(table_block.0) {
            continue;
        }
        let (group, _) = fs.geometry().absolute_to_group_block(table_block);
        let desc = fs.group_desc(group)?;

        // Block bitmap, masked by the exclude bitmap.
        let src = fs.device().read_block(desc.block_bitmap)?;
        let mut masked = vec![0u8; src.len()];
        match fs.read_exclude_bitmap(group)? {
            Some(mask) => bitmap_and_not(&mut masked, src.as_slice(), mask.as_slice()),
            None => masked.copy_from_slice(src.as_slice()),
        }
        write_triplet_copy(fs, snapshot, desc.block_bitmap, &masked)?;

        // Inode bitmap, verbatim.
        let imap = fs.device().read_block(desc.inode_bitmap)?;
        write_triplet_copy(fs, snapshot, desc.inode_bitmap, imap.as_slice())?;

        // Inode table block, with per-record fix-ups for every special
        // inode living in this block.
        let mut table = fs.device().read_block(table_block)?.into_inner();
        for fix_ino in &inos {
            let (fix_block, record_off) = fs.inode_record_location(*fix_ino)?;
            if fix_block != table_block {
                continue;
            }
            if fix_ino.0 == JOURNAL_INO {
                table[record_off..record_off + INODE_RECORD_SIZE].fill(0);
            } else {
                let mut record = DiskInode::decode(&table[record_off..record_off + INODE_RECORD_SIZE])
                    .map_err(|e| SfsError::Format(e.to_string()))?;
                record.prune_for_image();
                record.encode_into(&mut table[record_off..record_off + INODE_RECORD_SIZE]);
            }
        }
        write_triplet_copy(fs, snapshot, table_block, &table)?;
    }
    Ok(())
}

fn write_triplet_copy(
    fs: &FsContext,
    snapshot: &Arc<Inode>,
    phys: BlockNr,
    data: &[u8],
) -> Result<()> {
    let Some(copy_blk) = snapshot.mapping(phys.snapshot_iblock()) else {
        return Err(SfsError::Corruption {
            block: phys.0,
            detail: "snapshot critical-path block not pre-allocated".into(),
        });
    };
    fs.device().write_block(copy_blk, data)
}

/// Disk space to reserve for snapshot growth: indirect-map overhead for
/// moved data, a copy per metadata block, and directory-index headroom
/// estimated from the allocated inode count.
fn reserve_estimate(fs: &FsContext) -> Result<u32> {
    let sb = fs.superblock();
    let used_inodes = fs.count_used_inodes()?;
    Ok(2 * (sb.blocks_count >> 10) + fs.metadata_blocks() + used_inodes / 64)
}

// ── Enable / disable / delete ───────────────────────────────────────────────

pub(crate) fn snapshot_enable(fs: &FsContext, inode: &Arc<Inode>) -> Result<()> {
    let flags = inode.flags();
    if !flags.contains(SnapFlags::LIST) {
        return Err(SfsError::Invalid("snapshot is not on the list".into()));
    }
    if flags.contains(SnapFlags::DELETED) {
        return Err(SfsError::NotPermitted("cannot enable a deleted snapshot"));
    }

    // Expose the full image size so the file can back a loop device.
    let handle = fs.journal().start(8);
    inode.with_state_mut(|state| {
        state.size = state.disksize;
        state.flags.set(SnapFlags::ENABLED);
        fs.persist_inode(&handle, inode.ino, state)
    })?;
    info!(target: "sfs::ctl", id = inode.generation().0, "snapshot enabled");
    Ok(())
}

pub(crate) fn snapshot_disable(fs: &FsContext, inode: &Arc<Inode>) -> Result<()> {
    let flags = inode.flags();
    if !flags.contains(SnapFlags::LIST) {
        return Err(SfsError::Invalid("snapshot is not on the list".into()));
    }
    if inode.open_count() > 0 {
        return Err(SfsError::NotPermitted("cannot disable an open snapshot"));
    }

    let handle = fs.journal().start(8);
    inode.with_state_mut(|state| {
        state.size = 0;
        state.flags.clear(SnapFlags::ENABLED | SnapFlags::OPEN);
        fs.persist_inode(&handle, inode.ino, state)
    })?;
    info!(target: "sfs::ctl", id = inode.generation().0, "snapshot disabled");
    Ok(())
}

pub(crate) fn snapshot_delete(fs: &FsContext, inode: &Arc<Inode>) -> Result<()> {
    let flags = inode.flags();
    if !flags.contains(SnapFlags::LIST) {
        return Err(SfsError::Invalid("snapshot is not on the list".into()));
    }
    if flags.contains(SnapFlags::ENABLED) {
        return Err(SfsError::NotPermitted("cannot delete an enabled snapshot"));
    }

    // Mark only; the update pass finishes the job.
    let handle = fs.journal().start(8);
    inode.with_state_mut(|state| {
        state.flags.set(SnapFlags::DELETED);
        fs.persist_inode(&handle, inode.ino, state)
    })?;
    info!(target: "sfs::ctl", id = inode.generation().0, "snapshot marked for deletion");
    Ok(())
}

// ── Update (reconciliation) ─────────────────────────────────────────────────

/// Public entry point: reconcile the chain under the snapshot mutex.
pub fn snapshot_update(fs: &FsContext, cleanup: bool) -> Result<()> {
    let _guard = fs.lock_snapshots();
    update(fs, cleanup)
}

/// Walk the chain oldest-to-newest, recomputing dynamic flags and,
/// with `cleanup`, reaping deleted snapshots: unused ones are removed,
/// the rest are shrunk and merged in runs bounded by non-deleted
/// snapshots. Errors are propagated (first one wins) but the walk
/// finishes so the chain state stays coherent.
pub(crate) fn update(fs: &FsContext, cleanup: bool) -> Result<()> {
    let read_only = fs.is_read_only();
    let active = fs.active();
    if let Some(a) = &active {
        if let Ok(inode) = fs.iget(a.ino) {
            inode.with_state_mut(|state| state.flags.set(SnapFlags::ACTIVE | SnapFlags::LIST));
        }
    }

    let chain = fs.chain();
    let mut found_active = false;
    let mut found_enabled = false;
    let mut used_by: Option<InodeNr> = None;
    let mut need_shrink = 0u32;
    let mut need_merge = 0u32;
    let mut first_err: Option<SfsError> = None;

    for &ino in chain.iter().rev() {
        let inode = match fs.iget(ino) {
            Ok(inode) => inode,
            Err(err) => {
                first_err.get_or_insert(err);
                continue;
            }
        };
        inode.with_state_mut(|state| state.flags.set(SnapFlags::LIST));

        // Snapshots newer than the active one are failed takes; no
        // active snapshot at all means the first take failed.
        if found_active || active.is_none() {
            if !read_only {
                if let Err(err) = snapshot_remove(fs, &inode) {
                    first_err.get_or_insert(err);
                }
            }
            continue;
        }

        let is_active = active.as_ref().map(|a| a.ino) == Some(ino);
        inode.with_state_mut(|state| {
            if is_active {
                state.flags.set(SnapFlags::ACTIVE);
            } else {
                state.flags.clear(SnapFlags::ACTIVE);
            }
            if found_enabled {
                state.flags.set(SnapFlags::INUSE);
            } else {
                state.flags.clear(SnapFlags::INUSE);
            }
        });
        if is_active {
            found_active = true;
        }

        let flags = inode.flags();
        let deleted = flags.contains(SnapFlags::DELETED) && !is_active;

        if cleanup {
            if deleted && used_by.is_none() {
                // Permanently unused deleted snapshot.
                if let Err(err) = snapshot_remove(fs, &inode) {
                    first_err.get_or_insert(err);
                }
                continue;
            } else if deleted {
                if !flags.contains(SnapFlags::SHRUNK) {
                    need_shrink += 1;
                }
                if !flags.contains(SnapFlags::INUSE) {
                    need_merge += 1;
                }
            } else {
                if need_shrink > 0 {
                    if let Err(err) = snapshot_shrink(fs, used_by, ino, need_shrink) {
                        first_err.get_or_insert(err);
                    }
                }
                if need_merge > 0 {
                    if let Err(err) = snapshot_merge(fs, used_by, ino, need_merge) {
                        first_err.get_or_insert(err);
                    }
                }
                need_shrink = 0;
                need_merge = 0;
            }
        }

        if !deleted {
            if !is_active {
                used_by = Some(ino);
            }
            if flags.contains(SnapFlags::ENABLED) {
                found_enabled = true;
            }
        }
    }

    // If every snapshot is deleted the active one can finally go too.
    if cleanup && !read_only && used_by.is_none() {
        if let Some(a) = &active {
            let inode = fs.iget(a.ino)?;
            if inode.flags().contains(SnapFlags::DELETED) {
                let updates = fs.journal().lock_updates();
                inode.with_state_mut(|state| state.flags.clear(SnapFlags::ACTIVE));
                fs.set_active(&updates, None);
                fs.with_sb(|sb| sb.active_snapshot_ino = InodeNr::NONE);
                fs.write_sb(None)?;
                drop(updates);
                debug!(target: "sfs::ctl", id = a.id.0, "active snapshot deactivated");
                snapshot_remove(fs, &inode)?;
            }
        }
    }

    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

// ── Shrink ──────────────────────────────────────────────────────────────────

/// Free unused blocks from the run of deleted snapshots strictly
/// between `start` (older, non-deleted) and `end` (newer, non-deleted).
///
/// A deleted snapshot's block is kept only when `start`'s point-in-time
/// bitmap shows it in use, `start` has no own copy, and no deleted
/// snapshot closer to `start` already provides it; everything else is
/// freed. Groups past `start`'s size free everything (the volume was
/// resized after `start` was taken).
fn snapshot_shrink(
    fs: &FsContext,
    start: Option<InodeNr>,
    end: InodeNr,
    need_shrink: u32,
) -> Result<()> {
    let Some(start_ino) = start else {
        return Ok(());
    };
    let start_inode = fs.iget(start_ino)?;
    let start_blocks = (start_inode.with_state(|s| s.disksize) / 4096) as u32;
    let interval = chain_interval(fs, start_ino, end);
    if interval.is_empty() {
        return Ok(());
    }
    debug!(
        target: "sfs::ctl",
        start = start_ino.0,
        end = end.0,
        need_shrink,
        "shrinking deleted snapshots"
    );

    let handle = fs.journal().start(MAX_TRANS_DATA);
    let geo = *fs.geometry();

    for g in 0..geo.group_count {
        let group = GroupNr(g);
        let group_start = g * geo.blocks_per_group;
        let lo = BlockNr(group_start).snapshot_iblock();
        let hi = lo + geo.blocks_in_group(group);

        // `start`'s view of this group, through the usual image route.
        let view = if group_start >= start_blocks {
            None
        } else {
            let bitmap_blk = fs.group_desc(group)?.block_bitmap;
            Some(
                read_snapshot_block(fs, &start_inode, bitmap_blk.snapshot_iblock())?
                    .into_inner(),
            )
        };

        let mut kept: HashSet<u32> = HashSet::new();
        // Closest-to-start first, so the copy an older reader would
        // find first is the one preserved.
        for ino in interval.iter().rev() {
            let inode = fs.iget(*ino)?;
            let mappings: Vec<(u32, BlockNr)> = inode.with_state(|state| {
                state
                    .map
                    .range(lo..hi)
                    .map(|(&l, &p)| (l, p))
                    .collect()
            });

            let mut freed = Vec::new();
            for (logical, physical) in mappings {
                let rel = logical - lo;
                let needed = view
                    .as_ref()
                    .is_some_and(|v| bitmap_get(v, rel))
                    && start_inode.mapping(logical).is_none()
                    && !kept.contains(&logical);
                if needed {
                    kept.insert(logical);
                } else {
                    handle.extend_or_restart(MAX_TRANS_DATA)?;
                    fs.free_volume_blocks(&handle, physical, 1, true)?;
                    freed.push(logical);
                }
            }
            if !freed.is_empty() {
                inode.with_state_mut(|state| {
                    for logical in &freed {
                        state.map.remove(logical);
                    }
                    state.blocks_charged =
                        state.blocks_charged.saturating_sub(freed.len() as u32);
                    fs.persist_inode(&handle, inode.ino, state)
                })?;
            }
        }
    }

    // Mark the whole run shrunk, including members that had nothing to
    // free.
    let mut marked = 0;
    for ino in &interval {
        let inode = fs.iget(*ino)?;
        let flags = inode.flags();
        if flags.contains(SnapFlags::DELETED)
            && !flags.intersects(SnapFlags::SHRUNK | SnapFlags::ACTIVE)
        {
            handle.extend_or_restart(8)?;
            inode.with_state_mut(|state| {
                state.flags.set(SnapFlags::SHRUNK);
                fs.persist_inode(&handle, inode.ino, state)
            })?;
            marked += 1;
        }
    }
    if marked != need_shrink {
        warn!(
            target: "sfs::ctl",
            marked,
            need_shrink,
            "shrink pass marked an unexpected number of snapshots"
        );
    }
    drop(handle);
    fs.journal().commit_transaction();
    Ok(())
}

// ── Merge ───────────────────────────────────────────────────────────────────

/// Move the remaining blocks of shrunk snapshots between `start` and
/// `end` into `start`, then remove them. Walks newest to oldest.
fn snapshot_merge(
    fs: &FsContext,
    start: Option<InodeNr>,
    end: InodeNr,
    need_merge: u32,
) -> Result<()> {
    let Some(start_ino) = start else {
        return Ok(());
    };
    let start_inode = fs.iget(start_ino)?;
    let interval = chain_interval(fs, start_ino, end);
    let mut remaining = need_merge;

    for ino in interval {
        if remaining == 0 {
            break;
        }
        let inode = fs.iget(ino)?;
        if !inode.flags().contains(SnapFlags::SHRUNK)
            || inode.flags().contains(SnapFlags::INUSE)
        {
            break;
        }

        let handle = fs.journal().start(MAX_TRANS_DATA);
        let mappings: Vec<(u32, BlockNr)> =
            inode.with_state(|state| state.map.iter().map(|(&l, &p)| (l, p)).collect());

        for (logical, physical) in mappings {
            handle.extend_or_restart(4)?;
            if logical < SNAPSHOT_RESERVED_BLOCKS || start_inode.mapping(logical).is_some() {
                // Private header copy, or start already has its own
                // preserved copy.
                fs.free_volume_blocks(&handle, physical, 1, true)?;
            } else {
                start_inode.with_state_mut(|state| {
                    state.map.insert(logical, physical);
                    state.blocks_charged += 1;
                });
            }
            inode.with_state_mut(|state| {
                state.map.remove(&logical);
                state.blocks_charged = state.blocks_charged.saturating_sub(1);
            });
        }

        start_inode.with_state_mut(|state| fs.persist_inode(&handle, start_ino, state))?;
        inode.with_state_mut(|state| fs.persist_inode(&handle, ino, state))?;
        drop(handle);

        debug!(
            target: "sfs::ctl",
            from = inode.generation().0,
            into = start_inode.generation().0,
            "snapshot merged"
        );
        snapshot_remove(fs, &inode)?;
        remaining -= 1;
    }
    fs.journal().commit_transaction();
    Ok(())
}

/// Chain members strictly between `start` (older) and `end` (newer),
/// ordered newest first like the chain itself.
fn chain_interval(fs: &FsContext, start: InodeNr, end: InodeNr) -> Vec<InodeNr> {
    let chain = fs.chain();
    let Some(end_idx) = chain.iter().position(|&i| i == end) else {
        return Vec::new();
    };
    let Some(start_idx) = chain.iter().position(|&i| i == start) else {
        return Vec::new();
    };
    if start_idx <= end_idx + 1 {
        return Vec::new();
    }
    chain[end_idx + 1..start_idx].to_vec()
}

// ── Remove ──────────────────────────────────────────────────────────────────

/// Free a snapshot's blocks and unlink it from the chain. Snapshots
/// still enabled, in use, or active are deferred to a later pass.
pub(crate) fn snapshot_remove(fs: &FsContext, inode: &Arc<Inode>) -> Result<()> {
    let flags = inode.flags();
    if flags.intersects(SnapFlags::ENABLED | SnapFlags::INUSE | SnapFlags::ACTIVE) {
        debug!(
            target: "sfs::ctl",
            ino = inode.ino.0,
            flags = flags.bits(),
            "deferred removal of busy snapshot"
        );
        return Ok(());
    }

    let handle = fs.journal().start(MAX_TRANS_DATA);
    fs.truncate_snapshot(&handle, inode)?;
    handle.extend_or_restart(MAX_TRANS_DATA)?;

    // Unlink from the on-disk chain: the newer neighbor (or the
    // superblock head pointer) skips over this inode.
    let next = inode.with_state(|state| state.next_snapshot);
    match fs.chain_newer(inode.ino) {
        None => {
            fs.with_sb(|sb| sb.last_snapshot_ino = next);
            fs.write_sb(Some(&handle))?;
        }
        Some(newer) => {
            let newer_inode = fs.iget(newer)?;
            newer_inode.with_state_mut(|state| {
                state.next_snapshot = next;
                fs.persist_inode(&handle, newer, state)
            })?;
        }
    }
    fs.chain_remove(inode.ino);

    // Off the list: dynamic status flags go away; SNAPFILE and DELETED
    // remain so the file is never recycled into a new snapshot.
    inode.with_state_mut(|state| {
        state.next_snapshot = InodeNr::NONE;
        state.flags.clear(SnapFlags::DYN_MASK);
        state.flags.set(SnapFlags::DELETED);
        fs.persist_inode(&handle, inode.ino, state)
    })?;

    drop(handle);
    fs.journal().commit_transaction();
    info!(target: "sfs::ctl", id = inode.generation().0, "snapshot removed");
    Ok(())
}

// ── Mount-time load / unmount destroy ───────────────────────────────────────

/// Load the on-disk snapshot chain at mount. Failure to load the active
/// snapshot forces a read-only result; failures past it abort the walk
/// but allow read-write mount.
pub(crate) fn snapshot_load(fs: &FsContext) -> Result<()> {
    if !fs.chain().is_empty() {
        return Err(SfsError::Invalid("snapshots already loaded".into()));
    }

    let sb = fs.superblock();
    if !sb.has_compat(FEATURE_COMPAT_BIG_JOURNAL) {
        warn!(
            target: "sfs::ctl",
            "big_journal feature not set; concurrent writer performance may suffer"
        );
    }

    let active_ino = sb.active_snapshot_ino;
    let mut next_ino = sb.last_snapshot_ino;
    let mut from_active = false;
    if next_ino.is_none() && !active_ino.is_none() {
        // List head lost; reattach it to the active snapshot.
        if !fs.is_read_only() {
            fs.with_sb(|s| s.last_snapshot_ino = active_ino);
            fs.write_sb(None)?;
        }
        next_ino = active_ino;
        from_active = true;
    }

    let mut has_snapshot_feature = sb.has_ro_compat(FEATURE_RO_COMPAT_HAS_SNAPSHOT);
    if !next_ino.is_none() && !has_snapshot_feature {
        warn!(
            target: "sfs::ctl",
            ino = next_ino.0,
            "snapshot list found without the has_snapshot feature, trying to load it"
        );
    }

    init_bitmap_cache(fs, !fs.is_read_only())?;

    let mut loaded = 0u32;
    let mut has_active = false;
    while !next_ino.is_none() {
        let inode = match fs.iget(next_ino) {
            Ok(inode) if inode.is_snapshot_file() => inode,
            _ => {
                if has_active || !has_snapshot_feature {
                    warn!(
                        target: "sfs::ctl",
                        ino = next_ino.0,
                        "failed to load snapshot, aborting chain walk"
                    );
                    break;
                }
                if loaded == 0 && !from_active && next_ino != active_ino {
                    // Retry the walk from the active snapshot.
                    if !fs.is_read_only() {
                        fs.with_sb(|s| s.last_snapshot_ino = active_ino);
                        fs.write_sb(None)?;
                    }
                    next_ino = active_ino;
                    from_active = true;
                    continue;
                }
                warn!(
                    target: "sfs::ctl",
                    ino = active_ino.0,
                    "failed to load active snapshot, forcing read-only"
                );
                if fs.is_read_only() {
                    break;
                }
                return Err(SfsError::Corruption {
                    block: 0,
                    detail: format!("active snapshot inode {} unreadable", active_ino.0),
                });
            }
        };

        if !has_snapshot_feature {
            fs.with_sb(|s| s.feature_ro_compat |= FEATURE_RO_COMPAT_HAS_SNAPSHOT);
            fs.write_sb(None)?;
            has_snapshot_feature = true;
            info!(target: "sfs::ctl", "restored missing has_snapshot feature");
        }

        inode.with_state_mut(|state| state.flags.set(SnapFlags::LIST));
        if inode.ino == active_ino {
            let updates = fs.journal().lock_updates();
            inode.with_state_mut(|state| state.flags.set(SnapFlags::ACTIVE));
            fs.set_active(
                &updates,
                Some(ActiveSnapshot {
                    ino: inode.ino,
                    id: inode.generation(),
                    blocks: (inode.with_state(|s| s.disksize) / 4096) as u32,
                }),
            );
            has_active = true;
        }

        // Walking newest to oldest, so append keeps newest-first order.
        fs.chain_push_oldest(inode.ino);
        loaded += 1;
        debug!(target: "sfs::ctl", id = inode.generation().0, "snapshot loaded");
        next_ino = inode.with_state(|state| state.next_snapshot);
    }

    if loaded > 0 {
        update(fs, false)?;
        info!(target: "sfs::ctl", count = loaded, "snapshot chain loaded");
    }
    Ok(())
}

/// Release the in-memory chain and active pointer at unmount.
pub(crate) fn snapshot_destroy(fs: &FsContext) {
    for ino in fs.chain() {
        if let Ok(inode) = fs.iget(ino) {
            inode.with_state_mut(|state| state.flags.clear(SnapFlags::ACTIVE));
        }
    }
    fs.chain_clear();
    fs.clear_active_unlocked();
}

/// Reset the per-group COW caches and rebuild the exclude-bitmap cache
/// from the exclude inode; on read-write mounts, allocate missing
/// exclude-bitmap blocks.
fn init_bitmap_cache(fs: &FsContext, create: bool) -> Result<()> {
    fs.reset_cow_caches();

    if !fs.superblock().has_compat(FEATURE_COMPAT_EXCLUDE_INODE) {
        warn!(
            target: "sfs::ctl",
            "exclude_inode feature not set; merge might not free all unused blocks"
        );
        return Ok(());
    }
    let Ok(exclude) = fs.iget(InodeNr(EXCLUDE_INO)) else {
        warn!(target: "sfs::ctl", "bad exclude inode; no exclude bitmap");
        return Ok(());
    };

    let handle = create.then(|| fs.journal().start(MAX_TRANS_DATA));
    for g in 0..fs.group_count() {
        let block = match exclude.mapping(g) {
            Some(block) => Some(block),
            None => match &handle {
                Some(handle) => {
                    handle.extend_or_restart(MAX_TRANS_DATA)?;
                    let alloc = fs.map_blocks(handle, &exclude, g, 1, MapIntent::Write)?;
                    if let Some(block) = alloc.first {
                        let zero = vec![0u8; fs.geometry().block_size as usize];
                        fs.device().write_block(block, &zero)?;
                        debug!(target: "sfs::ctl", group = g, block = block.0, "exclude bitmap allocated");
                    }
                    alloc.first
                }
                None => None,
            },
        };
        if let Some(block) = block {
            fs.set_exclude_bitmap_cache(GroupNr(g), block)?;
        }
    }

    // Second pass: with every group's bitmap in place, make sure the
    // exclude machinery's own blocks are themselves excluded.
    if let Some(handle) = &handle {
        let own: Vec<BlockNr> = exclude.with_state(|state| {
            state
                .map
                .values()
                .copied()
                .chain(state.map_chain.iter().copied())
                .collect()
        });
        for block in own {
            fs.exclude_blocks(handle, block, 1)?;
        }
        exclude.with_state_mut(|state| {
            let covered = u64::from(fs.group_count()) * 4096;
            if state.size < covered {
                state.size = covered;
                state.disksize = covered;
                return fs.persist_inode(handle, InodeNr(EXCLUDE_INO), state);
            }
            Ok(())
        })?;
        fs.journal().commit_transaction();
    }
    Ok(())
}

fn next_snapshot_id(current: SnapshotId) -> SnapshotId {
    // 0 is "no id"; skip it on wrap.
    match current.0.wrapping_add(1) {
        0 => SnapshotId(1),
        id => SnapshotId(id),
    }
}

/// Mode and flags for a fresh snapshot file created by the host inside
/// a snapshots directory.
#[must_use]
pub fn snapshot_file_template() -> (u16, SnapFlags) {
    (MODE_REGULAR, SnapFlags::new(SnapFlags::SNAPFILE))
}
