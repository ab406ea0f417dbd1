//! Journal access hooks.
//!
//! Every mutating path of the host filesystem funnels through these
//! hooks before touching a block, which is what makes the preservation
//! guarantee airtight: a block in use by the active snapshot cannot be
//! overwritten or freed before its contents are preserved.
//!
//! The second half of the file hosts the host-side write/free entry
//! points built on the hooks; they stand in for the host filesystem's
//! buffer and data paths.

use crate::context::FsContext;
use crate::inode::Inode;
use crate::snapshot::cow;
use sfs_error::{Result, SfsError};
use sfs_journal::Handle;
use sfs_types::{BlockNr, InodeNr};
use std::sync::Arc;
use tracing::warn;

/// Hook before any metadata mutation: COW the block if the active
/// snapshot still needs its current contents.
pub fn get_write_access(
    fs: &FsContext,
    handle: &Handle<'_>,
    block: BlockNr,
    inode: Option<InodeNr>,
) -> Result<()> {
    let owner = match inode {
        Some(ino) => Some(fs.iget(ino)?),
        None => None,
    };
    cow::test_and_cow(fs, handle, owner.as_ref(), block, None, true)
}

/// Hook before an undo-managed mutation (the block bitmap is the prime
/// caller). Saves the committed pre-image and probes the COW decision;
/// an actual COW need here is a hard error, because the bitmap
/// materialization path preserves bitmap blocks itself.
pub fn get_undo_access(
    fs: &FsContext,
    handle: &Handle<'_>,
    block: BlockNr,
    current: &[u8],
) -> Result<()> {
    fs.journal().save_committed(block, current);
    match cow::test_and_cow(fs, handle, None, block, Some(current), false) {
        Ok(()) => Ok(()),
        Err(SfsError::NeedsCow) => Err(SfsError::Corruption {
            block: block.0,
            detail: "undo-managed block required COW".into(),
        }),
        Err(err) => Err(err),
    }
}

/// Hook on block creation. A needed COW suggests blocks were freed
/// without COW (offline fsck, for instance); log and carry on.
pub fn get_create_access(fs: &FsContext, handle: &Handle<'_>, block: BlockNr) -> Result<()> {
    match cow::test_and_cow(fs, handle, None, block, None, false) {
        Err(SfsError::NeedsCow) => {
            warn!(
                target: "sfs::cow",
                block = block.0,
                "newly created block was in use by the snapshot"
            );
            Ok(())
        }
        other => other,
    }
}

/// Hook before a data-block overwrite: move the block to the snapshot
/// if it is still needed. Returns the number of blocks moved (0 or 1).
pub fn get_move_access(
    fs: &FsContext,
    handle: &Handle<'_>,
    inode: &Arc<Inode>,
    block: BlockNr,
    may_move: bool,
) -> Result<u32> {
    cow::test_and_move(fs, handle, Some(inode), block, 1, may_move)
}

/// Hook before freeing a range of data blocks. Returns how many of the
/// leading blocks were moved to the snapshot instead of freed.
pub fn get_delete_access(
    fs: &FsContext,
    handle: &Handle<'_>,
    inode: &Arc<Inode>,
    block: BlockNr,
    count: u32,
) -> Result<u32> {
    cow::test_and_move(fs, handle, Some(inode), block, count, true)
}

// ── Host-side entry points ──────────────────────────────────────────────────

impl FsContext {
    /// Host metadata write: COW hook, then the write itself.
    pub fn metadata_write(&self, handle: &Handle<'_>, block: BlockNr, data: &[u8]) -> Result<()> {
        if self.is_read_only() {
            return Err(SfsError::ReadOnly);
        }
        get_write_access(self, handle, block, None)?;
        self.device().write_block(block, data)
    }

    /// Host write to a regular file's logical block.
    ///
    /// If the current physical block is in use by the active snapshot
    /// it is re-parented there (move-on-write) and the file gets a
    /// fresh block.
    pub fn file_write_block(
        &self,
        handle: &Handle<'_>,
        ino: InodeNr,
        logical: u32,
        data: &[u8],
    ) -> Result<()> {
        if self.is_read_only() {
            return Err(SfsError::ReadOnly);
        }
        let inode = self.iget(ino)?;
        if inode.is_snapshot_file() {
            return Err(SfsError::NotPermitted("snapshot files are read-only"));
        }

        match inode.mapping(logical) {
            Some(physical) => {
                let moved = get_move_access(self, handle, &inode, physical, true)?;
                if moved > 0 {
                    // The old block now belongs to the snapshot.
                    let alloc = self.allocate(handle, Some(physical), 1)?;
                    let mut state = inode.state_mut();
                    state.map.insert(logical, alloc.start);
                    state.blocks_charged += 1;
                    self.persist_inode(handle, ino, &mut state)?;
                    drop(state);
                    self.device().write_block(alloc.start, data)
                } else {
                    self.device().write_block(physical, data)
                }
            }
            None => {
                let alloc = self.allocate(handle, None, 1)?;
                let mut state = inode.state_mut();
                state.map.insert(logical, alloc.start);
                state.blocks_charged += 1;
                self.persist_inode(handle, ino, &mut state)?;
                drop(state);
                self.device().write_block(alloc.start, data)
            }
        }
    }

    /// Host read of a regular file's logical block.
    pub fn file_read_block(&self, ino: InodeNr, logical: u32) -> Result<sfs_block::BlockBuf> {
        let inode = self.iget(ino)?;
        match inode.mapping(logical) {
            Some(physical) => self.device().read_block(physical),
            None => Ok(sfs_block::BlockBuf::zeroed(
                self.geometry().block_size as usize,
            )),
        }
    }

    /// Host free of a range of a regular file's logical blocks. Blocks
    /// still needed by the active snapshot are moved instead of freed.
    pub fn file_free_blocks(
        &self,
        handle: &Handle<'_>,
        ino: InodeNr,
        logical: u32,
        count: u32,
    ) -> Result<()> {
        if self.is_read_only() {
            return Err(SfsError::ReadOnly);
        }
        let inode = self.iget(ino)?;
        if inode.is_snapshot_file() {
            return Err(SfsError::NotPermitted("snapshot files are read-only"));
        }

        for l in logical..logical + count {
            let Some(physical) = inode.mapping(l) else {
                continue;
            };
            let moved = get_delete_access(self, handle, &inode, physical, 1)?;
            let mut state = inode.state_mut();
            state.map.remove(&l);
            if moved == 0 {
                state.blocks_charged = state.blocks_charged.saturating_sub(1);
                drop(state);
                self.free_volume_blocks(handle, physical, 1, false)?;
            }
            // Moved blocks were already discharged by the move path.
        }

        let mut state = inode.state_mut();
        self.persist_inode(handle, ino, &mut state)
    }
}
