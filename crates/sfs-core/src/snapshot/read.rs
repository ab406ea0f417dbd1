//! Snapshot-image read routing.
//!
//! A snapshot file's body is sparse: a missing block means "nothing was
//! preserved here", and the reader routes through to the next newer
//! snapshot on the chain, ending at the live block device when the walk
//! reaches the active snapshot. Block-bitmap reads that fall through to
//! the device are fixed up so the image presents its point-in-time
//! bitmap rather than the live one.

use crate::context::FsContext;
use crate::inode::Inode;
use crate::snapshot::bitmap;
use sfs_block::BlockBuf;
use sfs_error::{Result, SfsError};
use sfs_types::{SNAPSHOT_RESERVED_BLOCKS, snapshot_block};
use std::sync::Arc;
use tracing::trace;

/// Validate read access to a snapshot inode.
///
/// Snapshots that are not on the chain are stale and unreadable, with
/// one exception: the file currently being created sits at the chain
/// head before its list flag is set.
pub fn snapshot_read_access(fs: &FsContext, inode: &Arc<Inode>) -> Result<()> {
    let flags = inode.flags();
    if !flags.contains(sfs_types::SnapFlags::LIST) {
        if fs.chain_head() == Some(inode.ino) {
            // Normal access to the snapshot being taken.
            return Ok(());
        }
        return Err(SfsError::NotPermitted("snapshot is not on the snapshot list"));
    }
    Ok(())
}

/// Read one logical block of a snapshot file, routing through the chain
/// as needed.
pub fn read_snapshot_block(fs: &FsContext, inode: &Arc<Inode>, iblock: u32) -> Result<BlockBuf> {
    snapshot_read_access(fs, inode)?;

    if iblock < SNAPSHOT_RESERVED_BLOCKS {
        // Reserved header region: plain sparse-file read.
        return match inode.mapping(iblock) {
            Some(block) => fs.device().read_block(block),
            None => Ok(BlockBuf::zeroed(fs.geometry().block_size as usize)),
        };
    }

    let mut current = Arc::clone(inode);
    loop {
        if let Some(block) = current.mapping(iblock) {
            // A freshly mapped COW copy may still be mid-write.
            fs.journal().wait_pending_cow(block);
            trace!(
                target: "sfs::read",
                ino = current.ino.0,
                iblock,
                block = block.0,
                "snapshot read served from chain"
            );
            return fs.device().read_block(block);
        }

        let is_active = fs.active().map(|a| a.ino) == Some(current.ino)
            || current.flags().contains(sfs_types::SnapFlags::ACTIVE);
        if is_active {
            return read_through_device(fs, iblock);
        }

        // Route to the next newer snapshot.
        let Some(newer) = fs.chain_newer(current.ino) else {
            return Err(SfsError::Corruption {
                block: iblock,
                detail: format!(
                    "snapshot chain ends at inode {} with no active snapshot",
                    current.ino.0
                ),
            });
        };
        let next = fs.iget(newer)?;
        if !next.is_snapshot_file() {
            return Err(SfsError::Corruption {
                block: iblock,
                detail: format!("non-snapshot inode {} on the snapshot chain", newer.0),
            });
        }
        current = next;
    }
}

/// Read through to the live block device, taking a tracked-read lease
/// so a concurrent COW of the block drains us before publishing.
fn read_through_device(fs: &FsContext, iblock: u32) -> Result<BlockBuf> {
    let Some(block) = snapshot_block(iblock) else {
        return Err(SfsError::Invalid(format!(
            "logical block {iblock} has no physical counterpart"
        )));
    };
    if block.0 >= fs.geometry().total_blocks {
        return Err(SfsError::Invalid(format!(
            "read past end of volume (block {})",
            block.0
        )));
    }

    // Present the snapshot's point-in-time block bitmap, not the live
    // one.
    let (group, _) = fs.geometry().absolute_to_group_block(block);
    if fs.group_desc(group)?.block_bitmap == block {
        let mut out = vec![0u8; fs.geometry().block_size as usize];
        bitmap::read_block_bitmap_for_image(fs, group, &mut out)?;
        return Ok(BlockBuf::new(out));
    }

    let _lease = fs.read_tracker().track(block);
    trace!(target: "sfs::read", block = block.0, "snapshot read through to device");
    fs.device().read_block(block)
}
