#![forbid(unsafe_code)]
//! Bitmap primitives and block allocation for SnapFS.
//!
//! ## Design
//!
//! Layered the same way as the host allocator it models:
//!
//! 1. **Bitmap** — raw bit manipulation on block-bitmap byte slices.
//! 2. **GroupStats** — cached per-group free counts.
//! 3. **alloc/free** — goal-directed block allocation across groups,
//!    reading and writing bitmap blocks through a `BlockDevice`.
//!
//! The snapshot layer leans on two extra primitives the plain allocator
//! does not need: `bitmap_set_range` reports how many bits were *newly*
//! set (exclude-bitmap updates are idempotent), and `bitmap_and_not`
//! builds a COW bitmap from a block bitmap and an exclude mask.

use sfs_block::BlockDevice;
use sfs_error::{Result, SfsError};
use sfs_types::{BlockNr, GroupNr};
use tracing::trace;

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Set `count` bits starting at `start`, returning how many were newly set.
pub fn bitmap_set_range(bitmap: &mut [u8], start: u32, count: u32) -> u32 {
    let mut newly_set = 0;
    for idx in start..start.saturating_add(count) {
        if !bitmap_get(bitmap, idx) {
            bitmap_set(bitmap, idx);
            newly_set += 1;
        }
    }
    newly_set
}

/// Clear `count` bits starting at `start`.
pub fn bitmap_clear_range(bitmap: &mut [u8], start: u32, count: u32) {
    for idx in start..start.saturating_add(count) {
        bitmap_clear(bitmap, idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 0 {
                free += 1;
            }
        }
    }

    free
}

/// Find the first free (zero) bit in the first `count` bits of `bitmap`,
/// starting from `start` and wrapping around.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    for idx in start..count {
        if !bitmap_get(bitmap, idx) {
            return Some(idx);
        }
    }
    (0..start.min(count)).find(|&idx| !bitmap_get(bitmap, idx))
}

/// Find `n` contiguous free bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_find_contiguous(bitmap: &[u8], count: u32, n: u32) -> Option<u32> {
    if n == 0 {
        return Some(0);
    }
    let mut run_start = 0u32;
    let mut run_len = 0u32;

    for idx in 0..count {
        if bitmap_get(bitmap, idx) {
            run_start = idx + 1;
            run_len = 0;
        } else {
            run_len += 1;
            if run_len >= n {
                return Some(run_start);
            }
        }
    }
    None
}

/// Compute `dst = src & !mask` word by word.
///
/// Used to build a COW bitmap: blocks in use by the filesystem minus
/// blocks owned by snapshot files themselves.
pub fn bitmap_and_not(dst: &mut [u8], src: &[u8], mask: &[u8]) {
    for (i, out) in dst.iter_mut().enumerate() {
        let s = src.get(i).copied().unwrap_or(0);
        let m = mask.get(i).copied().unwrap_or(0);
        *out = s & !m;
    }
}

// ── Filesystem geometry ─────────────────────────────────────────────────────

/// Cached volume geometry needed by the allocator and the snapshot core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsGeometry {
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_inodes: u32,
    pub group_count: u32,
    pub inode_size: u32,
}

impl FsGeometry {
    /// Number of blocks in a specific group (last group may be shorter).
    #[must_use]
    pub fn blocks_in_group(&self, group: GroupNr) -> u32 {
        let group_start = group.0.saturating_mul(self.blocks_per_group);
        let remaining = self.total_blocks.saturating_sub(group_start);
        remaining.min(self.blocks_per_group)
    }

    /// Absolute block number for a relative block within a group.
    #[must_use]
    pub fn group_block_to_absolute(&self, group: GroupNr, rel_block: u32) -> BlockNr {
        BlockNr(group.0 * self.blocks_per_group + rel_block)
    }

    /// Convert absolute block to (group, relative block).
    #[must_use]
    pub fn absolute_to_group_block(&self, block: BlockNr) -> (GroupNr, u32) {
        (
            GroupNr(block.0 / self.blocks_per_group),
            block.0 % self.blocks_per_group,
        )
    }

    /// Inode table slot for `ino`: (group, block offset inside the
    /// table, record offset inside the block).
    #[must_use]
    pub fn inode_slot(&self, ino: u32) -> (GroupNr, u32, usize) {
        let index = ino - 1;
        let group = GroupNr(index / self.inodes_per_group);
        let slot = index % self.inodes_per_group;
        let per_block = self.block_size / self.inode_size;
        let table_block = slot / per_block;
        let record = (slot % per_block) * self.inode_size;
        (group, table_block, record as usize)
    }
}

// ── Block allocator ─────────────────────────────────────────────────────────

/// Result of a block allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAlloc {
    /// First allocated block.
    pub start: BlockNr,
    /// Number of contiguous blocks allocated.
    pub count: u32,
}

/// Allocate up to `count` contiguous blocks inside one group.
///
/// The caller owns group selection and must have journaled the bitmap
/// block's pre-image before calling (undo access), since this function
/// modifies the bitmap in place. Returns `None` when the group has no
/// fitting run. Falls back from a contiguous run to a single block only
/// when the caller asked for one block.
pub fn alloc_in_group(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    group: GroupNr,
    bitmap_block: BlockNr,
    count: u32,
    goal: Option<BlockNr>,
) -> Result<Option<BlockAlloc>> {
    if count == 0 {
        return Err(SfsError::Format("cannot allocate 0 blocks".into()));
    }

    let blocks_in_group = geo.blocks_in_group(group);
    let mut bitmap = dev.read_block(bitmap_block)?.into_inner();

    let start = goal.map_or(0, |g| {
        let (gg, off) = geo.absolute_to_group_block(g);
        if gg == group {
            off
        } else {
            0
        }
    });

    let found = if count == 1 {
        bitmap_find_free(&bitmap, blocks_in_group, start).map(|idx| (idx, 1))
    } else {
        bitmap_find_contiguous(&bitmap, blocks_in_group, count).map(|idx| (idx, count))
    };

    let Some((rel_start, alloc_count)) = found else {
        return Ok(None);
    };

    for i in rel_start..rel_start + alloc_count {
        bitmap_set(&mut bitmap, i);
    }
    dev.write_block(bitmap_block, &bitmap)?;

    let abs_start = geo.group_block_to_absolute(group, rel_start);
    trace!(
        target: "sfs::alloc",
        group = group.0,
        start = abs_start.0,
        count = alloc_count,
        "blocks allocated"
    );
    Ok(Some(BlockAlloc {
        start: abs_start,
        count: alloc_count,
    }))
}

/// Free `count` blocks starting at group-relative bit `rel_start`.
///
/// Same journaling contract as [`alloc_in_group`]: the caller saves the
/// bitmap pre-image first.
pub fn free_in_group(
    dev: &dyn BlockDevice,
    bitmap_block: BlockNr,
    rel_start: u32,
    count: u32,
) -> Result<()> {
    let mut bitmap = dev.read_block(bitmap_block)?.into_inner();
    bitmap_clear_range(&mut bitmap, rel_start, count);
    dev.write_block(bitmap_block, &bitmap)?;
    trace!(
        target: "sfs::alloc",
        rel_start = rel_start,
        count = count,
        "blocks freed"
    );
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_block::MemBlockDevice;

    fn make_geometry() -> FsGeometry {
        FsGeometry {
            blocks_per_group: 8192,
            inodes_per_group: 2048,
            block_size: 4096,
            total_blocks: 32768,
            total_inodes: 8192,
            group_count: 4,
            inode_size: 256,
        }
    }

    #[test]
    fn bitmap_get_set_clear() {
        let mut bm = vec![0u8; 4];
        assert!(!bitmap_get(&bm, 0));
        bitmap_set(&mut bm, 0);
        assert!(bitmap_get(&bm, 0));
        bitmap_clear(&mut bm, 0);
        assert!(!bitmap_get(&bm, 0));

        bitmap_set(&mut bm, 7);
        assert_eq!(bm[0], 0x80);
        bitmap_set(&mut bm, 8);
        assert_eq!(bm[1], 0x01);
    }

    #[test]
    fn set_range_reports_newly_set() {
        let mut bm = vec![0u8; 2];
        bitmap_set(&mut bm, 3);
        // Bits 2..6: bit 3 already set, so 3 newly set.
        assert_eq!(bitmap_set_range(&mut bm, 2, 4), 3);
        // Second call is a no-op.
        assert_eq!(bitmap_set_range(&mut bm, 2, 4), 0);
    }

    #[test]
    fn and_not_masks_exclude_bits() {
        let src = vec![0b1111_0110u8, 0xFF];
        let mask = vec![0b0000_0110u8, 0x0F];
        let mut dst = vec![0u8; 2];
        bitmap_and_not(&mut dst, &src, &mask);
        assert_eq!(dst, vec![0b1111_0000, 0xF0]);
    }

    #[test]
    fn count_free_counts_zero_bits() {
        let mut bm = vec![0u8; 2];
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 5);
        bitmap_set(&mut bm, 15);
        assert_eq!(bitmap_count_free(&bm, 16), 13);
    }

    #[test]
    fn find_free_wraps_around() {
        let mut bm = vec![0xFFu8; 2];
        bitmap_clear(&mut bm, 3);
        assert_eq!(bitmap_find_free(&bm, 16, 5), Some(3));
    }

    #[test]
    fn find_contiguous_run() {
        let mut bm = vec![0u8; 4];
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 1);
        assert_eq!(bitmap_find_contiguous(&bm, 32, 4), Some(2));
    }

    #[test]
    fn find_contiguous_none_when_fragmented() {
        let mut bm = vec![0u8; 2];
        for i in (0..16).step_by(2) {
            bitmap_set(&mut bm, i);
        }
        assert_eq!(bitmap_find_contiguous(&bm, 16, 2), None);
    }

    #[test]
    fn geometry_conversions() {
        let geo = make_geometry();
        let abs = geo.group_block_to_absolute(GroupNr(1), 42);
        assert_eq!(abs, BlockNr(8192 + 42));
        let (g, off) = geo.absolute_to_group_block(abs);
        assert_eq!(g, GroupNr(1));
        assert_eq!(off, 42);
    }

    #[test]
    fn geometry_short_last_group() {
        let mut geo = make_geometry();
        geo.total_blocks = 30000;
        assert_eq!(geo.blocks_in_group(GroupNr(0)), 8192);
        assert_eq!(geo.blocks_in_group(GroupNr(3)), 30000 - 3 * 8192);
    }

    #[test]
    fn geometry_inode_slot() {
        let geo = make_geometry();
        // 16 inodes per 4096-byte block at 256 bytes each.
        let (group, table_block, record) = geo.inode_slot(1);
        assert_eq!((group, table_block, record), (GroupNr(0), 0, 0));
        let (group, table_block, record) = geo.inode_slot(17);
        assert_eq!((group, table_block, record), (GroupNr(0), 1, 0));
        let (group, _, _) = geo.inode_slot(2049);
        assert_eq!(group, GroupNr(1));
    }

    #[test]
    fn alloc_single_block_skips_used_bits() {
        let dev = MemBlockDevice::new(40000);
        let geo = make_geometry();
        let bitmap_block = BlockNr(1);

        // Pre-mark the first 4 bits in use.
        let mut bitmap = vec![0u8; 4096];
        bitmap_set_range(&mut bitmap, 0, 4);
        dev.write_block(bitmap_block, &bitmap).unwrap();

        let alloc = alloc_in_group(&dev, &geo, GroupNr(0), bitmap_block, 1, None)
            .unwrap()
            .unwrap();
        assert_eq!(alloc, BlockAlloc {
            start: BlockNr(4),
            count: 1
        });
        // The bit is now set on disk.
        let after = dev.read_block(bitmap_block).unwrap();
        assert!(bitmap_get(after.as_slice(), 4));
    }

    #[test]
    fn alloc_contiguous_honors_goal_hint() {
        let dev = MemBlockDevice::new(40000);
        let geo = make_geometry();
        let bitmap_block = BlockNr(101);
        let goal = geo.group_block_to_absolute(GroupNr(1), 100);

        let alloc = alloc_in_group(&dev, &geo, GroupNr(1), bitmap_block, 1, Some(goal))
            .unwrap()
            .unwrap();
        assert_eq!(alloc.start, goal);
    }

    #[test]
    fn alloc_and_free_round_trip() {
        let dev = MemBlockDevice::new(40000);
        let geo = make_geometry();
        let bitmap_block = BlockNr(1);

        let alloc = alloc_in_group(&dev, &geo, GroupNr(0), bitmap_block, 3, None)
            .unwrap()
            .unwrap();
        assert_eq!(alloc.count, 3);

        let (_, rel) = geo.absolute_to_group_block(alloc.start);
        free_in_group(&dev, bitmap_block, rel, alloc.count).unwrap();
        let bitmap = dev.read_block(bitmap_block).unwrap();
        assert_eq!(bitmap_count_free(bitmap.as_slice(), 8192), 8192);
    }

    #[test]
    fn alloc_reports_full_group() {
        let dev = MemBlockDevice::new(40000);
        let geo = make_geometry();
        let bitmap_block = BlockNr(1);

        let full = vec![0xFFu8; 4096];
        dev.write_block(bitmap_block, &full).unwrap();
        assert!(
            alloc_in_group(&dev, &geo, GroupNr(0), bitmap_block, 1, None)
                .unwrap()
                .is_none()
        );
    }
}
