//! Mounted-volume context.
//!
//! `FsContext` owns everything the snapshot core needs from the host
//! filesystem: the superblock, per-group descriptors with their
//! in-memory COW-cache field, the inode cache, the snapshot chain and
//! the lock-free active-snapshot pointer.
//!
//! Locking, from the outside in: `snapshot_mutex` serializes lifecycle
//! operations; the journal's update barrier freezes the volume for take
//! and deactivation; each group's cache lock protects only the
//! compare-and-swap on the descriptor fields (very short critical
//! sections); each group's alloc lock covers one bitmap
//! read-modify-write.

use crate::inode::Inode;
use crate::snapshot;
use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, MutexGuard};
use sfs_alloc::FsGeometry;
use sfs_block::{BlockBuf, BlockDevice, ReadTracker};
use sfs_error::{Result, SfsError};
use sfs_journal::{Handle, Journal, UpdatesLock};
use serde::{Deserialize, Serialize};
use sfs_ondisk::{GROUP_DESC_SIZE, GroupDesc, STATE_ERRORS, Superblock};
use sfs_types::{
    BlockNr, FEATURE_RO_COMPAT_FIX_EXCLUDE, GroupNr, InodeNr, SnapshotId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

/// Mount-time options.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MountOptions {
    pub read_only: bool,
}

/// The current active snapshot, published through an RCU-style pointer
/// so the COW fast path never takes the snapshot mutex. Swapped only
/// under the journal update barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSnapshot {
    pub ino: InodeNr,
    pub id: SnapshotId,
    /// Volume size in blocks at take time; blocks past this are never
    /// in use by the snapshot.
    pub blocks: u32,
}

/// Per-group descriptor copy plus the in-memory COW-bitmap cache field.
#[derive(Debug, Clone, Copy)]
pub struct GroupCache {
    pub desc: GroupDesc,
    /// Three-state rendezvous: `0` = not materialized,
    /// `== desc.block_bitmap` = materialization in progress, anything
    /// else = snapshot-file block holding the committed COW bitmap.
    pub cow_bitmap_blk: BlockNr,
}

#[derive(Debug)]
pub struct GroupState {
    cache: Mutex<GroupCache>,
    alloc_lock: Mutex<()>,
}

/// Outcome of one attempt to read-or-claim a group's COW-bitmap cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowCacheState {
    /// Cache holds a committed COW bitmap block.
    Done(BlockNr),
    /// This caller claimed materialization and must publish or reset.
    Claimed,
    /// Another task is materializing; retry shortly.
    Busy,
}

pub struct FsContext {
    dev: Arc<dyn BlockDevice>,
    journal: Journal,
    geo: FsGeometry,
    sb: Mutex<Superblock>,
    groups: Vec<GroupState>,
    pub(crate) inodes: Mutex<HashMap<u32, Arc<Inode>>>,
    chain: Mutex<Vec<InodeNr>>,
    active: ArcSwapOption<ActiveSnapshot>,
    snapshot_mutex: Mutex<()>,
    /// Serializes whole-block rewrites of the GDT (descriptors of
    /// several groups share a block).
    gdt_lock: Mutex<()>,
    read_tracker: Arc<ReadTracker>,
    read_only: AtomicBool,
}

impl FsContext {
    /// Mount a volume: decode the superblock and group descriptors,
    /// then load the snapshot chain (`snapshot_load`).
    pub fn mount(dev: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Arc<Self>> {
        let sb_block = dev.read_block(BlockNr(0))?;
        let sb = Superblock::decode(sb_block.as_slice())
            .map_err(|e| SfsError::Format(e.to_string()))?;
        let geo = geometry_from_sb(&sb);

        let mut groups = Vec::with_capacity(geo.group_count as usize);
        let descs_per_block = geo.block_size as usize / GROUP_DESC_SIZE;
        for g in 0..geo.group_count {
            let gdt_block = BlockNr(1 + g / descs_per_block as u32);
            let offset = (g as usize % descs_per_block) * GROUP_DESC_SIZE;
            let block = dev.read_block(gdt_block)?;
            let desc = GroupDesc::decode(&block.as_slice()[offset..offset + GROUP_DESC_SIZE])
                .map_err(|e| SfsError::Format(e.to_string()))?;
            groups.push(GroupState {
                cache: Mutex::new(GroupCache {
                    desc,
                    cow_bitmap_blk: BlockNr(0),
                }),
                alloc_lock: Mutex::new(()),
            });
        }

        let fs = Arc::new(Self {
            dev,
            journal: Journal::default(),
            geo,
            sb: Mutex::new(sb),
            groups,
            inodes: Mutex::new(HashMap::new()),
            chain: Mutex::new(Vec::new()),
            active: ArcSwapOption::empty(),
            snapshot_mutex: Mutex::new(()),
            gdt_lock: Mutex::new(()),
            read_tracker: Arc::new(ReadTracker::new()),
            read_only: AtomicBool::new(options.read_only),
        });

        snapshot::ctl::snapshot_load(&fs)?;
        info!(
            target: "sfs::ctl",
            blocks = fs.geo.total_blocks,
            groups = fs.geo.group_count,
            read_only = options.read_only,
            "volume mounted"
        );
        Ok(fs)
    }

    /// Unmount: release the snapshot chain and the active snapshot.
    pub fn unmount(&self) {
        snapshot::ctl::snapshot_destroy(self);
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geo
    }

    #[must_use]
    pub fn read_tracker(&self) -> &Arc<ReadTracker> {
        &self.read_tracker
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.sb.lock().clone()
    }

    pub fn with_sb<R>(&self, f: impl FnOnce(&mut Superblock) -> R) -> R {
        f(&mut self.sb.lock())
    }

    /// Persist the superblock. With a handle, the write goes through the
    /// COW hook first so the active snapshot preserves the pre-image;
    /// without one (under the update barrier) it is written directly.
    pub fn write_sb(&self, handle: Option<&Handle<'_>>) -> Result<()> {
        if let Some(handle) = handle {
            snapshot::hooks::get_write_access(self, handle, BlockNr(0), None)?;
        }
        let mut block = vec![0u8; self.geo.block_size as usize];
        let sb = self.sb.lock();
        sb.encode_into(&mut block);
        self.dev.write_block(BlockNr(0), &block)
    }

    /// Record a filesystem error. Corruption marks the superblock and
    /// demotes the mount to read-only; an inconsistent exclude bitmap
    /// additionally sets the fix-exclude feature for fsck.
    pub fn mark_fs_error(&self, err: &SfsError) {
        if !err.is_corruption() {
            return;
        }
        {
            let mut sb = self.sb.lock();
            sb.state |= STATE_ERRORS;
            if matches!(err, SfsError::ExcludeInconsistent { .. }) {
                sb.feature_ro_compat |= FEATURE_RO_COMPAT_FIX_EXCLUDE;
            }
        }
        self.read_only.store(true, Ordering::Release);
        error!(target: "sfs::ctl", error = %err, "filesystem error, forcing read-only");
        if let Err(write_err) = self.write_sb(None) {
            error!(target: "sfs::ctl", error = %write_err, "failed to record error state");
        }
    }

    // ── Group state ─────────────────────────────────────────────────────

    #[must_use]
    pub fn group_count(&self) -> u32 {
        self.geo.group_count
    }

    fn group(&self, group: GroupNr) -> Result<&GroupState> {
        self.groups
            .get(group.0 as usize)
            .ok_or_else(|| SfsError::Corruption {
                block: 0,
                detail: format!("group {} out of range", group.0),
            })
    }

    pub fn group_desc(&self, group: GroupNr) -> Result<GroupDesc> {
        Ok(self.group(group)?.cache.lock().desc)
    }

    /// Serialize one bitmap read-modify-write within a group.
    pub(crate) fn group_alloc_lock(&self, group: GroupNr) -> Result<MutexGuard<'_, ()>> {
        Ok(self.group(group)?.alloc_lock.lock())
    }

    /// Read-or-claim the group's COW-bitmap cache field. One lock
    /// acquisition, compare-and-swap only.
    pub fn cow_cache_load_or_claim(&self, group: GroupNr) -> Result<CowCacheState> {
        let state = self.group(group)?;
        let mut cache = state.cache.lock();
        let bitmap_blk = cache.desc.block_bitmap;
        if cache.cow_bitmap_blk.0 == 0 {
            cache.cow_bitmap_blk = bitmap_blk;
            Ok(CowCacheState::Claimed)
        } else if cache.cow_bitmap_blk == bitmap_blk {
            Ok(CowCacheState::Busy)
        } else {
            Ok(CowCacheState::Done(cache.cow_bitmap_blk))
        }
    }

    /// Publish a materialized COW bitmap block, or reset the claim on
    /// failure so a later caller may retry.
    pub fn cow_cache_publish(&self, group: GroupNr, block: Option<BlockNr>) -> Result<()> {
        let state = self.group(group)?;
        let mut cache = state.cache.lock();
        cache.cow_bitmap_blk = block.unwrap_or(BlockNr(0));
        Ok(())
    }

    /// Reset every group's COW-bitmap cache (after take; caches
    /// re-materialize lazily against the new active snapshot).
    pub fn reset_cow_caches(&self) {
        for state in &self.groups {
            state.cache.lock().cow_bitmap_blk = BlockNr(0);
        }
    }

    /// Update a group descriptor and write it back to the GDT.
    pub fn update_group_desc(
        &self,
        handle: &Handle<'_>,
        group: GroupNr,
        f: impl FnOnce(&mut GroupDesc),
    ) -> Result<()> {
        let desc = {
            let state = self.group(group)?;
            let mut cache = state.cache.lock();
            f(&mut cache.desc);
            cache.desc
        };
        let descs_per_block = self.geo.block_size as usize / GROUP_DESC_SIZE;
        let gdt_block = BlockNr(1 + group.0 / descs_per_block as u32);
        let offset = (group.0 as usize % descs_per_block) * GROUP_DESC_SIZE;

        snapshot::hooks::get_write_access(self, handle, gdt_block, None)?;
        let _gdt = self.gdt_lock.lock();
        let mut block = self.dev.read_block(gdt_block)?.into_inner();
        desc.encode_into(&mut block[offset..offset + GROUP_DESC_SIZE]);
        self.dev.write_block(gdt_block, &block)
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Allocate `count` blocks near `goal`. The chosen group's bitmap
    /// pre-image is journaled (undo access) before any bit changes,
    /// which also materializes the group's COW bitmap on first touch.
    pub fn allocate(
        &self,
        handle: &Handle<'_>,
        goal: Option<BlockNr>,
        count: u32,
    ) -> Result<sfs_alloc::BlockAlloc> {
        let goal_group = goal.map_or(GroupNr(0), |b| self.geo.absolute_to_group_block(b).0);
        let order = std::iter::once(goal_group.0)
            .chain((0..self.geo.group_count).filter(|&g| g != goal_group.0));

        for g in order {
            let group = GroupNr(g);
            let (bitmap_blk, free) = {
                let cache = self.group(group)?.cache.lock();
                (cache.desc.block_bitmap, cache.desc.free_blocks_count)
            };
            if free < count {
                continue;
            }

            let current = self.dev.read_block(bitmap_blk)?;
            snapshot::hooks::get_undo_access(self, handle, bitmap_blk, current.as_slice())?;

            let state = self.group(group)?;
            let _alloc = state.alloc_lock.lock();
            if let Some(alloc) =
                sfs_alloc::alloc_in_group(self.dev.as_ref(), &self.geo, group, bitmap_blk, count, goal)?
            {
                drop(_alloc);
                self.adjust_free_blocks(handle, group, -(i64::from(alloc.count)))?;
                return Ok(alloc);
            }
        }
        Err(SfsError::NoSpace)
    }

    /// Free `count` physical blocks starting at `start`, optionally
    /// clearing their exclude-bitmap bits (snapshot-owned blocks).
    pub fn free_volume_blocks(
        &self,
        handle: &Handle<'_>,
        start: BlockNr,
        count: u32,
        clear_exclude: bool,
    ) -> Result<()> {
        let (group, rel) = self.geo.absolute_to_group_block(start);
        let bitmap_blk = self.group_desc(group)?.block_bitmap;

        let current = self.dev.read_block(bitmap_blk)?;
        snapshot::hooks::get_undo_access(self, handle, bitmap_blk, current.as_slice())?;

        {
            let state = self.group(group)?;
            let _alloc = state.alloc_lock.lock();
            sfs_alloc::free_in_group(self.dev.as_ref(), bitmap_blk, rel, count)?;
        }
        self.adjust_free_blocks(handle, group, i64::from(count))?;
        if clear_exclude {
            self.exclude_clear(handle, start, count)?;
        }
        Ok(())
    }

    fn adjust_free_blocks(&self, handle: &Handle<'_>, group: GroupNr, delta: i64) -> Result<()> {
        self.update_group_desc(handle, group, |desc| {
            desc.free_blocks_count = add_delta(desc.free_blocks_count, delta);
        })?;
        self.with_sb(|sb| sb.free_blocks_count = add_delta(sb.free_blocks_count, delta));
        self.write_sb(Some(handle))
    }

    #[must_use]
    pub fn free_blocks_total(&self) -> u32 {
        self.sb.lock().free_blocks_count
    }

    /// Blocks occupied by volume metadata (superblock, GDT, bitmaps,
    /// inode tables); used by the take-time reserve estimate.
    #[must_use]
    pub fn metadata_blocks(&self) -> u32 {
        let itb = inode_table_blocks(&self.geo);
        let sb_and_gdt = 1 + u32::from(self.superblock().gdt_blocks);
        sb_and_gdt + self.geo.group_count * (2 + itb)
    }

    // ── Exclude bitmap ──────────────────────────────────────────────────

    /// Update the in-memory exclude-bitmap pointer for a group. The
    /// field is cache-only: it is rebuilt from the exclude inode at
    /// every mount.
    pub fn set_exclude_bitmap_cache(&self, group: GroupNr, block: BlockNr) -> Result<()> {
        self.group(group)?.cache.lock().desc.exclude_bitmap = block;
        Ok(())
    }

    /// Count allocated inodes across all groups (reserve estimation).
    pub fn count_used_inodes(&self) -> Result<u32> {
        let geo = self.geometry();
        let mut used = 0;
        for g in 0..geo.group_count {
            let desc = self.group_desc(GroupNr(g))?;
            let bitmap = self.dev.read_block(desc.inode_bitmap)?;
            used += geo.inodes_per_group
                - sfs_alloc::bitmap_count_free(bitmap.as_slice(), geo.inodes_per_group);
        }
        Ok(used)
    }

    /// The group's persistent exclude-bitmap block, if allocated.
    pub fn exclude_bitmap_block(&self, group: GroupNr) -> Result<Option<BlockNr>> {
        let desc = self.group_desc(group)?;
        Ok((desc.exclude_bitmap.0 != 0).then_some(desc.exclude_bitmap))
    }

    /// Read a group's exclude bitmap, or `None` when the volume has no
    /// exclude inode coverage for the group.
    pub fn read_exclude_bitmap(&self, group: GroupNr) -> Result<Option<BlockBuf>> {
        match self.exclude_bitmap_block(group)? {
            Some(block) => Ok(Some(self.dev.read_block(block)?)),
            None => Ok(None),
        }
    }

    /// Idempotently set `count` exclude bits starting at physical block
    /// `start`; returns how many were newly set.
    pub fn exclude_blocks(&self, handle: &Handle<'_>, start: BlockNr, count: u32) -> Result<u32> {
        let (group, rel) = self.geo.absolute_to_group_block(start);
        let Some(exclude_blk) = self.exclude_bitmap_block(group)? else {
            return Ok(0);
        };
        snapshot::hooks::get_write_access(self, handle, exclude_blk, Some(InodeNr(sfs_types::EXCLUDE_INO)))?;

        let state = self.group(group)?;
        let _alloc = state.alloc_lock.lock();
        let mut bitmap = self.dev.read_block(exclude_blk)?.into_inner();
        let newly = sfs_alloc::bitmap_set_range(&mut bitmap, rel, count);
        if newly > 0 {
            self.dev.write_block(exclude_blk, &bitmap)?;
        }
        Ok(newly)
    }

    /// Clear `count` exclude bits starting at physical block `start`.
    pub fn exclude_clear(&self, handle: &Handle<'_>, start: BlockNr, count: u32) -> Result<()> {
        let (group, rel) = self.geo.absolute_to_group_block(start);
        let Some(exclude_blk) = self.exclude_bitmap_block(group)? else {
            return Ok(());
        };
        snapshot::hooks::get_write_access(self, handle, exclude_blk, Some(InodeNr(sfs_types::EXCLUDE_INO)))?;

        let state = self.group(group)?;
        let _alloc = state.alloc_lock.lock();
        let mut bitmap = self.dev.read_block(exclude_blk)?.into_inner();
        sfs_alloc::bitmap_clear_range(&mut bitmap, rel, count);
        self.dev.write_block(exclude_blk, &bitmap)
    }

    // ── Active snapshot & chain ─────────────────────────────────────────

    #[must_use]
    pub fn active(&self) -> Option<Arc<ActiveSnapshot>> {
        self.active.load_full()
    }

    /// Swap the active-snapshot pointer. Requires the journal update
    /// barrier: no transaction handle may be in flight.
    pub fn set_active(&self, _lock: &UpdatesLock<'_>, next: Option<ActiveSnapshot>) {
        self.active.store(next.map(Arc::new));
    }

    /// Drop the active pointer at unmount, where no journal activity is
    /// possible.
    pub(crate) fn clear_active_unlocked(&self) {
        self.active.store(None);
    }

    /// Serialize a lifecycle operation.
    #[must_use]
    pub fn lock_snapshots(&self) -> MutexGuard<'_, ()> {
        self.snapshot_mutex.lock()
    }

    /// Snapshot chain, newest first.
    #[must_use]
    pub fn chain(&self) -> Vec<InodeNr> {
        self.chain.lock().clone()
    }

    #[must_use]
    pub fn chain_head(&self) -> Option<InodeNr> {
        self.chain.lock().first().copied()
    }

    pub fn chain_insert_head(&self, ino: InodeNr) {
        self.chain.lock().insert(0, ino);
    }

    pub fn chain_push_oldest(&self, ino: InodeNr) {
        self.chain.lock().push(ino);
    }

    pub fn chain_remove(&self, ino: InodeNr) {
        self.chain.lock().retain(|&i| i != ino);
    }

    pub fn chain_clear(&self) {
        self.chain.lock().clear();
    }

    /// The next newer snapshot on the chain (toward the head), if any.
    #[must_use]
    pub fn chain_newer(&self, ino: InodeNr) -> Option<InodeNr> {
        let chain = self.chain.lock();
        let idx = chain.iter().position(|&i| i == ino)?;
        idx.checked_sub(1).map(|newer| chain[newer])
    }
}

fn add_delta(value: u32, delta: i64) -> u32 {
    u32::try_from((i64::from(value) + delta).max(0)).unwrap_or(u32::MAX)
}

#[must_use]
pub fn geometry_from_sb(sb: &Superblock) -> FsGeometry {
    let group_count = sb.blocks_count.div_ceil(sb.blocks_per_group);
    FsGeometry {
        blocks_per_group: sb.blocks_per_group,
        inodes_per_group: sb.inodes_per_group,
        block_size: 4096,
        total_blocks: sb.blocks_count,
        total_inodes: sb.inodes_count,
        group_count,
        inode_size: u32::from(sb.inode_size),
    }
}

/// Blocks per group occupied by the inode table.
#[must_use]
pub fn inode_table_blocks(geo: &FsGeometry) -> u32 {
    (geo.inodes_per_group * geo.inode_size).div_ceil(geo.block_size)
}
