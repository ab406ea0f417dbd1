//! Inode cache and the snapshot-file block mapper.
//!
//! A snapshot file's sparse logical layout mirrors the live volume's
//! physical layout: logical block `p + SNAPSHOT_RESERVED_BLOCKS` holds
//! the preserved contents of physical block `p`. The mapper resolves
//! and extends that layout; its intents mirror the access modes the
//! snapshot engine needs (plain read, pre-allocation, COW allocation,
//! COW-bitmap allocation, and block moves that re-parent a physical
//! block into the snapshot without copying).

use crate::context::FsContext;
use parking_lot::{RwLock, RwLockWriteGuard};
use sfs_error::{Result, SfsError};
use sfs_journal::Handle;
use sfs_ondisk::{DiskInode, INODE_RECORD_SIZE, MAP_ENTRIES_PER_BLOCK, MapBlock, MODE_FREE};
use sfs_types::{BlockNr, InodeNr, SnapFlags, SnapshotId, snapshot_block};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, trace};

/// In-memory inode.
#[derive(Debug)]
pub struct Inode {
    pub ino: InodeNr,
    state: RwLock<InodeState>,
    open_count: AtomicU32,
}

/// Mutable inode state, guarded by the inode's lock.
#[derive(Debug, Clone, Default)]
pub struct InodeState {
    pub mode: u16,
    pub links: u16,
    pub flags: SnapFlags,
    pub generation: SnapshotId,
    pub size: u64,
    pub disksize: u64,
    pub next_snapshot: InodeNr,
    pub blocks_charged: u32,
    /// Sparse logical -> physical block map.
    pub map: BTreeMap<u32, BlockNr>,
    /// Blocks persisting `map` on disk, in chain order.
    pub map_chain: Vec<BlockNr>,
}

impl Inode {
    #[must_use]
    pub fn flags(&self) -> SnapFlags {
        self.state.read().flags
    }

    #[must_use]
    pub fn generation(&self) -> SnapshotId {
        self.state.read().generation
    }

    #[must_use]
    pub fn is_snapshot_file(&self) -> bool {
        self.flags().contains(SnapFlags::SNAPFILE)
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&InodeState) -> R) -> R {
        f(&self.state.read())
    }

    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut InodeState) -> R) -> R {
        f(&mut self.state.write())
    }

    pub(crate) fn state_mut(&self) -> RwLockWriteGuard<'_, InodeState> {
        self.state.write()
    }

    /// Mapping for one logical block.
    #[must_use]
    pub fn mapping(&self, iblock: u32) -> Option<BlockNr> {
        self.state.read().map.get(&iblock).copied()
    }

    /// Mapped blocks plus map-chain overhead; the "clean" probe used by
    /// remove and the exclude-bitmap consistency check.
    #[must_use]
    pub fn block_count(&self) -> u32 {
        let state = self.state.read();
        (state.map.len() + state.map_chain.len()) as u32
    }

    pub fn open(&self) {
        self.open_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release(&self) {
        self.open_count.fetch_sub(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }
}

/// Access mode for [`FsContext::map_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapIntent {
    /// Report existing mappings only.
    Read,
    /// Allocate missing blocks (snapshot pre-allocation).
    Write,
    /// Allocate one block for a COW copy.
    Cow,
    /// Allocate one block for a COW bitmap.
    Bitmap,
    /// Re-parent the shadowed physical blocks into this snapshot.
    Move,
}

impl MapIntent {
    #[must_use]
    fn allocates(self) -> bool {
        matches!(self, Self::Write | Self::Cow | Self::Bitmap)
    }
}

/// Result of a mapping operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapResult {
    /// Number of consecutive logical blocks mapped (or moved).
    pub count: u32,
    /// Physical block backing the first requested logical block.
    pub first: Option<BlockNr>,
    /// Whether this call created the mapping (allocation winner).
    pub new_allocation: bool,
}

impl MapResult {
    const HOLE: Self = Self {
        count: 0,
        first: None,
        new_allocation: false,
    };
}

impl FsContext {
    /// Load an inode through the cache.
    pub fn iget(&self, ino: InodeNr) -> Result<Arc<Inode>> {
        if let Some(inode) = self.inodes.lock().get(&ino.0) {
            return Ok(Arc::clone(inode));
        }

        let (table_block, record_off) = self.inode_record_location(ino)?;
        let block = self.device().read_block(table_block)?;
        let record =
            DiskInode::decode(&block.as_slice()[record_off..record_off + INODE_RECORD_SIZE])
                .map_err(|e| SfsError::Format(e.to_string()))?;
        if record.mode == MODE_FREE {
            return Err(SfsError::Invalid(format!("inode {} is not allocated", ino.0)));
        }

        let (map, map_chain) = self.load_map(record.map_root, record.map_len)?;
        let inode = Arc::new(Inode {
            ino,
            state: RwLock::new(InodeState {
                mode: record.mode,
                links: record.links,
                flags: SnapFlags::new(record.flags),
                generation: SnapshotId(record.generation),
                size: record.size,
                disksize: record.disksize,
                next_snapshot: record.next_snapshot,
                blocks_charged: record.blocks_charged,
                map,
                map_chain,
            }),
            open_count: AtomicU32::new(0),
        });

        let mut cache = self.inodes.lock();
        let entry = cache.entry(ino.0).or_insert_with(|| Arc::clone(&inode));
        Ok(Arc::clone(entry))
    }

    /// Inode-table block and in-block byte offset of an inode record.
    pub fn inode_record_location(&self, ino: InodeNr) -> Result<(BlockNr, usize)> {
        if ino.is_none() || ino.0 > self.geometry().total_inodes {
            return Err(SfsError::Invalid(format!("inode number {} out of range", ino.0)));
        }
        let (group, table_block, record_off) = self.geometry().inode_slot(ino.0);
        let desc = self.group_desc(group)?;
        Ok((BlockNr(desc.inode_table.0 + table_block), record_off))
    }

    fn load_map(
        &self,
        map_root: BlockNr,
        map_len: u32,
    ) -> Result<(BTreeMap<u32, BlockNr>, Vec<BlockNr>)> {
        let mut map = BTreeMap::new();
        let mut chain = Vec::new();
        let mut next = map_root;
        // A full chain holds map_len entries; tolerate a little slack
        // before declaring the chain cyclic.
        let max_blocks = (map_len as usize).div_ceil(MAP_ENTRIES_PER_BLOCK) + 8;

        while next.0 != 0 {
            if chain.len() > max_blocks {
                return Err(SfsError::Corruption {
                    block: next.0,
                    detail: "snapshot map chain does not terminate".into(),
                });
            }
            chain.push(next);
            let block = self.device().read_block(next)?;
            let parsed =
                MapBlock::decode(block.as_slice()).map_err(|e| SfsError::Format(e.to_string()))?;
            for (logical, physical) in parsed.entries {
                map.insert(logical, physical);
            }
            next = parsed.next;
        }
        Ok((map, chain))
    }

    /// Allocate a fresh inode and insert it into the cache.
    pub fn new_inode(&self, handle: &Handle<'_>, mode: u16, flags: SnapFlags) -> Result<Arc<Inode>> {
        let geo = self.geometry();
        for g in 0..geo.group_count {
            let group = sfs_types::GroupNr(g);
            let desc = self.group_desc(group)?;
            let bitmap_blk = desc.inode_bitmap;

            crate::snapshot::hooks::get_write_access(self, handle, bitmap_blk, None)?;
            let bit = {
                let _alloc = self.group_alloc_lock(group)?;
                let mut bitmap = self.device().read_block(bitmap_blk)?.into_inner();
                let Some(bit) = sfs_alloc::bitmap_find_free(&bitmap, geo.inodes_per_group, 0)
                else {
                    continue;
                };
                sfs_alloc::bitmap_set(&mut bitmap, bit);
                self.device().write_block(bitmap_blk, &bitmap)?;
                bit
            };

            let ino = InodeNr(g * geo.inodes_per_group + bit + 1);
            let inode = Arc::new(Inode {
                ino,
                state: RwLock::new(InodeState {
                    mode,
                    links: 1,
                    flags,
                    ..InodeState::default()
                }),
                open_count: AtomicU32::new(0),
            });
            inode.with_state_mut(|state| self.persist_inode(handle, ino, state))?;
            self.inodes.lock().insert(ino.0, Arc::clone(&inode));
            debug!(target: "sfs::ctl", ino = ino.0, mode, "inode allocated");
            return Ok(inode);
        }
        Err(SfsError::NoSpace)
    }

    /// Write an inode record (and its map chain) back to disk.
    ///
    /// The caller holds the inode's state lock and passes the guarded
    /// state in; the inode-table block goes through the COW hook like
    /// any other global metadata write.
    pub fn persist_inode(
        &self,
        handle: &Handle<'_>,
        ino: InodeNr,
        state: &mut InodeState,
    ) -> Result<()> {
        self.persist_map(handle, state)?;

        let (table_block, record_off) = self.inode_record_location(ino)?;
        crate::snapshot::hooks::get_write_access(self, handle, table_block, None)?;

        let record = DiskInode {
            mode: state.mode,
            links: state.links,
            flags: state.flags.persistent(),
            generation: state.generation.0,
            size: state.size,
            disksize: state.disksize,
            next_snapshot: state.next_snapshot,
            blocks_charged: state.blocks_charged,
            map_root: state.map_chain.first().copied().unwrap_or(BlockNr(0)),
            map_len: state.map.len() as u32,
        };
        let mut block = self.device().read_block(table_block)?.into_inner();
        record.encode_into(&mut block[record_off..record_off + INODE_RECORD_SIZE]);
        self.device().write_block(table_block, &block)
    }

    /// Rewrite the on-disk map chain from the in-memory map, growing or
    /// shrinking the chain as needed. Chain blocks are snapshot-owned
    /// metadata and therefore excluded.
    fn persist_map(&self, handle: &Handle<'_>, state: &mut InodeState) -> Result<()> {
        let needed = state.map.len().div_ceil(MAP_ENTRIES_PER_BLOCK);

        while state.map_chain.len() < needed {
            let goal = state.map_chain.first().copied();
            let alloc = self.allocate(handle, goal, 1)?;
            self.exclude_blocks(handle, alloc.start, 1)?;
            state.map_chain.push(alloc.start);
        }
        while state.map_chain.len() > needed {
            let block = state.map_chain.pop().unwrap_or(BlockNr(0));
            self.free_volume_blocks(handle, block, 1, true)?;
        }

        let entries: Vec<(u32, BlockNr)> = state.map.iter().map(|(&l, &p)| (l, p)).collect();
        let mut buf = vec![0u8; self.geometry().block_size as usize];
        for (i, chunk) in entries.chunks(MAP_ENTRIES_PER_BLOCK).enumerate() {
            let mb = MapBlock {
                entries: chunk.to_vec(),
                next: state.map_chain.get(i + 1).copied().unwrap_or(BlockNr(0)),
            };
            mb.encode_into(&mut buf);
            self.device().write_block(state.map_chain[i], &buf)?;
        }
        Ok(())
    }

    /// Map (or allocate, or move) blocks of a snapshot file.
    ///
    /// Returns the number of consecutive logical blocks resolved from
    /// `iblock`. Concurrent allocators of the same logical block are
    /// serialized here: exactly one caller sees `new_allocation`,
    /// everyone else gets the winner's mapping.
    pub fn map_blocks(
        &self,
        handle: &Handle<'_>,
        inode: &Arc<Inode>,
        iblock: u32,
        maxblocks: u32,
        intent: MapIntent,
    ) -> Result<MapResult> {
        trace!(
            target: "sfs::ctl",
            ino = inode.ino.0,
            iblock,
            maxblocks,
            ?intent,
            "map_blocks"
        );
        if maxblocks == 0 {
            return Ok(MapResult::HOLE);
        }

        // Existing-run check, shared by every intent.
        let existing = inode.with_state(|state| mapped_run(state, iblock, maxblocks));
        if intent == MapIntent::Read || existing.count > 0 {
            return Ok(existing);
        }

        if intent.allocates() {
            // Allocate outside the inode lock; losers free and fall
            // through to the winner's mapping.
            let goal = snapshot_block(iblock);
            let mut allocated = Vec::with_capacity(maxblocks as usize);
            for _ in 0..maxblocks {
                match self.allocate(handle, goal, 1) {
                    Ok(alloc) => allocated.push(alloc.start),
                    Err(SfsError::NoSpace) if !allocated.is_empty() => break,
                    Err(err) => {
                        for &block in &allocated {
                            self.free_volume_blocks(handle, block, 1, false)?;
                        }
                        return Err(err);
                    }
                }
            }
            for &block in &allocated {
                self.exclude_blocks(handle, block, 1)?;
            }

            // A COW copy's mapping must not become visible before its
            // pending marker: a rendezvousing COWer or an image reader
            // would otherwise see the half-written copy. The caller
            // clears the marker once the contents land.
            let pending = matches!(intent, MapIntent::Cow | MapIntent::Bitmap);
            if pending {
                for &block in &allocated {
                    self.journal().begin_pending_cow(block);
                }
            }
            let end_pending = |blocks: &[BlockNr]| {
                if pending {
                    for &block in blocks {
                        self.journal().end_pending_cow(block);
                    }
                }
            };

            let mut state = inode.state_mut();
            if state.map.contains_key(&iblock) {
                // Another mapper won the race.
                drop(state);
                end_pending(&allocated);
                for &block in &allocated {
                    self.free_volume_blocks(handle, block, 1, true)?;
                }
                return Ok(inode.with_state(|state| mapped_run(state, iblock, maxblocks)));
            }
            for (i, &block) in allocated.iter().enumerate() {
                state.map.insert(iblock + i as u32, block);
            }
            state.blocks_charged += allocated.len() as u32;
            let persisted = self.persist_inode(handle, inode.ino, &mut state);
            drop(state);
            if let Err(err) = persisted {
                end_pending(&allocated);
                return Err(err);
            }
            return Ok(MapResult {
                count: allocated.len() as u32,
                first: allocated.first().copied(),
                new_allocation: true,
            });
        }

        // Move: adopt the shadowed physical blocks without copying.
        let mut state = inode.state_mut();
        let mut moved = 0u32;
        let mut first = None;
        for i in 0..maxblocks {
            let logical = iblock + i;
            if state.map.contains_key(&logical) {
                break;
            }
            let Some(physical) = snapshot_block(logical) else {
                return Err(SfsError::Invalid(
                    "cannot move blocks into the reserved header region".into(),
                ));
            };
            state.map.insert(logical, physical);
            first.get_or_insert(physical);
            moved += 1;
        }
        state.blocks_charged += moved;
        if moved > 0 {
            self.persist_inode(handle, inode.ino, &mut state)?;
        }
        Ok(MapResult {
            count: moved,
            first,
            new_allocation: moved > 0,
        })
    }

    /// Free every block of a snapshot file: all mapped blocks plus the
    /// map chain. A truncate specialized for snapshot inodes; non-active
    /// snapshots never allocate, so only the lifecycle manager races
    /// with itself here (and it holds the snapshot mutex).
    pub fn truncate_snapshot(&self, handle: &Handle<'_>, inode: &Arc<Inode>) -> Result<u32> {
        let mut state = inode.state_mut();
        let mut freed = 0u32;

        let mappings: Vec<BlockNr> = state.map.values().copied().collect();
        for block in mappings {
            handle.extend_or_restart(sfs_journal::MAX_TRANS_DATA)?;
            self.free_volume_blocks(handle, block, 1, true)?;
            freed += 1;
        }
        state.map.clear();

        let chain: Vec<BlockNr> = std::mem::take(&mut state.map_chain);
        for block in chain {
            self.free_volume_blocks(handle, block, 1, true)?;
            freed += 1;
        }

        state.size = 0;
        state.disksize = 0;
        state.blocks_charged = 0;
        self.persist_inode(handle, inode.ino, &mut state)?;
        debug!(target: "sfs::ctl", ino = inode.ino.0, freed, "snapshot truncated");
        Ok(freed)
    }
}

fn mapped_run(state: &InodeState, iblock: u32, maxblocks: u32) -> MapResult {
    let mut count = 0;
    while count < maxblocks && state.map.contains_key(&(iblock + count)) {
        count += 1;
    }
    MapResult {
        count,
        first: state.map.get(&iblock).copied(),
        new_allocation: false,
    }
}
