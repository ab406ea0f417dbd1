#![forbid(unsafe_code)]
//! On-disk structures for SnapFS volumes.
//!
//! Little-endian codecs for the superblock (with the snapshot extension
//! fields), group descriptors (with the persistent exclude-bitmap
//! pointer), fixed-size inode records, and the chained map blocks that
//! persist a snapshot file's sparse block map.
//!
//! The in-memory per-group COW-bitmap cache is deliberately *not* here:
//! it is never persisted and lives in the mount context.

use serde::{Deserialize, Serialize};
use sfs_types::{
    BlockNr, FEATURE_COMPAT_HAS_JOURNAL, FEATURE_COMPAT_RECOVER, FEATURE_RO_COMPAT_HAS_SNAPSHOT,
    FEATURE_RO_COMPAT_IS_SNAPSHOT, InodeNr, ParseError, SFS_SUPER_MAGIC, SnapshotId, ensure_slice,
    read_le_u16, read_le_u32, read_le_u64, write_le_u16, write_le_u32, write_le_u64,
};

/// Size of one group descriptor record on disk.
pub const GROUP_DESC_SIZE: usize = 32;
/// Size of one inode record on disk.
pub const INODE_RECORD_SIZE: usize = 256;
/// Mapping entries per 4096-byte map block (8-byte header, 8-byte pairs).
pub const MAP_ENTRIES_PER_BLOCK: usize = (4096 - 8) / 8;

// File type codes stored in the inode `mode` field.
pub const MODE_FREE: u16 = 0;
pub const MODE_REGULAR: u16 = 1;
pub const MODE_DIRECTORY: u16 = 2;

// Superblock state.
pub const STATE_VALID: u16 = 0x0001;
pub const STATE_ERRORS: u16 = 0x0002;

// ── Superblock ──────────────────────────────────────────────────────────────

/// Parsed superblock, including the snapshot extension fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub magic: u16,
    pub state: u16,
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub gdt_blocks: u16,
    pub feature_compat: u32,
    pub feature_ro_compat: u32,
    pub free_blocks_count: u32,
    pub journal_inum: u32,

    // Snapshot extension.
    pub last_snapshot_ino: InodeNr,
    pub active_snapshot_ino: InodeNr,
    pub snapshot_id: SnapshotId,
    pub snapshot_reserved_blocks: u32,

    pub volume_name: String,
}

impl Superblock {
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u16(data, 0)?;
        if magic != SFS_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u32::from(SFS_SUPER_MAGIC),
                actual: u32::from(magic),
            });
        }
        let blocks_per_group = read_le_u32(data, 12)?;
        if blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "blocks_per_group",
                reason: "must be nonzero",
            });
        }
        let name_bytes = ensure_slice(data, 64, 16)?;
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(16);
        let volume_name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();

        Ok(Self {
            magic,
            state: read_le_u16(data, 2)?,
            blocks_count: read_le_u32(data, 4)?,
            inodes_count: read_le_u32(data, 8)?,
            blocks_per_group,
            inodes_per_group: read_le_u32(data, 16)?,
            inode_size: read_le_u16(data, 20)?,
            gdt_blocks: read_le_u16(data, 22)?,
            feature_compat: read_le_u32(data, 24)?,
            feature_ro_compat: read_le_u32(data, 28)?,
            free_blocks_count: read_le_u32(data, 32)?,
            journal_inum: read_le_u32(data, 36)?,
            last_snapshot_ino: InodeNr(read_le_u32(data, 40)?),
            active_snapshot_ino: InodeNr(read_le_u32(data, 44)?),
            snapshot_id: SnapshotId(read_le_u32(data, 48)?),
            snapshot_reserved_blocks: read_le_u32(data, 52)?,
            volume_name,
        })
    }

    pub fn encode_into(&self, data: &mut [u8]) {
        write_le_u16(data, 0, self.magic);
        write_le_u16(data, 2, self.state);
        write_le_u32(data, 4, self.blocks_count);
        write_le_u32(data, 8, self.inodes_count);
        write_le_u32(data, 12, self.blocks_per_group);
        write_le_u32(data, 16, self.inodes_per_group);
        write_le_u16(data, 20, self.inode_size);
        write_le_u16(data, 22, self.gdt_blocks);
        write_le_u32(data, 24, self.feature_compat);
        write_le_u32(data, 28, self.feature_ro_compat);
        write_le_u32(data, 32, self.free_blocks_count);
        write_le_u32(data, 36, self.journal_inum);
        write_le_u32(data, 40, self.last_snapshot_ino.0);
        write_le_u32(data, 44, self.active_snapshot_ino.0);
        write_le_u32(data, 48, self.snapshot_id.0);
        write_le_u32(data, 52, self.snapshot_reserved_blocks);
        let mut name = [0u8; 16];
        let bytes = self.volume_name.as_bytes();
        let n = bytes.len().min(15);
        name[..n].copy_from_slice(&bytes[..n]);
        data[64..80].copy_from_slice(&name);
    }

    #[must_use]
    pub fn has_ro_compat(&self, flag: u32) -> bool {
        self.feature_ro_compat & flag != 0
    }

    #[must_use]
    pub fn has_compat(&self, flag: u32) -> bool {
        self.feature_compat & flag != 0
    }

    /// Rewrite this copy so it presents as a standalone, read-only image:
    /// no journal, no snapshot subsystem, flagged as a snapshot image.
    pub fn patch_for_image(&mut self) {
        self.feature_compat &= !(FEATURE_COMPAT_HAS_JOURNAL | FEATURE_COMPAT_RECOVER);
        self.journal_inum = 0;
        self.feature_ro_compat &= !FEATURE_RO_COMPAT_HAS_SNAPSHOT;
        self.feature_ro_compat |= FEATURE_RO_COMPAT_IS_SNAPSHOT;
        self.last_snapshot_ino = InodeNr::NONE;
        self.active_snapshot_ino = InodeNr::NONE;
        self.snapshot_id = SnapshotId(0);
        self.snapshot_reserved_blocks = 0;
    }
}

// ── Group descriptor ────────────────────────────────────────────────────────

/// Parsed group descriptor.
///
/// `exclude_bitmap` is the persistent pointer into the exclude inode's
/// data; `0` means the group has no exclude bitmap block yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GroupDesc {
    pub block_bitmap: BlockNr,
    pub inode_bitmap: BlockNr,
    pub inode_table: BlockNr,
    pub free_blocks_count: u32,
    pub exclude_bitmap: BlockNr,
}

impl GroupDesc {
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            block_bitmap: BlockNr(read_le_u32(data, 0)?),
            inode_bitmap: BlockNr(read_le_u32(data, 4)?),
            inode_table: BlockNr(read_le_u32(data, 8)?),
            free_blocks_count: read_le_u32(data, 12)?,
            exclude_bitmap: BlockNr(read_le_u32(data, 16)?),
        })
    }

    pub fn encode_into(&self, data: &mut [u8]) {
        write_le_u32(data, 0, self.block_bitmap.0);
        write_le_u32(data, 4, self.inode_bitmap.0);
        write_le_u32(data, 8, self.inode_table.0);
        write_le_u32(data, 12, self.free_blocks_count);
        write_le_u32(data, 16, self.exclude_bitmap.0);
        data[20..32].fill(0);
    }
}

// ── Inode record ────────────────────────────────────────────────────────────

/// Fixed-size on-disk inode record.
///
/// `next_snapshot` threads the on-disk snapshot chain through the
/// inodes; the field is shared with the orphan list, which is safe
/// because a snapshot is never an orphan at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DiskInode {
    pub mode: u16,
    pub links: u16,
    pub flags: u32,
    pub generation: u32,
    pub size: u64,
    pub disksize: u64,
    pub next_snapshot: InodeNr,
    pub blocks_charged: u32,
    pub map_root: BlockNr,
    pub map_len: u32,
}

impl DiskInode {
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            mode: read_le_u16(data, 0)?,
            links: read_le_u16(data, 2)?,
            flags: read_le_u32(data, 4)?,
            generation: read_le_u32(data, 8)?,
            size: read_le_u64(data, 12)?,
            disksize: read_le_u64(data, 20)?,
            next_snapshot: InodeNr(read_le_u32(data, 28)?),
            blocks_charged: read_le_u32(data, 32)?,
            map_root: BlockNr(read_le_u32(data, 36)?),
            map_len: read_le_u32(data, 40)?,
        })
    }

    pub fn encode_into(&self, data: &mut [u8]) {
        write_le_u16(data, 0, self.mode);
        write_le_u16(data, 2, self.links);
        write_le_u32(data, 4, self.flags);
        write_le_u32(data, 8, self.generation);
        write_le_u64(data, 12, self.size);
        write_le_u64(data, 20, self.disksize);
        write_le_u32(data, 28, self.next_snapshot.0);
        write_le_u32(data, 32, self.blocks_charged);
        write_le_u32(data, 36, self.map_root.0);
        write_le_u32(data, 40, self.map_len);
        data[44..INODE_RECORD_SIZE].fill(0);
    }

    /// Detach all block references so the record's blocks appear
    /// unallocated when the containing inode-table copy is viewed as
    /// part of a standalone image.
    pub fn prune_for_image(&mut self) {
        self.size = 0;
        self.disksize = 0;
        self.blocks_charged = 0;
        self.map_root = BlockNr(0);
        self.map_len = 0;
        self.next_snapshot = InodeNr::NONE;
    }
}

// ── Map blocks ──────────────────────────────────────────────────────────────

/// One block of a snapshot file's persisted block map.
///
/// Layout: `entry_count` (u32), `next` map block (u32, 0 = end), then
/// `(logical, physical)` u32 pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MapBlock {
    pub entries: Vec<(u32, BlockNr)>,
    pub next: BlockNr,
}

impl MapBlock {
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        let count = read_le_u32(data, 0)? as usize;
        if count > MAP_ENTRIES_PER_BLOCK {
            return Err(ParseError::InvalidField {
                field: "entry_count",
                reason: "map block entry count exceeds capacity",
            });
        }
        let next = BlockNr(read_le_u32(data, 4)?);
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let off = 8 + i * 8;
            entries.push((read_le_u32(data, off)?, BlockNr(read_le_u32(data, off + 4)?)));
        }
        Ok(Self { entries, next })
    }

    pub fn encode_into(&self, data: &mut [u8]) {
        data.fill(0);
        write_le_u32(data, 0, self.entries.len() as u32);
        write_le_u32(data, 4, self.next.0);
        for (i, (logical, physical)) in self.entries.iter().enumerate() {
            let off = 8 + i * 8;
            write_le_u32(data, off, *logical);
            write_le_u32(data, off + 4, physical.0);
        }
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAP_ENTRIES_PER_BLOCK
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
