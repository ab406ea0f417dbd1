//! Minimal volume formatter.
//!
//! Lays out a SnapFS-extended volume: superblock, group descriptor
//! table, per-group block/inode bitmaps and inode tables, and the
//! reserved inodes (root, journal, exclude). Exclude-bitmap blocks are
//! allocated lazily at first read-write mount, not here.

use crate::context::inode_table_blocks;
use sfs_alloc::{FsGeometry, bitmap_set_range};
use sfs_block::BlockDevice;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{
    DiskInode, GROUP_DESC_SIZE, GroupDesc, INODE_RECORD_SIZE, MODE_DIRECTORY, MODE_REGULAR,
    STATE_VALID, Superblock,
};
use sfs_types::{
    BlockNr, EXCLUDE_INO, FEATURE_COMPAT_BIG_JOURNAL, FEATURE_COMPAT_EXCLUDE_INODE,
    FEATURE_COMPAT_HAS_JOURNAL, FIRST_INO, GroupNr, InodeNr, JOURNAL_INO, ROOT_INO,
    SFS_SUPER_MAGIC, SnapshotId,
};
use tracing::info;

/// Formatting parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FormatParams {
    pub blocks: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub volume_name: String,
}

impl Default for FormatParams {
    fn default() -> Self {
        Self {
            blocks: 8192,
            blocks_per_group: 2048,
            inodes_per_group: 64,
            volume_name: "snapfs".into(),
        }
    }
}

/// Write a fresh filesystem onto `dev`.
pub fn format(dev: &dyn BlockDevice, params: &FormatParams) -> Result<()> {
    if params.blocks > dev.block_count() {
        return Err(SfsError::Invalid(format!(
            "volume of {} blocks does not fit device of {} blocks",
            params.blocks,
            dev.block_count()
        )));
    }
    if params.blocks_per_group == 0 || params.blocks_per_group > 8 * 4096 {
        return Err(SfsError::Invalid(
            "blocks_per_group must fit a one-block bitmap".into(),
        ));
    }

    let group_count = params.blocks.div_ceil(params.blocks_per_group);
    let geo = FsGeometry {
        blocks_per_group: params.blocks_per_group,
        inodes_per_group: params.inodes_per_group,
        block_size: 4096,
        total_blocks: params.blocks,
        total_inodes: group_count * params.inodes_per_group,
        group_count,
        inode_size: INODE_RECORD_SIZE as u32,
    };
    let itb = inode_table_blocks(&geo);
    let descs_per_block = 4096 / GROUP_DESC_SIZE as u32;
    let gdt_blocks = group_count.div_ceil(descs_per_block);

    // Lay out per-group metadata and build descriptors.
    let mut descs = Vec::with_capacity(group_count as usize);
    let mut total_meta = 0u32;
    for g in 0..group_count {
        let base = g * params.blocks_per_group;
        let meta_start = if g == 0 { 1 + gdt_blocks } else { base };
        let blocks_in_group = geo.blocks_in_group(GroupNr(g));
        let group_meta = (meta_start - base) + 2 + itb;
        if group_meta > blocks_in_group {
            return Err(SfsError::Invalid(format!(
                "group {g} too small for its metadata ({group_meta} > {blocks_in_group})"
            )));
        }

        let desc = GroupDesc {
            block_bitmap: BlockNr(meta_start),
            inode_bitmap: BlockNr(meta_start + 1),
            inode_table: BlockNr(meta_start + 2),
            free_blocks_count: blocks_in_group - group_meta,
            exclude_bitmap: BlockNr(0),
        };
        total_meta += group_meta;

        // Block bitmap: superblock/GDT (group 0) plus this group's
        // bitmaps and inode table are in use.
        let mut bitmap = vec![0u8; 4096];
        bitmap_set_range(&mut bitmap, 0, meta_start - base + 2 + itb);
        // Bits past the end of a short last group are unusable.
        if blocks_in_group < params.blocks_per_group {
            bitmap_set_range(
                &mut bitmap,
                blocks_in_group,
                params.blocks_per_group - blocks_in_group,
            );
        }
        dev.write_block(desc.block_bitmap, &bitmap)?;

        // Inode bitmap: reserve the well-known inodes in group 0.
        let mut ibitmap = vec![0u8; 4096];
        if g == 0 {
            bitmap_set_range(&mut ibitmap, 0, FIRST_INO - 1);
        }
        dev.write_block(desc.inode_bitmap, &ibitmap)?;

        // Zeroed inode table.
        let zero = vec![0u8; 4096];
        for t in 0..itb {
            dev.write_block(BlockNr(desc.inode_table.0 + t), &zero)?;
        }

        descs.push(desc);
    }

    // Group descriptor table.
    let mut gdt = vec![0u8; 4096 * gdt_blocks as usize];
    for (g, desc) in descs.iter().enumerate() {
        let off = g * GROUP_DESC_SIZE;
        desc.encode_into(&mut gdt[off..off + GROUP_DESC_SIZE]);
    }
    for b in 0..gdt_blocks {
        let off = b as usize * 4096;
        dev.write_block(BlockNr(1 + b), &gdt[off..off + 4096])?;
    }

    // Reserved inode records.
    write_inode_record(dev, &geo, &descs, InodeNr(ROOT_INO), MODE_DIRECTORY)?;
    write_inode_record(dev, &geo, &descs, InodeNr(JOURNAL_INO), MODE_REGULAR)?;
    write_inode_record(dev, &geo, &descs, InodeNr(EXCLUDE_INO), MODE_REGULAR)?;

    // Superblock last, so a partial format never decodes.
    let sb = Superblock {
        magic: SFS_SUPER_MAGIC,
        state: STATE_VALID,
        blocks_count: params.blocks,
        inodes_count: geo.total_inodes,
        blocks_per_group: params.blocks_per_group,
        inodes_per_group: params.inodes_per_group,
        inode_size: INODE_RECORD_SIZE as u16,
        gdt_blocks: gdt_blocks as u16,
        feature_compat: FEATURE_COMPAT_HAS_JOURNAL
            | FEATURE_COMPAT_EXCLUDE_INODE
            | FEATURE_COMPAT_BIG_JOURNAL,
        feature_ro_compat: 0,
        free_blocks_count: params.blocks - total_meta,
        journal_inum: JOURNAL_INO,
        last_snapshot_ino: InodeNr::NONE,
        active_snapshot_ino: InodeNr::NONE,
        snapshot_id: SnapshotId(0),
        snapshot_reserved_blocks: 0,
        volume_name: params.volume_name.clone(),
    };
    let mut sb_block = vec![0u8; 4096];
    sb.encode_into(&mut sb_block);
    dev.write_block(BlockNr(0), &sb_block)?;
    dev.sync()?;

    info!(
        target: "sfs::ctl",
        blocks = params.blocks,
        groups = group_count,
        "volume formatted"
    );
    Ok(())
}

fn write_inode_record(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    descs: &[GroupDesc],
    ino: InodeNr,
    mode: u16,
) -> Result<()> {
    let (group, table_block, record_off) = geo.inode_slot(ino.0);
    let desc = descs
        .get(group.0 as usize)
        .ok_or_else(|| SfsError::Invalid(format!("inode {} outside volume", ino.0)))?;
    let block_nr = BlockNr(desc.inode_table.0 + table_block);

    let record = DiskInode {
        mode,
        links: 1,
        ..DiskInode::default()
    };
    let mut block = dev.read_block(block_nr)?.into_inner();
    record.encode_into(&mut block[record_off..record_off + INODE_RECORD_SIZE]);
    dev.write_block(block_nr, &block)
}
