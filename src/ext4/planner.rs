//! Ext4 layout planning: group geometry, metadata placement, reserved
//! blocks, and the viability check gating Pass 2.

use log::{info, warn};

use crate::btrfs::model::FsModel;
use crate::btrfs::{is_dir, is_reg, is_symlink};
use crate::error::{ConvertError, Result};

use super::{bg_has_super, EXT4_DEFAULT_BLOCK_SIZE, EXT4_DEFAULT_INODE_RATIO, EXT4_DEFAULT_INODE_SIZE};

/// One block group's metadata placement.
#[derive(Debug, Clone, Default)]
pub struct BgLayout {
    pub group_start_block: u64,
    pub has_super: bool,
    pub superblock_block: u64,
    pub gdt_start_block: u64,
    pub gdt_blocks: u32,
    pub reserved_gdt_blocks: u32,
    pub block_bitmap_block: u64,
    pub inode_bitmap_block: u64,
    pub inode_table_start: u64,
    pub inode_table_blocks: u32,
    pub data_start_block: u64,
    pub data_blocks: u32,
}

/// The complete layout plan.
#[derive(Debug, Default)]
pub struct Layout {
    pub total_blocks: u64,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u32,
    pub num_groups: u32,
    pub total_inodes: u32,
    pub desc_size: u16,
    pub groups: Vec<BgLayout>,
    /// Every metadata block number any group reserves.
    pub reserved_blocks: Vec<u64>,
}

impl Layout {
    /// One bit per block, set for every reserved metadata block.
    pub fn reserved_bitmap(&self) -> Vec<u8> {
        let mut bitmap = vec![0u8; ((self.total_blocks + 7) / 8) as usize];
        for &b in &self.reserved_blocks {
            if b < self.total_blocks {
                bitmap[(b / 8) as usize] |= 1 << (b % 8);
            }
        }
        bitmap
    }
}

/// Compute the Ext4 geometry for a device and check it can hold the
/// source filesystem with a 5% margin.
pub fn plan_layout(
    device_size: u64,
    block_size: u32,
    inode_ratio: u32,
    model: Option<&FsModel>,
) -> Result<Layout> {
    let block_size = if block_size == 0 {
        EXT4_DEFAULT_BLOCK_SIZE
    } else {
        block_size
    };
    let inode_ratio = if inode_ratio == 0 {
        EXT4_DEFAULT_INODE_RATIO
    } else {
        inode_ratio
    };

    if !matches!(block_size, 1024 | 2048 | 4096) {
        return Err(ConvertError::unsupported(format!(
            "block size {} (must be 1024, 2048, or 4096)",
            block_size
        )));
    }
    if device_size == 0 || device_size < u64::from(block_size) {
        return Err(ConvertError::insufficient_space(format!(
            "device too small ({} bytes)",
            device_size
        )));
    }

    let mut layout = Layout {
        block_size,
        inode_size: EXT4_DEFAULT_INODE_SIZE,
        desc_size: 64,
        ..Layout::default()
    };

    layout.total_blocks = device_size / u64::from(block_size);
    layout.blocks_per_group = 8 * block_size; // bits in one bitmap block
    layout.num_groups = ((layout.total_blocks + u64::from(layout.blocks_per_group) - 1)
        / u64::from(layout.blocks_per_group)) as u32;

    // Inodes per group: ratio-driven, clamped to bitmap capacity.
    let file_count = model.map_or(0, |m| m.inode_count());
    let mut total_inodes_raw = device_size / u64::from(inode_ratio);
    if total_inodes_raw < u64::from(file_count) + 16 {
        total_inodes_raw = u64::from(file_count) + 16;
    }

    let mut per_group =
        ((total_inodes_raw + u64::from(layout.num_groups) - 1) / u64::from(layout.num_groups)) as u32;
    per_group = (per_group + 7) & !7; // bitmap bytes are whole
    per_group = per_group.min(8 * block_size);
    per_group = per_group.max(16);
    layout.inodes_per_group = per_group;
    layout.total_inodes = layout.inodes_per_group * layout.num_groups;

    if layout.total_inodes < file_count + 16 {
        return Err(ConvertError::insufficient_space(format!(
            "filesystem has {} inodes but the ext4 geometry at this device size \
             supports only {}",
            file_count, layout.total_inodes
        )));
    }

    // Blocks needed beyond what the source already occupies.
    let data_blocks_required = estimate_data_blocks(model, block_size);

    let gdt_blocks = (layout.num_groups * u32::from(layout.desc_size) + block_size - 1) / block_size;
    let reserved_gdt = if layout.total_blocks > 1024 { gdt_blocks } else { 0 };
    let inode_table_blocks =
        (layout.inodes_per_group * layout.inode_size + block_size - 1) / block_size;

    info!(
        "ext4 plan: {} blocks of {} in {} groups, {} inodes ({} per group)",
        layout.total_blocks,
        block_size,
        layout.num_groups,
        layout.total_inodes,
        layout.inodes_per_group
    );

    // Place metadata group by group and collect the reserved set.
    layout.groups.reserve(layout.num_groups as usize);
    for g in 0..layout.num_groups {
        let mut bg = BgLayout {
            group_start_block: u64::from(g) * u64::from(layout.blocks_per_group),
            has_super: bg_has_super(g),
            ..BgLayout::default()
        };

        // For block sizes over 1024 the byte-1024 superblock lives
        // inside block 0.
        let first_block = if g == 0 && block_size > 1024 {
            0
        } else {
            bg.group_start_block
        };
        let mut cursor = first_block;

        if bg.has_super {
            bg.superblock_block = cursor;
            cursor += 1;
            bg.gdt_start_block = cursor;
            bg.gdt_blocks = gdt_blocks;
            cursor += u64::from(gdt_blocks);
            bg.reserved_gdt_blocks = reserved_gdt;
            cursor += u64::from(reserved_gdt);
            for b in first_block..cursor {
                layout.reserved_blocks.push(b);
            }
        }

        bg.block_bitmap_block = cursor;
        cursor += 1;
        bg.inode_bitmap_block = cursor;
        cursor += 1;
        bg.inode_table_start = cursor;
        bg.inode_table_blocks = inode_table_blocks;
        cursor += u64::from(inode_table_blocks);
        for b in bg.block_bitmap_block..cursor {
            layout.reserved_blocks.push(b);
        }

        let group_end =
            (bg.group_start_block + u64::from(layout.blocks_per_group)).min(layout.total_blocks);
        bg.data_start_block = cursor;
        bg.data_blocks = if cursor < group_end {
            (group_end - cursor) as u32
        } else {
            0
        };

        layout.groups.push(bg);
    }

    if layout.reserved_blocks.iter().any(|&b| b >= layout.total_blocks) {
        return Err(ConvertError::insufficient_space(
            "device too small to hold its own metadata".to_string(),
        ));
    }

    // Deadlock prevention: keep a 5% free margin after metadata and
    // the data the conversion will write.
    let physically_usable = layout.total_blocks - layout.reserved_blocks.len() as u64;
    if data_blocks_required >= physically_usable {
        return Err(ConvertError::insufficient_space(format!(
            "need {} data blocks but only {} usable after metadata",
            data_blocks_required, physically_usable
        )));
    }
    let free_blocks = physically_usable - data_blocks_required;
    let margin = layout.total_blocks / 20;
    if free_blocks < margin && margin > 0 {
        return Err(ConvertError::insufficient_space(format!(
            "free space {} blocks falls below the 5% safety margin ({} blocks)",
            free_blocks, margin
        )));
    }

    info!(
        "ext4 plan: {} reserved metadata blocks, {} data blocks required, {} free",
        layout.reserved_blocks.len(),
        data_blocks_required,
        free_blocks
    );

    Ok(layout)
}

/// Blocks the conversion must be able to place: extent-tree index
/// blocks for fragmented files, physical data blocks for every
/// non-hole extent, one block per long symlink, directory bodies.
fn estimate_data_blocks(model: Option<&FsModel>, block_size: u32) -> u64 {
    let Some(model) = model else { return 0 };
    let bs = u64::from(block_size);
    let mut required = 0u64;

    for fe in &model.inodes {
        if is_symlink(fe.mode) {
            if fe.size > 59 {
                required += 1;
            }
        } else if is_reg(fe.mode) {
            if fe.extents.len() > 4 {
                let per_block = (block_size - 12) / 12;
                required += (fe.extents.len() as u64 + u64::from(per_block) - 1)
                    / u64::from(per_block);
            }
            for ext in &fe.extents {
                if !ext.is_blockless() {
                    required += (ext.num_bytes + bs - 1) / bs;
                }
            }
        } else if is_dir(fe.mode) {
            required += (fe.size + bs - 1) / bs;
        }
    }
    required
}

/// Count the Btrfs data extents that overlap any reserved metadata
/// block. Each conflicting extent counts once.
pub fn count_conflicts(layout: &Layout, model: &FsModel) -> u32 {
    let bitmap = layout.reserved_bitmap();
    let bs = u64::from(layout.block_size);
    let mut conflicts = 0u32;

    for fe in &model.inodes {
        for ext in &fe.extents {
            if ext.is_blockless() {
                continue;
            }
            let Some(phys) = model.chunk_map.resolve(ext.disk_bytenr) else {
                continue;
            };
            let start_block = phys / bs;
            let end_block = (phys + ext.disk_num_bytes + bs - 1) / bs;
            for b in start_block..end_block {
                if b < layout.total_blocks && bitmap[(b / 8) as usize] & (1 << (b % 8)) != 0 {
                    conflicts += 1;
                    break;
                }
            }
        }
    }

    if conflicts > 0 {
        warn!(
            "{} data extents conflict with ext4 metadata zones",
            conflicts
        );
    }
    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn geometry_for_128_mib() {
        let layout = plan_layout(128 * MIB, 4096, 16384, None).unwrap();
        assert_eq!(layout.total_blocks, 32768);
        assert_eq!(layout.blocks_per_group, 32768);
        assert_eq!(layout.num_groups, 1);
        assert_eq!(layout.total_inodes, layout.inodes_per_group);
        assert!(layout.inodes_per_group >= 16);
        assert_eq!(layout.inodes_per_group % 8, 0);

        let g0 = &layout.groups[0];
        assert!(g0.has_super);
        assert_eq!(g0.superblock_block, 0);
        assert_eq!(g0.gdt_start_block, 1);
        assert!(g0.data_blocks > 0);
    }

    #[test]
    fn reserved_blocks_stay_in_range_and_precede_data() {
        let layout = plan_layout(512 * MIB, 4096, 16384, None).unwrap();
        assert_eq!(layout.num_groups, 4);
        for &b in &layout.reserved_blocks {
            assert!(b < layout.total_blocks);
        }
        for bg in &layout.groups {
            assert!(bg.data_start_block >= bg.inode_table_start);
            assert_eq!(
                bg.data_start_block,
                bg.inode_table_start + u64::from(bg.inode_table_blocks)
            );
        }
        // Group 2 has no superblock backup (not a power of 3/5/7).
        assert!(!layout.groups[2].has_super);
        assert!(layout.groups[3].has_super);
    }

    #[test]
    fn invalid_block_size_is_rejected() {
        assert!(matches!(
            plan_layout(128 * MIB, 512, 16384, None),
            Err(ConvertError::Unsupported(_))
        ));
    }

    #[test]
    fn tiny_device_is_rejected() {
        assert!(plan_layout(2048, 4096, 16384, None).is_err());
    }
}
