//! Block and inode bitmap writer, plus the free-count finalizer.
//!
//! Bitmaps are written after the inode tables and directory/journal
//! passes: the block bitmap is a group-local view of the allocator's
//! global used map, and the inode bitmap needs the fully-populated
//! inode map. The finalizer then re-reads both bitmaps, fixes the
//! free counts in every descriptor, and updates the superblock.

use device_io::BlockDevice;
use log::info;
use zerocopy::{AsBytes, FromBytes};

use crate::checksum::crc32c;
use crate::error::{ConvertError, Result};

use super::alloc::BlockAllocator;
use super::gdt::group_desc_checksum;
use super::inode_map::InodeMap;
use super::planner::Layout;
use super::structs::{
    Ext4GroupDesc, Ext4SuperBlock, Lu16, Lu32, GROUP_DESC_SIZE, SUPERBLOCK_SIZE,
};
use super::superblock::FsIdentity;
use super::{EXT4_FIRST_INO, EXT4_SUPER_OFFSET};

fn set_bit(bitmap: &mut [u8], bit: u64) {
    bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
}

fn bit_is_set(bitmap: &[u8], bit: u64) -> bool {
    bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0
}

/// Write the per-group block and inode bitmaps.
pub fn write_bitmaps(
    dev: &dyn BlockDevice,
    layout: &Layout,
    alloc: &BlockAllocator,
    map: &InodeMap,
) -> Result<()> {
    info!("writing block and inode bitmaps");
    let block_size = layout.block_size as usize;
    let global = alloc.used_bitmap();

    for (g, bg) in layout.groups.iter().enumerate() {
        /* Block bitmap: group-local view of the global used map. */
        let mut block_bitmap = vec![0u8; block_size];
        let group_start = bg.group_start_block;
        let group_end =
            (group_start + u64::from(layout.blocks_per_group)).min(layout.total_blocks);

        for b in group_start..group_end {
            if bit_is_set(global, b) {
                set_bit(&mut block_bitmap, b - group_start);
            }
        }
        // Non-existent blocks of a partial last group are not free.
        for local in (group_end - group_start)..u64::from(layout.blocks_per_group) {
            set_bit(&mut block_bitmap, local);
        }

        dev.write_at(bg.block_bitmap_block * block_size as u64, &block_bitmap)?;

        /* Inode bitmap: reserved inodes plus every mapped inode that
         * falls into this group. */
        let mut inode_bitmap = vec![0u8; block_size];
        if g == 0 {
            for bit in 0..u64::from(EXT4_FIRST_INO - 1) {
                set_bit(&mut inode_bitmap, bit);
            }
        }
        let ino_start = g as u32 * layout.inodes_per_group + 1;
        let ino_end = ino_start + layout.inodes_per_group;
        for entry in map.entries() {
            let ino = entry.ext4_ino.get();
            if ino >= ino_start && ino < ino_end {
                set_bit(&mut inode_bitmap, u64::from(ino - ino_start));
            }
        }
        // Pad the slots past inodes_per_group.
        for bit in u64::from(layout.inodes_per_group)..(block_size as u64 * 8) {
            set_bit(&mut inode_bitmap, bit);
        }

        dev.write_at(bg.inode_bitmap_block * block_size as u64, &inode_bitmap)?;
    }

    info!("bitmaps written for {} groups", layout.num_groups);
    Ok(())
}

/// Re-read every bitmap, recount the free blocks and inodes, rewrite
/// each group descriptor (64-byte stride, fresh CRC16), and update the
/// primary superblock totals.
pub fn update_free_counts(
    dev: &dyn BlockDevice,
    layout: &Layout,
    ident: &FsIdentity,
) -> Result<()> {
    info!("finalizing free block/inode counts");
    let block_size = layout.block_size as usize;
    let gdt_base = layout.groups[0].gdt_start_block * block_size as u64;

    let mut total_free_blocks = 0u64;
    let mut total_free_inodes = 0u64;
    let mut bitmap = vec![0u8; block_size];

    for (g, bg) in layout.groups.iter().enumerate() {
        dev.read_at(bg.block_bitmap_block * block_size as u64, &mut bitmap)?;
        let blocks_in_group = if g as u32 == layout.num_groups - 1 {
            layout.total_blocks - bg.group_start_block
        } else {
            u64::from(layout.blocks_per_group)
        };
        let mut free_blocks = 0u32;
        for bit in 0..blocks_in_group {
            if !bit_is_set(&bitmap, bit) {
                free_blocks += 1;
            }
        }
        total_free_blocks += u64::from(free_blocks);

        dev.read_at(bg.inode_bitmap_block * block_size as u64, &mut bitmap)?;
        let mut free_inodes = 0u32;
        for bit in 0..u64::from(layout.inodes_per_group) {
            if !bit_is_set(&bitmap, bit) {
                free_inodes += 1;
            }
        }
        total_free_inodes += u64::from(free_inodes);

        // Read-modify-write the descriptor at its 64-byte slot.
        let desc_offset = gdt_base + g as u64 * u64::from(layout.desc_size);
        let mut desc_buf = [0u8; GROUP_DESC_SIZE];
        dev.read_at(desc_offset, &mut desc_buf)?;
        let mut desc = Ext4GroupDesc::read_from(&desc_buf[..])
            .ok_or_else(|| ConvertError::corrupt("short group descriptor".to_string()))?;

        desc.bg_free_blocks_count_lo = Lu16::new(free_blocks as u16);
        desc.bg_free_blocks_count_hi = Lu16::new((free_blocks >> 16) as u16);
        desc.bg_free_inodes_count_lo = Lu16::new(free_inodes as u16);
        desc.bg_free_inodes_count_hi = Lu16::new((free_inodes >> 16) as u16);
        desc.bg_checksum = Lu16::new(group_desc_checksum(&ident.uuid, g as u32, &desc));

        dev.write_at(desc_offset, desc.as_bytes())?;
    }

    // Primary superblock totals.
    let mut sb_buf = vec![0u8; SUPERBLOCK_SIZE];
    dev.read_at(EXT4_SUPER_OFFSET, &mut sb_buf)?;
    let mut sb = Ext4SuperBlock::read_from(&sb_buf[..])
        .ok_or_else(|| ConvertError::corrupt("short superblock".to_string()))?;
    sb.s_free_blocks_count_lo = Lu32::new(total_free_blocks as u32);
    sb.s_free_blocks_count_hi = Lu32::new((total_free_blocks >> 32) as u32);
    sb.s_free_inodes_count = Lu32::new(total_free_inodes as u32);
    sb.s_checksum = Lu32::new(0);
    let csum = crc32c(0, &sb.as_bytes()[..SUPERBLOCK_SIZE - 4]);
    sb.s_checksum = Lu32::new(csum);
    dev.write_at(EXT4_SUPER_OFFSET, sb.as_bytes())?;

    info!(
        "free counts finalized: {} blocks, {} inodes",
        total_free_blocks, total_free_inodes
    );
    Ok(())
}
