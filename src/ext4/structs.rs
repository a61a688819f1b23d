//! Packed Ext4 and JBD2 on-disk records.
//!
//! Everything is little-endian except the JBD2 journal superblock,
//! which is big-endian.

use byteorder::BigEndian;
use zerocopy::byteorder::U32;
use zerocopy::{AsBytes, FromBytes, Unaligned};

pub use crate::btrfs::structs::{Lu16, Lu32, Lu64};

pub type Bu32 = U32<BigEndian>;

/// Superblock, 1024 bytes at byte offset 1024.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Ext4SuperBlock {
    pub s_inodes_count: Lu32,
    pub s_blocks_count_lo: Lu32,
    pub s_r_blocks_count_lo: Lu32,
    pub s_free_blocks_count_lo: Lu32,
    pub s_free_inodes_count: Lu32,
    pub s_first_data_block: Lu32,
    pub s_log_block_size: Lu32,
    pub s_log_cluster_size: Lu32,
    pub s_blocks_per_group: Lu32,
    pub s_clusters_per_group: Lu32,
    pub s_inodes_per_group: Lu32,
    pub s_mtime: Lu32,
    pub s_wtime: Lu32,
    pub s_mnt_count: Lu16,
    pub s_max_mnt_count: Lu16,
    pub s_magic: Lu16,
    pub s_state: Lu16,
    pub s_errors: Lu16,
    pub s_minor_rev_level: Lu16,
    pub s_lastcheck: Lu32,
    pub s_checkinterval: Lu32,
    pub s_creator_os: Lu32,
    pub s_rev_level: Lu32,
    pub s_def_resuid: Lu16,
    pub s_def_resgid: Lu16,
    /* dynamic-revision fields */
    pub s_first_ino: Lu32,
    pub s_inode_size: Lu16,
    pub s_block_group_nr: Lu16,
    pub s_feature_compat: Lu32,
    pub s_feature_incompat: Lu32,
    pub s_feature_ro_compat: Lu32,
    pub s_uuid: [u8; 16],
    pub s_volume_name: [u8; 16],
    pub s_last_mounted: [u8; 64],
    pub s_algorithm_usage_bitmap: Lu32,
    pub s_prealloc_blocks: u8,
    pub s_prealloc_dir_blocks: u8,
    pub s_reserved_gdt_blocks: Lu16,
    /* journalling */
    pub s_journal_uuid: [u8; 16],
    pub s_journal_inum: Lu32,
    pub s_journal_dev: Lu32,
    pub s_last_orphan: Lu32,
    pub s_hash_seed: [Lu32; 4],
    pub s_def_hash_version: u8,
    pub s_jnl_backup_type: u8,
    pub s_desc_size: Lu16,
    pub s_default_mount_opts: Lu32,
    pub s_first_meta_bg: Lu32,
    pub s_mkfs_time: Lu32,
    pub s_jnl_blocks: [Lu32; 17],
    /* 64-bit support */
    pub s_blocks_count_hi: Lu32,
    pub s_r_blocks_count_hi: Lu32,
    pub s_free_blocks_count_hi: Lu32,
    pub s_min_extra_isize: Lu16,
    pub s_want_extra_isize: Lu16,
    pub s_flags: Lu32,
    pub s_raid_stride: Lu16,
    pub s_mmp_interval: Lu16,
    pub s_mmp_block: Lu64,
    pub s_raid_stripe_width: Lu32,
    pub s_log_groups_per_flex: u8,
    pub s_checksum_type: u8,
    pub s_reserved_pad: Lu16,
    pub s_kbytes_written: Lu64,
    /* snapshots (unused) */
    pub s_snapshot_inum: Lu32,
    pub s_snapshot_id: Lu32,
    pub s_snapshot_r_blocks_count: Lu64,
    pub s_snapshot_list: Lu32,
    /* error tracking */
    pub s_error_count: Lu32,
    pub s_first_error_time: Lu32,
    pub s_first_error_ino: Lu32,
    pub s_first_error_block: Lu64,
    pub s_first_error_func: [u8; 32],
    pub s_first_error_line: Lu32,
    pub s_last_error_time: Lu32,
    pub s_last_error_ino: Lu32,
    pub s_last_error_line: Lu32,
    pub s_last_error_block: Lu64,
    pub s_last_error_func: [u8; 32],
    pub s_mount_opts: [u8; 64],
    pub s_usr_quota_inum: Lu32,
    pub s_grp_quota_inum: Lu32,
    pub s_overhead_blocks: Lu32,
    pub s_backup_bgs: [Lu32; 2],
    pub s_encrypt_algos: [u8; 4],
    pub s_encrypt_pw_salt: [u8; 16],
    pub s_lpf_ino: Lu32,
    pub s_prj_quota_inum: Lu32,
    pub s_checksum_seed: Lu32,
    pub s_reserved: [Lu32; 98],
    pub s_checksum: Lu32,
}

pub const SUPERBLOCK_SIZE: usize = 1024;

/// Group descriptor, 64 bytes when the 64BIT feature is on.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Ext4GroupDesc {
    pub bg_block_bitmap_lo: Lu32,
    pub bg_inode_bitmap_lo: Lu32,
    pub bg_inode_table_lo: Lu32,
    pub bg_free_blocks_count_lo: Lu16,
    pub bg_free_inodes_count_lo: Lu16,
    pub bg_used_dirs_count_lo: Lu16,
    pub bg_flags: Lu16,
    pub bg_exclude_bitmap_lo: Lu32,
    pub bg_block_bitmap_csum_lo: Lu16,
    pub bg_inode_bitmap_csum_lo: Lu16,
    pub bg_itable_unused_lo: Lu16,
    pub bg_checksum: Lu16,
    /* 64-bit halves */
    pub bg_block_bitmap_hi: Lu32,
    pub bg_inode_bitmap_hi: Lu32,
    pub bg_inode_table_hi: Lu32,
    pub bg_free_blocks_count_hi: Lu16,
    pub bg_free_inodes_count_hi: Lu16,
    pub bg_used_dirs_count_hi: Lu16,
    pub bg_itable_unused_hi: Lu16,
    pub bg_exclude_bitmap_hi: Lu32,
    pub bg_block_bitmap_csum_hi: Lu16,
    pub bg_inode_bitmap_csum_hi: Lu16,
    pub bg_reserved: Lu32,
}

pub const GROUP_DESC_SIZE: usize = 64;
/// Byte offset of `bg_checksum` inside the descriptor.
pub const GROUP_DESC_CSUM_OFFSET: usize = 30;

/// Inode, leading 160 bytes of the 256-byte on-disk slot.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Ext4Inode {
    pub i_mode: Lu16,
    pub i_uid: Lu16,
    pub i_size_lo: Lu32,
    pub i_atime: Lu32,
    pub i_ctime: Lu32,
    pub i_mtime: Lu32,
    pub i_dtime: Lu32,
    pub i_gid: Lu16,
    pub i_links_count: Lu16,
    pub i_blocks_lo: Lu32,
    pub i_flags: Lu32,
    pub i_osd1: Lu32,
    pub i_block: [u8; 60],
    pub i_generation: Lu32,
    pub i_file_acl_lo: Lu32,
    pub i_size_high: Lu32,
    pub i_obso_faddr: Lu32,
    pub i_blocks_high: Lu16,
    pub i_file_acl_high: Lu16,
    pub i_uid_high: Lu16,
    pub i_gid_high: Lu16,
    pub i_checksum_lo: Lu16,
    pub i_reserved: Lu16,
    pub i_extra_isize: Lu16,
    pub i_checksum_hi: Lu16,
    pub i_ctime_extra: Lu32,
    pub i_mtime_extra: Lu32,
    pub i_atime_extra: Lu32,
    pub i_crtime: Lu32,
    pub i_crtime_extra: Lu32,
    pub i_version_hi: Lu32,
    pub i_projid: Lu32,
}

pub const INODE_STRUCT_SIZE: usize = 160;
/// End of the fixed extra fields: ibody xattrs start past 128 + 32.
pub const INODE_XATTR_OFFSET: usize = 160;

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Ext4ExtentHeader {
    pub eh_magic: Lu16,
    pub eh_entries: Lu16,
    pub eh_max: Lu16,
    pub eh_depth: Lu16,
    pub eh_generation: Lu32,
}

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Ext4Extent {
    pub ee_block: Lu32,
    pub ee_len: Lu16,
    pub ee_start_hi: Lu16,
    pub ee_start_lo: Lu32,
}

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Ext4ExtentIdx {
    pub ei_block: Lu32,
    pub ei_leaf_lo: Lu32,
    pub ei_leaf_hi: Lu16,
    pub ei_unused: Lu16,
}

pub const EXTENT_HEADER_SIZE: usize = 12;
pub const EXTENT_ENTRY_SIZE: usize = 12;

/// Fixed 8-byte head of a directory entry; the name follows.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Ext4DirEntryHead {
    pub inode: Lu32,
    pub rec_len: Lu16,
    pub name_len: u8,
    pub file_type: u8,
}

pub const DIR_ENTRY_HEAD_SIZE: usize = 8;

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Ext4DxRootInfo {
    pub reserved_zero: Lu32,
    pub hash_version: u8,
    pub info_length: u8,
    pub indirect_levels: u8,
    pub unused_flags: u8,
}

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Ext4DxEntry {
    pub hash: Lu32,
    pub block: Lu32,
}

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Ext4DxCountLimit {
    pub limit: Lu16,
    pub count: Lu16,
}

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Ext4XattrIbodyHeader {
    pub h_magic: Lu32,
}

/// Fixed head of an in-inode xattr entry; the padded name follows.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Ext4XattrEntryHead {
    pub e_name_len: u8,
    pub e_name_index: u8,
    pub e_value_offs: Lu16,
    pub e_value_block: Lu32,
    pub e_value_size: Lu32,
    pub e_hash: Lu32,
}

pub const XATTR_ENTRY_HEAD_SIZE: usize = 16;

/// JBD2 v2 journal superblock head. Big-endian on disk; the remainder
/// of the 1024-byte block is zero.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Jbd2SuperBlock {
    pub s_header_magic: Bu32,
    pub s_header_blocktype: Bu32,
    pub s_header_sequence: Bu32,
    pub s_blocksize: Bu32,
    pub s_maxlen: Bu32,
    pub s_first: Bu32,
    pub s_sequence: Bu32,
    pub s_start: Bu32,
    pub s_errno: Bu32,
}

pub const JBD2_MAGIC: u32 = 0xC03B3998;
pub const JBD2_BLOCKTYPE_SB_V2: u32 = 4;
pub const JBD2_SB_SIZE: usize = 1024;

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;
    use zerocopy::FromBytes as _;

    #[test]
    fn record_sizes_match_disk_format() {
        assert_eq!(size_of::<Ext4SuperBlock>(), SUPERBLOCK_SIZE);
        assert_eq!(size_of::<Ext4GroupDesc>(), GROUP_DESC_SIZE);
        assert_eq!(size_of::<Ext4Inode>(), INODE_STRUCT_SIZE);
        assert_eq!(size_of::<Ext4ExtentHeader>(), EXTENT_HEADER_SIZE);
        assert_eq!(size_of::<Ext4Extent>(), EXTENT_ENTRY_SIZE);
        assert_eq!(size_of::<Ext4ExtentIdx>(), EXTENT_ENTRY_SIZE);
        assert_eq!(size_of::<Ext4DirEntryHead>(), DIR_ENTRY_HEAD_SIZE);
        assert_eq!(size_of::<Ext4DxRootInfo>(), 8);
        assert_eq!(size_of::<Ext4DxEntry>(), 8);
        assert_eq!(size_of::<Ext4DxCountLimit>(), 4);
        assert_eq!(size_of::<Ext4XattrEntryHead>(), XATTR_ENTRY_HEAD_SIZE);
        assert_eq!(size_of::<Jbd2SuperBlock>(), 36);
    }

    #[test]
    fn superblock_field_offsets() {
        let sb = Ext4SuperBlock::new_zeroed();
        let base = &sb as *const _ as usize;
        assert_eq!(&sb.s_magic as *const _ as usize - base, 56);
        assert_eq!(&sb.s_checksum_seed as *const _ as usize - base, 624);
        assert_eq!(&sb.s_checksum as *const _ as usize - base, 1020);
    }

    #[test]
    fn group_desc_checksum_field_offset() {
        let gd = Ext4GroupDesc::new_zeroed();
        let base = &gd as *const _ as usize;
        assert_eq!(
            &gd.bg_checksum as *const _ as usize - base,
            GROUP_DESC_CSUM_OFFSET
        );
    }

    #[test]
    fn jbd2_superblock_is_big_endian() {
        let mut jsb = Jbd2SuperBlock::new_zeroed();
        jsb.s_header_magic = Bu32::new(JBD2_MAGIC);
        let bytes = zerocopy::AsBytes::as_bytes(&jsb);
        assert_eq!(&bytes[..4], &[0xC0, 0x3B, 0x39, 0x98]);
    }
}
