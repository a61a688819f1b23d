//! Ext4 superblock writer.

use std::time::{SystemTime, UNIX_EPOCH};

use device_io::BlockDevice;
use log::info;
use rand::Rng;
use zerocopy::{AsBytes, FromBytes};

use crate::btrfs::model::FsModel;
use crate::checksum::crc32c;
use crate::error::Result;

use super::planner::Layout;
use super::structs::{Ext4SuperBlock, Lu16, Lu32, Lu64, SUPERBLOCK_SIZE};
use super::*;

/// Identity material generated once per conversion and shared by the
/// superblock, GDT checksums, and HTree hashing.
#[derive(Clone)]
pub struct FsIdentity {
    pub uuid: [u8; 16],
    pub hash_seed: [u32; 4],
}

impl FsIdentity {
    pub fn generate() -> FsIdentity {
        let mut rng = rand::thread_rng();
        FsIdentity {
            uuid: *uuid::Uuid::new_v4().as_bytes(),
            hash_seed: rng.gen(),
        }
    }
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn build_superblock(layout: &Layout, model: &FsModel, ident: &FsIdentity) -> Ext4SuperBlock {
    let mut sb = Ext4SuperBlock::new_zeroed();
    let now = now_secs();

    let log_block_size = {
        let mut log = 0u32;
        let mut bs = layout.block_size;
        while bs > 1024 {
            bs >>= 1;
            log += 1;
        }
        log
    };

    sb.s_inodes_count = Lu32::new(layout.total_inodes);
    sb.s_blocks_count_lo = Lu32::new(layout.total_blocks as u32);
    sb.s_blocks_count_hi = Lu32::new((layout.total_blocks >> 32) as u32);
    sb.s_r_blocks_count_lo = Lu32::new((layout.total_blocks / 20) as u32);
    sb.s_free_blocks_count_lo = Lu32::new(0); // finalizer fills this in
    sb.s_free_inodes_count = Lu32::new(
        layout
            .total_inodes
            .saturating_sub(model.inode_count())
            .saturating_sub(EXT4_FIRST_INO),
    );
    sb.s_first_data_block = Lu32::new(if layout.block_size > 1024 { 0 } else { 1 });
    sb.s_log_block_size = Lu32::new(log_block_size);
    sb.s_log_cluster_size = Lu32::new(log_block_size);
    sb.s_blocks_per_group = Lu32::new(layout.blocks_per_group);
    sb.s_clusters_per_group = Lu32::new(layout.blocks_per_group);
    sb.s_inodes_per_group = Lu32::new(layout.inodes_per_group);
    sb.s_mtime = Lu32::new(now);
    sb.s_wtime = Lu32::new(now);
    sb.s_max_mnt_count = Lu16::new(0xFFFF); // never force fsck by count
    sb.s_magic = Lu16::new(EXT4_SUPER_MAGIC);
    sb.s_state = Lu16::new(EXT4_VALID_FS);
    sb.s_errors = Lu16::new(EXT4_ERRORS_CONTINUE);
    sb.s_lastcheck = Lu32::new(now);
    sb.s_creator_os = Lu32::new(EXT4_OS_LINUX);
    sb.s_rev_level = Lu32::new(EXT4_DYNAMIC_REV);

    sb.s_first_ino = Lu32::new(EXT4_FIRST_INO);
    sb.s_inode_size = Lu16::new(layout.inode_size as u16);
    sb.s_feature_compat = Lu32::new(
        FEATURE_COMPAT_EXT_ATTR
            | FEATURE_COMPAT_DIR_INDEX
            | FEATURE_COMPAT_RESIZE_INODE
            | FEATURE_COMPAT_HAS_JOURNAL,
    );
    sb.s_feature_incompat = Lu32::new(
        FEATURE_INCOMPAT_FILETYPE
            | FEATURE_INCOMPAT_EXTENTS
            | FEATURE_INCOMPAT_64BIT
            | FEATURE_INCOMPAT_FLEX_BG
            | FEATURE_INCOMPAT_CSUM_SEED,
    );
    sb.s_feature_ro_compat = Lu32::new(
        FEATURE_RO_COMPAT_SPARSE_SUPER
            | FEATURE_RO_COMPAT_LARGE_FILE
            | FEATURE_RO_COMPAT_HUGE_FILE
            | FEATURE_RO_COMPAT_GDT_CSUM
            | FEATURE_RO_COMPAT_DIR_NLINK
            | FEATURE_RO_COMPAT_EXTRA_ISIZE
            | FEATURE_RO_COMPAT_METADATA_CSUM,
    );

    sb.s_uuid = ident.uuid;
    let label_len = model.sb.label.len().min(EXT4_LABEL_MAX - 1);
    sb.s_volume_name[..label_len].copy_from_slice(&model.sb.label[..label_len]);

    for (slot, seed) in sb.s_hash_seed.iter_mut().zip(ident.hash_seed) {
        *slot = Lu32::new(seed);
    }
    sb.s_def_hash_version = EXT4_HASH_HALF_MD4;
    sb.s_flags = Lu32::new(EXT4_FLAGS_SIGNED_HASH);

    sb.s_journal_inum = Lu32::new(EXT4_JOURNAL_INO);
    sb.s_desc_size = Lu16::new(layout.desc_size);
    sb.s_mkfs_time = Lu32::new(now);
    sb.s_min_extra_isize = Lu16::new(32);
    sb.s_want_extra_isize = Lu16::new(32);
    sb.s_log_groups_per_flex = 4;
    sb.s_reserved_gdt_blocks = Lu16::new(layout.groups[0].reserved_gdt_blocks as u16);
    sb.s_mmp_block = Lu64::new(0);

    sb.s_checksum_type = 1; // CRC32C
    sb.s_checksum_seed = Lu32::new(crc32c(0, &ident.uuid));

    sb
}

fn seal_checksum(sb: &mut Ext4SuperBlock) {
    sb.s_checksum = Lu32::new(0);
    let csum = crc32c(0, &sb.as_bytes()[..SUPERBLOCK_SIZE - 4]);
    sb.s_checksum = Lu32::new(csum);
}

/// Write the primary superblock at byte 1024 plus a stamped backup in
/// every sparse-super group.
pub fn write_superblock(
    dev: &dyn BlockDevice,
    layout: &Layout,
    model: &FsModel,
    ident: &FsIdentity,
) -> Result<()> {
    let block_size = layout.block_size as usize;
    let mut sb = build_superblock(layout, model, ident);

    info!(
        "writing ext4 superblock (primary at byte {})",
        EXT4_SUPER_OFFSET
    );

    // Primary copy: byte 1024, which sits inside block 0 for block
    // sizes above 1 KiB.
    seal_checksum(&mut sb);
    let mut block = vec![0u8; block_size];
    let in_block = (EXT4_SUPER_OFFSET % block_size as u64) as usize;
    block[in_block..in_block + SUPERBLOCK_SIZE].copy_from_slice(sb.as_bytes());
    let primary_offset = EXT4_SUPER_OFFSET / block_size as u64 * block_size as u64;
    dev.write_at(primary_offset, &block)?;

    // Backups carry their own group number; in backup groups the copy
    // starts at the beginning of the group's first block.
    let mut backups = 0u32;
    for (g, bg) in layout.groups.iter().enumerate().skip(1) {
        if !bg.has_super {
            continue;
        }
        sb.s_block_group_nr = Lu16::new(g as u16);
        seal_checksum(&mut sb);

        let mut block = vec![0u8; block_size];
        block[..SUPERBLOCK_SIZE].copy_from_slice(sb.as_bytes());
        dev.write_at(bg.superblock_block * block_size as u64, &block)?;
        backups += 1;
    }

    info!("superblock written (+ {} backup copies)", backups);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btrfs::chunk::ChunkMap;
    use crate::btrfs::superblock::SuperblockInfo;
    use crate::btrfs::CsumType;
    use crate::ext4::planner::plan_layout;
    use device_io::MemDevice;

    fn model_with_label(label: &[u8]) -> FsModel {
        FsModel::new(
            SuperblockInfo {
                fsid: [0; 16],
                generation: 1,
                root: 0,
                root_level: 0,
                chunk_root: 0,
                chunk_root_level: 0,
                total_bytes: 0,
                bytes_used: 0,
                sectorsize: 4096,
                nodesize: 16384,
                csum_type: CsumType::Crc32c,
                label: label.to_vec(),
                sys_chunk_array: Vec::new(),
            },
            ChunkMap::default(),
        )
    }

    #[test]
    fn written_superblock_reads_back_sane() {
        let size = 256u64 * 1024 * 1024;
        let dev = MemDevice::new(size as usize);
        let layout = plan_layout(size, 4096, 16384, None).unwrap();
        let model = model_with_label(b"mylabel");
        let ident = FsIdentity::generate();

        write_superblock(&dev, &layout, &model, &ident).unwrap();

        let mut buf = vec![0u8; SUPERBLOCK_SIZE];
        dev.read_at(EXT4_SUPER_OFFSET, &mut buf).unwrap();
        let sb = Ext4SuperBlock::read_from_prefix(&buf[..]).unwrap();

        assert_eq!(sb.s_magic.get(), EXT4_SUPER_MAGIC);
        assert_eq!(sb.s_inodes_count.get(), layout.total_inodes);
        assert_eq!(sb.s_blocks_count_lo.get(), layout.total_blocks as u32);
        assert_eq!(sb.s_log_block_size.get(), 2); // 4096
        assert_eq!(sb.s_first_data_block.get(), 0);
        assert_eq!(sb.s_desc_size.get(), 64);
        assert_eq!(sb.s_journal_inum.get(), EXT4_JOURNAL_INO);
        assert_eq!(sb.s_def_hash_version, EXT4_HASH_HALF_MD4);
        assert_eq!(&sb.s_volume_name[..7], b"mylabel");
        assert_eq!(sb.s_uuid, ident.uuid);

        // Self checksum over the leading 1020 bytes.
        assert_eq!(sb.s_checksum.get(), crc32c(0, &buf[..SUPERBLOCK_SIZE - 4]));
    }

    #[test]
    fn backup_copies_are_stamped_with_their_group() {
        let size = 512u64 * 1024 * 1024; // 4 groups: 0,1,3 carry copies
        let dev = MemDevice::new(size as usize);
        let layout = plan_layout(size, 4096, 16384, None).unwrap();
        let model = model_with_label(b"");
        let ident = FsIdentity::generate();

        write_superblock(&dev, &layout, &model, &ident).unwrap();

        let bg3 = &layout.groups[3];
        assert!(bg3.has_super);
        let mut buf = vec![0u8; SUPERBLOCK_SIZE];
        dev.read_at(bg3.superblock_block * 4096, &mut buf).unwrap();
        let sb = Ext4SuperBlock::read_from_prefix(&buf[..]).unwrap();
        assert_eq!(sb.s_magic.get(), EXT4_SUPER_MAGIC);
        assert_eq!(sb.s_block_group_nr.get(), 3);
    }
}
