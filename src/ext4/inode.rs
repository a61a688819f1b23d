//! Inode table writer.
//!
//! Step A assigns Ext4 inode numbers (root 256 → 2, the rest 11..N in
//! the driver's locality-sorted order). Step B formats every inode per
//! group: regular files get inline data or an extent tree (after
//! decompressing any compressed extents in place), symlinks embed short
//! targets, device nodes encode rdev, and xattrs land in the inode
//! body.

use device_io::BlockDevice;
use log::{debug, info, warn};
use zerocopy::{AsBytes, FromBytes};

use crate::btrfs::decompress::try_decompress_extent;
use crate::btrfs::model::{FileEntry, FileExtent, FsModel, Xattr};
use crate::btrfs::{is_blk, is_chr, is_dir, is_reg, is_symlink, CompressionType};
use crate::error::{ConvertError, Result};
use crate::mem_policy::MemoryPolicy;
use crate::pool;

use super::alloc::BlockAllocator;
use super::extent::{merge_runs, write_inline_leaf, ExtentTreeBuilder, ResolvedRun};
use super::inode_map::{reverse_map, InodeMap};
use super::planner::Layout;
use super::structs::{
    Ext4Inode, Ext4XattrEntryHead, Ext4XattrIbodyHeader, Lu16, Lu32,
    INODE_STRUCT_SIZE, INODE_XATTR_OFFSET, XATTR_ENTRY_HEAD_SIZE,
};
use super::{
    EXT4_EXTENTS_FL, EXT4_FIRST_INO, EXT4_INLINE_DATA_FL, EXT4_ROOT_INO,
    EXT4_XATTR_INDEX_SECURITY, EXT4_XATTR_INDEX_SYSTEM, EXT4_XATTR_INDEX_USER, EXT4_XATTR_MAGIC,
};

const DECOMPRESS_WORKERS: usize = 4;

/// Step A: map Btrfs objectids to Ext4 inode numbers and build the
/// lookup hash. The model must already be locality-sorted.
pub fn assign_inode_numbers(
    model: &FsModel,
    map: &mut InodeMap,
    policy: Option<&MemoryPolicy>,
) -> Result<()> {
    map.add(crate::btrfs::FIRST_FREE_OBJECTID, EXT4_ROOT_INO);

    let mut next_ino = EXT4_FIRST_INO;
    for fe in &model.inodes {
        if fe.ino == crate::btrfs::FIRST_FREE_OBJECTID {
            continue;
        }
        map.add(fe.ino, next_ino);
        next_ino += 1;
    }

    info!("mapped {} btrfs inodes to ext4 inode numbers", map.len());
    map.build_hash(policy)
}

/// Pack seconds+nanoseconds into the ext4 extra timestamp word.
fn extra_time(sec: i64, nsec: u32) -> u32 {
    (nsec << 2) | (((sec >> 32) as u32) & 0x3)
}

/// Common fields shared by every inode kind.
pub(crate) fn format_base_inode(fe: &FileEntry) -> Ext4Inode {
    let mut inode = Ext4Inode::new_zeroed();

    inode.i_mode = Lu16::new(fe.mode as u16);
    inode.i_uid = Lu16::new(fe.uid as u16);
    inode.i_uid_high = Lu16::new((fe.uid >> 16) as u16);
    inode.i_gid = Lu16::new(fe.gid as u16);
    inode.i_gid_high = Lu16::new((fe.gid >> 16) as u16);
    inode.i_links_count = Lu16::new(fe.nlink.min(u32::from(u16::MAX)) as u16);
    inode.i_size_lo = Lu32::new(fe.size as u32);
    inode.i_size_high = Lu32::new((fe.size >> 32) as u32);

    inode.i_atime = Lu32::new(fe.atime.sec as u32);
    inode.i_ctime = Lu32::new(fe.ctime.sec as u32);
    inode.i_mtime = Lu32::new(fe.mtime.sec as u32);
    inode.i_crtime = Lu32::new(fe.crtime.sec as u32);
    inode.i_atime_extra = Lu32::new(extra_time(fe.atime.sec, fe.atime.nsec));
    inode.i_ctime_extra = Lu32::new(extra_time(fe.ctime.sec, fe.ctime.nsec));
    inode.i_mtime_extra = Lu32::new(extra_time(fe.mtime.sec, fe.mtime.nsec));
    inode.i_crtime_extra = Lu32::new(extra_time(fe.crtime.sec, fe.crtime.nsec));
    inode.i_extra_isize = Lu16::new(32);

    let sectors = (fe.size + 511) / 512;
    inode.i_blocks_lo = Lu32::new(sectors as u32);
    inode.i_blocks_high = Lu16::new((sectors >> 32) as u16);
    inode.i_generation = Lu32::new(1);
    inode
}

/// Decompress every compressed extent of one file, writing the plain
/// bytes to freshly allocated blocks and splitting the extent into the
/// resulting contiguous runs. Skipped extents stay compressed on disk
/// and are logged.
fn decompress_file_extents(
    dev: &dyn BlockDevice,
    layout: &Layout,
    model: &mut FsModel,
    idx: usize,
    alloc: &mut BlockAllocator,
) -> Result<()> {
    if !model.inodes[idx].extents.iter().any(|e| e.is_compressed()) {
        return Ok(());
    }

    let bs = u64::from(layout.block_size);
    let compressed: Vec<FileExtent> = model.inodes[idx]
        .extents
        .iter()
        .filter(|e| e.is_compressed())
        .cloned()
        .collect();

    // Independent extents decompress in parallel; device reads inside
    // are positioned and thread-safe.
    let results: Vec<Option<Vec<u8>>> = {
        let chunk_map = &model.chunk_map;
        pool::run_indexed(compressed.len(), DECOMPRESS_WORKERS, |i| {
            try_decompress_extent(dev, chunk_map, &compressed[i], layout.block_size)
        })
    };

    let ino = model.inodes[idx].ino;
    let old_extents = std::mem::take(&mut model.inodes[idx].extents);
    let mut results = results.into_iter();
    let mut new_extents: Vec<FileExtent> = Vec::with_capacity(old_extents.len());

    for ext in old_extents {
        if !ext.is_compressed() {
            new_extents.push(ext);
            continue;
        }
        let Some(data) = results.next().expect("one result per compressed extent") else {
            // Bomb or corrupt stream: keep the raw extent, already logged.
            new_extents.push(ext);
            continue;
        };

        let needed_blocks = ((data.len() as u64 + bs - 1) / bs) as usize;
        let mut blocks = Vec::with_capacity(needed_blocks);
        for _ in 0..needed_blocks {
            let block = alloc.alloc(layout).ok_or_else(|| {
                ConvertError::insufficient_space(format!(
                    "no space for decompressed data of inode {}",
                    ino
                ))
            })?;
            blocks.push(block);
        }

        let mut block_buf = vec![0u8; bs as usize];
        for (i, &block) in blocks.iter().enumerate() {
            let start = i * bs as usize;
            let end = (start + bs as usize).min(data.len());
            block_buf.fill(0);
            block_buf[..end - start].copy_from_slice(&data[start..end]);
            dev.write_at(block * bs, &block_buf)?;
        }

        // Coalesce the fresh blocks into runs and emit one extent per run.
        let runs = merge_runs(
            blocks
                .iter()
                .enumerate()
                .map(|(i, &b)| ResolvedRun {
                    file_block: i as u32,
                    num_blocks: 1,
                    phys_block: b,
                })
                .collect(),
        );

        let mut file_offset = ext.file_offset;
        let mut remaining = data.len() as u64;
        for run in &runs {
            let run_bytes = (u64::from(run.num_blocks) * bs).min(remaining);
            new_extents.push(FileExtent {
                file_offset,
                disk_bytenr: run.phys_block * bs,
                disk_num_bytes: u64::from(run.num_blocks) * bs,
                num_bytes: run_bytes,
                ram_bytes: run_bytes,
                compression: CompressionType::None,
                extent_type: ext.extent_type,
                inline_data: None,
            });
            file_offset += run_bytes;
            remaining -= run_bytes;
        }
        if runs.len() > 1 {
            debug!(
                "inode {}: decompressed extent split into {} runs",
                ino,
                runs.len()
            );
        }
    }

    model.inodes[idx].extents = new_extents;
    Ok(())
}

/// Largest payload that fits as native inline data: 60 bytes of
/// i_block plus whatever the inode body holds after the xattr header,
/// one entry with its padded "data" name, and the list terminator.
fn max_inline_len(inode_size: u32) -> usize {
    let mut max = 60usize;
    if inode_size as usize > INODE_XATTR_OFFSET {
        let ibody = inode_size as usize - INODE_XATTR_OFFSET;
        max += ibody.saturating_sub(
            std::mem::size_of::<Ext4XattrIbodyHeader>() + XATTR_ENTRY_HEAD_SIZE + 4 + 4,
        );
    }
    max
}

/// Embed a small file into the inode. Returns false when it won't fit.
fn embed_inline_data(slot: &mut [u8], inode: &mut Ext4Inode, data: &[u8]) -> bool {
    let inode_size = slot.len();
    if data.len() > max_inline_len(inode_size as u32) {
        return false;
    }

    inode.i_flags = Lu32::new(inode.i_flags.get() | EXT4_INLINE_DATA_FL);
    let head = data.len().min(60);
    inode.i_block[..head].copy_from_slice(&data[..head]);

    if data.len() > 60 {
        // Remainder rides in the inode body as a system.data xattr,
        // value packed at the end of the body.
        let rest = &data[60..];
        let ibody = &mut slot[INODE_XATTR_OFFSET..];
        let ibody_len = ibody.len();

        let hdr = Ext4XattrIbodyHeader {
            h_magic: Lu32::new(EXT4_XATTR_MAGIC),
        };
        ibody[..4].copy_from_slice(hdr.as_bytes());

        let value_pad = (rest.len() + 3) & !3;
        let value_offs = ibody_len - value_pad;

        let mut entry = Ext4XattrEntryHead::new_zeroed();
        entry.e_name_len = 4; // "data"
        entry.e_name_index = EXT4_XATTR_INDEX_SYSTEM;
        entry.e_value_size = Lu32::new(rest.len() as u32);
        entry.e_value_offs = Lu16::new(value_offs as u16);
        ibody[4..4 + XATTR_ENTRY_HEAD_SIZE].copy_from_slice(entry.as_bytes());
        ibody[4 + XATTR_ENTRY_HEAD_SIZE..4 + XATTR_ENTRY_HEAD_SIZE + 4]
            .copy_from_slice(b"data");
        // Terminator dword after the entry is already zero.
        ibody[value_offs..value_offs + rest.len()].copy_from_slice(rest);
    }
    true
}

fn xattr_name_index(name: &[u8]) -> (u8, usize) {
    for (prefix, index) in [
        (b"security.".as_slice(), EXT4_XATTR_INDEX_SECURITY),
        (b"system.".as_slice(), EXT4_XATTR_INDEX_SYSTEM),
        (b"user.".as_slice(), EXT4_XATTR_INDEX_USER),
    ] {
        if name.starts_with(prefix) {
            return (index, prefix.len());
        }
    }
    (0, 0)
}

/// Append security/system/user xattrs into the inode body. Entries
/// that don't fit are dropped with a warning.
pub(crate) fn write_ibody_xattrs(slot: &mut [u8], xattrs: &[Xattr], ino: u64) {
    let ibody_len = slot.len().saturating_sub(INODE_XATTR_OFFSET);
    if ibody_len <= 4 + XATTR_ENTRY_HEAD_SIZE {
        return;
    }
    let ibody = &mut slot[INODE_XATTR_OFFSET..];

    let hdr = Ext4XattrIbodyHeader {
        h_magic: Lu32::new(EXT4_XATTR_MAGIC),
    };
    ibody[..4].copy_from_slice(hdr.as_bytes());

    let mut entry_at = 4usize;
    let mut value_end = ibody_len;

    for xa in xattrs {
        if xa.value.len() > 4096 {
            warn!("inode {}: oversized xattr value dropped", ino);
            continue;
        }
        let (index, strip) = xattr_name_index(&xa.name);
        let short_name = &xa.name[strip..];
        let name_pad = (short_name.len() + 3) & !3;
        let value_pad = (xa.value.len() + 3) & !3;
        let entry_size = XATTR_ENTRY_HEAD_SIZE + name_pad;

        // Leave room for the terminating zero word.
        if entry_at + entry_size + 4 + value_pad > value_end {
            warn!("inode {}: xattr {:?} does not fit in the inode body, dropped",
                ino,
                String::from_utf8_lossy(&xa.name));
            continue;
        }

        value_end -= value_pad;
        let mut entry = Ext4XattrEntryHead::new_zeroed();
        entry.e_name_len = short_name.len() as u8;
        entry.e_name_index = index;
        entry.e_value_size = Lu32::new(xa.value.len() as u32);
        entry.e_value_offs = Lu16::new(value_end as u16);
        ibody[entry_at..entry_at + XATTR_ENTRY_HEAD_SIZE].copy_from_slice(entry.as_bytes());
        ibody[entry_at + XATTR_ENTRY_HEAD_SIZE..entry_at + XATTR_ENTRY_HEAD_SIZE + name_pad]
            .fill(0);
        ibody[entry_at + XATTR_ENTRY_HEAD_SIZE
            ..entry_at + XATTR_ENTRY_HEAD_SIZE + short_name.len()]
            .copy_from_slice(short_name);
        ibody[value_end..value_end + xa.value.len()].copy_from_slice(&xa.value);

        entry_at += entry_size;
    }

    // Terminate the entry list.
    ibody[entry_at..entry_at + 4].fill(0);
}

/// Decode a Btrfs rdev (Linux new encoding) into (major, minor).
fn decode_rdev(rdev: u64) -> (u32, u32) {
    let major = ((rdev >> 8) & 0xFFF) as u32;
    let minor = ((rdev & 0xFF) | ((rdev >> 12) & 0xFFF00)) as u32;
    (major, minor)
}

fn encode_device_node(inode: &mut Ext4Inode, rdev: u64) {
    let (major, minor) = decode_rdev(rdev);
    if major < 256 && minor < 256 {
        let old = (major << 8) | minor;
        inode.i_block[..4].copy_from_slice(&old.to_le_bytes());
    } else {
        let new = (minor & 0xFF) | (major << 8) | ((minor & !0xFF) << 12);
        inode.i_block[4..8].copy_from_slice(&new.to_le_bytes());
    }
}

/// Step B+C: format and write the inode table of every group.
#[allow(clippy::too_many_arguments)]
pub fn write_inode_tables(
    dev: &dyn BlockDevice,
    layout: &Layout,
    model: &mut FsModel,
    map: &InodeMap,
    alloc: &mut BlockAllocator,
    builder: &mut ExtentTreeBuilder,
) -> Result<()> {
    info!("writing inode tables");

    let block_size = layout.block_size as usize;
    let inode_size = layout.inode_size as usize;
    let reverse = reverse_map(map, layout.total_inodes);

    for (g, bg) in layout.groups.iter().enumerate() {
        let table_bytes = bg.inode_table_blocks as usize * block_size;
        let mut table = vec![0u8; table_bytes];

        let ino_start = g as u32 * layout.inodes_per_group + 1;
        let ino_end = ino_start + layout.inodes_per_group;

        for ino in ino_start..ino_end {
            let btrfs_ino = reverse.get(ino as usize).copied().unwrap_or(0);
            if btrfs_ino == 0 {
                continue; // reserved or unused slot
            }
            let Some(idx) = model.find_index(btrfs_ino) else {
                continue;
            };

            // Compressed data becomes plain blocks before the extent
            // tree is built over it.
            if is_reg(model.inodes[idx].mode) {
                decompress_file_extents(dev, layout, model, idx, alloc)?;
            }

            let slot_at = (ino - ino_start) as usize * inode_size;
            let slot = &mut table[slot_at..slot_at + inode_size];

            let fe = &model.inodes[idx];
            let mut inode = format_base_inode(fe);

            if is_reg(fe.mode) {
                let mut stored_inline = false;
                if fe.extents.len() == 1
                    && fe.extents[0].extent_type == crate::btrfs::FILE_EXTENT_INLINE
                {
                    if let Some(data) = fe.extents[0].inline_data.clone() {
                        if !data.is_empty() {
                            stored_inline = embed_inline_data(slot, &mut inode, &data);
                        }
                    }
                }
                if !stored_inline {
                    let fe = &model.inodes[idx];
                    builder.build(alloc, dev, layout, &model.chunk_map, fe, &mut inode)?;
                }
            } else if is_dir(fe.mode) {
                // The directory writer fills the tree in; leave an
                // empty extent root for now.
                inode.i_flags = Lu32::new(EXT4_EXTENTS_FL | fe.ext4_flags);
                super::extent::write_empty_root(&mut inode.i_block);
            } else if is_symlink(fe.mode) {
                if let Some(target) = &fe.symlink_target {
                    if target.len() < 60 {
                        inode.i_block[..target.len()].copy_from_slice(target);
                    } else {
                        let keep = target.len().min(block_size - 1);
                        let block = alloc.alloc(layout).ok_or_else(|| {
                            ConvertError::insufficient_space(format!(
                                "no space for symlink target of inode {}",
                                fe.ino
                            ))
                        })?;
                        let mut buf = vec![0u8; block_size];
                        buf[..keep].copy_from_slice(&target[..keep]);
                        dev.write_at(block * block_size as u64, &buf)?;
                        write_inline_leaf(
                            &mut inode.i_block,
                            &[ResolvedRun {
                                file_block: 0,
                                num_blocks: 1,
                                phys_block: block,
                            }],
                        );
                        inode.i_flags = Lu32::new(inode.i_flags.get() | EXT4_EXTENTS_FL);
                    }
                }
            } else if is_chr(fe.mode) || is_blk(fe.mode) {
                encode_device_node(&mut inode, fe.rdev);
            }

            // The struct covers the leading 160 bytes of the slot.
            slot[..INODE_STRUCT_SIZE].copy_from_slice(inode.as_bytes());

            let fe = &model.inodes[idx];
            if !fe.xattrs.is_empty() && inode.i_flags.get() & EXT4_INLINE_DATA_FL == 0 {
                write_ibody_xattrs(slot, &fe.xattrs, fe.ino);
            }
        }

        dev.write_at(bg.inode_table_start * block_size as u64, &table)?;
    }

    info!("inode tables written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btrfs::chunk::{ChunkMap, ChunkMapping};
    use crate::btrfs::superblock::SuperblockInfo;
    use crate::btrfs::{CsumType, FILE_EXTENT_INLINE, FILE_EXTENT_REG};
    use crate::ext4::planner::plan_layout;
    use device_io::MemDevice;

    fn build_model(size: u64) -> FsModel {
        let sb = SuperblockInfo {
            fsid: [0; 16],
            generation: 1,
            root: 0,
            root_level: 0,
            chunk_root: 0,
            chunk_root_level: 0,
            total_bytes: size,
            bytes_used: 0,
            sectorsize: 4096,
            nodesize: 16384,
            csum_type: CsumType::Crc32c,
            label: Vec::new(),
            sys_chunk_array: Vec::new(),
        };
        let chunk_map = ChunkMap::from_entries(vec![ChunkMapping {
            logical: 0,
            physical: 0,
            length: size,
            chunk_type: crate::btrfs::BLOCK_GROUP_DATA,
        }]);
        FsModel::new(sb, chunk_map)
    }

    fn read_inode(dev: &MemDevice, layout: &Layout, ino: u32) -> Ext4Inode {
        let g = (ino - 1) / layout.inodes_per_group;
        let local = (ino - 1) % layout.inodes_per_group;
        let offset = layout.groups[g as usize].inode_table_start * 4096
            + u64::from(local) * u64::from(layout.inode_size);
        let mut buf = vec![0u8; INODE_STRUCT_SIZE];
        dev.read_at(offset, &mut buf).unwrap();
        Ext4Inode::read_from_prefix(&buf[..]).unwrap()
    }

    #[test]
    fn inode_numbers_follow_sorted_order() {
        let mut model = build_model(128 * 1024 * 1024);
        model.find_or_create(256).mode = 0o40755;
        model.find_or_create(300).mode = 0o100644;
        model.find_or_create(280).mode = 0o100644;
        for fe in model.inodes.iter_mut() {
            fe.parent_ino = 256;
        }
        model.sort_for_locality();

        let mut map = InodeMap::new();
        assign_inode_numbers(&model, &mut map, None).unwrap();
        assert_eq!(map.lookup(256), EXT4_ROOT_INO);
        assert_eq!(map.lookup(280), 11);
        assert_eq!(map.lookup(300), 12);
    }

    #[test]
    fn regular_file_inode_round_trips() {
        let size = 128u64 * 1024 * 1024;
        let dev = MemDevice::new(size as usize);
        let layout = plan_layout(size, 4096, 16384, None).unwrap();

        let mut model = build_model(size);
        {
            let root = model.find_or_create(256);
            root.mode = 0o40755;
            root.nlink = 3;
        }
        {
            let fe = model.find_or_create(257);
            fe.parent_ino = 256;
            fe.mode = 0o100644;
            fe.uid = 1000;
            fe.gid = 1000;
            fe.nlink = 1;
            fe.size = 5000;
            fe.mtime.sec = 1_700_000_000;
            fe.mtime.nsec = 42;
            fe.extents.push(FileExtent {
                file_offset: 0,
                disk_bytenr: 0x2000000,
                disk_num_bytes: 8192,
                num_bytes: 8192,
                ram_bytes: 8192,
                extent_type: FILE_EXTENT_REG,
                ..FileExtent::default()
            });
        }
        model.sort_for_locality();

        let mut map = InodeMap::new();
        assign_inode_numbers(&model, &mut map, None).unwrap();
        let mut alloc = BlockAllocator::new(&layout);
        alloc.mark_model_data(&layout, &model);
        let mut builder = ExtentTreeBuilder::new(&layout);

        write_inode_tables(&dev, &layout, &mut model, &map, &mut alloc, &mut builder).unwrap();

        let ino = map.lookup(257);
        let inode = read_inode(&dev, &layout, ino);
        assert_eq!(inode.i_mode.get(), 0o100644);
        assert_eq!(inode.i_uid.get(), 1000);
        assert_eq!(inode.i_size_lo.get(), 5000);
        assert_eq!(inode.i_mtime.get(), 1_700_000_000);
        assert_eq!(inode.i_mtime_extra.get() >> 2, 42);
        assert_ne!(inode.i_flags.get() & EXT4_EXTENTS_FL, 0);

        // Extent points at the original data blocks.
        use crate::ext4::structs::{Ext4Extent, Ext4ExtentHeader};
        let eh = Ext4ExtentHeader::read_from_prefix(&inode.i_block[..]).unwrap();
        assert_eq!(eh.eh_entries.get(), 1);
        let ee = Ext4Extent::read_from_prefix(&inode.i_block[12..]).unwrap();
        assert_eq!(u64::from(ee.ee_start_lo.get()), 0x2000000 / 4096);
        assert_eq!(ee.ee_len.get(), 2);
    }

    #[test]
    fn tiny_inline_file_is_embedded() {
        let size = 128u64 * 1024 * 1024;
        let dev = MemDevice::new(size as usize);
        let layout = plan_layout(size, 4096, 16384, None).unwrap();

        let mut model = build_model(size);
        model.find_or_create(256).mode = 0o40755;
        {
            let fe = model.find_or_create(260);
            fe.parent_ino = 256;
            fe.mode = 0o100644;
            fe.size = 11;
            fe.extents.push(FileExtent {
                extent_type: FILE_EXTENT_INLINE,
                inline_data: Some(b"hello world".to_vec()),
                ram_bytes: 11,
                ..FileExtent::default()
            });
        }
        model.sort_for_locality();

        let mut map = InodeMap::new();
        assign_inode_numbers(&model, &mut map, None).unwrap();
        let mut alloc = BlockAllocator::new(&layout);
        let mut builder = ExtentTreeBuilder::new(&layout);
        write_inode_tables(&dev, &layout, &mut model, &map, &mut alloc, &mut builder).unwrap();

        let inode = read_inode(&dev, &layout, map.lookup(260));
        assert_ne!(inode.i_flags.get() & EXT4_INLINE_DATA_FL, 0);
        assert_eq!(&inode.i_block[..11], b"hello world");
    }

    #[test]
    fn short_symlink_lives_in_i_block() {
        let size = 128u64 * 1024 * 1024;
        let dev = MemDevice::new(size as usize);
        let layout = plan_layout(size, 4096, 16384, None).unwrap();

        let mut model = build_model(size);
        model.find_or_create(256).mode = 0o40755;
        {
            let fe = model.find_or_create(261);
            fe.parent_ino = 256;
            fe.mode = 0o120777;
            fe.size = 9;
            fe.symlink_target = Some(b"hello.txt".to_vec());
        }
        model.sort_for_locality();

        let mut map = InodeMap::new();
        assign_inode_numbers(&model, &mut map, None).unwrap();
        let mut alloc = BlockAllocator::new(&layout);
        let mut builder = ExtentTreeBuilder::new(&layout);
        write_inode_tables(&dev, &layout, &mut model, &map, &mut alloc, &mut builder).unwrap();

        let inode = read_inode(&dev, &layout, map.lookup(261));
        assert_eq!(&inode.i_block[..9], b"hello.txt");
        assert_eq!(inode.i_flags.get() & EXT4_EXTENTS_FL, 0);
    }

    #[test]
    fn device_node_encodes_rdev() {
        let mut inode = Ext4Inode::new_zeroed();
        // major 8, minor 1 in Linux new encoding: (8 << 8) | 1
        encode_device_node(&mut inode, (8 << 8) | 1);
        let old = u32::from_le_bytes(inode.i_block[..4].try_into().unwrap());
        assert_eq!(old, (8 << 8) | 1);
    }
}
