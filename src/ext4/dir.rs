//! Directory block writer.
//!
//! Small directories get one linear block. Anything larger becomes a
//! two-level HTree: block 0 is the dx root (dot, dotdot, dx_root_info,
//! index entries), followed by index nodes and hash-ordered leaf
//! blocks. The directory's inode is back-filled afterwards with the
//! real extent tree and size.

use device_io::{BlockDevice, WriteBatch};
use log::{debug, info};
use zerocopy::{AsBytes, FromBytes};

use crate::btrfs::model::{DirEdge, FsModel};
use crate::btrfs::{is_blk, is_chr, is_dir, is_fifo, is_reg, is_sock, is_symlink};
use crate::error::{ConvertError, Result};

use super::alloc::BlockAllocator;
use super::dx_hash::half_md4_hash;
use super::extent::{merge_runs, write_tree, ResolvedRun};
use super::inode::format_base_inode;
use super::inode_map::InodeMap;
use super::planner::Layout;
use super::structs::{
    Ext4DirEntryHead, Ext4DxRootInfo, Ext4Inode, Lu16, Lu32, DIR_ENTRY_HEAD_SIZE,
    EXTENT_ENTRY_SIZE, EXTENT_HEADER_SIZE, INODE_STRUCT_SIZE,
};
use super::superblock::FsIdentity;
use super::{
    EXT4_EXTENTS_FL, EXT4_FT_BLKDEV, EXT4_FT_CHRDEV, EXT4_FT_DIR, EXT4_FT_FIFO, EXT4_FT_REG_FILE,
    EXT4_FT_SOCK, EXT4_FT_SYMLINK, EXT4_FT_UNKNOWN, EXT4_HASH_HALF_MD4, EXT4_INDEX_FL,
    EXT4_ROOT_INO,
};

/// On-disk length of one entry: 8-byte head + name, 4-byte aligned.
pub fn dir_entry_len(name_len: usize) -> usize {
    (DIR_ENTRY_HEAD_SIZE + name_len + 3) & !3
}

fn file_type_of(mode: u32) -> u8 {
    if is_reg(mode) {
        EXT4_FT_REG_FILE
    } else if is_dir(mode) {
        EXT4_FT_DIR
    } else if is_chr(mode) {
        EXT4_FT_CHRDEV
    } else if is_blk(mode) {
        EXT4_FT_BLKDEV
    } else if is_fifo(mode) {
        EXT4_FT_FIFO
    } else if is_sock(mode) {
        EXT4_FT_SOCK
    } else if is_symlink(mode) {
        EXT4_FT_SYMLINK
    } else {
        EXT4_FT_UNKNOWN
    }
}

/// Write one entry at `offset`; returns bytes consumed (0 = no room).
fn write_entry(
    block: &mut [u8],
    offset: usize,
    ino: u32,
    file_type: u8,
    name: &[u8],
) -> usize {
    let entry_len = dir_entry_len(name.len());
    if offset + entry_len > block.len() {
        return 0;
    }
    let mut head = Ext4DirEntryHead::new_zeroed();
    head.inode = Lu32::new(ino);
    head.rec_len = Lu16::new(entry_len as u16);
    head.name_len = name.len() as u8;
    head.file_type = file_type;
    block[offset..offset + DIR_ENTRY_HEAD_SIZE].copy_from_slice(head.as_bytes());
    block[offset + DIR_ENTRY_HEAD_SIZE..offset + DIR_ENTRY_HEAD_SIZE + name.len()]
        .copy_from_slice(name);
    entry_len
}

/// Stretch the last entry's rec_len to the end of the block.
fn finalize_block(block: &mut [u8], used: usize) {
    if used == 0 {
        return;
    }
    let mut last = 0usize;
    let mut scan = 0usize;
    while scan < used {
        last = scan;
        let rec_len =
            u16::from_le_bytes(block[scan + 4..scan + 6].try_into().unwrap()) as usize;
        if rec_len == 0 {
            break;
        }
        scan += rec_len;
    }
    let fill = (block.len() - last) as u16;
    block[last + 4..last + 6].copy_from_slice(&fill.to_le_bytes());
}

/* dx index blocks: the count/limit pair overlays entry 0's hash field,
 * so entry 0 carries only a block pointer. */

fn dx_set_countlimit(block: &mut [u8], base: usize, limit: u16, count: u16) {
    block[base..base + 2].copy_from_slice(&limit.to_le_bytes());
    block[base + 2..base + 4].copy_from_slice(&count.to_le_bytes());
}

fn dx_set_entry(block: &mut [u8], base: usize, index: usize, hash: u32, child: u32) {
    let at = base + index * 8;
    if index > 0 {
        block[at..at + 4].copy_from_slice(&hash.to_le_bytes());
    }
    block[at + 4..at + 8].copy_from_slice(&child.to_le_bytes());
}

const DX_ROOT_ENTRY_BASE: usize = 32;
const DX_NODE_ENTRY_BASE: usize = 8;

fn init_dx_root(block: &mut [u8], dir_ino: u32, parent_ino: u32) -> usize {
    let block_size = block.len();

    let mut dot = Ext4DirEntryHead::new_zeroed();
    dot.inode = Lu32::new(dir_ino);
    dot.rec_len = Lu16::new(12);
    dot.name_len = 1;
    dot.file_type = EXT4_FT_DIR;
    block[..DIR_ENTRY_HEAD_SIZE].copy_from_slice(dot.as_bytes());
    block[DIR_ENTRY_HEAD_SIZE] = b'.';

    let mut dotdot = Ext4DirEntryHead::new_zeroed();
    dotdot.inode = Lu32::new(parent_ino);
    dotdot.rec_len = Lu16::new((block_size - 12) as u16);
    dotdot.name_len = 2;
    dotdot.file_type = EXT4_FT_DIR;
    block[12..12 + DIR_ENTRY_HEAD_SIZE].copy_from_slice(dotdot.as_bytes());
    block[20] = b'.';
    block[21] = b'.';

    let mut info = Ext4DxRootInfo::new_zeroed();
    info.hash_version = EXT4_HASH_HALF_MD4;
    info.info_length = 8;
    info.indirect_levels = 1; // two-level tree
    block[24..32].copy_from_slice(info.as_bytes());

    let limit = ((block_size - DX_ROOT_ENTRY_BASE) / 8) as u16;
    dx_set_countlimit(block, DX_ROOT_ENTRY_BASE, limit, 0);
    limit as usize
}

fn init_dx_node(block: &mut [u8]) -> usize {
    let block_size = block.len();
    let mut fake = Ext4DirEntryHead::new_zeroed();
    fake.rec_len = Lu16::new(block_size as u16);
    block[..DIR_ENTRY_HEAD_SIZE].copy_from_slice(fake.as_bytes());

    let limit = ((block_size - DX_NODE_ENTRY_BASE) / 8) as u16;
    dx_set_countlimit(block, DX_NODE_ENTRY_BASE, limit, 0);
    limit as usize
}

struct ChildEntry {
    ino: u32,
    file_type: u8,
    name: Vec<u8>,
    hash: u32,
}

/// Build the directory's blocks in memory. Returns the buffers; the
/// caller allocates their device blocks.
fn build_dir_blocks(
    block_size: usize,
    dir_ino: u32,
    parent_ino: u32,
    children: &[ChildEntry],
    use_htree: bool,
) -> Result<Vec<Vec<u8>>> {
    let mut blocks: Vec<Vec<u8>> = Vec::new();

    if !use_htree {
        let mut block = vec![0u8; block_size];
        let mut offset = 0usize;
        offset += write_entry(&mut block, offset, dir_ino, EXT4_FT_DIR, b".");
        offset += write_entry(&mut block, offset, parent_ino, EXT4_FT_DIR, b"..");
        for child in children {
            let written = write_entry(&mut block, offset, child.ino, child.file_type, &child.name);
            if written == 0 {
                return Err(ConvertError::corrupt(format!(
                    "directory inode {} overflows its linear block",
                    dir_ino
                )));
            }
            offset += written;
        }
        finalize_block(&mut block, offset);
        blocks.push(block);
        return Ok(blocks);
    }

    // HTree: block 0 = root, then alternating index/leaf blocks.
    let mut root = vec![0u8; block_size];
    let root_limit = init_dx_root(&mut root, dir_ino, parent_ino);
    blocks.push(root);

    let mut node = vec![0u8; block_size];
    let node_limit = init_dx_node(&mut node);
    blocks.push(node);
    let mut current_node = 1usize;
    let mut node_count = 1usize; // entry 0 points at the first leaf
    let mut root_count = 1usize; // entry 0 points at the first node

    blocks.push(vec![0u8; block_size]); // first leaf
    let mut current_leaf = 2usize;
    let mut leaf_used = 0usize;

    // Register first node in root and first leaf in node.
    dx_set_entry(&mut blocks[0], DX_ROOT_ENTRY_BASE, 0, 0, 1);
    dx_set_countlimit(&mut blocks[0], DX_ROOT_ENTRY_BASE, root_limit as u16, 1);
    dx_set_entry(&mut blocks[current_node], DX_NODE_ENTRY_BASE, 0, 0, 2);
    dx_set_countlimit(&mut blocks[current_node], DX_NODE_ENTRY_BASE, node_limit as u16, 1);

    for child in children {
        let entry_len = dir_entry_len(child.name.len());
        if leaf_used + entry_len > block_size {
            finalize_block(&mut blocks[current_leaf], leaf_used);

            if node_count >= node_limit {
                // Current index node is full: spawn another one and
                // register it in the root.
                if root_count >= root_limit {
                    return Err(ConvertError::resource_limit(format!(
                        "directory inode {} exceeds the 2-level HTree limit",
                        dir_ino
                    )));
                }
                let mut node = vec![0u8; block_size];
                init_dx_node(&mut node);
                blocks.push(node);
                current_node = blocks.len() - 1;
                node_count = 0;

                dx_set_entry(
                    &mut blocks[0],
                    DX_ROOT_ENTRY_BASE,
                    root_count,
                    child.hash,
                    current_node as u32,
                );
                root_count += 1;
                dx_set_countlimit(
                    &mut blocks[0],
                    DX_ROOT_ENTRY_BASE,
                    root_limit as u16,
                    root_count as u16,
                );
            }

            blocks.push(vec![0u8; block_size]);
            current_leaf = blocks.len() - 1;
            leaf_used = 0;

            dx_set_entry(
                &mut blocks[current_node],
                DX_NODE_ENTRY_BASE,
                node_count,
                child.hash,
                current_leaf as u32,
            );
            node_count += 1;
            dx_set_countlimit(
                &mut blocks[current_node],
                DX_NODE_ENTRY_BASE,
                node_limit as u16,
                node_count as u16,
            );
        }

        let written = write_entry(
            &mut blocks[current_leaf],
            leaf_used,
            child.ino,
            child.file_type,
            &child.name,
        );
        debug_assert!(written != 0);
        leaf_used += written;
    }

    finalize_block(&mut blocks[current_leaf], leaf_used);
    Ok(blocks)
}

/// Write every directory's blocks and back-fill its inode.
pub fn write_directories(
    dev: &dyn BlockDevice,
    layout: &Layout,
    model: &mut FsModel,
    map: &InodeMap,
    alloc: &mut BlockAllocator,
    ident: &FsIdentity,
) -> Result<()> {
    info!("writing directory entries");
    let block_size = layout.block_size as usize;

    for idx in 0..model.inodes.len() {
        if !is_dir(model.inodes[idx].mode) {
            continue;
        }

        let dir_btrfs_ino = model.inodes[idx].ino;
        let dir_ino = map.lookup(dir_btrfs_ino);
        if dir_ino == 0 {
            continue;
        }
        let parent_ino = if dir_btrfs_ino == crate::btrfs::FIRST_FREE_OBJECTID {
            EXT4_ROOT_INO
        } else {
            match map.lookup(model.inodes[idx].parent_ino) {
                0 => EXT4_ROOT_INO,
                ino => ino,
            }
        };

        // Resolve edges: drop unmapped children, attach type and hash.
        let mut children: Vec<ChildEntry> = Vec::with_capacity(model.inodes[idx].children.len());
        let mut subdirs = 0u32;
        for edge in &model.inodes[idx].children {
            let DirEdge { child_ino, name } = edge;
            if name.is_empty() || name.len() > crate::btrfs::BTRFS_MAX_NAME_LEN {
                continue;
            }
            let ino = map.lookup(*child_ino);
            if ino == 0 {
                continue;
            }
            let mode = model.find(*child_ino).map_or(0, |fe| fe.mode);
            if is_dir(mode) {
                subdirs += 1;
            }
            children.push(ChildEntry {
                ino,
                file_type: file_type_of(mode),
                name: name.clone(),
                hash: half_md4_hash(&ident.hash_seed, name),
            });
        }

        let dir_size: usize =
            24 + children.iter().map(|c| dir_entry_len(c.name.len())).sum::<usize>();
        let use_htree = dir_size > block_size;
        if use_htree {
            model.inodes[idx].ext4_flags |= EXT4_INDEX_FL;
            children.sort_by_key(|c| c.hash);
        }

        let blocks = build_dir_blocks(block_size, dir_ino, parent_ino, &children, use_htree)?;

        // Allocate device blocks in logical order.
        let mut block_nums = Vec::with_capacity(blocks.len());
        for _ in &blocks {
            let b = alloc.alloc(layout).ok_or_else(|| {
                ConvertError::insufficient_space(format!(
                    "no space for directory block (inode {})",
                    dir_ino
                ))
            })?;
            block_nums.push(b);
        }

        // Contiguous runs go out as one write; scattered blocks use
        // the batch interface.
        let contiguous = block_nums.windows(2).all(|w| w[1] == w[0] + 1);
        if contiguous && blocks.len() > 1 {
            let mut combined = vec![0u8; blocks.len() * block_size];
            for (i, block) in blocks.iter().enumerate() {
                combined[i * block_size..(i + 1) * block_size].copy_from_slice(block);
            }
            dev.write_at(block_nums[0] * block_size as u64, &combined)?;
        } else {
            let mut batch = WriteBatch::new();
            for (block, &num) in blocks.iter().zip(&block_nums) {
                batch.queue(num * block_size as u64, block.clone());
            }
            batch.submit(dev)?;
        }

        if use_htree {
            debug!(
                "directory inode {}: {} children over {} blocks (htree)",
                dir_ino,
                children.len(),
                blocks.len()
            );
        }

        backfill_dir_inode(
            dev, layout, model, idx, dir_ino, &block_nums, subdirs, alloc,
        )?;
    }

    info!("directory entries written");
    Ok(())
}

/// Rebuild the directory's inode with its final size, link count, and
/// an extent tree covering every directory block.
#[allow(clippy::too_many_arguments)]
fn backfill_dir_inode(
    dev: &dyn BlockDevice,
    layout: &Layout,
    model: &FsModel,
    idx: usize,
    dir_ino: u32,
    block_nums: &[u64],
    subdirs: u32,
    alloc: &mut BlockAllocator,
) -> Result<()> {
    let block_size = layout.block_size as usize;
    let fe = &model.inodes[idx];

    let mut inode = format_base_inode(fe);
    inode.i_flags = Lu32::new(EXT4_EXTENTS_FL | fe.ext4_flags);
    inode.i_links_count = Lu16::new((2 + subdirs).min(u32::from(u16::MAX)) as u16);

    let dir_bytes = block_nums.len() as u64 * block_size as u64;
    inode.i_size_lo = Lu32::new(dir_bytes as u32);
    inode.i_size_high = Lu32::new((dir_bytes >> 32) as u32);

    let runs = merge_runs(
        block_nums
            .iter()
            .enumerate()
            .map(|(i, &b)| ResolvedRun {
                file_block: i as u32,
                num_blocks: 1,
                phys_block: b,
            })
            .collect(),
    );

    // Account an extent-tree leaf when the runs spill out of i_block.
    let per_block = (block_size - EXTENT_HEADER_SIZE) / EXTENT_ENTRY_SIZE;
    let tree_blocks = if runs.len() > super::EXT4_INLINE_EXTENTS {
        ((runs.len() + per_block - 1) / per_block) as u64
    } else {
        0
    };
    let sectors = (dir_bytes + tree_blocks * block_size as u64 + 511) / 512;
    inode.i_blocks_lo = Lu32::new(sectors as u32);
    inode.i_blocks_high = Lu16::new((sectors >> 32) as u16);

    write_tree(alloc, dev, layout, &runs, &mut inode.i_block)?;

    // Whole-slot write: struct first, xattrs in the body.
    let inode_size = layout.inode_size as usize;
    let mut slot = vec![0u8; inode_size];
    slot[..INODE_STRUCT_SIZE].copy_from_slice(inode.as_bytes());
    if !fe.xattrs.is_empty() {
        super::inode::write_ibody_xattrs(&mut slot, &fe.xattrs, fe.ino);
    }

    let group = (dir_ino - 1) / layout.inodes_per_group;
    let local = (dir_ino - 1) % layout.inodes_per_group;
    let bg = layout.groups.get(group as usize).ok_or_else(|| {
        ConvertError::corrupt(format!("inode {} outside any group", dir_ino))
    })?;
    let inode_offset =
        bg.inode_table_start * block_size as u64 + u64::from(local) * inode_size as u64;
    dev.write_at(inode_offset, &slot)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btrfs::chunk::ChunkMap;
    use crate::btrfs::superblock::SuperblockInfo;
    use crate::btrfs::CsumType;
    use crate::ext4::inode::assign_inode_numbers;
    use crate::ext4::planner::plan_layout;
    use crate::ext4::structs::{Ext4Extent, Ext4ExtentHeader, Ext4ExtentIdx};
    use device_io::MemDevice;
    use zerocopy::FromBytes;

    fn build_model() -> FsModel {
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
                label: Vec::new(),
                sys_chunk_array: Vec::new(),
            },
            ChunkMap::default(),
        )
    }

    #[test]
    fn entry_lengths_are_padded_to_four() {
        assert_eq!(dir_entry_len(1), 12);
        assert_eq!(dir_entry_len(4), 12);
        assert_eq!(dir_entry_len(5), 16);
        assert_eq!(dir_entry_len(12), 20);
    }

    #[test]
    fn linear_directory_block_layout() {
        let children = vec![ChildEntry {
            ino: 12,
            file_type: EXT4_FT_REG_FILE,
            name: b"hello.txt".to_vec(),
            hash: 0,
        }];
        let blocks = build_dir_blocks(4096, 2, 2, &children, false).unwrap();
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];

        // ".": inode 2, rec_len 12.
        assert_eq!(u32::from_le_bytes(block[0..4].try_into().unwrap()), 2);
        assert_eq!(u16::from_le_bytes(block[4..6].try_into().unwrap()), 12);
        assert_eq!(block[8], b'.');
        // "..": at 12.
        assert_eq!(block[20], b'.');
        assert_eq!(block[21], b'.');
        // child at 24 with rec_len stretched to block end.
        assert_eq!(u32::from_le_bytes(block[24..28].try_into().unwrap()), 12);
        assert_eq!(
            u16::from_le_bytes(block[28..30].try_into().unwrap()) as usize,
            4096 - 24
        );
        assert_eq!(&block[32..41], b"hello.txt");
    }

    #[test]
    fn thousand_children_build_an_htree_reaching_every_block() {
        let size = 256u64 * 1024 * 1024;
        let dev = MemDevice::new(size as usize);
        let layout = plan_layout(size, 4096, 16384, None).unwrap();
        let ident = FsIdentity::generate();

        let mut model = build_model();
        {
            let root = model.find_or_create(256);
            root.mode = 0o40755;
            root.nlink = 2;
        }
        for i in 0..1000u64 {
            let ino = 300 + i;
            let fe = model.find_or_create(ino);
            fe.parent_ino = 256;
            fe.mode = 0o100644;
            model
                .find_or_create(256)
                .children
                .push(DirEdge {
                    child_ino: ino,
                    // 12-byte names
                    name: format!("file-{:07}", i).into_bytes(),
                });
        }
        model.sort_for_locality();

        let mut map = InodeMap::new();
        assign_inode_numbers(&model, &mut map, None).unwrap();
        let mut alloc = BlockAllocator::new(&layout);

        write_directories(&dev, &layout, &mut model, &map, &mut alloc, &ident).unwrap();
        assert_ne!(model.find(256).unwrap().ext4_flags & EXT4_INDEX_FL, 0);

        // Read the root inode back and chase its extent tree.
        let local = u64::from(EXT4_ROOT_INO - 1);
        let inode_off = layout.groups[0].inode_table_start * 4096 + local * 256;
        let mut slot = vec![0u8; INODE_STRUCT_SIZE];
        dev.read_at(inode_off, &mut slot).unwrap();
        let inode = Ext4Inode::read_from_prefix(&slot[..]).unwrap();
        assert_ne!(inode.i_flags.get() & EXT4_INDEX_FL, 0);

        let dir_blocks = u64::from(inode.i_size_lo.get()) / 4096;
        // 1000 entries of 20 bytes each need ~5 leaves plus index blocks.
        assert!(dir_blocks >= (1000 * 20) as u64 / 4096);

        let eh = Ext4ExtentHeader::read_from_prefix(&inode.i_block[..]).unwrap();
        let mut covered = 0u64;
        if eh.eh_depth.get() == 0 {
            for e in 0..eh.eh_entries.get() as usize {
                let ee = Ext4Extent::read_from_prefix(
                    &inode.i_block[EXTENT_HEADER_SIZE + e * EXTENT_ENTRY_SIZE..],
                )
                .unwrap();
                covered += u64::from(ee.ee_len.get());
            }
        } else {
            for e in 0..eh.eh_entries.get() as usize {
                let ei = Ext4ExtentIdx::read_from_prefix(
                    &inode.i_block[EXTENT_HEADER_SIZE + e * EXTENT_ENTRY_SIZE..],
                )
                .unwrap();
                let mut leaf = vec![0u8; 4096];
                dev.read_at(u64::from(ei.ei_leaf_lo.get()) * 4096, &mut leaf)
                    .unwrap();
                let leh = Ext4ExtentHeader::read_from_prefix(&leaf[..]).unwrap();
                for le in 0..leh.eh_entries.get() as usize {
                    let ee = Ext4Extent::read_from_prefix(
                        &leaf[EXTENT_HEADER_SIZE + le * EXTENT_ENTRY_SIZE..],
                    )
                    .unwrap();
                    covered += u64::from(ee.ee_len.get());
                }
            }
        }
        // Extent tree reachable from the inode covers every dir block.
        assert_eq!(covered, dir_blocks);

        // dx root sanity: hash version and a nonzero entry count.
        let ee0 = {
            let eh = Ext4ExtentHeader::read_from_prefix(&inode.i_block[..]).unwrap();
            assert!(eh.eh_entries.get() >= 1);
            if eh.eh_depth.get() == 0 {
                Ext4Extent::read_from_prefix(&inode.i_block[EXTENT_HEADER_SIZE..])
                    .unwrap()
                    .ee_start_lo
                    .get()
            } else {
                let ei =
                    Ext4ExtentIdx::read_from_prefix(&inode.i_block[EXTENT_HEADER_SIZE..]).unwrap();
                let mut leaf = vec![0u8; 4096];
                dev.read_at(u64::from(ei.ei_leaf_lo.get()) * 4096, &mut leaf)
                    .unwrap();
                Ext4Extent::read_from_prefix(&leaf[EXTENT_HEADER_SIZE..])
                    .unwrap()
                    .ee_start_lo
                    .get()
            }
        };
        let mut root_block = vec![0u8; 4096];
        dev.read_at(u64::from(ee0) * 4096, &mut root_block).unwrap();
        assert_eq!(root_block[24 + 4], EXT4_HASH_HALF_MD4); // hash_version
        assert_eq!(root_block[24 + 5], 8); // info_length
        assert_eq!(root_block[24 + 6], 1); // indirect_levels
    }
}
