//! Pass 1: populate the in-memory model from the source filesystem.
//!
//! Drives the tree walker three times: over the root tree to locate the
//! FS and extent trees, over the FS tree to materialize inodes, edges,
//! extents and xattrs, and over the extent tree to build the used-block
//! map (reconstructed from file extents when that walk fails).

use std::collections::HashSet;
use std::mem::size_of;

use device_io::BlockDevice;
use log::{debug, info, warn};
use zerocopy::FromBytes;

use crate::error::{ConvertError, Result};

use super::chunk::ChunkMap;
use super::model::{DirEdge, FileExtent, FsModel, Timespec, Xattr};
use super::structs::{
    BtrfsDirItem, BtrfsExtentItem, BtrfsFileExtentItem, BtrfsInodeItem, BtrfsInodeRef,
    BtrfsRootItem, DIR_ITEM_SIZE, FILE_EXTENT_INLINE_DATA_START, FILE_EXTENT_ITEM_SIZE,
};
use super::superblock::read_superblock;
use super::tree::{walk_tree, WalkControl};
use super::{
    is_symlink, CompressionType, BLOCK_GROUP_DATA, DIR_INDEX_KEY, EXTENT_DATA_KEY,
    EXTENT_ITEM_KEY, EXTENT_TREE_OBJECTID, FILE_EXTENT_INLINE, FIRST_FREE_OBJECTID,
    FS_TREE_OBJECTID, INODE_ITEM_KEY, INODE_REF_KEY, METADATA_ITEM_KEY, ROOT_ITEM_KEY,
    XATTR_ITEM_KEY,
};

/// Linux PATH_MAX; symlink targets beyond this are treated as damage.
const PATH_MAX: usize = 4096;

struct TreeRoot {
    bytenr: u64,
    level: u8,
}

/// Read all metadata from a Btrfs device into an [`FsModel`].
pub fn read_fs(dev: &dyn BlockDevice) -> Result<FsModel> {
    info!("pass 1: reading btrfs metadata");

    let sb = read_superblock(dev)?;
    let mut chunk_map = ChunkMap::init_from_superblock(&sb)?;
    chunk_map.populate(dev, &sb)?;

    let mut model = FsModel::new(sb, chunk_map);

    let (fs_root, extent_root) = find_tree_roots(dev, &model)?;
    let fs_root = fs_root.ok_or_else(|| {
        ConvertError::bad_format("FS tree (tree 5) not found in root tree".to_string())
    })?;

    walk_fs_tree(dev, &mut model, &fs_root)?;
    build_used_block_map(dev, &mut model, extent_root)?;
    compute_compression_totals(&mut model);
    resolve_symlink_targets(&mut model);

    if model.find(FIRST_FREE_OBJECTID).is_none() {
        return Err(ConvertError::bad_format(format!(
            "root directory (inode {}) not found",
            FIRST_FREE_OBJECTID
        )));
    }

    info!(
        "btrfs metadata read: {} inodes, {} used extents",
        model.inode_count(),
        model.used_blocks.extents.len()
    );
    Ok(model)
}

/// Root tree walk: record the FS tree and extent tree roots.
fn find_tree_roots(
    dev: &dyn BlockDevice,
    model: &FsModel,
) -> Result<(Option<TreeRoot>, Option<TreeRoot>)> {
    let sb = &model.sb;
    let mut fs_root = None;
    let mut extent_root = None;

    walk_tree(
        dev,
        &model.chunk_map,
        sb.root,
        sb.root_level,
        sb.nodesize,
        sb.csum_type,
        &mut |key, data| {
            if key.item_type != ROOT_ITEM_KEY {
                return Ok(WalkControl::Continue);
            }
            if data.len() < size_of::<BtrfsRootItem>() {
                return Ok(WalkControl::Continue);
            }
            let ri = BtrfsRootItem::read_from_prefix(data).unwrap();
            match key.objectid.get() {
                FS_TREE_OBJECTID => {
                    debug!(
                        "found FS tree root: bytenr=0x{:x} level={}",
                        ri.bytenr.get(),
                        ri.level
                    );
                    fs_root = Some(TreeRoot {
                        bytenr: ri.bytenr.get(),
                        level: ri.level,
                    });
                }
                EXTENT_TREE_OBJECTID => {
                    debug!(
                        "found extent tree root: bytenr=0x{:x} level={}",
                        ri.bytenr.get(),
                        ri.level
                    );
                    extent_root = Some(TreeRoot {
                        bytenr: ri.bytenr.get(),
                        level: ri.level,
                    });
                }
                _ => {}
            }
            Ok(WalkControl::Continue)
        },
    )?;

    Ok((fs_root, extent_root))
}

/// FS tree walk: one dispatch per item type.
fn walk_fs_tree(dev: &dyn BlockDevice, model: &mut FsModel, root: &TreeRoot) -> Result<()> {
    let sb = model.sb.clone();
    let chunk_map = std::mem::take(&mut model.chunk_map);

    // First occurrence of each disk_bytenr; a repeat means CoW sharing.
    let mut cow_seen: HashSet<u64> = HashSet::new();

    let walk_result = walk_tree(
        dev,
        &chunk_map,
        root.bytenr,
        root.level,
        sb.nodesize,
        sb.csum_type,
        &mut |key, data| {
            let objectid = key.objectid.get();
            match key.item_type {
                INODE_ITEM_KEY => {
                    if data.len() < size_of::<BtrfsInodeItem>() {
                        return Ok(WalkControl::Continue);
                    }
                    let ii = BtrfsInodeItem::read_from_prefix(data).unwrap();
                    let fe = model.find_or_create(objectid);
                    fe.mode = ii.mode.get();
                    fe.uid = ii.uid.get();
                    fe.gid = ii.gid.get();
                    fe.nlink = ii.nlink.get();
                    fe.size = ii.size.get();
                    fe.rdev = ii.rdev.get();
                    fe.atime = Timespec {
                        sec: ii.atime.sec.get(),
                        nsec: ii.atime.nsec.get(),
                    };
                    fe.mtime = Timespec {
                        sec: ii.mtime.sec.get(),
                        nsec: ii.mtime.nsec.get(),
                    };
                    fe.ctime = Timespec {
                        sec: ii.ctime.sec.get(),
                        nsec: ii.ctime.nsec.get(),
                    };
                    fe.crtime = Timespec {
                        sec: ii.otime.sec.get(),
                        nsec: ii.otime.nsec.get(),
                    };
                }

                INODE_REF_KEY => {
                    if data.len() < size_of::<BtrfsInodeRef>() {
                        return Ok(WalkControl::Continue);
                    }
                    // Hard-link names are not needed here; every name is
                    // materialized from DIR_INDEX items below.
                    let parent_ino = key.offset.get();
                    let fe = model.find_or_create(objectid);
                    if fe.parent_ino == 0 {
                        fe.parent_ino = parent_ino;
                    }
                }

                DIR_INDEX_KEY => {
                    // DIR_INDEX maps names 1:1; DIR_ITEM would reintroduce
                    // hash-collision ambiguity.
                    if data.len() < DIR_ITEM_SIZE {
                        return Ok(WalkControl::Continue);
                    }
                    let di = BtrfsDirItem::read_from_prefix(data).unwrap();
                    let name_len = di.name_len.get() as usize;
                    if DIR_ITEM_SIZE + name_len > data.len() {
                        warn!(
                            "dir index under inode {} has oversized name ({} bytes), skipping",
                            objectid, name_len
                        );
                        return Ok(WalkControl::Continue);
                    }
                    let child_ino = di.location.objectid.get();
                    let name = data[DIR_ITEM_SIZE..DIR_ITEM_SIZE + name_len].to_vec();
                    model.find_or_create(child_ino);
                    let parent = model.find_or_create(objectid);
                    parent.children.push(DirEdge { child_ino, name });
                }

                EXTENT_DATA_KEY => {
                    if data.len() < FILE_EXTENT_INLINE_DATA_START {
                        return Ok(WalkControl::Continue);
                    }
                    let fi = BtrfsFileExtentItem::read_from_prefix(
                        &pad_extent_item(data)[..],
                    )
                    .unwrap();

                    let mut ext = FileExtent {
                        file_offset: key.offset.get(),
                        ram_bytes: fi.ram_bytes.get(),
                        extent_type: fi.ext_type,
                        compression: CompressionType::try_from(fi.compression)
                            .unwrap_or(CompressionType::None),
                        ..FileExtent::default()
                    };

                    if fi.ext_type == FILE_EXTENT_INLINE {
                        if data.len() > FILE_EXTENT_INLINE_DATA_START {
                            ext.inline_data =
                                Some(data[FILE_EXTENT_INLINE_DATA_START..].to_vec());
                        }
                    } else if data.len() >= FILE_EXTENT_ITEM_SIZE {
                        ext.disk_bytenr = fi.disk_bytenr.get();
                        ext.disk_num_bytes = fi.disk_num_bytes.get();
                        ext.num_bytes = fi.num_bytes.get();

                        if ext.disk_bytenr != 0 && !cow_seen.insert(ext.disk_bytenr) {
                            // Seen before: a reflinked extent that Pass 3
                            // must physically clone.
                            model.shared_extent_count += 1;
                            let block_size = u64::from(sb.sectorsize);
                            model.dedup_blocks_needed +=
                                (ext.disk_num_bytes + block_size - 1) / block_size;
                        }
                    }

                    model.find_or_create(objectid).extents.push(ext);
                }

                XATTR_ITEM_KEY => {
                    if data.len() < DIR_ITEM_SIZE {
                        return Ok(WalkControl::Continue);
                    }
                    let di = BtrfsDirItem::read_from_prefix(data).unwrap();
                    let name_len = di.name_len.get() as usize;
                    let data_len = di.data_len.get() as usize;
                    if DIR_ITEM_SIZE + name_len + data_len > data.len() {
                        warn!(
                            "xattr item on inode {} out of bounds, skipping",
                            objectid
                        );
                        return Ok(WalkControl::Continue);
                    }
                    let name = data[DIR_ITEM_SIZE..DIR_ITEM_SIZE + name_len].to_vec();
                    let value = data
                        [DIR_ITEM_SIZE + name_len..DIR_ITEM_SIZE + name_len + data_len]
                        .to_vec();
                    model.find_or_create(objectid).xattrs.push(Xattr { name, value });
                }

                _ => {}
            }
            Ok(WalkControl::Continue)
        },
    );

    model.chunk_map = chunk_map;
    walk_result
}

/// Extent-tree items are keyed by (start, type, length-or-level). On a
/// failed walk the map is rebuilt from the file extents already read.
fn build_used_block_map(
    dev: &dyn BlockDevice,
    model: &mut FsModel,
    extent_root: Option<TreeRoot>,
) -> Result<()> {
    let sb = model.sb.clone();
    let chunk_map = std::mem::take(&mut model.chunk_map);
    let nodesize = u64::from(sb.nodesize);

    let mut walked = false;
    if let Some(root) = extent_root {
        let mut extents = Vec::new();
        let result = walk_tree(
            dev,
            &chunk_map,
            root.bytenr,
            root.level,
            sb.nodesize,
            sb.csum_type,
            &mut |key, data| {
                if key.item_type != EXTENT_ITEM_KEY && key.item_type != METADATA_ITEM_KEY {
                    return Ok(WalkControl::Continue);
                }
                if data.len() < size_of::<BtrfsExtentItem>() {
                    return Ok(WalkControl::Continue);
                }
                let ei = BtrfsExtentItem::read_from_prefix(data).unwrap();
                let length = if key.item_type == EXTENT_ITEM_KEY {
                    key.offset.get()
                } else {
                    // METADATA_ITEM keys carry the level, the extent is
                    // one tree node.
                    nodesize
                };
                extents.push((key.objectid.get(), length, ei.flags.get()));
                Ok(WalkControl::Continue)
            },
        );

        match result {
            Ok(()) => {
                for (start, length, flags) in extents {
                    model.used_blocks.add(start, length, flags);
                }
                walked = true;
            }
            Err(e) => {
                warn!(
                    "extent tree walk failed ({}), rebuilding used-block map from file extents",
                    e
                );
            }
        }
    }

    model.chunk_map = chunk_map;

    if !walked {
        let mut rebuilt = Vec::new();
        for fe in &model.inodes {
            for ext in &fe.extents {
                if ext.is_blockless() {
                    continue;
                }
                rebuilt.push((ext.disk_bytenr, ext.disk_num_bytes));
            }
        }
        for (start, length) in rebuilt {
            model.used_blocks.add(start, length, BLOCK_GROUP_DATA);
        }
    }

    Ok(())
}

fn compute_compression_totals(model: &mut FsModel) {
    let mut compressed = 0u64;
    let mut decompressed = 0u64;
    let mut count = 0u32;
    for fe in &model.inodes {
        for ext in &fe.extents {
            if ext.is_compressed() {
                compressed += ext.disk_num_bytes;
                decompressed += ext.ram_bytes;
                count += 1;
            }
        }
    }
    model.total_compressed_bytes = compressed;
    model.total_decompressed_bytes = decompressed;
    model.compressed_extent_count = count;

    if count > 0 {
        info!(
            "compressed extents: {} ({} bytes on disk, {} decompressed)",
            count, compressed, decompressed
        );
    }
}

/// Symlink targets live in the inode's inline extent.
fn resolve_symlink_targets(model: &mut FsModel) {
    for fe in &mut model.inodes {
        if !is_symlink(fe.mode) || fe.symlink_target.is_some() {
            continue;
        }
        for ext in &fe.extents {
            if ext.extent_type != FILE_EXTENT_INLINE {
                continue;
            }
            let Some(data) = &ext.inline_data else { continue };
            if data.is_empty() || data.len() > PATH_MAX {
                warn!(
                    "symlink inode {} has suspicious target length {}, skipping",
                    fe.ino,
                    data.len()
                );
                break;
            }
            fe.symlink_target = Some(data.clone());
            break;
        }
    }
}

/// A REG/PREALLOC item may legitimately be truncated after `num_bytes`
/// is implied; pad to the full record so zerocopy can view it.
fn pad_extent_item(data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; FILE_EXTENT_ITEM_SIZE.max(data.len())];
    buf[..data.len()].copy_from_slice(data);
    buf
}
