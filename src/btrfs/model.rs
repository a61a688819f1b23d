//! In-memory filesystem model built by Pass 1.
//!
//! Ownership is tree-shaped: the model owns the inode entries; each
//! entry owns its extents, xattrs, child edges, and symlink target.
//! Directory edges refer to children by inode number and resolve
//! through the model's index, because a directory entry describes a
//! hard link, not ownership.

use std::collections::HashMap;

use super::chunk::ChunkMap;
use super::superblock::SuperblockInfo;
use super::{CompressionType, FILE_EXTENT_INLINE};

/// One file extent as recorded in the FS tree.
#[derive(Debug, Clone, Default)]
pub struct FileExtent {
    pub file_offset: u64,
    /// Logical disk address (0 = sparse hole). Rewritten in place by
    /// the relocator, after which it is a physical byte offset.
    pub disk_bytenr: u64,
    pub disk_num_bytes: u64,
    pub num_bytes: u64,
    pub ram_bytes: u64,
    pub compression: CompressionType,
    pub extent_type: u8,
    /// Payload of INLINE extents.
    pub inline_data: Option<Vec<u8>>,
}

impl FileExtent {
    /// True for extents that occupy no disk blocks (inline or hole).
    pub fn is_blockless(&self) -> bool {
        self.extent_type == FILE_EXTENT_INLINE || self.disk_bytenr == 0
    }

    pub fn is_compressed(&self) -> bool {
        self.compression != CompressionType::None && !self.is_blockless()
    }
}

/// A directory edge: the child is referenced by inode number.
#[derive(Debug, Clone)]
pub struct DirEdge {
    pub child_ino: u64,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Xattr {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

/// One inode and everything hanging off it.
#[derive(Debug, Default)]
pub struct FileEntry {
    pub ino: u64,
    /// Primary parent directory, for `..` linkage. Hard links record
    /// additional parents only through their directory edges.
    pub parent_ino: u64,

    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub rdev: u64,

    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub crtime: Timespec,

    pub symlink_target: Option<Vec<u8>>,
    pub extents: Vec<FileExtent>,
    pub children: Vec<DirEdge>,
    pub xattrs: Vec<Xattr>,

    /// Transient flags set by the Ext4 writers (e.g. the HTree index
    /// flag decided by the directory writer).
    pub ext4_flags: u32,
}

/// One allocated Btrfs extent, from the extent tree.
#[derive(Debug, Clone, Copy)]
pub struct UsedExtent {
    pub start: u64,
    pub length: u64,
    pub flags: u64,
}

#[derive(Debug, Default)]
pub struct UsedBlockMap {
    pub extents: Vec<UsedExtent>,
}

impl UsedBlockMap {
    pub fn add(&mut self, start: u64, length: u64, flags: u64) {
        self.extents.push(UsedExtent {
            start,
            length,
            flags,
        });
    }
}

/// Everything Pass 1 learned about the source filesystem.
pub struct FsModel {
    pub sb: SuperblockInfo,
    pub chunk_map: ChunkMap,
    pub inodes: Vec<FileEntry>,
    index: HashMap<u64, usize>,
    pub used_blocks: UsedBlockMap,

    /// Compression totals for the Pass-2 viability audit.
    pub total_compressed_bytes: u64,
    pub total_decompressed_bytes: u64,
    pub compressed_extent_count: u32,

    /// CoW sharing observed during the FS tree walk.
    pub shared_extent_count: u32,
    pub dedup_blocks_needed: u64,
}

impl FsModel {
    pub fn new(sb: SuperblockInfo, chunk_map: ChunkMap) -> FsModel {
        FsModel {
            sb,
            chunk_map,
            inodes: Vec::new(),
            index: HashMap::new(),
            used_blocks: UsedBlockMap::default(),
            total_compressed_bytes: 0,
            total_decompressed_bytes: 0,
            compressed_extent_count: 0,
            shared_extent_count: 0,
            dedup_blocks_needed: 0,
        }
    }

    pub fn inode_count(&self) -> u32 {
        self.inodes.len() as u32
    }

    pub fn find(&self, ino: u64) -> Option<&FileEntry> {
        self.index.get(&ino).map(|&i| &self.inodes[i])
    }

    pub fn find_mut(&mut self, ino: u64) -> Option<&mut FileEntry> {
        let idx = *self.index.get(&ino)?;
        Some(&mut self.inodes[idx])
    }

    pub fn find_index(&self, ino: u64) -> Option<usize> {
        self.index.get(&ino).copied()
    }

    /// Look up an inode, creating a skeleton entry on first sight.
    pub fn find_or_create(&mut self, ino: u64) -> &mut FileEntry {
        let idx = match self.index.get(&ino) {
            Some(&i) => i,
            None => {
                let i = self.inodes.len();
                self.inodes.push(FileEntry {
                    ino,
                    ..FileEntry::default()
                });
                self.index.insert(ino, i);
                i
            }
        };
        &mut self.inodes[idx]
    }

    /// Sort inodes by (primary parent, inode number) so files in one
    /// directory get contiguous Ext4 inode numbers, then rebuild the
    /// index.
    pub fn sort_for_locality(&mut self) {
        self.inodes.sort_by_key(|fe| (fe.parent_ino, fe.ino));
        self.rebuild_index();
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, fe) in self.inodes.iter().enumerate() {
            self.index.insert(fe.ino, i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btrfs::CsumType;

    fn dummy_sb() -> SuperblockInfo {
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
        }
    }

    #[test]
    fn find_or_create_is_idempotent() {
        let mut model = FsModel::new(dummy_sb(), ChunkMap::default());
        model.find_or_create(256).mode = 0o40755;
        model.find_or_create(256).uid = 1000;
        assert_eq!(model.inode_count(), 1);
        let fe = model.find(256).unwrap();
        assert_eq!(fe.mode, 0o40755);
        assert_eq!(fe.uid, 1000);
    }

    #[test]
    fn locality_sort_groups_siblings_and_keeps_lookups() {
        let mut model = FsModel::new(dummy_sb(), ChunkMap::default());
        for (ino, parent) in [(300u64, 258u64), (260, 256), (299, 258), (258, 256)] {
            let fe = model.find_or_create(ino);
            fe.parent_ino = parent;
        }
        model.sort_for_locality();
        let order: Vec<u64> = model.inodes.iter().map(|fe| fe.ino).collect();
        assert_eq!(order, vec![258, 260, 299, 300]);
        assert_eq!(model.find(299).unwrap().parent_ino, 258);
    }
}
