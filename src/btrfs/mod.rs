//! Btrfs on-disk format: constants, record layouts, and the readers
//! that turn a device into the in-memory filesystem model.

use num_enum::{IntoPrimitive, TryFromPrimitive};

pub mod chunk;
pub mod decompress;
pub mod model;
pub mod reader;
pub mod structs;
pub mod superblock;
pub mod tree;

/* Magic and fixed offsets */
pub const BTRFS_MAGIC: u64 = 0x4D5F53665248425F; /* "_BHRfS_M" LE */
pub const BTRFS_SUPER_OFFSET: u64 = 0x10000; /* 64 KiB */
pub const BTRFS_SUPER_SIZE: usize = 4096;

pub const BTRFS_CSUM_SIZE: usize = 32;
pub const BTRFS_FSID_SIZE: usize = 16;
pub const BTRFS_UUID_SIZE: usize = 16;
pub const BTRFS_LABEL_SIZE: usize = 256;
pub const BTRFS_SYSTEM_CHUNK_ARRAY_SIZE: usize = 2048;
pub const BTRFS_NUM_BACKUP_ROOTS: usize = 4;

pub const BTRFS_MAX_LEVEL: u8 = 8;
pub const BTRFS_MAX_NAME_LEN: usize = 255;

/* Key types (key.type field) */
pub const INODE_ITEM_KEY: u8 = 0x01;
pub const INODE_REF_KEY: u8 = 0x0C;
pub const XATTR_ITEM_KEY: u8 = 0x18;
pub const DIR_ITEM_KEY: u8 = 0x54;
pub const DIR_INDEX_KEY: u8 = 0x60;
pub const EXTENT_DATA_KEY: u8 = 0x6C;
pub const ROOT_ITEM_KEY: u8 = 0x84;
pub const EXTENT_ITEM_KEY: u8 = 0xA8;
pub const METADATA_ITEM_KEY: u8 = 0xA9;
pub const BLOCK_GROUP_ITEM_KEY: u8 = 0xC0;
pub const CHUNK_ITEM_KEY: u8 = 0xE4;

/* Well-known object IDs */
pub const ROOT_TREE_OBJECTID: u64 = 1;
pub const EXTENT_TREE_OBJECTID: u64 = 2;
pub const CHUNK_TREE_OBJECTID: u64 = 3;
pub const FS_TREE_OBJECTID: u64 = 5;
pub const FIRST_FREE_OBJECTID: u64 = 256;
pub const FIRST_CHUNK_TREE_OBJECTID: u64 = 256;

/* File extent types */
pub const FILE_EXTENT_INLINE: u8 = 0;
pub const FILE_EXTENT_REG: u8 = 1;
pub const FILE_EXTENT_PREALLOC: u8 = 2;

/* Block group type flags */
pub const BLOCK_GROUP_DATA: u64 = 1 << 0;
pub const BLOCK_GROUP_SYSTEM: u64 = 1 << 1;
pub const BLOCK_GROUP_METADATA: u64 = 1 << 2;

/// Extent compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Zlib = 1,
    Lzo = 2,
    Zstd = 3,
}

impl Default for CompressionType {
    fn default() -> Self {
        CompressionType::None
    }
}

/// Metadata checksum algorithm declared by the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum CsumType {
    Crc32c = 0,
    XxHash64 = 1,
    Sha256 = 2,
    Blake2b = 3,
}

impl CsumType {
    /// Bytes of checksum actually stored for this algorithm (the
    /// on-disk field is always 32 bytes, zero padded).
    pub fn len(self) -> usize {
        match self {
            CsumType::Crc32c => 4,
            CsumType::XxHash64 => 8,
            CsumType::Sha256 => 32,
            CsumType::Blake2b => 32,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CsumType::Crc32c => "CRC32C",
            CsumType::XxHash64 => "xxHash64",
            CsumType::Sha256 => "SHA256",
            CsumType::Blake2b => "BLAKE2b",
        }
    }
}

/* File mode bits (subset of POSIX S_IF*) used when dispatching inodes */
pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

pub fn is_reg(mode: u32) -> bool {
    mode & S_IFMT == S_IFREG
}

pub fn is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

pub fn is_symlink(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

pub fn is_chr(mode: u32) -> bool {
    mode & S_IFMT == S_IFCHR
}

pub fn is_blk(mode: u32) -> bool {
    mode & S_IFMT == S_IFBLK
}

pub fn is_fifo(mode: u32) -> bool {
    mode & S_IFMT == S_IFIFO
}

pub fn is_sock(mode: u32) -> bool {
    mode & S_IFMT == S_IFSOCK
}
