//! Packed Btrfs on-disk records.
//!
//! Field layout follows the upstream on-disk format; every multi-byte
//! integer is little-endian. Records are viewed over raw buffers with
//! zerocopy, so each struct must be free of implicit padding.

use byteorder::LittleEndian;
use zerocopy::byteorder::{I64, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use super::{
    BTRFS_CSUM_SIZE, BTRFS_FSID_SIZE, BTRFS_LABEL_SIZE, BTRFS_NUM_BACKUP_ROOTS,
    BTRFS_SYSTEM_CHUNK_ARRAY_SIZE, BTRFS_UUID_SIZE,
};

pub type Lu16 = U16<LittleEndian>;
pub type Lu32 = U32<LittleEndian>;
pub type Lu64 = U64<LittleEndian>;
pub type Li64 = I64<LittleEndian>;

/// 17-byte item key: `(objectid, type, offset)`.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
pub struct BtrfsDiskKey {
    pub objectid: Lu64,
    pub item_type: u8,
    pub offset: Lu64,
}

pub const DISK_KEY_SIZE: usize = 17;

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
pub struct BtrfsTimespec {
    pub sec: Li64,
    pub nsec: Lu32,
}

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct BtrfsDevItem {
    pub devid: Lu64,
    pub total_bytes: Lu64,
    pub bytes_used: Lu64,
    pub io_align: Lu32,
    pub io_width: Lu32,
    pub sector_size: Lu32,
    pub dev_type: Lu64,
    pub generation: Lu64,
    pub start_offset: Lu64,
    pub dev_group: Lu32,
    pub seek_speed: u8,
    pub bandwidth: u8,
    pub uuid: [u8; BTRFS_UUID_SIZE],
    pub fsid: [u8; BTRFS_FSID_SIZE],
}

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct BtrfsRootBackup {
    pub tree_root: Lu64,
    pub tree_root_gen: Lu64,
    pub chunk_root: Lu64,
    pub chunk_root_gen: Lu64,
    pub extent_root: Lu64,
    pub extent_root_gen: Lu64,
    pub fs_root: Lu64,
    pub fs_root_gen: Lu64,
    pub dev_root: Lu64,
    pub dev_root_gen: Lu64,
    pub csum_root: Lu64,
    pub csum_root_gen: Lu64,
    pub total_bytes: Lu64,
    pub bytes_used: Lu64,
    pub num_devices: Lu64,
    pub unused_64: [Lu64; 4],
    pub tree_root_level: u8,
    pub chunk_root_level: u8,
    pub extent_root_level: u8,
    pub fs_root_level: u8,
    pub dev_root_level: u8,
    pub csum_root_level: u8,
    pub unused_8: [u8; 10],
}

/// Superblock, stored in the 4096-byte sector at physical 0x10000.
/// The checksum covers bytes 32..4096 of the sector.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct BtrfsSuperBlock {
    pub csum: [u8; BTRFS_CSUM_SIZE],
    pub fsid: [u8; BTRFS_FSID_SIZE],
    pub bytenr: Lu64,
    pub flags: Lu64,
    pub magic: Lu64,
    pub generation: Lu64,
    pub root: Lu64,
    pub chunk_root: Lu64,
    pub log_root: Lu64,
    pub log_root_transid: Lu64,
    pub total_bytes: Lu64,
    pub bytes_used: Lu64,
    pub root_dir_objectid: Lu64,
    pub num_devices: Lu64,
    pub sectorsize: Lu32,
    pub nodesize: Lu32,
    pub leafsize: Lu32,
    pub stripesize: Lu32,
    pub sys_chunk_array_size: Lu32,
    pub chunk_root_generation: Lu64,
    pub compat_flags: Lu64,
    pub compat_ro_flags: Lu64,
    pub incompat_flags: Lu64,
    pub csum_type: Lu16,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    pub dev_item: BtrfsDevItem,
    pub label: [u8; BTRFS_LABEL_SIZE],
    pub cache_generation: Lu64,
    pub uuid_tree_generation: Lu64,
    pub metadata_uuid: [u8; BTRFS_FSID_SIZE],
    pub reserved: [Lu64; 28],
    pub sys_chunk_array: [u8; BTRFS_SYSTEM_CHUNK_ARRAY_SIZE],
    pub super_roots: [BtrfsRootBackup; BTRFS_NUM_BACKUP_ROOTS],
}

/// Node header shared by internal and leaf nodes.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct BtrfsHeader {
    pub csum: [u8; BTRFS_CSUM_SIZE],
    pub fsid: [u8; BTRFS_FSID_SIZE],
    pub bytenr: Lu64,
    pub flags: Lu64,
    pub chunk_tree_uuid: [u8; BTRFS_UUID_SIZE],
    pub generation: Lu64,
    pub owner: Lu64,
    pub nritems: Lu32,
    pub level: u8,
}

pub const HEADER_SIZE: usize = 101;

/// Internal-node entry: `(key, child logical address, generation)`.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct BtrfsKeyPtr {
    pub key: BtrfsDiskKey,
    pub blockptr: Lu64,
    pub generation: Lu64,
}

pub const KEY_PTR_SIZE: usize = 33;

/// Leaf-node entry: payload lives at `offset` past the header.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct BtrfsItem {
    pub key: BtrfsDiskKey,
    pub offset: Lu32,
    pub size: Lu32,
}

pub const ITEM_SIZE: usize = 25;

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct BtrfsStripe {
    pub devid: Lu64,
    pub offset: Lu64,
    pub dev_uuid: [u8; BTRFS_UUID_SIZE],
}

pub const STRIPE_SIZE: usize = 32;

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct BtrfsChunk {
    pub length: Lu64,
    pub owner: Lu64,
    pub stripe_len: Lu64,
    pub chunk_type: Lu64,
    pub io_align: Lu32,
    pub io_width: Lu32,
    pub sector_size: Lu32,
    pub num_stripes: Lu16,
    pub sub_stripes: Lu16,
    /* followed by num_stripes * BtrfsStripe */
}

pub const CHUNK_SIZE: usize = 48;

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct BtrfsInodeItem {
    pub generation: Lu64,
    pub transid: Lu64,
    pub size: Lu64,
    pub nbytes: Lu64,
    pub block_group: Lu64,
    pub nlink: Lu32,
    pub uid: Lu32,
    pub gid: Lu32,
    pub mode: Lu32,
    pub rdev: Lu64,
    pub flags: Lu64,
    pub sequence: Lu64,
    pub reserved: [Lu64; 4],
    pub atime: BtrfsTimespec,
    pub ctime: BtrfsTimespec,
    pub mtime: BtrfsTimespec,
    pub otime: BtrfsTimespec,
}

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct BtrfsRootItem {
    pub inode: BtrfsInodeItem,
    pub generation: Lu64,
    pub root_dirid: Lu64,
    pub bytenr: Lu64,
    pub byte_limit: Lu64,
    pub bytes_used: Lu64,
    pub last_snapshot: Lu64,
    pub flags: Lu64,
    pub refs: Lu32,
    pub drop_progress: BtrfsDiskKey,
    pub drop_level: u8,
    pub level: u8,
    pub generation_v2: Lu64,
    pub uuid: [u8; BTRFS_UUID_SIZE],
    pub parent_uuid: [u8; BTRFS_UUID_SIZE],
    pub received_uuid: [u8; BTRFS_UUID_SIZE],
    pub ctransid: Lu64,
    pub otransid: Lu64,
    pub stransid: Lu64,
    pub rtransid: Lu64,
    pub ctime: BtrfsTimespec,
    pub otime: BtrfsTimespec,
    pub stime: BtrfsTimespec,
    pub rtime: BtrfsTimespec,
    pub reserved: [Lu64; 8],
}

/// Inode ref: name of the link follows, `name_len` bytes.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct BtrfsInodeRef {
    pub index: Lu64,
    pub name_len: Lu16,
}

/// Directory item / index / xattr item: name (and xattr value) follow.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct BtrfsDirItem {
    pub location: BtrfsDiskKey,
    pub transid: Lu64,
    pub data_len: Lu16,
    pub name_len: Lu16,
    pub dir_type: u8,
}

pub const DIR_ITEM_SIZE: usize = 30;

/// File extent item. For INLINE extents only the fields up to `ext_type`
/// are present; the item's remaining bytes are the data itself.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct BtrfsFileExtentItem {
    pub generation: Lu64,
    pub ram_bytes: Lu64,
    pub compression: u8,
    pub encryption: u8,
    pub other_encoding: Lu16,
    pub ext_type: u8,
    pub disk_bytenr: Lu64,
    pub disk_num_bytes: Lu64,
    pub offset: Lu64,
    pub num_bytes: Lu64,
}

/// Byte offset of `disk_bytenr`; inline payload starts here.
pub const FILE_EXTENT_INLINE_DATA_START: usize = 21;
pub const FILE_EXTENT_ITEM_SIZE: usize = 53;

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct BtrfsExtentItem {
    pub refs: Lu64,
    pub generation: Lu64,
    pub flags: Lu64,
}

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct BtrfsBlockGroupItem {
    pub used: Lu64,
    pub chunk_objectid: Lu64,
    pub flags: Lu64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn record_sizes_match_disk_format() {
        assert_eq!(size_of::<BtrfsDiskKey>(), DISK_KEY_SIZE);
        assert_eq!(size_of::<BtrfsHeader>(), HEADER_SIZE);
        assert_eq!(size_of::<BtrfsKeyPtr>(), KEY_PTR_SIZE);
        assert_eq!(size_of::<BtrfsItem>(), ITEM_SIZE);
        assert_eq!(size_of::<BtrfsStripe>(), STRIPE_SIZE);
        assert_eq!(size_of::<BtrfsChunk>(), CHUNK_SIZE);
        assert_eq!(size_of::<BtrfsInodeItem>(), 160);
        assert_eq!(size_of::<BtrfsInodeRef>(), 10);
        assert_eq!(size_of::<BtrfsDirItem>(), DIR_ITEM_SIZE);
        assert_eq!(size_of::<BtrfsFileExtentItem>(), FILE_EXTENT_ITEM_SIZE);
        assert_eq!(size_of::<BtrfsExtentItem>(), 24);
        assert_eq!(size_of::<BtrfsBlockGroupItem>(), 24);
        assert_eq!(size_of::<BtrfsDevItem>(), 98);
        assert_eq!(size_of::<BtrfsRootBackup>(), 168);
        assert_eq!(size_of::<BtrfsRootItem>(), 439);
    }

    #[test]
    fn superblock_fits_its_sector() {
        assert!(size_of::<BtrfsSuperBlock>() <= crate::btrfs::BTRFS_SUPER_SIZE);
        // sys_chunk_array must sit at the documented offset.
        let sb = BtrfsSuperBlock::new_zeroed();
        let base = &sb as *const _ as usize;
        let arr = sb.sys_chunk_array.as_ptr() as usize;
        assert_eq!(arr - base, 811);
    }

    #[test]
    fn key_round_trips_through_bytes() {
        let mut key = BtrfsDiskKey::new_zeroed();
        key.objectid = Lu64::new(256);
        key.item_type = crate::btrfs::DIR_INDEX_KEY;
        key.offset = Lu64::new(2);
        let parsed = BtrfsDiskKey::read_from(key.as_bytes()).unwrap();
        assert_eq!(parsed.objectid.get(), 256);
        assert_eq!(parsed.item_type, crate::btrfs::DIR_INDEX_KEY);
        assert_eq!(parsed.offset.get(), 2);
    }
}
