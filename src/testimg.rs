//! Minimal Btrfs image builder used by the test suite.
//!
//! Produces a single-device, identity-mapped filesystem: one SYSTEM
//! chunk maps logical 0 onto physical 0 for the whole image, so tree
//! node addresses can be chosen freely. All nodes are leaves with
//! correct CRC32C checksums.

use device_io::BlockDevice;
use zerocopy::{AsBytes, FromBytes};

use crate::btrfs::structs::*;
use crate::btrfs::{
    BLOCK_GROUP_SYSTEM, BTRFS_MAGIC, BTRFS_SUPER_OFFSET, BTRFS_SUPER_SIZE, CHUNK_ITEM_KEY,
    DIR_INDEX_KEY, EXTENT_DATA_KEY, EXTENT_ITEM_KEY,
};
use crate::checksum::crc32c;

pub struct TestItem {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
    pub data: Vec<u8>,
}

impl TestItem {
    pub fn new(objectid: u64, item_type: u8, offset: u64, data: Vec<u8>) -> TestItem {
        TestItem {
            objectid,
            item_type,
            offset,
            data,
        }
    }
}

/// Build a checksummed leaf node holding the given items in order.
pub fn leaf_node(logical: u64, owner: u64, nodesize: u32, items: &[TestItem]) -> Vec<u8> {
    let nodesize = nodesize as usize;
    let mut node = vec![0u8; nodesize];

    let mut data_end = nodesize;
    for (i, item) in items.iter().enumerate() {
        data_end -= item.data.len();
        node[data_end..data_end + item.data.len()].copy_from_slice(&item.data);

        let mut rec = BtrfsItem::new_zeroed();
        rec.key.objectid = Lu64::new(item.objectid);
        rec.key.item_type = item.item_type;
        rec.key.offset = Lu64::new(item.offset);
        rec.offset = Lu32::new((data_end - HEADER_SIZE) as u32);
        rec.size = Lu32::new(item.data.len() as u32);
        let at = HEADER_SIZE + i * ITEM_SIZE;
        node[at..at + ITEM_SIZE].copy_from_slice(rec.as_bytes());
    }

    let mut hdr = BtrfsHeader::new_zeroed();
    hdr.fsid = [0x42; 16];
    hdr.bytenr = Lu64::new(logical);
    hdr.generation = Lu64::new(1);
    hdr.owner = Lu64::new(owner);
    hdr.nritems = Lu32::new(items.len() as u32);
    hdr.level = 0;
    node[..HEADER_SIZE].copy_from_slice(hdr.as_bytes());

    let csum = crc32c(0, &node[crate::btrfs::BTRFS_CSUM_SIZE..]);
    node[..4].copy_from_slice(&csum.to_le_bytes());
    node
}

fn inode_item(mode: u32, size: u64, nlink: u32) -> Vec<u8> {
    let mut ii = BtrfsInodeItem::new_zeroed();
    ii.generation = Lu64::new(1);
    ii.size = Lu64::new(size);
    ii.nlink = Lu32::new(nlink);
    ii.uid = Lu32::new(1000);
    ii.gid = Lu32::new(1000);
    ii.mode = Lu32::new(mode);
    ii.atime.sec = Li64::new(1_660_000_000);
    ii.atime.nsec = Lu32::new(111);
    ii.mtime.sec = Li64::new(1_660_000_001);
    ii.mtime.nsec = Lu32::new(222);
    ii.ctime.sec = Li64::new(1_660_000_002);
    ii.ctime.nsec = Lu32::new(333);
    ii.otime.sec = Li64::new(1_660_000_003);
    ii.as_bytes().to_vec()
}

fn inode_ref(index: u64, name: &[u8]) -> Vec<u8> {
    let mut ir = BtrfsInodeRef::new_zeroed();
    ir.index = Lu64::new(index);
    ir.name_len = Lu16::new(name.len() as u16);
    let mut out = ir.as_bytes().to_vec();
    out.extend_from_slice(name);
    out
}

fn dir_index(child_ino: u64, dir_type: u8, name: &[u8]) -> Vec<u8> {
    let mut di = BtrfsDirItem::new_zeroed();
    di.location.objectid = Lu64::new(child_ino);
    di.location.item_type = crate::btrfs::INODE_ITEM_KEY;
    di.transid = Lu64::new(1);
    di.name_len = Lu16::new(name.len() as u16);
    di.dir_type = dir_type;
    let mut out = di.as_bytes().to_vec();
    out.extend_from_slice(name);
    out
}

fn xattr_item(name: &[u8], value: &[u8]) -> Vec<u8> {
    let mut di = BtrfsDirItem::new_zeroed();
    di.transid = Lu64::new(1);
    di.name_len = Lu16::new(name.len() as u16);
    di.data_len = Lu16::new(value.len() as u16);
    di.dir_type = 8; // FT_XATTR
    let mut out = di.as_bytes().to_vec();
    out.extend_from_slice(name);
    out.extend_from_slice(value);
    out
}

fn reg_extent(disk_bytenr: u64, disk_num_bytes: u64, num_bytes: u64) -> Vec<u8> {
    let mut fi = BtrfsFileExtentItem::new_zeroed();
    fi.generation = Lu64::new(1);
    fi.ram_bytes = Lu64::new(num_bytes);
    fi.ext_type = crate::btrfs::FILE_EXTENT_REG;
    fi.disk_bytenr = Lu64::new(disk_bytenr);
    fi.disk_num_bytes = Lu64::new(disk_num_bytes);
    fi.num_bytes = Lu64::new(num_bytes);
    fi.as_bytes().to_vec()
}

fn inline_extent(data: &[u8]) -> Vec<u8> {
    let mut fi = BtrfsFileExtentItem::new_zeroed();
    fi.generation = Lu64::new(1);
    fi.ram_bytes = Lu64::new(data.len() as u64);
    fi.ext_type = crate::btrfs::FILE_EXTENT_INLINE;
    let mut out = fi.as_bytes()[..FILE_EXTENT_INLINE_DATA_START].to_vec();
    out.extend_from_slice(data);
    out
}

fn compressed_extent(disk_bytenr: u64, disk_num_bytes: u64, ram_bytes: u64) -> Vec<u8> {
    let mut fi = BtrfsFileExtentItem::new_zeroed();
    fi.generation = Lu64::new(1);
    fi.ram_bytes = Lu64::new(ram_bytes);
    fi.compression = crate::btrfs::CompressionType::Zlib.into();
    fi.ext_type = crate::btrfs::FILE_EXTENT_REG;
    fi.disk_bytenr = Lu64::new(disk_bytenr);
    fi.disk_num_bytes = Lu64::new(disk_num_bytes);
    fi.num_bytes = Lu64::new(ram_bytes);
    fi.as_bytes().to_vec()
}

fn extent_item(flags: u64) -> Vec<u8> {
    let mut ei = BtrfsExtentItem::new_zeroed();
    ei.refs = Lu64::new(1);
    ei.generation = Lu64::new(1);
    ei.flags = Lu64::new(flags);
    ei.as_bytes().to_vec()
}

fn root_item(bytenr: u64, level: u8) -> Vec<u8> {
    let mut ri = BtrfsRootItem::new_zeroed();
    ri.inode.nlink = Lu32::new(1);
    ri.inode.mode = Lu32::new(0o40755);
    ri.generation = Lu64::new(1);
    ri.root_dirid = Lu64::new(256);
    ri.bytenr = Lu64::new(bytenr);
    ri.refs = Lu32::new(1);
    ri.level = level;
    ri.as_bytes().to_vec()
}

/// A complete synthetic image: superblock plus four leaf trees and one
/// data block.
pub struct TestImage {
    pub image_size: u64,
    pub nodesize: u32,
    /// Logical (== physical) address of the data block backing the
    /// regular file.
    pub file_data_logical: u64,
    include_root_dir: bool,
    compressed_file: bool,
}

impl TestImage {
    pub const FILE_CONTENT: &'static [u8] = b"hello world";
    pub const SYMLINK_TARGET: &'static [u8] = b"hello.txt";

    /// Tree nodes live at 2 MiB, above the Ext4 metadata zone of any
    /// geometry the tests use, so a rollback leaves a readable tree.
    pub const CHUNK_TREE_NODE: u64 = 0x200000;
    pub const ROOT_TREE_NODE: u64 = 0x204000;
    pub const FS_TREE_NODE: u64 = 0x208000;
    pub const EXTENT_TREE_NODE: u64 = 0x20C000;

    pub const FILE_INO: u64 = 257;
    pub const SYMLINK_INO: u64 = 258;
    pub const COMPRESSED_INO: u64 = 259;

    pub const COMPRESSED_DATA_LOGICAL: u64 = 33 * 1024 * 1024;

    /// Data placed high in the image, clear of any Ext4 metadata zone.
    pub fn minimal() -> TestImage {
        TestImage {
            image_size: 64 * 1024 * 1024,
            nodesize: 16384,
            file_data_logical: 32 * 1024 * 1024,
            include_root_dir: true,
            compressed_file: false,
        }
    }

    /// Data placed inside the Ext4 metadata zone to force relocation.
    pub fn with_conflicting_data() -> TestImage {
        TestImage {
            file_data_logical: 100 * 4096,
            ..TestImage::minimal()
        }
    }

    pub fn without_root_dir() -> TestImage {
        TestImage {
            include_root_dir: false,
            ..TestImage::minimal()
        }
    }

    /// Adds a zlib-compressed regular file ("notes.txt").
    pub fn with_compressed_file() -> TestImage {
        TestImage {
            compressed_file: true,
            ..TestImage::minimal()
        }
    }

    /// Plain contents of the compressed file.
    pub fn compressed_file_plain() -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog - ".repeat(200)
    }

    /// Write the image onto a zeroed device.
    pub fn write_to(&self, dev: &dyn BlockDevice) {
        for (offset, bytes) in self.sectors() {
            dev.write_at(offset, &bytes).unwrap();
        }
    }

    fn sectors(&self) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();

        // Chunk tree: one CHUNK_ITEM re-describing the bootstrap chunk.
        let chunk_payload = self.chunk_item_payload();
        out.push((
            Self::CHUNK_TREE_NODE,
            leaf_node(
                Self::CHUNK_TREE_NODE,
                crate::btrfs::CHUNK_TREE_OBJECTID,
                self.nodesize,
                &[TestItem::new(
                    crate::btrfs::FIRST_CHUNK_TREE_OBJECTID,
                    CHUNK_ITEM_KEY,
                    0,
                    chunk_payload,
                )],
            ),
        ));

        // Root tree: FS tree (5) and extent tree (2) roots.
        out.push((
            Self::ROOT_TREE_NODE,
            leaf_node(
                Self::ROOT_TREE_NODE,
                crate::btrfs::ROOT_TREE_OBJECTID,
                self.nodesize,
                &[
                    TestItem::new(
                        crate::btrfs::EXTENT_TREE_OBJECTID,
                        crate::btrfs::ROOT_ITEM_KEY,
                        0,
                        root_item(Self::EXTENT_TREE_NODE, 0),
                    ),
                    TestItem::new(
                        crate::btrfs::FS_TREE_OBJECTID,
                        crate::btrfs::ROOT_ITEM_KEY,
                        0,
                        root_item(Self::FS_TREE_NODE, 0),
                    ),
                ],
            ),
        ));

        // FS tree.
        let mut fs_items = Vec::new();
        if self.include_root_dir {
            fs_items.push(TestItem::new(
                256,
                crate::btrfs::INODE_ITEM_KEY,
                0,
                inode_item(0o40755, 0, 3),
            ));
            fs_items.push(TestItem::new(
                256,
                crate::btrfs::INODE_REF_KEY,
                256,
                inode_ref(0, b".."),
            ));
            fs_items.push(TestItem::new(
                256,
                DIR_INDEX_KEY,
                2,
                dir_index(Self::FILE_INO, 1, b"hello.txt"),
            ));
            fs_items.push(TestItem::new(
                256,
                DIR_INDEX_KEY,
                3,
                dir_index(Self::SYMLINK_INO, 7, b"link"),
            ));
            if self.compressed_file {
                fs_items.push(TestItem::new(
                    256,
                    DIR_INDEX_KEY,
                    4,
                    dir_index(Self::COMPRESSED_INO, 1, b"notes.txt"),
                ));
            }
        }
        fs_items.push(TestItem::new(
            Self::FILE_INO,
            crate::btrfs::INODE_ITEM_KEY,
            0,
            inode_item(0o100644, Self::FILE_CONTENT.len() as u64, 1),
        ));
        fs_items.push(TestItem::new(
            Self::FILE_INO,
            crate::btrfs::INODE_REF_KEY,
            256,
            inode_ref(2, b"hello.txt"),
        ));
        fs_items.push(TestItem::new(
            Self::FILE_INO,
            crate::btrfs::XATTR_ITEM_KEY,
            0,
            xattr_item(b"user.comment", b"tiny"),
        ));
        fs_items.push(TestItem::new(
            Self::FILE_INO,
            EXTENT_DATA_KEY,
            0,
            reg_extent(self.file_data_logical, 4096, 4096),
        ));
        fs_items.push(TestItem::new(
            Self::SYMLINK_INO,
            crate::btrfs::INODE_ITEM_KEY,
            0,
            inode_item(0o120777, Self::SYMLINK_TARGET.len() as u64, 1),
        ));
        fs_items.push(TestItem::new(
            Self::SYMLINK_INO,
            crate::btrfs::INODE_REF_KEY,
            256,
            inode_ref(3, b"link"),
        ));
        fs_items.push(TestItem::new(
            Self::SYMLINK_INO,
            EXTENT_DATA_KEY,
            0,
            inline_extent(Self::SYMLINK_TARGET),
        ));

        let compressed = if self.compressed_file {
            let plain = Self::compressed_file_plain();
            let mut enc =
                flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            std::io::Write::write_all(&mut enc, &plain).unwrap();
            let comp = enc.finish().unwrap();
            let aligned = (plain.len() as u64 + 4095) / 4096 * 4096;

            fs_items.push(TestItem::new(
                Self::COMPRESSED_INO,
                crate::btrfs::INODE_ITEM_KEY,
                0,
                inode_item(0o100644, plain.len() as u64, 1),
            ));
            fs_items.push(TestItem::new(
                Self::COMPRESSED_INO,
                crate::btrfs::INODE_REF_KEY,
                256,
                inode_ref(4, b"notes.txt"),
            ));
            fs_items.push(TestItem::new(
                Self::COMPRESSED_INO,
                EXTENT_DATA_KEY,
                0,
                compressed_extent(
                    Self::COMPRESSED_DATA_LOGICAL,
                    comp.len() as u64,
                    aligned,
                ),
            ));
            Some(comp)
        } else {
            None
        };

        out.push((
            Self::FS_TREE_NODE,
            leaf_node(
                Self::FS_TREE_NODE,
                crate::btrfs::FS_TREE_OBJECTID,
                self.nodesize,
                &fs_items,
            ),
        ));

        if let Some(comp) = compressed {
            out.push((Self::COMPRESSED_DATA_LOGICAL, comp));
        }

        // Extent tree: the file's data extent.
        out.push((
            Self::EXTENT_TREE_NODE,
            leaf_node(
                Self::EXTENT_TREE_NODE,
                crate::btrfs::EXTENT_TREE_OBJECTID,
                self.nodesize,
                &[TestItem::new(
                    self.file_data_logical,
                    EXTENT_ITEM_KEY,
                    4096,
                    extent_item(crate::btrfs::BLOCK_GROUP_DATA),
                )],
            ),
        ));

        // File data.
        let mut data_block = vec![0u8; 4096];
        data_block[..Self::FILE_CONTENT.len()].copy_from_slice(Self::FILE_CONTENT);
        out.push((self.file_data_logical, data_block));

        // Superblock last so tests can corrupt pieces afterwards.
        out.push((BTRFS_SUPER_OFFSET, self.superblock()));
        out
    }

    fn chunk_item_payload(&self) -> Vec<u8> {
        let mut chunk = BtrfsChunk::new_zeroed();
        chunk.length = Lu64::new(self.image_size);
        chunk.owner = Lu64::new(crate::btrfs::EXTENT_TREE_OBJECTID);
        chunk.stripe_len = Lu64::new(65536);
        chunk.chunk_type = Lu64::new(BLOCK_GROUP_SYSTEM);
        chunk.io_align = Lu32::new(4096);
        chunk.io_width = Lu32::new(4096);
        chunk.sector_size = Lu32::new(4096);
        chunk.num_stripes = Lu16::new(1);

        let mut stripe = BtrfsStripe::new_zeroed();
        stripe.devid = Lu64::new(1);
        stripe.offset = Lu64::new(0);

        let mut out = chunk.as_bytes().to_vec();
        out.extend_from_slice(stripe.as_bytes());
        out
    }

    fn superblock(&self) -> Vec<u8> {
        let mut sb = BtrfsSuperBlock::new_zeroed();
        sb.fsid = [0x42; 16];
        sb.bytenr = Lu64::new(BTRFS_SUPER_OFFSET);
        sb.magic = Lu64::new(BTRFS_MAGIC);
        sb.generation = Lu64::new(1);
        sb.root = Lu64::new(Self::ROOT_TREE_NODE);
        sb.chunk_root = Lu64::new(Self::CHUNK_TREE_NODE);
        sb.total_bytes = Lu64::new(self.image_size);
        sb.bytes_used = Lu64::new(1024 * 1024);
        sb.root_dir_objectid = Lu64::new(6);
        sb.num_devices = Lu64::new(1);
        sb.sectorsize = Lu32::new(4096);
        sb.nodesize = Lu32::new(self.nodesize);
        sb.leafsize = Lu32::new(self.nodesize);
        sb.stripesize = Lu32::new(4096);
        sb.csum_type = Lu16::new(0); // CRC32C
        sb.root_level = 0;
        sb.chunk_root_level = 0;
        sb.dev_item.devid = Lu64::new(1);
        sb.dev_item.total_bytes = Lu64::new(self.image_size);
        sb.dev_item.sector_size = Lu32::new(4096);
        sb.label[..6].copy_from_slice(b"testfs");

        // Embedded bootstrap chunk: key + chunk + stripe.
        let mut key = BtrfsDiskKey::new_zeroed();
        key.objectid = Lu64::new(crate::btrfs::FIRST_CHUNK_TREE_OBJECTID);
        key.item_type = CHUNK_ITEM_KEY;
        key.offset = Lu64::new(0);
        let payload = self.chunk_item_payload();
        let mut array = key.as_bytes().to_vec();
        array.extend_from_slice(&payload);
        sb.sys_chunk_array[..array.len()].copy_from_slice(&array);
        sb.sys_chunk_array_size = Lu32::new(array.len() as u32);

        let mut sector = vec![0u8; BTRFS_SUPER_SIZE];
        sector[..sb.as_bytes().len()].copy_from_slice(sb.as_bytes());
        let csum = crc32c(0, &sector[crate::btrfs::BTRFS_CSUM_SIZE..]);
        sector[..4].copy_from_slice(&csum.to_le_bytes());
        sector
    }
}
