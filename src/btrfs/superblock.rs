//! Btrfs superblock parsing and validation.

use device_io::BlockDevice;
use log::info;
use zerocopy::FromBytes;

use crate::checksum::verify_btrfs_csum;
use crate::error::{ConvertError, Result};

use super::structs::BtrfsSuperBlock;
use super::{CsumType, BTRFS_CSUM_SIZE, BTRFS_MAGIC, BTRFS_SUPER_OFFSET, BTRFS_SUPER_SIZE};

/// Validated superblock fields the rest of the pipeline needs.
#[derive(Debug, Clone)]
pub struct SuperblockInfo {
    pub fsid: [u8; 16],
    pub generation: u64,
    pub root: u64,
    pub root_level: u8,
    pub chunk_root: u64,
    pub chunk_root_level: u8,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    pub csum_type: CsumType,
    pub label: Vec<u8>,
    pub sys_chunk_array: Vec<u8>,
}

/// Read and validate the primary superblock at offset 0x10000.
pub fn read_superblock(dev: &dyn BlockDevice) -> Result<SuperblockInfo> {
    let mut sector = [0u8; BTRFS_SUPER_SIZE];
    dev.read_at(BTRFS_SUPER_OFFSET, &mut sector)?;

    let sb = BtrfsSuperBlock::read_from_prefix(&sector[..])
        .ok_or_else(|| ConvertError::bad_format("superblock: short read"))?;

    let magic = sb.magic.get();
    if magic != BTRFS_MAGIC {
        return Err(ConvertError::bad_format(format!(
            "superblock at 0x{:x}: invalid magic 0x{:016x} (expected 0x{:016x})",
            BTRFS_SUPER_OFFSET, magic, BTRFS_MAGIC
        )));
    }

    let csum_type = CsumType::try_from(sb.csum_type.get()).map_err(|_| {
        ConvertError::unsupported(format!(
            "superblock: unknown checksum type {}",
            sb.csum_type.get()
        ))
    })?;

    // Checksum covers the whole 4 KiB sector minus the csum field.
    verify_btrfs_csum(
        csum_type,
        &sb.csum,
        &sector[BTRFS_CSUM_SIZE..],
        "superblock",
    )?;

    let sectorsize = sb.sectorsize.get();
    if sectorsize != 4096 {
        return Err(ConvertError::unsupported(format!(
            "superblock: sector size {} (only 4096 supported)",
            sectorsize
        )));
    }

    let nodesize = sb.nodesize.get();
    if nodesize < sectorsize || nodesize > 64 * 1024 || nodesize % sectorsize != 0 {
        return Err(ConvertError::bad_format(format!(
            "superblock: suspicious node size {} (sector {}, supported range [{}, {}])",
            nodesize,
            sectorsize,
            sectorsize,
            64 * 1024
        )));
    }

    let num_devices = sb.num_devices.get();
    if num_devices != 1 {
        return Err(ConvertError::unsupported(format!(
            "multi-device btrfs not supported (found {} devices)",
            num_devices
        )));
    }

    let label_len = sb.label.iter().position(|&b| b == 0).unwrap_or(sb.label.len());
    let label = sb.label[..label_len].to_vec();

    let array_size = sb.sys_chunk_array_size.get() as usize;
    if array_size == 0 || array_size > sb.sys_chunk_array.len() {
        return Err(ConvertError::bad_format(format!(
            "superblock: invalid sys_chunk_array_size {} (max {})",
            array_size,
            sb.sys_chunk_array.len()
        )));
    }

    info!(
        "btrfs superblock: label={:?} generation={} total={} used={} nodesize={} csum={}",
        String::from_utf8_lossy(&label),
        sb.generation.get(),
        sb.total_bytes.get(),
        sb.bytes_used.get(),
        nodesize,
        csum_type.name()
    );

    Ok(SuperblockInfo {
        fsid: sb.fsid,
        generation: sb.generation.get(),
        root: sb.root.get(),
        root_level: sb.root_level,
        chunk_root: sb.chunk_root.get(),
        chunk_root_level: sb.chunk_root_level,
        total_bytes: sb.total_bytes.get(),
        bytes_used: sb.bytes_used.get(),
        sectorsize,
        nodesize,
        csum_type,
        label,
        sys_chunk_array: sb.sys_chunk_array[..array_size].to_vec(),
    })
}
