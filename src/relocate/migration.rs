//! Migration map: the persistent record that makes a conversion
//! reversible.
//!
//! Near the device end live three things, newest last: the relocation
//! entry array, a fixed-offset footer tying magic + map offset + entry
//! count + CRC32C together, and a verbatim copy of the Btrfs primary
//! superblock. Rollback replays the entries in reverse, restores the
//! superblock, and erases the footer.

use device_io::BlockDevice;
use log::{info, warn};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::btrfs::structs::{Lu32, Lu64};
use crate::btrfs::{BTRFS_SUPER_OFFSET, BTRFS_SUPER_SIZE};
use crate::checksum::crc32c;
use crate::error::{ConvertError, Result};

use super::journal::{WalEntry, WAL_ENTRY_SIZE};
use super::{RelocationEntry, RelocationPlan};

pub const MIGRATION_MAGIC: [u8; 8] = *b"B2E4MAP1";

/// Footer sits two raw sectors back from the device end, the superblock
/// backup one; both land on an Ext4 block boundary.
const FOOTER_BACK: u64 = 8192;
const BACKUP_BACK: u64 = 4096;

const MAX_ENTRIES: u32 = 1024 * 1024;
const MAX_MAP_BYTES: u64 = 1024 * 1024 * 1024;

/// Copy chunk for the rollback path.
const ROLLBACK_CHUNK: usize = 1024 * 1024;

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
struct MigrationFooter {
    magic: [u8; 8],
    map_offset: Lu64,
    entry_count: Lu32,
    crc32: Lu32,
    padding: [u8; 40],
}

const FOOTER_SIZE: usize = 64;

/// `(device_size - 8192)` rounded down to the Ext4 block size.
pub fn footer_offset(device_size: u64, block_size: u32) -> u64 {
    let bs = u64::from(block_size);
    (device_size - FOOTER_BACK) / bs * bs
}

/// `(device_size - 4096)` rounded down to the Ext4 block size.
pub fn backup_offset(device_size: u64, block_size: u32) -> u64 {
    let bs = u64::from(block_size);
    (device_size - BACKUP_BACK) / bs * bs
}

/// Where the migration map region starts. Everything from here to the
/// device end must stay clear of Pass-3 allocations.
pub fn map_offset(device_size: u64, block_size: u32, entry_count: u32) -> u64 {
    let bs = u64::from(block_size);
    let map_size = u64::from(entry_count) * WAL_ENTRY_SIZE as u64;
    (footer_offset(device_size, block_size) - map_size) / bs * bs
}

fn serialize_entries(entries: &[RelocationEntry]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(entries.len() * WAL_ENTRY_SIZE);
    for entry in entries {
        let mut rec = WalEntry::new_zeroed();
        rec.src_offset = Lu64::new(entry.src_offset);
        rec.dst_offset = Lu64::new(entry.dst_offset);
        rec.length = Lu64::new(entry.length);
        rec.checksum = Lu32::new(entry.checksum);
        rec.seq = Lu32::new(entry.seq);
        rec.completed = u8::from(entry.completed);
        bytes.extend_from_slice(rec.as_bytes());
    }
    bytes
}

/// Persist the plan and the Btrfs superblock backup. Written before
/// any relocation touches the device — even for an empty plan, so a
/// rollback checkpoint always exists — and again after execution, so
/// the stored completed flags reflect the moves that really ran.
pub fn save(dev: &dyn BlockDevice, plan: &RelocationPlan, block_size: u32) -> Result<u64> {
    let device_size = dev.size();
    let count = plan.entries.len() as u32;

    if count > MAX_ENTRIES {
        return Err(ConvertError::resource_limit(format!(
            "migration plan has {} entries, exceeds the {} cap",
            count, MAX_ENTRIES
        )));
    }
    let bytes = serialize_entries(&plan.entries);
    if bytes.len() as u64 > MAX_MAP_BYTES {
        return Err(ConvertError::resource_limit(
            "migration map exceeds 1 GiB".to_string(),
        ));
    }

    // Superblock backup first: rollback depends on it.
    let mut sb = vec![0u8; BTRFS_SUPER_SIZE];
    dev.read_at(BTRFS_SUPER_OFFSET, &mut sb)?;
    dev.write_at(backup_offset(device_size, block_size), &sb)?;

    let map_at = map_offset(device_size, block_size, count);
    if !bytes.is_empty() {
        dev.write_at(map_at, &bytes)?;
    }

    let mut footer = MigrationFooter::new_zeroed();
    footer.magic = MIGRATION_MAGIC;
    footer.map_offset = Lu64::new(map_at);
    footer.entry_count = Lu32::new(count);
    footer.crc32 = Lu32::new(crc32c(0, &bytes));
    dev.write_at(footer_offset(device_size, block_size), footer.as_bytes())?;
    dev.sync()?;

    info!(
        "migration map saved: {} entries at 0x{:x}, footer at 0x{:x}",
        count,
        map_at,
        footer_offset(device_size, block_size)
    );
    Ok(map_at)
}

/// Reverse a conversion: undo every recorded move (newest first),
/// restore the Btrfs superblock, erase the footer.
pub fn rollback(dev: &dyn BlockDevice, block_size: u32) -> Result<()> {
    let device_size = dev.size();
    let footer_at = footer_offset(device_size, block_size);

    let mut buf = [0u8; FOOTER_SIZE];
    dev.read_at(footer_at, &mut buf)?;
    let footer = MigrationFooter::read_from(&buf[..]).unwrap();

    if footer.magic != MIGRATION_MAGIC {
        return Err(ConvertError::bad_format(
            "no valid migration map found (already rolled back or never converted)".to_string(),
        ));
    }

    let count = footer.entry_count.get();
    info!("found migration map with {} entries", count);

    if count > 0 {
        let map_size = u64::from(count) * WAL_ENTRY_SIZE as u64;
        if count > MAX_ENTRIES || map_size > MAX_MAP_BYTES {
            return Err(ConvertError::corrupt(
                "migration map implausibly large".to_string(),
            ));
        }

        let mut bytes = vec![0u8; map_size as usize];
        dev.read_at(footer.map_offset.get(), &mut bytes)?;

        let computed = crc32c(0, &bytes);
        if computed != footer.crc32.get() {
            return Err(ConvertError::bad_format(format!(
                "migration map CRC mismatch (stored 0x{:08x}, computed 0x{:08x}) — \
                 rollback aborted to prevent corruption",
                footer.crc32.get(),
                computed
            )));
        }

        let mut copy_buf = vec![0u8; ROLLBACK_CHUNK];
        for seq in (0..count).rev() {
            let at = seq as usize * WAL_ENTRY_SIZE;
            let entry = WalEntry::read_from(&bytes[at..at + WAL_ENTRY_SIZE]).unwrap();
            let length = entry.length.get();
            let src = entry.src_offset.get();
            let dst = entry.dst_offset.get();

            // A move that never ran left its source intact; copying the
            // unwritten destination back would shred it.
            if entry.completed == 0 {
                continue;
            }
            if length == 0 {
                continue;
            }
            if src > device_size
                || dst > device_size
                || length > device_size
                || src > device_size - length
                || dst > device_size - length
            {
                warn!("migration entry {} has invalid offsets, skipped", seq);
                continue;
            }

            let mut remaining = length;
            let mut from = dst;
            let mut to = src;
            while remaining > 0 {
                let chunk = remaining.min(copy_buf.len() as u64) as usize;
                dev.read_at(from, &mut copy_buf[..chunk])?;
                dev.write_at(to, &copy_buf[..chunk])?;
                from += chunk as u64;
                to += chunk as u64;
                remaining -= chunk as u64;
            }
        }
        info!("block relocations reversed");
    }

    erase_checkpoint(dev, block_size)?;
    info!("rollback complete: btrfs superblock restored");
    Ok(())
}

/// Restore the Btrfs superblock from its backup and erase the footer.
/// Used directly when the relocation WAL already reversed the moves.
pub fn erase_checkpoint(dev: &dyn BlockDevice, block_size: u32) -> Result<()> {
    let device_size = dev.size();

    let mut sb = vec![0u8; BTRFS_SUPER_SIZE];
    dev.read_at(backup_offset(device_size, block_size), &mut sb)?;
    dev.write_at(BTRFS_SUPER_OFFSET, &sb)?;

    // Erase the footer so a second rollback is a clean no-op error.
    dev.write_at(footer_offset(device_size, block_size), &[0u8; FOOTER_SIZE])?;
    dev.sync()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use device_io::MemDevice;

    const SIZE: usize = 16 * 1024 * 1024;
    const BS: u32 = 4096;

    fn plan_with(entries: Vec<RelocationEntry>) -> RelocationPlan {
        let total = entries.iter().map(|e| e.length).sum();
        RelocationPlan {
            entries,
            total_bytes_to_move: total,
        }
    }

    #[test]
    fn offsets_round_down_to_the_block_size() {
        let size = SIZE as u64;
        for bs in [1024u32, 2048, 4096] {
            let footer = footer_offset(size, bs);
            let backup = backup_offset(size, bs);
            assert_eq!(footer % u64::from(bs), 0);
            assert_eq!(backup % u64::from(bs), 0);
            assert_eq!(footer, size - FOOTER_BACK);
            assert_eq!(backup, size - BACKUP_BACK);
            assert!(footer + FOOTER_SIZE as u64 <= backup);
            assert!(backup + BTRFS_SUPER_SIZE as u64 <= size);
            // The map packs below the footer on the same boundary.
            let map = map_offset(size, bs, 100);
            assert_eq!(map % u64::from(bs), 0);
            assert!(map + 100 * WAL_ENTRY_SIZE as u64 <= footer);
        }

        // An unaligned device tail still lands on block boundaries.
        let ragged = size + 1536;
        for bs in [1024u32, 2048, 4096] {
            assert_eq!(footer_offset(ragged, bs) % u64::from(bs), 0);
            assert_eq!(backup_offset(ragged, bs) % u64::from(bs), 0);
            assert!(backup_offset(ragged, bs) + BTRFS_SUPER_SIZE as u64 <= ragged);
        }
    }

    #[test]
    fn zero_entry_plan_still_writes_a_footer() {
        let dev = MemDevice::new(SIZE);
        dev.write_at(BTRFS_SUPER_OFFSET, b"FAKE-SUPERBLOCK").unwrap();

        save(&dev, &plan_with(Vec::new()), BS).unwrap();

        let mut footer = [0u8; FOOTER_SIZE];
        dev.read_at(footer_offset(SIZE as u64, BS), &mut footer)
            .unwrap();
        assert_eq!(&footer[..8], b"B2E4MAP1");

        // Rollback restores the superblock and erases the footer.
        dev.write_at(BTRFS_SUPER_OFFSET, b"CLOBBERED!!!!!!").unwrap();
        rollback(&dev, BS).unwrap();
        let mut sb = [0u8; 15];
        dev.read_at(BTRFS_SUPER_OFFSET, &mut sb).unwrap();
        assert_eq!(&sb, b"FAKE-SUPERBLOCK");

        assert!(matches!(rollback(&dev, BS), Err(ConvertError::BadFormat(_))));
    }

    #[test]
    fn save_and_rollback_reverse_the_moves() {
        let dev = MemDevice::new(SIZE);
        dev.write_at(BTRFS_SUPER_OFFSET, &[0xBB; 64]).unwrap();
        dev.write_at(40960, &[0x77; 4096]).unwrap(); // original data

        let mut entry = RelocationEntry {
            src_offset: 40960,
            dst_offset: 81920,
            length: 4096,
            checksum: 0,
            seq: 0,
            completed: true,
        };
        // Simulate the executed move.
        dev.write_at(81920, &[0x77; 4096]).unwrap();
        entry.checksum = crc32c(0, &[0x77; 4096]);
        save(&dev, &plan_with(vec![entry]), BS).unwrap();
        dev.write_at(40960, &[0x00; 4096]).unwrap(); // metadata overwrote src

        rollback(&dev, BS).unwrap();

        let mut buf = vec![0u8; 4096];
        dev.read_at(40960, &mut buf).unwrap();
        assert_eq!(buf, vec![0x77; 4096]);
    }

    #[test]
    fn save_and_rollback_work_at_1024_byte_blocks() {
        let dev = MemDevice::new(SIZE);
        dev.write_at(BTRFS_SUPER_OFFSET, b"SMALL-BLOCK-FS!").unwrap();
        dev.write_at(40960, &[0x3C; 1024]).unwrap();

        let mut entry = RelocationEntry {
            src_offset: 40960,
            dst_offset: 81920,
            length: 1024,
            checksum: 0,
            seq: 0,
            completed: true,
        };
        dev.write_at(81920, &[0x3C; 1024]).unwrap();
        entry.checksum = crc32c(0, &[0x3C; 1024]);
        save(&dev, &plan_with(vec![entry]), 1024).unwrap();
        dev.write_at(40960, &[0x00; 1024]).unwrap();

        // The footer sits where the 1024-block geometry puts it.
        let mut footer = [0u8; FOOTER_SIZE];
        dev.read_at(footer_offset(SIZE as u64, 1024), &mut footer)
            .unwrap();
        assert_eq!(&footer[..8], b"B2E4MAP1");

        rollback(&dev, 1024).unwrap();
        let mut buf = vec![0u8; 1024];
        dev.read_at(40960, &mut buf).unwrap();
        assert_eq!(buf, vec![0x3C; 1024]);
        let mut sb = [0u8; 15];
        dev.read_at(BTRFS_SUPER_OFFSET, &mut sb).unwrap();
        assert_eq!(&sb, b"SMALL-BLOCK-FS!");
    }

    #[test]
    fn corrupted_map_aborts_rollback() {
        let dev = MemDevice::new(SIZE);
        let entry = RelocationEntry {
            src_offset: 40960,
            dst_offset: 81920,
            length: 4096,
            checksum: 0,
            seq: 0,
            completed: true,
        };
        let map_at = save(&dev, &plan_with(vec![entry]), BS).unwrap();

        // Flip a byte in the stored entries.
        let mut b = [0u8; 1];
        dev.read_at(map_at, &mut b).unwrap();
        b[0] ^= 0xFF;
        dev.write_at(map_at, &b).unwrap();

        assert!(matches!(rollback(&dev, BS), Err(ConvertError::BadFormat(_))));
    }
}
