//! Write-ahead log for in-progress block moves.
//!
//! A checksummed header at a fixed device offset followed by one
//! 40-byte record per move. A move is logged before its destination
//! write starts and marked complete after; replay walks completed
//! entries newest-first and copies each one back.

use device_io::BlockDevice;
use log::{info, warn};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::btrfs::structs::{Lu32, Lu64};
use crate::checksum::crc32c;
use crate::error::{ConvertError, Result};

use super::RelocationEntry;

pub const WAL_MAGIC: u32 = 0x42324534; /* "B2E4" */
pub const WAL_VERSION: u32 = 1;

pub const WAL_STATE_CLEAN: u32 = 0;
pub const WAL_STATE_IN_PROGRESS: u32 = 1;
pub const WAL_STATE_ROLLBACK: u32 = 2;

/// Replay copies are bounded so a corrupt entry cannot demand an
/// absurd buffer.
const REPLAY_CHUNK: u64 = 16 * 1024 * 1024;

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
struct WalHeader {
    magic: Lu32,
    version: Lu32,
    entry_count: Lu32,
    state: Lu32,
    journal_offset: Lu64,
    checksum: Lu32,
}

const WAL_HEADER_SIZE: usize = 28;

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct WalEntry {
    pub src_offset: Lu64,
    pub dst_offset: Lu64,
    pub length: Lu64,
    pub checksum: Lu32,
    pub seq: Lu32,
    pub completed: u8,
    pub padding: [u8; 7],
}

pub const WAL_ENTRY_SIZE: usize = 40;

fn header_checksum(hdr: &WalHeader) -> u32 {
    let mut copy = *hdr;
    copy.checksum = Lu32::new(0);
    crc32c(0, copy.as_bytes())
}

fn entry_offset(journal_offset: u64, seq: u32) -> u64 {
    journal_offset + WAL_HEADER_SIZE as u64 + u64::from(seq) * WAL_ENTRY_SIZE as u64
}

/// Bytes a journal with `capacity` entries occupies on disk.
pub fn region_size(capacity: u32) -> u64 {
    WAL_HEADER_SIZE as u64 + u64::from(capacity) * WAL_ENTRY_SIZE as u64
}

pub struct RelocJournal {
    offset: u64,
    entries_logged: u32,
    capacity: u32,
}

impl RelocJournal {
    /// Stamp a fresh IN_PROGRESS header at `offset` and sync it down.
    pub fn create(dev: &dyn BlockDevice, offset: u64, capacity: u32) -> Result<RelocJournal> {
        let journal = RelocJournal {
            offset,
            entries_logged: 0,
            capacity,
        };
        journal.write_header(dev, WAL_STATE_IN_PROGRESS, 0)?;
        dev.sync()?;
        Ok(journal)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn write_header(&self, dev: &dyn BlockDevice, state: u32, entry_count: u32) -> Result<()> {
        let mut hdr = WalHeader::new_zeroed();
        hdr.magic = Lu32::new(WAL_MAGIC);
        hdr.version = Lu32::new(WAL_VERSION);
        hdr.entry_count = Lu32::new(entry_count);
        hdr.state = Lu32::new(state);
        hdr.journal_offset = Lu64::new(self.offset);
        hdr.checksum = Lu32::new(header_checksum(&hdr));
        dev.write_at(self.offset, hdr.as_bytes())?;
        Ok(())
    }

    /// Log a move. Durable before the caller touches the destination.
    pub fn log_move(&mut self, dev: &dyn BlockDevice, entry: &RelocationEntry) -> Result<()> {
        if self.entries_logged >= self.capacity {
            return Err(ConvertError::resource_limit(
                "relocation journal capacity exceeded".to_string(),
            ));
        }

        let mut rec = WalEntry::new_zeroed();
        rec.src_offset = Lu64::new(entry.src_offset);
        rec.dst_offset = Lu64::new(entry.dst_offset);
        rec.length = Lu64::new(entry.length);
        rec.checksum = Lu32::new(entry.checksum);
        rec.seq = Lu32::new(entry.seq);
        rec.completed = 0;

        dev.write_at(entry_offset(self.offset, entry.seq), rec.as_bytes())?;
        self.entries_logged += 1;
        self.write_header(dev, WAL_STATE_IN_PROGRESS, self.entries_logged)?;
        dev.sync()?;
        Ok(())
    }

    /// Flip the completed byte of one entry (offset 32 in the record).
    pub fn mark_complete(&self, dev: &dyn BlockDevice, seq: u32) -> Result<()> {
        let completed_at = entry_offset(self.offset, seq) + 32;
        dev.write_at(completed_at, &[1u8])?;
        Ok(())
    }

    /// Stamp the journal CLEAN.
    pub fn clear(&self, dev: &dyn BlockDevice) -> Result<()> {
        self.write_header(dev, WAL_STATE_CLEAN, 0)?;
        dev.sync()?;
        Ok(())
    }

    /// Reverse every completed move with seq <= `limit_seq`, newest
    /// first, then stamp the journal CLEAN.
    pub fn replay_partial(&self, dev: &dyn BlockDevice, limit_seq: u32) -> Result<()> {
        replay_range(dev, self.offset, Some(limit_seq))
    }
}

/// Inspect a journal location: number of incomplete entries when an
/// IN_PROGRESS journal exists, 0 when clean/absent/corrupt.
pub fn check(dev: &dyn BlockDevice, journal_offset: u64) -> Result<u32> {
    let Some(hdr) = read_valid_header(dev, journal_offset)? else {
        return Ok(0);
    };
    if hdr.state.get() != WAL_STATE_IN_PROGRESS {
        return Ok(0);
    }

    let mut incomplete = 0u32;
    for seq in 0..hdr.entry_count.get() {
        let mut rec = [0u8; WAL_ENTRY_SIZE];
        dev.read_at(entry_offset(journal_offset, seq), &mut rec)?;
        let entry = WalEntry::read_from(&rec[..]).unwrap();
        if entry.completed == 0 {
            incomplete += 1;
        }
    }
    Ok(incomplete)
}

/// Replay every completed entry of the journal at `journal_offset`.
pub fn replay(dev: &dyn BlockDevice, journal_offset: u64) -> Result<()> {
    replay_range(dev, journal_offset, None)
}

fn read_valid_header(dev: &dyn BlockDevice, journal_offset: u64) -> Result<Option<WalHeader>> {
    let mut buf = [0u8; WAL_HEADER_SIZE];
    dev.read_at(journal_offset, &mut buf)?;
    let hdr = WalHeader::read_from(&buf[..]).unwrap();
    if hdr.magic.get() != WAL_MAGIC {
        return Ok(None);
    }
    let stored = hdr.checksum.get();
    if stored != header_checksum(&hdr) {
        warn!(
            "relocation journal header checksum mismatch at 0x{:x}, ignoring journal",
            journal_offset
        );
        return Ok(None);
    }
    Ok(Some(hdr))
}

fn replay_range(
    dev: &dyn BlockDevice,
    journal_offset: u64,
    limit_seq: Option<u32>,
) -> Result<()> {
    let Some(hdr) = read_valid_header(dev, journal_offset)? else {
        return Ok(()); // nothing to replay
    };

    let count = hdr.entry_count.get();
    let start = match limit_seq {
        Some(limit) => limit.min(count.saturating_sub(1)),
        None => count.saturating_sub(1),
    };
    if count == 0 {
        return clear_at(dev, journal_offset);
    }

    info!("replaying relocation journal ({} entries)", count);
    let dev_size = dev.size();
    let mut buf = vec![0u8; REPLAY_CHUNK.min(dev_size) as usize];

    for seq in (0..=start).rev() {
        let mut rec = [0u8; WAL_ENTRY_SIZE];
        dev.read_at(entry_offset(journal_offset, seq), &mut rec)?;
        let entry = WalEntry::read_from(&rec[..]).unwrap();
        if entry.completed == 0 || entry.length.get() == 0 {
            continue;
        }

        let length = entry.length.get();
        let src = entry.src_offset.get();
        let dst = entry.dst_offset.get();

        // A corrupt record must not walk off the device.
        if src > dev_size
            || dst > dev_size
            || length > dev_size
            || src > dev_size - length
            || dst > dev_size - length
        {
            warn!(
                "journal entry {} has invalid offsets (src=0x{:x} dst=0x{:x} len={}), skipped",
                seq, src, dst, length
            );
            continue;
        }

        // Completed move: copy dst back to src in bounded chunks.
        let mut remaining = length;
        let mut from = dst;
        let mut to = src;
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            dev.read_at(from, &mut buf[..chunk])?;
            dev.write_at(to, &buf[..chunk])?;
            from += chunk as u64;
            to += chunk as u64;
            remaining -= chunk as u64;
        }
    }

    clear_at(dev, journal_offset)
}

fn clear_at(dev: &dyn BlockDevice, journal_offset: u64) -> Result<()> {
    let mut hdr = WalHeader::new_zeroed();
    hdr.magic = Lu32::new(WAL_MAGIC);
    hdr.version = Lu32::new(WAL_VERSION);
    hdr.entry_count = Lu32::new(0);
    hdr.state = Lu32::new(WAL_STATE_CLEAN);
    hdr.journal_offset = Lu64::new(journal_offset);
    hdr.checksum = Lu32::new(header_checksum(&hdr));
    dev.write_at(journal_offset, hdr.as_bytes())?;
    dev.sync()?;
    Ok(())
}
