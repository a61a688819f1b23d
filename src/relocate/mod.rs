//! Pass 2: move Btrfs data out of the way of Ext4 metadata.
//!
//! The planner finds every file extent that touches a reserved metadata
//! block and books a destination for its whole physical range, splitting
//! the in-memory extent when only fragmented free space is left. The
//! executor performs the journaled copies and rewrites the in-memory
//! extent pointers so Pass 3 never notices the move.

use std::collections::HashMap;

use device_io::BlockDevice;
use log::{info, warn};

use crate::btrfs::model::{FileExtent, FsModel};
use crate::btrfs::CompressionType;
use crate::checksum::crc32c;
use crate::error::{ConvertError, Result};
use crate::ext4::planner::Layout;
use crate::mem_policy::MemoryPolicy;

pub mod journal;
pub mod migration;

use journal::RelocJournal;

/// Copy granularity for relocation I/O.
const COPY_CHUNK: usize = 16 * 1024 * 1024;

/// One contiguous block move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub length: u64,
    pub checksum: u32,
    pub seq: u32,
    pub completed: bool,
}

#[derive(Debug, Default)]
pub struct RelocationPlan {
    pub entries: Vec<RelocationEntry>,
    pub total_bytes_to_move: u64,
}

impl RelocationPlan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn bit(bitmap: &[u8], block: u64) -> bool {
    bitmap[(block / 8) as usize] & (1 << (block % 8)) != 0
}

fn set(bitmap: &mut [u8], block: u64) {
    bitmap[(block / 8) as usize] |= 1 << (block % 8);
}

/// Free-space tracker for relocation destinations: reserved metadata
/// and every Btrfs-occupied block are taken, the rest is fair game.
struct FreeSpace {
    bitmap: Vec<u8>,
    total_blocks: u64,
    cursor: u64,
    free_count: u64,
}

impl FreeSpace {
    fn new(layout: &Layout, model: &FsModel) -> FreeSpace {
        let bs = u64::from(layout.block_size);
        let mut bitmap = layout.reserved_bitmap();

        for fe in &model.inodes {
            for ext in &fe.extents {
                if ext.is_blockless() {
                    continue;
                }
                let Some(phys) = model.chunk_map.resolve(ext.disk_bytenr) else {
                    continue;
                };
                let start = phys / bs;
                let end = (phys + ext.disk_num_bytes + bs - 1) / bs;
                for b in start..end.min(layout.total_blocks) {
                    set(&mut bitmap, b);
                }
            }
        }

        // Every allocated Btrfs extent — metadata included — is off
        // limits: a destination landing on a tree node would leave a
        // rolled-back filesystem unreadable.
        for used in &model.used_blocks.extents {
            let Some(phys) = model.chunk_map.resolve(used.start) else {
                continue;
            };
            let start = phys / bs;
            let end = (phys + used.length + bs - 1) / bs;
            for b in start..end.min(layout.total_blocks) {
                set(&mut bitmap, b);
            }
        }

        let mut free_count = 0u64;
        for b in 0..layout.total_blocks {
            if !bit(&bitmap, b) {
                free_count += 1;
            }
        }

        FreeSpace {
            bitmap,
            total_blocks: layout.total_blocks,
            cursor: 0,
            free_count,
        }
    }

    /// Claim up to `want` consecutive free blocks. Returns the start
    /// and the actual run length. The cursor wraps to the beginning
    /// before giving up, so every free block stays reachable.
    fn alloc_run(&mut self, want: u32) -> Option<(u64, u32)> {
        if self.free_count == 0 || want == 0 {
            return None;
        }

        let saved_cursor = self.cursor;
        let mut run_start = 0u64;
        let mut run = 0u32;
        let mut wrapped = false;

        loop {
            if self.cursor >= self.total_blocks {
                if wrapped {
                    break;
                }
                self.cursor = 0;
                wrapped = true;
                run = 0;
                continue;
            }
            if wrapped && self.cursor >= saved_cursor {
                break;
            }

            if !bit(&self.bitmap, self.cursor) {
                if run == 0 {
                    run_start = self.cursor;
                }
                run += 1;
                self.cursor += 1;
                if run == want {
                    break;
                }
            } else {
                if run > 0 {
                    self.cursor += 1;
                    break;
                }
                self.cursor += 1;
            }
        }

        if run == 0 {
            return None;
        }
        for b in run_start..run_start + u64::from(run) {
            set(&mut self.bitmap, b);
        }
        self.free_count -= u64::from(run);
        Some((run_start, run))
    }
}

/// Build the relocation plan. Extents whose range touches a reserved
/// block are booked wholesale; when the free pool is fragmented, the
/// extent is split in the model so each fragment stays contiguous.
///
/// `device_size` bounds a tail reservation covering the migration map,
/// its footer, the superblock backup, and the relocation WAL, so no
/// destination lands where the rollback state will be written.
pub fn plan(layout: &Layout, model: &mut FsModel, device_size: u64) -> Result<RelocationPlan> {
    let bs = u64::from(layout.block_size);
    let conflict_bitmap = layout.reserved_bitmap();
    let mut fspace = FreeSpace::new(layout, model);

    // Upper bound on entries: one per conflicting block. Reserve the
    // device tail that the checkpoint machinery will occupy.
    let mut max_entries = 0u64;
    for fe in &model.inodes {
        for ext in &fe.extents {
            if ext.is_blockless() {
                continue;
            }
            let Some(phys) = model.chunk_map.resolve(ext.disk_bytenr) else {
                continue;
            };
            let start = phys / bs;
            let end = (phys + ext.disk_num_bytes + bs - 1) / bs;
            for b in start..end.min(layout.total_blocks) {
                if bit(&conflict_bitmap, b) {
                    max_entries += 1;
                }
            }
        }
    }
    let max_entries = max_entries.min(u64::from(u32::MAX)) as u32;
    let protect_start = migration::map_offset(device_size, layout.block_size, max_entries)
        .saturating_sub(journal::region_size(max_entries.max(1)))
        / bs
        * bs;
    for b in (protect_start / bs)..layout.total_blocks {
        if !bit(&fspace.bitmap, b) {
            fspace.free_count -= 1;
        }
        set(&mut fspace.bitmap, b);
    }

    info!(
        "relocation planning: {} free blocks available",
        fspace.free_count
    );

    let mut plan = RelocationPlan::default();

    for idx in 0..model.inodes.len() {
        let mut e = 0usize;
        while e < model.inodes[idx].extents.len() {
            let (phys, blocks) = {
                let ext = &model.inodes[idx].extents[e];
                if ext.is_blockless() {
                    e += 1;
                    continue;
                }
                let Some(phys) = model.chunk_map.resolve(ext.disk_bytenr) else {
                    e += 1;
                    continue;
                };
                let blocks = ((ext.disk_num_bytes + bs - 1) / bs).max(1) as u32;
                (phys, blocks)
            };

            let start_block = phys / bs;
            let conflicts = (0..u64::from(blocks))
                .any(|b| start_block + b < layout.total_blocks && bit(&conflict_bitmap, start_block + b));
            if !conflicts {
                e += 1;
                continue;
            }

            // Book destination runs covering the whole extent.
            let mut runs: Vec<(u64, u32)> = Vec::new();
            let mut remaining = blocks;
            while remaining > 0 {
                let Some((dst, got)) = fspace.alloc_run(remaining) else {
                    return Err(ConvertError::insufficient_space(format!(
                        "not enough free space to relocate extent at 0x{:x}",
                        phys
                    )));
                };
                runs.push((dst, got));
                remaining -= got;
            }

            if runs.len() > 1 {
                // A compressed stream cannot survive fragmentation: its
                // bytes are only meaningful as one contiguous run.
                if model.inodes[idx].extents[e].compression != CompressionType::None {
                    return Err(ConvertError::insufficient_space(format!(
                        "no contiguous destination for compressed extent at 0x{:x}",
                        phys
                    )));
                }
                split_extent(&mut model.inodes[idx].extents, e, &runs, bs);
            }

            let mut src = phys;
            for &(dst, got) in &runs {
                let length = u64::from(got) * bs;
                plan.entries.push(RelocationEntry {
                    src_offset: src,
                    dst_offset: dst * bs,
                    length,
                    checksum: 0,
                    seq: 0,
                    completed: false,
                });
                plan.total_bytes_to_move += length;
                src += length;
            }

            e += runs.len();
        }
    }

    // Sort by source offset, then coalesce adjacent moves.
    plan.entries.sort_by_key(|re| re.src_offset);
    let mut coalesced: Vec<RelocationEntry> = Vec::with_capacity(plan.entries.len());
    for entry in plan.entries.drain(..) {
        if let Some(last) = coalesced.last_mut() {
            if last.src_offset + last.length == entry.src_offset
                && last.dst_offset + last.length == entry.dst_offset
            {
                last.length += entry.length;
                continue;
            }
        }
        coalesced.push(entry);
    }
    for (seq, entry) in coalesced.iter_mut().enumerate() {
        entry.seq = seq as u32;
    }
    plan.entries = coalesced;

    info!(
        "relocation plan: {} entries, {} bytes to move",
        plan.entries.len(),
        plan.total_bytes_to_move
    );
    Ok(plan)
}

/// Split `extents[at]` into one sub-extent per destination run, each
/// still pointing at its slice of the old location.
fn split_extent(extents: &mut Vec<FileExtent>, at: usize, runs: &[(u64, u32)], bs: u64) {
    let original = extents[at].clone();
    let mut pieces = Vec::with_capacity(runs.len());

    let mut consumed = 0u64; // bytes of the original covered so far
    for &(_, got) in runs {
        let piece_disk = (u64::from(got) * bs).min(original.disk_num_bytes - consumed);
        let piece_logical = piece_disk.min(original.num_bytes.saturating_sub(consumed));
        pieces.push(FileExtent {
            file_offset: original.file_offset + consumed,
            disk_bytenr: original.disk_bytenr + consumed,
            disk_num_bytes: piece_disk,
            num_bytes: piece_logical,
            ram_bytes: piece_logical,
            compression: original.compression,
            extent_type: original.extent_type,
            inline_data: None,
        });
        consumed += piece_disk;
    }

    extents.splice(at..at + 1, pieces);
}

/// Execute the plan: journaled copies, then in-memory extent rewrite.
pub fn execute(
    plan: &mut RelocationPlan,
    dev: &dyn BlockDevice,
    model: &mut FsModel,
    block_size: u32,
    wal: &mut RelocJournal,
    policy: Option<&MemoryPolicy>,
) -> Result<()> {
    if plan.entries.is_empty() {
        info!("no blocks need relocation");
        return Ok(());
    }

    info!("executing {} block relocations", plan.entries.len());
    let chunk_map = std::mem::take(&mut model.chunk_map);
    let result = execute_inner(plan, dev, model, &chunk_map, block_size, wal, policy);
    model.chunk_map = chunk_map;
    result
}

fn execute_inner(
    plan: &mut RelocationPlan,
    dev: &dyn BlockDevice,
    model: &mut FsModel,
    chunk_map: &crate::btrfs::chunk::ChunkMap,
    block_size: u32,
    wal: &mut RelocJournal,
    policy: Option<&MemoryPolicy>,
) -> Result<()> {
    let bs = u64::from(block_size);

    // Physical start block offset → every extent referencing it
    // (multi-valued: CoW-shared extents point at the same blocks).
    let extent_hash: Option<HashMap<u64, Vec<(usize, usize)>>> = {
        let total_extents: usize = model.inodes.iter().map(|fe| fe.extents.len()).sum();
        let estimate = (total_extents * 2 * 24) as u64;
        match policy {
            Some(p) if p.would_exceed(estimate) => {
                warn!("memory pressure: extent hash disabled, using linear rewrites");
                None
            }
            other => {
                if let Some(p) = other {
                    p.note_alloc(estimate);
                }
                let mut hash: HashMap<u64, Vec<(usize, usize)>> = HashMap::new();
                for (fi, fe) in model.inodes.iter().enumerate() {
                    for (ei, ext) in fe.extents.iter().enumerate() {
                        if ext.is_blockless() {
                            continue;
                        }
                        let Some(phys) = chunk_map.resolve(ext.disk_bytenr) else {
                            continue;
                        };
                        let key = phys / bs * bs;
                        hash.entry(key).or_default().push((fi, ei));
                    }
                }
                Some(hash)
            }
        }
    };

    let mut buf = vec![0u8; COPY_CHUNK.min(plan.total_bytes_to_move.max(bs) as usize)];

    for i in 0..plan.entries.len() {
        let entry = plan.entries[i];
        // The move must be replayable before its destination write.
        wal.log_move(dev, &plan.entries[i])?;

        let mut remaining = entry.length;
        let mut src = entry.src_offset;
        let mut dst = entry.dst_offset;
        let mut checksum = 0u32;

        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            dev.read_at(src, &mut buf[..chunk])?;
            checksum = crc32c(checksum, &buf[..chunk]);
            if let Err(err) = dev.write_at(dst, &buf[..chunk]) {
                warn!(
                    "relocation write failed at seq {}, replaying journal",
                    entry.seq
                );
                wal.replay_partial(dev, entry.seq)?;
                return Err(ConvertError::Io(err));
            }
            src += chunk as u64;
            dst += chunk as u64;
            remaining -= chunk as u64;
        }

        plan.entries[i].checksum = checksum;
        plan.entries[i].completed = true;
        wal.mark_complete(dev, entry.seq)?;

        // Rewrite every extent whose physical start sits in the moved
        // run; Pass 3 then sees only the new location.
        let blocks_in_entry = entry.length / bs;
        for bi in 0..blocks_in_entry {
            let src_block_offset = entry.src_offset + bi * bs;
            let new_offset = entry.dst_offset + bi * bs;

            if let Some(hash) = extent_hash.as_ref() {
                if let Some(refs) = hash.get(&src_block_offset) {
                    for &(fi, ei) in refs {
                        model.inodes[fi].extents[ei].disk_bytenr = new_offset;
                    }
                }
            } else {
                for fe in model.inodes.iter_mut() {
                    for ext in fe.extents.iter_mut() {
                        if ext.is_blockless() {
                            continue;
                        }
                        if chunk_map.resolve(ext.disk_bytenr) == Some(src_block_offset) {
                            ext.disk_bytenr = new_offset;
                        }
                    }
                }
            }
        }
    }

    dev.sync()?;
    info!("block relocation complete");
    Ok(())
}
