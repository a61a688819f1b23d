//! Ext4 extent tree construction.
//!
//! Resolves a file's (possibly relocated) extents into block runs,
//! physically clones any block an earlier inode already claimed (CoW
//! sharing must not become an ext4 multiply-claimed block), merges
//! adjacent runs, and emits either an inline depth-0 tree or a
//! bottom-up multi-level tree.

use device_io::BlockDevice;
use log::debug;
use zerocopy::{AsBytes, FromBytes};

use crate::btrfs::chunk::ChunkMap;
use crate::btrfs::model::FileEntry;
use crate::error::{ConvertError, Result};

use super::alloc::BlockAllocator;
use super::planner::Layout;
use super::structs::{
    Ext4Extent, Ext4ExtentHeader, Ext4ExtentIdx, Ext4Inode, Lu16, Lu32, EXTENT_ENTRY_SIZE,
    EXTENT_HEADER_SIZE,
};
use super::{EXT4_EXTENTS_FL, EXT4_EXT_MAGIC, EXT4_EXT_MAX_LEN, EXT4_INLINE_EXTENTS};

/// One contiguous (file block, physical block) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRun {
    pub file_block: u32,
    pub num_blocks: u32,
    pub phys_block: u64,
}

fn header(entries: u16, max: u16, depth: u16) -> Ext4ExtentHeader {
    let mut eh = Ext4ExtentHeader::new_zeroed();
    eh.eh_magic = Lu16::new(EXT4_EXT_MAGIC);
    eh.eh_entries = Lu16::new(entries);
    eh.eh_max = Lu16::new(max);
    eh.eh_depth = Lu16::new(depth);
    eh
}

fn extent_entry(run: &ResolvedRun) -> Ext4Extent {
    let mut ee = Ext4Extent::new_zeroed();
    ee.ee_block = Lu32::new(run.file_block);
    ee.ee_len = Lu16::new(run.num_blocks as u16);
    ee.ee_start_lo = Lu32::new(run.phys_block as u32);
    ee.ee_start_hi = Lu16::new((run.phys_block >> 32) as u16);
    ee
}

fn index_entry(first_file_block: u32, child: u64) -> Ext4ExtentIdx {
    let mut ei = Ext4ExtentIdx::new_zeroed();
    ei.ei_block = Lu32::new(first_file_block);
    ei.ei_leaf_lo = Lu32::new(child as u32);
    ei.ei_leaf_hi = Lu16::new((child >> 32) as u16);
    ei
}

/// Depth-0 header with no extents (empty file, directory placeholder).
pub fn write_empty_root(i_block: &mut [u8; 60]) {
    i_block.fill(0);
    let eh = header(0, EXT4_INLINE_EXTENTS as u16, 0);
    i_block[..EXTENT_HEADER_SIZE].copy_from_slice(eh.as_bytes());
}

/// Depth-0 tree with up to four extents inline in `i_block`.
pub fn write_inline_leaf(i_block: &mut [u8; 60], runs: &[ResolvedRun]) {
    debug_assert!(runs.len() <= EXT4_INLINE_EXTENTS);
    i_block.fill(0);
    let eh = header(runs.len() as u16, EXT4_INLINE_EXTENTS as u16, 0);
    i_block[..EXTENT_HEADER_SIZE].copy_from_slice(eh.as_bytes());
    for (i, run) in runs.iter().enumerate() {
        let at = EXTENT_HEADER_SIZE + i * EXTENT_ENTRY_SIZE;
        i_block[at..at + EXTENT_ENTRY_SIZE].copy_from_slice(extent_entry(run).as_bytes());
    }
}

/// Index root with up to four `extent_idx` entries inline in `i_block`.
pub fn write_inline_index(i_block: &mut [u8; 60], depth: u16, nodes: &[(u32, u64)]) {
    debug_assert!(nodes.len() <= EXT4_INLINE_EXTENTS);
    i_block.fill(0);
    let eh = header(nodes.len() as u16, EXT4_INLINE_EXTENTS as u16, depth);
    i_block[..EXTENT_HEADER_SIZE].copy_from_slice(eh.as_bytes());
    for (i, &(first, child)) in nodes.iter().enumerate() {
        let at = EXTENT_HEADER_SIZE + i * EXTENT_ENTRY_SIZE;
        i_block[at..at + EXTENT_ENTRY_SIZE].copy_from_slice(index_entry(first, child).as_bytes());
    }
}

/// Sort by file block and merge runs contiguous on both sides, capped
/// at the ext4 per-extent length limit.
pub fn merge_runs(mut runs: Vec<ResolvedRun>) -> Vec<ResolvedRun> {
    if runs.is_empty() {
        return runs;
    }
    runs.sort_by_key(|r| r.file_block);

    let mut merged: Vec<ResolvedRun> = Vec::with_capacity(runs.len());
    for run in runs {
        if let Some(last) = merged.last_mut() {
            let file_adjacent = u64::from(last.file_block) + u64::from(last.num_blocks)
                == u64::from(run.file_block);
            let phys_adjacent = last.phys_block + u64::from(last.num_blocks) == run.phys_block;
            if file_adjacent
                && phys_adjacent
                && last.num_blocks + run.num_blocks <= EXT4_EXT_MAX_LEN
            {
                last.num_blocks += run.num_blocks;
                continue;
            }
        }
        merged.push(run);
    }
    merged
}

/// Builds extent trees for every regular file of one conversion; keeps
/// the first-claim bitmap that detects CoW-shared blocks across inodes.
pub struct ExtentTreeBuilder {
    claimed: Vec<u8>,
}

impl ExtentTreeBuilder {
    pub fn new(layout: &Layout) -> ExtentTreeBuilder {
        ExtentTreeBuilder {
            claimed: vec![0u8; ((layout.total_blocks + 7) / 8) as usize],
        }
    }

    /// Claim a physical block for the current inode; false when some
    /// earlier extent already owns it.
    fn claim(&mut self, block: u64) -> bool {
        let byte = (block / 8) as usize;
        let bit = 1 << (block % 8);
        if byte >= self.claimed.len() || self.claimed[byte] & bit != 0 {
            return false;
        }
        self.claimed[byte] |= bit;
        true
    }

    /// Resolve one file's extents to physical runs, cloning any block
    /// that is already owned elsewhere.
    pub fn resolve_runs(
        &mut self,
        alloc: &mut BlockAllocator,
        dev: &dyn BlockDevice,
        layout: &Layout,
        chunk_map: &ChunkMap,
        fe: &FileEntry,
    ) -> Result<Vec<ResolvedRun>> {
        let bs = u64::from(layout.block_size);
        let mut runs = Vec::new();

        for ext in &fe.extents {
            if ext.is_blockless() {
                continue;
            }
            let phys = chunk_map.resolve(ext.disk_bytenr).unwrap_or(ext.disk_bytenr);
            let file_block_start = (ext.file_offset / bs) as u32;
            let num_blocks = ((ext.num_bytes + bs - 1) / bs).max(1) as u32;
            let phys_block_start = phys / bs;

            for b in 0..u64::from(num_blocks) {
                let src_block = phys_block_start + b;
                let file_block = file_block_start + b as u32;

                let final_block = if self.claim(src_block) {
                    src_block
                } else {
                    // CoW-shared: clone the block so each inode owns
                    // its own physical copy.
                    let new_block = alloc.alloc(layout).ok_or_else(|| {
                        ConvertError::insufficient_space(format!(
                            "no free block to clone shared block {} (inode {})",
                            src_block, fe.ino
                        ))
                    })?;
                    let mut buf = vec![0u8; bs as usize];
                    dev.read_at(src_block * bs, &mut buf)?;
                    dev.write_at(new_block * bs, &buf)?;
                    self.claim(new_block);
                    new_block
                };

                runs.push(ResolvedRun {
                    file_block,
                    num_blocks: 1,
                    phys_block: final_block,
                });
            }
        }

        Ok(merge_runs(runs))
    }

    /// Build the extent tree for one regular file into its inode.
    pub fn build(
        &mut self,
        alloc: &mut BlockAllocator,
        dev: &dyn BlockDevice,
        layout: &Layout,
        chunk_map: &ChunkMap,
        fe: &FileEntry,
        inode: &mut Ext4Inode,
    ) -> Result<()> {
        let runs = self.resolve_runs(alloc, dev, layout, chunk_map, fe)?;
        write_tree(alloc, dev, layout, &runs, &mut inode.i_block)?;
        inode.i_flags = Lu32::new(inode.i_flags.get() | EXT4_EXTENTS_FL);
        Ok(())
    }
}

/// Write a tree over pre-resolved runs into a 60-byte root area,
/// allocating external nodes as needed.
pub fn write_tree(
    alloc: &mut BlockAllocator,
    dev: &dyn BlockDevice,
    layout: &Layout,
    runs: &[ResolvedRun],
    i_block: &mut [u8; 60],
) -> Result<()> {
    if runs.is_empty() {
        write_empty_root(i_block);
        return Ok(());
    }
    if runs.len() <= EXT4_INLINE_EXTENTS {
        write_inline_leaf(i_block, runs);
        return Ok(());
    }

    let block_size = layout.block_size as usize;
    let per_block = (block_size - EXTENT_HEADER_SIZE) / EXTENT_ENTRY_SIZE;

    // Depth-0 leaves first.
    let mut level: Vec<(u32, u64)> = Vec::new(); // (first file block, node block)
    for chunk in runs.chunks(per_block) {
        let block = alloc.alloc(layout).ok_or_else(|| {
            ConvertError::insufficient_space("no free block for extent tree leaf".to_string())
        })?;

        let mut buf = vec![0u8; block_size];
        let eh = header(chunk.len() as u16, per_block as u16, 0);
        buf[..EXTENT_HEADER_SIZE].copy_from_slice(eh.as_bytes());
        for (i, run) in chunk.iter().enumerate() {
            let at = EXTENT_HEADER_SIZE + i * EXTENT_ENTRY_SIZE;
            buf[at..at + EXTENT_ENTRY_SIZE].copy_from_slice(extent_entry(run).as_bytes());
        }
        dev.write_at(block * block_size as u64, &buf)?;
        level.push((chunk[0].file_block, block));
    }

    // Index levels until the top fits inline.
    let mut depth: u16 = 1;
    while level.len() > EXT4_INLINE_EXTENTS {
        let mut next: Vec<(u32, u64)> = Vec::new();
        for chunk in level.chunks(per_block) {
            let block = alloc.alloc(layout).ok_or_else(|| {
                ConvertError::insufficient_space(
                    "no free block for extent tree index".to_string(),
                )
            })?;

            let mut buf = vec![0u8; block_size];
            let eh = header(chunk.len() as u16, per_block as u16, depth);
            buf[..EXTENT_HEADER_SIZE].copy_from_slice(eh.as_bytes());
            for (i, &(first, child)) in chunk.iter().enumerate() {
                let at = EXTENT_HEADER_SIZE + i * EXTENT_ENTRY_SIZE;
                buf[at..at + EXTENT_ENTRY_SIZE]
                    .copy_from_slice(index_entry(first, child).as_bytes());
            }
            dev.write_at(block * block_size as u64, &buf)?;
            next.push((chunk[0].0, block));
        }
        level = next;
        depth += 1;
    }

    if depth > 1 {
        debug!(
            "extent tree reached depth {} ({} top-level nodes)",
            depth,
            level.len()
        );
    }
    write_inline_index(i_block, depth, &level);
    Ok(())
}
