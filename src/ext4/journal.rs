//! JBD2 journal writer.
//!
//! Sizes the journal with the mke2fs heuristic, prefers a contiguous
//! run near the end of the device, writes the big-endian JBD2 v2
//! superblock followed by zeroed blocks, and finalizes inode 8 with an
//! extent tree covering the run.

use device_io::BlockDevice;
use log::{info, warn};
use zerocopy::{AsBytes, FromBytes};

use crate::error::{ConvertError, Result};

use super::alloc::BlockAllocator;
use super::extent::{write_inline_leaf, ResolvedRun};
use super::planner::Layout;
use super::structs::{
    Bu32, Ext4Inode, Jbd2SuperBlock, Lu16, Lu32, INODE_STRUCT_SIZE, JBD2_BLOCKTYPE_SB_V2,
    JBD2_MAGIC,
};
use super::{EXT4_EXTENTS_FL, EXT4_EXT_MAX_LEN, EXT4_JOURNAL_INO};

const ZERO_CHUNK: usize = 16 * 1024 * 1024;

/// Placement of the journal, owned by the Pass-3 writer and handed to
/// the inode finalizer explicitly.
#[derive(Debug, Clone, Copy)]
pub struct JournalRun {
    pub start_block: u64,
    pub block_count: u32,
}

/// mke2fs journal sizing: 4 MiB under 512 MiB devices up to 128 MiB
/// for 4 GiB and beyond.
fn default_journal_blocks(device_size: u64, block_size: u32) -> u32 {
    let mib = device_size / (1024 * 1024);
    let journal_mib = if mib < 512 {
        4
    } else if mib < 1024 {
        16
    } else if mib < 2048 {
        32
    } else if mib < 4096 {
        64
    } else {
        128
    };
    journal_mib * 1024 * 1024 / block_size
}

/// Find a contiguous free run scanning backwards from the device end.
fn find_tail_run(alloc: &BlockAllocator, layout: &Layout, want: u32) -> Option<u64> {
    let want = u64::from(want);
    let mut run = 0u64;
    let mut block = layout.total_blocks;
    while block > 0 {
        block -= 1;
        if alloc.is_used(block) {
            run = 0;
        } else {
            run += 1;
            if run == want {
                return Some(block);
            }
        }
    }
    None
}

/// Allocate and write the journal. Returns its placement.
pub fn write_journal(
    dev: &dyn BlockDevice,
    layout: &Layout,
    alloc: &mut BlockAllocator,
    device_size: u64,
) -> Result<JournalRun> {
    let block_size = layout.block_size as usize;
    let want = default_journal_blocks(device_size, layout.block_size);

    // Prefer one contiguous run at the tail of the device.
    let (start_block, block_count) = if let Some(start) = find_tail_run(alloc, layout, want) {
        for b in start..start + u64::from(want) {
            alloc.mark_used(b);
        }
        (start, want)
    } else {
        // Sequential fallback: take what the allocator gives and keep
        // the contiguous prefix.
        let first = alloc.alloc(layout).ok_or_else(|| {
            ConvertError::insufficient_space("no space for journal".to_string())
        })?;
        let mut count = 1u32;
        while count < want {
            match alloc.alloc(layout) {
                Some(b) if b == first + u64::from(count) => count += 1,
                _ => break,
            }
        }
        warn!(
            "journal shrunk to {} of {} blocks (fragmented free space)",
            count, want
        );
        (first, count)
    };

    if block_count == 0 {
        return Err(ConvertError::insufficient_space(
            "no space for journal".to_string(),
        ));
    }

    info!(
        "writing jbd2 journal: blocks {}..{} ({} blocks, {} MiB)",
        start_block,
        start_block + u64::from(block_count) - 1,
        block_count,
        u64::from(block_count) * block_size as u64 / (1024 * 1024)
    );

    // JBD2 v2 superblock, big-endian, padded to 1024 then to a block.
    let mut jsb = Jbd2SuperBlock::new_zeroed();
    jsb.s_header_magic = Bu32::new(JBD2_MAGIC);
    jsb.s_header_blocktype = Bu32::new(JBD2_BLOCKTYPE_SB_V2);
    jsb.s_header_sequence = Bu32::new(1);
    jsb.s_blocksize = Bu32::new(layout.block_size);
    jsb.s_maxlen = Bu32::new(block_count);
    jsb.s_first = Bu32::new(1);
    jsb.s_sequence = Bu32::new(1);
    jsb.s_start = Bu32::new(0); // clean journal
    jsb.s_errno = Bu32::new(0);

    let mut first_block = vec![0u8; block_size];
    first_block[..jsb.as_bytes().len()].copy_from_slice(jsb.as_bytes());
    dev.write_at(start_block * block_size as u64, &first_block)?;

    // Remaining blocks are zero; one reused buffer, 16 MiB at a time.
    let zero = vec![0u8; ZERO_CHUNK.min((block_count as usize - 1).max(1) * block_size)];
    let mut offset = (start_block + 1) * block_size as u64;
    let end = (start_block + u64::from(block_count)) * block_size as u64;
    while offset < end {
        let len = ((end - offset) as usize).min(zero.len());
        dev.write_at(offset, &zero[..len])?;
        offset += len as u64;
    }

    Ok(JournalRun {
        start_block,
        block_count,
    })
}

/// Format inode 8 with a contiguous extent tree covering the journal.
pub fn finalize_journal_inode(
    dev: &dyn BlockDevice,
    layout: &Layout,
    run: &JournalRun,
) -> Result<()> {
    let block_size = layout.block_size as u64;

    let mut inode = Ext4Inode::new_zeroed();
    inode.i_mode = Lu16::new(0o100600);
    inode.i_links_count = Lu16::new(1);
    let size = u64::from(run.block_count) * block_size;
    inode.i_size_lo = Lu32::new(size as u32);
    inode.i_size_high = Lu32::new((size >> 32) as u32);
    let sectors = (size + 511) / 512;
    inode.i_blocks_lo = Lu32::new(sectors as u32);
    inode.i_flags = Lu32::new(EXT4_EXTENTS_FL);
    inode.i_extra_isize = Lu16::new(32);
    inode.i_generation = Lu32::new(1);

    // The run is contiguous; ee_len caps each extent at 32768 blocks,
    // so up to four extents cover even a 128 MiB journal at 1 KiB
    // blocks.
    let mut runs = Vec::new();
    let mut covered = 0u32;
    while covered < run.block_count {
        let len = (run.block_count - covered).min(EXT4_EXT_MAX_LEN);
        runs.push(ResolvedRun {
            file_block: covered,
            num_blocks: len,
            phys_block: run.start_block + u64::from(covered),
        });
        covered += len;
    }
    if runs.len() > super::EXT4_INLINE_EXTENTS {
        return Err(ConvertError::resource_limit(
            "journal needs more than four inline extents".to_string(),
        ));
    }
    write_inline_leaf(&mut inode.i_block, &runs);

    let ino = EXT4_JOURNAL_INO;
    let group = (ino - 1) / layout.inodes_per_group;
    let local = (ino - 1) % layout.inodes_per_group;
    let bg = layout
        .groups
        .get(group as usize)
        .ok_or_else(|| ConvertError::corrupt("journal inode outside any group".to_string()))?;
    let offset = bg.inode_table_start * block_size + u64::from(local) * u64::from(layout.inode_size);

    // The rest of the 256-byte slot stays zero.
    let mut slot = vec![0u8; layout.inode_size as usize];
    slot[..INODE_STRUCT_SIZE].copy_from_slice(inode.as_bytes());
    dev.write_at(offset, &slot)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext4::planner::plan_layout;
    use device_io::MemDevice;
    use zerocopy::FromBytes;

    const SIZE: u64 = 256 * 1024 * 1024;

    #[test]
    fn journal_size_heuristic() {
        assert_eq!(default_journal_blocks(256 * 1024 * 1024, 4096), 1024); // 4 MiB
        assert_eq!(default_journal_blocks(768 * 1024 * 1024, 4096), 4096); // 16 MiB
        assert_eq!(default_journal_blocks(3 * 1024 * 1024 * 1024, 4096), 16384); // 64 MiB
        assert_eq!(
            default_journal_blocks(8 * 1024 * 1024 * 1024, 4096),
            32768
        ); // 128 MiB
    }

    #[test]
    fn jbd2_superblock_is_big_endian_and_rest_is_zero() {
        let dev = MemDevice::new(SIZE as usize);
        let layout = plan_layout(SIZE, 4096, 16384, None).unwrap();
        let mut alloc = BlockAllocator::new(&layout);

        let run = write_journal(&dev, &layout, &mut alloc, SIZE).unwrap();
        assert_eq!(run.block_count, 1024);

        let mut buf = vec![0u8; 1024];
        dev.read_at(run.start_block * 4096, &mut buf).unwrap();
        // First four big-endian words: magic, blocktype 4, sequence 1,
        // block size.
        assert_eq!(&buf[0..4], &[0xC0, 0x3B, 0x39, 0x98]);
        assert_eq!(u32::from_be_bytes(buf[4..8].try_into().unwrap()), 4);
        assert_eq!(u32::from_be_bytes(buf[8..12].try_into().unwrap()), 1);
        assert_eq!(u32::from_be_bytes(buf[12..16].try_into().unwrap()), 4096);
        assert_eq!(
            u32::from_be_bytes(buf[16..20].try_into().unwrap()),
            run.block_count
        );

        // Blocks 1..32 are all zero.
        let mut block = vec![0u8; 4096];
        for i in 1..32u64 {
            dev.read_at((run.start_block + i) * 4096, &mut block).unwrap();
            assert!(block.iter().all(|&b| b == 0), "journal block {} not zero", i);
        }
    }

    #[test]
    fn journal_prefers_the_device_tail() {
        let dev = MemDevice::new(SIZE as usize);
        let layout = plan_layout(SIZE, 4096, 16384, None).unwrap();
        let mut alloc = BlockAllocator::new(&layout);

        let run = write_journal(&dev, &layout, &mut alloc, SIZE).unwrap();
        assert_eq!(
            run.start_block + u64::from(run.block_count),
            layout.total_blocks
        );
        // The run is claimed in the allocator.
        for b in run.start_block..run.start_block + u64::from(run.block_count) {
            assert!(alloc.is_used(b));
        }
    }

    #[test]
    fn journal_inode_covers_the_run() {
        let dev = MemDevice::new(SIZE as usize);
        let layout = plan_layout(SIZE, 4096, 16384, None).unwrap();
        let mut alloc = BlockAllocator::new(&layout);
        let run = write_journal(&dev, &layout, &mut alloc, SIZE).unwrap();
        finalize_journal_inode(&dev, &layout, &run).unwrap();

        let offset = layout.groups[0].inode_table_start * 4096
            + u64::from(EXT4_JOURNAL_INO - 1) * 256;
        let mut slot = vec![0u8; INODE_STRUCT_SIZE];
        dev.read_at(offset, &mut slot).unwrap();
        let inode = Ext4Inode::read_from_prefix(&slot[..]).unwrap();

        assert_eq!(inode.i_mode.get(), 0o100600);
        assert_eq!(
            u64::from(inode.i_size_lo.get()),
            u64::from(run.block_count) * 4096
        );

        use crate::ext4::structs::{Ext4Extent, Ext4ExtentHeader};
        let eh = Ext4ExtentHeader::read_from_prefix(&inode.i_block[..]).unwrap();
        assert_eq!(eh.eh_entries.get(), 1);
        let ee = Ext4Extent::read_from_prefix(&inode.i_block[12..]).unwrap();
        assert_eq!(u64::from(ee.ee_start_lo.get()), run.start_block);
        assert_eq!(u32::from(ee.ee_len.get()), run.block_count);
    }
}
