//! The conversion driver: Pass 1 (read), Pass 2 (plan + relocate,
//! gated by viability), Pass 3 (write Ext4).
//!
//! The migration checkpoint is persisted before any relocation write;
//! from that point every failure path either replays the relocation
//! WAL (mid-relocation) or reverses the whole plan from the migration
//! map (mid-Pass-3), restores the Btrfs superblock, and erases the
//! footer.

use std::path::PathBuf;

use device_io::{BlockDevice, FileDevice};
use log::{error, info, warn};

use crate::btrfs::model::FsModel;
use crate::btrfs::reader;
use crate::error::{ConvertError, Result};
use crate::ext4::alloc::BlockAllocator;
use crate::ext4::extent::ExtentTreeBuilder;
use crate::ext4::inode_map::InodeMap;
use crate::ext4::planner::{self, Layout};
use crate::ext4::superblock::FsIdentity;
use crate::ext4::{bitmaps, dir, gdt, inode, journal as ext4_journal, superblock};
use crate::mem_policy::MemoryPolicy;
use crate::relocate::{self, journal as reloc_journal, migration, RelocationPlan};

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub device_path: PathBuf,
    pub dry_run: bool,
    pub block_size: u32,
    pub inode_ratio: u32,
    pub workdir: PathBuf,
    /// Memory budget in bytes; 0 resolves to 60% of physical RAM.
    pub memory_limit: u64,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        ConvertOptions {
            device_path: PathBuf::new(),
            dry_run: false,
            block_size: 4096,
            inode_ratio: 16384,
            workdir: PathBuf::from("."),
            memory_limit: 0,
        }
    }
}

/// What the conversion did, for the caller's final report.
#[derive(Debug, Default)]
pub struct ConversionSummary {
    pub inode_count: u32,
    pub total_blocks: u64,
    pub num_groups: u32,
    pub total_inodes: u32,
    pub conflicts: u32,
    pub relocation_entries: u32,
    pub relocated_bytes: u64,
    pub dry_run: bool,
}

/// Open the device and run the conversion.
pub fn convert(opts: &ConvertOptions) -> Result<ConversionSummary> {
    let dev = FileDevice::open(&opts.device_path, opts.dry_run)?;
    info!(
        "device: {} ({:.1} GiB){}",
        opts.device_path.display(),
        dev.size() as f64 / (1024.0 * 1024.0 * 1024.0),
        if opts.dry_run { " [dry run]" } else { "" }
    );
    convert_device(&dev, opts)
}

/// Run the conversion against an already-open device.
pub fn convert_device(dev: &dyn BlockDevice, opts: &ConvertOptions) -> Result<ConversionSummary> {
    let policy = MemoryPolicy::detect(&opts.workdir, opts.memory_limit);

    /* Pass 1 */
    let mut model = reader::read_fs(dev)?;

    /* Pass 2: plan */
    let layout = planner::plan_layout(
        dev.size(),
        opts.block_size,
        opts.inode_ratio,
        Some(&model),
    )?;
    let conflicts = planner::count_conflicts(&layout, &model);
    let mut plan = relocate::plan(&layout, &mut model, dev.size())?;

    let mut summary = ConversionSummary {
        inode_count: model.inode_count(),
        total_blocks: layout.total_blocks,
        num_groups: layout.num_groups,
        total_inodes: layout.total_inodes,
        conflicts,
        relocation_entries: plan.entries.len() as u32,
        relocated_bytes: plan.total_bytes_to_move,
        dry_run: opts.dry_run,
    };

    audit_viability(&layout, &model)?;

    if opts.dry_run {
        info!(
            "dry run: {} groups, {} inodes, {} conflicting extents, {} relocation entries, \
             {} total blocks — no changes written",
            layout.num_groups,
            layout.total_inodes,
            conflicts,
            plan.entries.len(),
            layout.total_blocks
        );
        dry_run_integrity_scan(dev, &layout, &plan)?;
        return Ok(summary);
    }

    /* Pass 2: relocate, under a persistent checkpoint. */
    migration::save(dev, &plan, layout.block_size)?;

    let bs = u64::from(layout.block_size);
    let wal_capacity = (plan.entries.len() as u32).max(1);
    let wal_offset =
        migration::map_offset(dev.size(), layout.block_size, plan.entries.len() as u32)
            .saturating_sub(reloc_journal::region_size(wal_capacity))
            / bs
            * bs;
    let mut wal = reloc_journal::RelocJournal::create(dev, wal_offset, wal_capacity)?;

    if let Err(e) = relocate::execute(
        &mut plan,
        dev,
        &mut model,
        layout.block_size,
        &mut wal,
        Some(&policy),
    ) {
        // The executor already replayed its WAL up to the failure; the
        // device holds pristine btrfs data again.
        error!("relocation failed: {}", e);
        migration::erase_checkpoint(dev, layout.block_size)?;
        return Err(e);
    }

    // Checkpoint again with completed flags and checksums, so a
    // post-conversion rollback knows every move really ran.
    migration::save(dev, &plan, layout.block_size)?;
    summary.relocation_entries = plan.entries.len() as u32;

    /* Pass 3 */
    warn!(
        "point of no return: overwriting filesystem metadata; if interrupted, \
         run --rollback instead of fsck"
    );

    match write_ext4(dev, &layout, &mut model, &policy, wal_offset) {
        Ok(()) => {
            wal.clear(dev)?;
            info!("conversion complete; run e2fsck -f, then mount");
            Ok(summary)
        }
        Err(e) => {
            error!("ext4 write failed: {} — rolling back", e);
            if let Err(rb) = migration::rollback(dev, layout.block_size) {
                error!("automatic rollback failed: {}", rb);
            } else {
                let _ = wal.clear(dev);
            }
            Err(e)
        }
    }
}

/// Pass 3 proper: every Ext4 structure, in dependency order. Bitmaps
/// come after the inode tables and all other allocations so both
/// bitmaps reflect the final state; free counts close the pass.
fn write_ext4(
    dev: &dyn BlockDevice,
    layout: &Layout,
    model: &mut FsModel,
    policy: &MemoryPolicy,
    protect_from: u64,
) -> Result<()> {
    model.sort_for_locality();

    let ident = FsIdentity::generate();
    let mut alloc = BlockAllocator::new(layout);
    alloc.mark_model_data(layout, model);

    // The tail of the device carries the WAL, migration map, footer,
    // and superblock backup; none of it is up for allocation.
    let bs = u64::from(layout.block_size);
    for block in (protect_from / bs)..layout.total_blocks {
        alloc.mark_used(block);
    }

    superblock::write_superblock(dev, layout, model, &ident)?;
    gdt::write_gdt(dev, layout, &ident)?;

    let mut map = InodeMap::new();
    inode::assign_inode_numbers(model, &mut map, Some(policy))?;

    let mut builder = ExtentTreeBuilder::new(layout);
    inode::write_inode_tables(dev, layout, model, &map, &mut alloc, &mut builder)?;
    dir::write_directories(dev, layout, model, &map, &mut alloc, &ident)?;

    let run = ext4_journal::write_journal(dev, layout, &mut alloc, dev.size())?;
    ext4_journal::finalize_journal_inode(dev, layout, &run)?;

    bitmaps::write_bitmaps(dev, layout, &alloc, &map)?;
    bitmaps::update_free_counts(dev, layout, &ident)?;

    dev.sync()?;
    Ok(())
}

/// Pre-flight audit: decompression expansion and CoW cloning must fit
/// in the blocks left after metadata and existing data.
fn audit_viability(layout: &Layout, model: &FsModel) -> Result<()> {
    let bs = u64::from(layout.block_size);

    let expansion = if model.compressed_extent_count > 0 {
        model
            .total_decompressed_bytes
            .saturating_sub(model.total_compressed_bytes)
    } else {
        0
    };
    let expansion_blocks = (expansion + bs - 1) / bs;

    let free_data_blocks: u64 = layout.groups.iter().map(|g| u64::from(g.data_blocks)).sum();
    let mut used_data_blocks = 0u64;
    for fe in &model.inodes {
        for ext in &fe.extents {
            if !ext.is_blockless() {
                used_data_blocks += (ext.disk_num_bytes + bs - 1) / bs;
            }
        }
    }

    let available = free_data_blocks.saturating_sub(used_data_blocks);
    let total_needed = expansion_blocks + model.dedup_blocks_needed;

    info!(
        "viability audit: {} blocks needed (decompression {} + cow cloning {}), {} available",
        total_needed, expansion_blocks, model.dedup_blocks_needed, available
    );

    if total_needed > available {
        return Err(ConvertError::insufficient_space(format!(
            "conversion needs {} additional blocks but only {} are free",
            total_needed, available
        )));
    }
    Ok(())
}

/// Dry-run integrity scan: physically read every conflicting source
/// range so bad sectors surface before anyone commits to a real run.
fn dry_run_integrity_scan(
    dev: &dyn BlockDevice,
    layout: &Layout,
    plan: &RelocationPlan,
) -> Result<()> {
    if plan.entries.is_empty() {
        return Ok(());
    }

    info!(
        "dry-run integrity check: reading {} conflicting ranges",
        plan.entries.len()
    );

    let mut buf = vec![0u8; layout.block_size as usize];
    let mut read_errors = 0u32;
    let mut checked = 0u32;
    for entry in &plan.entries {
        let len = entry.length.min(u64::from(layout.block_size)) as usize;
        match dev.read_at(entry.src_offset, &mut buf[..len]) {
            Ok(()) => checked += 1,
            Err(e) => {
                warn!("cannot read block at offset {}: {}", entry.src_offset, e);
                read_errors += 1;
            }
        }
    }

    if read_errors > 0 {
        warn!(
            "{} of {} conflicting ranges could not be read — the device likely \
             has bad sectors; consider cloning it with ddrescue first",
            read_errors,
            checked + read_errors
        );
    } else {
        info!("all {} conflicting ranges are readable", checked);
    }
    Ok(())
}

/// Load the migration footer and reverse a previous conversion. The
/// block size must match the one the conversion ran with, since the
/// footer location is derived from it.
pub fn rollback(device_path: &std::path::Path, block_size: u32) -> Result<()> {
    let dev = FileDevice::open(device_path, false)?;
    info!("attempting rollback of {}", device_path.display());
    migration::rollback(&dev, block_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btrfs::BTRFS_SUPER_OFFSET;
    use crate::ext4::structs::{
        Ext4DirEntryHead, Ext4Extent, Ext4ExtentHeader, Ext4GroupDesc, Ext4Inode, Ext4SuperBlock,
    };
    use crate::ext4::{
        EXT4_EXTENTS_FL, EXT4_INLINE_DATA_FL, EXT4_JOURNAL_INO, EXT4_ROOT_INO, EXT4_SUPER_MAGIC,
    };
    use crate::testimg::TestImage;
    use device_io::{FileDevice, MemDevice};
    use zerocopy::FromBytes;

    const BS: u64 = 4096;

    fn opts(dry_run: bool) -> ConvertOptions {
        ConvertOptions {
            dry_run,
            ..ConvertOptions::default()
        }
    }

    fn read_ext4_superblock(dev: &dyn BlockDevice) -> Ext4SuperBlock {
        let mut buf = vec![0u8; 1024];
        dev.read_at(1024, &mut buf).unwrap();
        Ext4SuperBlock::read_from(&buf[..]).unwrap()
    }

    fn read_inode(
        dev: &dyn BlockDevice,
        sb: &Ext4SuperBlock,
        inode_table: u64,
        ino: u32,
    ) -> Ext4Inode {
        let local = u64::from((ino - 1) % sb.s_inodes_per_group.get());
        let offset = inode_table * BS + local * u64::from(sb.s_inode_size.get());
        let mut buf = vec![0u8; 160];
        dev.read_at(offset, &mut buf).unwrap();
        Ext4Inode::read_from_prefix(&buf[..]).unwrap()
    }

    fn group0_desc(dev: &dyn BlockDevice) -> Ext4GroupDesc {
        // Block size 4096: GDT starts at block 1, descriptors stride 64.
        let mut buf = [0u8; 64];
        dev.read_at(BS, &mut buf).unwrap();
        Ext4GroupDesc::read_from(&buf[..]).unwrap()
    }

    /// First data extent reachable from an inode's inline tree.
    fn first_extent(inode: &Ext4Inode) -> Ext4Extent {
        let eh = Ext4ExtentHeader::read_from_prefix(&inode.i_block[..]).unwrap();
        assert_eq!(eh.eh_depth.get(), 0, "expected inline depth-0 tree");
        assert!(eh.eh_entries.get() >= 1);
        Ext4Extent::read_from_prefix(&inode.i_block[12..]).unwrap()
    }

    /// Find a child entry in a linear directory block.
    fn find_dir_entry(block: &[u8], name: &[u8]) -> Option<u32> {
        let mut at = 0usize;
        while at + 8 <= block.len() {
            let head = Ext4DirEntryHead::read_from_prefix(&block[at..]).unwrap();
            let rec_len = head.rec_len.get() as usize;
            if rec_len == 0 {
                break;
            }
            let name_len = head.name_len as usize;
            if head.inode.get() != 0 && &block[at + 8..at + 8 + name_len] == name {
                return Some(head.inode.get());
            }
            at += rec_len;
        }
        None
    }

    #[test]
    fn zeroed_image_is_rejected_and_untouched() {
        let dev = MemDevice::new(64 * 1024 * 1024);
        let before = dev.contents();

        let err = convert_device(&dev, &opts(true)).unwrap_err();
        assert!(matches!(err, ConvertError::BadFormat(_)));
        assert_eq!(dev.contents(), before);
    }

    #[test]
    fn dry_run_leaves_the_device_byte_identical() {
        let dev = MemDevice::new(64 * 1024 * 1024);
        TestImage::minimal().write_to(&dev);
        let before = dev.contents();

        let summary = convert_device(&dev, &opts(true)).unwrap();
        assert!(summary.dry_run);
        assert_eq!(summary.inode_count, 3); // root, file, symlink
        assert_eq!(dev.contents(), before);
    }

    #[test]
    fn full_conversion_produces_a_coherent_ext4_image() {
        let dev = MemDevice::new(64 * 1024 * 1024);
        TestImage::minimal().write_to(&dev);

        let summary = convert_device(&dev, &opts(false)).unwrap();
        assert!(!summary.dry_run);
        assert_eq!(summary.relocation_entries, 0); // data parked high

        let sb = read_ext4_superblock(&dev);
        assert_eq!(sb.s_magic.get(), EXT4_SUPER_MAGIC);
        assert_eq!(u64::from(sb.s_blocks_count_lo.get()), 64 * 1024 * 1024 / BS);
        assert_eq!(sb.s_desc_size.get(), 64);
        assert_eq!(sb.s_journal_inum.get(), EXT4_JOURNAL_INO);
        assert_eq!(&sb.s_volume_name[..6], b"testfs");

        let desc = group0_desc(&dev);
        let inode_table = u64::from(desc.bg_inode_table_lo.get());
        assert!(inode_table > 0);

        // Inode bitmap: reserved inodes 1..10 marked.
        let mut bitmap = vec![0u8; 4096];
        dev.read_at(u64::from(desc.bg_inode_bitmap_lo.get()) * BS, &mut bitmap)
            .unwrap();
        for bit in 0..10 {
            assert_ne!(bitmap[bit / 8] & (1 << (bit % 8)), 0, "inode bit {}", bit);
        }

        // Block bitmap: tail bits of the partial group are ones.
        dev.read_at(u64::from(desc.bg_block_bitmap_lo.get()) * BS, &mut bitmap)
            .unwrap();
        let total_blocks = 64 * 1024 * 1024 / BS as usize;
        for bit in total_blocks..total_blocks + 64 {
            assert_ne!(
                bitmap[bit / 8] & (1 << (bit % 8)),
                0,
                "tail block bit {}",
                bit
            );
        }

        // Root directory: inode 2 is a directory whose block lists the
        // original names.
        let root = read_inode(&dev, &sb, inode_table, EXT4_ROOT_INO);
        assert_eq!(root.i_mode.get() & 0o170000, 0o040000);
        assert_ne!(root.i_flags.get() & EXT4_EXTENTS_FL, 0);
        let root_extent = first_extent(&root);
        let mut dir_block = vec![0u8; 4096];
        dev.read_at(u64::from(root_extent.ee_start_lo.get()) * BS, &mut dir_block)
            .unwrap();

        let file_ino = find_dir_entry(&dir_block, b"hello.txt").expect("hello.txt listed");
        let link_ino = find_dir_entry(&dir_block, b"link").expect("link listed");
        assert!(find_dir_entry(&dir_block, b".").is_some());
        assert!(find_dir_entry(&dir_block, b"..").is_some());

        // File contents are bit-identical, reachable through the
        // extent tree.
        let file = read_inode(&dev, &sb, inode_table, file_ino);
        assert_eq!(
            u64::from(file.i_size_lo.get()),
            TestImage::FILE_CONTENT.len() as u64
        );
        let ext = first_extent(&file);
        let mut data = vec![0u8; 4096];
        dev.read_at(u64::from(ext.ee_start_lo.get()) * BS, &mut data)
            .unwrap();
        assert_eq!(&data[..TestImage::FILE_CONTENT.len()], TestImage::FILE_CONTENT);

        // Fast symlink target inline in i_block.
        let link = read_inode(&dev, &sb, inode_table, link_ino);
        assert_eq!(link.i_mode.get() & 0o170000, 0o120000);
        assert_eq!(
            &link.i_block[..TestImage::SYMLINK_TARGET.len()],
            TestImage::SYMLINK_TARGET
        );

        // File timestamps came across with nanoseconds.
        assert_eq!(file.i_mtime.get(), 1_660_000_001);
        assert_eq!(file.i_mtime_extra.get() >> 2, 222);

        // Journal: inode 8 points at a run whose first block carries
        // the big-endian JBD2 superblock; following blocks are zero.
        let jnl = read_inode(&dev, &sb, inode_table, EXT4_JOURNAL_INO);
        assert_eq!(jnl.i_mode.get(), 0o100600);
        let jext = first_extent(&jnl);
        let jstart = u64::from(jext.ee_start_lo.get());
        let mut jbuf = vec![0u8; 1024];
        dev.read_at(jstart * BS, &mut jbuf).unwrap();
        assert_eq!(&jbuf[..4], &[0xC0, 0x3B, 0x39, 0x98]);
        assert_eq!(u32::from_be_bytes(jbuf[4..8].try_into().unwrap()), 4);
        assert_eq!(u32::from_be_bytes(jbuf[8..12].try_into().unwrap()), 1);
        assert_eq!(u32::from_be_bytes(jbuf[12..16].try_into().unwrap()), 4096);
        let mut jblock = vec![0u8; 4096];
        for i in 1..32u64 {
            dev.read_at((jstart + i) * BS, &mut jblock).unwrap();
            assert!(jblock.iter().all(|&b| b == 0), "journal block {} dirty", i);
        }

        // Free counts in the superblock match a bitmap recount.
        let mut free = 0u64;
        dev.read_at(u64::from(desc.bg_block_bitmap_lo.get()) * BS, &mut bitmap)
            .unwrap();
        for bit in 0..total_blocks {
            if bitmap[bit / 8] & (1 << (bit % 8)) == 0 {
                free += 1;
            }
        }
        assert_eq!(u64::from(sb.s_free_blocks_count_lo.get()), free);
    }

    #[test]
    fn conflicting_data_is_relocated_and_still_readable() {
        let dev = MemDevice::new(64 * 1024 * 1024);
        TestImage::with_conflicting_data().write_to(&dev);

        let summary = convert_device(&dev, &opts(false)).unwrap();
        assert!(summary.conflicts > 0);
        assert!(summary.relocation_entries > 0);

        let sb = read_ext4_superblock(&dev);
        let desc = group0_desc(&dev);
        let inode_table = u64::from(desc.bg_inode_table_lo.get());

        let root = read_inode(&dev, &sb, inode_table, EXT4_ROOT_INO);
        let mut dir_block = vec![0u8; 4096];
        dev.read_at(
            u64::from(first_extent(&root).ee_start_lo.get()) * BS,
            &mut dir_block,
        )
        .unwrap();
        let file_ino = find_dir_entry(&dir_block, b"hello.txt").unwrap();
        let file = read_inode(&dev, &sb, inode_table, file_ino);

        let ext = first_extent(&file);
        let new_block = u64::from(ext.ee_start_lo.get());
        assert_ne!(new_block, 100, "extent still points at the metadata zone");

        let mut data = vec![0u8; 4096];
        dev.read_at(new_block * BS, &mut data).unwrap();
        assert_eq!(&data[..TestImage::FILE_CONTENT.len()], TestImage::FILE_CONTENT);
    }

    #[test]
    fn compressed_file_is_decompressed_during_conversion() {
        let dev = MemDevice::new(64 * 1024 * 1024);
        TestImage::with_compressed_file().write_to(&dev);

        convert_device(&dev, &opts(false)).unwrap();

        let sb = read_ext4_superblock(&dev);
        let desc = group0_desc(&dev);
        let inode_table = u64::from(desc.bg_inode_table_lo.get());

        let root = read_inode(&dev, &sb, inode_table, EXT4_ROOT_INO);
        let mut dir_block = vec![0u8; 4096];
        dev.read_at(
            u64::from(first_extent(&root).ee_start_lo.get()) * BS,
            &mut dir_block,
        )
        .unwrap();
        let ino = find_dir_entry(&dir_block, b"notes.txt").expect("notes.txt listed");
        let inode = read_inode(&dev, &sb, inode_table, ino);
        assert_eq!(inode.i_flags.get() & EXT4_INLINE_DATA_FL, 0);

        let plain = TestImage::compressed_file_plain();
        assert_eq!(u64::from(inode.i_size_lo.get()), plain.len() as u64);

        // Walk the inline extents and reassemble the file.
        let eh = Ext4ExtentHeader::read_from_prefix(&inode.i_block[..]).unwrap();
        assert_eq!(eh.eh_depth.get(), 0);
        let mut contents = Vec::new();
        for e in 0..eh.eh_entries.get() as usize {
            let ext = Ext4Extent::read_from_prefix(&inode.i_block[12 + e * 12..]).unwrap();
            let mut run = vec![0u8; ext.ee_len.get() as usize * 4096];
            dev.read_at(u64::from(ext.ee_start_lo.get()) * BS, &mut run)
                .unwrap();
            contents.extend_from_slice(&run);
        }
        assert_eq!(&contents[..plain.len()], &plain[..]);
    }

    #[test]
    fn rollback_restores_a_mountable_btrfs() {
        let dev = MemDevice::new(64 * 1024 * 1024);
        TestImage::minimal().write_to(&dev);

        convert_device(&dev, &opts(false)).unwrap();

        // The device is ext4 now and the btrfs superblock is gone.
        assert_eq!(read_ext4_superblock(&dev).s_magic.get(), EXT4_SUPER_MAGIC);
        let mut magic = [0u8; 8];
        dev.read_at(BTRFS_SUPER_OFFSET + 64, &mut magic).unwrap();
        assert_ne!(u64::from_le_bytes(magic), crate::btrfs::BTRFS_MAGIC);

        // Zero-conflict conversion still wrote a footer; rollback
        // restores the superblock and the reader accepts the
        // filesystem again.
        migration::rollback(&dev, 4096).unwrap();

        let model = reader::read_fs(&dev).unwrap();
        let root = model.find(256).unwrap();
        assert_eq!(root.children.len(), 2);

        // Second rollback has nothing to do.
        assert!(matches!(
            migration::rollback(&dev, 4096),
            Err(ConvertError::BadFormat(_))
        ));
    }

    #[test]
    fn rollback_after_relocation_restores_moved_data() {
        let dev = MemDevice::new(64 * 1024 * 1024);
        TestImage::with_conflicting_data().write_to(&dev);

        let summary = convert_device(&dev, &opts(false)).unwrap();
        assert!(summary.relocation_entries > 0);

        migration::rollback(&dev, 4096).unwrap();

        // The original data block holds the file content again and the
        // reader sees the filesystem.
        let mut data = vec![0u8; 4096];
        dev.read_at(100 * 4096, &mut data).unwrap();
        assert_eq!(&data[..TestImage::FILE_CONTENT.len()], TestImage::FILE_CONTENT);

        let model = reader::read_fs(&dev).unwrap();
        assert!(model.find(TestImage::FILE_INO).is_some());
    }

    #[test]
    fn conversion_works_on_a_real_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.img");
        {
            let file = std::fs::File::create(&path).unwrap();
            file.set_len(64 * 1024 * 1024).unwrap();
        }

        let dev = FileDevice::open(&path, false).unwrap();
        TestImage::minimal().write_to(&dev);

        let options = ConvertOptions {
            device_path: path.clone(),
            workdir: dir.path().to_path_buf(),
            ..ConvertOptions::default()
        };
        let summary = convert(&options).unwrap();
        assert_eq!(summary.num_groups, 1);

        let dev = FileDevice::open(&path, true).unwrap();
        assert_eq!(read_ext4_superblock(&dev).s_magic.get(), EXT4_SUPER_MAGIC);
    }
}
