//! Btrfs objectid → Ext4 inode number mapping.
//!
//! A linear entry array plus an open-addressed hash table sized at
//! twice the entry count. Either side spills to a mapped temp file in
//! the workdir once it crosses the memory policy's threshold; a bloom
//! filter then keeps absent-key probes off the disk-backed hash.

use std::fs::OpenOptions;
use std::path::PathBuf;

use log::{debug, warn};
use memmap2::MmapMut;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::bloom::BloomFilter;
use crate::error::{ConvertError, Result};
use crate::mem_policy::MemoryPolicy;

use super::structs::{Lu32, Lu64};

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct InodeMapEntry {
    pub btrfs_ino: Lu64,
    pub ext4_ino: Lu32,
}

pub const INODE_MAP_ENTRY_SIZE: usize = 12;

/// Knuth multiplicative probe start.
fn slot_for(ino: u64, size: usize) -> usize {
    (ino.wrapping_mul(0x9E37_79B1) % size as u64) as usize
}

enum Backing {
    Heap(Vec<u8>),
    Mapped { mmap: MmapMut, path: PathBuf },
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Heap(v) => v,
            Backing::Mapped { mmap, .. } => mmap,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Backing::Heap(v) => v,
            Backing::Mapped { mmap, .. } => mmap,
        }
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        if let Backing::Mapped { path, .. } = self {
            let _ = std::fs::remove_file(path.as_path());
        }
    }
}

fn allocate_backing(
    policy: Option<&MemoryPolicy>,
    bytes: usize,
    file_tag: &str,
) -> Result<Backing> {
    if let Some(policy) = policy {
        if policy.should_spill(bytes as u64) {
            let path = policy.workdir.join(format!(".btrfs2ext4.tmp.{}", file_tag));
            let _ = std::fs::remove_file(&path);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
                .map_err(|e| {
                    ConvertError::resource_limit(format!(
                        "cannot create spill file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            file.set_len(bytes as u64)?;
            let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| {
                ConvertError::resource_limit(format!(
                    "cannot map spill file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            debug!("inode map spilled {} bytes to {}", bytes, path.display());
            return Ok(Backing::Mapped { mmap, path });
        }
        policy.note_alloc(bytes as u64);
    }
    Ok(Backing::Heap(vec![0u8; bytes]))
}

pub struct InodeMap {
    entries: Vec<InodeMapEntry>,
    hash: Option<Backing>,
    hash_slots: usize,
    bloom: Option<BloomFilter>,
}

impl InodeMap {
    pub fn new() -> InodeMap {
        InodeMap {
            entries: Vec::new(),
            hash: None,
            hash_slots: 0,
            bloom: None,
        }
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[InodeMapEntry] {
        &self.entries
    }

    pub fn add(&mut self, btrfs_ino: u64, ext4_ino: u32) {
        let mut entry = InodeMapEntry::new_zeroed();
        entry.btrfs_ino = Lu64::new(btrfs_ino);
        entry.ext4_ino = Lu32::new(ext4_ino);
        self.entries.push(entry);
    }

    /// Build the lookup hash from the linear entries. Call once after
    /// every `add`, before the first `lookup`. Load factor <= 0.5.
    pub fn build_hash(&mut self, policy: Option<&MemoryPolicy>) -> Result<()> {
        let slots = if self.entries.len() < 64 {
            128
        } else {
            self.entries.len() * 2
        };
        let bytes = slots * INODE_MAP_ENTRY_SIZE;

        let mut backing = allocate_backing(policy, bytes, "ht")?;
        let spilled = matches!(backing, Backing::Mapped { .. });

        // A disk-backed hash pays a page-in per probe; pre-filter with
        // a bloom filter so absent keys never touch it.
        let mut bloom = if spilled {
            Some(BloomFilter::new(self.entries.len() as u64))
        } else {
            None
        };

        {
            let table = LayoutVerified::<_, [InodeMapEntry]>::new_slice_unaligned(
                backing.bytes_mut(),
            )
            .expect("hash backing sized to whole entries")
            .into_mut_slice();

            for entry in &self.entries {
                let key = entry.btrfs_ino.get();
                if let Some(bloom) = bloom.as_mut() {
                    bloom.add(key);
                }
                let mut slot = slot_for(key, slots);
                while table[slot].ext4_ino.get() != 0 {
                    slot = (slot + 1) % slots;
                }
                table[slot] = *entry;
            }
        }

        self.hash = Some(backing);
        self.hash_slots = slots;
        self.bloom = bloom;
        Ok(())
    }

    /// Resolve a Btrfs objectid; 0 means unmapped.
    pub fn lookup(&self, btrfs_ino: u64) -> u32 {
        if let Some(bloom) = &self.bloom {
            if !bloom.contains(btrfs_ino) {
                return 0;
            }
        }

        if let Some(backing) = &self.hash {
            let table = LayoutVerified::<_, [InodeMapEntry]>::new_slice_unaligned(
                backing.bytes(),
            )
            .expect("hash backing sized to whole entries")
            .into_slice();

            let mut slot = slot_for(btrfs_ino, self.hash_slots);
            let start = slot;
            loop {
                let entry = &table[slot];
                if entry.ext4_ino.get() == 0 {
                    return 0;
                }
                if entry.btrfs_ino.get() == btrfs_ino {
                    return entry.ext4_ino.get();
                }
                slot = (slot + 1) % self.hash_slots;
                if slot == start {
                    return 0;
                }
            }
        }

        // Hash not built yet: linear scan.
        for entry in &self.entries {
            if entry.btrfs_ino.get() == btrfs_ino {
                return entry.ext4_ino.get();
            }
        }
        0
    }
}

impl Default for InodeMap {
    fn default() -> Self {
        InodeMap::new()
    }
}

/// Reverse array `ext4_ino → btrfs_ino` for O(1) iteration when the
/// inode tables are formatted. Index 0 is unused.
pub fn reverse_map(map: &InodeMap, total_inodes: u32) -> Vec<u64> {
    let mut reverse = vec![0u64; total_inodes as usize + 1];
    for entry in map.entries() {
        let e = entry.ext4_ino.get() as usize;
        if e > 0 && e < reverse.len() {
            reverse[e] = entry.btrfs_ino.get();
        } else if e > 0 {
            warn!(
                "inode map entry {} -> {} outside inode space",
                entry.btrfs_ino.get(),
                e
            );
        }
    }
    reverse
}
