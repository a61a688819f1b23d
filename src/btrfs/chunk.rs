//! Logical→physical address resolution through the chunk tree.
//!
//! Bootstrap mappings come from the superblock's embedded system chunk
//! array; the full set is collected by walking the chunk tree rooted at
//! `superblock.chunk_root`.

use device_io::BlockDevice;
use log::{debug, info};
use zerocopy::FromBytes;

use crate::error::{ConvertError, Result};

use super::structs::{BtrfsChunk, BtrfsDiskKey, BtrfsStripe, CHUNK_SIZE, DISK_KEY_SIZE, STRIPE_SIZE};
use super::superblock::SuperblockInfo;
use super::{tree, CHUNK_ITEM_KEY};

/// One contiguous logical→physical mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMapping {
    pub logical: u64,
    pub physical: u64,
    pub length: u64,
    pub chunk_type: u64,
}

/// Chunk mappings sorted by logical address; resolution is a binary
/// search over half-open ranges.
#[derive(Debug, Default)]
pub struct ChunkMap {
    entries: Vec<ChunkMapping>,
}

impl ChunkMap {
    /// Bootstrap the map from the superblock's embedded chunk array.
    pub fn init_from_superblock(sb: &SuperblockInfo) -> Result<ChunkMap> {
        let mut map = ChunkMap::default();
        let array = &sb.sys_chunk_array;

        debug!("parsing sys_chunk_array ({} bytes)", array.len());

        let mut at = 0usize;
        while at < array.len() {
            if at + DISK_KEY_SIZE > array.len() {
                return Err(ConvertError::bad_format(
                    "sys_chunk_array: truncated key".to_string(),
                ));
            }
            let key = BtrfsDiskKey::read_from_prefix(&array[at..]).unwrap();
            at += DISK_KEY_SIZE;

            if key.item_type != CHUNK_ITEM_KEY {
                return Err(ConvertError::bad_format(format!(
                    "sys_chunk_array: unexpected key type 0x{:02x}",
                    key.item_type
                )));
            }

            if at + CHUNK_SIZE > array.len() {
                return Err(ConvertError::bad_format(
                    "sys_chunk_array: truncated chunk".to_string(),
                ));
            }
            let chunk = BtrfsChunk::read_from_prefix(&array[at..]).unwrap();
            let num_stripes = chunk.num_stripes.get() as usize;
            let entry_len = CHUNK_SIZE + num_stripes * STRIPE_SIZE;
            if num_stripes == 0 || at + entry_len > array.len() {
                return Err(ConvertError::bad_format(
                    "sys_chunk_array: truncated stripes".to_string(),
                ));
            }

            // Single-device layout: stripe[0] carries the mapping.
            let stripe = BtrfsStripe::read_from_prefix(&array[at + CHUNK_SIZE..]).unwrap();
            map.add(ChunkMapping {
                logical: key.offset.get(),
                physical: stripe.offset.get(),
                length: chunk.length.get(),
                chunk_type: chunk.chunk_type.get(),
            });
            at += entry_len;
        }

        map.sort();
        debug!("parsed {} system chunks", map.entries.len());
        Ok(map)
    }

    /// Walk the chunk tree and append every CHUNK_ITEM mapping. The
    /// bootstrap entries already loaded resolve the tree's own nodes.
    pub fn populate(&mut self, dev: &dyn BlockDevice, sb: &SuperblockInfo) -> Result<()> {
        debug!(
            "walking chunk tree (root=0x{:x}, level={}, nodesize={})",
            sb.chunk_root, sb.chunk_root_level, sb.nodesize
        );

        let mut found: Vec<ChunkMapping> = Vec::new();
        {
            let bootstrap: &ChunkMap = self;
            tree::walk_tree(
                dev,
                bootstrap,
                sb.chunk_root,
                sb.chunk_root_level,
                sb.nodesize,
                sb.csum_type,
                &mut |key, data| {
                    if key.item_type != CHUNK_ITEM_KEY {
                        return Ok(tree::WalkControl::Continue);
                    }
                    if data.len() < CHUNK_SIZE + STRIPE_SIZE {
                        return Err(ConvertError::corrupt(
                            "chunk tree: chunk item too small".to_string(),
                        ));
                    }
                    let chunk = BtrfsChunk::read_from_prefix(data).unwrap();
                    let num_stripes = chunk.num_stripes.get() as usize;
                    if CHUNK_SIZE + num_stripes * STRIPE_SIZE > data.len() {
                        return Err(ConvertError::corrupt(
                            "chunk tree: stripe count exceeds item size".to_string(),
                        ));
                    }
                    let stripe = BtrfsStripe::read_from_prefix(&data[CHUNK_SIZE..]).unwrap();
                    found.push(ChunkMapping {
                        logical: key.offset.get(),
                        physical: stripe.offset.get(),
                        length: chunk.length.get(),
                        chunk_type: chunk.chunk_type.get(),
                    });
                    Ok(tree::WalkControl::Continue)
                },
            )?;
        }

        for mapping in found {
            self.add(mapping);
        }
        self.sort();
        info!("chunk map: {} mappings", self.entries.len());
        Ok(())
    }

    fn add(&mut self, mapping: ChunkMapping) {
        // Bootstrap chunks reappear in the chunk tree; keep the first.
        if self.entries.iter().any(|e| e.logical == mapping.logical) {
            return;
        }
        self.entries.push(mapping);
    }

    fn sort(&mut self) {
        self.entries.sort_by_key(|e| e.logical);
    }

    /// Resolve a logical address to a physical one. Returns `None` when
    /// no chunk covers the address.
    pub fn resolve(&self, logical: u64) -> Option<u64> {
        let mut lo = 0isize;
        let mut hi = self.entries.len() as isize - 1;
        while lo <= hi {
            let mid = ((lo + hi) / 2) as usize;
            let e = &self.entries[mid];
            if logical < e.logical {
                hi = mid as isize - 1;
            } else if logical >= e.logical + e.length {
                lo = mid as isize + 1;
            } else {
                return Some(e.physical + (logical - e.logical));
            }
        }
        None
    }

    pub fn mappings(&self) -> &[ChunkMapping] {
        &self.entries
    }

    #[cfg(test)]
    pub(crate) fn from_entries(mut entries: Vec<ChunkMapping>) -> ChunkMap {
        entries.sort_by_key(|e| e.logical);
        ChunkMap { entries }
    }
}
