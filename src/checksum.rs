//! Checksum kernel shared by the Btrfs reader and the Ext4 writers.
//!
//! CRC32C is the Castagnoli polynomial with seed `!0` and a final
//! one's-complement (RFC 3720). The `seed` parameter chains partial
//! buffers: pass 0 for a fresh computation and feed the result back in
//! for the next chunk.

use blake2::Blake2b;
use sha2::{Digest, Sha256};

use crate::btrfs::{CsumType, BTRFS_CSUM_SIZE};
use crate::error::{ConvertError, Result};

type Blake2b256 = Blake2b<blake2::digest::consts::U32>;

pub fn crc32c(seed: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(seed, data)
}

/// CRC16-ANSI, reflected polynomial 0x8005 (0xA001), caller-provided
/// seed. Ext4 group descriptors seed with 0xFFFF.
pub fn crc16(seed: u16, data: &[u8]) -> u16 {
    let mut crc = seed;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
    }
    crc
}

const XXH_PRIME64_1: u64 = 0x9E3779B185EBCA87;
const XXH_PRIME64_2: u64 = 0xC2B2AE3D27D4EB4F;
const XXH_PRIME64_3: u64 = 0x165667B19E3779F9;
const XXH_PRIME64_4: u64 = 0x85EBCA77C2B2AE63;
const XXH_PRIME64_5: u64 = 0x27D4EB2F165667C5;

fn xxh64_round(acc: u64, input: u64) -> u64 {
    acc.wrapping_add(input.wrapping_mul(XXH_PRIME64_2))
        .rotate_left(31)
        .wrapping_mul(XXH_PRIME64_1)
}

fn xxh64_merge_round(acc: u64, val: u64) -> u64 {
    (acc ^ xxh64_round(0, val))
        .wrapping_mul(XXH_PRIME64_1)
        .wrapping_add(XXH_PRIME64_4)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(data[at..at + 8].try_into().unwrap())
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
}

/// xxHash64 with seed 0, the variant Btrfs stores on disk.
pub fn xxhash64(data: &[u8]) -> u64 {
    let len = data.len();
    let mut at = 0usize;

    let mut hash = if len >= 32 {
        let mut v1 = XXH_PRIME64_1.wrapping_add(XXH_PRIME64_2);
        let mut v2 = XXH_PRIME64_2;
        let mut v3 = 0u64;
        let mut v4 = 0u64.wrapping_sub(XXH_PRIME64_1);

        while at + 32 <= len {
            v1 = xxh64_round(v1, read_u64(data, at));
            v2 = xxh64_round(v2, read_u64(data, at + 8));
            v3 = xxh64_round(v3, read_u64(data, at + 16));
            v4 = xxh64_round(v4, read_u64(data, at + 24));
            at += 32;
        }

        let mut h = v1
            .rotate_left(1)
            .wrapping_add(v2.rotate_left(7))
            .wrapping_add(v3.rotate_left(12))
            .wrapping_add(v4.rotate_left(18));
        h = xxh64_merge_round(h, v1);
        h = xxh64_merge_round(h, v2);
        h = xxh64_merge_round(h, v3);
        h = xxh64_merge_round(h, v4);
        h
    } else {
        XXH_PRIME64_5
    };

    hash = hash.wrapping_add(len as u64);

    while at + 8 <= len {
        hash = (hash ^ xxh64_round(0, read_u64(data, at)))
            .rotate_left(27)
            .wrapping_mul(XXH_PRIME64_1)
            .wrapping_add(XXH_PRIME64_4);
        at += 8;
    }
    if at + 4 <= len {
        hash = (hash ^ u64::from(read_u32(data, at)).wrapping_mul(XXH_PRIME64_1))
            .rotate_left(23)
            .wrapping_mul(XXH_PRIME64_2)
            .wrapping_add(XXH_PRIME64_3);
        at += 4;
    }
    while at < len {
        hash = (hash ^ u64::from(data[at]).wrapping_mul(XXH_PRIME64_5))
            .rotate_left(11)
            .wrapping_mul(XXH_PRIME64_1);
        at += 1;
    }

    hash ^= hash >> 33;
    hash = hash.wrapping_mul(XXH_PRIME64_2);
    hash ^= hash >> 29;
    hash = hash.wrapping_mul(XXH_PRIME64_3);
    hash ^= hash >> 32;
    hash
}

/// Compute the 32-byte on-disk checksum field for `data` under the
/// given algorithm. Only the leading `kind.len()` bytes are meaningful.
pub fn btrfs_csum_bytes(kind: CsumType, data: &[u8]) -> [u8; BTRFS_CSUM_SIZE] {
    let mut out = [0u8; BTRFS_CSUM_SIZE];
    match kind {
        CsumType::Crc32c => {
            out[..4].copy_from_slice(&crc32c(0, data).to_le_bytes());
        }
        CsumType::XxHash64 => {
            out[..8].copy_from_slice(&xxhash64(data).to_le_bytes());
        }
        CsumType::Sha256 => {
            out.copy_from_slice(&Sha256::digest(data));
        }
        CsumType::Blake2b => {
            let mut hasher = Blake2b256::new();
            hasher.update(data);
            out.copy_from_slice(&hasher.finalize());
        }
    }
    out
}

/// Verify a stored checksum field against the data it covers.
/// `context` names the structure for the error message.
pub fn verify_btrfs_csum(
    kind: CsumType,
    stored: &[u8],
    data: &[u8],
    context: &str,
) -> Result<()> {
    let computed = btrfs_csum_bytes(kind, data);
    let n = kind.len();
    if stored[..n] != computed[..n] {
        return Err(ConvertError::bad_format(format!(
            "{}: {} checksum mismatch (stored {:02x?}, computed {:02x?})",
            context,
            kind.name(),
            &stored[..n],
            &computed[..n]
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32c_check_value() {
        // RFC 3720 reference value for "123456789".
        assert_eq!(crc32c(0, b"123456789"), 0xE3069283);
    }

    #[test]
    fn crc32c_chaining_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let whole = crc32c(0, data);
        let mut chained = 0;
        for chunk in data.chunks(7) {
            chained = crc32c(chained, chunk);
        }
        assert_eq!(whole, chained);
    }

    #[test]
    fn crc16_check_values() {
        // CRC-16/ARC and CRC-16/MODBUS reference values.
        assert_eq!(crc16(0x0000, b"123456789"), 0xBB3D);
        assert_eq!(crc16(0xFFFF, b"123456789"), 0x4B37);
    }

    #[test]
    fn xxhash64_check_values() {
        assert_eq!(xxhash64(b""), 0xEF46DB3751D8E999);
        assert_eq!(xxhash64(b"abc"), 0x44BC2CF5AD770999);
        // Exercise the 32-byte stripe loop and every tail branch.
        let long: Vec<u8> = (0u8..=76).collect();
        let _ = xxhash64(&long);
    }

    #[test]
    fn stored_crc32c_accepted_for_btrfs_format() {
        let mut stored = [0u8; BTRFS_CSUM_SIZE];
        stored[..4].copy_from_slice(&0xE3069283u32.to_le_bytes());
        verify_btrfs_csum(CsumType::Crc32c, &stored, b"123456789", "test").unwrap();

        stored[0] ^= 1;
        assert!(verify_btrfs_csum(CsumType::Crc32c, &stored, b"123456789", "test").is_err());
    }

    #[test]
    fn wide_digests_fill_the_field() {
        let sha = btrfs_csum_bytes(CsumType::Sha256, b"x");
        let blake = btrfs_csum_bytes(CsumType::Blake2b, b"x");
        assert_ne!(sha, [0u8; 32]);
        assert_ne!(blake, [0u8; 32]);
        assert_ne!(sha, blake);
    }
}
