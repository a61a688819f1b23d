//! Bloom filter guarding the spilled inode-map hash table.
//!
//! About 10 bits per element with k=7 hash functions gives a ~1% false
//! positive rate, enough to keep absent-key lookups off a disk-backed
//! hash on slow media. No false negatives.

const MAX_FILTER_BYTES: u64 = 512 * 1024 * 1024;

pub struct BloomFilter {
    bits: Vec<u8>,
    size_bits: u64,
    num_hashes: u32,
}

fn bloom_hash(mut key: u64, seed: u32) -> u64 {
    key ^= u64::from(seed);
    key = key.wrapping_mul(0x517CC1B727220A95);
    key ^= key >> 32;
    key = key.wrapping_mul(0x6C62272E07BB0142);
    key ^= key >> 32;
    key
}

impl BloomFilter {
    pub fn new(expected_items: u64) -> BloomFilter {
        let mut size_bits = expected_items.saturating_mul(10).max(1024);
        let mut byte_count = (size_bits + 7) / 8;
        if byte_count > MAX_FILTER_BYTES {
            byte_count = MAX_FILTER_BYTES;
            size_bits = byte_count * 8;
        }
        BloomFilter {
            bits: vec![0u8; byte_count as usize],
            size_bits,
            num_hashes: 7,
        }
    }

    pub fn add(&mut self, key: u64) {
        for i in 0..self.num_hashes {
            let h = bloom_hash(key, i) % self.size_bits;
            self.bits[(h / 8) as usize] |= 1 << (h % 8);
        }
    }

    /// False means definitely absent; true means probably present.
    pub fn contains(&self, key: u64) -> bool {
        for i in 0..self.num_hashes {
            let h = bloom_hash(key, i) % self.size_bits;
            if self.bits[(h / 8) as usize] & (1 << (h % 8)) == 0 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let mut bf = BloomFilter::new(1000);
        for key in (0..1000u64).map(|i| i * 7 + 3) {
            bf.add(key);
        }
        for key in (0..1000u64).map(|i| i * 7 + 3) {
            assert!(bf.contains(key));
        }
    }

    #[test]
    fn most_absent_keys_are_rejected() {
        let mut bf = BloomFilter::new(1000);
        for key in 0..1000u64 {
            bf.add(key);
        }
        let false_positives = (1_000_000..1_010_000u64)
            .filter(|&k| bf.contains(k))
            .count();
        // ~1% expected; allow generous slack.
        assert!(false_positives < 500, "{} false positives", false_positives);
    }
}
