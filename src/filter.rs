//! Persistent bloom filter: the family's "definitely absent" oracle.
//!
//! The filter is keyed by `row + column` and shared by the whole store, not
//! by individual files. Only a negative answer is actionable: membership
//! false means no store file can contain the cell, so point reads may skip
//! the file pass entirely. Positives say nothing.
//!
//! Bits are set by double hashing: two independent 64-bit CRCs of the key
//! seed `bit_i = h1 + i * h2 (mod m)`. CRCs are stable across processes,
//! which matters because the filter round-trips through disk.

use std::fs;
use std::path::Path;

use crc::{Crc, CRC_64_ECMA_182, CRC_64_XZ};
use serde::{Deserialize, Serialize};

use crate::config::BloomConfig;
use crate::error::Result;

const HASH_A: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);
const HASH_B: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    n_bits: u64,
    n_hashes: u32,
}

impl BloomFilter {
    pub fn new(config: &BloomConfig) -> Self {
        let n_bits = config.bits.max(64);
        let words = n_bits.div_ceil(64) as usize;
        Self { bits: vec![0; words], n_bits, n_hashes: config.hashes.max(1) }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.n_hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.n_bits;
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.n_hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.n_bits;
            if self.bits[(bit / 64) as usize] & (1 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    fn hash_pair(key: &[u8]) -> (u64, u64) {
        // Force h2 odd so the probe sequence cycles the whole vector.
        (HASH_A.checksum(key), HASH_B.checksum(key) | 1)
    }

    /// Loads a filter previously written with [`BloomFilter::save`]. A
    /// missing or zero-length file yields `None`; the caller starts fresh.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match fs::metadata(path) {
            Ok(meta) if meta.len() == 0 => return Ok(None),
            Ok(_) => {}
            Err(_) => return Ok(None),
        }
        let bytes = fs::read(path)?;
        Ok(Some(bincode::deserialize(&bytes)?))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, bincode::serialize(self)?)?;
        Ok(())
    }
}
