//! Frequency filters backing the W-TinyLFU admission decision.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// splitmix64 step, used to derive independent probe positions from one
/// base hash.
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn base_hash<K: Hash>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

const NUM_PROBES: usize = 3;

fn probes<K: Hash>(key: &K, mask: u64) -> [usize; NUM_PROBES] {
    let mut state = base_hash(key);
    let mut out = [0usize; NUM_PROBES];
    for slot in &mut out {
        *slot = (splitmix64(&mut state) & mask) as usize;
    }
    out
}

/// Admission doorkeeper: remembers whether a key has been seen at all since
/// the last reset, so one-hit wonders never reach the counting sketch.
pub struct BloomFilter {
    bits: Vec<u64>,
    mask: u64,
}

impl BloomFilter {
    pub fn new(capacity: usize) -> Self {
        // 8 bits per expected entry, rounded up to a power of two
        let num_bits = (capacity.max(8) * 8).next_power_of_two();
        BloomFilter {
            bits: vec![0u64; num_bits / 64],
            mask: num_bits as u64 - 1,
        }
    }

    /// Records an observation; returns `true` if the key was new.
    pub fn observe<K: Hash>(&mut self, key: &K) -> bool {
        let mut newly_set = false;
        for probe in probes(key, self.mask) {
            let word = probe / 64;
            let bit = 1u64 << (probe % 64);
            if self.bits[word] & bit == 0 {
                self.bits[word] |= bit;
                newly_set = true;
            }
        }
        newly_set
    }

    pub fn estimate<K: Hash>(&self, key: &K) -> u32 {
        let seen = probes(key, self.mask)
            .into_iter()
            .all(|probe| self.bits[probe / 64] & (1 << (probe % 64)) != 0);
        u32::from(seen)
    }

    pub fn reset(&mut self) {
        self.bits.fill(0);
    }
}

/// Counting bloom filter with 4-bit saturating counters.
pub struct SpectralBloomFilter {
    // two counters per byte
    counters: Vec<u8>,
    mask: u64,
}

impl SpectralBloomFilter {
    pub fn new(capacity: usize) -> Self {
        let num_counters = (capacity.max(8) * 8).next_power_of_two();
        SpectralBloomFilter {
            counters: vec![0u8; num_counters / 2],
            mask: num_counters as u64 - 1,
        }
    }

    fn get(&self, probe: usize) -> u8 {
        let byte = self.counters[probe / 2];
        if probe % 2 == 0 {
            byte & 0x0f
        } else {
            byte >> 4
        }
    }

    fn put(&mut self, probe: usize, value: u8) {
        let byte = &mut self.counters[probe / 2];
        if probe % 2 == 0 {
            *byte = (*byte & 0xf0) | value;
        } else {
            *byte = (*byte & 0x0f) | (value << 4);
        }
    }

    /// Increments the key's counters; returns `false` once the estimate is
    /// saturated.
    pub fn observe<K: Hash>(&mut self, key: &K) -> bool {
        let positions = probes(key, self.mask);
        let minimum = positions
            .iter()
            .map(|&probe| self.get(probe))
            .min()
            .unwrap_or(0);
        if minimum == 0x0f {
            return false;
        }
        // conservative update: only the minimal counters grow
        for probe in positions {
            let current = self.get(probe);
            if current == minimum {
                self.put(probe, current + 1);
            }
        }
        true
    }

    pub fn estimate<K: Hash>(&self, key: &K) -> u32 {
        probes(key, self.mask)
            .into_iter()
            .map(|probe| self.get(probe))
            .min()
            .unwrap_or(0) as u32
    }

    /// Ages the sketch by halving every counter.
    pub fn reset(&mut self) {
        for byte in &mut self.counters {
            *byte = (*byte >> 1) & 0x77;
        }
    }
}
