//! BIP 37 bloom filter
//!
//! The filter is loaded onto a remote peer with `filterload` so the peer can
//! limit `merkleblock`/`tx` traffic to transactions that may involve the
//! wallet's watched scripts. False positives are expected and harmless; false
//! negatives never occur.

/// Default false positive rate when sizing a filter.
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.0001;

/// Maximum filter size in bytes (BIP 37).
pub const MAX_FILTER_SIZE: usize = 36_000;

/// Maximum number of hash functions (BIP 37).
pub const MAX_HASH_FUNCS: u32 = 50;

/// Bloom filter update flags.
pub const BLOOM_UPDATE_NONE: u8 = 0;
pub const BLOOM_UPDATE_ALL: u8 = 1;
pub const BLOOM_UPDATE_P2PUBKEY_ONLY: u8 = 2;

/// A BIP 37 bloom filter over watched scripts and outpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    flags: u8,
}

impl BloomFilter {
    /// Create a filter with explicit parameters.
    pub fn new(size_bytes: usize, hash_funcs: u32, tweak: u32, flags: u8) -> Self {
        Self {
            data: vec![0u8; size_bytes.clamp(1, MAX_FILTER_SIZE)],
            hash_funcs: hash_funcs.clamp(1, MAX_HASH_FUNCS),
            tweak,
            flags,
        }
    }

    /// Create a filter sized for `n_elements` at the given false positive
    /// rate, with a random tweak.
    pub fn for_elements(n_elements: usize, fp_rate: f64) -> Self {
        let n = n_elements.max(1) as f64;
        let ln2_squared = std::f64::consts::LN_2 * std::f64::consts::LN_2;
        let size_bits = (-n * fp_rate.ln() / ln2_squared) as usize;
        let size_bytes = (size_bits / 8 + 1).clamp(1, MAX_FILTER_SIZE);

        let hash_funcs = ((size_bytes * 8) as f64 / n * std::f64::consts::LN_2) as u32;
        let hash_funcs = hash_funcs.clamp(1, MAX_HASH_FUNCS);

        Self::new(size_bytes, hash_funcs, rand::random(), BLOOM_UPDATE_ALL)
    }

    /// Build a filter over a set of watched scripts.
    pub fn from_scripts(scripts: &[Vec<u8>], fp_rate: f64) -> Self {
        let mut filter = Self::for_elements(scripts.len(), fp_rate);
        for script in scripts {
            filter.insert(script);
        }
        filter
    }

    /// Add an element to the filter.
    pub fn insert(&mut self, data: &[u8]) {
        for i in 0..self.hash_funcs {
            let idx = self.bit_index(data, i);
            self.data[idx / 8] |= 1 << (idx % 8);
        }
    }

    /// Check whether an element may be in the filter.
    pub fn contains(&self, data: &[u8]) -> bool {
        (0..self.hash_funcs).all(|i| {
            let idx = self.bit_index(data, i);
            self.data[idx / 8] & (1 << (idx % 8)) != 0
        })
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn hash_funcs(&self) -> u32 {
        self.hash_funcs
    }

    pub fn tweak(&self) -> u32 {
        self.tweak
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    fn bit_index(&self, data: &[u8], n: u32) -> usize {
        // BIP 37: seed = n * 0xFBA4C795 + tweak
        let seed = n.wrapping_mul(0xFBA4C795).wrapping_add(self.tweak);
        murmur3_32(seed, data) as usize % (self.data.len() * 8)
    }
}

/// MurmurHash3 32-bit, as mandated by BIP 37.
fn murmur3_32(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h = (h ^ k).rotate_left(13).wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &b) in tail.iter().enumerate() {
            k |= (b as u32) << (i * 8);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85ebca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2ae35);
    h ^ (h >> 16)
}
