//! BIP 158 compact block filters
//!
//! Neutrino sync downloads one Golomb-coded set per block and matches it
//! locally against the wallet's watched scripts, so no trust is placed in the
//! serving peer's matching. The filter-header chain
//! (`sha256d(filter_hash || prev_header)`) commits each filter to its block.

use crate::core::hash::sha256d;
use crate::core::header::BlockHash;
use std::fmt;
use std::io;

/// Golomb-Rice coding parameter for the basic filter type.
pub const GOLOMB_P: u8 = 19;

/// False positive scaling parameter for the basic filter type.
pub const GOLOMB_M: u64 = 784_931;

/// The basic filter type byte (BIP 158).
pub const FILTER_TYPE_BASIC: u8 = 0;

/// One entry in the filter-header chain.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterHeader(pub [u8; 32]);

impl FilterHeader {
    /// The anchor value preceding the first committed filter.
    pub const ZERO: FilterHeader = FilterHeader([0u8; 32]);

    /// Extend the chain: `sha256d(filter_hash || prev)`.
    pub fn extend(&self, filter_hash: &[u8; 32]) -> FilterHeader {
        let mut data = [0u8; 64];
        data[..32].copy_from_slice(filter_hash);
        data[32..].copy_from_slice(&self.0);
        FilterHeader(sha256d(&data))
    }
}

impl fmt::Display for FilterHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for FilterHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilterHeader({})", self)
    }
}

/// A serialized compact filter: a CompactSize element count followed by the
/// Golomb-coded set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactFilter {
    bytes: Vec<u8>,
}

impl CompactFilter {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Double-SHA256 of the serialized filter, the value committed into the
    /// filter-header chain.
    pub fn filter_hash(&self) -> [u8; 32] {
        sha256d(&self.bytes)
    }

    /// Test whether any of the given scripts is in the set.
    ///
    /// The SipHash key is the first 16 bytes of the block hash, per BIP 158.
    pub fn contains_any(&self, block_hash: &BlockHash, scripts: &[Vec<u8>]) -> io::Result<bool> {
        if scripts.is_empty() {
            return Ok(false);
        }

        let mut reader = BitReader::new(&self.bytes);
        let n = reader.read_compact_size()?;
        if n == 0 {
            return Ok(false);
        }

        let key = siphash_key(block_hash);
        let f = n
            .checked_mul(GOLOMB_M)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "filter range overflow"))?;

        let mut targets: Vec<u64> = scripts
            .iter()
            .map(|script| hash_to_range(&key, script, f))
            .collect();
        targets.sort_unstable();
        targets.dedup();

        let mut value = 0u64;
        let mut target_idx = 0;
        for _ in 0..n {
            let delta = golomb_decode(&mut reader, GOLOMB_P)?;
            value = value.checked_add(delta).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "filter value overflow")
            })?;

            while target_idx < targets.len() && targets[target_idx] < value {
                target_idx += 1;
            }
            if target_idx >= targets.len() {
                return Ok(false);
            }
            if targets[target_idx] == value {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

/// Build a filter over a set of items. Used by tests and fixtures; real
/// filters arrive from peers over `cfilter`.
pub fn build_filter(block_hash: &BlockHash, items: &[Vec<u8>]) -> CompactFilter {
    let key = siphash_key(block_hash);

    let mut unique: Vec<&[u8]> = items.iter().map(Vec::as_slice).collect();
    unique.sort_unstable();
    unique.dedup();

    let n = unique.len() as u64;
    let f = n * GOLOMB_M;

    let mut values: Vec<u64> = unique
        .iter()
        .map(|item| hash_to_range(&key, item, f))
        .collect();
    values.sort_unstable();

    let mut writer = BitWriter::new();
    write_compact_size(&mut writer.bytes, n);
    let mut last = 0u64;
    for value in values {
        golomb_encode(&mut writer, value - last, GOLOMB_P);
        last = value;
    }
    writer.flush();
    CompactFilter::new(writer.bytes)
}

fn siphash_key(block_hash: &BlockHash) -> (u64, u64) {
    let bytes = block_hash.as_bytes();
    let k0 = u64::from_le_bytes(bytes[0..8].try_into().unwrap_or_default());
    let k1 = u64::from_le_bytes(bytes[8..16].try_into().unwrap_or_default());
    (k0, k1)
}

/// Map an item uniformly into `[0, f)` via `(siphash * f) >> 64`.
fn hash_to_range(key: &(u64, u64), item: &[u8], f: u64) -> u64 {
    let hash = siphash24(key.0, key.1, item);
    ((hash as u128 * f as u128) >> 64) as u64
}

/// SipHash-2-4 with a 64-bit output, as used by BIP 158.
fn siphash24(k0: u64, k1: u64, data: &[u8]) -> u64 {
    let mut v0 = 0x736f6d6570736575u64 ^ k0;
    let mut v1 = 0x646f72616e646f6du64 ^ k1;
    let mut v2 = 0x6c7967656e657261u64 ^ k0;
    let mut v3 = 0x7465646279746573u64 ^ k1;

    macro_rules! round {
        () => {
            v0 = v0.wrapping_add(v1);
            v1 = v1.rotate_left(13) ^ v0;
            v0 = v0.rotate_left(32);
            v2 = v2.wrapping_add(v3);
            v3 = v3.rotate_left(16) ^ v2;
            v0 = v0.wrapping_add(v3);
            v3 = v3.rotate_left(21) ^ v0;
            v2 = v2.wrapping_add(v1);
            v1 = v1.rotate_left(17) ^ v2;
            v2 = v2.rotate_left(32);
        };
    }

    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let m = u64::from_le_bytes(chunk.try_into().unwrap_or_default());
        v3 ^= m;
        round!();
        round!();
        v0 ^= m;
    }

    let tail = chunks.remainder();
    let mut last = (data.len() as u64) << 56;
    for (i, &b) in tail.iter().enumerate() {
        last |= (b as u64) << (i * 8);
    }
    v3 ^= last;
    round!();
    round!();
    v0 ^= last;

    v2 ^= 0xff;
    round!();
    round!();
    round!();
    round!();

    v0 ^ v1 ^ v2 ^ v3
}

fn golomb_decode(reader: &mut BitReader<'_>, p: u8) -> io::Result<u64> {
    let mut quotient = 0u64;
    while reader.read_bit()? {
        quotient += 1;
        if quotient > 1 << 32 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unary prefix too long",
            ));
        }
    }
    let remainder = reader.read_bits(p)?;
    Ok((quotient << p) | remainder)
}

fn golomb_encode(writer: &mut BitWriter, value: u64, p: u8) {
    let quotient = value >> p;
    for _ in 0..quotient {
        writer.write_bit(true);
    }
    writer.write_bit(false);
    writer.write_bits(value & ((1 << p) - 1), p);
}

struct BitReader<'a> {
    data: &'a [u8],
    /// Bit offset into `data`.
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> io::Result<bool> {
        let byte = self
            .data
            .get(self.pos / 8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "filter truncated"))?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Ok(bit != 0)
    }

    fn read_bits(&mut self, count: u8) -> io::Result<u64> {
        let mut value = 0u64;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()? as u64;
        }
        Ok(value)
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    /// CompactSize prefix of the element count. Only appears at the start of
    /// the filter, while the reader is still byte-aligned.
    fn read_compact_size(&mut self) -> io::Result<u64> {
        let first = self.read_byte()?;
        let extra = match first {
            0..=0xFC => return Ok(first as u64),
            0xFD => 2,
            0xFE => 4,
            0xFF => 8,
        };
        let mut bytes = [0u8; 8];
        for b in bytes.iter_mut().take(extra) {
            *b = self.read_byte()?;
        }
        Ok(u64::from_le_bytes(bytes))
    }
}

struct BitWriter {
    bytes: Vec<u8>,
    bit: u8,
    current: u8,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            bit: 0,
            current: 0,
        }
    }

    fn write_bit(&mut self, set: bool) {
        if set {
            self.current |= 1 << (7 - self.bit);
        }
        self.bit += 1;
        if self.bit == 8 {
            self.bytes.push(self.current);
            self.bit = 0;
            self.current = 0;
        }
    }

    fn write_bits(&mut self, value: u64, count: u8) {
        for i in (0..count).rev() {
            self.write_bit((value >> i) & 1 != 0);
        }
    }

    fn flush(&mut self) {
        if self.bit > 0 {
            self.bytes.push(self.current);
            self.bit = 0;
            self.current = 0;
        }
    }
}

fn write_compact_size(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xFC => out.push(value as u8),
        0xFD..=0xFFFF => {
            out.push(0xFD);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(0xFE);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xFF);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}
