//! Block headers and block hashes
//!
//! An 80-byte block header is the unit of light-client sync: the node never
//! downloads full blocks during header sync, only these headers plus the
//! filter data committed to them.

use crate::core::hash::sha256d;
use bytes::{Buf, BufMut};
use std::fmt;
use std::io;

/// A block hash in internal (little-endian) byte order, as used on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// The all-zero hash, used as locator stop value and genesis parent.
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from the human-readable (big-endian) hex form.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        bytes.reverse();
        Ok(BlockHash(bytes))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Display in the big-endian form used by explorers.
        let mut bytes = self.0;
        bytes.reverse();
        write!(f, "{}", hex::encode(bytes))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self)
    }
}

/// A Bitcoin block header, exactly 80 bytes on the wire.
///
/// Layout (all fields little-endian):
///
/// ```text
/// 4  bytes  version
/// 32 bytes  previous block hash
/// 32 bytes  merkle root
/// 4  bytes  timestamp
/// 4  bytes  nBits (compact target)
/// 4  bytes  nonce
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_blockhash: BlockHash,
    pub merkle_root: BlockHash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Serialized size of a header.
    pub const SIZE: usize = 80;

    /// Write the 80-byte wire form.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.version);
        buf.put_slice(&self.prev_blockhash.0);
        buf.put_slice(&self.merkle_root.0);
        buf.put_u32_le(self.time);
        buf.put_u32_le(self.bits);
        buf.put_u32_le(self.nonce);
    }

    /// Read the 80-byte wire form.
    pub fn decode<B: Buf>(buf: &mut B) -> io::Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated block header",
            ));
        }
        let version = buf.get_i32_le();
        let mut prev = [0u8; 32];
        buf.copy_to_slice(&mut prev);
        let mut merkle = [0u8; 32];
        buf.copy_to_slice(&mut merkle);
        Ok(BlockHeader {
            version,
            prev_blockhash: BlockHash(prev),
            merkle_root: BlockHash(merkle),
            time: buf.get_u32_le(),
            bits: buf.get_u32_le(),
            nonce: buf.get_u32_le(),
        })
    }

    /// The block hash: double-SHA256 of the serialized header.
    pub fn hash(&self) -> BlockHash {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        self.encode(&mut bytes);
        BlockHash(sha256d(&bytes))
    }
}

/// Heights to include in a block locator for a chain of the given tip height.
///
/// The first ten entries step back one block at a time, then the step doubles,
/// always ending at genesis. Peers scan the locator front to back and respond
/// with headers after the first hash they recognize.
pub fn locator_heights(tip: u32) -> Vec<u32> {
    let mut heights = Vec::new();
    let mut height = tip as i64;
    let mut step = 1i64;
    while height > 0 {
        heights.push(height as u32);
        if heights.len() >= 10 {
            step *= 2;
        }
        height -= step;
    }
    heights.push(0);
    heights
}
