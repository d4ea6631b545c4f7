//! Core chain primitives
//!
//! Block headers, hashes, and the two filter structures the sync strategies
//! are built on: BIP 37 bloom filters (SPV) and BIP 158 compact filters
//! (Neutrino).

pub mod bloom;
pub mod filters;
pub mod hash;
pub mod header;

pub use bloom::{BloomFilter, DEFAULT_FALSE_POSITIVE_RATE};
pub use filters::{build_filter, CompactFilter, FilterHeader, FILTER_TYPE_BASIC};
pub use hash::{checksum, sha256, sha256d};
pub use header::{locator_heights, BlockHash, BlockHeader};
