//! Chain state collaborator
//!
//! The node never decides fork choice or validates consensus rules itself; it
//! hands every headers or filter batch to a [`ChainApi`] and follows its
//! instructions. [`MemoryChain`] is the in-process implementation backing the
//! binary and the tests; persistent storage lives behind the same trait.

use crate::core::{BlockHash, BlockHeader, CompactFilter, FilterHeader};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Errors surfaced by a [`ChainApi`] implementation.
///
/// Any of these means the offending batch must be discarded and the peer that
/// served it disconnected.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("header {0} does not connect to any known block")]
    Disconnected(BlockHash),
    #[error("filter header chain mismatch at height {0}")]
    CommitmentMismatch(u32),
    #[error("filter does not match committed header for block {0}")]
    FilterMismatch(BlockHash),
    #[error("unknown block {0}")]
    UnknownBlock(BlockHash),
    #[error("filter batch length does not match announced stop hash")]
    BadBatchLength,
}

/// Result of applying a headers batch: the new tip height plus, after a
/// reorg, how many stale headers the caller should consider rolled back
/// before re-requesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainUpdate {
    pub tip_height: u32,
    pub rollback: Option<u32>,
}

/// Validated chain state owned by an external collaborator.
///
/// All methods are synchronous and internally synchronized; the node only
/// ever calls them, never mutates chain data directly.
pub trait ChainApi: Send + Sync {
    /// Validate and store a batch of headers. Idempotent: re-applying an
    /// already stored batch yields the same tip.
    fn process_headers(&self, headers: &[BlockHeader]) -> Result<ChainUpdate, ChainError>;

    /// Verify a `cfheaders` batch against the stored filter-header tip and
    /// extend the filter-header chain.
    fn process_filter_headers(
        &self,
        prev_filter_header: FilterHeader,
        filter_hashes: &[[u8; 32]],
        stop_hash: BlockHash,
    ) -> Result<ChainUpdate, ChainError>;

    /// Verify a filter against its committed filter header.
    fn process_filter(&self, block_hash: BlockHash, filter: &CompactFilter)
        -> Result<(), ChainError>;

    fn best_block_header(&self) -> BlockHeader;

    fn best_height(&self) -> u32;

    /// Block locator for the current best chain, tip first.
    fn block_locator(&self) -> Vec<BlockHash>;

    fn block_hash_at(&self, height: u32) -> Option<BlockHash>;

    fn height_of(&self, hash: &BlockHash) -> Option<u32>;

    /// Tip of the verified filter-header chain and its height.
    fn filter_header_tip(&self) -> (FilterHeader, u32);
}

struct ChainInner {
    headers: Vec<BlockHeader>,
    hashes: Vec<BlockHash>,
    index: HashMap<BlockHash, u32>,
    /// Filter headers aligned with `headers`; entry 0 anchors the chain.
    filter_headers: Vec<FilterHeader>,
}

/// In-memory header and filter-header chain.
///
/// Validates linkage and filter commitments only; proof-of-work and
/// difficulty checks belong to a full chain-storage implementation.
pub struct MemoryChain {
    inner: Mutex<ChainInner>,
}

impl MemoryChain {
    pub fn new(genesis: BlockHeader) -> Self {
        let hash = genesis.hash();
        let mut index = HashMap::new();
        index.insert(hash, 0);
        Self {
            inner: Mutex::new(ChainInner {
                headers: vec![genesis],
                hashes: vec![hash],
                index,
                filter_headers: vec![FilterHeader::ZERO],
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainInner> {
        // Lock poisoning only happens after a panic in this module.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ChainApi for MemoryChain {
    fn process_headers(&self, headers: &[BlockHeader]) -> Result<ChainUpdate, ChainError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut rollback = None;

        for header in headers {
            let hash = header.hash();
            if inner.index.contains_key(&hash) {
                // Already stored; applying the same batch twice is a no-op.
                continue;
            }

            let prev_height = match inner.index.get(&header.prev_blockhash) {
                Some(&h) => h,
                None => return Err(ChainError::Disconnected(hash)),
            };

            let tip = inner.headers.len() as u32 - 1;
            if prev_height < tip {
                // Fork from below the tip: unwind the stale segment first.
                let stale = tip - prev_height;
                rollback = Some(rollback.unwrap_or(0) + stale);
                for removed in inner.hashes.drain(prev_height as usize + 1..) {
                    inner.index.remove(&removed);
                }
                inner.headers.truncate(prev_height as usize + 1);
                let keep = inner.headers.len().min(inner.filter_headers.len());
                inner.filter_headers.truncate(keep);
            }

            let height = inner.headers.len() as u32;
            inner.headers.push(*header);
            inner.hashes.push(hash);
            inner.index.insert(hash, height);
        }

        Ok(ChainUpdate {
            tip_height: inner.headers.len() as u32 - 1,
            rollback,
        })
    }

    fn process_filter_headers(
        &self,
        prev_filter_header: FilterHeader,
        filter_hashes: &[[u8; 32]],
        stop_hash: BlockHash,
    ) -> Result<ChainUpdate, ChainError> {
        let mut inner = self.lock();

        let tip_height = inner.filter_headers.len() as u32 - 1;
        let tip = inner.filter_headers[tip_height as usize];
        if prev_filter_header != tip {
            return Err(ChainError::CommitmentMismatch(tip_height));
        }

        let stop_height = *inner
            .index
            .get(&stop_hash)
            .ok_or(ChainError::UnknownBlock(stop_hash))?;
        if stop_height != tip_height + filter_hashes.len() as u32 {
            return Err(ChainError::BadBatchLength);
        }

        let mut current = tip;
        for hash in filter_hashes {
            current = current.extend(hash);
            inner.filter_headers.push(current);
        }

        Ok(ChainUpdate {
            tip_height: inner.filter_headers.len() as u32 - 1,
            rollback: None,
        })
    }

    fn process_filter(
        &self,
        block_hash: BlockHash,
        filter: &CompactFilter,
    ) -> Result<(), ChainError> {
        let inner = self.lock();
        let height = *inner
            .index
            .get(&block_hash)
            .ok_or(ChainError::UnknownBlock(block_hash))? as usize;

        let committed = inner
            .filter_headers
            .get(height)
            .ok_or(ChainError::UnknownBlock(block_hash))?;
        let prev = if height == 0 {
            FilterHeader::ZERO
        } else {
            *inner
                .filter_headers
                .get(height - 1)
                .ok_or(ChainError::UnknownBlock(block_hash))?
        };

        if prev.extend(&filter.filter_hash()) != *committed {
            return Err(ChainError::FilterMismatch(block_hash));
        }
        Ok(())
    }

    fn best_block_header(&self) -> BlockHeader {
        let inner = self.lock();
        *inner.headers.last().unwrap_or(&inner.headers[0])
    }

    fn best_height(&self) -> u32 {
        self.lock().headers.len() as u32 - 1
    }

    fn block_locator(&self) -> Vec<BlockHash> {
        let inner = self.lock();
        let tip = inner.headers.len() as u32 - 1;
        crate::core::locator_heights(tip)
            .into_iter()
            .filter_map(|h| inner.hashes.get(h as usize).copied())
            .collect()
    }

    fn block_hash_at(&self, height: u32) -> Option<BlockHash> {
        self.lock().hashes.get(height as usize).copied()
    }

    fn height_of(&self, hash: &BlockHash) -> Option<u32> {
        self.lock().index.get(hash).copied()
    }

    fn filter_header_tip(&self) -> (FilterHeader, u32) {
        let inner = self.lock();
        let height = inner.filter_headers.len() as u32 - 1;
        (inner.filter_headers[height as usize], height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::build_filter;

    fn genesis() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_blockhash: BlockHash::ZERO,
            merkle_root: BlockHash::ZERO,
            time: 0,
            bits: 0x207fffff,
            nonce: 0,
        }
    }

    fn header_after(prev: &BlockHeader, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_blockhash: prev.hash(),
            merkle_root: BlockHash::ZERO,
            time: prev.time + 600,
            bits: prev.bits,
            nonce,
        }
    }

    fn chain_of(len: usize) -> (MemoryChain, Vec<BlockHeader>) {
        let genesis = genesis();
        let chain = MemoryChain::new(genesis);
        let mut headers = Vec::new();
        let mut prev = genesis;
        for i in 0..len {
            let header = header_after(&prev, i as u32);
            headers.push(header);
            prev = header;
        }
        (chain, headers)
    }

    #[test]
    fn headers_extend_the_tip() {
        let (chain, headers) = chain_of(5);
        let update = chain.process_headers(&headers).unwrap();
        assert_eq!(update.tip_height, 5);
        assert_eq!(update.rollback, None);
        assert_eq!(chain.best_block_header(), headers[4]);
    }

    #[test]
    fn applying_a_batch_twice_is_idempotent() {
        let (chain, headers) = chain_of(5);
        let first = chain.process_headers(&headers).unwrap();
        let second = chain.process_headers(&headers).unwrap();
        assert_eq!(first.tip_height, second.tip_height);
        assert_eq!(second.rollback, None);
        assert_eq!(chain.best_height(), 5);
    }

    #[test]
    fn disconnected_header_is_rejected() {
        let (chain, _) = chain_of(0);
        let orphan = BlockHeader {
            version: 1,
            prev_blockhash: BlockHash([0x77; 32]),
            merkle_root: BlockHash::ZERO,
            time: 1,
            bits: 0x207fffff,
            nonce: 9,
        };
        assert!(matches!(
            chain.process_headers(&[orphan]),
            Err(ChainError::Disconnected(_))
        ));
        assert_eq!(chain.best_height(), 0);
    }

    #[test]
    fn fork_reports_rollback_depth() {
        let (chain, headers) = chain_of(5);
        chain.process_headers(&headers).unwrap();

        // Competing branch from height 2, longer than the stored one.
        let mut branch = Vec::new();
        let mut prev = headers[1];
        for i in 0..6 {
            let header = header_after(&prev, 1000 + i);
            branch.push(header);
            prev = header;
        }

        let update = chain.process_headers(&branch).unwrap();
        assert_eq!(update.rollback, Some(3));
        assert_eq!(update.tip_height, 8);
        assert_eq!(chain.best_block_header(), branch[5]);
    }

    #[test]
    fn filter_headers_chain_from_anchor() {
        let (chain, headers) = chain_of(3);
        chain.process_headers(&headers).unwrap();

        let hashes = [[1u8; 32], [2u8; 32], [3u8; 32]];
        let update = chain
            .process_filter_headers(FilterHeader::ZERO, &hashes, headers[2].hash())
            .unwrap();
        assert_eq!(update.tip_height, 3);

        let (tip, height) = chain.filter_header_tip();
        assert_eq!(height, 3);
        let expected = FilterHeader::ZERO
            .extend(&hashes[0])
            .extend(&hashes[1])
            .extend(&hashes[2]);
        assert_eq!(tip, expected);
    }

    #[test]
    fn mismatched_filter_header_tip_is_rejected() {
        let (chain, headers) = chain_of(3);
        chain.process_headers(&headers).unwrap();

        let bogus_prev = FilterHeader([0x55; 32]);
        let result =
            chain.process_filter_headers(bogus_prev, &[[1u8; 32]], headers[0].hash());
        assert!(matches!(result, Err(ChainError::CommitmentMismatch(_))));
        // The verified filter height must not advance.
        assert_eq!(chain.filter_header_tip().1, 0);
    }

    #[test]
    fn filter_verifies_against_commitment() {
        let (chain, headers) = chain_of(1);
        chain.process_headers(&headers).unwrap();

        let block_hash = headers[0].hash();
        let filter = build_filter(&block_hash, &[b"script".to_vec()]);
        chain
            .process_filter_headers(FilterHeader::ZERO, &[filter.filter_hash()], block_hash)
            .unwrap();

        assert!(chain.process_filter(block_hash, &filter).is_ok());

        let other = build_filter(&block_hash, &[b"different".to_vec()]);
        assert!(matches!(
            chain.process_filter(block_hash, &other),
            Err(ChainError::FilterMismatch(_))
        ));
    }
}
