//! Header and filter synchronization
//!
//! [`SyncManager`] drives the light-client sync loop over whichever peer the
//! node hands it. It keeps exactly one request outstanding at a time; the
//! node owns the timeout clock and calls back in to retry or fail over when
//! a reply does not arrive.
//!
//! Two strategies share the header sync:
//!
//! * **SPV** loads a bloom filter over the watched scripts onto the peer and
//!   relies on the peer to deliver `merkleblock`/`tx` pairs for matches. The
//!   trust model is the peer's: transactions following a `merkleblock` are
//!   dispatched without local re-matching.
//! * **Neutrino** downloads the compact filter header chain, then the
//!   filters themselves, verifies each against its commitment, matches
//!   locally, and fetches full blocks only for hits.

use crate::chain::{ChainApi, ChainError};
use crate::core::{BlockHash, BlockHeader, BloomFilter, CompactFilter, DEFAULT_FALSE_POSITIVE_RATE, FILTER_TYPE_BASIC};
use crate::network::callbacks::NodeCallbacks;
use crate::network::message::{
    CfFilterMessage, CfHeadersMessage, CfRangeRequest, FilterLoadMessage, GetHeadersMessage,
    InvType, Inventory, ProtocolMessage, ServiceFlags, MAX_HEADERS_PER_MSG,
};
use crate::network::peer::{Peer, PeerMessageSender, SendError};
use crate::watch::WatchList;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// `cfheaders` batch size (BIP 157 cap).
pub const CF_HEADERS_BATCH: u32 = 2_000;

/// `getcfilters` range size (BIP 157 cap).
pub const CF_FILTERS_BATCH: u32 = 1_000;

/// How block data for wallet-relevant blocks is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// BIP 37 bloom filtering on the remote side.
    Spv,
    /// BIP 157/158 compact block filters, matched locally.
    Neutrino,
}

impl SyncMode {
    /// Service bits a peer must advertise to serve this strategy.
    pub fn required_services(&self) -> ServiceFlags {
        match self {
            SyncMode::Spv => ServiceFlags::NODE_BLOOM,
            SyncMode::Neutrino => ServiceFlags::NODE_COMPACT_FILTERS,
        }
    }
}

/// The reply category the manager is currently waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Headers,
    FilterHeaders,
    /// A `getcfilters` range; complete when the filter at `end_height` has
    /// been processed.
    Filters { end_height: u32 },
    BlockData,
}

/// The single in-flight request, kept around verbatim for retries and
/// failover to another peer.
#[derive(Debug, Clone)]
pub struct OutstandingRequest {
    pub peer: Peer,
    pub kind: RequestKind,
    pub message: ProtocolMessage,
    pub retries: u32,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("malformed compact filter for block {block}: {source}")]
    BadFilter {
        block: BlockHash,
        #[source]
        source: io::Error,
    },
}

/// Drives header and filter sync against one serving peer at a time.
pub struct SyncManager {
    chain: Arc<dyn ChainApi>,
    watch: Arc<dyn WatchList>,
    mode: SyncMode,
    protocol_version: i32,
    outstanding: Option<OutstandingRequest>,
    /// Next block height whose compact filter has not been matched yet.
    next_filter_height: u32,
    /// Matched blocks awaiting full download, oldest first.
    pending_blocks: VecDeque<BlockHash>,
}

impl SyncManager {
    pub fn new(
        chain: Arc<dyn ChainApi>,
        watch: Arc<dyn WatchList>,
        mode: SyncMode,
        protocol_version: i32,
    ) -> Self {
        Self {
            chain,
            watch,
            mode,
            protocol_version,
            outstanding: None,
            next_filter_height: 1,
            pending_blocks: VecDeque::new(),
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn outstanding(&self) -> Option<&OutstandingRequest> {
        self.outstanding.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding.is_none()
    }

    /// Height of the next compact filter to match; grows as `cfilter`
    /// replies within the current range are accepted.
    pub fn next_filter_height(&self) -> u32 {
        self.next_filter_height
    }

    /// Start (or restart) syncing against a freshly handshaked peer.
    pub async fn begin(&mut self, sender: &PeerMessageSender) -> Result<(), SyncError> {
        if self.outstanding.is_some() {
            // Already serving from another peer.
            return Ok(());
        }
        if self.mode == SyncMode::Spv {
            let bloom =
                BloomFilter::from_scripts(&self.watch.watched_scripts(), DEFAULT_FALSE_POSITIVE_RATE);
            sender
                .send(ProtocolMessage::FilterLoad(FilterLoadMessage::from(&bloom)))
                .await?;
        }
        self.request_headers(sender).await
    }

    /// Resend the in-flight request after a timeout. Returns the retry count
    /// so far, or `None` when nothing is outstanding.
    pub async fn retry(&mut self, sender: &PeerMessageSender) -> Result<Option<u32>, SendError> {
        let Some(request) = self.outstanding.as_mut() else {
            return Ok(None);
        };
        request.retries += 1;
        let retries = request.retries;
        let message = request.message.clone();
        log::warn!(
            "request '{}' to {} timed out, retry {}",
            message.command(),
            request.peer,
            retries
        );
        sender.send(message).await?;
        Ok(Some(retries))
    }

    /// Move the in-flight request to a different peer, resetting the retry
    /// budget.
    pub async fn failover(&mut self, sender: &PeerMessageSender) -> Result<(), SendError> {
        if let Some(request) = self.outstanding.as_mut() {
            log::info!(
                "failing over '{}' from {} to {}",
                request.message.command(),
                request.peer,
                sender.peer()
            );
            request.peer = sender.peer();
            request.retries = 0;
            let message = request.message.clone();
            sender.send(message).await?;
        }
        Ok(())
    }

    /// Drop the in-flight request without replacement, e.g. when the last
    /// peer is gone.
    pub fn abort(&mut self) -> Option<OutstandingRequest> {
        self.outstanding.take()
    }

    /// Process a message forwarded by a handshaked peer.
    pub async fn handle_message(
        &mut self,
        peer: Peer,
        message: ProtocolMessage,
        sender: &PeerMessageSender,
        callbacks: &NodeCallbacks,
    ) -> Result<(), SyncError> {
        match message {
            ProtocolMessage::Headers(headers) => {
                self.handle_headers(&headers, sender, callbacks).await
            }
            ProtocolMessage::CfHeaders(cf) => self.handle_cf_headers(cf, sender).await,
            ProtocolMessage::CfFilter(cf) => self.handle_cf_filter(cf, sender, callbacks).await,
            ProtocolMessage::Inv(items) => self.handle_inv(items, sender).await,
            ProtocolMessage::MerkleBlock(m) => {
                // BIP 37 trust model: the matched transactions follow as
                // separate `tx` messages, no local re-verification.
                log::debug!(
                    "merkleblock {} with {} matched hashes from {}",
                    m.header.hash(),
                    m.hashes.len(),
                    peer
                );
                if self.mode == SyncMode::Spv
                    && matches!(self.outstanding_kind(), Some(RequestKind::BlockData))
                {
                    self.outstanding = None;
                    self.advance(sender).await
                } else {
                    Ok(())
                }
            }
            ProtocolMessage::Tx(tx) => {
                log::info!("transaction {} from {}", tx.txid(), peer);
                callbacks.dispatch_transaction(&tx);
                Ok(())
            }
            ProtocolMessage::Addr(entries) => {
                // Candidate peers for manual configuration; this node only
                // dials the configured set.
                for entry in &entries {
                    log::debug!("peer {peer} announced {}", entry.addr.addr);
                }
                Ok(())
            }
            ProtocolMessage::Reject(r) => {
                log::warn!(
                    "peer {peer} rejected '{}' ({:?}): {}",
                    r.message,
                    r.code,
                    r.reason
                );
                Ok(())
            }
            ProtocolMessage::Unknown { command, payload } if command == "block" => {
                self.handle_block(&payload, sender).await
            }
            other => {
                log::debug!("no sync handling for '{}' from {}", other.command(), peer);
                Ok(())
            }
        }
    }

    async fn request_headers(&mut self, sender: &PeerMessageSender) -> Result<(), SyncError> {
        let message = ProtocolMessage::GetHeaders(GetHeadersMessage {
            version: self.protocol_version as u32,
            locator: self.chain.block_locator(),
            stop_hash: BlockHash::ZERO,
        });
        self.track_and_send(RequestKind::Headers, message, sender)
            .await
    }

    async fn handle_headers(
        &mut self,
        headers: &[BlockHeader],
        sender: &PeerMessageSender,
        callbacks: &NodeCallbacks,
    ) -> Result<(), SyncError> {
        if headers.is_empty() {
            if matches!(self.outstanding_kind(), Some(RequestKind::Headers)) {
                self.outstanding = None;
            }
            return self.advance(sender).await;
        }

        // The request stays outstanding until the chain accepts the batch:
        // a rejected batch drops the peer, and the request must still name
        // it so the disconnect fails over to a surviving peer.
        let update = self.chain.process_headers(headers)?;
        if matches!(self.outstanding_kind(), Some(RequestKind::Headers)) {
            self.outstanding = None;
        }
        if let Some(depth) = update.rollback {
            log::warn!("reorg rolled back {depth} headers, resuming from height {}", update.tip_height);
            // The filter-header chain was truncated along with the stale
            // headers; resume filter matching from the surviving segment.
            let (_, filter_tip) = self.chain.filter_header_tip();
            self.next_filter_height = self.next_filter_height.min(filter_tip + 1);
        }
        log::info!("header chain at height {}", update.tip_height);
        callbacks.dispatch_headers(headers, update.tip_height);

        if self.mode == SyncMode::Spv {
            // Every stored block gets fetched in filtered form; the remote
            // bloom filter decides which transactions come back with it.
            self.pending_blocks.extend(headers.iter().map(|h| h.hash()));
        }

        if headers.len() as u64 == MAX_HEADERS_PER_MSG {
            // The peer may have more; keep paging.
            self.request_headers(sender).await
        } else {
            self.advance(sender).await
        }
    }

    async fn request_filter_headers(&mut self, sender: &PeerMessageSender) -> Result<(), SyncError> {
        let (_, filter_tip) = self.chain.filter_header_tip();
        let best = self.chain.best_height();
        let stop_height = best.min(filter_tip + CF_HEADERS_BATCH);
        let Some(stop_hash) = self.chain.block_hash_at(stop_height) else {
            return Ok(());
        };

        let message = ProtocolMessage::GetCfHeaders(CfRangeRequest {
            filter_type: FILTER_TYPE_BASIC,
            start_height: filter_tip + 1,
            stop_hash,
        });
        self.track_and_send(RequestKind::FilterHeaders, message, sender)
            .await
    }

    async fn handle_cf_headers(
        &mut self,
        cf: CfHeadersMessage,
        sender: &PeerMessageSender,
    ) -> Result<(), SyncError> {
        if cf.filter_type != FILTER_TYPE_BASIC {
            log::debug!("ignoring cfheaders of filter type {}", cf.filter_type);
            return Ok(());
        }
        let update = self.chain.process_filter_headers(
            cf.prev_filter_header,
            &cf.filter_hashes,
            cf.stop_hash,
        )?;
        if matches!(self.outstanding_kind(), Some(RequestKind::FilterHeaders)) {
            self.outstanding = None;
        }
        log::info!("filter header chain at height {}", update.tip_height);
        self.advance(sender).await
    }

    async fn request_filters(&mut self, sender: &PeerMessageSender) -> Result<(), SyncError> {
        let (_, filter_tip) = self.chain.filter_header_tip();
        let start = self.next_filter_height;
        let end = filter_tip.min(start + CF_FILTERS_BATCH - 1);
        let Some(stop_hash) = self.chain.block_hash_at(end) else {
            return Ok(());
        };

        let message = ProtocolMessage::GetCfFilters(CfRangeRequest {
            filter_type: FILTER_TYPE_BASIC,
            start_height: start,
            stop_hash,
        });
        self.track_and_send(RequestKind::Filters { end_height: end }, message, sender)
            .await
    }

    async fn handle_cf_filter(
        &mut self,
        cf: CfFilterMessage,
        sender: &PeerMessageSender,
        callbacks: &NodeCallbacks,
    ) -> Result<(), SyncError> {
        if cf.filter_type != FILTER_TYPE_BASIC {
            log::debug!("ignoring cfilter of filter type {}", cf.filter_type);
            return Ok(());
        }

        let filter = CompactFilter::new(cf.filter);
        self.chain.process_filter(cf.block_hash, &filter)?;

        let height = self
            .chain
            .height_of(&cf.block_hash)
            .ok_or(ChainError::UnknownBlock(cf.block_hash))?;

        let scripts = self.watch.watched_scripts();
        let matched = !scripts.is_empty()
            && filter
                .contains_any(&cf.block_hash, &scripts)
                .map_err(|source| SyncError::BadFilter {
                    block: cf.block_hash,
                    source,
                })?;
        if matched {
            log::info!("filter match in block {} at height {height}", cf.block_hash);
            callbacks.dispatch_filter_match(&cf.block_hash, height);
            self.pending_blocks.push_back(cf.block_hash);
        }
        if height >= self.next_filter_height {
            self.next_filter_height = height + 1;
        }

        match self.outstanding_kind() {
            Some(RequestKind::Filters { end_height }) if height >= end_height => {
                self.outstanding = None;
                self.advance(sender).await
            }
            _ => Ok(()),
        }
    }

    async fn request_block(
        &mut self,
        hash: BlockHash,
        sender: &PeerMessageSender,
    ) -> Result<(), SyncError> {
        let item = match self.mode {
            SyncMode::Spv => Inventory::filtered_block(hash),
            SyncMode::Neutrino => Inventory::block(hash),
        };
        let message = ProtocolMessage::GetData(vec![item]);
        self.track_and_send(RequestKind::BlockData, message, sender)
            .await
    }

    /// Full blocks come back under the `block` command, which is outside the
    /// decoded catalogue; the raw payload starts with the 80-byte header.
    async fn handle_block(
        &mut self,
        payload: &[u8],
        sender: &PeerMessageSender,
    ) -> Result<(), SyncError> {
        if payload.len() >= BlockHeader::SIZE {
            let hash = BlockHash(crate::core::sha256d(&payload[..BlockHeader::SIZE]));
            log::info!("received block {hash} ({} bytes)", payload.len());
        }
        if matches!(self.outstanding_kind(), Some(RequestKind::BlockData)) {
            self.outstanding = None;
            self.advance(sender).await
        } else {
            Ok(())
        }
    }

    async fn handle_inv(
        &mut self,
        items: Vec<Inventory>,
        sender: &PeerMessageSender,
    ) -> Result<(), SyncError> {
        let new_blocks: Vec<_> = items
            .iter()
            .filter(|item| item.kind == InvType::Block)
            .filter(|item| self.chain.height_of(&item.hash).is_none())
            .collect();
        if new_blocks.is_empty() {
            return Ok(());
        }

        match self.mode {
            SyncMode::Spv => {
                // Queue the filtered downloads; matches come back as
                // merkleblock + tx, one request in flight at a time.
                for item in new_blocks {
                    self.pending_blocks.push_back(item.hash);
                }
                if self.is_idle() {
                    self.advance(sender).await
                } else {
                    Ok(())
                }
            }
            SyncMode::Neutrino => {
                // A block announcement means our header chain is behind.
                if self.is_idle() {
                    self.request_headers(sender).await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Pick the next request once the current one completed: queued block
    /// downloads first, then filters, then more filter headers.
    async fn advance(&mut self, sender: &PeerMessageSender) -> Result<(), SyncError> {
        if let Some(hash) = self.pending_blocks.pop_front() {
            return self.request_block(hash, sender).await;
        }
        if self.mode != SyncMode::Neutrino {
            log::debug!("header sync idle at height {}", self.chain.best_height());
            return Ok(());
        }

        let (_, filter_tip) = self.chain.filter_header_tip();
        if self.next_filter_height <= filter_tip {
            return self.request_filters(sender).await;
        }
        if filter_tip < self.chain.best_height() {
            return self.request_filter_headers(sender).await;
        }

        log::info!("fully synced at height {}", self.chain.best_height());
        Ok(())
    }

    fn outstanding_kind(&self) -> Option<RequestKind> {
        self.outstanding.as_ref().map(|r| r.kind)
    }

    async fn track_and_send(
        &mut self,
        kind: RequestKind,
        message: ProtocolMessage,
        sender: &PeerMessageSender,
    ) -> Result<(), SyncError> {
        self.outstanding = Some(OutstandingRequest {
            peer: sender.peer(),
            kind,
            message: message.clone(),
            retries: 0,
        });
        sender.send(message).await?;
        Ok(())
    }
}
