//! Protocol message model
//!
//! One enum variant per supported P2P command, each carrying exactly the
//! fields the wire format defines. Dispatch over messages is always an
//! exhaustive `match`, so adding a variant is a compile-time-checked change
//! everywhere messages are handled.
//!
//! Payload layouts follow the reference protocol documentation:
//! <https://developer.bitcoin.org/reference/p2p_networking.html>

use crate::core::{BlockHash, BlockHeader, BloomFilter, FilterHeader};
use bitflags::bitflags;
use bytes::BufMut;
use rand::Rng;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

/// Upper bound on `inv`/`getdata` entries (protocol rule).
pub const MAX_INV_ENTRIES: u64 = 50_000;

/// Upper bound on headers per `headers` message (protocol rule).
pub const MAX_HEADERS_PER_MSG: u64 = 2_000;

/// Upper bound on filter hashes per `cfheaders` message (BIP 157).
pub const MAX_CF_HEADERS_PER_MSG: u64 = 2_000;

/// Maximum `filteradd` data length (BIP 37).
pub const MAX_FILTER_ADD_SIZE: u64 = 520;

bitflags! {
    /// Service bits advertised in `version` messages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ServiceFlags: u64 {
        const NODE_NETWORK = 1;
        const NODE_BLOOM = 1 << 2;
        const NODE_WITNESS = 1 << 3;
        const NODE_COMPACT_FILTERS = 1 << 6;
        const NODE_NETWORK_LIMITED = 1 << 10;
    }
}

/// A network address as embedded in `version` and `addr` payloads:
/// services, a 16-byte IPv6(-mapped) address and a big-endian port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddr {
    pub services: ServiceFlags,
    pub addr: SocketAddr,
}

impl NetAddr {
    pub fn new(addr: SocketAddr, services: ServiceFlags) -> Self {
        Self { services, addr }
    }

    /// The all-zero address used when the sender does not know (or care
    /// about) an endpoint.
    pub fn unspecified() -> Self {
        Self {
            services: ServiceFlags::empty(),
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        }
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.services.bits());
        let octets = match self.addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        buf.put_slice(&octets);
        buf.put_u16(self.addr.port());
    }

    fn decode(reader: &mut Reader<'_>) -> io::Result<Self> {
        let services = ServiceFlags::from_bits_retain(reader.u64()?);
        let mut octets = [0u8; 16];
        octets.copy_from_slice(reader.take(16, "net_addr ip")?);
        let port = reader.u16_be()?;

        let v6 = Ipv6Addr::from(octets);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        Ok(Self {
            services,
            addr: SocketAddr::new(ip, port),
        })
    }
}

/// An `addr` entry: a known-peer address plus its last-seen timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedNetAddr {
    pub timestamp: u32,
    pub addr: NetAddr,
}

/// The `version` handshake payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: ServiceFlags,
    pub timestamp: i64,
    pub addr_recv: NetAddr,
    pub addr_from: NetAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    /// Build the local `version` announcement sent on connect.
    ///
    /// `relay` is false: in SPV mode the peer must not relay transactions
    /// until the bloom filter is loaded, and Neutrino never wants relay.
    pub fn new(
        protocol_version: i32,
        services: ServiceFlags,
        remote: SocketAddr,
        start_height: i32,
        user_agent: &str,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self {
            version: protocol_version,
            services,
            timestamp,
            addr_recv: NetAddr::new(remote, ServiceFlags::empty()),
            addr_from: NetAddr::unspecified(),
            nonce: rand::thread_rng().gen(),
            user_agent: user_agent.to_string(),
            start_height,
            relay: false,
        }
    }
}

/// Inventory item kind in `inv`/`getdata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvType {
    Tx,
    Block,
    FilteredBlock,
    Other(u32),
}

impl InvType {
    fn to_u32(self) -> u32 {
        match self {
            InvType::Tx => 1,
            InvType::Block => 2,
            InvType::FilteredBlock => 3,
            InvType::Other(v) => v,
        }
    }

    fn from_u32(value: u32) -> Self {
        match value {
            1 => InvType::Tx,
            2 => InvType::Block,
            3 => InvType::FilteredBlock,
            other => InvType::Other(other),
        }
    }
}

/// One `inv`/`getdata` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inventory {
    pub kind: InvType,
    pub hash: BlockHash,
}

impl Inventory {
    pub fn block(hash: BlockHash) -> Self {
        Self {
            kind: InvType::Block,
            hash,
        }
    }

    pub fn filtered_block(hash: BlockHash) -> Self {
        Self {
            kind: InvType::FilteredBlock,
            hash,
        }
    }
}

/// The `getheaders` request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMessage {
    pub version: u32,
    pub locator: Vec<BlockHash>,
    pub stop_hash: BlockHash,
}

/// The `filterload` payload carrying a serialized bloom filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLoadMessage {
    pub filter: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: u8,
}

impl From<&BloomFilter> for FilterLoadMessage {
    fn from(bloom: &BloomFilter) -> Self {
        Self {
            filter: bloom.data().to_vec(),
            hash_funcs: bloom.hash_funcs(),
            tweak: bloom.tweak(),
            flags: bloom.flags(),
        }
    }
}

/// The `filteradd` payload: one element to add to the remote filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterAddMessage {
    pub data: Vec<u8>,
}

/// The `merkleblock` payload: a header plus a partial merkle tree proving
/// which transactions matched the loaded bloom filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlockMessage {
    pub header: BlockHeader,
    pub total_transactions: u32,
    pub hashes: Vec<[u8; 32]>,
    pub flags: Vec<u8>,
}

/// A raw transaction as received over `tx`. The node treats the body as
/// opaque bytes; parsing outputs is wallet territory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxMessage {
    pub raw: Vec<u8>,
}

impl TxMessage {
    /// Transaction id: double-SHA256 of the serialized transaction.
    pub fn txid(&self) -> BlockHash {
        BlockHash(crate::core::sha256d(&self.raw))
    }
}

/// The `cfheaders` response payload (BIP 157).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfHeadersMessage {
    pub filter_type: u8,
    pub stop_hash: BlockHash,
    pub prev_filter_header: FilterHeader,
    pub filter_hashes: Vec<[u8; 32]>,
}

/// The `cfilter` response payload (BIP 157).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfFilterMessage {
    pub filter_type: u8,
    pub block_hash: BlockHash,
    pub filter: Vec<u8>,
}

/// The `getcfheaders`/`getcfilters` request payload (identical layouts).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfRangeRequest {
    pub filter_type: u8,
    pub start_height: u32,
    pub stop_hash: BlockHash,
}

/// Reject reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    NonStandard,
    Dust,
    InsufficientFee,
    Checkpoint,
    Other(u8),
}

impl RejectCode {
    fn to_u8(self) -> u8 {
        match self {
            RejectCode::Malformed => 0x01,
            RejectCode::Invalid => 0x10,
            RejectCode::Obsolete => 0x11,
            RejectCode::Duplicate => 0x12,
            RejectCode::NonStandard => 0x40,
            RejectCode::Dust => 0x41,
            RejectCode::InsufficientFee => 0x42,
            RejectCode::Checkpoint => 0x43,
            RejectCode::Other(v) => v,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0x01 => RejectCode::Malformed,
            0x10 => RejectCode::Invalid,
            0x11 => RejectCode::Obsolete,
            0x12 => RejectCode::Duplicate,
            0x40 => RejectCode::NonStandard,
            0x41 => RejectCode::Dust,
            0x42 => RejectCode::InsufficientFee,
            0x43 => RejectCode::Checkpoint,
            other => RejectCode::Other(other),
        }
    }
}

/// The `reject` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    pub message: String,
    pub code: RejectCode,
    pub reason: String,
}

/// A decoded P2P message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Addr(Vec<TimedNetAddr>),
    Inv(Vec<Inventory>),
    GetData(Vec<Inventory>),
    Headers(Vec<BlockHeader>),
    GetHeaders(GetHeadersMessage),
    FilterLoad(FilterLoadMessage),
    FilterAdd(FilterAddMessage),
    MerkleBlock(MerkleBlockMessage),
    Tx(TxMessage),
    CfHeaders(CfHeadersMessage),
    CfFilter(CfFilterMessage),
    GetCfHeaders(CfRangeRequest),
    GetCfFilters(CfRangeRequest),
    Reject(RejectMessage),
    /// A command this node does not implement. Never fatal; logged and
    /// dropped after the handshake, per protocol convention.
    Unknown { command: String, payload: Vec<u8> },
}

impl ProtocolMessage {
    /// The wire command name.
    pub fn command(&self) -> &str {
        match self {
            ProtocolMessage::Version(_) => "version",
            ProtocolMessage::Verack => "verack",
            ProtocolMessage::Ping(_) => "ping",
            ProtocolMessage::Pong(_) => "pong",
            ProtocolMessage::Addr(_) => "addr",
            ProtocolMessage::Inv(_) => "inv",
            ProtocolMessage::GetData(_) => "getdata",
            ProtocolMessage::Headers(_) => "headers",
            ProtocolMessage::GetHeaders(_) => "getheaders",
            ProtocolMessage::FilterLoad(_) => "filterload",
            ProtocolMessage::FilterAdd(_) => "filteradd",
            ProtocolMessage::MerkleBlock(_) => "merkleblock",
            ProtocolMessage::Tx(_) => "tx",
            ProtocolMessage::CfHeaders(_) => "cfheaders",
            ProtocolMessage::CfFilter(_) => "cfilter",
            ProtocolMessage::GetCfHeaders(_) => "getcfheaders",
            ProtocolMessage::GetCfFilters(_) => "getcfilters",
            ProtocolMessage::Reject(_) => "reject",
            ProtocolMessage::Unknown { command, .. } => command,
        }
    }

    /// The 12-byte NUL-padded command field.
    pub fn command_bytes(&self) -> [u8; 12] {
        let mut padded = [0u8; 12];
        let name = self.command().as_bytes();
        let len = name.len().min(12);
        padded[..len].copy_from_slice(&name[..len]);
        padded
    }

    /// True for the two messages that may be sent before the handshake
    /// completes.
    pub fn is_handshake_message(&self) -> bool {
        matches!(self, ProtocolMessage::Version(_) | ProtocolMessage::Verack)
    }

    /// Serialize the payload (frame header excluded).
    pub fn encode_payload<B: BufMut>(&self, buf: &mut B) {
        match self {
            ProtocolMessage::Version(v) => {
                buf.put_i32_le(v.version);
                buf.put_u64_le(v.services.bits());
                buf.put_i64_le(v.timestamp);
                v.addr_recv.encode(buf);
                v.addr_from.encode(buf);
                buf.put_u64_le(v.nonce);
                put_var_str(buf, &v.user_agent);
                buf.put_i32_le(v.start_height);
                buf.put_u8(v.relay as u8);
            }
            ProtocolMessage::Verack => {}
            ProtocolMessage::Ping(nonce) | ProtocolMessage::Pong(nonce) => {
                buf.put_u64_le(*nonce);
            }
            ProtocolMessage::Addr(entries) => {
                put_compact_size(buf, entries.len() as u64);
                for entry in entries {
                    buf.put_u32_le(entry.timestamp);
                    entry.addr.encode(buf);
                }
            }
            ProtocolMessage::Inv(items) | ProtocolMessage::GetData(items) => {
                put_compact_size(buf, items.len() as u64);
                for item in items {
                    buf.put_u32_le(item.kind.to_u32());
                    buf.put_slice(&item.hash.0);
                }
            }
            ProtocolMessage::Headers(headers) => {
                put_compact_size(buf, headers.len() as u64);
                for header in headers {
                    header.encode(buf);
                    // Per-header transaction count, always zero in `headers`.
                    put_compact_size(buf, 0);
                }
            }
            ProtocolMessage::GetHeaders(g) => {
                buf.put_u32_le(g.version);
                put_compact_size(buf, g.locator.len() as u64);
                for hash in &g.locator {
                    buf.put_slice(&hash.0);
                }
                buf.put_slice(&g.stop_hash.0);
            }
            ProtocolMessage::FilterLoad(f) => {
                put_var_bytes(buf, &f.filter);
                buf.put_u32_le(f.hash_funcs);
                buf.put_u32_le(f.tweak);
                buf.put_u8(f.flags);
            }
            ProtocolMessage::FilterAdd(f) => {
                put_var_bytes(buf, &f.data);
            }
            ProtocolMessage::MerkleBlock(m) => {
                m.header.encode(buf);
                buf.put_u32_le(m.total_transactions);
                put_compact_size(buf, m.hashes.len() as u64);
                for hash in &m.hashes {
                    buf.put_slice(hash);
                }
                put_var_bytes(buf, &m.flags);
            }
            ProtocolMessage::Tx(tx) => {
                buf.put_slice(&tx.raw);
            }
            ProtocolMessage::CfHeaders(c) => {
                buf.put_u8(c.filter_type);
                buf.put_slice(&c.stop_hash.0);
                buf.put_slice(&c.prev_filter_header.0);
                put_compact_size(buf, c.filter_hashes.len() as u64);
                for hash in &c.filter_hashes {
                    buf.put_slice(hash);
                }
            }
            ProtocolMessage::CfFilter(c) => {
                buf.put_u8(c.filter_type);
                buf.put_slice(&c.block_hash.0);
                put_var_bytes(buf, &c.filter);
            }
            ProtocolMessage::GetCfHeaders(r) | ProtocolMessage::GetCfFilters(r) => {
                buf.put_u8(r.filter_type);
                buf.put_u32_le(r.start_height);
                buf.put_slice(&r.stop_hash.0);
            }
            ProtocolMessage::Reject(r) => {
                put_var_str(buf, &r.message);
                buf.put_u8(r.code.to_u8());
                put_var_str(buf, &r.reason);
            }
            ProtocolMessage::Unknown { payload, .. } => {
                buf.put_slice(payload);
            }
        }
    }

    /// Decode a payload for the given command name.
    ///
    /// Unrecognized commands become [`ProtocolMessage::Unknown`]; malformed
    /// payloads for known commands are an error.
    pub fn decode_payload(command: &str, payload: &[u8]) -> io::Result<Self> {
        let mut r = Reader::new(payload);
        let message = match command {
            "version" => {
                let version = r.i32()?;
                let services = ServiceFlags::from_bits_retain(r.u64()?);
                let timestamp = r.i64()?;
                let addr_recv = NetAddr::decode(&mut r)?;
                let addr_from = NetAddr::decode(&mut r)?;
                let nonce = r.u64()?;
                let user_agent = r.var_str()?;
                let start_height = r.i32()?;
                // Absent on ancient protocol versions.
                let relay = r.remaining() > 0 && r.u8()? != 0;
                ProtocolMessage::Version(VersionMessage {
                    version,
                    services,
                    timestamp,
                    addr_recv,
                    addr_from,
                    nonce,
                    user_agent,
                    start_height,
                    relay,
                })
            }
            "verack" => ProtocolMessage::Verack,
            "ping" => ProtocolMessage::Ping(r.u64()?),
            "pong" => ProtocolMessage::Pong(r.u64()?),
            "addr" => {
                let count = r.compact_size_max(MAX_INV_ENTRIES, "addr count")?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let timestamp = r.u32()?;
                    let addr = NetAddr::decode(&mut r)?;
                    entries.push(TimedNetAddr { timestamp, addr });
                }
                ProtocolMessage::Addr(entries)
            }
            "inv" => ProtocolMessage::Inv(decode_inventory(&mut r)?),
            "getdata" => ProtocolMessage::GetData(decode_inventory(&mut r)?),
            "headers" => {
                let count = r.compact_size_max(MAX_HEADERS_PER_MSG, "headers count")?;
                let mut headers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let mut slice = r.take(BlockHeader::SIZE, "header")?;
                    headers.push(BlockHeader::decode(&mut slice)?);
                    // Skip the always-zero transaction count.
                    r.compact_size()?;
                }
                ProtocolMessage::Headers(headers)
            }
            "getheaders" => {
                let version = r.u32()?;
                let count = r.compact_size_max(MAX_INV_ENTRIES, "locator count")?;
                let mut locator = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    locator.push(BlockHash(r.array32("locator hash")?));
                }
                let stop_hash = BlockHash(r.array32("stop hash")?);
                ProtocolMessage::GetHeaders(GetHeadersMessage {
                    version,
                    locator,
                    stop_hash,
                })
            }
            "filterload" => {
                let filter = r.var_bytes()?;
                ProtocolMessage::FilterLoad(FilterLoadMessage {
                    filter,
                    hash_funcs: r.u32()?,
                    tweak: r.u32()?,
                    flags: r.u8()?,
                })
            }
            "filteradd" => {
                let data = r.var_bytes()?;
                if data.len() as u64 > MAX_FILTER_ADD_SIZE {
                    return Err(invalid("filteradd data exceeds 520 bytes"));
                }
                ProtocolMessage::FilterAdd(FilterAddMessage { data })
            }
            "merkleblock" => {
                let mut slice = r.take(BlockHeader::SIZE, "merkleblock header")?;
                let header = BlockHeader::decode(&mut slice)?;
                let total_transactions = r.u32()?;
                let count = r.compact_size_max(MAX_INV_ENTRIES, "merkleblock hashes")?;
                let mut hashes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    hashes.push(r.array32("merkleblock hash")?);
                }
                let flags = r.var_bytes()?;
                ProtocolMessage::MerkleBlock(MerkleBlockMessage {
                    header,
                    total_transactions,
                    hashes,
                    flags,
                })
            }
            "tx" => ProtocolMessage::Tx(TxMessage {
                raw: payload.to_vec(),
            }),
            "cfheaders" => {
                let filter_type = r.u8()?;
                let stop_hash = BlockHash(r.array32("cfheaders stop hash")?);
                let prev_filter_header = FilterHeader(r.array32("cfheaders prev header")?);
                let count = r.compact_size_max(MAX_CF_HEADERS_PER_MSG, "cfheaders count")?;
                let mut filter_hashes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    filter_hashes.push(r.array32("filter hash")?);
                }
                ProtocolMessage::CfHeaders(CfHeadersMessage {
                    filter_type,
                    stop_hash,
                    prev_filter_header,
                    filter_hashes,
                })
            }
            "cfilter" => {
                let filter_type = r.u8()?;
                let block_hash = BlockHash(r.array32("cfilter block hash")?);
                let filter = r.var_bytes()?;
                ProtocolMessage::CfFilter(CfFilterMessage {
                    filter_type,
                    block_hash,
                    filter,
                })
            }
            "getcfheaders" => ProtocolMessage::GetCfHeaders(decode_cf_range(&mut r)?),
            "getcfilters" => ProtocolMessage::GetCfFilters(decode_cf_range(&mut r)?),
            "reject" => {
                let message = r.var_str()?;
                let code = RejectCode::from_u8(r.u8()?);
                let reason = r.var_str()?;
                // A hash of the rejected object may follow; not needed here.
                ProtocolMessage::Reject(RejectMessage {
                    message,
                    code,
                    reason,
                })
            }
            _ => {
                return Ok(ProtocolMessage::Unknown {
                    command: command.to_string(),
                    payload: payload.to_vec(),
                })
            }
        };
        Ok(message)
    }
}

impl fmt::Display for ProtocolMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command())
    }
}

fn decode_inventory(r: &mut Reader<'_>) -> io::Result<Vec<Inventory>> {
    let count = r.compact_size_max(MAX_INV_ENTRIES, "inventory count")?;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind = InvType::from_u32(r.u32()?);
        let hash = BlockHash(r.array32("inventory hash")?);
        items.push(Inventory { kind, hash });
    }
    Ok(items)
}

fn decode_cf_range(r: &mut Reader<'_>) -> io::Result<CfRangeRequest> {
    Ok(CfRangeRequest {
        filter_type: r.u8()?,
        start_height: r.u32()?,
        stop_hash: BlockHash(r.array32("cf stop hash")?),
    })
}

// ---------------------------------------------------------------------------
// Wire primitives
// ---------------------------------------------------------------------------

pub(crate) fn put_compact_size<B: BufMut>(buf: &mut B, value: u64) {
    match value {
        0..=0xFC => buf.put_u8(value as u8),
        0xFD..=0xFFFF => {
            buf.put_u8(0xFD);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xFFFF_FFFF => {
            buf.put_u8(0xFE);
            buf.put_u32_le(value as u32);
        }
        _ => {
            buf.put_u8(0xFF);
            buf.put_u64_le(value);
        }
    }
}

fn put_var_bytes<B: BufMut>(buf: &mut B, data: &[u8]) {
    put_compact_size(buf, data.len() as u64);
    buf.put_slice(data);
}

fn put_var_str<B: BufMut>(buf: &mut B, s: &str) {
    put_var_bytes(buf, s.as_bytes());
}

fn eof(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("truncated payload: {what}"),
    )
}

fn invalid(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, what.to_string())
}

/// Cursor over a payload slice with bounds-checked little-endian reads.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &str) -> io::Result<&'a [u8]> {
        let slice = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or_else(|| eof(what))?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    fn u16_be(&mut self) -> io::Result<u16> {
        let b = self.take(2, "u16")?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> io::Result<u32> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> io::Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> io::Result<u64> {
        let b = self.take(8, "u64")?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(b);
        Ok(u64::from_le_bytes(bytes))
    }

    fn i64(&mut self) -> io::Result<i64> {
        Ok(self.u64()? as i64)
    }

    fn array32(&mut self, what: &str) -> io::Result<[u8; 32]> {
        let slice = self.take(32, what)?;
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Ok(bytes)
    }

    fn compact_size(&mut self) -> io::Result<u64> {
        let first = self.u8()?;
        match first {
            0..=0xFC => Ok(first as u64),
            0xFD => {
                let b = self.take(2, "varint16")?;
                Ok(u16::from_le_bytes([b[0], b[1]]) as u64)
            }
            0xFE => {
                let b = self.take(4, "varint32")?;
                Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64)
            }
            0xFF => {
                let b = self.take(8, "varint64")?;
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(b);
                Ok(u64::from_le_bytes(bytes))
            }
        }
    }

    fn compact_size_max(&mut self, max: u64, what: &str) -> io::Result<u64> {
        let value = self.compact_size()?;
        if value > max {
            return Err(invalid(&format!("{what} exceeds limit of {max}")));
        }
        Ok(value)
    }

    fn var_bytes(&mut self) -> io::Result<Vec<u8>> {
        let len = self.compact_size()?;
        if len > self.remaining() as u64 {
            return Err(eof("var_bytes"));
        }
        Ok(self.take(len as usize, "var_bytes")?.to_vec())
    }

    fn var_str(&mut self) -> io::Result<String> {
        let bytes = self.var_bytes()?;
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: ProtocolMessage) {
        let mut payload = Vec::new();
        message.encode_payload(&mut payload);
        let decoded = ProtocolMessage::decode_payload(message.command(), &payload).unwrap();
        assert_eq!(decoded, message);
    }

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 0x2000_0000,
            prev_blockhash: BlockHash([0x11; 32]),
            merkle_root: BlockHash([0x22; 32]),
            time: 1_650_000_000,
            bits: 0x1d00ffff,
            nonce: 7,
        }
    }

    fn sample_version() -> VersionMessage {
        let remote: SocketAddr = "203.0.113.5:8333".parse().unwrap();
        let mut version = VersionMessage::new(
            70016,
            ServiceFlags::NODE_COMPACT_FILTERS,
            remote,
            840_000,
            "/bitlight:0.1.0/",
        );
        // Pin the random fields so assertions are stable.
        version.nonce = 0xdead_beef_cafe_f00d;
        version.timestamp = 1_700_000_000;
        version
    }

    #[test]
    fn round_trip_every_variant() {
        let remote: SocketAddr = "[2001:db8::1]:18333".parse().unwrap();
        round_trip(ProtocolMessage::Version(sample_version()));
        round_trip(ProtocolMessage::Verack);
        round_trip(ProtocolMessage::Ping(42));
        round_trip(ProtocolMessage::Pong(42));
        round_trip(ProtocolMessage::Addr(vec![TimedNetAddr {
            timestamp: 1_700_000_000,
            addr: NetAddr::new(remote, ServiceFlags::NODE_NETWORK),
        }]));
        round_trip(ProtocolMessage::Inv(vec![Inventory::block(BlockHash(
            [3; 32],
        ))]));
        round_trip(ProtocolMessage::GetData(vec![Inventory::filtered_block(
            BlockHash([4; 32]),
        )]));
        round_trip(ProtocolMessage::Headers(vec![sample_header()]));
        round_trip(ProtocolMessage::GetHeaders(GetHeadersMessage {
            version: 70016,
            locator: vec![BlockHash([5; 32]), BlockHash([6; 32])],
            stop_hash: BlockHash::ZERO,
        }));
        round_trip(ProtocolMessage::FilterLoad(FilterLoadMessage {
            filter: vec![0xAA, 0xBB],
            hash_funcs: 11,
            tweak: 99,
            flags: 1,
        }));
        round_trip(ProtocolMessage::FilterAdd(FilterAddMessage {
            data: vec![1, 2, 3],
        }));
        round_trip(ProtocolMessage::MerkleBlock(MerkleBlockMessage {
            header: sample_header(),
            total_transactions: 100,
            hashes: vec![[7; 32], [8; 32]],
            flags: vec![0b1011_0000],
        }));
        round_trip(ProtocolMessage::Tx(TxMessage {
            raw: vec![1, 0, 0, 0, 0],
        }));
        round_trip(ProtocolMessage::CfHeaders(CfHeadersMessage {
            filter_type: 0,
            stop_hash: BlockHash([9; 32]),
            prev_filter_header: FilterHeader([10; 32]),
            filter_hashes: vec![[11; 32], [12; 32]],
        }));
        round_trip(ProtocolMessage::CfFilter(CfFilterMessage {
            filter_type: 0,
            block_hash: BlockHash([13; 32]),
            filter: vec![1, 0x91, 0x5f],
        }));
        round_trip(ProtocolMessage::GetCfHeaders(CfRangeRequest {
            filter_type: 0,
            start_height: 1,
            stop_hash: BlockHash([14; 32]),
        }));
        round_trip(ProtocolMessage::GetCfFilters(CfRangeRequest {
            filter_type: 0,
            start_height: 500,
            stop_hash: BlockHash([15; 32]),
        }));
        round_trip(ProtocolMessage::Reject(RejectMessage {
            message: "tx".to_string(),
            code: RejectCode::InsufficientFee,
            reason: "fee too low".to_string(),
        }));
        round_trip(ProtocolMessage::Unknown {
            command: "sendaddrv2".to_string(),
            payload: vec![],
        });
    }

    #[test]
    fn version_without_relay_byte_still_decodes() {
        let mut payload = Vec::new();
        ProtocolMessage::Version(sample_version()).encode_payload(&mut payload);
        payload.pop();
        let decoded = ProtocolMessage::decode_payload("version", &payload).unwrap();
        match decoded {
            ProtocolMessage::Version(v) => assert!(!v.relay),
            other => panic!("expected version, got {other}"),
        }
    }

    #[test]
    fn ipv4_survives_v6_mapping() {
        let addr: SocketAddr = "192.0.2.1:8333".parse().unwrap();
        let mut buf = Vec::new();
        NetAddr::new(addr, ServiceFlags::NODE_NETWORK).encode(&mut buf);
        assert_eq!(buf.len(), 26);

        let decoded = NetAddr::decode(&mut Reader::new(&buf)).unwrap();
        assert_eq!(decoded.addr, addr);
    }

    #[test]
    fn truncated_payload_is_an_error_not_a_panic() {
        let mut payload = Vec::new();
        ProtocolMessage::CfHeaders(CfHeadersMessage {
            filter_type: 0,
            stop_hash: BlockHash([1; 32]),
            prev_filter_header: FilterHeader([2; 32]),
            filter_hashes: vec![[3; 32]],
        })
        .encode_payload(&mut payload);

        for cut in 0..payload.len() {
            assert!(ProtocolMessage::decode_payload("cfheaders", &payload[..cut]).is_err());
        }
    }

    #[test]
    fn oversized_counts_are_rejected() {
        let mut payload = Vec::new();
        put_compact_size(&mut payload, MAX_HEADERS_PER_MSG + 1);
        assert!(ProtocolMessage::decode_payload("headers", &payload).is_err());

        let mut payload = Vec::new();
        put_compact_size(&mut payload, MAX_INV_ENTRIES + 1);
        assert!(ProtocolMessage::decode_payload("inv", &payload).is_err());
    }

    #[test]
    fn var_bytes_length_cannot_exceed_payload() {
        // Claims 200 bytes but provides 2: must fail cleanly.
        let payload = [0xC8u8, 0x01, 0x02];
        let mut r = Reader::new(&payload);
        assert!(r.var_bytes().is_err());
    }

    #[test]
    fn compact_size_boundary_encodings() {
        for value in [0u64, 0xFC, 0xFD, 0xFFFF, 0x1_0000, 0xFFFF_FFFF, u64::MAX] {
            let mut buf = Vec::new();
            put_compact_size(&mut buf, value);
            let mut r = Reader::new(&buf);
            assert_eq!(r.compact_size().unwrap(), value);
        }
    }

    #[test]
    fn unknown_command_is_preserved() {
        let decoded = ProtocolMessage::decode_payload("wtxidrelay", &[1, 2, 3]).unwrap();
        match decoded {
            ProtocolMessage::Unknown { command, payload } => {
                assert_eq!(command, "wtxidrelay");
                assert_eq!(payload, vec![1, 2, 3]);
            }
            other => panic!("expected unknown, got {other}"),
        }
    }

    #[test]
    fn command_bytes_are_nul_padded() {
        assert_eq!(
            ProtocolMessage::Verack.command_bytes(),
            *b"verack\0\0\0\0\0\0"
        );
        assert_eq!(
            ProtocolMessage::GetCfHeaders(CfRangeRequest {
                filter_type: 0,
                start_height: 0,
                stop_hash: BlockHash::ZERO,
            })
            .command_bytes(),
            *b"getcfheaders"
        );
    }
}
