use std::collections::HashMap;
use std::io::Read;
use std::time::{Duration, Instant};

use bzip2::read::{BzDecoder, BzEncoder};
use bzip2::Compression;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha2::Digest;

use crate::destination::link::Link;
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash, HASH_SIZE};
use crate::packet::{
    DestinationType, Header, Packet, PacketContext, PacketDataBuffer, PacketType, LINK_MDU,
    PACKET_MDU,
};

pub const MAPHASH_LEN: usize = 4;
pub const RANDOM_HASH_SIZE: usize = 4;

/// Service data unit of one resource part.
pub const SDU: usize = PACKET_MDU;

/// Conservative size of a packed advertisement without its hashmap.
pub const ADVERTISEMENT_OVERHEAD: usize = 134;
pub const HASHMAP_MAX_LEN: usize = (LINK_MDU - ADVERTISEMENT_OVERHEAD) / MAPHASH_LEN;

pub const WINDOW: usize = 4;
pub const WINDOW_MIN: usize = 2;
pub const WINDOW_MAX_SLOW: usize = 10;
pub const WINDOW_MAX_VERY_SLOW: usize = 4;
pub const WINDOW_MAX_FAST: usize = 75;
pub const WINDOW_FLEXIBILITY: usize = 4;

/// Transfer rates steering the window ceiling, in bits per second.
const RATE_FAST: f64 = 50_000.0;
const RATE_VERY_SLOW: f64 = 2_000.0;
const FAST_RATE_ROUNDS: usize = 5;
const VERY_SLOW_RATE_ROUNDS: usize = 2;

pub const MAX_RETRIES: u8 = 16;
const TIMEOUT_FACTOR: u32 = 4;

/// Inputs above this boundary are split into sequential segments that
/// share the first segment's hash as `original_hash`.
pub const SEGMENT_MAX: usize = 1024 * 1024;

const METADATA_MAX_SIZE: usize = 16 * 1024 * 1024 - 1;

const FLAG_ENCRYPTED: u8 = 0x01;
const FLAG_COMPRESSED: u8 = 0x02;
const FLAG_SPLIT: u8 = 0x04;
const FLAG_REQUEST: u8 = 0x08;
const FLAG_RESPONSE: u8 = 0x10;
const FLAG_METADATA: u8 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceConfig {
    pub segment_max: usize,
    pub default_timeout: Duration,
    pub max_retries: u8,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            segment_max: SEGMENT_MAX,
            default_timeout: Duration::from_secs(2),
            max_retries: MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    None,
    Advertised,
    Transferring,
    AwaitingProof,
    Complete,
    Failed,
    Corrupt,
}

#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub hash: Hash,
    pub link_id: AddressHash,
    pub kind: ResourceEventKind,
}

#[derive(Debug, Clone)]
pub enum ResourceEventKind {
    Progress(ResourceProgress),
    Complete(ResourceComplete),
    OutboundComplete,
    Failed(ResourceStatus),
}

#[derive(Debug, Clone)]
pub struct ResourceProgress {
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub received_parts: usize,
    pub total_parts: usize,
    pub segment_index: u32,
    pub total_segments: u32,
}

impl ResourceProgress {
    pub fn fraction(&self) -> f32 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        (self.received_bytes as f64 / self.total_bytes as f64) as f32
    }
}

#[derive(Debug, Clone)]
pub struct ResourceComplete {
    pub data: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAdvertisement {
    pub transfer_size: u64,
    pub data_size: u64,
    pub parts: u32,
    pub hash: Hash,
    pub random_hash: [u8; RANDOM_HASH_SIZE],
    pub original_hash: Hash,
    pub segment_index: u32,
    pub total_segments: u32,
    pub request_id: Option<ByteBuf>,
    pub flags: u8,
    pub hashmap: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResourceAdvertisementFrame {
    #[serde(rename = "t")]
    transfer_size: u64,
    #[serde(rename = "d")]
    data_size: u64,
    #[serde(rename = "n")]
    parts: u32,
    #[serde(rename = "h", with = "serde_bytes")]
    hash: Vec<u8>,
    #[serde(rename = "r", with = "serde_bytes")]
    random_hash: Vec<u8>,
    #[serde(rename = "o", with = "serde_bytes")]
    original_hash: Vec<u8>,
    #[serde(rename = "i")]
    segment_index: u32,
    #[serde(rename = "l")]
    total_segments: u32,
    #[serde(rename = "q")]
    request_id: Option<ByteBuf>,
    #[serde(rename = "f")]
    flags: u8,
    #[serde(rename = "m", with = "serde_bytes")]
    hashmap: Vec<u8>,
}

impl ResourceAdvertisement {
    pub fn pack(&self) -> Result<Vec<u8>, RnsError> {
        let frame = ResourceAdvertisementFrame {
            transfer_size: self.transfer_size,
            data_size: self.data_size,
            parts: self.parts,
            hash: self.hash.as_slice().to_vec(),
            random_hash: self.random_hash.to_vec(),
            original_hash: self.original_hash.as_slice().to_vec(),
            segment_index: self.segment_index,
            total_segments: self.total_segments,
            request_id: self.request_id.clone(),
            flags: self.flags,
            hashmap: self.hashmap.clone(),
        };
        rmp_serde::to_vec_named(&frame).map_err(|_| RnsError::InvalidPacket)
    }

    pub fn unpack(data: &[u8]) -> Result<Self, RnsError> {
        let frame: ResourceAdvertisementFrame =
            rmp_serde::from_slice(data).map_err(|_| RnsError::InvalidPacket)?;
        Ok(Self {
            transfer_size: frame.transfer_size,
            data_size: frame.data_size,
            parts: frame.parts,
            hash: Hash::try_from_slice(&frame.hash)?,
            random_hash: copy_fixed::<RANDOM_HASH_SIZE>(&frame.random_hash)?,
            original_hash: Hash::try_from_slice(&frame.original_hash)?,
            segment_index: frame.segment_index,
            total_segments: frame.total_segments,
            request_id: frame.request_id,
            flags: frame.flags,
            hashmap: frame.hashmap,
        })
    }

    pub fn encrypted(&self) -> bool {
        (self.flags & FLAG_ENCRYPTED) != 0
    }

    pub fn compressed(&self) -> bool {
        (self.flags & FLAG_COMPRESSED) != 0
    }

    pub fn split(&self) -> bool {
        (self.flags & FLAG_SPLIT) != 0
    }

    pub fn has_metadata(&self) -> bool {
        (self.flags & FLAG_METADATA) != 0
    }

    pub fn is_request(&self) -> bool {
        (self.flags & FLAG_REQUEST) != 0 && self.request_id.is_some()
    }

    pub fn is_response(&self) -> bool {
        (self.flags & FLAG_RESPONSE) != 0 && self.request_id.is_some()
    }
}

/// Part request: `exhausted(1) [last_map_hash(4)] resource_hash(32)
/// requested_map_hashes(4 each)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub hashmap_exhausted: bool,
    pub last_map_hash: Option<[u8; MAPHASH_LEN]>,
    pub resource_hash: Hash,
    pub requested_hashes: Vec<[u8; MAPHASH_LEN]>,
}

impl ResourceRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + MAPHASH_LEN + HASH_SIZE + self.requested_hashes.len() * MAPHASH_LEN,
        );
        if self.hashmap_exhausted {
            out.push(0xFF);
            out.extend_from_slice(&self.last_map_hash.unwrap_or([0u8; MAPHASH_LEN]));
        } else {
            out.push(0x00);
        }
        out.extend_from_slice(self.resource_hash.as_slice());
        for hash in &self.requested_hashes {
            out.extend_from_slice(hash);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() < 1 + HASH_SIZE {
            return Err(RnsError::InvalidPacket);
        }
        let hashmap_exhausted = data[0] == 0xFF;
        let mut offset = 1;
        let last_map_hash = if hashmap_exhausted {
            if data.len() < 1 + MAPHASH_LEN + HASH_SIZE {
                return Err(RnsError::InvalidPacket);
            }
            let hash = copy_fixed::<MAPHASH_LEN>(&data[offset..offset + MAPHASH_LEN])?;
            offset += MAPHASH_LEN;
            Some(hash)
        } else {
            None
        };
        let resource_hash = Hash::try_from_slice(&data[offset..offset + HASH_SIZE])?;
        offset += HASH_SIZE;
        let mut requested_hashes = Vec::new();
        while offset + MAPHASH_LEN <= data.len() {
            requested_hashes.push(copy_fixed::<MAPHASH_LEN>(&data[offset..offset + MAPHASH_LEN])?);
            offset += MAPHASH_LEN;
        }
        Ok(Self { hashmap_exhausted, last_map_hash, resource_hash, requested_hashes })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHashUpdate {
    pub resource_hash: Hash,
    pub segment: u32,
    pub hashmap: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResourceHashUpdateFrame(u32, #[serde(with = "serde_bytes")] Vec<u8>);

impl ResourceHashUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, RnsError> {
        let mut out = Vec::with_capacity(HASH_SIZE + self.hashmap.len() + 8);
        out.extend_from_slice(self.resource_hash.as_slice());
        let payload = rmp_serde::to_vec(&ResourceHashUpdateFrame(self.segment, self.hashmap.clone()))
            .map_err(|_| RnsError::InvalidPacket)?;
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() < HASH_SIZE + 1 {
            return Err(RnsError::InvalidPacket);
        }
        let resource_hash = Hash::try_from_slice(&data[..HASH_SIZE])?;
        let frame: ResourceHashUpdateFrame =
            rmp_serde::from_slice(&data[HASH_SIZE..]).map_err(|_| RnsError::InvalidPacket)?;
        Ok(Self { resource_hash, segment: frame.0, hashmap: frame.1 })
    }
}

/// Proof of delivery: `resource_hash(32) || SHA-256(data || resource_hash)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceProof {
    pub resource_hash: Hash,
    pub proof: Hash,
}

impl ResourceProof {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HASH_SIZE * 2);
        out.extend_from_slice(self.resource_hash.as_slice());
        out.extend_from_slice(self.proof.as_slice());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() < HASH_SIZE * 2 {
            return Err(RnsError::InvalidPacket);
        }
        Ok(Self {
            resource_hash: Hash::try_from_slice(&data[..HASH_SIZE])?,
            proof: Hash::try_from_slice(&data[HASH_SIZE..HASH_SIZE * 2])?,
        })
    }
}

/// Receiver-side window controller. Grows by one part per fully delivered
/// round, with the ceiling steered by the measured transfer rate.
#[derive(Debug, Clone)]
pub struct WindowControl {
    pub window: usize,
    pub window_min: usize,
    pub window_max: usize,
    fast_rounds: usize,
    very_slow_rounds: usize,
}

impl Default for WindowControl {
    fn default() -> Self {
        Self {
            window: WINDOW,
            window_min: WINDOW_MIN,
            window_max: WINDOW_MAX_SLOW,
            fast_rounds: 0,
            very_slow_rounds: 0,
        }
    }
}

impl WindowControl {
    /// Accounts one request round. `round_bytes` counts request and
    /// response bytes moved during `elapsed`; `filled` is true when every
    /// requested part arrived.
    pub fn on_round(&mut self, round_bytes: usize, elapsed: Duration, filled: bool) {
        if !elapsed.is_zero() {
            let rate = (round_bytes as f64 * 8.0) / elapsed.as_secs_f64();

            if rate >= RATE_FAST {
                self.fast_rounds += 1;
                if self.fast_rounds >= FAST_RATE_ROUNDS {
                    self.window_max = WINDOW_MAX_FAST;
                }
            } else {
                self.fast_rounds = 0;
            }

            if rate <= RATE_VERY_SLOW {
                self.very_slow_rounds += 1;
                if self.very_slow_rounds >= VERY_SLOW_RATE_ROUNDS {
                    self.window_max = WINDOW_MAX_VERY_SLOW;
                    self.window = self.window.min(self.window_max);
                    self.window_min = self.window_min.min(self.window);
                }
            } else {
                self.very_slow_rounds = 0;
            }
        }

        if filled && self.window < self.window_max {
            self.window += 1;
            if self.window - self.window_min > WINDOW_FLEXIBILITY {
                self.window_min += 1;
            }
        }
    }

    /// Transfer trouble: halve towards the floor.
    pub fn on_retry(&mut self) {
        self.window = (self.window / 2).max(self.window_min);
    }
}

struct SegmentState {
    resource_hash: Hash,
    random_hash: [u8; RANDOM_HASH_SIZE],
    parts: Vec<Vec<u8>>,
    map_hashes: Vec<[u8; MAPHASH_LEN]>,
    expected_proof: Hash,
    transfer_size: u64,
    data_size: u64,
    compressed: bool,
}

impl SegmentState {
    fn new(link: &Link, segment_data: &[u8]) -> Result<Self, RnsError> {
        // Keep the compressed form only when strictly smaller.
        let compressed_data = bz2_compress(segment_data);
        let (payload, compressed) = match compressed_data {
            Some(compressed_data) if compressed_data.len() < segment_data.len() => {
                (compressed_data, true)
            }
            _ => (segment_data.to_vec(), false),
        };

        let mut random_hash = [0u8; RANDOM_HASH_SIZE];
        OsRng.fill_bytes(&mut random_hash);

        let resource_hash = Hash::new(
            Hash::generator()
                .chain_update(segment_data)
                .chain_update(random_hash)
                .finalize()
                .into(),
        );
        let expected_proof = Hash::new(
            Hash::generator()
                .chain_update(segment_data)
                .chain_update(resource_hash.as_slice())
                .finalize()
                .into(),
        );

        // A fresh random prefix hides identical plaintext across resends.
        let mut prefixed = vec![0u8; RANDOM_HASH_SIZE];
        OsRng.fill_bytes(&mut prefixed[..]);
        prefixed.extend_from_slice(&payload);

        let mut cipher_buf = vec![0u8; prefixed.len() + 128];
        let cipher_len = link.encrypt(&prefixed, &mut cipher_buf)?.len();
        cipher_buf.truncate(cipher_len);

        let mut parts = Vec::with_capacity(cipher_buf.len() / SDU + 1);
        let mut map_hashes = Vec::with_capacity(parts.capacity());
        for chunk in cipher_buf.chunks(SDU) {
            map_hashes.push(map_hash(chunk, &random_hash));
            parts.push(chunk.to_vec());
        }

        Ok(Self {
            resource_hash,
            random_hash,
            transfer_size: parts.iter().map(|part| part.len() as u64).sum(),
            data_size: segment_data.len() as u64,
            parts,
            map_hashes,
            expected_proof,
            compressed,
        })
    }
}

struct OutgoingResource {
    original_hash: Hash,
    link_id: AddressHash,
    data: Vec<u8>,
    has_metadata: bool,
    request_id: Option<ByteBuf>,
    segment_max: usize,
    total_segments: u32,
    segment_index: u32,
    segment: SegmentState,
    status: ResourceStatus,
    last_activity: Instant,
}

impl OutgoingResource {
    fn segment_bounds(&self, index: u32) -> (usize, usize) {
        let start = (index as usize - 1) * self.segment_max;
        let end = (start + self.segment_max).min(self.data.len());
        (start, end)
    }

    fn advertisement(&self, hashmap_segment: usize) -> ResourceAdvertisement {
        let mut flags = FLAG_ENCRYPTED;
        if self.segment.compressed {
            flags |= FLAG_COMPRESSED;
        }
        if self.total_segments > 1 {
            flags |= FLAG_SPLIT;
        }
        if self.has_metadata {
            flags |= FLAG_METADATA;
        }
        if self.request_id.is_some() {
            flags |= FLAG_RESPONSE;
        }

        ResourceAdvertisement {
            transfer_size: self.segment.transfer_size,
            data_size: self.segment.data_size,
            parts: self.segment.parts.len() as u32,
            hash: self.segment.resource_hash,
            random_hash: self.segment.random_hash,
            original_hash: self.original_hash,
            segment_index: self.segment_index,
            total_segments: self.total_segments,
            request_id: self.request_id.clone(),
            flags,
            hashmap: slice_hashmap_segment(&self.segment.map_hashes, hashmap_segment),
        }
    }
}

struct IncomingResource {
    resource_hash: Hash,
    original_hash: Hash,
    link_id: AddressHash,
    random_hash: [u8; RANDOM_HASH_SIZE],
    parts: Vec<Option<Vec<u8>>>,
    hashmap: Vec<Option<[u8; MAPHASH_LEN]>>,
    received: usize,
    consecutive: usize,
    received_bytes: u64,
    total_bytes: u64,
    window: WindowControl,
    encrypted: bool,
    compressed: bool,
    has_metadata: bool,
    segment_index: u32,
    total_segments: u32,
    outstanding: Vec<[u8; MAPHASH_LEN]>,
    round_started: Instant,
    round_bytes: usize,
    last_activity: Instant,
    retries: u8,
    rtt: Duration,
    status: ResourceStatus,
}

impl IncomingResource {
    fn new(adv: &ResourceAdvertisement, link: &Link, default_timeout: Duration) -> Self {
        let now = Instant::now();
        let total_parts = adv.parts as usize;
        let mut incoming = Self {
            resource_hash: adv.hash,
            original_hash: adv.original_hash,
            link_id: *link.id(),
            random_hash: adv.random_hash,
            parts: vec![None; total_parts],
            hashmap: vec![None; total_parts],
            received: 0,
            consecutive: 0,
            received_bytes: 0,
            total_bytes: adv.transfer_size,
            window: WindowControl::default(),
            encrypted: adv.encrypted(),
            compressed: adv.compressed(),
            has_metadata: adv.has_metadata(),
            segment_index: adv.segment_index,
            total_segments: adv.total_segments,
            outstanding: Vec::new(),
            round_started: now,
            round_bytes: 0,
            last_activity: now,
            retries: 0,
            rtt: link.rtt().max(default_timeout),
            status: ResourceStatus::Advertised,
        };
        // The advertisement always carries the first hashmap slice.
        incoming.apply_hashmap_segment(0, &adv.hashmap);
        incoming
    }

    fn apply_hashmap_segment(&mut self, segment: usize, bytes: &[u8]) {
        for (i, chunk) in bytes.chunks_exact(MAPHASH_LEN).enumerate() {
            let idx = segment * HASHMAP_MAX_LEN + i;
            if idx < self.hashmap.len() {
                let mut entry = [0u8; MAPHASH_LEN];
                entry.copy_from_slice(chunk);
                self.hashmap[idx] = Some(entry);
            }
        }
    }

    fn advance_consecutive(&mut self) {
        while self.consecutive < self.parts.len() && self.parts[self.consecutive].is_some() {
            self.consecutive += 1;
        }
    }

    /// Builds the next request: up to `window` missing map hashes inside
    /// the known hashmap, flagging exhaustion when the map itself ran out.
    fn build_request(&mut self) -> ResourceRequest {
        let mut requested = Vec::new();
        let mut last_known: Option<[u8; MAPHASH_LEN]> = None;
        let mut hashmap_exhausted = false;

        for (idx, entry) in self.hashmap.iter().enumerate() {
            match entry {
                Some(hash) => {
                    last_known = Some(*hash);
                    if self.parts[idx].is_none() {
                        requested.push(*hash);
                        if requested.len() >= self.window.window {
                            break;
                        }
                    }
                }
                None => {
                    hashmap_exhausted = true;
                    break;
                }
            }
        }

        self.outstanding = requested.clone();
        self.round_started = Instant::now();
        self.round_bytes = requested.len() * MAPHASH_LEN + HASH_SIZE + 1;

        ResourceRequest {
            hashmap_exhausted,
            last_map_hash: if hashmap_exhausted { last_known } else { None },
            resource_hash: self.resource_hash,
            requested_hashes: requested,
        }
    }

    /// Matches a part by map hash inside the current search scope and
    /// stores it. Returns whether the part was new.
    fn accept_part(&mut self, part: &[u8]) -> bool {
        let hash = map_hash(part, &self.random_hash);

        let scope_end = (self.consecutive + self.window.window + self.outstanding.len())
            .min(self.hashmap.len());
        let scope = self.consecutive..scope_end;

        let Some(index) = scope
            .clone()
            .find(|idx| self.hashmap[*idx].as_ref() == Some(&hash) && self.parts[*idx].is_none())
        else {
            return false;
        };

        self.parts[index] = Some(part.to_vec());
        self.received += 1;
        self.received_bytes = self.received_bytes.saturating_add(part.len() as u64);
        self.round_bytes += part.len();
        self.last_activity = Instant::now();
        self.outstanding.retain(|entry| *entry != hash);
        self.advance_consecutive();
        true
    }

    fn round_complete(&mut self) -> bool {
        self.outstanding.is_empty()
    }

    fn is_complete(&self) -> bool {
        !self.parts.is_empty() && self.received == self.parts.len()
    }

    /// Reassembles the segment: decrypt, strip the random prefix,
    /// decompress, and verify against the advertised hash.
    fn assemble(&mut self, link: &Link) -> Result<Vec<u8>, RnsError> {
        let mut stream = Vec::with_capacity(self.total_bytes as usize);
        for part in &self.parts {
            match part {
                Some(bytes) => stream.extend_from_slice(bytes),
                None => return Err(RnsError::ResourceCorrupt),
            }
        }

        let plain = if self.encrypted {
            let mut out = vec![0u8; stream.len() + 64];
            let decrypted =
                link.decrypt(&stream, &mut out).map_err(|_| RnsError::ResourceCorrupt)?;
            decrypted.to_vec()
        } else {
            stream
        };

        if plain.len() < RANDOM_HASH_SIZE {
            return Err(RnsError::ResourceCorrupt);
        }
        let mut payload = plain[RANDOM_HASH_SIZE..].to_vec();

        if self.compressed {
            payload = bz2_decompress(&payload).ok_or(RnsError::ResourceCorrupt)?;
        }

        let computed = Hash::new(
            Hash::generator()
                .chain_update(&payload)
                .chain_update(self.random_hash)
                .finalize()
                .into(),
        );
        if computed != self.resource_hash {
            return Err(RnsError::ResourceCorrupt);
        }

        Ok(payload)
    }

    fn proof(&self, payload: &[u8]) -> ResourceProof {
        ResourceProof {
            resource_hash: self.resource_hash,
            proof: Hash::new(
                Hash::generator()
                    .chain_update(payload)
                    .chain_update(self.resource_hash.as_slice())
                    .finalize()
                    .into(),
            ),
        }
    }

    fn timeout(&self, default_timeout: Duration) -> Duration {
        self.rtt.max(default_timeout) * TIMEOUT_FACTOR
    }

    fn progress(&self) -> ResourceProgress {
        ResourceProgress {
            received_bytes: self.received_bytes,
            total_bytes: self.total_bytes,
            received_parts: self.received,
            total_parts: self.parts.len(),
            segment_index: self.segment_index,
            total_segments: self.total_segments,
        }
    }
}

/// Per-node resource engine: all in-flight transfers on all links, plus
/// the event queue drained by the transport.
pub struct ResourceManager {
    config: ResourceConfig,
    outgoing: HashMap<Hash, OutgoingResource>,
    incoming: HashMap<Hash, IncomingResource>,
    /// Payload accumulated from completed segments of split transfers,
    /// keyed by original hash.
    assembled: HashMap<Hash, Vec<u8>>,
    events: Vec<ResourceEvent>,
}

impl ResourceManager {
    pub fn new(config: ResourceConfig) -> Self {
        Self {
            config,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            assembled: HashMap::new(),
            events: Vec::new(),
        }
    }

    pub fn drain_events(&mut self) -> Vec<ResourceEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    pub fn incoming_len(&self) -> usize {
        self.incoming.len()
    }

    /// Starts a transfer over `link`. Returns the original hash and the
    /// first advertisement packet.
    pub fn start_send(
        &mut self,
        link: &Link,
        data: Vec<u8>,
        metadata: Option<Vec<u8>>,
        request_id: Option<Vec<u8>>,
    ) -> Result<(Hash, Packet), RnsError> {
        let has_metadata = metadata.is_some();
        let mut combined = match metadata {
            Some(metadata) => {
                if metadata.len() > METADATA_MAX_SIZE {
                    return Err(RnsError::InvalidArgument);
                }
                let size_bytes = (metadata.len() as u32).to_be_bytes();
                let mut combined = Vec::with_capacity(3 + metadata.len() + data.len());
                combined.extend_from_slice(&size_bytes[1..]);
                combined.extend_from_slice(&metadata);
                combined
            }
            None => Vec::with_capacity(data.len()),
        };
        combined.extend_from_slice(&data);

        let segment_max = self.config.segment_max.max(1);
        let total_segments = (combined.len().max(1)).div_ceil(segment_max) as u32;

        let first_segment =
            SegmentState::new(link, &combined[..combined.len().min(segment_max)])?;
        let original_hash = first_segment.resource_hash;

        let outgoing = OutgoingResource {
            original_hash,
            link_id: *link.id(),
            data: combined,
            has_metadata,
            request_id: request_id.map(ByteBuf::from),
            segment_max,
            total_segments,
            segment_index: 1,
            segment: first_segment,
            status: ResourceStatus::Advertised,
            last_activity: Instant::now(),
        };

        let advertisement = outgoing.advertisement(0);
        let packet = build_link_control_packet(
            link,
            PacketContext::ResourceAdvertisement,
            &advertisement.pack()?,
        )?;

        self.outgoing.insert(original_hash, outgoing);
        log::debug!(
            "resource({}): advertised {} parts over {} segments",
            original_hash,
            advertisement.parts,
            total_segments
        );

        Ok((original_hash, packet))
    }

    /// Handles a decrypted control payload (advertisement, request, hash
    /// update or cancel) and returns the packets to send in response.
    pub fn handle_control(
        &mut self,
        context: PacketContext,
        payload: &[u8],
        link: &Link,
    ) -> Vec<Packet> {
        match context {
            PacketContext::ResourceAdvertisement => self.handle_advertisement(payload, link),
            PacketContext::ResourceRequest => self.handle_request(payload, link),
            PacketContext::ResourceHashUpdate => self.handle_hash_update(payload, link),
            PacketContext::ResourceInitiatorCancel | PacketContext::ResourceReceiverCancel => {
                self.handle_cancel(payload)
            }
            _ => Vec::new(),
        }
    }

    fn handle_advertisement(&mut self, payload: &[u8], link: &Link) -> Vec<Packet> {
        let Ok(adv) = ResourceAdvertisement::unpack(payload) else {
            return Vec::new();
        };

        if adv.split() && adv.segment_index > 1 {
            // Later segments belong to a transfer we accepted earlier; an
            // unknown original aborts the transfer.
            if !self.assembled.contains_key(&adv.original_hash) {
                log::warn!("resource: unexpected continuation segment, rejecting");
                return Vec::new();
            }
        }

        let mut incoming = IncomingResource::new(&adv, link, self.config.default_timeout);
        incoming.status = ResourceStatus::Transferring;
        let request = incoming.build_request();
        self.incoming.insert(adv.hash, incoming);

        match build_link_control_packet(link, PacketContext::ResourceRequest, &request.encode()) {
            Ok(packet) => vec![packet],
            Err(_) => Vec::new(),
        }
    }

    fn handle_request(&mut self, payload: &[u8], link: &Link) -> Vec<Packet> {
        let Ok(request) = ResourceRequest::decode(payload) else {
            return Vec::new();
        };

        // Requests address the current segment's hash.
        let Some(outgoing) = self
            .outgoing
            .values_mut()
            .find(|candidate| candidate.segment.resource_hash == request.resource_hash)
        else {
            return Vec::new();
        };

        outgoing.status = ResourceStatus::Transferring;
        outgoing.last_activity = Instant::now();

        let mut packets = Vec::new();
        for hash in &request.requested_hashes {
            if let Some(index) =
                outgoing.segment.map_hashes.iter().position(|entry| entry == hash)
            {
                if let Some(part) = outgoing.segment.parts.get(index) {
                    if let Ok(packet) = build_part_packet(link, part) {
                        packets.push(packet);
                    }
                }
            }
        }

        if request.hashmap_exhausted {
            if let Some(last_hash) = request.last_map_hash {
                if let Some(last_index) =
                    outgoing.segment.map_hashes.iter().position(|entry| *entry == last_hash)
                {
                    let next_map_segment = (last_index / HASHMAP_MAX_LEN) + 1;
                    if next_map_segment * HASHMAP_MAX_LEN < outgoing.segment.map_hashes.len() {
                        let update = ResourceHashUpdate {
                            resource_hash: outgoing.segment.resource_hash,
                            segment: next_map_segment as u32,
                            hashmap: slice_hashmap_segment(
                                &outgoing.segment.map_hashes,
                                next_map_segment,
                            ),
                        };
                        if let Ok(payload) = update.encode() {
                            if let Ok(packet) = build_link_control_packet(
                                link,
                                PacketContext::ResourceHashUpdate,
                                &payload,
                            ) {
                                packets.push(packet);
                            }
                        }
                    }
                } else {
                    // The receiver requested a continuation from a hash we
                    // never advertised; the transfer cannot recover.
                    log::warn!("resource: misaligned hashmap request, cancelling");
                    outgoing.status = ResourceStatus::Failed;
                }
            }
        }

        packets
    }

    fn handle_hash_update(&mut self, payload: &[u8], link: &Link) -> Vec<Packet> {
        let Ok(update) = ResourceHashUpdate::decode(payload) else {
            return Vec::new();
        };
        let Some(incoming) = self.incoming.get_mut(&update.resource_hash) else {
            return Vec::new();
        };

        incoming.apply_hashmap_segment(update.segment as usize, &update.hashmap);
        incoming.last_activity = Instant::now();
        let request = incoming.build_request();

        match build_link_control_packet(link, PacketContext::ResourceRequest, &request.encode()) {
            Ok(packet) => vec![packet],
            Err(_) => Vec::new(),
        }
    }

    fn handle_cancel(&mut self, payload: &[u8]) -> Vec<Packet> {
        if let Ok(hash) = Hash::try_from_slice(payload) {
            if let Some(incoming) = self.incoming.remove(&hash) {
                self.assembled.remove(&incoming.original_hash);
                self.events.push(ResourceEvent {
                    hash: incoming.original_hash,
                    link_id: incoming.link_id,
                    kind: ResourceEventKind::Failed(ResourceStatus::Failed),
                });
            }
            if let Some(outgoing) = self.outgoing.remove(&hash) {
                self.events.push(ResourceEvent {
                    hash: outgoing.original_hash,
                    link_id: outgoing.link_id,
                    kind: ResourceEventKind::Failed(ResourceStatus::Failed),
                });
            }
        }
        Vec::new()
    }

    /// Handles one raw resource part.
    pub fn handle_part(&mut self, payload: &[u8], link: &Link) -> Vec<Packet> {
        let mut packets = Vec::new();
        let mut completed: Option<Hash> = None;

        for (hash, incoming) in self.incoming.iter_mut() {
            if incoming.link_id != *link.id() {
                continue;
            }
            if !incoming.accept_part(payload) {
                continue;
            }

            if incoming.is_complete() {
                completed = Some(*hash);
                break;
            }

            if incoming.round_complete() {
                let elapsed = incoming.round_started.elapsed();
                incoming.window.on_round(incoming.round_bytes, elapsed, true);
                incoming.rtt = link.rtt().max(self.config.default_timeout);

                let request = incoming.build_request();
                if let Ok(packet) =
                    build_link_control_packet(link, PacketContext::ResourceRequest, &request.encode())
                {
                    packets.push(packet);
                }

                self.events.push(ResourceEvent {
                    hash: incoming.original_hash,
                    link_id: incoming.link_id,
                    kind: ResourceEventKind::Progress(incoming.progress()),
                });
            }
            break;
        }

        if let Some(hash) = completed {
            if let Some(mut incoming) = self.incoming.remove(&hash) {
                match incoming.assemble(link) {
                    Ok(payload) => {
                        let proof = incoming.proof(&payload);
                        if let Ok(packet) = build_proof_packet(link, &proof) {
                            packets.push(packet);
                        }

                        let mut collected =
                            self.assembled.remove(&incoming.original_hash).unwrap_or_default();
                        collected.extend_from_slice(&payload);

                        if incoming.segment_index < incoming.total_segments {
                            // More segments follow; stash and wait for the
                            // next advertisement.
                            self.assembled.insert(incoming.original_hash, collected);
                        } else {
                            let (metadata, data) = if incoming.has_metadata {
                                split_metadata(&collected)
                            } else {
                                (None, collected)
                            };
                            self.events.push(ResourceEvent {
                                hash: incoming.original_hash,
                                link_id: incoming.link_id,
                                kind: ResourceEventKind::Complete(ResourceComplete {
                                    data,
                                    metadata,
                                }),
                            });
                        }
                    }
                    Err(_) => {
                        self.assembled.remove(&incoming.original_hash);
                        self.events.push(ResourceEvent {
                            hash: incoming.original_hash,
                            link_id: incoming.link_id,
                            kind: ResourceEventKind::Failed(ResourceStatus::Corrupt),
                        });
                    }
                }
            }
        }

        packets
    }

    /// Handles a resource proof; a validated proof on a split transfer
    /// yields the next segment's advertisement.
    pub fn handle_proof(&mut self, payload: &[u8], link: &Link) -> Vec<Packet> {
        let Ok(proof) = ResourceProof::decode(payload) else {
            return Vec::new();
        };

        let Some(original_hash) = self
            .outgoing
            .iter()
            .find(|(_, outgoing)| outgoing.segment.resource_hash == proof.resource_hash)
            .map(|(hash, _)| *hash)
        else {
            return Vec::new();
        };

        let Some(outgoing) = self.outgoing.get_mut(&original_hash) else {
            return Vec::new();
        };
        if proof.proof != outgoing.segment.expected_proof {
            return Vec::new();
        }

        if outgoing.segment_index < outgoing.total_segments {
            outgoing.segment_index += 1;
            let (start, end) = outgoing.segment_bounds(outgoing.segment_index);
            match SegmentState::new(link, &outgoing.data[start..end]) {
                Ok(segment) => {
                    outgoing.segment = segment;
                    outgoing.last_activity = Instant::now();
                    let advertisement = outgoing.advertisement(0);
                    if let Ok(payload) = advertisement.pack() {
                        if let Ok(packet) = build_link_control_packet(
                            link,
                            PacketContext::ResourceAdvertisement,
                            &payload,
                        ) {
                            return vec![packet];
                        }
                    }
                }
                Err(_) => {
                    outgoing.status = ResourceStatus::Failed;
                }
            }
            return Vec::new();
        }

        let outgoing = self.outgoing.remove(&original_hash);
        if let Some(outgoing) = outgoing {
            self.events.push(ResourceEvent {
                hash: outgoing.original_hash,
                link_id: outgoing.link_id,
                kind: ResourceEventKind::OutboundComplete,
            });
        }
        Vec::new()
    }

    /// Periodic deadline check. Idle receivers re-request with a shrunken
    /// window; transfers past the retry limit fail. Returns re-requests as
    /// `(link_id, request)` for the caller to encrypt and send.
    pub fn watchdog(&mut self, now: Instant) -> Vec<(AddressHash, ResourceRequest)> {
        let mut requests = Vec::new();
        let mut failed = Vec::new();
        let default_timeout = self.config.default_timeout;
        let max_retries = self.config.max_retries;

        for (hash, incoming) in self.incoming.iter_mut() {
            let timeout = incoming.timeout(default_timeout);
            if now.duration_since(incoming.last_activity) < timeout {
                continue;
            }

            if incoming.retries >= max_retries {
                failed.push(*hash);
                continue;
            }

            incoming.retries += 1;
            incoming.window.on_retry();
            incoming.last_activity = now;
            let request = incoming.build_request();
            log::debug!(
                "resource({}): retry {} window {}",
                incoming.original_hash,
                incoming.retries,
                incoming.window.window
            );
            requests.push((incoming.link_id, request));
        }

        for hash in failed {
            if let Some(incoming) = self.incoming.remove(&hash) {
                self.assembled.remove(&incoming.original_hash);
                self.events.push(ResourceEvent {
                    hash: incoming.original_hash,
                    link_id: incoming.link_id,
                    kind: ResourceEventKind::Failed(ResourceStatus::Failed),
                });
            }
        }

        // Senders with nothing heard for the full retry budget are dead.
        let sender_deadline = default_timeout * TIMEOUT_FACTOR * max_retries as u32;
        let mut dead_senders = Vec::new();
        for (hash, outgoing) in &self.outgoing {
            if now.duration_since(outgoing.last_activity) > sender_deadline {
                dead_senders.push(*hash);
            }
        }
        for hash in dead_senders {
            if let Some(outgoing) = self.outgoing.remove(&hash) {
                self.events.push(ResourceEvent {
                    hash: outgoing.original_hash,
                    link_id: outgoing.link_id,
                    kind: ResourceEventKind::Failed(ResourceStatus::Failed),
                });
            }
        }

        requests
    }

    /// Fails every in-flight transfer; used at shutdown.
    pub fn fail_all(&mut self) {
        for (_, incoming) in self.incoming.drain() {
            self.events.push(ResourceEvent {
                hash: incoming.original_hash,
                link_id: incoming.link_id,
                kind: ResourceEventKind::Failed(ResourceStatus::Failed),
            });
        }
        for (_, outgoing) in self.outgoing.drain() {
            self.events.push(ResourceEvent {
                hash: outgoing.original_hash,
                link_id: outgoing.link_id,
                kind: ResourceEventKind::Failed(ResourceStatus::Failed),
            });
        }
        self.assembled.clear();
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new(ResourceConfig::default())
    }
}

/// Encrypted control packet on a link (advertisements, requests, hashmap
/// updates, cancels).
pub fn build_link_control_packet(
    link: &Link,
    context: PacketContext,
    payload: &[u8],
) -> Result<Packet, RnsError> {
    link.data_packet_with_context(payload, context)
}

/// Resource parts travel as raw link packets; the stream they belong to is
/// already encrypted as a whole.
fn build_part_packet(link: &Link, part: &[u8]) -> Result<Packet, RnsError> {
    let mut packet_data = PacketDataBuffer::new();
    packet_data.write(part)?;

    Ok(Packet {
        header: Header {
            destination_type: DestinationType::Link,
            packet_type: PacketType::Data,
            ..Default::default()
        },
        destination: *link.id(),
        transport: None,
        context: PacketContext::Resource,
        data: packet_data,
    })
}

fn build_proof_packet(link: &Link, proof: &ResourceProof) -> Result<Packet, RnsError> {
    let mut packet_data = PacketDataBuffer::new();
    packet_data.write(&proof.encode())?;

    Ok(Packet {
        header: Header {
            destination_type: DestinationType::Link,
            packet_type: PacketType::Proof,
            ..Default::default()
        },
        destination: *link.id(),
        transport: None,
        context: PacketContext::ResourceProof,
        data: packet_data,
    })
}

pub fn build_resource_request_packet(
    link: &Link,
    request: &ResourceRequest,
) -> Result<Packet, RnsError> {
    build_link_control_packet(link, PacketContext::ResourceRequest, &request.encode())
}

fn slice_hashmap_segment(hashes: &[[u8; MAPHASH_LEN]], segment: usize) -> Vec<u8> {
    let start = segment * HASHMAP_MAX_LEN;
    let end = ((segment + 1) * HASHMAP_MAX_LEN).min(hashes.len());
    let mut out = Vec::with_capacity((end.saturating_sub(start)) * MAPHASH_LEN);
    for hash in &hashes[start.min(end)..end] {
        out.extend_from_slice(hash);
    }
    out
}

fn map_hash(part: &[u8], random_hash: &[u8; RANDOM_HASH_SIZE]) -> [u8; MAPHASH_LEN] {
    let digest = Hash::generator().chain_update(part).chain_update(random_hash).finalize();
    let mut out = [0u8; MAPHASH_LEN];
    out.copy_from_slice(&digest[..MAPHASH_LEN]);
    out
}

fn split_metadata(payload: &[u8]) -> (Option<Vec<u8>>, Vec<u8>) {
    if payload.len() < 3 {
        return (None, payload.to_vec());
    }
    let size = ((payload[0] as usize) << 16) | ((payload[1] as usize) << 8) | payload[2] as usize;
    if size > METADATA_MAX_SIZE || payload.len() < 3 + size {
        return (None, payload.to_vec());
    }
    (Some(payload[3..3 + size].to_vec()), payload[3 + size..].to_vec())
}

fn bz2_compress(data: &[u8]) -> Option<Vec<u8>> {
    if data.is_empty() {
        return None;
    }
    let mut encoder = BzEncoder::new(data, Compression::best());
    let mut out = Vec::new();
    encoder.read_to_end(&mut out).ok()?;
    Some(out)
}

fn bz2_decompress(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = BzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

fn copy_fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], RnsError> {
    if bytes.len() < N {
        return Err(RnsError::InvalidPacket);
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand_core::OsRng;

    use super::{
        ResourceConfig, ResourceEventKind, ResourceManager, WindowControl, WINDOW, WINDOW_MAX_FAST,
        WINDOW_MAX_VERY_SLOW, WINDOW_MIN,
    };
    use crate::destination::link::{Link, LinkHandleResult};
    use crate::destination::single_in;
    use crate::identity::PrivateIdentity;
    use crate::packet::{Packet, PacketContext, PacketType};

    /// Builds an initiator/responder link pair with a shared session key.
    fn link_pair() -> (Link, Link) {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let destination = single_in(identity, "example_utilities", &["resource"])
            .expect("destination");
        let desc = destination.desc;

        let (tx_a, _rx_a) = tokio::sync::broadcast::channel(64);
        let (tx_b, _rx_b) = tokio::sync::broadcast::channel(64);

        let mut initiator = Link::new(desc, tx_a);
        let request = initiator.request();
        let mut responder =
            Link::new_from_request(&request, destination.sign_key().clone(), desc, tx_b)
                .expect("responder");
        let proof = responder.prove();
        assert!(matches!(initiator.handle_packet(&proof), LinkHandleResult::Activated));

        (initiator, responder)
    }

    /// Runs a full transfer by shuttling packets between two managers.
    fn run_transfer(
        data: Vec<u8>,
        metadata: Option<Vec<u8>>,
        config: ResourceConfig,
    ) -> (Vec<u8>, Option<Vec<u8>>, bool) {
        let (sender_link, receiver_link) = link_pair();
        let mut sender = ResourceManager::new(config);
        let mut receiver = ResourceManager::new(config);

        let (_hash, adv_packet) =
            sender.start_send(&sender_link, data, metadata, None).expect("start send");

        let mut to_receiver: Vec<Packet> = vec![adv_packet];
        let mut to_sender: Vec<Packet> = Vec::new();

        for _round in 0..100_000 {
            if to_receiver.is_empty() && to_sender.is_empty() {
                break;
            }

            for packet in std::mem::take(&mut to_receiver) {
                let responses = dispatch(&mut receiver, &packet, &receiver_link);
                to_sender.extend(responses);
            }
            for packet in std::mem::take(&mut to_sender) {
                let responses = dispatch(&mut sender, &packet, &sender_link);
                to_receiver.extend(responses);
            }
        }

        let mut received_data = Vec::new();
        let mut received_metadata = None;
        for event in receiver.drain_events() {
            if let ResourceEventKind::Complete(complete) = event.kind {
                received_data = complete.data;
                received_metadata = complete.metadata;
            }
        }

        let outbound_complete = sender
            .drain_events()
            .iter()
            .any(|event| matches!(event.kind, ResourceEventKind::OutboundComplete));

        (received_data, received_metadata, outbound_complete)
    }

    fn dispatch(manager: &mut ResourceManager, packet: &Packet, link: &Link) -> Vec<Packet> {
        match (packet.header.packet_type, packet.context) {
            (PacketType::Data, PacketContext::Resource) => {
                manager.handle_part(packet.data.as_slice(), link)
            }
            (PacketType::Proof, PacketContext::ResourceProof) => {
                manager.handle_proof(packet.data.as_slice(), link)
            }
            (PacketType::Data, context) => {
                let mut buffer = [0u8; crate::packet::PACKET_MDU];
                let plain = link.decrypt(packet.data.as_slice(), &mut buffer).expect("decrypt");
                manager.handle_control(context, plain, link)
            }
            _ => Vec::new(),
        }
    }

    #[test]
    fn resource_roundtrip_sizes() {
        for size in [1usize, 319, 320, 10_000] {
            let data: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
            let (received, metadata, outbound_complete) =
                run_transfer(data.clone(), None, ResourceConfig::default());
            assert_eq!(received, data, "size {} corrupted", size);
            assert!(metadata.is_none());
            assert!(outbound_complete, "size {} missing outbound completion", size);
        }
    }

    #[test]
    fn resource_roundtrip_with_metadata() {
        let data = vec![0xA7u8; 2048];
        let metadata = b"content-name".to_vec();
        let (received, received_metadata, _) =
            run_transfer(data.clone(), Some(metadata.clone()), ResourceConfig::default());
        assert_eq!(received, data);
        assert_eq!(received_metadata, Some(metadata));
    }

    #[test]
    fn compressible_data_roundtrip() {
        // Repetitive payload exercises the bz2 path.
        let data = vec![0x42u8; 50_000];
        let (received, _, _) = run_transfer(data.clone(), None, ResourceConfig::default());
        assert_eq!(received, data);
    }

    #[test]
    fn segmented_transfer_reassembles() {
        let config = ResourceConfig { segment_max: 16 * 1024, ..Default::default() };
        let data: Vec<u8> = (0..60_000usize).map(|i| (i % 256) as u8).collect();
        let (received, _, outbound_complete) = run_transfer(data.clone(), None, config);
        assert_eq!(received.len(), data.len());
        assert_eq!(received, data);
        assert!(outbound_complete);
    }

    #[test]
    fn large_incompressible_transfer_uses_hashmap_updates() {
        use rand_core::RngCore;

        // Random data defeats compression, so the part count exceeds what
        // one advertisement's hashmap slice can carry.
        let mut data = vec![0u8; 80_000];
        OsRng.fill_bytes(&mut data);
        assert!(data.len() / super::SDU > super::HASHMAP_MAX_LEN);

        let (received, _, outbound_complete) =
            run_transfer(data.clone(), None, ResourceConfig::default());
        assert_eq!(received, data);
        assert!(outbound_complete);
    }

    #[test]
    fn megabyte_scale_transfer_segments_and_reassembles() {
        let data: Vec<u8> = (0..1_500_000usize).map(|i| (i * 31 % 251) as u8).collect();
        let (received, _, outbound_complete) =
            run_transfer(data.clone(), None, ResourceConfig::default());
        assert_eq!(received, data);
        assert!(outbound_complete);
    }

    #[test]
    fn window_grows_per_filled_round_and_respects_flexibility() {
        let mut window = WindowControl::default();
        assert_eq!(window.window, WINDOW);

        for _ in 0..20 {
            window.on_round(10_000, Duration::from_millis(100), true);
        }
        assert!(window.window <= window.window_max);
        assert!(window.window - window.window_min <= super::WINDOW_FLEXIBILITY);
    }

    #[test]
    fn fast_rate_raises_ceiling() {
        let mut window = WindowControl::default();
        // 100 KiB in 100 ms is far above the fast threshold.
        for _ in 0..40 {
            window.on_round(100_000, Duration::from_millis(100), true);
        }
        assert_eq!(window.window_max, WINDOW_MAX_FAST);
        assert!(window.window > WINDOW);
    }

    #[test]
    fn slow_rate_clamps_window() {
        let mut window = WindowControl::default();
        // 100 bytes over 2 seconds is below the very-slow threshold.
        for _ in 0..3 {
            window.on_round(100, Duration::from_secs(2), false);
        }
        assert_eq!(window.window_max, WINDOW_MAX_VERY_SLOW);
        assert!(window.window <= WINDOW_MAX_VERY_SLOW);
        assert!(window.window >= WINDOW_MIN);
    }

    #[test]
    fn watchdog_retries_then_fails() {
        let (sender_link, receiver_link) = link_pair();
        let config = ResourceConfig {
            default_timeout: Duration::from_millis(0),
            max_retries: 2,
            ..Default::default()
        };
        let mut sender = ResourceManager::new(config);
        let mut receiver = ResourceManager::new(config);

        let (_hash, adv_packet) = sender
            .start_send(&sender_link, vec![1u8; 5000], None, None)
            .expect("start send");
        // Deliver the advertisement, then drop every part.
        let mut buffer = [0u8; crate::packet::PACKET_MDU];
        let plain = receiver_link
            .decrypt(adv_packet.data.as_slice(), &mut buffer)
            .expect("decrypt")
            .to_vec();
        receiver.handle_control(PacketContext::ResourceAdvertisement, &plain, &receiver_link);

        let later = std::time::Instant::now() + Duration::from_secs(1);
        assert_eq!(receiver.watchdog(later).len(), 1);
        assert_eq!(receiver.watchdog(later + Duration::from_secs(1)).len(), 1);
        // Retry budget exhausted.
        assert!(receiver.watchdog(later + Duration::from_secs(2)).is_empty());

        let failed = receiver
            .drain_events()
            .iter()
            .any(|event| matches!(event.kind, ResourceEventKind::Failed(_)));
        assert!(failed);
    }
}
