use std::cmp::min;
use std::time::{Duration, Instant};

use ed25519_dalek::{Signature, SigningKey};
use rand_core::OsRng;
use sha2::Digest;
use x25519_dalek::StaticSecret;

use crate::buffer::OutputBuffer;
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash, ADDRESS_HASH_SIZE};
use crate::identity::{
    DerivedKey, Identity, PrivateIdentity, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};
use crate::packet::{
    DestinationType, Header, Packet, PacketContext, PacketDataBuffer, PacketType, PACKET_MDU,
};

use super::DestinationDesc;

pub const LINK_MTU_SIZE: usize = 3;

/// Decryption failures tolerated before the link is torn down.
pub const LINK_INTEGRITY_LIMIT: u32 = 8;

const KEEP_ALIVE_REQUEST: u8 = 0xFF;
const KEEP_ALIVE_RESPONSE: u8 = 0xFE;

const RTT_EWMA_STEP: f32 = 0.05;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum LinkStatus {
    Pending = 0x00,
    Handshake = 0x01,
    Active = 0x02,
    Stale = 0x03,
    Closed = 0x04,
}

impl LinkStatus {
    pub fn not_yet_active(&self) -> bool {
        *self == LinkStatus::Pending || *self == LinkStatus::Handshake
    }

    pub fn usable(&self) -> bool {
        *self == LinkStatus::Active || *self == LinkStatus::Stale
    }
}

pub type LinkId = AddressHash;

/// Packs `mode(3 bits) << 21 | mtu(21 bits)` into three bytes.
pub fn pack_link_mtu(mode: u8, mtu: u32) -> [u8; LINK_MTU_SIZE] {
    let value = ((mode as u32 & 0b111) << 21) | (mtu & 0x1F_FFFF);
    let bytes = value.to_be_bytes();
    [bytes[1], bytes[2], bytes[3]]
}

pub fn unpack_link_mtu(bytes: &[u8; LINK_MTU_SIZE]) -> (u8, u32) {
    let value = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
    (((value >> 21) & 0b111) as u8, value & 0x1F_FFFF)
}

#[derive(Clone)]
pub struct LinkPayload {
    buffer: [u8; PACKET_MDU],
    len: usize,
    context: PacketContext,
    packet_hash: Option<Hash>,
}

impl LinkPayload {
    pub fn new_from_slice(data: &[u8]) -> Self {
        Self::new_with_context(data, PacketContext::None, None)
    }

    pub fn new_with_context(
        data: &[u8],
        context: PacketContext,
        packet_hash: Option<Hash>,
    ) -> Self {
        let mut buffer = [0u8; PACKET_MDU];
        let len = min(data.len(), buffer.len());
        buffer[..len].copy_from_slice(&data[..len]);
        Self { buffer, len, context, packet_hash }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn context(&self) -> PacketContext {
        self.context
    }

    pub fn packet_hash(&self) -> Option<Hash> {
        self.packet_hash
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.len]
    }
}

/// Link ids hash the request packet's addressable part, with any trailing
/// signalling bytes beyond the two ephemeral keys excluded.
impl From<&Packet> for LinkId {
    fn from(packet: &Packet) -> Self {
        let data = packet.data.as_slice();
        let hashable_len = min(data.len(), PUBLIC_KEY_LENGTH * 2);

        AddressHash::new_from_hash(&Hash::new(
            Hash::generator()
                .chain_update([packet.header.pack_flags() & 0b0000_1111])
                .chain_update(packet.destination.as_slice())
                .chain_update([packet.context as u8])
                .chain_update(&data[..hashable_len])
                .finalize()
                .into(),
        ))
    }
}


#[allow(clippy::large_enum_variant)]
pub enum LinkHandleResult {
    None,
    Activated,
    Proof(Packet),
    KeepAlive,
    Closed,
}

#[derive(Clone)]
pub enum LinkEvent {
    Activated,
    Data(Box<LinkPayload>),
    Closed,
}

#[derive(Clone)]
pub struct LinkEventData {
    pub id: LinkId,
    pub address_hash: AddressHash,
    pub event: LinkEvent,
}

pub struct Link {
    id: LinkId,
    destination: DestinationDesc,
    priv_identity: PrivateIdentity,
    peer_identity: Identity,
    derived_key: DerivedKey,
    signalling: Option<[u8; LINK_MTU_SIZE]>,
    initiator: bool,
    status: LinkStatus,
    request_time: Instant,
    last_activity: Instant,
    rtt: Duration,
    integrity_failures: u32,
    event_tx: tokio::sync::broadcast::Sender<LinkEventData>,
}

impl Link {
    /// Creates an outbound (initiator) link towards `destination`.
    pub fn new(
        destination: DestinationDesc,
        event_tx: tokio::sync::broadcast::Sender<LinkEventData>,
    ) -> Self {
        Self {
            id: AddressHash::new_empty(),
            destination,
            priv_identity: PrivateIdentity::new_from_rand(OsRng),
            peer_identity: destination.identity,
            derived_key: DerivedKey::new_empty(),
            signalling: None,
            initiator: true,
            status: LinkStatus::Pending,
            request_time: Instant::now(),
            last_activity: Instant::now(),
            rtt: Duration::from_secs(0),
            integrity_failures: 0,
            event_tx,
        }
    }

    /// Creates the responder side from an inbound LINKREQUEST.
    pub fn new_from_request(
        packet: &Packet,
        signing_key: SigningKey,
        destination: DestinationDesc,
        event_tx: tokio::sync::broadcast::Sender<LinkEventData>,
    ) -> Result<Self, RnsError> {
        if packet.data.len() < PUBLIC_KEY_LENGTH * 2 {
            return Err(RnsError::InvalidPacket);
        }

        let data = packet.data.as_slice();
        let peer_identity = Identity::from_public_bytes(&data[..PUBLIC_KEY_LENGTH * 2])?;
        let signalling = if data.len() >= PUBLIC_KEY_LENGTH * 2 + LINK_MTU_SIZE {
            let mut bytes = [0u8; LINK_MTU_SIZE];
            bytes.copy_from_slice(&data[PUBLIC_KEY_LENGTH * 2..PUBLIC_KEY_LENGTH * 2 + LINK_MTU_SIZE]);
            Some(bytes)
        } else {
            None
        };

        let link_id = LinkId::from(packet);
        log::debug!("link({}): created from request", link_id);

        let mut link = Self {
            id: link_id,
            destination,
            priv_identity: PrivateIdentity::new(StaticSecret::random_from_rng(OsRng), signing_key),
            peer_identity,
            derived_key: DerivedKey::new_empty(),
            signalling,
            initiator: false,
            status: LinkStatus::Pending,
            request_time: Instant::now(),
            last_activity: Instant::now(),
            rtt: Duration::from_secs(0),
            integrity_failures: 0,
            event_tx,
        };

        link.handshake(peer_identity);

        Ok(link)
    }

    /// Builds the LINKREQUEST packet and (re)keys the link id.
    pub fn request(&mut self) -> Packet {
        let mut packet_data = PacketDataBuffer::new();

        let _ = packet_data.write(self.priv_identity.as_identity().public_key.as_bytes());
        let _ = packet_data.write(self.priv_identity.as_identity().verifying_key.as_bytes());
        if let Some(signalling) = self.signalling {
            let _ = packet_data.write(&signalling);
        }

        let packet = Packet {
            header: Header { packet_type: PacketType::LinkRequest, ..Default::default() },
            destination: self.destination.address_hash,
            transport: None,
            context: PacketContext::None,
            data: packet_data,
        };

        self.status = LinkStatus::Pending;
        self.id = LinkId::from(&packet);
        self.request_time = Instant::now();
        self.last_activity = Instant::now();

        packet
    }

    pub fn set_mtu(&mut self, mode: u8, mtu: u32) {
        self.signalling = Some(pack_link_mtu(mode, mtu));
    }

    /// Negotiated link MTU: the minimum of both ends, when signalled.
    pub fn negotiated_mtu(&self) -> Option<u32> {
        self.signalling.map(|bytes| unpack_link_mtu(&bytes).1)
    }

    /// Responder proof for the link request:
    /// `signed = link_id || eph_pub || verifying_pub [|| signalling]`,
    /// wire = `signature || eph_pub [|| signalling]`.
    pub fn prove(&mut self) -> Packet {
        if self.status != LinkStatus::Active {
            self.status = LinkStatus::Active;
            self.last_activity = Instant::now();
            self.post_event(LinkEvent::Activated);
        }

        let mut packet_data = PacketDataBuffer::new();
        let _ = packet_data.write(self.id.as_slice());
        let _ = packet_data.write(self.priv_identity.as_identity().public_key.as_bytes());
        let _ = packet_data.write(self.priv_identity.as_identity().verifying_key.as_bytes());
        if let Some(signalling) = self.signalling {
            let _ = packet_data.write(&signalling);
        }

        let signature = self.priv_identity.sign(packet_data.as_slice());

        packet_data.reset();
        let _ = packet_data.write(&signature.to_bytes()[..]);
        let _ = packet_data.write(self.priv_identity.as_identity().public_key.as_bytes());
        if let Some(signalling) = self.signalling {
            let _ = packet_data.write(&signalling);
        }

        Packet {
            header: Header {
                packet_type: PacketType::Proof,
                destination_type: DestinationType::Link,
                ..Default::default()
            },
            destination: self.id,
            transport: None,
            context: PacketContext::LinkRequestProof,
            data: packet_data,
        }
    }

    /// Packet-level delivery proof: `hash(32) || signature(64)`.
    pub fn prove_packet(&self, packet: &Packet) -> Packet {
        let hash = packet.packet_hash().to_bytes();
        let signature = self.priv_identity.sign(&hash).to_bytes();

        let mut packet_data = PacketDataBuffer::new();
        let _ = packet_data.write(&hash);
        let _ = packet_data.write(&signature);

        Packet {
            header: Header {
                packet_type: PacketType::Proof,
                destination_type: DestinationType::Link,
                ..Default::default()
            },
            destination: self.id,
            transport: None,
            context: PacketContext::LinkProof,
            data: packet_data,
        }
    }

    fn handle_data_packet(&mut self, packet: &Packet) -> LinkHandleResult {
        match packet.context {
            PacketContext::None
            | PacketContext::Request
            | PacketContext::Response
            | PacketContext::Channel
            | PacketContext::LinkIdentify => {
                let mut buffer = [0u8; PACKET_MDU];
                match self.decrypt(packet.data.as_slice(), &mut buffer[..]) {
                    Ok(plain_text) => {
                        log::trace!("link({}): data {}B", self.id, plain_text.len());
                        self.touch();
                        self.post_event(LinkEvent::Data(Box::new(LinkPayload::new_with_context(
                            plain_text,
                            packet.context,
                            Some(packet.packet_hash()),
                        ))));
                        return LinkHandleResult::Proof(self.prove_packet(packet));
                    }
                    Err(_) => {
                        self.integrity_failures += 1;
                        log::warn!(
                            "link({}): can't decrypt packet ({} failures)",
                            self.id,
                            self.integrity_failures
                        );
                        if self.integrity_failures >= LINK_INTEGRITY_LIMIT {
                            self.close();
                            return LinkHandleResult::Closed;
                        }
                    }
                }
            }
            PacketContext::KeepAlive => {
                if packet.data.as_slice().first() == Some(&KEEP_ALIVE_REQUEST) {
                    self.touch();
                    return LinkHandleResult::KeepAlive;
                }
                if packet.data.as_slice().first() == Some(&KEEP_ALIVE_RESPONSE) {
                    self.touch();
                    return LinkHandleResult::None;
                }
            }
            PacketContext::LinkRtt => {
                let mut buffer = [0u8; PACKET_MDU];
                if let Ok(plain_text) = self.decrypt(packet.data.as_slice(), &mut buffer[..]) {
                    if let Ok(rtt) = rmp::decode::read_f32(&mut &plain_text[..]) {
                        if rtt.is_finite() && rtt >= 0.0 {
                            self.rtt = Duration::from_secs_f32(rtt);
                            self.touch();
                        }
                    }
                }
            }
            PacketContext::LinkClose => {
                log::debug!("link({}): peer closed", self.id);
                self.close();
                return LinkHandleResult::Closed;
            }
            _ => {}
        }

        LinkHandleResult::None
    }

    pub fn handle_packet(&mut self, packet: &Packet) -> LinkHandleResult {
        if packet.destination != self.id {
            return LinkHandleResult::None;
        }

        match packet.header.packet_type {
            PacketType::Data => return self.handle_data_packet(packet),
            PacketType::Proof => {
                if self.status == LinkStatus::Pending
                    && packet.context == PacketContext::LinkRequestProof
                {
                    match validate_proof_packet(&self.destination, &self.id, packet) {
                        Ok((identity, signalling)) => {
                            self.handshake(identity);
                            if let (Some(ours), Some(theirs)) = (self.signalling, signalling) {
                                let (mode, ours_mtu) = unpack_link_mtu(&ours);
                                let (_, theirs_mtu) = unpack_link_mtu(&theirs);
                                self.signalling =
                                    Some(pack_link_mtu(mode, min(ours_mtu, theirs_mtu)));
                            } else if signalling.is_some() {
                                self.signalling = signalling;
                            }

                            self.status = LinkStatus::Active;
                            self.rtt = self.request_time.elapsed();
                            self.touch();

                            log::debug!("link({}): activated", self.id);
                            self.post_event(LinkEvent::Activated);
                            return LinkHandleResult::Activated;
                        }
                        Err(_) => {
                            log::warn!("link({}): proof is not valid", self.id);
                        }
                    }
                }
            }
            _ => {}
        }

        LinkHandleResult::None
    }

    pub fn data_packet(&self, data: &[u8]) -> Result<Packet, RnsError> {
        self.data_packet_with_context(data, PacketContext::None)
    }

    pub fn data_packet_with_context(
        &self,
        data: &[u8],
        context: PacketContext,
    ) -> Result<Packet, RnsError> {
        if !self.status.usable() {
            return Err(RnsError::LinkClosed);
        }

        let mut packet_data = PacketDataBuffer::new();
        let cipher_text_len = {
            let cipher_text = self.encrypt(data, packet_data.acquire_buf_max())?;
            cipher_text.len()
        };
        packet_data.resize(cipher_text_len);

        Ok(Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            destination: self.id,
            transport: None,
            context,
            data: packet_data,
        })
    }

    pub fn keep_alive_packet(&self, request: bool) -> Packet {
        let byte = if request { KEEP_ALIVE_REQUEST } else { KEEP_ALIVE_RESPONSE };

        let mut packet_data = PacketDataBuffer::new();
        let _ = packet_data.write(&[byte]);

        Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            destination: self.id,
            transport: None,
            context: PacketContext::KeepAlive,
            data: packet_data,
        }
    }

    /// Best-effort teardown notification to the peer.
    pub fn close_packet(&self) -> Packet {
        let mut packet_data = PacketDataBuffer::new();
        let _ = packet_data.write(self.id.as_slice());

        Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            destination: self.id,
            transport: None,
            context: PacketContext::LinkClose,
            data: packet_data,
        }
    }

    pub fn encrypt<'a>(&self, text: &[u8], out_buf: &'a mut [u8]) -> Result<&'a [u8], RnsError> {
        use crate::crypt::token::{PlainText, TokenCipher};

        let cipher = TokenCipher::new_from_slices(
            self.derived_key.sign_half(),
            self.derived_key.encrypt_half(),
            OsRng,
        );
        let token = cipher.encrypt(PlainText::from(text), out_buf)?;
        let len = token.len();
        Ok(&out_buf[..len])
    }

    pub fn decrypt<'a>(&self, data: &[u8], out_buf: &'a mut [u8]) -> Result<&'a [u8], RnsError> {
        use crate::crypt::token::{Token, TokenCipher};

        let cipher = TokenCipher::new_from_slices(
            self.derived_key.sign_half(),
            self.derived_key.encrypt_half(),
            OsRng,
        );
        let verified = cipher.verify(Token::from(data))?;
        let plain = cipher.decrypt(verified, out_buf)?;
        Ok(plain.as_slice())
    }

    pub fn destination(&self) -> &DestinationDesc {
        &self.destination
    }

    pub fn peer_identity(&self) -> &Identity {
        &self.peer_identity
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Smoothed round-trip estimate, seeded by the handshake and nudged by
    /// 5% towards every later sample.
    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    /// Shares the initiator's measured handshake RTT with the responder,
    /// which otherwise has no round-trip sample of its own.
    pub fn rtt_packet(&self) -> Result<Packet, RnsError> {
        let mut encoded = Vec::with_capacity(8);
        rmp::encode::write_f32(&mut encoded, self.rtt.as_secs_f32())
            .map_err(|_| RnsError::InvalidArgument)?;

        let mut packet_data = PacketDataBuffer::new();
        let cipher_text_len = {
            let cipher_text = self.encrypt(&encoded, packet_data.acquire_buf_max())?;
            cipher_text.len()
        };
        packet_data.resize(cipher_text_len);

        Ok(Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            destination: self.id,
            transport: None,
            context: PacketContext::LinkRtt,
            data: packet_data,
        })
    }

    pub fn update_rtt(&mut self, sample: Duration) {
        if self.rtt.is_zero() {
            self.rtt = sample;
            return;
        }
        let mixed = self.rtt.as_secs_f32() * (1.0 - RTT_EWMA_STEP)
            + sample.as_secs_f32() * RTT_EWMA_STEP;
        self.rtt = Duration::from_secs_f32(mixed);
    }

    fn handshake(&mut self, peer_identity: Identity) {
        log::debug!("link({}): handshake", self.id);

        self.status = LinkStatus::Handshake;
        self.peer_identity = peer_identity;
        self.derived_key = self
            .priv_identity
            .derive_key(&self.peer_identity.public_key, Some(self.id.as_slice()));
    }

    fn post_event(&self, event: LinkEvent) {
        let _ = self.event_tx.send(LinkEventData {
            id: self.id,
            address_hash: self.destination.address_hash,
            event,
        });
    }

    pub fn close(&mut self) {
        if self.status == LinkStatus::Closed {
            return;
        }
        self.status = LinkStatus::Closed;
        self.post_event(LinkEvent::Closed);
        log::debug!("link({}): closed", self.id);
    }

    pub fn mark_stale(&mut self) {
        if self.status == LinkStatus::Active {
            self.status = LinkStatus::Stale;
        }
    }

    pub fn restart(&mut self) {
        log::warn!("link({}): restart after {}s", self.id, self.request_time.elapsed().as_secs());
        self.status = LinkStatus::Pending;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        if self.status == LinkStatus::Stale {
            self.status = LinkStatus::Active;
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.request_time.elapsed()
    }

    pub fn inactive_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn id(&self) -> &LinkId {
        &self.id
    }
}

fn validate_proof_packet(
    destination: &DestinationDesc,
    id: &LinkId,
    packet: &Packet,
) -> Result<(Identity, Option<[u8; LINK_MTU_SIZE]>), RnsError> {
    const MIN_PROOF_LEN: usize = SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH;
    const MTU_PROOF_LEN: usize = MIN_PROOF_LEN + LINK_MTU_SIZE;
    const SIGN_DATA_LEN: usize = ADDRESS_HASH_SIZE + PUBLIC_KEY_LENGTH * 2 + LINK_MTU_SIZE;

    if packet.data.len() < MIN_PROOF_LEN {
        return Err(RnsError::InvalidPacket);
    }

    let data = packet.data.as_slice();
    let verifying_key = destination.identity.verifying_key.as_bytes();

    let mut proof_data = [0u8; SIGN_DATA_LEN];
    let signalling = if data.len() >= MTU_PROOF_LEN {
        let mut bytes = [0u8; LINK_MTU_SIZE];
        bytes.copy_from_slice(&data[MIN_PROOF_LEN..MTU_PROOF_LEN]);
        Some(bytes)
    } else {
        None
    };

    let sign_data_len = {
        let mut output = OutputBuffer::new(&mut proof_data[..]);
        output.write(id.as_slice())?;
        output.write(&data[SIGNATURE_LENGTH..SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH])?;
        output.write(verifying_key)?;
        if let Some(signalling) = signalling {
            output.write(&signalling)?;
        }
        output.offset()
    };

    let mut identity_bytes = [0u8; PUBLIC_KEY_LENGTH * 2];
    identity_bytes[..PUBLIC_KEY_LENGTH]
        .copy_from_slice(&data[SIGNATURE_LENGTH..SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH]);
    identity_bytes[PUBLIC_KEY_LENGTH..].copy_from_slice(verifying_key);
    let identity = Identity::from_public_bytes(&identity_bytes)?;

    let signature = Signature::from_slice(&data[..SIGNATURE_LENGTH])
        .map_err(|_| RnsError::CryptoError)?;

    identity.verify(&proof_data[..sign_data_len], &signature)?;

    Ok((identity, signalling))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand_core::OsRng;

    use super::{pack_link_mtu, unpack_link_mtu, Link, LinkHandleResult, LinkStatus};
    use crate::destination::{single_in, DestinationDesc};
    use crate::identity::PrivateIdentity;
    use crate::packet::PacketContext;

    fn test_destination() -> (crate::destination::SingleInputDestination, DestinationDesc) {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let destination = single_in(identity, "example_utilities", &["linkexample"])
            .expect("destination");
        let desc = destination.desc;
        (destination, desc)
    }

    #[test]
    fn mtu_signalling_roundtrip() {
        let bytes = pack_link_mtu(0b101, 1_500_000 & 0x1F_FFFF);
        let (mode, mtu) = unpack_link_mtu(&bytes);
        assert_eq!(mode, 0b101);
        assert_eq!(mtu, 1_500_000 & 0x1F_FFFF);
    }

    #[test]
    fn handshake_activates_both_sides() {
        let (destination, desc) = test_destination();
        let (tx_a, _rx_a) = tokio::sync::broadcast::channel(8);
        let (tx_b, _rx_b) = tokio::sync::broadcast::channel(8);

        let mut initiator = Link::new(desc, tx_a);
        let request = initiator.request();

        let mut responder =
            Link::new_from_request(&request, destination.sign_key().clone(), desc, tx_b)
                .expect("responder link");
        assert_eq!(responder.id(), initiator.id());

        let proof = responder.prove();
        assert_eq!(responder.status(), LinkStatus::Active);

        assert!(matches!(initiator.handle_packet(&proof), LinkHandleResult::Activated));
        assert_eq!(initiator.status(), LinkStatus::Active);
    }

    #[test]
    fn data_roundtrip_over_active_link() {
        let (destination, desc) = test_destination();
        let (tx_a, _rx_a) = tokio::sync::broadcast::channel(8);
        let (tx_b, mut rx_b) = tokio::sync::broadcast::channel(8);

        let mut initiator = Link::new(desc, tx_a);
        let request = initiator.request();
        let mut responder =
            Link::new_from_request(&request, destination.sign_key().clone(), desc, tx_b)
                .expect("responder link");
        let proof = responder.prove();
        initiator.handle_packet(&proof);

        let packet = initiator.data_packet(b"link payload").expect("data packet");
        let result = responder.handle_packet(&packet);
        assert!(matches!(result, LinkHandleResult::Proof(_)));

        let event = rx_b.try_recv().expect("activation event");
        assert!(matches!(event.event, super::LinkEvent::Activated));
        let event = rx_b.try_recv().expect("data event");
        match event.event {
            super::LinkEvent::Data(payload) => assert_eq!(payload.as_slice(), b"link payload"),
            _ => panic!("expected data event"),
        }
    }

    #[test]
    fn keepalive_and_close() {
        let (destination, desc) = test_destination();
        let (tx_a, _rx_a) = tokio::sync::broadcast::channel(8);
        let (tx_b, _rx_b) = tokio::sync::broadcast::channel(8);

        let mut initiator = Link::new(desc, tx_a);
        let request = initiator.request();
        let mut responder =
            Link::new_from_request(&request, destination.sign_key().clone(), desc, tx_b)
                .expect("responder link");
        let proof = responder.prove();
        initiator.handle_packet(&proof);

        let keep_alive = initiator.keep_alive_packet(true);
        assert!(matches!(responder.handle_packet(&keep_alive), LinkHandleResult::KeepAlive));

        let close = initiator.close_packet();
        assert!(matches!(responder.handle_packet(&close), LinkHandleResult::Closed));
        assert_eq!(responder.status(), LinkStatus::Closed);
    }

    #[test]
    fn rtt_ewma_converges_slowly() {
        let (_, desc) = test_destination();
        let (tx, _rx) = tokio::sync::broadcast::channel(8);
        let mut link = Link::new(desc, tx);

        link.update_rtt(Duration::from_millis(100));
        assert_eq!(link.rtt(), Duration::from_millis(100));

        link.update_rtt(Duration::from_millis(200));
        let millis = link.rtt().as_millis();
        assert!(millis > 100 && millis < 120, "ewma moved too far: {}ms", millis);
    }

    #[test]
    fn garbage_data_counts_against_integrity() {
        let (destination, desc) = test_destination();
        let (tx_a, _rx_a) = tokio::sync::broadcast::channel(8);
        let (tx_b, _rx_b) = tokio::sync::broadcast::channel(8);

        let mut initiator = Link::new(desc, tx_a);
        let request = initiator.request();
        let mut responder =
            Link::new_from_request(&request, destination.sign_key().clone(), desc, tx_b)
                .expect("responder link");
        let proof = responder.prove();
        initiator.handle_packet(&proof);

        let mut garbage = initiator.data_packet(b"payload").expect("data packet");
        garbage.data.as_mut_slice()[20] ^= 0x01;

        for _ in 0..super::LINK_INTEGRITY_LIMIT {
            responder.handle_packet(&garbage);
        }
        assert_eq!(responder.status(), LinkStatus::Closed);
    }
}
