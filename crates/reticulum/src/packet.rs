use core::fmt;

use sha2::Digest;

use crate::buffer::{InputBuffer, OutputBuffer, StaticBuffer};
use crate::crypt::token::{TOKEN_MAX_PADDING_SIZE, TOKEN_OVERHEAD_SIZE};
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash, ADDRESS_HASH_SIZE};

pub const RETICULUM_MTU: usize = 500;
pub const HEADER_MIN_SIZE: usize = 2 + 1 + ADDRESS_HASH_SIZE;
pub const HEADER_MAX_SIZE: usize = 2 + 1 + (ADDRESS_HASH_SIZE * 2);
pub const IFAC_MIN_SIZE: usize = 1;

/// Payload capacity of one packet: MTU minus the worst-case header and the
/// minimum IFAC overhead.
pub const PACKET_MDU: usize = RETICULUM_MTU - HEADER_MAX_SIZE - IFAC_MIN_SIZE;

/// Largest payload a single packet can physically carry, with the minimum
/// header form. Packet buffers are sized to this; payload producers bound
/// themselves by [`PACKET_MDU`] or [`LINK_MDU`].
pub const PAYLOAD_MAX: usize = RETICULUM_MTU - HEADER_MIN_SIZE - IFAC_MIN_SIZE;

/// Plaintext capacity of one encrypted in-link packet.
pub const LINK_MDU: usize = ((RETICULUM_MTU - IFAC_MIN_SIZE - HEADER_MIN_SIZE - TOKEN_OVERHEAD_SIZE)
    / TOKEN_MAX_PADDING_SIZE)
    * TOKEN_MAX_PADDING_SIZE
    - 1;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum IfacFlag {
    Open = 0b0,
    Authenticated = 0b1,
}

impl From<u8> for IfacFlag {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            0b1 => IfacFlag::Authenticated,
            _ => IfacFlag::Open,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum HeaderType {
    Type1 = 0b0,
    Type2 = 0b1,
}

impl From<u8> for HeaderType {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            0b1 => HeaderType::Type2,
            _ => HeaderType::Type1,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PropagationType {
    Broadcast = 0b0,
    Transport = 0b1,
}

impl From<u8> for PropagationType {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            0b1 => PropagationType::Transport,
            _ => PropagationType::Broadcast,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ContextFlag {
    Unset = 0b0,
    Set = 0b1,
}

impl From<u8> for ContextFlag {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            0b1 => ContextFlag::Set,
            _ => ContextFlag::Unset,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum DestinationType {
    Single = 0b00,
    Group = 0b01,
    Plain = 0b10,
    Link = 0b11,
}

impl From<u8> for DestinationType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => DestinationType::Group,
            0b10 => DestinationType::Plain,
            0b11 => DestinationType::Link,
            _ => DestinationType::Single,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PacketType {
    Data = 0b00,
    Announce = 0b01,
    LinkRequest = 0b10,
    Proof = 0b11,
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => PacketType::Announce,
            0b10 => PacketType::LinkRequest,
            0b11 => PacketType::Proof,
            _ => PacketType::Data,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PacketContext {
    None = 0x00,
    Resource = 0x01,
    ResourceAdvertisement = 0x02,
    ResourceRequest = 0x03,
    ResourceHashUpdate = 0x04,
    ResourceProof = 0x05,
    ResourceInitiatorCancel = 0x06,
    ResourceReceiverCancel = 0x07,
    CacheRequest = 0x08,
    Request = 0x09,
    Response = 0x0A,
    PathResponse = 0x0B,
    Command = 0x0C,
    CommandStatus = 0x0D,
    Channel = 0x0E,
    KeepAlive = 0xFA,
    LinkIdentify = 0xFB,
    LinkClose = 0xFC,
    LinkProof = 0xFD,
    LinkRtt = 0xFE,
    LinkRequestProof = 0xFF,
}

impl From<u8> for PacketContext {
    fn from(value: u8) -> Self {
        match value {
            0x01 => PacketContext::Resource,
            0x02 => PacketContext::ResourceAdvertisement,
            0x03 => PacketContext::ResourceRequest,
            0x04 => PacketContext::ResourceHashUpdate,
            0x05 => PacketContext::ResourceProof,
            0x06 => PacketContext::ResourceInitiatorCancel,
            0x07 => PacketContext::ResourceReceiverCancel,
            0x08 => PacketContext::CacheRequest,
            0x09 => PacketContext::Request,
            0x0A => PacketContext::Response,
            0x0B => PacketContext::PathResponse,
            0x0C => PacketContext::Command,
            0x0D => PacketContext::CommandStatus,
            0x0E => PacketContext::Channel,
            0xFA => PacketContext::KeepAlive,
            0xFB => PacketContext::LinkIdentify,
            0xFC => PacketContext::LinkClose,
            0xFD => PacketContext::LinkProof,
            0xFE => PacketContext::LinkRtt,
            0xFF => PacketContext::LinkRequestProof,
            _ => PacketContext::None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Header {
    pub ifac_flag: IfacFlag,
    pub header_type: HeaderType,
    pub context_flag: ContextFlag,
    pub propagation_type: PropagationType,
    pub destination_type: DestinationType,
    pub packet_type: PacketType,
    pub hops: u8,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            ifac_flag: IfacFlag::Open,
            header_type: HeaderType::Type1,
            context_flag: ContextFlag::Unset,
            propagation_type: PropagationType::Broadcast,
            destination_type: DestinationType::Single,
            packet_type: PacketType::Data,
            hops: 0,
        }
    }
}

impl Header {
    pub fn pack_flags(&self) -> u8 {
        (self.ifac_flag as u8) << 7
            | (self.header_type as u8) << 6
            | (self.context_flag as u8) << 5
            | (self.propagation_type as u8) << 4
            | (self.destination_type as u8) << 2
            | (self.packet_type as u8)
    }

    pub fn unpack_flags(flags: u8) -> Self {
        Self {
            ifac_flag: IfacFlag::from(flags >> 7),
            header_type: HeaderType::from(flags >> 6),
            context_flag: ContextFlag::from(flags >> 5),
            propagation_type: PropagationType::from(flags >> 4),
            destination_type: DestinationType::from(flags >> 2),
            packet_type: PacketType::from(flags),
            hops: 0,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:b}{:b}{:b}{:b}{:02b}{:02b}.{}",
            self.ifac_flag as u8,
            self.header_type as u8,
            self.context_flag as u8,
            self.propagation_type as u8,
            self.destination_type as u8,
            self.packet_type as u8,
            self.hops,
        )
    }
}

pub type PacketDataBuffer = StaticBuffer<PAYLOAD_MAX>;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Packet {
    pub header: Header,
    pub destination: AddressHash,
    pub transport: Option<AddressHash>,
    pub context: PacketContext,
    pub data: PacketDataBuffer,
}

impl Packet {
    /// Decodes one wire frame. Fails on anything shorter than the minimum
    /// header for its flagged form; such frames are dropped silently by the
    /// transport.
    pub fn unpack(bytes: &[u8]) -> Result<Self, RnsError> {
        let mut input = InputBuffer::new(bytes);

        if bytes.len() < HEADER_MIN_SIZE {
            return Err(RnsError::InvalidPacket);
        }

        let mut header = Header::unpack_flags(input.read_byte()?);
        header.hops = input.read_byte()?;

        let transport = if header.header_type == HeaderType::Type2 {
            let raw = input.read_slice(ADDRESS_HASH_SIZE).map_err(|_| RnsError::InvalidPacket)?;
            Some(AddressHash::try_from_slice(raw)?)
        } else {
            None
        };

        let destination = AddressHash::try_from_slice(
            input.read_slice(ADDRESS_HASH_SIZE).map_err(|_| RnsError::InvalidPacket)?,
        )?;

        let context = PacketContext::from(input.read_byte().map_err(|_| RnsError::InvalidPacket)?);

        let remaining = input.read_remaining();
        if remaining.len() > PAYLOAD_MAX {
            return Err(RnsError::MtuExceeded);
        }
        let data = PacketDataBuffer::new_from_slice(remaining);

        Ok(Self { header, destination, transport, context, data })
    }

    pub fn pack(&self, output: &mut OutputBuffer) -> Result<usize, RnsError> {
        output.write_byte(self.header.pack_flags())?;
        output.write_byte(self.header.hops)?;

        if self.header.header_type == HeaderType::Type2 {
            let transport = self.transport.ok_or(RnsError::InvalidPacket)?;
            output.write(transport.as_slice())?;
        }

        output.write(self.destination.as_slice())?;
        output.write_byte(self.context as u8)?;
        output.write(self.data.as_slice())?;

        Ok(output.offset())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RnsError> {
        let mut raw = [0u8; RETICULUM_MTU];
        let mut output = OutputBuffer::new(&mut raw);
        let len = self.pack(&mut output)?;
        Ok(raw[..len].to_vec())
    }

    /// Digest over the whole raw packet except the hops byte. Transport
    /// deduplication keys on this, so a forwarded copy (different header
    /// form, different transport id) is distinct from a replay.
    pub fn dedup_hash(&self) -> Hash {
        let mut generator = Hash::generator();
        generator.update([self.header.pack_flags()]);
        if let Some(transport) = self.transport {
            generator.update(transport.as_slice());
        }
        generator.update(self.destination.as_slice());
        generator.update([self.context as u8]);
        generator.update(self.data.as_slice());
        Hash::new(generator.finalize().into())
    }

    /// Digest over the addressable part of the packet: the addressing bits
    /// of the flag byte, destination, context and payload. Proofs and link
    /// ids are computed over this; hops and transport rewrites do not
    /// change it.
    pub fn packet_hash(&self) -> Hash {
        Hash::new(
            Hash::generator()
                .chain_update([self.header.pack_flags() & 0b0000_1111])
                .chain_update(self.destination.as_slice())
                .chain_update([self.context as u8])
                .chain_update(self.data.as_slice())
                .finalize()
                .into(),
        )
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            header: Default::default(),
            destination: AddressHash::new_empty(),
            transport: None,
            context: PacketContext::None,
            data: Default::default(),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.header)?;
        if let Some(transport) = self.transport {
            write!(f, " via {}", transport)?;
        }
        write!(f, " {} {}B]", self.destination, self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{
        ContextFlag, DestinationType, Header, HeaderType, IfacFlag, Packet, PacketContext,
        PacketDataBuffer, PacketType, PropagationType, HEADER_MIN_SIZE, LINK_MDU, PACKET_MDU,
    };
    use crate::hash::AddressHash;

    #[test]
    fn flag_byte_roundtrip() {
        let header = Header {
            ifac_flag: IfacFlag::Open,
            header_type: HeaderType::Type2,
            context_flag: ContextFlag::Set,
            propagation_type: PropagationType::Transport,
            destination_type: DestinationType::Link,
            packet_type: PacketType::Proof,
            hops: 0,
        };

        let decoded = Header::unpack_flags(header.pack_flags());
        assert_eq!(decoded.header_type, HeaderType::Type2);
        assert_eq!(decoded.context_flag, ContextFlag::Set);
        assert_eq!(decoded.propagation_type, PropagationType::Transport);
        assert_eq!(decoded.destination_type, DestinationType::Link);
        assert_eq!(decoded.packet_type, PacketType::Proof);
    }

    #[test]
    fn wire_roundtrip_type1() {
        let packet = Packet {
            header: Header { packet_type: PacketType::Data, ..Default::default() },
            destination: AddressHash::new_from_rand(OsRng),
            transport: None,
            context: PacketContext::Request,
            data: PacketDataBuffer::new_from_slice(b"payload bytes"),
        };

        let raw = packet.to_bytes().expect("wire form");
        assert_eq!(raw.len(), HEADER_MIN_SIZE + b"payload bytes".len());

        let decoded = Packet::unpack(&raw).expect("packet");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn wire_roundtrip_type2_carries_transport_id() {
        let packet = Packet {
            header: Header {
                header_type: HeaderType::Type2,
                propagation_type: PropagationType::Transport,
                packet_type: PacketType::Announce,
                hops: 3,
                ..Default::default()
            },
            destination: AddressHash::new_from_rand(OsRng),
            transport: Some(AddressHash::new_from_rand(OsRng)),
            context: PacketContext::None,
            data: PacketDataBuffer::new_from_slice(&[0xAA; 64]),
        };

        let raw = packet.to_bytes().expect("wire form");
        let decoded = Packet::unpack(&raw).expect("packet");
        assert_eq!(decoded.transport, packet.transport);
        assert_eq!(decoded.header.hops, 3);
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(Packet::unpack(&[0u8; HEADER_MIN_SIZE - 1]).is_err());

        // Type2 flag without room for the transport id.
        let mut raw = vec![0u8; HEADER_MIN_SIZE];
        raw[0] = Header { header_type: HeaderType::Type2, ..Default::default() }.pack_flags();
        assert!(Packet::unpack(&raw).is_err());
    }

    #[test]
    fn packet_hash_ignores_hops() {
        let mut packet = Packet {
            destination: AddressHash::new_from_rand(OsRng),
            data: PacketDataBuffer::new_from_slice(b"hop invariant"),
            ..Default::default()
        };

        let before = packet.packet_hash();
        packet.header.hops = 7;
        assert_eq!(packet.packet_hash(), before);
    }

    #[test]
    fn mdu_arithmetic() {
        assert_eq!(PACKET_MDU, 464);
        assert_eq!(LINK_MDU, 431);
        // An encrypted link-MDU payload fills the buffer exactly.
        assert_eq!(super::PAYLOAD_MAX, 480);
        assert_eq!(LINK_MDU + 1 + 16 + 32, super::PAYLOAD_MAX);
    }
}
