use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::RnsError;
use crate::packet::{IfacFlag, Packet};

pub const IFAC_TAG_SIZE: usize = 16;
const IFAC_KEY_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Interface Access Code context, derived once per interface from the
/// shared network name and passphrase:
///
///   ifac_key = HKDF(ikm = sha256(netname), salt = sha256(netkey))
///
/// Every outbound packet gains a trailing `HMAC-SHA256(ifac_key, raw)[:16]`
/// and packets without a valid tag never reach the transport. Rejection is
/// silent so unrelated logical networks stay invisible to each other.
pub struct IfacContext {
    key: [u8; IFAC_KEY_SIZE],
}

impl IfacContext {
    pub fn new(netname: &str, netkey: &str) -> Self {
        let ikm = Sha256::new().chain_update(netname.as_bytes()).finalize();
        let salt = Sha256::new().chain_update(netkey.as_bytes()).finalize();

        let mut key = [0u8; IFAC_KEY_SIZE];
        let _ = Hkdf::<Sha256>::new(Some(salt.as_slice()), ikm.as_slice())
            .expand(&[], &mut key[..]);

        Self { key }
    }

    fn tag(&self, raw: &[u8]) -> [u8; IFAC_TAG_SIZE] {
        let mut hmac = <HmacSha256 as Mac>::new_from_slice(&self.key).expect("hmac accepts key");
        hmac.update(raw);
        let digest = hmac.finalize().into_bytes();
        let mut tag = [0u8; IFAC_TAG_SIZE];
        tag.copy_from_slice(&digest[..IFAC_TAG_SIZE]);
        tag
    }

    /// Appends the access tag to a raw packet, with the IFAC flag bit set.
    pub fn mask(&self, raw: &[u8]) -> Vec<u8> {
        let mut masked = Vec::with_capacity(raw.len() + IFAC_TAG_SIZE);
        masked.extend_from_slice(raw);
        if let Some(flags) = masked.first_mut() {
            *flags |= 0b1000_0000;
        }
        let tag = self.tag(&masked);
        masked.extend_from_slice(&tag);
        masked
    }

    /// Verifies and strips the trailing tag. The returned bytes carry the
    /// IFAC flag cleared so the rest of the stack sees a uniform packet.
    pub fn unmask(&self, raw: &[u8]) -> Result<Vec<u8>, RnsError> {
        if raw.len() <= IFAC_TAG_SIZE {
            return Err(RnsError::InvalidPacket);
        }

        let (body, tag) = raw.split_at(raw.len() - IFAC_TAG_SIZE);
        let expected = self.tag(body);

        let mut diff = 0u8;
        for (a, b) in tag.iter().zip(expected.iter()) {
            diff |= a ^ b;
        }
        if diff != 0 {
            return Err(RnsError::InvalidPacket);
        }

        let mut unmasked = body.to_vec();
        if let Some(flags) = unmasked.first_mut() {
            *flags &= 0b0111_1111;
        }
        Ok(unmasked)
    }
}

/// Serializes a packet for one interface, applying the access code when the
/// interface carries one.
pub fn encode_packet(packet: &Packet, ifac: Option<&IfacContext>) -> Result<Vec<u8>, RnsError> {
    let raw = packet.to_bytes()?;
    match ifac {
        Some(context) => Ok(context.mask(&raw)),
        None => Ok(raw),
    }
}

/// Parses an inbound frame for one interface. Frames that fail the access
/// check, or that claim authentication on an open interface, are rejected
/// before any packet state is touched.
pub fn decode_packet(raw: &[u8], ifac: Option<&IfacContext>) -> Result<Packet, RnsError> {
    match ifac {
        Some(context) => {
            let unmasked = context.unmask(raw)?;
            Packet::unpack(&unmasked)
        }
        None => {
            let packet = Packet::unpack(raw)?;
            if packet.header.ifac_flag == IfacFlag::Authenticated {
                return Err(RnsError::InvalidPacket);
            }
            Ok(packet)
        }
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{decode_packet, encode_packet, IfacContext, IFAC_TAG_SIZE};
    use crate::hash::AddressHash;
    use crate::packet::{Packet, PacketDataBuffer};

    fn test_packet() -> Packet {
        Packet {
            destination: AddressHash::new_from_rand(OsRng),
            data: PacketDataBuffer::new_from_slice(b"ifac payload"),
            ..Default::default()
        }
    }

    #[test]
    fn masked_roundtrip() {
        let context = IfacContext::new("test_network", "passphrase");
        let packet = test_packet();

        let framed = encode_packet(&packet, Some(&context)).expect("frame");
        assert_eq!(framed.len(), packet.to_bytes().expect("raw").len() + IFAC_TAG_SIZE);

        let decoded = decode_packet(&framed, Some(&context)).expect("packet");
        assert_eq!(decoded.destination, packet.destination);
        assert_eq!(decoded.data, packet.data);
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let sender = IfacContext::new("test_network", "passphrase one");
        let receiver = IfacContext::new("test_network", "passphrase two");

        let framed = encode_packet(&test_packet(), Some(&sender)).expect("frame");
        assert!(decode_packet(&framed, Some(&receiver)).is_err());
    }

    #[test]
    fn open_interface_rejects_masked_frames() {
        let context = IfacContext::new("test_network", "passphrase");
        let framed = encode_packet(&test_packet(), Some(&context)).expect("frame");
        assert!(decode_packet(&framed, None).is_err());
    }

    #[test]
    fn authenticated_interface_rejects_open_frames() {
        let context = IfacContext::new("test_network", "passphrase");
        let raw = test_packet().to_bytes().expect("raw");
        assert!(decode_packet(&raw, Some(&context)).is_err());
    }
}
