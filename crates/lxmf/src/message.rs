use rand_core::CryptoRngCore;
use serde_bytes::ByteBuf;
use sha2::{Digest, Sha256};

use reticulum::hash::AddressHash;
use reticulum::identity::{Identity, PrivateIdentity};

use crate::constants::{
    DESTINATION_LENGTH, ENCRYPTED_MDU, LINK_PACKET_MDU, SIGNATURE_LENGTH, TIMESTAMP_SIZE,
};
use crate::error::LxmfError;

/// How the router should move a message to its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMethod {
    /// One identity-encrypted packet, no session. Only for payloads that
    /// fit a single packet.
    Opportunistic,
    /// Over an established link to the recipient.
    Direct,
    /// Via a propagation node that stores and forwards.
    Propagated,
}

/// Whether the payload travels as one in-link packet or a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    Packet,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Draft,
    Outbound,
    Sending,
    Sent,
    SendingViaLink,
    Delivered,
    Failed,
}

/// Resolves the effective method and representation for a payload of
/// `payload_len` bytes (the wire form minus the leading destination hash).
pub fn decide_delivery(method: DeliveryMethod, payload_len: usize) -> (DeliveryMethod, Representation) {
    match method {
        DeliveryMethod::Opportunistic => {
            if payload_len <= ENCRYPTED_MDU {
                (DeliveryMethod::Opportunistic, Representation::Packet)
            } else {
                decide_delivery(DeliveryMethod::Direct, payload_len)
            }
        }
        DeliveryMethod::Direct => {
            if payload_len <= LINK_PACKET_MDU {
                (DeliveryMethod::Direct, Representation::Packet)
            } else {
                (DeliveryMethod::Direct, Representation::Resource)
            }
        }
        DeliveryMethod::Propagated => {
            if payload_len <= LINK_PACKET_MDU {
                (DeliveryMethod::Propagated, Representation::Packet)
            } else {
                (DeliveryMethod::Propagated, Representation::Resource)
            }
        }
    }
}

/// A signed LXMF message.
///
/// Wire form: `destination(16) || source(16) || signature(64) ||
/// timestamp(8, big-endian IEEE-754 seconds) || msgpack([title, content,
/// fields])`. The signature covers `destination || source || timestamp ||
/// title || content || fields`.
#[derive(Debug, Clone)]
pub struct LxmMessage {
    pub destination: AddressHash,
    pub source: AddressHash,
    pub signature: Option<[u8; SIGNATURE_LENGTH]>,
    pub timestamp: f64,
    pub title: Vec<u8>,
    pub content: Vec<u8>,
    pub fields: Option<rmpv::Value>,
    pub method: DeliveryMethod,
    state: MessageState,
}

impl LxmMessage {
    pub fn new(
        destination: AddressHash,
        source: AddressHash,
        content: impl Into<Vec<u8>>,
        title: impl Into<Vec<u8>>,
        method: DeliveryMethod,
    ) -> Self {
        Self {
            destination,
            source,
            signature: None,
            timestamp: now_timestamp(),
            title: title.into(),
            content: content.into(),
            fields: None,
            method,
            state: MessageState::Draft,
        }
    }

    pub fn state(&self) -> MessageState {
        self.state
    }

    pub fn set_state(&mut self, state: MessageState) {
        self.state = state;
    }

    pub fn content_as_string(&self) -> Option<String> {
        String::from_utf8(self.content.clone()).ok()
    }

    fn packed_fields(&self) -> Result<Vec<u8>, LxmfError> {
        rmp_serde::to_vec(&self.fields).map_err(|e| LxmfError::Encode(e.to_string()))
    }

    fn signed_part(&self) -> Result<Vec<u8>, LxmfError> {
        let fields = self.packed_fields()?;
        let mut out = Vec::with_capacity(
            DESTINATION_LENGTH * 2
                + TIMESTAMP_SIZE
                + self.title.len()
                + self.content.len()
                + fields.len(),
        );
        out.extend_from_slice(self.destination.as_slice());
        out.extend_from_slice(self.source.as_slice());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.title);
        out.extend_from_slice(&self.content);
        out.extend_from_slice(&fields);
        Ok(out)
    }

    /// Stable message id: the digest of the signed region.
    pub fn message_id(&self) -> Result<[u8; 32], LxmfError> {
        let digest = Sha256::new().chain_update(self.signed_part()?).finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Ok(out)
    }

    pub fn sign(&mut self, signer: &PrivateIdentity) -> Result<(), LxmfError> {
        let signed_part = self.signed_part()?;
        self.signature = Some(signer.sign(&signed_part).to_bytes());
        Ok(())
    }

    /// Verifies the signature against the claimed source identity.
    pub fn validate(&self, source_identity: &Identity) -> Result<bool, LxmfError> {
        let Some(signature_bytes) = self.signature else {
            return Ok(false);
        };
        let signature = ed25519_dalek::Signature::from_slice(&signature_bytes)
            .map_err(|e| LxmfError::Decode(e.to_string()))?;
        Ok(source_identity.verify(&self.signed_part()?, &signature).is_ok())
    }

    pub fn pack(&self) -> Result<Vec<u8>, LxmfError> {
        let signature =
            self.signature.ok_or_else(|| LxmfError::Encode("missing signature".into()))?;
        let payload = self.packed_payload()?;

        let mut out = Vec::with_capacity(
            DESTINATION_LENGTH * 2 + SIGNATURE_LENGTH + TIMESTAMP_SIZE + payload.len(),
        );
        out.extend_from_slice(self.destination.as_slice());
        out.extend_from_slice(self.source.as_slice());
        out.extend_from_slice(&signature);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    fn packed_payload(&self) -> Result<Vec<u8>, LxmfError> {
        let triple = (
            ByteBuf::from(self.title.clone()),
            ByteBuf::from(self.content.clone()),
            self.fields.clone(),
        );
        rmp_serde::to_vec(&triple).map_err(|e| LxmfError::Encode(e.to_string()))
    }

    pub fn unpack(bytes: &[u8]) -> Result<Self, LxmfError> {
        let min_len = DESTINATION_LENGTH * 2 + SIGNATURE_LENGTH + TIMESTAMP_SIZE;
        if bytes.len() <= min_len {
            return Err(LxmfError::Decode("message too short".into()));
        }

        let destination = AddressHash::try_from_slice(&bytes[..DESTINATION_LENGTH])
            .map_err(|_| LxmfError::Decode("bad destination hash".into()))?;
        let source =
            AddressHash::try_from_slice(&bytes[DESTINATION_LENGTH..DESTINATION_LENGTH * 2])
                .map_err(|_| LxmfError::Decode("bad source hash".into()))?;

        let mut signature = [0u8; SIGNATURE_LENGTH];
        let signature_start = DESTINATION_LENGTH * 2;
        signature.copy_from_slice(&bytes[signature_start..signature_start + SIGNATURE_LENGTH]);

        let timestamp_start = signature_start + SIGNATURE_LENGTH;
        let mut timestamp_bytes = [0u8; TIMESTAMP_SIZE];
        timestamp_bytes.copy_from_slice(&bytes[timestamp_start..timestamp_start + TIMESTAMP_SIZE]);
        let timestamp = f64::from_be_bytes(timestamp_bytes);

        let (title, content, fields): (ByteBuf, ByteBuf, Option<rmpv::Value>) =
            rmp_serde::from_slice(&bytes[timestamp_start + TIMESTAMP_SIZE..])
                .map_err(|e| LxmfError::Decode(e.to_string()))?;

        Ok(Self {
            destination,
            source,
            signature: Some(signature),
            timestamp,
            title: title.into_vec(),
            content: content.into_vec(),
            fields,
            method: DeliveryMethod::Opportunistic,
            state: MessageState::Draft,
        })
    }

    /// Payload actually carried to the recipient: the wire form minus the
    /// leading destination hash, which the addressing layer supplies.
    pub fn delivery_payload(&self) -> Result<Vec<u8>, LxmfError> {
        Ok(self.pack()?[DESTINATION_LENGTH..].to_vec())
    }

    /// Rebuilds a message from a delivery payload received at
    /// `destination`.
    pub fn from_delivery_payload(
        destination: AddressHash,
        payload: &[u8],
    ) -> Result<Self, LxmfError> {
        let mut bytes = Vec::with_capacity(DESTINATION_LENGTH + payload.len());
        bytes.extend_from_slice(destination.as_slice());
        bytes.extend_from_slice(payload);
        Self::unpack(&bytes)
    }

    /// Envelope for store-and-forward transfer:
    /// `msgpack((timestamp, [destination || encrypted_payload]))`, where
    /// the payload is encrypted to the recipient identity so propagation
    /// nodes only ever see ciphertext.
    pub fn pack_propagation<R: CryptoRngCore + Copy>(
        &self,
        recipient: &Identity,
        rng: R,
    ) -> Result<Vec<u8>, LxmfError> {
        let payload = self.delivery_payload()?;
        let encrypted = recipient
            .encrypt(&payload, None, rng)
            .map_err(|e| LxmfError::Encode(e.to_string()))?;

        let mut lxmf_data = Vec::with_capacity(DESTINATION_LENGTH + encrypted.len());
        lxmf_data.extend_from_slice(self.destination.as_slice());
        lxmf_data.extend_from_slice(&encrypted);

        let envelope = (self.timestamp, vec![ByteBuf::from(lxmf_data)]);
        rmp_serde::to_vec(&envelope).map_err(|e| LxmfError::Encode(e.to_string()))
    }

    pub fn unpack_propagation(bytes: &[u8]) -> Result<(f64, Vec<Vec<u8>>), LxmfError> {
        let (timestamp, entries): (f64, Vec<ByteBuf>) =
            rmp_serde::from_slice(bytes).map_err(|e| LxmfError::Decode(e.to_string()))?;
        Ok((timestamp, entries.into_iter().map(ByteBuf::into_vec).collect()))
    }
}

const SPOOL_MAGIC: &[u8; 8] = b"LXMSPOOL";
const SPOOL_VERSION: u8 = 0;

fn method_byte(method: DeliveryMethod) -> u8 {
    match method {
        DeliveryMethod::Opportunistic => 0x01,
        DeliveryMethod::Direct => 0x02,
        DeliveryMethod::Propagated => 0x03,
    }
}

fn method_from_byte(byte: u8) -> DeliveryMethod {
    match byte {
        0x02 => DeliveryMethod::Direct,
        0x03 => DeliveryMethod::Propagated,
        _ => DeliveryMethod::Opportunistic,
    }
}

impl LxmMessage {
    /// Serialization for the outbound spool: magic, version, method, then
    /// the full wire form.
    pub fn pack_spool(&self) -> Result<Vec<u8>, LxmfError> {
        let wire = self.pack()?;
        let mut out = Vec::with_capacity(SPOOL_MAGIC.len() + 2 + wire.len());
        out.extend_from_slice(SPOOL_MAGIC);
        out.push(SPOOL_VERSION);
        out.push(method_byte(self.method));
        out.extend_from_slice(&wire);
        Ok(out)
    }

    pub fn unpack_spool(bytes: &[u8]) -> Result<Self, LxmfError> {
        if bytes.len() < SPOOL_MAGIC.len() + 2 || !bytes.starts_with(SPOOL_MAGIC) {
            return Err(LxmfError::Decode("not a spool record".into()));
        }
        if bytes[SPOOL_MAGIC.len()] != SPOOL_VERSION {
            return Err(LxmfError::Decode("unsupported spool version".into()));
        }
        let method = method_from_byte(bytes[SPOOL_MAGIC.len() + 1]);
        let mut message = Self::unpack(&bytes[SPOOL_MAGIC.len() + 2..])?;
        message.method = method;
        message.state = MessageState::Outbound;
        Ok(message)
    }
}

pub fn now_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use reticulum::identity::PrivateIdentity;

    use super::{
        decide_delivery, DeliveryMethod, LxmMessage, MessageState, Representation,
    };
    use crate::constants::{ENCRYPTED_MDU, LINK_PACKET_MDU, TIMESTAMP_SIZE};

    fn signed_message(content: &[u8]) -> (LxmMessage, PrivateIdentity, PrivateIdentity) {
        let source_identity = PrivateIdentity::new_from_rand(OsRng);
        let dest_identity = PrivateIdentity::new_from_rand(OsRng);

        let mut message = LxmMessage::new(
            *dest_identity.address_hash(),
            *source_identity.address_hash(),
            content,
            b"subject".as_slice(),
            DeliveryMethod::Opportunistic,
        );
        message.sign(&source_identity).expect("sign");
        (message, source_identity, dest_identity)
    }

    #[test]
    fn wire_roundtrip_preserves_all_fields() {
        let (message, source_identity, _) = signed_message(b"hello lxmf");
        let wire = message.pack().expect("wire");

        let decoded = LxmMessage::unpack(&wire).expect("message");
        assert_eq!(decoded.destination, message.destination);
        assert_eq!(decoded.source, message.source);
        assert_eq!(decoded.title, message.title);
        assert_eq!(decoded.content, message.content);
        assert_eq!(decoded.timestamp, message.timestamp);
        assert!(decoded.validate(source_identity.as_identity()).expect("validate"));
    }

    #[test]
    fn timestamp_serializes_big_endian() {
        let (message, _, _) = signed_message(b"ts");
        let wire = message.pack().expect("wire");
        let start = 16 + 16 + 64;
        let mut bytes = [0u8; TIMESTAMP_SIZE];
        bytes.copy_from_slice(&wire[start..start + TIMESTAMP_SIZE]);
        assert_eq!(f64::from_be_bytes(bytes), message.timestamp);
    }

    #[test]
    fn tampered_content_fails_validation() {
        let (message, source_identity, _) = signed_message(b"authentic");
        let mut wire = message.pack().expect("wire");
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        let decoded = LxmMessage::unpack(&wire).expect("message");
        assert!(!decoded.validate(source_identity.as_identity()).expect("validate"));
    }

    #[test]
    fn delivery_payload_roundtrip() {
        let (message, source_identity, _) = signed_message(b"stripped destination");
        let payload = message.delivery_payload().expect("payload");
        assert_eq!(payload.len(), message.pack().expect("wire").len() - 16);

        let rebuilt =
            LxmMessage::from_delivery_payload(message.destination, &payload).expect("message");
        assert_eq!(rebuilt.content, message.content);
        assert!(rebuilt.validate(source_identity.as_identity()).expect("validate"));
    }

    #[test]
    fn propagation_envelope_decrypts_at_destination() {
        let (message, source_identity, dest_identity) = signed_message(b"store and forward");
        let envelope = message
            .pack_propagation(dest_identity.as_identity(), OsRng)
            .expect("envelope");

        let (timestamp, entries) = LxmMessage::unpack_propagation(&envelope).expect("entries");
        assert_eq!(timestamp, message.timestamp);
        assert_eq!(entries.len(), 1);

        let entry = &entries[0];
        let destination_hash =
            reticulum::hash::AddressHash::try_from_slice(&entry[..16]).expect("hash");
        assert_eq!(destination_hash, message.destination);

        // The destination owner decrypts the remainder; the salt is the
        // recipient's identity hash.
        let plaintext = dest_identity
            .decrypt(dest_identity.address_hash().as_slice(), &entry[16..])
            .expect("plaintext");

        let rebuilt =
            LxmMessage::from_delivery_payload(message.destination, &plaintext).expect("message");
        assert_eq!(rebuilt.content, message.content);
        assert!(rebuilt.validate(source_identity.as_identity()).expect("validate"));
    }

    #[test]
    fn spool_roundtrip_restores_method_and_state() {
        let (mut message, _, _) = signed_message(b"spooled");
        message.method = DeliveryMethod::Direct;

        let spooled = message.pack_spool().expect("spool");
        let restored = LxmMessage::unpack_spool(&spooled).expect("message");
        assert_eq!(restored.method, DeliveryMethod::Direct);
        assert_eq!(restored.state(), MessageState::Outbound);
        assert_eq!(restored.content, message.content);
    }

    #[test]
    fn delivery_decision_thresholds() {
        let (method, representation) =
            decide_delivery(DeliveryMethod::Opportunistic, ENCRYPTED_MDU);
        assert_eq!(method, DeliveryMethod::Opportunistic);
        assert_eq!(representation, Representation::Packet);

        let (method, representation) =
            decide_delivery(DeliveryMethod::Opportunistic, ENCRYPTED_MDU + 1);
        assert_eq!(method, DeliveryMethod::Direct);
        assert_eq!(representation, Representation::Packet);

        let (method, representation) =
            decide_delivery(DeliveryMethod::Direct, LINK_PACKET_MDU + 1);
        assert_eq!(method, DeliveryMethod::Direct);
        assert_eq!(representation, Representation::Resource);
    }
}
