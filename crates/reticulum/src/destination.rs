pub mod link;

use core::fmt;
use core::marker::PhantomData;
use std::path::Path;

use ed25519_dalek::{Signature, SigningKey};
use rand_core::CryptoRngCore;
use x25519_dalek::PublicKey;

use crate::error::RnsError;
use crate::hash::{AddressHash, Hash, NameHash, NAME_HASH_SIZE};
use crate::identity::{
    encrypt_for_key, Identity, PrivateIdentity, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};
use crate::packet::{
    ContextFlag, DestinationType, Header, HeaderType, IfacFlag, Packet, PacketContext,
    PacketDataBuffer, PacketType, PropagationType,
};
use crate::ratchets::{now_secs, ratchet_id, RatchetRing, RATCHET_LENGTH};

pub const RAND_HASH_SIZE: usize = 10;
pub const MIN_ANNOUNCE_DATA_SIZE: usize =
    PUBLIC_KEY_LENGTH * 2 + NAME_HASH_SIZE + RAND_HASH_SIZE + SIGNATURE_LENGTH;

/// Direction marker: this node owns the destination and receives for it.
pub struct In;
/// Direction marker: a remote destination this node sends towards.
pub struct Out;

pub trait Direction {}
impl Direction for In {}
impl Direction for Out {}

pub struct Single;
pub struct Plain;

pub trait Type {
    fn destination_type() -> DestinationType;
}

impl Type for Single {
    fn destination_type() -> DestinationType {
        DestinationType::Single
    }
}

impl Type for Plain {
    fn destination_type() -> DestinationType {
        DestinationType::Plain
    }
}

/// Identity-shaped handle whose hash participates in destination hashing.
pub trait IdentityHash {
    fn identity_hash_slice(&self) -> &[u8];
}

impl IdentityHash for Identity {
    fn identity_hash_slice(&self) -> &[u8] {
        self.address_hash.as_slice()
    }
}

impl IdentityHash for PrivateIdentity {
    fn identity_hash_slice(&self) -> &[u8] {
        self.address_hash().as_slice()
    }
}

/// PLAIN destinations are not bound to any identity.
pub struct EmptyIdentity;

impl IdentityHash for EmptyIdentity {
    fn identity_hash_slice(&self) -> &[u8] {
        &[]
    }
}

#[derive(Copy, Clone)]
pub struct DestinationName {
    pub hash: Hash,
}

impl DestinationName {
    /// Hashes `app_name[.aspect]*`. Dots are the component separator and
    /// are forbidden inside components.
    pub fn new(app_name: &str, aspects: &[&str]) -> Result<Self, RnsError> {
        if app_name.is_empty() || app_name.contains('.') {
            return Err(RnsError::InvalidArgument);
        }

        let mut generator = Hash::generator();
        use sha2::Digest;
        generator.update(app_name.as_bytes());
        for aspect in aspects {
            if aspect.is_empty() || aspect.contains('.') {
                return Err(RnsError::InvalidArgument);
            }
            generator.update(".".as_bytes());
            generator.update(aspect.as_bytes());
        }

        Ok(Self { hash: Hash::new(generator.finalize().into()) })
    }

    pub fn new_from_hash_slice(hash_slice: &[u8]) -> Self {
        let mut hash = [0u8; 32];
        let len = hash_slice.len().min(32);
        hash[..len].copy_from_slice(&hash_slice[..len]);
        Self { hash: Hash::new(hash) }
    }

    pub fn name_hash(&self) -> NameHash {
        NameHash::new_from_hash(&self.hash)
    }

    pub fn as_name_hash_slice(&self) -> &[u8] {
        &self.hash.as_slice()[..NAME_HASH_SIZE]
    }
}

/// `hash = SHA-256(name_hash || identity_hash)[:16]`; PLAIN destinations
/// contribute an empty identity hash.
pub fn create_address_hash<I: IdentityHash>(identity: &I, name: &DestinationName) -> AddressHash {
    use sha2::Digest;
    AddressHash::new_from_hash(&Hash::new(
        Hash::generator()
            .chain_update(name.as_name_hash_slice())
            .chain_update(identity.identity_hash_slice())
            .finalize()
            .into(),
    ))
}

/// Identity, name and address of a destination, shared wherever a remote
/// endpoint needs describing.
#[derive(Copy, Clone)]
pub struct DestinationDesc {
    pub identity: Identity,
    pub address_hash: AddressHash,
    pub name: DestinationName,
}

impl fmt::Display for DestinationDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address_hash)
    }
}

pub struct Destination<I, D: Direction, T: Type> {
    pub direction: PhantomData<D>,
    pub kind: PhantomData<T>,
    pub identity: I,
    pub desc: DestinationDesc,
    ratchets: RatchetRing,
    default_app_data: Option<Vec<u8>>,
}

impl<I, D: Direction, T: Type> Destination<I, D, T> {
    pub fn destination_type(&self) -> DestinationType {
        <T as Type>::destination_type()
    }

    pub fn address_hash(&self) -> &AddressHash {
        &self.desc.address_hash
    }

    pub fn set_default_app_data(&mut self, app_data: Option<&[u8]>) {
        self.default_app_data = app_data.map(|data| data.to_vec());
    }
}

pub type SingleInputDestination = Destination<PrivateIdentity, In, Single>;
pub type SingleOutputDestination = Destination<Identity, Out, Single>;
pub type PlainInputDestination = Destination<EmptyIdentity, In, Plain>;
pub type PlainOutputDestination = Destination<EmptyIdentity, Out, Plain>;

impl SingleInputDestination {
    pub fn new(identity: PrivateIdentity, name: DestinationName) -> Self {
        let address_hash = create_address_hash(&identity, &name);
        let pub_identity = *identity.as_identity();

        Self {
            direction: PhantomData,
            kind: PhantomData,
            identity,
            desc: DestinationDesc { identity: pub_identity, name, address_hash },
            ratchets: RatchetRing::default(),
            default_app_data: None,
        }
    }

    pub fn enable_ratchets<P: AsRef<Path>>(&mut self, path: P) -> Result<(), RnsError> {
        self.ratchets.enable(&self.identity, path.as_ref().to_path_buf())
    }

    pub fn set_retained_ratchets(&mut self, retained: usize) -> Result<(), RnsError> {
        self.ratchets.set_retained(retained)
    }

    pub fn set_ratchet_interval_secs(&mut self, secs: u64) {
        self.ratchets.set_interval_secs(secs);
    }

    pub fn enforce_ratchets(&mut self, enforce: bool) {
        self.ratchets.set_enforce(enforce);
    }

    pub fn rotate_ratchets(&mut self) -> Result<(), RnsError> {
        self.ratchets.rotate(&self.identity, now_secs())
    }

    pub fn ratchet_count(&self) -> usize {
        self.ratchets.len()
    }

    /// Opens a ciphertext addressed to this destination. Ratchets are tried
    /// newest first; the static identity key is only consulted when ratchet
    /// enforcement is off. Returns the plaintext and whether a ratchet
    /// opened it.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<(Vec<u8>, bool), RnsError> {
        let salt = self.identity.as_identity().address_hash;
        if self.ratchets.is_enabled() && !self.ratchets.is_empty() {
            if let Some((plaintext, _)) = self.ratchets.try_decrypt(salt.as_slice(), ciphertext) {
                return Ok((plaintext, true));
            }
            if self.ratchets.enforced() {
                return Err(RnsError::DecryptionFailed);
            }
        }

        let plaintext = self.identity.decrypt(salt.as_slice(), ciphertext)?;
        Ok((plaintext, false))
    }

    /// Builds a self-signed announce packet.
    ///
    /// The signed region is `dest_hash || pub_enc || pub_sig || name_hash ||
    /// random_hash || [ratchet] || app_data`, while the wire payload orders
    /// the signature before the app data and omits the destination hash:
    /// `pub_enc || pub_sig || name_hash || random_hash || [ratchet] ||
    /// signature || app_data`. The two layouts differ on purpose.
    pub fn announce<R: CryptoRngCore + Copy>(
        &mut self,
        rng: R,
        app_data: Option<&[u8]>,
    ) -> Result<Packet, RnsError> {
        // 5 random bytes followed by a 5-byte big-endian unix timestamp;
        // path selection uses the trailing bytes for freshness ordering.
        let mut rand_hash = [0u8; RAND_HASH_SIZE];
        let mut rng_mut = rng;
        rng_mut.fill_bytes(&mut rand_hash[..RAND_HASH_SIZE / 2]);
        let emitted_be = (now_secs().floor() as u64).to_be_bytes();
        rand_hash[RAND_HASH_SIZE / 2..].copy_from_slice(&emitted_be[3..8]);

        let ratchet = if self.ratchets.is_enabled() {
            self.ratchets.rotate_if_needed(&self.identity, now_secs())?;
            self.ratchets.current_public()
        } else {
            None
        };

        let app_data = app_data.or(self.default_app_data.as_deref());

        let pub_key = self.identity.as_identity().public_key_bytes();
        let verifying_key = self.identity.as_identity().verifying_key_bytes();

        let mut packet_data = PacketDataBuffer::new();
        packet_data
            .chain_write(self.desc.address_hash.as_slice())?
            .chain_write(pub_key)?
            .chain_write(verifying_key)?
            .chain_write(self.desc.name.as_name_hash_slice())?
            .chain_write(&rand_hash)?;
        if let Some(ratchet) = ratchet {
            packet_data.write(&ratchet)?;
        }
        if let Some(data) = app_data {
            packet_data.write(data)?;
        }

        let signature = self.identity.sign(packet_data.as_slice());

        packet_data.reset();
        packet_data
            .chain_write(pub_key)?
            .chain_write(verifying_key)?
            .chain_write(self.desc.name.as_name_hash_slice())?
            .chain_write(&rand_hash)?;
        if let Some(ratchet) = ratchet {
            packet_data.write(&ratchet)?;
        }
        packet_data.write(&signature.to_bytes())?;
        if let Some(data) = app_data {
            packet_data.write(data)?;
        }

        Ok(Packet {
            header: Header {
                ifac_flag: IfacFlag::Open,
                header_type: HeaderType::Type1,
                context_flag: if ratchet.is_some() {
                    ContextFlag::Set
                } else {
                    ContextFlag::Unset
                },
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Single,
                packet_type: PacketType::Announce,
                hops: 0,
            },
            destination: self.desc.address_hash,
            transport: None,
            context: PacketContext::None,
            data: packet_data,
        })
    }

    pub fn path_response<R: CryptoRngCore + Copy>(
        &mut self,
        rng: R,
        app_data: Option<&[u8]>,
    ) -> Result<Packet, RnsError> {
        let mut announce = self.announce(rng, app_data)?;
        announce.context = PacketContext::PathResponse;
        Ok(announce)
    }

    pub fn sign_key(&self) -> &SigningKey {
        self.identity.sign_key()
    }
}

impl SingleOutputDestination {
    pub fn new(identity: Identity, name: DestinationName) -> Self {
        let address_hash = create_address_hash(&identity, &name);
        Self {
            direction: PhantomData,
            kind: PhantomData,
            identity,
            desc: DestinationDesc { identity, name, address_hash },
            ratchets: RatchetRing::default(),
            default_app_data: None,
        }
    }

    /// Encrypts towards this destination, preferring the latest announced
    /// ratchet when one is supplied.
    pub fn encrypt<R: CryptoRngCore + Copy>(
        &self,
        plaintext: &[u8],
        ratchet: Option<[u8; RATCHET_LENGTH]>,
        rng: R,
    ) -> Result<Vec<u8>, RnsError> {
        match ratchet {
            Some(ratchet) => encrypt_for_key(
                &PublicKey::from(ratchet),
                self.identity.address_hash.as_slice(),
                plaintext,
                rng,
            ),
            None => self.identity.encrypt(plaintext, None, rng),
        }
    }
}

impl PlainInputDestination {
    pub fn new(name: DestinationName) -> Self {
        let identity = EmptyIdentity;
        let address_hash = create_address_hash(&identity, &name);
        Self {
            direction: PhantomData,
            kind: PhantomData,
            identity,
            desc: DestinationDesc { identity: dummy_identity(), name, address_hash },
            ratchets: RatchetRing::default(),
            default_app_data: None,
        }
    }
}

impl PlainOutputDestination {
    pub fn new(name: DestinationName) -> Self {
        let identity = EmptyIdentity;
        let address_hash = create_address_hash(&identity, &name);
        Self {
            direction: PhantomData,
            kind: PhantomData,
            identity,
            desc: DestinationDesc { identity: dummy_identity(), name, address_hash },
            ratchets: RatchetRing::default(),
            default_app_data: None,
        }
    }
}

fn dummy_identity() -> Identity {
    Identity::new(PublicKey::from([0u8; PUBLIC_KEY_LENGTH]), Default::default())
}

pub fn single_in(
    identity: PrivateIdentity,
    app_name: &str,
    aspects: &[&str],
) -> Result<SingleInputDestination, RnsError> {
    Ok(SingleInputDestination::new(identity, DestinationName::new(app_name, aspects)?))
}

pub fn single_out(
    identity: Identity,
    app_name: &str,
    aspects: &[&str],
) -> Result<SingleOutputDestination, RnsError> {
    Ok(SingleOutputDestination::new(identity, DestinationName::new(app_name, aspects)?))
}

/// A validated announce: the remote destination it advertises, its app
/// data and the announced ratchet, if any.
pub struct AnnounceInfo<'a> {
    pub destination: SingleOutputDestination,
    pub app_data: &'a [u8],
    pub ratchet: Option<[u8; RATCHET_LENGTH]>,
    pub timestamp: u64,
}

impl<'a> AnnounceInfo<'a> {
    pub fn ratchet_id(&self) -> Option<NameHash> {
        self.ratchet.as_ref().map(ratchet_id)
    }
}

/// Validates an announce packet: re-derives the destination hash from the
/// advertised keys and name hash, reconstructs the signed region and
/// checks the Ed25519 signature. Any mismatch rejects the announce.
pub fn validate_announce(packet: &Packet) -> Result<AnnounceInfo<'_>, RnsError> {
    if packet.header.packet_type != PacketType::Announce {
        return Err(RnsError::InvalidPacket);
    }

    let announce_data = packet.data.as_slice();
    let has_ratchet = packet.header.context_flag == ContextFlag::Set;

    let min_len = if has_ratchet {
        MIN_ANNOUNCE_DATA_SIZE + RATCHET_LENGTH
    } else {
        MIN_ANNOUNCE_DATA_SIZE
    };
    if announce_data.len() < min_len {
        return Err(RnsError::InvalidPacket);
    }

    let identity = Identity::from_public_bytes(&announce_data[..PUBLIC_KEY_LENGTH * 2])?;
    let mut offset = PUBLIC_KEY_LENGTH * 2;

    let name_hash = &announce_data[offset..offset + NAME_HASH_SIZE];
    offset += NAME_HASH_SIZE;
    let rand_hash = &announce_data[offset..offset + RAND_HASH_SIZE];
    offset += RAND_HASH_SIZE;

    let name = DestinationName::new_from_hash_slice(name_hash);
    let expected_hash = create_address_hash(&identity, &name);
    if expected_hash != packet.destination {
        return Err(RnsError::IncorrectHash);
    }

    let ratchet = if has_ratchet {
        let mut bytes = [0u8; RATCHET_LENGTH];
        bytes.copy_from_slice(&announce_data[offset..offset + RATCHET_LENGTH]);
        offset += RATCHET_LENGTH;
        Some(bytes)
    } else {
        None
    };

    let signature = Signature::from_slice(&announce_data[offset..offset + SIGNATURE_LENGTH])
        .map_err(|_| RnsError::CryptoError)?;
    offset += SIGNATURE_LENGTH;
    let app_data = &announce_data[offset..];

    let mut signed_data = PacketDataBuffer::new();
    signed_data
        .chain_write(packet.destination.as_slice())?
        .chain_write(&announce_data[..PUBLIC_KEY_LENGTH * 2])?
        .chain_write(name_hash)?
        .chain_write(rand_hash)?;
    if let Some(ratchet) = ratchet {
        signed_data.write(&ratchet)?;
    }
    if !app_data.is_empty() {
        signed_data.write(app_data)?;
    }

    identity.verify(signed_data.as_slice(), &signature)?;

    let timestamp = announce_timestamp(rand_hash);

    Ok(AnnounceInfo {
        destination: SingleOutputDestination::new(identity, name),
        app_data,
        ratchet,
        timestamp,
    })
}

/// Parses the trailing 5-byte big-endian emission time out of an announce
/// random hash.
pub fn announce_timestamp(rand_hash: &[u8]) -> u64 {
    if rand_hash.len() < RAND_HASH_SIZE {
        return 0;
    }
    let mut be_bytes = [0u8; 8];
    be_bytes[3..].copy_from_slice(&rand_hash[RAND_HASH_SIZE / 2..RAND_HASH_SIZE]);
    u64::from_be_bytes(be_bytes)
}
