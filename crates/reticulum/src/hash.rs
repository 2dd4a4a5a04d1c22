use core::cmp;
use core::fmt;
use std::fmt::Write;

use crypto_common::typenum::Unsigned;
use crypto_common::OutputSizeUser;
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256};

use crate::error::RnsError;

pub const HASH_SIZE: usize = <<Sha256 as OutputSizeUser>::OutputSize as Unsigned>::USIZE;
pub const ADDRESS_HASH_SIZE: usize = 16;
pub const NAME_HASH_SIZE: usize = 10;

pub fn create_hash(data: &[u8], out: &mut [u8]) {
    out.copy_from_slice(
        &Sha256::new().chain_update(data).finalize().as_slice()[..cmp::min(out.len(), HASH_SIZE)],
    );
}

/// Full SHA-256 digest.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Hash([u8; HASH_SIZE]);

/// Truncated 16-byte digest used for identities, destinations, links and
/// interfaces.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct AddressHash([u8; ADDRESS_HASH_SIZE]);

/// Truncated 10-byte digest over a full destination name.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct NameHash([u8; NAME_HASH_SIZE]);

impl Hash {
    pub fn generator() -> Sha256 {
        Sha256::new()
    }

    pub const fn new(hash: [u8; HASH_SIZE]) -> Self {
        Self(hash)
    }

    pub const fn new_empty() -> Self {
        Self([0u8; HASH_SIZE])
    }

    pub fn new_from_slice(data: &[u8]) -> Self {
        let mut hash = [0u8; HASH_SIZE];
        create_hash(data, &mut hash);
        Self(hash)
    }

    pub fn new_from_rand<R: CryptoRngCore>(mut rng: R) -> Self {
        let mut data = [0u8; HASH_SIZE];
        rng.fill_bytes(&mut data[..]);
        Self::new_from_slice(&data)
    }

    pub fn try_from_slice(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() < HASH_SIZE {
            return Err(RnsError::IncorrectHash);
        }
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&data[..HASH_SIZE]);
        Ok(Self(hash))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; HASH_SIZE] {
        self.0
    }
}

impl AddressHash {
    pub const fn new(hash: [u8; ADDRESS_HASH_SIZE]) -> Self {
        Self(hash)
    }

    pub fn new_from_slice(data: &[u8]) -> Self {
        let mut hash = [0u8; ADDRESS_HASH_SIZE];
        create_hash(data, &mut hash);
        Self(hash)
    }

    pub fn new_from_hash(hash: &Hash) -> Self {
        let mut address_hash = [0u8; ADDRESS_HASH_SIZE];
        address_hash.copy_from_slice(&hash.0[..ADDRESS_HASH_SIZE]);
        Self(address_hash)
    }

    pub fn new_from_rand<R: CryptoRngCore>(rng: R) -> Self {
        Self::new_from_hash(&Hash::new_from_rand(rng))
    }

    pub const fn new_empty() -> Self {
        Self([0u8; ADDRESS_HASH_SIZE])
    }

    pub fn try_from_slice(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() < ADDRESS_HASH_SIZE {
            return Err(RnsError::IncorrectHash);
        }
        let mut hash = [0u8; ADDRESS_HASH_SIZE];
        hash.copy_from_slice(&data[..ADDRESS_HASH_SIZE]);
        Ok(Self(hash))
    }

    pub fn new_from_hex_string(hex_string: &str) -> Result<Self, RnsError> {
        let decoded = hex::decode(hex_string).map_err(|_| RnsError::IncorrectHash)?;
        Self::try_from_slice(&decoded)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    pub const fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }

    pub fn to_hex_string(&self) -> String {
        let mut hex_string = String::with_capacity(ADDRESS_HASH_SIZE * 2);
        for byte in self.0 {
            let _ = write!(&mut hex_string, "{:02x}", byte);
        }
        hex_string
    }
}

impl NameHash {
    pub const fn new(hash: [u8; NAME_HASH_SIZE]) -> Self {
        Self(hash)
    }

    pub fn new_from_hash(hash: &Hash) -> Self {
        let mut name_hash = [0u8; NAME_HASH_SIZE];
        name_hash.copy_from_slice(&hash.0[..NAME_HASH_SIZE]);
        Self(name_hash)
    }

    pub fn try_from_slice(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() < NAME_HASH_SIZE {
            return Err(RnsError::IncorrectHash);
        }
        let mut hash = [0u8; NAME_HASH_SIZE];
        hash.copy_from_slice(&data[..NAME_HASH_SIZE]);
        Ok(Self(hash))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }
}

impl From<Hash> for AddressHash {
    fn from(hash: Hash) -> Self {
        Self::new_from_hash(&hash)
    }
}

impl Default for AddressHash {
    fn default() -> Self {
        Self::new_empty()
    }
}

impl fmt::Display for AddressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<")?;
        for data in self.0.iter() {
            write!(f, "{:02x}", data)?;
        }
        write!(f, ">")?;
        Ok(())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for data in self.0.iter() {
            write!(f, "{:02x}", data)?;
        }
        Ok(())
    }
}

impl fmt::Display for NameHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for data in self.0.iter() {
            write!(f, "{:02x}", data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{AddressHash, Hash, NameHash, ADDRESS_HASH_SIZE, NAME_HASH_SIZE};

    #[test]
    fn address_hash_hex_roundtrip() {
        let original = AddressHash::new_from_rand(OsRng);
        let restored = AddressHash::new_from_hex_string(&original.to_hex_string()).expect("hash");
        assert_eq!(restored, original);
    }

    #[test]
    fn truncations_take_leading_bytes() {
        let hash = Hash::new_from_slice(b"truncation");
        let address = AddressHash::new_from_hash(&hash);
        let name = NameHash::new_from_hash(&hash);
        assert_eq!(address.as_slice(), &hash.as_slice()[..ADDRESS_HASH_SIZE]);
        assert_eq!(name.as_slice(), &hash.as_slice()[..NAME_HASH_SIZE]);
    }

    #[test]
    fn short_slices_are_rejected() {
        assert!(AddressHash::try_from_slice(&[0u8; 4]).is_err());
        assert!(NameHash::try_from_slice(&[0u8; NAME_HASH_SIZE - 1]).is_err());
    }
}
