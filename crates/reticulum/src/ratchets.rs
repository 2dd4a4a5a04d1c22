use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::Signature;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::RnsError;
use crate::hash::{AddressHash, Hash, NameHash};
use crate::identity::{decrypt_with_key, PrivateIdentity, SIGNATURE_LENGTH};

pub const RATCHET_LENGTH: usize = 32;
pub const RATCHET_ID_LENGTH: usize = 10;

pub const DEFAULT_RATCHET_INTERVAL_SECS: u64 = 30 * 60;
pub const DEFAULT_RETAINED_RATCHETS: usize = 512;

const REMOTE_RATCHET_EXPIRY_SECS: f64 = 30.0 * 24.0 * 60.0 * 60.0;

/// Truncated hash identifying one ratchet key. Log lines reference these
/// ids, never the key material.
pub fn ratchet_id(ratchet_pub: &[u8; RATCHET_LENGTH]) -> NameHash {
    NameHash::new_from_hash(&Hash::new_from_slice(ratchet_pub))
}

pub(crate) fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Ordered ring of X25519 ratchet secrets owned by one SINGLE/IN
/// destination, newest first.
#[derive(Clone)]
pub struct RatchetRing {
    pub(crate) enabled: bool,
    pub(crate) ratchets: Vec<[u8; RATCHET_LENGTH]>,
    pub(crate) ratchets_path: Option<PathBuf>,
    pub(crate) interval_secs: u64,
    pub(crate) retained: usize,
    pub(crate) latest_rotation: Option<f64>,
    pub(crate) enforce: bool,
}

impl Default for RatchetRing {
    fn default() -> Self {
        Self {
            enabled: false,
            ratchets: Vec::new(),
            ratchets_path: None,
            interval_secs: DEFAULT_RATCHET_INTERVAL_SECS,
            retained: DEFAULT_RETAINED_RATCHETS,
            latest_rotation: None,
            enforce: false,
        }
    }
}

impl RatchetRing {
    pub fn enable(&mut self, identity: &PrivateIdentity, path: PathBuf) -> Result<(), RnsError> {
        self.latest_rotation = Some(0.0);
        self.reload(identity, &path)?;
        self.enabled = true;
        self.ratchets_path = Some(path);
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_retained(&mut self, retained: usize) -> Result<(), RnsError> {
        if retained == 0 {
            return Err(RnsError::InvalidArgument);
        }
        self.retained = retained;
        if self.ratchets.len() > retained {
            self.ratchets.truncate(retained);
        }
        Ok(())
    }

    pub fn set_interval_secs(&mut self, secs: u64) {
        self.interval_secs = secs;
    }

    pub fn set_enforce(&mut self, enforce: bool) {
        self.enforce = enforce;
    }

    pub fn enforced(&self) -> bool {
        self.enforce
    }

    pub fn len(&self) -> usize {
        self.ratchets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ratchets.is_empty()
    }

    /// Loads and signature-checks the persisted ring, or seeds an empty
    /// file when none exists yet.
    pub fn reload(&mut self, identity: &PrivateIdentity, path: &Path) -> Result<(), RnsError> {
        if path.exists() {
            let data = fs::read(path).map_err(|_| RnsError::RatchetFileCorrupt)?;
            if data.len() < SIGNATURE_LENGTH {
                return Err(RnsError::RatchetFileCorrupt);
            }

            let signature = Signature::from_slice(&data[..SIGNATURE_LENGTH])
                .map_err(|_| RnsError::RatchetFileCorrupt)?;
            let packed = &data[SIGNATURE_LENGTH..];

            let mut signed_data =
                Vec::with_capacity(identity.address_hash().len() + packed.len());
            signed_data.extend_from_slice(identity.address_hash().as_slice());
            signed_data.extend_from_slice(packed);
            identity
                .verify(&signed_data, &signature)
                .map_err(|_| RnsError::RatchetFileCorrupt)?;

            let decoded: Vec<ByteBuf> =
                rmp_serde::from_slice(packed).map_err(|_| RnsError::RatchetFileCorrupt)?;
            let mut ratchets = Vec::with_capacity(decoded.len());
            for ratchet in decoded {
                if ratchet.len() != RATCHET_LENGTH {
                    return Err(RnsError::RatchetFileCorrupt);
                }
                let mut bytes = [0u8; RATCHET_LENGTH];
                bytes.copy_from_slice(ratchet.as_ref());
                ratchets.push(bytes);
            }
            self.ratchets = ratchets;
            return Ok(());
        }

        self.ratchets = Vec::new();
        self.persist(identity, path)
    }

    /// Writes `sign(identity_hash || packed) || packed` through a temporary
    /// file so readers never observe a partial ring.
    fn persist(&self, identity: &PrivateIdentity, path: &Path) -> Result<(), RnsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| RnsError::StorageError)?;
        }

        let packed = pack_ratchets(&self.ratchets)?;
        let mut signed_data = Vec::with_capacity(identity.address_hash().len() + packed.len());
        signed_data.extend_from_slice(identity.address_hash().as_slice());
        signed_data.extend_from_slice(&packed);
        let signature = identity.sign(&signed_data).to_bytes();

        let mut encoded = Vec::with_capacity(SIGNATURE_LENGTH + packed.len());
        encoded.extend_from_slice(&signature);
        encoded.extend_from_slice(&packed);

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, encoded).map_err(|_| RnsError::StorageError)?;
        fs::rename(&tmp_path, path).map_err(|_| RnsError::StorageError)?;
        Ok(())
    }

    /// Prepends a fresh secret when the rotation interval has elapsed,
    /// trims to the retention count and persists.
    pub fn rotate_if_needed(
        &mut self,
        identity: &PrivateIdentity,
        now: f64,
    ) -> Result<bool, RnsError> {
        if !self.enabled {
            return Ok(false);
        }

        let last = self.latest_rotation.unwrap_or(0.0);
        if !self.ratchets.is_empty() && now <= last + self.interval_secs as f64 {
            return Ok(false);
        }

        self.rotate(identity, now)?;
        Ok(true)
    }

    pub fn rotate(&mut self, identity: &PrivateIdentity, now: f64) -> Result<(), RnsError> {
        let secret = StaticSecret::random_from_rng(OsRng);
        self.ratchets.insert(0, secret.to_bytes());
        self.latest_rotation = Some(now);
        if self.ratchets.len() > self.retained {
            self.ratchets.truncate(self.retained);
        }
        if let Some(path) = self.ratchets_path.clone() {
            self.persist(identity, &path)?;
        }

        if let Some(current) = self.current_public() {
            log::debug!("ratchets: rotated, current id {}", ratchet_id(&current));
        }

        Ok(())
    }

    pub fn current_public(&self) -> Option<[u8; RATCHET_LENGTH]> {
        let ratchet = self.ratchets.first()?;
        let secret = StaticSecret::from(*ratchet);
        Some(*PublicKey::from(&secret).as_bytes())
    }

    /// Attempts decryption against every ratchet, newest first. Returns the
    /// plaintext and the index of the ratchet that opened it.
    pub fn try_decrypt(&self, salt: &[u8], ciphertext: &[u8]) -> Option<(Vec<u8>, usize)> {
        for (index, ratchet) in self.ratchets.iter().enumerate() {
            let secret = StaticSecret::from(*ratchet);
            if let Ok(plaintext) = decrypt_with_key(&secret, salt, ciphertext) {
                return Some((plaintext, index));
            }
        }
        None
    }
}

fn pack_ratchets(ratchets: &[[u8; RATCHET_LENGTH]]) -> Result<Vec<u8>, RnsError> {
    let list: Vec<ByteBuf> = ratchets.iter().map(|bytes| ByteBuf::from(bytes.to_vec())).collect();
    rmp_serde::to_vec(&list).map_err(|_| RnsError::StorageError)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoteRatchetRecord {
    ratchet: ByteBuf,
    received: f64,
}

/// Latest announced ratchet public key per remote destination, cached in
/// memory and mirrored to one file per destination.
#[derive(Debug)]
pub struct RatchetStore {
    ratchet_dir: PathBuf,
    cache: HashMap<AddressHash, RemoteRatchetRecord>,
}

impl RatchetStore {
    pub fn new(path: PathBuf) -> Self {
        Self { ratchet_dir: path, cache: HashMap::new() }
    }

    pub fn remember(
        &mut self,
        destination: &AddressHash,
        ratchet: [u8; RATCHET_LENGTH],
    ) -> Result<(), RnsError> {
        if let Some(existing) = self.cache.get(destination) {
            if existing.ratchet.as_ref() == ratchet.as_slice() {
                return Ok(());
            }
        }

        let record =
            RemoteRatchetRecord { ratchet: ByteBuf::from(ratchet.to_vec()), received: now_secs() };
        self.cache.insert(*destination, record.clone());
        self.persist_record(destination, &record)
    }

    pub fn get(&mut self, destination: &AddressHash) -> Option<[u8; RATCHET_LENGTH]> {
        let now = now_secs();
        if let Some(record) = self.cache.get(destination) {
            if now <= record.received + REMOTE_RATCHET_EXPIRY_SECS {
                return record.ratchet.as_ref().try_into().ok();
            }
            self.cache.remove(destination);
            self.remove_record(destination);
        }

        let record = self.load_record(destination)?;
        if now > record.received + REMOTE_RATCHET_EXPIRY_SECS {
            self.remove_record(destination);
            return None;
        }
        let ratchet = record.ratchet.as_ref().try_into().ok();
        self.cache.insert(*destination, record);
        ratchet
    }

    pub fn clean_expired(&mut self, now: f64) {
        self.cache.retain(|_, record| now <= record.received + REMOTE_RATCHET_EXPIRY_SECS);
        if let Ok(entries) = fs::read_dir(&self.ratchet_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if let Ok(data) = fs::read(&path) {
                    if let Ok(record) = rmp_serde::from_slice::<RemoteRatchetRecord>(&data) {
                        if now > record.received + REMOTE_RATCHET_EXPIRY_SECS {
                            let _ = fs::remove_file(path);
                        }
                    }
                }
            }
        }
    }

    fn persist_record(
        &self,
        destination: &AddressHash,
        record: &RemoteRatchetRecord,
    ) -> Result<(), RnsError> {
        fs::create_dir_all(&self.ratchet_dir).map_err(|_| RnsError::StorageError)?;
        let encoded = rmp_serde::to_vec_named(record).map_err(|_| RnsError::StorageError)?;
        let path = self.path_for(destination);
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, encoded).map_err(|_| RnsError::StorageError)?;
        fs::rename(&tmp_path, &path).map_err(|_| RnsError::StorageError)?;
        Ok(())
    }

    fn load_record(&self, destination: &AddressHash) -> Option<RemoteRatchetRecord> {
        let data = fs::read(self.path_for(destination)).ok()?;
        rmp_serde::from_slice::<RemoteRatchetRecord>(&data).ok()
    }

    fn remove_record(&self, destination: &AddressHash) {
        let _ = fs::remove_file(self.path_for(destination));
    }

    fn path_for(&self, destination: &AddressHash) -> PathBuf {
        self.ratchet_dir.join(destination.to_hex_string())
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;
    use x25519_dalek::PublicKey;

    use super::{RatchetRing, RatchetStore, RATCHET_LENGTH};
    use crate::identity::{encrypt_for_key, PrivateIdentity};

    #[test]
    fn ring_rotation_prepends_and_trims() {
        let dir = tempfile::tempdir().expect("tempdir");
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let mut ring = RatchetRing::default();
        ring.enable(&identity, dir.path().join("ratchets")).expect("enable");
        ring.set_retained(3).expect("retention");
        ring.set_interval_secs(0);

        let mut seen = Vec::new();
        for round in 0..5u64 {
            ring.rotate(&identity, round as f64 + 1.0).expect("rotate");
            seen.push(ring.current_public().expect("current"));
        }

        assert_eq!(ring.len(), 3);
        // Newest ratchet stays in front.
        assert_eq!(ring.current_public().expect("current"), *seen.last().expect("last"));
    }

    #[test]
    fn persisted_ring_survives_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ratchets");
        let identity = PrivateIdentity::new_from_rand(OsRng);

        let mut ring = RatchetRing::default();
        ring.enable(&identity, path.clone()).expect("enable");
        ring.rotate(&identity, 1.0).expect("rotate");
        let current = ring.current_public().expect("current");

        let mut restored = RatchetRing::default();
        restored.enable(&identity, path).expect("enable");
        assert_eq!(restored.current_public().expect("current"), current);
    }

    #[test]
    fn reload_rejects_foreign_signature() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ratchets");
        let identity = PrivateIdentity::new_from_rand(OsRng);

        let mut ring = RatchetRing::default();
        ring.enable(&identity, path.clone()).expect("enable");
        ring.rotate(&identity, 1.0).expect("rotate");

        let other = PrivateIdentity::new_from_rand(OsRng);
        let mut foreign = RatchetRing::default();
        assert!(foreign.enable(&other, path).is_err());
    }

    #[test]
    fn ring_decrypts_any_retained_ratchet() {
        let dir = tempfile::tempdir().expect("tempdir");
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let mut ring = RatchetRing::default();
        ring.enable(&identity, dir.path().join("ratchets")).expect("enable");

        let mut publics = Vec::new();
        for round in 0..4u64 {
            ring.rotate(&identity, round as f64 + 1.0).expect("rotate");
            publics.push(ring.current_public().expect("current"));
        }

        let salt = identity.address_hash().as_slice();
        for public in publics {
            let ciphertext =
                encrypt_for_key(&PublicKey::from(public), salt, b"ratchet round-trip", OsRng)
                    .expect("ciphertext");
            let (plaintext, _) = ring.try_decrypt(salt, &ciphertext).expect("plaintext");
            assert_eq!(plaintext, b"ratchet round-trip");
        }
    }

    #[test]
    fn remote_store_expires_old_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = RatchetStore::new(dir.path().to_path_buf());
        let dest = crate::hash::AddressHash::new_from_rand(OsRng);

        let record = super::RemoteRatchetRecord {
            ratchet: serde_bytes::ByteBuf::from(vec![2u8; RATCHET_LENGTH]),
            received: 0.0,
        };
        let encoded = rmp_serde::to_vec_named(&record).expect("encode");
        std::fs::write(dir.path().join(dest.to_hex_string()), encoded).expect("write");

        assert!(store.get(&dest).is_none());
    }
}
