use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use ed25519_dalek::{ed25519::signature::Signer, Signature, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};

use crate::crypt::token::{PlainText, TokenCipher, TOKEN_MAX_PADDING_SIZE, TOKEN_OVERHEAD_SIZE};
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash};

pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const PRIVATE_KEY_LENGTH: usize = PUBLIC_KEY_LENGTH * 2;
pub const SIGNATURE_LENGTH: usize = ed25519_dalek::SIGNATURE_LENGTH;
pub const DERIVED_KEY_LENGTH: usize = 64;

/// Public half of an identity: X25519 encryption key, Ed25519 verification
/// key and the 16-byte truncated hash over both. Cannot sign or decrypt;
/// those capabilities live on [`PrivateIdentity`].
#[derive(Debug, Copy, Clone)]
pub struct Identity {
    pub public_key: PublicKey,
    pub verifying_key: VerifyingKey,
    pub address_hash: AddressHash,
}

impl Identity {
    pub fn new(public_key: PublicKey, verifying_key: VerifyingKey) -> Self {
        let hash = Hash::new(
            Hash::generator()
                .chain_update(public_key.as_bytes())
                .chain_update(verifying_key.as_bytes())
                .finalize()
                .into(),
        );

        Self { public_key, verifying_key, address_hash: AddressHash::new_from_hash(&hash) }
    }

    /// Reconstructs an identity from `pub_enc(32) || pub_sig(32)` key
    /// material, rejecting invalid Ed25519 points.
    pub fn from_public_bytes(bytes: &[u8]) -> Result<Self, RnsError> {
        if bytes.len() < PRIVATE_KEY_LENGTH {
            return Err(RnsError::InvalidArgument);
        }

        let mut key_data = [0u8; PUBLIC_KEY_LENGTH];
        key_data.copy_from_slice(&bytes[..PUBLIC_KEY_LENGTH]);
        let public_key = PublicKey::from(key_data);

        key_data.copy_from_slice(&bytes[PUBLIC_KEY_LENGTH..PRIVATE_KEY_LENGTH]);
        let verifying_key =
            VerifyingKey::from_bytes(&key_data).map_err(|_| RnsError::CryptoError)?;

        Ok(Self::new(public_key, verifying_key))
    }

    pub fn to_public_bytes(&self) -> [u8; PRIVATE_KEY_LENGTH] {
        let mut bytes = [0u8; PRIVATE_KEY_LENGTH];
        bytes[..PUBLIC_KEY_LENGTH].copy_from_slice(self.public_key.as_bytes());
        bytes[PUBLIC_KEY_LENGTH..].copy_from_slice(self.verifying_key.as_bytes());
        bytes
    }

    pub fn public_key_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.public_key.as_bytes()
    }

    pub fn verifying_key_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.as_bytes()
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), RnsError> {
        self.verifying_key
            .verify_strict(data, signature)
            .map_err(|_| RnsError::IncorrectSignature)
    }

    /// Encrypts `plaintext` for this identity. When `ratchet_key` is given
    /// the ephemeral exchange runs against the ratchet instead of the static
    /// encryption key, providing forward secrecy. The HKDF salt is always
    /// the recipient's identity hash.
    pub fn encrypt<R: CryptoRngCore + Copy>(
        &self,
        plaintext: &[u8],
        ratchet_key: Option<&PublicKey>,
        rng: R,
    ) -> Result<Vec<u8>, RnsError> {
        let target = ratchet_key.unwrap_or(&self.public_key);
        encrypt_for_key(target, self.address_hash.as_slice(), plaintext, rng)
    }
}

/// Encrypts to a bare X25519 public key: `e_pub(32) || Token(plaintext)`
/// with keys derived via `HKDF(ikm = ECDH(e, key), salt)`.
pub fn encrypt_for_key<R: CryptoRngCore + Copy>(
    public_key: &PublicKey,
    salt: &[u8],
    plaintext: &[u8],
    rng: R,
) -> Result<Vec<u8>, RnsError> {
    let secret = EphemeralSecret::random_from_rng(rng);
    let ephemeral_public = PublicKey::from(&secret);
    let shared = secret.diffie_hellman(public_key);
    let derived = DerivedKey::new(&shared, Some(salt));
    let key_bytes = derived.as_bytes();
    let split = key_bytes.len() / 2;

    let cipher = TokenCipher::new_from_slices(&key_bytes[..split], &key_bytes[split..], rng);
    let mut out = vec![
        0u8;
        PUBLIC_KEY_LENGTH + plaintext.len() + TOKEN_OVERHEAD_SIZE + TOKEN_MAX_PADDING_SIZE
    ];
    out[..PUBLIC_KEY_LENGTH].copy_from_slice(ephemeral_public.as_bytes());
    let token = cipher
        .encrypt(PlainText::from(plaintext), &mut out[PUBLIC_KEY_LENGTH..])
        .map_err(|_| RnsError::CryptoError)?;
    let total = PUBLIC_KEY_LENGTH + token.len();
    out.truncate(total);
    Ok(out)
}

/// Opens `e_pub(32) || Token(..)` with a bare X25519 secret.
pub fn decrypt_with_key(
    private_key: &StaticSecret,
    salt: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, RnsError> {
    if ciphertext.len() <= PUBLIC_KEY_LENGTH {
        return Err(RnsError::DecryptionFailed);
    }

    let mut pub_bytes = [0u8; PUBLIC_KEY_LENGTH];
    pub_bytes.copy_from_slice(&ciphertext[..PUBLIC_KEY_LENGTH]);
    let ephemeral_public = PublicKey::from(pub_bytes);
    let shared = private_key.diffie_hellman(&ephemeral_public);
    let derived = DerivedKey::new(&shared, Some(salt));
    let key_bytes = derived.as_bytes();
    let split = key_bytes.len() / 2;

    let cipher =
        TokenCipher::new_from_slices(&key_bytes[..split], &key_bytes[split..], rand_core::OsRng);
    cipher.open(&ciphertext[PUBLIC_KEY_LENGTH..])
}

#[derive(Clone)]
pub struct PrivateIdentity {
    identity: Identity,
    private_key: StaticSecret,
    sign_key: SigningKey,
}

impl PrivateIdentity {
    pub fn new(private_key: StaticSecret, sign_key: SigningKey) -> Self {
        Self {
            identity: Identity::new((&private_key).into(), sign_key.verifying_key()),
            private_key,
            sign_key,
        }
    }

    pub fn new_from_rand<R: CryptoRngCore>(mut rng: R) -> Self {
        let sign_key = SigningKey::generate(&mut rng);
        let private_key = StaticSecret::random_from_rng(rng);
        Self::new(private_key, sign_key)
    }

    pub fn from_private_key_bytes(bytes: &[u8]) -> Result<Self, RnsError> {
        if bytes.len() != PRIVATE_KEY_LENGTH {
            return Err(RnsError::InvalidArgument);
        }

        let mut private_key_bytes = [0u8; PUBLIC_KEY_LENGTH];
        let mut sign_key_bytes = [0u8; PUBLIC_KEY_LENGTH];
        private_key_bytes.copy_from_slice(&bytes[..PUBLIC_KEY_LENGTH]);
        sign_key_bytes.copy_from_slice(&bytes[PUBLIC_KEY_LENGTH..]);

        Ok(Self::new(StaticSecret::from(private_key_bytes), SigningKey::from_bytes(&sign_key_bytes)))
    }

    pub fn to_private_key_bytes(&self) -> [u8; PRIVATE_KEY_LENGTH] {
        let mut bytes = [0u8; PRIVATE_KEY_LENGTH];
        bytes[..PUBLIC_KEY_LENGTH].copy_from_slice(self.private_key.as_bytes());
        bytes[PUBLIC_KEY_LENGTH..].copy_from_slice(self.sign_key.as_bytes());
        bytes
    }

    /// Loads `priv_enc(32) || priv_sig(32)` from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RnsError> {
        let bytes = std::fs::read(path).map_err(|_| RnsError::StorageError)?;
        Self::from_private_key_bytes(&bytes)
    }

    /// Persists the raw key material via temp-file-then-rename.
    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<(), RnsError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|_| RnsError::StorageError)?;
        }
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, self.to_private_key_bytes())
            .map_err(|_| RnsError::StorageError)?;
        std::fs::rename(&tmp_path, path).map_err(|_| RnsError::StorageError)?;
        Ok(())
    }

    pub fn as_identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address_hash(&self) -> &AddressHash {
        &self.identity.address_hash
    }

    pub fn sign_key(&self) -> &SigningKey {
        &self.sign_key
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.sign_key.sign(data)
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), RnsError> {
        self.identity.verify(data, signature)
    }

    pub fn exchange(&self, public_key: &PublicKey) -> SharedSecret {
        self.private_key.diffie_hellman(public_key)
    }

    pub fn derive_key(&self, public_key: &PublicKey, salt: Option<&[u8]>) -> DerivedKey {
        DerivedKey::new(&self.private_key.diffie_hellman(public_key), salt)
    }

    /// Opens a ciphertext addressed to this identity's static key. Ratchet
    /// rings are tried first by the owning destination; this is the base-key
    /// fallback.
    pub fn decrypt(&self, salt: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, RnsError> {
        decrypt_with_key(&self.private_key, salt, ciphertext)
    }
}

/// HKDF-SHA256 expansion of an ECDH shared secret into a 32-byte signing
/// key and a 32-byte encryption key.
pub struct DerivedKey {
    key: [u8; DERIVED_KEY_LENGTH],
}

impl DerivedKey {
    pub fn new(shared_key: &SharedSecret, salt: Option<&[u8]>) -> Self {
        let mut key = [0u8; DERIVED_KEY_LENGTH];
        let _ = Hkdf::<Sha256>::new(salt, shared_key.as_bytes()).expand(&[], &mut key[..]);
        Self { key }
    }

    pub fn new_empty() -> Self {
        Self { key: [0u8; DERIVED_KEY_LENGTH] }
    }

    pub fn as_bytes(&self) -> &[u8; DERIVED_KEY_LENGTH] {
        &self.key
    }

    pub fn sign_half(&self) -> &[u8] {
        &self.key[..DERIVED_KEY_LENGTH / 2]
    }

    pub fn encrypt_half(&self) -> &[u8] {
        &self.key[DERIVED_KEY_LENGTH / 2..]
    }
}

/// Process-wide table of identities learned from validated announces,
/// shared by reference between the dispatcher and application code.
#[derive(Default)]
pub struct IdentityStore {
    known: RwLock<HashMap<AddressHash, Identity>>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, identity: Identity) {
        if let Ok(mut known) = self.known.write() {
            known.insert(identity.address_hash, identity);
        }
    }

    /// Also indexes an identity under a destination hash, so proofs and
    /// messages referencing the destination can be validated.
    pub fn remember_for(&self, hash: AddressHash, identity: Identity) {
        if let Ok(mut known) = self.known.write() {
            known.insert(hash, identity);
        }
    }

    pub fn recall(&self, hash: &AddressHash) -> Option<Identity> {
        self.known.read().ok().and_then(|known| known.get(hash).copied())
    }

    pub fn len(&self) -> usize {
        self.known.read().map(|known| known.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{Identity, IdentityStore, PrivateIdentity, PRIVATE_KEY_LENGTH};
    use crate::crypt::token::{TOKEN_MAX_PADDING_SIZE, TOKEN_OVERHEAD_SIZE};
    use crate::identity::PUBLIC_KEY_LENGTH;

    #[test]
    fn private_key_bytes_roundtrip() {
        let original = PrivateIdentity::new_from_rand(OsRng);
        let restored =
            PrivateIdentity::from_private_key_bytes(&original.to_private_key_bytes())
                .expect("valid identity");

        assert_eq!(restored.address_hash(), original.address_hash());
    }

    #[test]
    fn identity_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("identity");
        let original = PrivateIdentity::new_from_rand(OsRng);
        original.store(&path).expect("store");

        let restored = PrivateIdentity::load(&path).expect("load");
        assert_eq!(restored.address_hash(), original.address_hash());
        assert_eq!(
            std::fs::read(&path).expect("raw bytes").len(),
            PRIVATE_KEY_LENGTH,
        );
    }

    #[test]
    fn encrypt_to_identity_then_decrypt() {
        let receiver = PrivateIdentity::new_from_rand(OsRng);
        let plaintext = b"the quick brown fox";

        let ciphertext = receiver
            .as_identity()
            .encrypt(plaintext, None, OsRng)
            .expect("ciphertext");
        let recovered = receiver
            .decrypt(receiver.address_hash().as_slice(), &ciphertext)
            .expect("plaintext");

        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn ciphertext_length_matches_model() {
        // len = 32 (ephemeral pub) + 16 (IV) + padded ct + 32 (HMAC)
        let receiver = PrivateIdentity::new_from_rand(OsRng);
        for len in [0usize, 1, 15, 16, 319] {
            let plaintext = vec![7u8; len];
            let ciphertext = receiver
                .as_identity()
                .encrypt(&plaintext, None, OsRng)
                .expect("ciphertext");
            let padded = ((len / 16) + 1) * 16;
            assert_eq!(
                ciphertext.len(),
                PUBLIC_KEY_LENGTH + TOKEN_OVERHEAD_SIZE + padded,
            );
            assert!(ciphertext.len() <= PUBLIC_KEY_LENGTH
                + TOKEN_OVERHEAD_SIZE
                + len
                + TOKEN_MAX_PADDING_SIZE);
        }
    }

    #[test]
    fn public_identity_rejects_invalid_sign_key() {
        // An all-ones X25519 key is fine, but random non-canonical Ed25519
        // material must be rejected instead of silently downgraded.
        let mut bytes = [0xFFu8; PRIVATE_KEY_LENGTH];
        bytes[PUBLIC_KEY_LENGTH..].copy_from_slice(&[0xFFu8; PUBLIC_KEY_LENGTH]);
        assert!(Identity::from_public_bytes(&bytes).is_err());
    }

    #[test]
    fn identity_store_recall() {
        let store = IdentityStore::new();
        let identity = *PrivateIdentity::new_from_rand(OsRng).as_identity();

        assert!(store.recall(&identity.address_hash).is_none());
        store.remember(identity);
        let recalled = store.recall(&identity.address_hash).expect("recalled");
        assert_eq!(recalled.address_hash, identity.address_hash);
    }
}
