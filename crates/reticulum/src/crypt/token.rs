use core::cmp;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::BlockDecryptMut;
use aes::cipher::BlockSizeUser;
use aes::cipher::Key;
use aes::cipher::Unsigned;
use cbc::cipher::BlockEncryptMut;
use cbc::cipher::KeyIvInit;
use crypto_common::{IvSizeUser, KeySizeUser, OutputSizeUser};
use hmac::{Hmac, Mac};
use rand_core::CryptoRngCore;
use sha2::Sha256;

use crate::error::RnsError;

type AesCbcEnc = cbc::Encryptor<aes::Aes256>;
type AesCbcDec = cbc::Decryptor<aes::Aes256>;
type AesKey = Key<aes::Aes256>;

type HmacSha256 = Hmac<Sha256>;

const HMAC_OUT_SIZE: usize = <<HmacSha256 as OutputSizeUser>::OutputSize as Unsigned>::USIZE;
const AES_KEY_SIZE: usize = <<aes::Aes256 as KeySizeUser>::KeySize as Unsigned>::USIZE;
const IV_SIZE: usize = <<AesCbcEnc as IvSizeUser>::IvSize as Unsigned>::USIZE;
pub const AES_BLOCK_SIZE: usize = <<aes::Aes256 as BlockSizeUser>::BlockSize as Unsigned>::USIZE;
pub const TOKEN_OVERHEAD_SIZE: usize = IV_SIZE + HMAC_OUT_SIZE;
pub const TOKEN_MAX_PADDING_SIZE: usize = AES_BLOCK_SIZE;

pub struct PlainText<'a>(&'a [u8]);
pub struct VerifiedToken<'a>(&'a [u8]);
pub struct Token<'a>(&'a [u8]);

// The authenticated symmetric envelope used throughout the stack:
//
//   token = IV(16) || AES-256-CBC(plaintext, PKCS#7) || HMAC-SHA256(IV || ct)
//
// This is the Fernet construction with the version and timestamp fields
// stripped: they carry no information the protocol needs and leak initiator
// metadata on the wire.
pub struct TokenCipher<R: CryptoRngCore> {
    rng: R,
    sign_key: [u8; AES_KEY_SIZE],
    enc_key: AesKey,
}

impl<'a> PlainText<'a> {
    pub fn as_slice(&self) -> &'a [u8] {
        self.0
    }
}

impl<'a> From<&'a str> for PlainText<'a> {
    fn from(item: &'a str) -> Self {
        Self(item.as_bytes())
    }
}

impl<'a> From<&'a [u8]> for PlainText<'a> {
    fn from(item: &'a [u8]) -> Self {
        Self(item)
    }
}

impl<'a> Token<'a> {
    pub fn as_slice(&self) -> &'a [u8] {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> From<&'a [u8]> for Token<'a> {
    fn from(item: &'a [u8]) -> Self {
        Self(item)
    }
}

impl<R: CryptoRngCore + Copy> TokenCipher<R> {
    pub fn new(sign_key: [u8; AES_KEY_SIZE], enc_key: AesKey, rng: R) -> Self {
        Self { rng, sign_key, enc_key }
    }

    pub fn new_from_slices(sign_key: &[u8], enc_key: &[u8], rng: R) -> Self {
        let mut sign_key_bytes = [0u8; AES_KEY_SIZE];
        let sign_len = cmp::min(AES_KEY_SIZE, sign_key.len());
        sign_key_bytes[..sign_len].copy_from_slice(&sign_key[..sign_len]);

        let mut enc_key_bytes = [0u8; AES_KEY_SIZE];
        let enc_len = cmp::min(AES_KEY_SIZE, enc_key.len());
        enc_key_bytes[..enc_len].copy_from_slice(&enc_key[..enc_len]);

        Self { rng, sign_key: sign_key_bytes, enc_key: enc_key_bytes.into() }
    }

    pub fn new_rand(mut rng: R) -> Self {
        let mut sign_key = [0u8; AES_KEY_SIZE];
        rng.fill_bytes(&mut sign_key);
        let enc_key = AesCbcEnc::generate_key(&mut rng);

        Self { rng, sign_key, enc_key }
    }

    pub fn encrypt<'a>(
        &self,
        text: PlainText,
        out_buf: &'a mut [u8],
    ) -> Result<Token<'a>, RnsError> {
        let block_count = text
            .0
            .len()
            .checked_div(AES_BLOCK_SIZE)
            .and_then(|blocks| blocks.checked_add(1))
            .ok_or(RnsError::InvalidArgument)?;
        let padded_len =
            block_count.checked_mul(AES_BLOCK_SIZE).ok_or(RnsError::InvalidArgument)?;
        let required_len =
            TOKEN_OVERHEAD_SIZE.checked_add(padded_len).ok_or(RnsError::InvalidArgument)?;

        if out_buf.len() < required_len {
            return Err(RnsError::OutOfMemory);
        }

        let mut out_len = 0;

        let iv = AesCbcEnc::generate_iv(self.rng);
        out_buf[..iv.len()].copy_from_slice(iv.as_slice());
        out_len += iv.len();

        let cipher_len = AesCbcEnc::new(&self.enc_key, &iv)
            .encrypt_padded_b2b_mut::<Pkcs7>(text.0, &mut out_buf[out_len..])
            .map_err(|_| RnsError::InvalidArgument)?
            .len();
        out_len += cipher_len;

        let mut hmac = <HmacSha256 as Mac>::new_from_slice(&self.sign_key)
            .map_err(|_| RnsError::InvalidArgument)?;
        hmac.update(&out_buf[..out_len]);
        let tag = hmac.finalize().into_bytes();

        out_buf[out_len..out_len + tag.len()].copy_from_slice(tag.as_slice());
        out_len += tag.len();

        Ok(Token(&out_buf[..out_len]))
    }

    /// Verifies the trailing HMAC. MUST precede decryption.
    pub fn verify<'a>(&self, token: Token<'a>) -> Result<VerifiedToken<'a>, RnsError> {
        let token_data = token.0;

        if token_data.len() <= TOKEN_OVERHEAD_SIZE {
            return Err(RnsError::DecryptionFailed);
        }

        let expected_tag = &token_data[token_data.len() - HMAC_OUT_SIZE..];

        let mut hmac = <HmacSha256 as Mac>::new_from_slice(&self.sign_key)
            .map_err(|_| RnsError::InvalidArgument)?;
        hmac.update(&token_data[..token_data.len() - HMAC_OUT_SIZE]);
        let actual_tag = hmac.finalize().into_bytes();

        // Constant-time comparison over the full tag length.
        let valid = expected_tag
            .iter()
            .zip(actual_tag.as_slice())
            .map(|(x, y)| x.cmp(y))
            .find(|&ord| ord != cmp::Ordering::Equal)
            .unwrap_or(actual_tag.len().cmp(&expected_tag.len()))
            == cmp::Ordering::Equal;

        if valid {
            Ok(VerifiedToken(token_data))
        } else {
            Err(RnsError::DecryptionFailed)
        }
    }

    pub fn decrypt<'a, 'b>(
        &self,
        token: VerifiedToken<'a>,
        out_buf: &'b mut [u8],
    ) -> Result<PlainText<'b>, RnsError> {
        let token_data = token.0;

        if token_data.len() <= TOKEN_OVERHEAD_SIZE {
            return Err(RnsError::DecryptionFailed);
        }

        let tag_start = token_data.len() - HMAC_OUT_SIZE;

        let iv: [u8; IV_SIZE] =
            token_data[..IV_SIZE].try_into().map_err(|_| RnsError::DecryptionFailed)?;
        let ciphertext = &token_data[IV_SIZE..tag_start];

        let msg = AesCbcDec::new(&self.enc_key, &iv.into())
            .decrypt_padded_b2b_mut::<Pkcs7>(ciphertext, out_buf)
            .map_err(|_| RnsError::DecryptionFailed)?;

        Ok(PlainText(msg))
    }

    /// Verify-then-decrypt convenience returning an owned plaintext.
    pub fn open(&self, token_data: &[u8]) -> Result<Vec<u8>, RnsError> {
        let verified = self.verify(Token::from(token_data))?;
        let mut out = vec![0u8; token_data.len()];
        let plain = self.decrypt(verified, &mut out)?;
        Ok(plain.as_slice().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use core::str;
    use rand_core::OsRng;

    use super::{TokenCipher, AES_BLOCK_SIZE, TOKEN_OVERHEAD_SIZE};

    #[test]
    fn encrypt_then_decrypt() {
        const BUF_SIZE: usize = 4096;

        let cipher = TokenCipher::new_rand(OsRng);
        let out_msg: &str = "#TOKEN_TEST_MESSAGE#";

        let mut out_buf = [0u8; BUF_SIZE];
        let token = cipher.encrypt(out_msg.into(), &mut out_buf[..]).expect("token");

        let token = cipher.verify(token).expect("verified token");

        let mut in_buf = [0u8; BUF_SIZE];
        let in_msg = str::from_utf8(cipher.decrypt(token, &mut in_buf).expect("plaintext").0)
            .expect("valid string");

        assert_eq!(in_msg, out_msg);
    }

    #[test]
    fn tampered_token_fails_verification() {
        let cipher = TokenCipher::new_rand(OsRng);
        let mut out_buf = [0u8; 256];
        let token_len = cipher.encrypt("payload".into(), &mut out_buf[..]).expect("token").len();

        out_buf[TOKEN_OVERHEAD_SIZE / 2] ^= 0x01;
        assert!(cipher.open(&out_buf[..token_len]).is_err());
    }

    #[test]
    fn token_length_is_iv_padded_ciphertext_and_tag() {
        let cipher = TokenCipher::new_rand(OsRng);
        let mut out_buf = [0u8; 256];
        for len in [0usize, 1, 15, 16, 17, 32] {
            let plain = vec![0xA5u8; len];
            let token =
                cipher.encrypt(plain.as_slice().into(), &mut out_buf[..]).expect("token");
            let padded = ((len / AES_BLOCK_SIZE) + 1) * AES_BLOCK_SIZE;
            assert_eq!(token.len(), TOKEN_OVERHEAD_SIZE + padded);
        }
    }

    #[test]
    fn undersized_output_buffer_is_rejected() {
        let cipher = TokenCipher::new_rand(OsRng);
        let mut out_buf = [0u8; TOKEN_OVERHEAD_SIZE + AES_BLOCK_SIZE - 1];
        assert!(cipher.encrypt("hello".into(), &mut out_buf[..]).is_err());
    }
}
