//! AES-256-GCM with PKCS#7 padding.
//!
//! The encryption key keys the cipher and the MAC key is bound as associated
//! data, so a payload only verifies under the complete key pair. Nonces are
//! always drawn here; there is no way to encrypt under a caller nonce.

use super::{CryptoError, KeyMaterial, NONCE_LEN, TAG_LEN};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use rand::RngCore;

const BLOCK_LEN: usize = 16;

/// Output of [`encrypt`]: ciphertext plus the nonce and tag that travel with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    ciphertext: Vec<u8>,
    nonce: [u8; NONCE_LEN],
    tag: [u8; TAG_LEN],
}

impl SealedPayload {
    /// Rebuilds a payload received from storage or the relay.
    pub fn from_parts(ciphertext: Vec<u8>, nonce: &[u8], tag: &[u8]) -> Result<Self, CryptoError> {
        let nonce: [u8; NONCE_LEN] = nonce.try_into().map_err(|_| CryptoError::Integrity)?;
        let tag: [u8; TAG_LEN] = tag.try_into().map_err(|_| CryptoError::Integrity)?;
        Ok(Self {
            ciphertext,
            nonce,
            tag,
        })
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    pub fn tag(&self) -> &[u8; TAG_LEN] {
        &self.tag
    }
}

pub fn encrypt(plaintext: &[u8], keys: &KeyMaterial) -> Result<SealedPayload, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(keys.enc_key()).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: super::ENC_KEY_LEN,
            actual: keys.enc_key().len(),
        }
    })?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);

    let mut buffer = pad(plaintext);
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), keys.mac_key(), &mut buffer)
        .map_err(|_| CryptoError::Integrity)?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(SealedPayload {
        ciphertext: buffer,
        nonce,
        tag: tag_bytes,
    })
}

pub fn decrypt(sealed: &SealedPayload, keys: &KeyMaterial) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(keys.enc_key()).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: super::ENC_KEY_LEN,
            actual: keys.enc_key().len(),
        }
    })?;

    let mut buffer = sealed.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&sealed.nonce),
            keys.mac_key(),
            &mut buffer,
            Tag::from_slice(&sealed.tag),
        )
        .map_err(|_| CryptoError::Integrity)?;

    unpad(buffer)
}

fn pad(data: &[u8]) -> Vec<u8> {
    let pad_len = BLOCK_LEN - (data.len() % BLOCK_LEN);
    let mut padded = Vec::with_capacity(data.len() + pad_len);
    padded.extend_from_slice(data);
    padded.resize(data.len() + pad_len, pad_len as u8);
    padded
}

fn unpad(mut data: Vec<u8>) -> Result<Vec<u8>, CryptoError> {
    if data.is_empty() || data.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::Padding);
    }
    let pad_len = data[data.len() - 1] as usize;
    if pad_len == 0 || pad_len > BLOCK_LEN {
        return Err(CryptoError::Padding);
    }
    let body_len = data.len() - pad_len;
    if data[body_len..].iter().any(|&b| b as usize != pad_len) {
        return Err(CryptoError::Padding);
    }
    data.truncate(body_len);
    Ok(data)
}
