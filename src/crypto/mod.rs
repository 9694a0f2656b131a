//! Per-user key material, the AES-GCM cipher and the X25519 handshake.

pub mod cipher;
pub mod handshake;

pub use cipher::{decrypt, encrypt, SealedPayload};
pub use handshake::{HandshakeOutcome, HandshakeService, HandshakeState, ServerIdentity};

use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-256 key length
pub const ENC_KEY_LEN: usize = 32;
/// Length of the key bound as GCM associated data
pub const MAC_KEY_LEN: usize = 16;
/// 96-bit GCM nonce
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("key exchange failed: {0}")]
    KeyExchange(String),

    #[error("message integrity check failed")]
    Integrity,

    #[error("malformed padding")]
    Padding,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

/// Symmetric keys derived by the handshake for one user.
///
/// Zeroized on drop. Overwritten in the key store by a later handshake.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    enc_key: [u8; ENC_KEY_LEN],
    mac_key: [u8; MAC_KEY_LEN],
}

impl KeyMaterial {
    pub fn new(enc_key: [u8; ENC_KEY_LEN], mac_key: [u8; MAC_KEY_LEN]) -> Self {
        Self { enc_key, mac_key }
    }

    pub fn from_slices(enc_key: &[u8], mac_key: &[u8]) -> Result<Self, CryptoError> {
        let enc_key: [u8; ENC_KEY_LEN] =
            enc_key
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: ENC_KEY_LEN,
                    actual: enc_key.len(),
                })?;
        let mac_key: [u8; MAC_KEY_LEN] =
            mac_key
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: MAC_KEY_LEN,
                    actual: mac_key.len(),
                })?;
        Ok(Self { enc_key, mac_key })
    }

    pub fn enc_key(&self) -> &[u8; ENC_KEY_LEN] {
        &self.enc_key
    }

    pub fn mac_key(&self) -> &[u8; MAC_KEY_LEN] {
        &self.mac_key
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_material_rejects_wrong_lengths() {
        let err = KeyMaterial::from_slices(&[0u8; 16], &[0u8; MAC_KEY_LEN]).unwrap_err();
        assert_eq!(
            err,
            CryptoError::InvalidKeyLength {
                expected: ENC_KEY_LEN,
                actual: 16
            }
        );
        assert!(KeyMaterial::from_slices(&[0u8; ENC_KEY_LEN], &[0u8; 32]).is_err());
    }

    #[test]
    fn test_key_material_debug_hides_keys() {
        let keys = KeyMaterial::new([7u8; ENC_KEY_LEN], [9u8; MAC_KEY_LEN]);
        let rendered = format!("{:?}", keys);
        assert!(!rendered.contains('7'));
        assert!(!rendered.contains('9'));
    }
}
