//! X25519 handshake against the server's static key, deriving per-user
//! [`KeyMaterial`] with HKDF-SHA256 and publishing it to the key store.

use super::{CryptoError, KeyMaterial, ENC_KEY_LEN, MAC_KEY_LEN};
use crate::error::AppError;
use crate::models::UserId;
use crate::store::KeyStore;
use base64::{engine::general_purpose, Engine as _};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 32;

const KEY_INFO: &[u8] = b"session-chat/v1 message keys";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    KeyExchanged,
    Derived,
    Published,
}

/// The server's static X25519 key pair.
#[derive(Clone)]
pub struct ServerIdentity {
    secret: StaticSecret,
    public: PublicKey,
}

impl ServerIdentity {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut bytes[..]);
        Self::from_bytes(*bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Loads a base64-encoded 32-byte private key.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let decoded = Zeroizing::new(
            general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| CryptoError::KeyExchange(format!("server key decode: {e}")))?,
        );
        let bytes: [u8; 32] =
            decoded
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: 32,
                    actual: decoded.len(),
                })?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    /// X25519 with a client public key. Rejects keys of the wrong length and
    /// low-order points that would produce an all-zero secret.
    pub fn exchange(&self, client_public: &[u8]) -> Result<SharedSecret, CryptoError> {
        let client: [u8; PUBLIC_KEY_LEN] = client_public.try_into().map_err(|_| {
            CryptoError::KeyExchange(format!(
                "public key must be {} bytes, got {}",
                PUBLIC_KEY_LEN,
                client_public.len()
            ))
        })?;

        let shared = self.secret.diffie_hellman(&PublicKey::from(client));
        if !shared.was_contributory() {
            return Err(CryptoError::KeyExchange(
                "public key yields a non-contributory shared secret".into(),
            ));
        }
        Ok(shared)
    }
}

/// Expands a shared secret into encryption and MAC keys.
pub fn derive_keys(shared_secret: &[u8], salt: &[u8]) -> Result<KeyMaterial, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut okm = Zeroizing::new([0u8; ENC_KEY_LEN + MAC_KEY_LEN]);
    hk.expand(KEY_INFO, &mut okm[..])
        .map_err(|e| CryptoError::KeyDerivation(format!("HKDF expand failed: {e}")))?;

    KeyMaterial::from_slices(&okm[..ENC_KEY_LEN], &okm[ENC_KEY_LEN..])
}

#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub user_id: UserId,
    pub server_public_key: [u8; PUBLIC_KEY_LEN],
    pub salt: [u8; SALT_LEN],
    pub state: HandshakeState,
}

#[derive(Clone)]
pub struct HandshakeService {
    identity: ServerIdentity,
    keys: KeyStore,
}

impl HandshakeService {
    pub fn new(identity: ServerIdentity, keys: KeyStore) -> Self {
        Self { identity, keys }
    }

    pub fn server_public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.identity.public_key_bytes()
    }

    pub fn key_ttl(&self) -> std::time::Duration {
        self.keys.ttl()
    }

    /// Runs the exchange for `user_id`. Nothing is written unless every step
    /// before publication succeeds; a repeat overwrites earlier material.
    pub async fn perform(
        &self,
        user_id: UserId,
        client_public: &[u8],
    ) -> Result<HandshakeOutcome, AppError> {
        let mut state = HandshakeState::Init;
        debug!(user_id = %user_id, ?state, "Handshake started");

        let shared = self.identity.exchange(client_public).map_err(|e| {
            warn!(user_id = %user_id, error = %e, "Handshake rejected");
            e
        })?;
        state = HandshakeState::KeyExchanged;
        debug!(user_id = %user_id, ?state, "Shared secret established");

        let mut salt = [0u8; SALT_LEN];
        rand::rng().fill_bytes(&mut salt);
        let material = derive_keys(shared.as_bytes(), &salt)?;
        state = HandshakeState::Derived;
        debug!(user_id = %user_id, ?state, "Message keys derived");

        self.keys.publish(user_id, &material).await?;
        state = HandshakeState::Published;
        info!(user_id = %user_id, ?state, ttl_secs = self.keys.ttl().as_secs(), "Handshake complete");

        Ok(HandshakeOutcome {
            user_id,
            server_public_key: self.identity.public_key_bytes(),
            salt,
            state,
        })
    }
}
