use crate::error::AppError;
use crate::models::UserId;
use crate::state::AppState;
use actix_web::{post, web, HttpResponse};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct HandshakeRequest {
    pub user_id: UserId,
    /// Base64 X25519 public key (32 bytes)
    pub public_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Base64 server public key
    pub server_public_key: String,
    /// Base64 HKDF salt
    pub salt: String,
    /// Seconds until the derived keys expire
    pub expires_in: u64,
}

#[post("/v1/handshake")]
pub async fn handshake(
    state: web::Data<AppState>,
    body: web::Json<HandshakeRequest>,
) -> Result<HttpResponse, AppError> {
    let request = body.into_inner();
    let public_key = general_purpose::STANDARD
        .decode(request.public_key.trim())
        .map_err(|e| AppError::KeyExchange(format!("public key is not valid base64: {e}")))?;

    let outcome = state.handshake.perform(request.user_id, &public_key).await?;

    Ok(HttpResponse::Ok().json(HandshakeResponse {
        server_public_key: general_purpose::STANDARD.encode(outcome.server_public_key),
        salt: general_purpose::STANDARD.encode(outcome.salt),
        expires_in: state.handshake.key_ttl().as_secs(),
    }))
}
