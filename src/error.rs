use crate::crypto::CryptoError;
use crate::relay::RelayError;
use crate::store::StoreError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("key exchange failed: {0}")]
    KeyExchange(String),

    #[error("message integrity check failed")]
    Integrity,

    #[error("malformed padding")]
    Padding,

    /// The sender has no key material, so nothing can be encrypted for them.
    #[error("sender has not completed a key exchange")]
    UnauthenticatedSender,

    #[error("not found")]
    NotFound,

    #[error("message store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("message cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("relay unavailable: {0}")]
    RelayUnavailable(String),

    #[error("internal server error")]
    Internal,
}

impl AppError {
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) | AppError::KeyExchange(_) => 400,
            AppError::UnauthenticatedSender => 401,
            AppError::NotFound => 404,
            AppError::Integrity | AppError::Padding => 422,
            AppError::StoreUnavailable(_)
            | AppError::CacheUnavailable(_)
            | AppError::RelayUnavailable(_) => 503,
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => 500,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config",
            AppError::StartServer(_) => "start_server",
            AppError::BadRequest(_) => "bad_request",
            AppError::KeyExchange(_) => "key_exchange",
            AppError::Integrity => "integrity",
            AppError::Padding => "padding",
            AppError::UnauthenticatedSender => "unauthenticated_sender",
            AppError::NotFound => "not_found",
            AppError::StoreUnavailable(_) => "store_unavailable",
            AppError::CacheUnavailable(_) => "cache_unavailable",
            AppError::RelayUnavailable(_) => "relay_unavailable",
            AppError::Internal => "internal",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(AppError::status_code(self)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        // Internal details stay in the logs.
        let message = match self {
            AppError::StoreUnavailable(_)
            | AppError::CacheUnavailable(_)
            | AppError::RelayUnavailable(_)
            | AppError::Config(_)
            | AppError::StartServer(_) => {
                tracing::error!(error = %self, "Request failed");
                "service temporarily unavailable".to_string()
            }
            other => other.to_string(),
        };

        HttpResponse::build(ResponseError::status_code(self)).json(json!({
            "error": self.code(),
            "message": message,
        }))
    }
}

impl From<CryptoError> for AppError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Integrity => AppError::Integrity,
            CryptoError::Padding => AppError::Padding,
            CryptoError::KeyExchange(msg) => AppError::KeyExchange(msg),
            CryptoError::KeyDerivation(_) | CryptoError::InvalidKeyLength { .. } => {
                tracing::error!(error = %e, "Key material error");
                AppError::Internal
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => AppError::NotFound,
            other => AppError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<RelayError> for AppError {
    fn from(e: RelayError) -> Self {
        AppError::RelayUnavailable(e.to_string())
    }
}
