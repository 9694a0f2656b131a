use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What goes over the relay when a message is fanned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanoutMode {
    /// Publish the text; lowest latency.
    #[default]
    Plaintext,
    /// Publish the ciphertext; receivers decrypt with the sender's keys.
    Sealed,
}

impl FanoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FanoutMode::Plaintext => "plaintext",
            FanoutMode::Sealed => "sealed",
        }
    }
}

impl FromStr for FanoutMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plaintext" => Ok(FanoutMode::Plaintext),
            "sealed" => Ok(FanoutMode::Sealed),
            other => Err(AppError::Config(format!(
                "FANOUT_MODE must be `plaintext` or `sealed`, got `{other}`"
            ))),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    /// Durable store; in-memory when unset.
    pub database_url: Option<String>,
    /// Relay and key store; in-process when unset.
    pub redis_url: Option<String>,
    pub redis_channel_prefix: String,
    /// Base64 X25519 private key. An ephemeral key is generated when unset.
    pub server_private_key: Option<String>,
    pub key_ttl: Duration,
    pub message_cache_ttl: Duration,
    pub fanout_mode: FanoutMode,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<set>"))
            .field("redis_channel_prefix", &self.redis_channel_prefix)
            .field(
                "server_private_key",
                &self.server_private_key.as_ref().map(|_| "<redacted>"),
            )
            .field("key_ttl", &self.key_ttl)
            .field("message_cache_ttl", &self.message_cache_ttl)
            .field("fanout_mode", &self.fanout_mode)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = parse_or(&lookup, "PORT", 3000u16)?;
        let key_ttl_secs = parse_or(&lookup, "KEY_TTL_SECONDS", 86_400u64)?;
        let cache_ttl_secs = parse_or(&lookup, "MESSAGE_CACHE_TTL_SECONDS", 3_600u64)?;

        if key_ttl_secs == 0 {
            return Err(AppError::Config("KEY_TTL_SECONDS must be positive".into()));
        }
        if cache_ttl_secs == 0 {
            return Err(AppError::Config(
                "MESSAGE_CACHE_TTL_SECONDS must be positive".into(),
            ));
        }

        let fanout_mode = match non_empty("FANOUT_MODE") {
            Some(value) => value.parse()?,
            None => FanoutMode::default(),
        };

        Ok(Self {
            port,
            database_url: non_empty("DATABASE_URL"),
            redis_url: non_empty("REDIS_URL"),
            redis_channel_prefix: non_empty("REDIS_CHANNEL_PREFIX")
                .unwrap_or_else(|| "session".to_string()),
            server_private_key: non_empty("SERVER_PRIVATE_KEY"),
            key_ttl: Duration::from_secs(key_ttl_secs),
            message_cache_ttl: Duration::from_secs(cache_ttl_secs),
            fanout_mode,
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: `{value}`"))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, AppError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.port, 3000);
        assert!(cfg.database_url.is_none());
        assert!(cfg.redis_url.is_none());
        assert_eq!(cfg.redis_channel_prefix, "session");
        assert_eq!(cfg.key_ttl, Duration::from_secs(86_400));
        assert_eq!(cfg.message_cache_ttl, Duration::from_secs(3_600));
        assert_eq!(cfg.fanout_mode, FanoutMode::Plaintext);
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("PORT", "8080"),
            ("REDIS_URL", "redis://cache:6379"),
            ("KEY_TTL_SECONDS", "60"),
            ("FANOUT_MODE", "Sealed"),
            ("REDIS_CHANNEL_PREFIX", "room"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(cfg.key_ttl, Duration::from_secs(60));
        assert_eq!(cfg.fanout_mode, FanoutMode::Sealed);
        assert_eq!(cfg.redis_channel_prefix, "room");
    }

    #[test]
    fn test_invalid_values_fail() {
        assert!(matches!(config(&[("PORT", "http")]), Err(AppError::Config(_))));
        assert!(matches!(
            config(&[("KEY_TTL_SECONDS", "0")]),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            config(&[("FANOUT_MODE", "broadcast")]),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let cfg = config(&[
            ("SERVER_PRIVATE_KEY", "c2VjcmV0LWtleQ=="),
            ("DATABASE_URL", "postgres://app:hunter2@db/chat"),
        ])
        .unwrap();
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("c2VjcmV0LWtleQ=="));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let cfg = config(&[("DATABASE_URL", "  "), ("PORT", "")]).unwrap();
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.port, 3000);
    }
}
