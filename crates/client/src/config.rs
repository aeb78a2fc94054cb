//! Client configuration

use serde::{Deserialize, Serialize};

/// Tunables for a relay client session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Message lifetime for encoders built via `MsgStore::encoder` (seconds).
    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u32,

    /// Proof-of-work difficulty for encoders built via `MsgStore::encoder`
    /// (leading zero bits).
    #[serde(default = "default_pow_bits")]
    pub pow_bits: u32,

    /// Header cache freshness window (seconds).
    #[serde(default = "default_cache_expire")]
    pub cache_expire_secs: u64,

    /// HTTP deadline for relay requests (seconds).
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
}

fn default_ttl() -> u32 {
    7 * 24 * 60 * 60
}

fn default_pow_bits() -> u32 {
    16
}

fn default_cache_expire() -> u64 {
    5
}

fn default_timeout() -> u64 {
    30
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl(),
            pow_bits: default_pow_bits(),
            cache_expire_secs: default_cache_expire(),
            request_timeout_secs: default_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.default_ttl_secs, 7 * 24 * 60 * 60);
        assert_eq!(config.pow_bits, 16);
        assert_eq!(config.cache_expire_secs, 5);
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: ClientConfig = serde_json::from_str(r#"{"pow_bits": 8}"#).unwrap();
        assert_eq!(config.pow_bits, 8);
        assert_eq!(config.cache_expire_secs, 5);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = ClientConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ClientConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.default_ttl_secs, config.default_ttl_secs);
    }
}
