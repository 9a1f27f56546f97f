use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outer cell layout constants
pub mod cell {
    /// Payload length of a fixed-size cell
    pub const PAYLOAD_LEN: usize = 509;

    /// command(1) + recognized(2) + stream id(2) + digest(4) + length(2)
    pub const RELAY_HEADER_LEN: usize = 11;

    /// Largest payload a single relay cell can carry
    pub const RELAY_DATA_MAX: usize = PAYLOAD_LEN - RELAY_HEADER_LEN;

    /// VERSIONS is variable-length despite its low command number
    pub const VERSIONS_COMMAND: u8 = 7;

    /// Commands at or above this value are variable-length
    pub const VARIABLE_LENGTH_THRESHOLD: u8 = 128;
}

/// Link protocol constants
pub mod link {
    /// Oldest link protocol we speak
    pub const MIN_VERSION: u16 = 3;

    /// Newest link protocol we speak
    pub const MAX_VERSION: u16 = 4;

    /// First version with 4-byte circuit ids
    pub const WIDE_CIRCUIT_ID_VERSION: u16 = 4;

    /// Set on circuit ids chosen by the initiator from version 4 onwards
    pub const INITIATOR_CIRCUIT_ID_BIT: u32 = 0x8000_0000;
}

/// Circuit-level sliding window constants
pub mod flow {
    /// Both windows start here
    pub const CIRCUIT_WINDOW_START: u32 = 1000;

    /// Credit granted by one SENDME
    pub const CIRCUIT_WINDOW_INCREMENT: u32 = 100;

    /// A SENDME goes out once the receive window drops below this
    pub const SENDME_THRESHOLD: u32 = 900;
}

/// Handshake and key-material sizes
pub mod crypto {
    /// SHA-1 output length
    pub const HASH_LEN: usize = 20;

    /// AES-128 key length
    pub const KEY_LEN: usize = 16;

    /// X25519 public value length
    pub const DH_LEN: usize = 32;

    /// Rendezvous cookie length
    pub const REND_COOKIE_LEN: usize = 20;

    /// KH | Df | Db | Kf | Kb
    pub const KEY_MATERIAL_LEN: usize = 3 * HASH_LEN + 2 * KEY_LEN;

    /// g^y | KH
    pub const HANDSHAKE_REPLY_LEN: usize = DH_LEN + HASH_LEN;
}

/// What happens when a relay reports that the circuit was truncated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncatePolicy {
    /// Drop the hops beyond the reporting relay and tear the circuit down
    #[default]
    Fatal,

    /// Drop the hops beyond the reporting relay and keep the shorter circuit usable
    Continue,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Circuit operations wait for their target state before returning
    pub blocking: bool,

    /// Check the verification hash in CREATED/EXTENDED replies
    pub strict_handshake_verification: bool,

    /// Reaction to RELAY_TRUNCATED
    pub truncate_policy: TruncatePolicy,

    /// Link protocol versions offered in VERSIONS
    pub link_versions: Vec<u16>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            blocking: false,
            strict_handshake_verification: false,
            truncate_policy: TruncatePolicy::Fatal,
            link_versions: (link::MIN_VERSION..=link::MAX_VERSION).collect(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn with_strict_handshake_verification(mut self, strict: bool) -> Self {
        self.strict_handshake_verification = strict;
        self
    }

    pub fn with_truncate_policy(mut self, policy: TruncatePolicy) -> Self {
        self.truncate_policy = policy;
        self
    }

    pub fn with_link_versions(mut self, versions: Vec<u16>) -> Self {
        self.link_versions = versions;
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &PathBuf) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }

    /// Reject version lists we cannot speak
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.link_versions.is_empty() {
            return Err(ConfigError::Invalid("link_versions is empty".to_string()));
        }

        if let Some(v) = self
            .link_versions
            .iter()
            .find(|v| !(link::MIN_VERSION..=link::MAX_VERSION).contains(*v))
        {
            return Err(ConfigError::Invalid(format!(
                "unsupported link version {}",
                v
            )));
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert!(!config.blocking);
        assert!(!config.strict_handshake_verification);
        assert_eq!(config.truncate_policy, TruncatePolicy::Fatal);
        assert_eq!(config.link_versions, vec![3, 4]);
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::new()
            .with_blocking(true)
            .with_strict_handshake_verification(true)
            .with_truncate_policy(TruncatePolicy::Continue)
            .with_link_versions(vec![4]);

        assert!(config.blocking);
        assert!(config.strict_handshake_verification);
        assert_eq!(config.truncate_policy, TruncatePolicy::Continue);
        assert_eq!(config.link_versions, vec![4]);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("onioncell-config-{}.toml", std::process::id()));
        let config = ClientConfig::new()
            .with_truncate_policy(TruncatePolicy::Continue)
            .with_blocking(true);

        config.to_file(&path).unwrap();
        let loaded = ClientConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(loaded.blocking);
        assert_eq!(loaded.truncate_policy, TruncatePolicy::Continue);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ClientConfig = toml::from_str("strict_handshake_verification = true").unwrap();
        assert!(config.strict_handshake_verification);
        assert_eq!(config.link_versions, vec![3, 4]);
    }

    #[test]
    fn test_validate_rejects_unknown_version() {
        let config = ClientConfig::new().with_link_versions(vec![2, 4]);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_flow_constants() {
        assert_eq!(cell::RELAY_DATA_MAX, 498);
        assert_eq!(crypto::KEY_MATERIAL_LEN, 92);
        assert!(flow::SENDME_THRESHOLD < flow::CIRCUIT_WINDOW_START);
    }
}
