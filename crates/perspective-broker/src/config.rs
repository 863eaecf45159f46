//! Broker configuration.
//!
//! Loaded from TOML:
//!
//! ```toml
//! call_timeout_ms = 30000
//! max_depth = 48
//! max_frame_bytes = 1048576
//! ```

use crate::registry::TypeRegistry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Largest usable `max_depth`. Each level of a value costs two levels of
/// JSON nesting, and the frame around it three more; the JSON parser gives
/// up past 128.
pub const MAX_DEPTH: usize = 60;

/// Limits applied to every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Default deadline for outbound calls. Unset means calls wait until
    /// answered or the connection drops.
    pub call_timeout_ms: Option<u64>,
    /// Deepest nesting accepted in a sent or received value, at most
    /// [`MAX_DEPTH`].
    pub max_depth: usize,
    /// Largest text frame accepted from the peer.
    pub max_frame_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: None,
            max_depth: 48,
            max_frame_bytes: 1 << 20,
        }
    }
}

impl BrokerConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::Invalid("max_depth must be at least 1".into()));
        }
        if self.max_depth > MAX_DEPTH {
            return Err(ConfigError::Invalid(format!(
                "max_depth must be at most {MAX_DEPTH}"
            )));
        }
        if self.max_frame_bytes < 1024 {
            return Err(ConfigError::Invalid(
                "max_frame_bytes must be at least 1024".into(),
            ));
        }
        if self.call_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "call_timeout_ms must be positive; omit it to wait forever".into(),
            ));
        }
        Ok(())
    }
}

/// Error loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything a new connection needs besides its transport.
#[derive(Clone)]
pub struct BrokerOptions {
    pub config: BrokerConfig,
    pub registry: Arc<TypeRegistry>,
}

impl BrokerOptions {
    pub fn new(config: BrokerConfig, registry: Arc<TypeRegistry>) -> Self {
        Self { config, registry }
    }

    pub fn with_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }
}

impl Default for BrokerOptions {
    /// Default limits and the global registry.
    fn default() -> Self {
        Self::new(BrokerConfig::default(), TypeRegistry::global())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(BrokerConfig::from_toml("").unwrap(), BrokerConfig::default());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = BrokerConfig::from_toml("call_timeout_ms = 250").unwrap();
        assert_eq!(config.call_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.max_depth, 48);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            BrokerConfig::from_toml("max_dept = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn nonsense_limits_are_rejected() {
        assert!(matches!(
            BrokerConfig::from_toml("max_depth = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            BrokerConfig::from_toml("call_timeout_ms = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn depth_beyond_what_json_can_nest_is_rejected() {
        assert_eq!(
            BrokerConfig::from_toml(&format!("max_depth = {MAX_DEPTH}"))
                .unwrap()
                .max_depth,
            MAX_DEPTH
        );
        assert!(matches!(
            BrokerConfig::from_toml(&format!("max_depth = {}", MAX_DEPTH + 1)),
            Err(ConfigError::Invalid(_))
        ));
        assert!(BrokerConfig::default().validate().is_ok());
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = BrokerConfig::load("/nonexistent/perspective.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/perspective.toml"));
    }
}
