//! Session configuration.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label of the always-open signaling sub-channel.
pub const DEFAULT_CONTROL_LABEL: &str = "%";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Network tuning for control messages and connection attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Interval between control message retransmissions, in milliseconds.
    pub timeout_ms: u64,
    /// Total transmissions of a control message before it is failed.
    pub retries: u32,
    /// Watchdog for a connect or reconnect attempt. Falls back to `timeout_ms`.
    pub connect_timeout_ms: Option<u64>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            retries: 3,
            connect_timeout_ms: None,
        }
    }
}

impl NetConfig {
    /// Retransmission interval.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Watchdog duration for a connection attempt.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(self.timeout_ms))
    }
}

/// Configuration for a single session.
///
/// Every field has a default, so an empty TOML document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Network tuning.
    pub net: NetConfig,
    /// Token presented to the remote before any other command.
    pub auth_token: Option<String>,
    /// Label used when creating the control sub-channel.
    pub control_label: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            net: NetConfig::default(),
            auth_token: None,
            control_label: DEFAULT_CONTROL_LABEL.to_string(),
        }
    }
}

impl SessionConfig {
    /// Override the network timeout and retry budget.
    #[must_use]
    pub fn with_net(mut self, timeout: Duration, retries: u32) -> Self {
        self.net.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.net.retries = retries;
        self
    }

    /// Set the authentication token.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    /// Returns error if the document is malformed or fails validation.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Load from [`Self::default_path`] when it exists, otherwise use defaults.
    ///
    /// # Errors
    /// Returns error if an existing file cannot be read or parsed.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/remote-panes/config.toml`, if the platform has a config dir.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("remote-panes").join("config.toml"))
    }

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    /// Returns error on zero timeouts, zero retries or an empty control label.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.net.timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "net.timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.net.retries == 0 {
            return Err(ConfigError::Invalid {
                field: "net.retries",
                reason: "at least one transmission is required".to_string(),
            });
        }
        if self.net.connect_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "net.connect_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.control_label.is_empty() {
            return Err(ConfigError::Invalid {
                field: "control_label",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::assert_err;

    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = SessionConfig::from_toml_str("").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.net.timeout(), Duration::from_secs(3));
        assert_eq!(config.net.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.control_label, "%");
    }

    #[test]
    fn test_net_table() {
        let config = SessionConfig::from_toml_str(
            r#"
            auth_token = "s3cret"

            [net]
            timeout_ms = 1000
            retries = 5
            connect_timeout_ms = 8000
            "#,
        )
        .unwrap();
        assert_eq!(config.net.retries, 5);
        assert_eq!(config.net.timeout(), Duration::from_secs(1));
        assert_eq!(config.net.connect_timeout(), Duration::from_secs(8));
        assert_eq!(config.auth_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_zero_retries_rejected() {
        let err = SessionConfig::from_toml_str("[net]\nretries = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "net.retries", .. }));
    }

    #[test]
    fn test_zero_durations_rejected() {
        let err = assert_err!(SessionConfig::from_toml_str("[net]\ntimeout_ms = 0\n"));
        assert!(matches!(err, ConfigError::Invalid { field: "net.timeout_ms", .. }));
        let err = assert_err!(SessionConfig::from_toml_str("[net]\nconnect_timeout_ms = 0\n"));
        assert!(matches!(err, ConfigError::Invalid { field: "net.connect_timeout_ms", .. }));
        let err = assert_err!(SessionConfig::from_toml_str("control_label = \"\"\n"));
        assert!(matches!(err, ConfigError::Invalid { field: "control_label", .. }));
    }

    #[test]
    fn test_malformed_document() {
        let err = SessionConfig::from_toml_str("[net\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = SessionConfig::load(Path::new("/nonexistent/remote-panes.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
