//! Server configuration loaded from TOML.
//!
//! ```toml
//! [rooms]
//! max_cached_events = 5000
//! plugin_timeout_ms = 3000
//!
//! [logging]
//! level = "debug"
//! json = true
//! ```
//!
//! Every key is optional; missing ones fall back to their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tavern_room::RoomLimits;

/// Plain levels for `logging.level`. Directives containing `=` pass unchecked.
const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Errors from loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level server configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Limits applied to every room.
    pub rooms: RoomLimits,
    pub logging: LoggingSettings,
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive. `RUST_LOG` overrides it.
    pub level: String,
    /// Emit one JSON object per line instead of human-readable text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ServerConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a TOML file, then clamps out-of-range values.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        let config = Self::from_toml_str(&text)?.validate();
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Clamps values that would make the server unusable, logging each fix.
    pub fn validate(mut self) -> Self {
        self.rooms = self.rooms.validated();
        let level = self.logging.level.trim().to_ascii_lowercase();
        if LEVELS.contains(&level.as_str()) {
            self.logging.level = level;
        } else if level.is_empty() || !level.contains('=') {
            tracing::warn!(level = %self.logging.level, "unknown log level, using info");
            self.logging.level = "info".to_string();
        }
        self
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml_str_empty_uses_defaults() {
        let config = ServerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_from_toml_str_partial_sections() {
        let config = ServerConfig::from_toml_str(
            r#"
            [rooms]
            max_cached_events = 5
            plugin_timeout_ms = 250

            [logging]
            json = true
            "#,
        )
        .unwrap();
        assert_eq!(config.rooms.max_cached_events, 5);
        assert_eq!(config.rooms.plugin_timeout_ms, 250);
        assert_eq!(
            config.rooms.channel_size,
            RoomLimits::default().channel_size
        );
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_from_toml_str_rejects_wrong_types() {
        let err = ServerConfig::from_toml_str("[rooms]\nmax_cached_events = \"many\"")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validate_clamps_limits_and_level() {
        let mut config = ServerConfig::default();
        config.rooms.channel_size = 0;
        config.rooms.default_empty_room_ttl_ms = u64::MAX;
        config.logging.level = "LOUD".to_string();

        let config = config.validate();
        assert_eq!(config.rooms.channel_size, 1);
        assert_eq!(
            config.rooms.default_empty_room_ttl_ms,
            config.rooms.max_empty_room_ttl_ms
        );
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_keeps_filter_directives() {
        let mut config = ServerConfig::default();
        config.logging.level = "tavern_room=debug".to_string();
        assert_eq!(config.validate().logging.level, "tavern_room=debug");

        let mut config = ServerConfig::default();
        config.logging.level = " WARN ".to_string();
        assert_eq!(config.validate().logging.level, "warn");
    }

    #[test]
    fn test_to_toml_string_round_trips() {
        let mut config = ServerConfig::default();
        config.rooms.max_properties_size = 1024;
        config.logging.json = true;
        let text = config.to_toml_string().unwrap();
        assert_eq!(ServerConfig::from_toml_str(&text).unwrap(), config);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_io_error() {
        let err = ServerConfig::load("/nonexistent/tavern.toml").await.unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
