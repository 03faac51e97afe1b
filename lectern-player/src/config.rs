//! Configuration loading for the LECTERN player.
//!
//! All fields are required unless explicitly marked optional. No defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lectern_core::UserId;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlayerConfig {
    pub api_base_url: String,
    /// Base WebSocket URL, e.g. `ws://localhost:3000`. The document path is appended.
    pub ws_endpoint: String,
    pub user_id: UserId,
    pub model_slug: String,
    /// Omitted means the model's default voice from the catalog.
    pub voice_slug: Option<String>,
    pub request_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub buffer: BufferConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferConfig {
    /// Blocks to keep requested past the cursor.
    pub ahead: u32,
    /// Upper bound on blocks queued or processing at once.
    pub max_in_flight: usize,
    /// Wait budget for a queued or processing block.
    pub block_timeout_ms: u64,
    /// Automatic re-requests per block before it stays in error.
    pub max_auto_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
    /// Consecutive failed attempts before the connection is declared failed.
    pub max_attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or LECTERN_PLAYER_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl PlayerConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: PlayerConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(invalid("api_base_url", "must not be empty"));
        }
        if !self.ws_endpoint.starts_with("ws://") && !self.ws_endpoint.starts_with("wss://") {
            return Err(invalid("ws_endpoint", "must start with ws:// or wss://"));
        }
        if self.model_slug.trim().is_empty() {
            return Err(invalid("model_slug", "must not be empty"));
        }
        if matches!(&self.voice_slug, Some(v) if v.trim().is_empty()) {
            return Err(invalid("voice_slug", "must not be empty when set"));
        }
        if self.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms", "must be > 0"));
        }
        if self.tick_interval_ms == 0 {
            return Err(invalid("tick_interval_ms", "must be > 0"));
        }
        if self.buffer.max_in_flight == 0 {
            return Err(invalid("buffer.max_in_flight", "must be > 0"));
        }
        if self.buffer.block_timeout_ms == 0 {
            return Err(invalid("buffer.block_timeout_ms", "must be > 0"));
        }
        if self.reconnect.initial_ms == 0 {
            return Err(invalid("reconnect.initial_ms", "must be > 0"));
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(invalid("reconnect.max_ms", "must be >= initial_ms"));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(invalid("reconnect.multiplier", "must be >= 1.0"));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(invalid("reconnect.max_attempts", "must be > 0"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl BufferConfig {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("LECTERN_PLAYER_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
api_base_url = "http://localhost:3000"
ws_endpoint = "ws://localhost:3000"
user_id = "01890a5d-ac96-774b-bcce-b302099a8057"
model_slug = "kokoro"
request_timeout_ms = 5000
tick_interval_ms = 250

[buffer]
ahead = 3
max_in_flight = 2
block_timeout_ms = 30000
max_auto_retries = 2

[reconnect]
initial_ms = 250
max_ms = 5000
multiplier = 1.5
jitter_ms = 100
max_attempts = 8
"#;

    #[test]
    fn test_parse_sample() -> Result<(), ConfigError> {
        let config = PlayerConfig::from_toml_str(SAMPLE)?;
        assert_eq!(config.model_slug, "kokoro");
        assert!(config.voice_slug.is_none());
        assert_eq!(config.buffer.ahead, 3);
        assert_eq!(config.buffer.block_timeout(), Duration::from_secs(30));
        assert_eq!(config.reconnect.max_attempts, 8);
        Ok(())
    }

    #[test]
    fn test_unknown_field_rejected() {
        let raw = format!("{}\nsurprise = true\n", SAMPLE.replace("[buffer]", "extra = 1\n[buffer]"));
        assert!(matches!(
            PlayerConfig::from_toml_str(&raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let raw = SAMPLE.replace("max_in_flight = 2", "max_in_flight = 0");
        assert!(matches!(
            PlayerConfig::from_toml_str(&raw),
            Err(ConfigError::InvalidValue { field: "buffer.max_in_flight", .. })
        ));

        let raw = SAMPLE.replace("ws://localhost:3000", "http://localhost:3000");
        assert!(matches!(
            PlayerConfig::from_toml_str(&raw),
            Err(ConfigError::InvalidValue { field: "ws_endpoint", .. })
        ));

        let raw = SAMPLE.replace("multiplier = 1.5", "multiplier = 0.5");
        assert!(matches!(
            PlayerConfig::from_toml_str(&raw),
            Err(ConfigError::InvalidValue { field: "reconnect.multiplier", .. })
        ));
    }

    #[test]
    fn test_from_path() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("player.toml");
        std::fs::write(&path, SAMPLE)?;
        let config = PlayerConfig::from_path(&path)?;
        assert_eq!(config.api_base_url, "http://localhost:3000");
        Ok(())
    }
}
