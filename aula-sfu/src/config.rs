use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub quality: QualityConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
        }
    }
}

/// Transport allocation parameters handed to the media engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Local bind address for media traffic
    pub listen_ip: String,
    /// Address announced to remote peers in ICE candidates
    pub announced_ip: String,
    pub initial_outgoing_bitrate: u32,
    pub minimum_outgoing_bitrate: u32,
    pub max_incoming_bitrate: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: "127.0.0.1".to_string(),
            initial_outgoing_bitrate: 1_000_000,
            minimum_outgoing_bitrate: 600_000,
            max_incoming_bitrate: 1_500_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Seconds between telemetry collection rounds
    pub interval_secs: u64,
    /// Per-transport budget for a statistics pull; stragglers are excluded
    /// from the round's averages
    pub stats_timeout_ms: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3,
            stats_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" for development, "json" for production
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus `AULA__`-prefixed
    /// environment variables (e.g. `AULA__SERVER__PORT=8080`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        builder
            .add_source(Environment::with_prefix("AULA").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Validate configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.transport.minimum_outgoing_bitrate > self.transport.initial_outgoing_bitrate {
            errors.push(
                "transport.minimum_outgoing_bitrate exceeds initial_outgoing_bitrate".to_string(),
            );
        }
        if self.quality.interval_secs == 0 {
            errors.push("quality.interval_secs must be non-zero".to_string());
        }
        if self.quality.stats_timeout_ms == 0 {
            errors.push("quality.stats_timeout_ms must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 3001);
        assert_eq!(config.transport.initial_outgoing_bitrate, 1_000_000);
        assert_eq!(config.transport.minimum_outgoing_bitrate, 600_000);
        assert_eq!(config.transport.max_incoming_bitrate, 1_500_000);
        assert_eq!(config.quality.interval_secs, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.quality.interval_secs = 0;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("interval_secs")));
    }

    #[test]
    fn test_validate_rejects_inverted_bitrates() {
        let mut config = Config::default();
        config.transport.minimum_outgoing_bitrate = 2_000_000;
        assert!(config.validate().is_err());
    }
}
