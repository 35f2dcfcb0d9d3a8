//! Typed configuration for the grid, the engine and the server.
//!
//! Loaded once at startup from a TOML file; nothing here can change at
//! runtime. Every field has a default so a partial file is valid.
//!
//! ```toml
//! [grid]
//! width = 64
//! height = 64
//! cooldown_ms = 10000
//! observer_queue_capacity = 1024
//! palette = ["#e6194b", "#000000"]
//!
//! [server]
//! bind_addr = "127.0.0.1:9090"
//! storage_path = "mosaic_data"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bus::DEFAULT_QUEUE_CAPACITY;
use crate::cell::Color;
use crate::grid::GridDimensions;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Grid and admission settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Grid width in cells
    pub width: u32,
    /// Grid height in cells
    pub height: u32,
    /// Minimum spacing between two accepted writes of one client, in
    /// milliseconds
    pub cooldown_ms: u64,
    /// Allowed colors (None = any 24-bit color)
    #[serde(deserialize_with = "deserialize_palette")]
    pub palette: Option<Vec<Color>>,
    /// Events buffered per observer before it is disconnected
    pub observer_queue_capacity: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 64,
            cooldown_ms: 10_000,
            palette: None,
            observer_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl GridConfig {
    /// A sub-millisecond remainder of `cooldown` rounds up, so a non-zero
    /// cooldown never becomes zero.
    pub fn new(width: u32, height: u32, cooldown: Duration) -> Self {
        let cooldown_ms = u64::try_from(cooldown.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX);
        Self {
            width,
            height,
            cooldown_ms,
            ..Self::default()
        }
    }

    pub fn dimensions(&self) -> GridDimensions {
        GridDimensions::new(self.width, self.height)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "grid must be at least 1x1, got {}x{}",
                self.width, self.height
            )));
        }
        if self.observer_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "observer_queue_capacity must be positive".into(),
            ));
        }
        if matches!(&self.palette, Some(p) if p.is_empty()) {
            return Err(ConfigError::Invalid("palette must not be empty".into()));
        }
        Ok(())
    }
}

/// WebSocket server settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Interval of the background store reconciliation pass (0 = off)
    pub reconcile_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            reconcile_interval_secs: 300,
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MosaicConfig {
    pub grid: GridConfig,
    pub server: ServerConfig,
}

impl MosaicConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.grid.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}

fn deserialize_palette<'de, D>(deserializer: D) -> Result<Option<Vec<Color>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<Vec<String>> = Option::deserialize(deserializer)?;
    raw.map(|hexes| {
        hexes
            .iter()
            .map(|hex| Color::parse_hex(hex).map_err(serde::de::Error::custom))
            .collect()
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MosaicConfig::default();
        assert_eq!(config.grid.width, 64);
        assert_eq!(config.grid.cooldown(), Duration::from_secs(10));
        assert_eq!(config.server.bind_addr, "127.0.0.1:9090");
        assert!(config.server.storage_path.is_none());
    }

    #[test]
    fn test_parse_partial_file() {
        let config = MosaicConfig::from_toml_str(
            r##"
            [grid]
            width = 4
            height = 4
            palette = ["#ff0000", "0f0"]

            [server]
            storage_path = "/tmp/mosaic"
            "##,
        )
        .unwrap();

        assert_eq!(config.grid.dimensions(), GridDimensions::new(4, 4));
        assert_eq!(config.grid.cooldown_ms, 10_000);
        assert_eq!(
            config.grid.palette,
            Some(vec![Color::rgb(255, 0, 0), Color::rgb(0, 255, 0)])
        );
        assert_eq!(config.server.storage_path, Some(PathBuf::from("/tmp/mosaic")));
        assert_eq!(config.server.bind_addr, "127.0.0.1:9090");
    }

    #[test]
    fn test_rejects_zero_dimensions() {
        let err = MosaicConfig::from_toml_str("[grid]\nwidth = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_bad_palette_color() {
        let err = MosaicConfig::from_toml_str("[grid]\npalette = [\"#nothex\"]\n").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn test_rejects_empty_palette() {
        let err = MosaicConfig::from_toml_str("[grid]\npalette = []\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_sub_second_cooldown_kept() {
        let config = GridConfig::new(4, 4, Duration::from_millis(500));
        assert_eq!(config.cooldown_ms, 500);
        assert_eq!(config.cooldown(), Duration::from_millis(500));

        let config = GridConfig::new(4, 4, Duration::from_micros(1_500));
        assert_eq!(config.cooldown(), Duration::from_millis(2));
    }

    #[test]
    fn test_parse_millisecond_cooldown() {
        let config = MosaicConfig::from_toml_str("[grid]\ncooldown_ms = 750\n").unwrap();
        assert_eq!(config.grid.cooldown(), Duration::from_millis(750));
    }
}
