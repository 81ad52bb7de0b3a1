//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata_chunk::{EditSettings, MAX_SECTIONS};

use crate::error::ConfigError;

/// File name inside the config directory.
pub const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Vertical extent of the world.
    pub world: WorldConfig,
    /// Commit behaviour and execution context sizing.
    pub edit: EditConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// World shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorldConfig {
    /// Lowest section index (inclusive).
    pub min_section: i32,
    /// Highest section index (inclusive).
    pub max_section: i32,
}

/// Edit pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EditConfig {
    /// Capture an undo snapshot on every commit.
    pub create_snapshots: bool,
    /// Search the whole world for entities queued for removal that are not in
    /// the edited chunk. Entities removed that way cannot be restored by undo.
    pub remove_entity_from_world_on_chunk_fail: bool,
    /// Capacity of the side-effect context queue.
    pub side_effect_queue: usize,
    /// Capacity of the structural context queue.
    pub structural_queue: usize,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            min_section: -4,
            max_section: 19,
        }
    }
}

impl Default for EditConfig {
    fn default() -> Self {
        Self {
            create_snapshots: true,
            remove_entity_from_world_on_chunk_fail: false,
            side_effect_queue: 1024,
            structural_queue: 1024,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl WorldConfig {
    /// Checks that the range is non-empty and fits a chunk.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let span = i64::from(self.max_section) - i64::from(self.min_section);
        if span < 0 || span >= i64::from(MAX_SECTIONS) {
            return Err(ConfigError::InvalidBounds {
                min: self.min_section,
                max: self.max_section,
            });
        }
        Ok(())
    }
}

impl From<&EditConfig> for EditSettings {
    fn from(config: &EditConfig) -> Self {
        Self {
            create_snapshots: config.create_snapshots,
            remove_entity_from_world_on_chunk_fail: config.remove_entity_from_world_on_chunk_fail,
        }
    }
}

/// Platform config directory for Strata, if the platform has one.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("strata"))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(ConfigError::WriteError)
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join(CONFIG_FILE))?;
        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        ron::from_str(&contents).map_err(ConfigError::ParseError)
    }
}
