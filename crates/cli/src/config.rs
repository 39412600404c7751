//! Persistent defaults for the `pipeshard` command.
//!
//! Values are resolved in this order:
//! 1. Command-line flags
//! 2. Config file (~/.config/pipeshard/config.toml)
//! 3. Built-in defaults

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Defaults stored in TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Model preset name (`7b`, `13b`, `30b`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Path to a `config.json` describing the model shape.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_config: Option<PathBuf>,

    /// Weight precision (fp32, fp16, bf16).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<String>,

    /// Number of pipeline stages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_stages: Option<usize>,

    /// Micro-batches in flight per stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub micro_batch_num: Option<usize>,

    /// Directory staging areas are created in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,

    /// Destination storage protocol (file, s3).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,

    /// Log filter used when `RUST_LOG` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl CliConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("pipeshard").join("config.toml"))
    }

    /// Load from the default path; a missing or unreadable file yields defaults.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)
    }

    /// Overlay the values set in `other`.
    pub fn merge(&mut self, other: &CliConfig) {
        fn take<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
            if other.is_some() {
                slot.clone_from(other);
            }
        }
        take(&mut self.model, &other.model);
        take(&mut self.model_config, &other.model_config);
        take(&mut self.precision, &other.precision);
        take(&mut self.num_stages, &other.num_stages);
        take(&mut self.micro_batch_num, &other.micro_batch_num);
        take(&mut self.staging_dir, &other.staging_dir);
        take(&mut self.storage, &other.storage);
        take(&mut self.log_level, &other.log_level);
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::NoConfigDir => write!(f, "No config directory available"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = CliConfig {
            model: Some("13b".to_string()),
            num_stages: Some(4),
            staging_dir: Some(PathBuf::from("/scratch/pipeshard")),
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        let loaded = CliConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("precision"));
    }

    #[test]
    fn merge_prefers_values_that_are_set() {
        let mut base = CliConfig {
            model: Some("7b".to_string()),
            num_stages: Some(2),
            ..Default::default()
        };
        base.merge(&CliConfig {
            num_stages: Some(8),
            precision: Some("bf16".to_string()),
            ..Default::default()
        });

        assert_eq!(base.model.as_deref(), Some("7b"));
        assert_eq!(base.num_stages, Some(8));
        assert_eq!(base.precision.as_deref(), Some("bf16"));
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "num_stages = \"many\"").unwrap();
        assert!(matches!(
            CliConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
