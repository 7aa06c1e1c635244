//! Gridder settings, read from TOML.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Lower bound on the memory budget for w-plane chunking, in MB.
pub const MIN_MEMORY_BUDGET_MB: usize = 4000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GridderConfig {
    /// Number of w-planes. Absent or 0 selects the number from the observed w
    /// range and the field of view.
    pub w_planes: Option<usize>,

    /// Grid padding factor.
    pub padding: f32,

    /// Memory (MB) available to hold w-planes while they are generated.
    /// Defaults to [`MIN_MEMORY_BUDGET_MB`].
    pub memory_budget_mb: Option<usize>,

    /// Worker threads for FFTs, kernel generation and gridding. Defaults to
    /// the size of the global rayon pool.
    pub threads: Option<usize>,

    /// Significant digits kept from pixel increments when matching image
    /// geometries against cached convolution functions.
    pub key_significant_digits: u32,

    /// Convolution-function cache to reload at start-up and save on request.
    pub cache_file: Option<PathBuf>,
}

impl Default for GridderConfig {
    fn default() -> Self {
        GridderConfig {
            w_planes: None,
            padding: 1.2,
            memory_budget_mb: None,
            threads: None,
            key_significant_digits: 6,
            cache_file: None,
        }
    }
}

impl GridderConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: GridderConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::IO {
            file: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.padding >= 1.0) || !self.padding.is_finite() {
            return Err(ConfigError::Padding(self.padding));
        }
        if self.threads == Some(0) {
            return Err(ConfigError::ZeroThreads);
        }
        if !(1..=15).contains(&self.key_significant_digits) {
            return Err(ConfigError::KeyDigits(self.key_significant_digits));
        }
        Ok(())
    }

    /// Requested w-plane count, `None` meaning automatic.
    pub fn user_w_planes(&self) -> Option<usize> {
        self.w_planes.filter(|&n| n > 0)
    }

    pub fn threads(&self) -> usize {
        self.threads.unwrap_or_else(rayon::current_num_threads).max(1)
    }

    pub fn memory_budget_mb(&self) -> usize {
        self.memory_budget_mb.unwrap_or(MIN_MEMORY_BUDGET_MB).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_default() {
        let config = GridderConfig::from_toml_str("").unwrap();
        assert_eq!(config, GridderConfig::default());
        assert_eq!(config.user_w_planes(), None);
        assert_eq!(config.memory_budget_mb(), MIN_MEMORY_BUDGET_MB);
        assert!(config.threads() >= 1);
    }

    #[test]
    fn parse_all_fields() {
        let config = GridderConfig::from_toml_str(
            r#"
            w_planes = 16
            padding = 1.5
            memory_budget_mb = 64
            threads = 2
            key_significant_digits = 8
            cache_file = "cf_cache.json"
            "#,
        )
        .unwrap();
        assert_eq!(config.user_w_planes(), Some(16));
        assert_eq!(config.padding, 1.5);
        assert_eq!(config.memory_budget_mb(), 64);
        assert_eq!(config.threads(), 2);
        assert_eq!(config.key_significant_digits, 8);
        assert_eq!(config.cache_file, Some(PathBuf::from("cf_cache.json")));
    }

    #[test]
    fn zero_planes_means_automatic() {
        let config = GridderConfig::from_toml_str("w_planes = 0").unwrap();
        assert_eq!(config.user_w_planes(), None);
    }

    #[test]
    fn invalid_configs() {
        assert!(matches!(
            GridderConfig::from_toml_str("padding = 0.5"),
            Err(ConfigError::Padding(_))
        ));
        assert!(matches!(
            GridderConfig::from_toml_str("threads = 0"),
            Err(ConfigError::ZeroThreads)
        ));
        assert!(matches!(
            GridderConfig::from_toml_str("key_significant_digits = 0"),
            Err(ConfigError::KeyDigits(0))
        ));
        assert!(matches!(
            GridderConfig::from_toml_str("oversampling = 4"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn missing_file() {
        let result = GridderConfig::from_file("/nonexistent/wproject.toml");
        assert!(matches!(result, Err(ConfigError::IO { .. })));
    }
}
