//! Cache limits and their configuration sources.
//!
//! [`CacheLimits`] is the runtime form used by [`crate::TieredCache`].
//! [`CacheConfig`] is the flat, user-facing form that can be loaded from a
//! TOML file or environment variables and converted into limits.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Budgets enforced by a single tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Entries larger than this are never stored
    pub max_entry_pixels: u64,
    /// Maximum cumulative pixel count of the whole tier
    pub max_total_pixels: u64,
}

impl TierLimits {
    pub fn new(max_entries: usize, max_entry_pixels: u64, max_total_pixels: u64) -> Self {
        Self {
            max_entries,
            max_entry_pixels,
            max_total_pixels,
        }
    }
}

/// Budgets for all three tiers plus the small/large boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLimits {
    pub small: TierLimits,
    pub large: TierLimits,
    pub negative: TierLimits,
    /// Images with at most this many pixels go to the small tier
    pub small_pixel_threshold: u64,
}

impl Default for CacheLimits {
    fn default() -> Self {
        CacheConfig::default().limits()
    }
}

/// User-facing cache configuration.
///
/// Each field corresponds to one administrative limit. Missing keys in a
/// file fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry count of the small (icon/thumbnail) tier
    pub small_max_entries: usize,
    /// Entry count of the large tier
    pub large_max_entries: usize,
    /// Entry count of the negative tier
    pub negative_max_entries: usize,
    /// Small/large boundary, also the per-entry ceiling of the small tier
    pub small_pixels: u64,
    /// Per-entry ceiling of the large and negative tiers
    pub max_entry_pixels: u64,
    /// Cumulative pixel ceiling of the large tier
    pub max_total_pixels: u64,
    /// Cumulative pixel ceiling of the small tier
    pub small_total_pixels: u64,
    /// Cumulative pixel ceiling of the negative tier
    pub negative_total_pixels: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            small_max_entries: 20,
            large_max_entries: 20,
            negative_max_entries: 100,
            small_pixels: 50 * 50,
            max_entry_pixels: 400 * 400,
            max_total_pixels: 1_000_000,
            small_total_pixels: 250_000,
            negative_total_pixels: 250_000,
        }
    }
}

const ENV_SMALL_MAX_ENTRIES: &str = "PIXCACHE_SMALL_MAX_ENTRIES";
const ENV_LARGE_MAX_ENTRIES: &str = "PIXCACHE_LARGE_MAX_ENTRIES";
const ENV_MAX_ENTRY_PIXELS: &str = "PIXCACHE_MAX_ENTRY_PIXELS";
const ENV_SMALL_PIXELS: &str = "PIXCACHE_SMALL_PIXELS";
const ENV_MAX_TOTAL_PIXELS: &str = "PIXCACHE_MAX_TOTAL_PIXELS";

impl CacheConfig {
    /// Convert into the runtime limits used by the tiered cache
    pub fn limits(&self) -> CacheLimits {
        CacheLimits {
            small: TierLimits::new(
                self.small_max_entries,
                self.small_pixels,
                self.small_total_pixels,
            ),
            large: TierLimits::new(
                self.large_max_entries,
                self.max_entry_pixels,
                self.max_total_pixels,
            ),
            negative: TierLimits::new(
                self.negative_max_entries,
                self.max_entry_pixels,
                self.negative_total_pixels,
            ),
            small_pixel_threshold: self.small_pixels,
        }
    }

    /// Returns the default configuration file location.
    ///
    /// - macOS: ~/Library/Application Support/pixcache/cache.toml
    /// - Linux: ~/.config/pixcache/cache.toml
    /// - Windows: %APPDATA%\pixcache\cache.toml
    pub fn default_path() -> PathBuf {
        match dirs::config_dir() {
            Some(dir) => dir.join("pixcache").join("cache.toml"),
            None => PathBuf::from("pixcache.toml"),
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PIXCACHE_SMALL_MAX_ENTRIES`: small tier entry count (default: 20)
    /// - `PIXCACHE_LARGE_MAX_ENTRIES`: large tier entry count (default: 20)
    /// - `PIXCACHE_MAX_ENTRY_PIXELS`: per-image pixel ceiling (default: 160000)
    /// - `PIXCACHE_SMALL_PIXELS`: small/large boundary (default: 2500)
    /// - `PIXCACHE_MAX_TOTAL_PIXELS`: large tier pixel ceiling (default: 1000000)
    ///
    /// # Errors
    /// Returns an error if any variable holds an unparsable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Applies environment variable overrides on top of `self`
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(v) = env_value(ENV_SMALL_MAX_ENTRIES)? {
            self.small_max_entries = v;
        }
        if let Some(v) = env_value(ENV_LARGE_MAX_ENTRIES)? {
            self.large_max_entries = v;
        }
        if let Some(v) = env_value(ENV_MAX_ENTRY_PIXELS)? {
            self.max_entry_pixels = v;
        }
        if let Some(v) = env_value(ENV_SMALL_PIXELS)? {
            self.small_pixels = v;
        }
        if let Some(v) = env_value(ENV_MAX_TOTAL_PIXELS)? {
            self.max_total_pixels = v;
        }
        Ok(self)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// small_max_entries = 20
    /// large_max_entries = 20
    /// small_pixels = 2500
    /// max_entry_pixels = 160000
    /// max_total_pixels = 1000000
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Parses configuration from a TOML string
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Loads the default file if present, then applies environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let base = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        base.with_env_overrides()
    }

    /// Saves configuration to a TOML file, creating parent directories
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Serializes the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }
}

fn env_value<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),

    /// I/O error reading or writing a configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed TOML
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration could not be rendered as TOML
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
