//! pixcache tiered image cache
//!
//! In-memory cache for decoded images with pixel-budget LRU eviction, split
//! into small, large and negative tiers.

pub mod config;
mod image;
mod key;
mod status;
pub mod tier;
pub mod tiered;

pub use config::{CacheConfig, CacheLimits, ConfigError, TierLimits};
pub use image::{CachedValue, DecodedImage};
pub use key::CacheKey;
pub use status::StatusCode;
pub use tier::{EntryInfo, TierKind, TierStats};
pub use tiered::{CacheStats, TieredCache};
