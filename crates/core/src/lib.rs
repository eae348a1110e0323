//! pixcache core
//!
//! Image loading on top of the tiered memory cache. [`CacheEngine`] answers
//! requests from memory, coalesces concurrent misses for the same key into
//! a single fetch, and decodes with a power-of-two sample factor chosen by
//! [`plan_sample_size`].

pub mod buffers;
pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod planner;

pub use buffers::BufferPool;
pub use config::EngineConfig;
pub use decode::{DecodeOptions, Decoder, ImageCrateDecoder};
pub use engine::{
    CacheEngine, Completion, EngineStats, ImageRequest, Loaded, Outcome, Ticket,
};
pub use error::{DecodeError, ImageError};
pub use fetch::{FetchResponse, FetchSource, Fetcher, FileFetcher, ImageSource};
pub use planner::{plan_sample_size, planning_dimension};

pub use pixcache_cache::{
    CacheConfig, CacheKey, CacheLimits, CacheStats, CachedValue, DecodedImage, StatusCode,
    TierKind, TierLimits, TieredCache,
};
pub use pixcache_dispatch::DispatchStats;
