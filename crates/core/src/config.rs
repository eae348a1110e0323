//! Engine configuration

use pixcache_cache::{CacheConfig, CacheLimits};
use std::time::Duration;

/// Settings for a [`crate::CacheEngine`]
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Tier budgets
    pub limits: CacheLimits,

    /// How long a blocking request waits for a coalesced fetch.
    /// `None` waits indefinitely.
    pub join_timeout: Option<Duration>,

    /// Offer recycled pixel buffers to decoders that accept them
    pub reuse_buffers: bool,

    /// Upper bound on buffers kept for reuse
    pub buffer_pool_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: CacheLimits::default(),
            join_timeout: None,
            reuse_buffers: true,
            buffer_pool_capacity: 8,
        }
    }
}

impl EngineConfig {
    pub fn from_cache_config(config: &CacheConfig) -> Self {
        Self {
            limits: config.limits(),
            ..Self::default()
        }
    }

    pub fn with_limits(mut self, limits: CacheLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = Some(timeout);
        self
    }

    pub fn with_buffer_reuse(mut self, enabled: bool) -> Self {
        self.reuse_buffers = enabled;
        self
    }

    pub fn with_buffer_pool_capacity(mut self, capacity: usize) -> Self {
        self.buffer_pool_capacity = capacity;
        self
    }
}
