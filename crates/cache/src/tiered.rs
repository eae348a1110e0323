//! Three-tier image cache
//!
//! Images are classified by pixel count into a small tier (icons and
//! thumbnails) and a large tier; failure sentinels live in a separate
//! negative tier so they can never evict useful image data. All three tiers
//! sit behind one lock, which keeps lookups, inserts and evictions atomic
//! with respect to each other and guarantees that a key lives in at most one
//! tier at any instant.

use crate::tier::{EntryInfo, Tier, TierKind, TierStats};
use crate::{CacheKey, CacheLimits, CachedValue, DecodedImage, StatusCode};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Statistics across all tiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub small: TierStats,
    pub large: TierStats,
    pub negative: TierStats,

    /// Lookups that found nothing (including invalidated negative hits)
    pub misses: u64,

    /// Times the negative tier was discarded after a successful refresh
    pub negative_invalidations: u64,
}

impl CacheStats {
    /// Lookups answered by any tier
    pub fn hits(&self) -> u64 {
        self.small.hits + self.large.hits + self.negative.hits
    }

    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Entries across all tiers
    pub fn entry_count(&self) -> usize {
        self.small.entry_count + self.large.entry_count + self.negative.entry_count
    }
}

struct TierSet {
    small: Tier,
    large: Tier,
    negative: Tier,
    small_pixel_threshold: u64,
    /// Logical clock stamped on every insert
    clock: u64,
    misses: u64,
    negative_invalidations: u64,
}

impl TierSet {
    fn new(limits: CacheLimits) -> Self {
        Self {
            small: Tier::new(TierKind::Small, limits.small),
            large: Tier::new(TierKind::Large, limits.large),
            negative: Tier::new(TierKind::Negative, limits.negative),
            small_pixel_threshold: limits.small_pixel_threshold,
            clock: 0,
            misses: 0,
            negative_invalidations: 0,
        }
    }

    fn tier_mut(&mut self, kind: TierKind) -> &mut Tier {
        match kind {
            TierKind::Small => &mut self.small,
            TierKind::Large => &mut self.large,
            TierKind::Negative => &mut self.negative,
        }
    }

    fn tiers(&self) -> [&Tier; 3] {
        [&self.large, &self.small, &self.negative]
    }

    fn classify(&self, value: &CachedValue) -> TierKind {
        if value.is_negative() {
            TierKind::Negative
        } else if value.pixel_count() <= self.small_pixel_threshold {
            TierKind::Small
        } else {
            TierKind::Large
        }
    }

    fn limits(&self) -> CacheLimits {
        CacheLimits {
            small: self.small.limits(),
            large: self.large.limits(),
            negative: self.negative.limits(),
            small_pixel_threshold: self.small_pixel_threshold,
        }
    }

    fn apply(&mut self, limits: CacheLimits) {
        self.small.set_limits(limits.small);
        self.large.set_limits(limits.large);
        self.negative.set_limits(limits.negative);
        self.small_pixel_threshold = limits.small_pixel_threshold;
    }

    fn clear(&mut self) {
        self.small.clear();
        self.large.clear();
        self.negative.clear();
    }
}

/// Thread-safe three-tier image cache.
///
/// # Example
///
/// ```
/// use pixcache_cache::{CacheKey, CacheLimits, CachedValue, DecodedImage, StatusCode, TieredCache, TierKind};
/// use std::sync::Arc;
///
/// let cache = TieredCache::new(CacheLimits::default());
/// let key = CacheKey::new("https://example.com/avatar.png", 48);
///
/// // 48x48 is below the default 50x50 boundary, so it lands in the small tier
/// let image = Arc::new(DecodedImage::blank(48, 48));
/// assert_eq!(cache.put(key.clone(), CachedValue::Image(image)), Some(TierKind::Small));
///
/// let hit = cache.get(&key, StatusCode::OK).expect("cached");
/// assert_eq!(hit.image().unwrap().width(), 48);
/// ```
pub struct TieredCache {
    state: Mutex<TierSet>,
}

impl TieredCache {
    /// Create a cache with the given limits
    pub fn new(limits: CacheLimits) -> Self {
        Self {
            state: Mutex::new(TierSet::new(limits)),
        }
    }

    /// Look up `key`, checking the large, small and negative tiers in turn.
    ///
    /// `last_status` is the most recently observed fetch status. When the
    /// key is only found in the negative tier and `last_status` is a
    /// success, the whole negative tier is discarded and the lookup is a
    /// miss: negative results are considered stale once any successful
    /// refresh has been observed.
    pub fn get(&self, key: &CacheKey, last_status: StatusCode) -> Option<CachedValue> {
        let mut state = self.state.lock();

        if let Some(value) = state.large.get(key) {
            tracing::trace!(key = %key, tier = "large", "cache hit");
            return Some(value);
        }
        if let Some(value) = state.small.get(key) {
            tracing::trace!(key = %key, tier = "small", "cache hit");
            return Some(value);
        }
        if state.negative.contains(key) {
            if last_status.is_success() {
                let dropped = state.negative.len();
                state.negative.clear();
                state.negative_invalidations += 1;
                state.misses += 1;
                tracing::debug!(key = %key, dropped, "negative tier invalidated after successful refresh");
                return None;
            }
            tracing::trace!(key = %key, tier = "negative", "cache hit");
            return state.negative.get(key);
        }

        state.misses += 1;
        tracing::trace!(key = %key, "cache miss");
        None
    }

    /// Convenience lookup returning only positively cached images
    pub fn get_image(&self, key: &CacheKey) -> Option<Arc<DecodedImage>> {
        let mut state = self.state.lock();
        state
            .large
            .get(key)
            .or_else(|| state.small.get(key))
            .and_then(|value| match value {
                CachedValue::Image(image) => Some(image),
                CachedValue::Failed { .. } => None,
            })
    }

    /// Look up without touching LRU order, statistics or the negative tier
    pub fn peek(&self, key: &CacheKey) -> Option<CachedValue> {
        let state = self.state.lock();
        let found = state
            .tiers()
            .into_iter()
            .find_map(|tier| tier.peek(key).cloned());
        found
    }

    /// Store `value` under `key`.
    ///
    /// Negative values always go to the negative tier; images are classified
    /// by pixel count. The key is first removed from every other tier, then
    /// the target tier evicts until it is back within budget. Returns the
    /// tier the value was stored in, or `None` if it exceeded that tier's
    /// per-entry ceiling and was dropped.
    pub fn put(&self, key: CacheKey, value: CachedValue) -> Option<TierKind> {
        let mut state = self.state.lock();
        let target = state.classify(&value);

        for kind in [TierKind::Small, TierKind::Large, TierKind::Negative] {
            if kind != target {
                state.tier_mut(kind).remove(&key);
            }
        }

        state.clock += 1;
        let inserted_at = state.clock;
        let stored = state.tier_mut(target).insert(key, value, inserted_at);
        stored.then_some(target)
    }

    /// Store a decoded image, classified into the small or large tier
    pub fn put_image(&self, key: CacheKey, image: Arc<DecodedImage>) -> Option<TierKind> {
        self.put(key, CachedValue::Image(image))
    }

    /// Record a negative sentinel for `key`
    pub fn put_negative(&self, key: CacheKey, status: StatusCode) -> Option<TierKind> {
        self.put(key, CachedValue::failed(status))
    }

    /// Remove `key` from whichever tier holds it
    pub fn remove(&self, key: &CacheKey) -> Option<CachedValue> {
        let mut state = self.state.lock();
        for kind in [TierKind::Large, TierKind::Small, TierKind::Negative] {
            if let Some(value) = state.tier_mut(kind).remove(key) {
                return Some(value);
            }
        }
        None
    }

    /// Which tier holds `key`, with insertion metadata
    pub fn locate(&self, key: &CacheKey) -> Option<EntryInfo> {
        let state = self.state.lock();
        let found = state.tiers().into_iter().find_map(|tier| tier.info(key));
        found
    }

    /// Whether any tier holds `key`
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.locate(key).is_some()
    }

    /// Drop every entry in every tier
    pub fn clear(&self) {
        self.state.lock().clear();
    }

    /// Discard only the negative tier
    pub fn invalidate_negative(&self) {
        let mut state = self.state.lock();
        state.negative.clear();
        state.negative_invalidations += 1;
    }

    /// Current limits
    pub fn limits(&self) -> CacheLimits {
        self.state.lock().limits()
    }

    /// Replace all limits. Every tier is cleared immediately.
    pub fn reconfigure(&self, limits: CacheLimits) {
        let mut state = self.state.lock();
        state.apply(limits);
        tracing::info!(?limits, "cache limits reconfigured");
    }

    fn update(&self, change: impl FnOnce(&mut CacheLimits)) {
        let mut state = self.state.lock();
        let mut limits = state.limits();
        change(&mut limits);
        state.apply(limits);
        tracing::info!(?limits, "cache limits reconfigured");
    }

    /// Set the entry count of the small tier. Clears the cache.
    pub fn set_small_max_entries(&self, limit: usize) {
        self.update(|limits| limits.small.max_entries = limit);
    }

    /// Set the entry count of the large tier. Clears the cache.
    pub fn set_large_max_entries(&self, limit: usize) {
        self.update(|limits| limits.large.max_entries = limit);
    }

    /// Set the per-image pixel ceiling. Images above it are never cached.
    /// Clears the cache.
    pub fn set_max_entry_pixels(&self, pixels: u64) {
        self.update(|limits| {
            limits.large.max_entry_pixels = pixels;
            limits.negative.max_entry_pixels = pixels;
        });
    }

    /// Set the small/large boundary. Clears the cache.
    pub fn set_small_pixel_threshold(&self, pixels: u64) {
        self.update(|limits| {
            limits.small_pixel_threshold = pixels;
            limits.small.max_entry_pixels = pixels;
        });
    }

    /// Set the cumulative pixel ceiling of the large tier. Clears the cache.
    pub fn set_max_total_pixels(&self, pixels: u64) {
        self.update(|limits| limits.large.max_total_pixels = pixels);
    }

    /// Get current statistics
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            small: state.small.stats(),
            large: state.large.stats(),
            negative: state.negative.stats(),
            misses: state.misses,
            negative_invalidations: state.negative_invalidations,
        }
    }

    /// Number of entries in one tier
    pub fn tier_len(&self, kind: TierKind) -> usize {
        self.state.lock().tier_mut(kind).len()
    }

    /// Cumulative pixels held by one tier
    pub fn tier_pixels(&self, kind: TierKind) -> u64 {
        self.state.lock().tier_mut(kind).pixels_used()
    }

    /// Number of entries across all tiers
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.tiers().iter().map(|tier| tier.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TieredCache {
    fn default() -> Self {
        Self::new(CacheLimits::default())
    }
}
