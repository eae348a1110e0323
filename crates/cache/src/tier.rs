//! Single cache tier with pixel-budget LRU eviction
//!
//! A tier holds decoded images (or negative sentinels) and enforces three
//! budgets: an entry count, a per-entry pixel ceiling and a cumulative pixel
//! ceiling. When an insert pushes the tier over budget, the least recently
//! used entries are evicted until both the count and the pixel total fit.

use crate::{CacheKey, CachedValue, TierLimits};
use lru::LruCache;
use serde::Serialize;
use std::fmt;

/// The three independent tiers of the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// Thumbnail and icon sized images
    Small,
    /// Everything above the small pixel threshold
    Large,
    /// Failure sentinels
    Negative,
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TierKind::Small => "small",
            TierKind::Large => "large",
            TierKind::Negative => "negative",
        };
        f.write_str(name)
    }
}

/// Statistics about a single tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    /// Number of entries currently held
    pub entry_count: usize,

    /// Cumulative pixel count of all entries
    pub pixels_used: u64,

    /// Configured cumulative pixel ceiling
    pub pixel_limit: u64,

    /// Configured entry count ceiling
    pub entry_limit: usize,

    /// Lookups answered by this tier
    pub hits: u64,

    /// Entries evicted to restore the budget
    pub evictions: u64,

    /// Inserts dropped because the entry exceeded the per-entry ceiling
    pub rejected: u64,
}

impl TierStats {
    /// Pixel utilization (0.0 to 1.0)
    pub fn pixel_utilization(&self) -> f64 {
        if self.pixel_limit == 0 {
            0.0
        } else {
            self.pixels_used as f64 / self.pixel_limit as f64
        }
    }
}

/// Metadata about a stored entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    /// Tier holding the entry
    pub tier: TierKind,

    /// Pixel cost of the entry, fixed at insertion
    pub pixels: u64,

    /// Logical clock value at insertion
    pub inserted_at: u64,
}

struct Entry {
    value: CachedValue,
    pixels: u64,
    inserted_at: u64,
}

/// Internal tier state. Callers serialize access through the owning cache.
pub(crate) struct Tier {
    kind: TierKind,
    entries: LruCache<CacheKey, Entry>,
    limits: TierLimits,
    pixels_used: u64,
    stats: TierStats,
}

impl Tier {
    pub(crate) fn new(kind: TierKind, limits: TierLimits) -> Self {
        Self {
            kind,
            entries: LruCache::unbounded(),
            limits,
            pixels_used: 0,
            stats: TierStats {
                pixel_limit: limits.max_total_pixels,
                entry_limit: limits.max_entries,
                ..Default::default()
            },
        }
    }

    pub(crate) fn kind(&self) -> TierKind {
        self.kind
    }

    pub(crate) fn limits(&self) -> TierLimits {
        self.limits
    }

    /// Look up an entry and mark it most recently used
    pub(crate) fn get(&mut self, key: &CacheKey) -> Option<CachedValue> {
        let value = self.entries.get(key).map(|entry| entry.value.clone())?;
        self.stats.hits += 1;
        Some(value)
    }

    /// Look up an entry without touching LRU order or statistics
    pub(crate) fn peek(&self, key: &CacheKey) -> Option<&CachedValue> {
        self.entries.peek(key).map(|entry| &entry.value)
    }

    pub(crate) fn info(&self, key: &CacheKey) -> Option<EntryInfo> {
        self.entries.peek(key).map(|entry| EntryInfo {
            tier: self.kind,
            pixels: entry.pixels,
            inserted_at: entry.inserted_at,
        })
    }

    pub(crate) fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains(key)
    }

    /// Store a value, then evict until the tier is back within budget.
    ///
    /// Any previous entry under the key is replaced. Returns `false` if the
    /// value exceeds the per-entry ceiling; the value is dropped and the key
    /// is left uncached.
    pub(crate) fn insert(&mut self, key: CacheKey, value: CachedValue, inserted_at: u64) -> bool {
        self.remove(&key);

        let pixels = value.pixel_count();
        if pixels > self.limits.max_entry_pixels {
            self.stats.rejected += 1;
            tracing::trace!(tier = %self.kind, key = %key, pixels, "entry exceeds per-entry ceiling");
            return false;
        }

        self.entries.put(
            key,
            Entry {
                value,
                pixels,
                inserted_at,
            },
        );
        self.pixels_used += pixels;
        self.evict_to_fit();
        self.sync_stats();
        true
    }

    pub(crate) fn remove(&mut self, key: &CacheKey) -> Option<CachedValue> {
        let entry = self.entries.pop(key)?;
        self.pixels_used = self.pixels_used.saturating_sub(entry.pixels);
        self.sync_stats();
        Some(entry.value)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.pixels_used = 0;
        self.sync_stats();
    }

    /// Replace the limits. Existing entries are discarded, not re-evaluated.
    pub(crate) fn set_limits(&mut self, limits: TierLimits) {
        self.limits = limits;
        self.stats.pixel_limit = limits.max_total_pixels;
        self.stats.entry_limit = limits.max_entries;
        self.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn pixels_used(&self) -> u64 {
        self.pixels_used
    }

    pub(crate) fn stats(&self) -> TierStats {
        self.stats
    }

    fn over_budget(&self) -> bool {
        self.pixels_used > self.limits.max_total_pixels
            || self.entries.len() > self.limits.max_entries
    }

    /// Evict least recently used entries until count and pixels both fit
    fn evict_to_fit(&mut self) {
        while self.over_budget() {
            let Some((key, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.pixels_used = self.pixels_used.saturating_sub(entry.pixels);
            self.stats.evictions += 1;
            tracing::trace!(tier = %self.kind, key = %key, pixels = entry.pixels, "evicted");
        }
    }

    fn sync_stats(&mut self) {
        self.stats.entry_count = self.entries.len();
        self.stats.pixels_used = self.pixels_used;
    }
}
