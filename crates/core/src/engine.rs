//! Cache engine
//!
//! Ties the tiered memory cache, the coalescing dispatcher and the
//! fetch/decode collaborators together. A request is answered from memory
//! when possible; otherwise the first requester for a key fetches and
//! decodes on its own thread while later requesters for the same key wait
//! for that single outcome.

use crate::buffers::BufferPool;
use crate::config::EngineConfig;
use crate::decode::{DecodeOptions, Decoder};
use crate::error::{DecodeError, ImageError};
use crate::fetch::{FetchSource, Fetcher};
use crate::planner::{plan_sample_size, planning_dimension};
use pixcache_cache::{
    CacheKey, CacheLimits, CacheStats, CachedValue, DecodedImage, StatusCode, TierKind,
    TieredCache,
};
use pixcache_dispatch::{
    CancellationToken, CoalescingDispatcher, DispatchStats, Role, WaitError, Waiter,
};
use serde::Serialize;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A request for one image at one target width
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    resource: Arc<str>,
    target_width: u32,
    use_width: bool,
    mem_cache: bool,
}

impl ImageRequest {
    /// Request the full-size image
    pub fn new(resource: impl Into<Arc<str>>) -> Self {
        Self {
            resource: resource.into(),
            target_width: 0,
            use_width: true,
            mem_cache: true,
        }
    }

    /// Downsample towards `width`. `0` keeps the full size.
    pub fn with_target_width(mut self, width: u32) -> Self {
        self.target_width = width;
        self
    }

    /// Plan against the width only (default) or the larger dimension
    pub fn with_use_width(mut self, use_width: bool) -> Self {
        self.use_width = use_width;
        self
    }

    /// Consult and populate the memory tiers (default)
    pub fn with_mem_cache(mut self, mem_cache: bool) -> Self {
        self.mem_cache = mem_cache;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn target_width(&self) -> u32 {
        self.target_width
    }

    pub fn use_width(&self) -> bool {
        self.use_width
    }

    pub fn mem_cache(&self) -> bool {
        self.mem_cache
    }

    /// Cache and coalescing key for this request
    pub fn key(&self) -> CacheKey {
        CacheKey::new(Arc::clone(&self.resource), self.target_width)
    }
}

/// A successfully produced image
#[derive(Debug, Clone)]
pub struct Loaded {
    pub image: Arc<DecodedImage>,
    pub source: FetchSource,
}

/// What every requester for a key receives
pub type Outcome = Result<Loaded, ImageError>;

/// Outcome delivered to a callback, tagged with the key it belongs to
#[derive(Debug, Clone)]
pub struct Completion {
    pub key: CacheKey,
    pub result: Outcome,
}

impl Completion {
    pub fn resource(&self) -> &str {
        self.key.resource()
    }

    pub fn image(&self) -> Option<&Arc<DecodedImage>> {
        self.result.as_ref().ok().map(|loaded| &loaded.image)
    }

    /// `OK` for an image, otherwise the failure's status code
    pub fn status(&self) -> StatusCode {
        match &self.result {
            Ok(_) => StatusCode::OK,
            Err(err) => err.status(),
        }
    }
}

/// Handle to a callback request. Cancelling detaches the callback; the
/// fetch itself still completes for the other requesters.
#[derive(Debug, Clone)]
pub struct Ticket {
    token: CancellationToken,
}

impl Ticket {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Requests received
    pub requests: u64,
    /// Requests answered with a cached image
    pub memory_hits: u64,
    /// Requests answered with a cached failure
    pub negative_hits: u64,
    /// Requests that joined a fetch already in flight
    pub coalesced: u64,
    /// Calls made to the fetcher
    pub fetches: u64,
    /// Fetch or decode failures
    pub failures: u64,
    /// Times the whole cache was cleared after running out of memory
    pub oom_clears: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    memory_hits: AtomicU64,
    negative_hits: AtomicU64,
    coalesced: AtomicU64,
    fetches: AtomicU64,
    failures: AtomicU64,
    oom_clears: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            requests: self.requests.load(Ordering::Relaxed),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            oom_clears: self.oom_clears.load(Ordering::Relaxed),
        }
    }
}

/// Coalescing key. Requests that bypass the memory tiers never share a
/// fetch with requests that populate them, so a cached result is never
/// lost to a joiner's different `mem_cache` setting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    key: CacheKey,
    mem_cache: bool,
}

impl PendingKey {
    fn of(key: &CacheKey, request: &ImageRequest) -> Self {
        Self {
            key: key.clone(),
            mem_cache: request.mem_cache(),
        }
    }
}

/// Completes the group with `Abandoned` if the starter unwinds before
/// producing an outcome.
struct StarterGuard<'a> {
    dispatcher: &'a CoalescingDispatcher<PendingKey, Outcome>,
    pending: &'a PendingKey,
    armed: bool,
}

impl Drop for StarterGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(key = %self.pending.key, "fetch abandoned by its starter");
            self.dispatcher.complete(self.pending, Err(ImageError::Abandoned));
        }
    }
}

/// Multi-tier image cache with request coalescing
pub struct CacheEngine {
    cache: TieredCache,
    dispatcher: CoalescingDispatcher<PendingKey, Outcome>,
    fetcher: Arc<dyn Fetcher>,
    decoder: Arc<dyn Decoder>,
    buffers: Option<BufferPool>,
    last_status: AtomicI32,
    join_timeout: Option<Duration>,
    counters: Counters,
}

impl CacheEngine {
    pub fn new(
        fetcher: impl Fetcher + 'static,
        decoder: impl Decoder + 'static,
        config: EngineConfig,
    ) -> Self {
        Self::from_parts(Arc::new(fetcher), Arc::new(decoder), config)
    }

    /// Build from shared collaborators
    pub fn from_parts(
        fetcher: Arc<dyn Fetcher>,
        decoder: Arc<dyn Decoder>,
        config: EngineConfig,
    ) -> Self {
        let buffers = match (config.reuse_buffers, decoder.supports_buffer_reuse()) {
            (true, true) => Some(BufferPool::new(config.buffer_pool_capacity)),
            (true, false) => {
                tracing::warn!("decoder cannot reuse buffers; buffer reuse disabled");
                None
            }
            (false, _) => None,
        };

        Self {
            cache: TieredCache::new(config.limits),
            dispatcher: CoalescingDispatcher::new(),
            fetcher,
            decoder,
            buffers,
            last_status: AtomicI32::new(StatusCode::OK.code()),
            join_timeout: config.join_timeout,
            counters: Counters::default(),
        }
    }

    /// Get an image, blocking until it is available.
    ///
    /// Answers from memory when possible. Otherwise either performs the
    /// fetch on this thread or waits for the requester that already is.
    pub fn request(&self, request: &ImageRequest) -> Outcome {
        Counters::bump(&self.counters.requests);
        if request.resource().is_empty() {
            return Err(ImageError::MissingResource);
        }

        let key = request.key();
        if let Some(outcome) = self.lookup(&key, request) {
            return outcome;
        }

        let (waiter, handle) = Waiter::channel();
        self.start_or_join(&key, request, waiter);

        let waited = match self.join_timeout {
            Some(timeout) => handle.wait_timeout(timeout),
            None => handle.wait(),
        };
        match waited {
            Ok(outcome) => outcome,
            Err(WaitError::TimedOut) => {
                let timeout = self.join_timeout;
                handle.cancel();
                tracing::warn!(key = %key, ?timeout, "gave up waiting for coalesced fetch");
                Err(ImageError::Timeout)
            }
            Err(WaitError::Closed) => Err(ImageError::Abandoned),
        }
    }

    /// Get an image and hand it to `callback`.
    ///
    /// The callback runs exactly once unless the returned ticket is
    /// cancelled first: immediately on a memory hit, on this thread if this
    /// request starts the fetch, or on the starter's thread if it joins one.
    pub fn request_with_callback(
        &self,
        request: &ImageRequest,
        callback: impl FnOnce(Completion) + Send + 'static,
    ) -> Ticket {
        Counters::bump(&self.counters.requests);
        let key = request.key();
        let token = CancellationToken::new();
        let ticket = Ticket {
            token: token.clone(),
        };

        if request.resource().is_empty() {
            callback(Completion {
                key,
                result: Err(ImageError::MissingResource),
            });
            return ticket;
        }

        if let Some(result) = self.lookup(&key, request) {
            callback(Completion { key, result });
            return ticket;
        }

        let tagged = key.clone();
        let waiter = Waiter::new(move |result| callback(Completion { key: tagged, result }))
            .with_token(token);
        self.start_or_join(&key, request, waiter);
        ticket
    }

    /// Positively cached image for `request`, without fetching
    pub fn memory_cached(&self, request: &ImageRequest) -> Option<Arc<DecodedImage>> {
        self.cache.get_image(&request.key())
    }

    /// Store an image decoded by the caller under `request`'s key.
    ///
    /// Used for bundled fallback and placeholder images. Returns the tier
    /// it landed in, or `None` if it exceeded that tier's entry ceiling.
    pub fn preload(&self, request: &ImageRequest, image: Arc<DecodedImage>) -> Option<TierKind> {
        let key = request.key();
        let tier = self.cache.put_image(key.clone(), image);
        tracing::debug!(key = %key, ?tier, "image preloaded");
        tier
    }

    /// Record the status of the most recent refresh.
    ///
    /// A success status invalidates the negative tier on its next hit.
    pub fn observe_status(&self, status: StatusCode) {
        self.last_status.store(status.code(), Ordering::Release);
    }

    pub fn last_status(&self) -> StatusCode {
        StatusCode(self.last_status.load(Ordering::Acquire))
    }

    /// Hand an image's pixels back for reuse by a later decode.
    ///
    /// Only possible once no one else, the cache included, holds the image.
    pub fn recycle(&self, image: Arc<DecodedImage>) -> bool {
        let Some(pool) = &self.buffers else {
            return false;
        };
        match Arc::try_unwrap(image) {
            Ok(image) => pool.put(image.into_pixels()),
            Err(_) => false,
        }
    }

    pub fn buffer_reuse_enabled(&self) -> bool {
        self.buffers.is_some()
    }

    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    /// Replace the tier budgets. Clears every tier.
    pub fn reconfigure(&self, limits: CacheLimits) {
        self.cache.reconfigure(limits);
    }

    /// Drop every cached entry
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Drop every pending group. Blocked requesters see `Abandoned`.
    pub fn clear_pending(&self) -> usize {
        self.dispatcher.clear()
    }

    pub fn is_pending(&self, request: &ImageRequest) -> bool {
        self.dispatcher
            .is_pending(&PendingKey::of(&request.key(), request))
    }

    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    fn lookup(&self, key: &CacheKey, request: &ImageRequest) -> Option<Outcome> {
        if !request.mem_cache() {
            return None;
        }
        match self.cache.get(key, self.last_status())? {
            CachedValue::Image(image) => {
                Counters::bump(&self.counters.memory_hits);
                Some(Ok(Loaded {
                    image,
                    source: FetchSource::Memory,
                }))
            }
            CachedValue::Failed { status } => {
                Counters::bump(&self.counters.negative_hits);
                Some(Err(ImageError::KnownBad { status }))
            }
        }
    }

    fn start_or_join(&self, key: &CacheKey, request: &ImageRequest, waiter: Waiter<Outcome>) {
        let pending = PendingKey::of(key, request);
        match self.dispatcher.request_or_join(pending.clone(), waiter) {
            Role::Joiner => {
                Counters::bump(&self.counters.coalesced);
                tracing::debug!(key = %key, "joined pending fetch");
            }
            Role::Starter => {
                let mut guard = StarterGuard {
                    dispatcher: &self.dispatcher,
                    pending: &pending,
                    armed: true,
                };
                let outcome = self.load(key, request);
                guard.armed = false;
                let delivered = self.dispatcher.complete(&pending, outcome);
                tracing::trace!(key = %key, delivered, "starter finished");
            }
        }
    }

    /// Fetch, decode and store. Runs outside every lock.
    fn load(&self, key: &CacheKey, request: &ImageRequest) -> Outcome {
        // Another starter may have finished between our lookup and joining
        if request.mem_cache() {
            if let Some(CachedValue::Image(image)) = self.cache.peek(key) {
                return Ok(Loaded {
                    image,
                    source: FetchSource::Memory,
                });
            }
        }

        Counters::bump(&self.counters.fetches);
        let response = self.fetcher.fetch(key.resource());

        if !response.status.is_success() {
            tracing::debug!(key = %key, status = %response.status, "fetch failed");
            return Err(self.fail(key, request, response.status, ImageError::Fetch {
                status: response.status,
            }));
        }

        let Some(source) = response.source else {
            let error = DecodeError::Malformed("fetch returned no payload".to_string());
            return Err(self.decode_failed(key, request, error));
        };

        let decoded = self.decoder.dimensions(&source).and_then(|(width, height)| {
            let dimension = planning_dimension(width, height, request.use_width());
            let factor = plan_sample_size(dimension, key.target_width());
            let mut options = DecodeOptions::new(factor);
            options.reuse = self.buffers.as_ref().and_then(BufferPool::take);
            tracing::debug!(key = %key, width, height, factor, "decoding");
            self.decoder.decode(&source, options)
        });

        match decoded {
            Ok(image) => {
                self.observe_status(StatusCode::OK);
                let image = Arc::new(image);
                if request.mem_cache() {
                    let tier = self.cache.put_image(key.clone(), Arc::clone(&image));
                    tracing::debug!(key = %key, ?tier, pixels = image.pixel_count(), "image cached");
                }
                Ok(Loaded {
                    image,
                    source: response.origin,
                })
            }
            Err(error) => Err(self.decode_failed(key, request, error)),
        }
    }

    fn decode_failed(&self, key: &CacheKey, request: &ImageRequest, error: DecodeError) -> ImageError {
        if error.is_out_of_memory() {
            Counters::bump(&self.counters.failures);
            Counters::bump(&self.counters.oom_clears);
            self.observe_status(StatusCode::TRANSFORM_ERROR);
            self.cache.clear();
            tracing::warn!(key = %key, "out of memory while decoding; memory cache cleared");
            return ImageError::OutOfMemory;
        }

        tracing::debug!(key = %key, %error, "decode failed");
        let status = StatusCode::TRANSFORM_ERROR;
        self.fail(key, request, status, ImageError::Decode { status, error })
    }

    fn fail(
        &self,
        key: &CacheKey,
        request: &ImageRequest,
        status: StatusCode,
        error: ImageError,
    ) -> ImageError {
        Counters::bump(&self.counters.failures);
        self.observe_status(status);
        if request.mem_cache() {
            self.cache.put_negative(key.clone(), status);
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchResponse, ImageSource};
    use std::sync::atomic::AtomicUsize;

    /// Decodes payloads of the form `WxH`
    struct TextDecoder;

    fn parse(source: &ImageSource) -> Result<(u32, u32), DecodeError> {
        let ImageSource::Bytes(bytes) = source else {
            return Err(DecodeError::Unsupported("files".into()));
        };
        let text = std::str::from_utf8(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        if text == "oom" {
            return Err(DecodeError::OutOfMemory);
        }
        let (w, h) = text
            .split_once('x')
            .ok_or_else(|| DecodeError::Malformed(text.to_string()))?;
        let w = w.parse().map_err(|_| DecodeError::Malformed(text.to_string()))?;
        let h = h.parse().map_err(|_| DecodeError::Malformed(text.to_string()))?;
        Ok((w, h))
    }

    impl Decoder for TextDecoder {
        fn dimensions(&self, source: &ImageSource) -> Result<(u32, u32), DecodeError> {
            parse(source)
        }

        fn decode(
            &self,
            source: &ImageSource,
            options: DecodeOptions,
        ) -> Result<DecodedImage, DecodeError> {
            let (w, h) = parse(source)?;
            let f = options.sample_factor;
            Ok(DecodedImage::blank((w / f).max(1), (h / f).max(1)))
        }
    }

    fn engine(payloads: &'static [(&'static str, &'static str)]) -> (CacheEngine, Arc<AtomicUsize>) {
        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fetches);
        let fetcher = move |resource: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            match payloads.iter().find(|(name, _)| *name == resource) {
                Some((_, body)) => FetchResponse::ok(
                    ImageSource::Bytes(body.as_bytes().to_vec()),
                    FetchSource::Network,
                ),
                None => FetchResponse::failed(StatusCode::NOT_FOUND, FetchSource::Network),
            }
        };
        let engine = CacheEngine::new(fetcher, TextDecoder, EngineConfig::default());
        (engine, fetches)
    }

    #[test]
    fn test_second_request_served_from_memory() {
        let (engine, fetches) = engine(&[("a", "40x40")]);
        let request = ImageRequest::new("a");

        let first = engine.request(&request).unwrap();
        assert_eq!(first.source, FetchSource::Network);

        let second = engine.request(&request).unwrap();
        assert_eq!(second.source, FetchSource::Memory);
        assert!(Arc::ptr_eq(&first.image, &second.image));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        let stats = engine.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.fetches, 1);
    }

    #[test]
    fn test_missing_resource() {
        let (engine, fetches) = engine(&[]);
        assert_eq!(
            engine.request(&ImageRequest::new("")).unwrap_err(),
            ImageError::MissingResource
        );
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_width_is_part_of_the_key() {
        let (engine, fetches) = engine(&[("a", "400x400")]);

        let full = engine.request(&ImageRequest::new("a")).unwrap();
        let thumb = engine
            .request(&ImageRequest::new("a").with_target_width(100))
            .unwrap();

        assert_eq!(full.image.width(), 400);
        assert_eq!(thumb.image.width(), 200);
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fetch_failure_cached_negatively() {
        let (engine, fetches) = engine(&[]);
        let request = ImageRequest::new("missing");

        assert_eq!(
            engine.request(&request).unwrap_err(),
            ImageError::Fetch {
                status: StatusCode::NOT_FOUND
            }
        );
        assert_eq!(engine.last_status(), StatusCode::NOT_FOUND);
        assert_eq!(
            engine.request(&request).unwrap_err(),
            ImageError::KnownBad {
                status: StatusCode::NOT_FOUND
            }
        );
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(engine.stats().negative_hits, 1);
    }

    #[test]
    fn test_mem_cache_disabled_always_fetches() {
        let (engine, fetches) = engine(&[("a", "10x10")]);
        let request = ImageRequest::new("a").with_mem_cache(false);

        engine.request(&request).unwrap();
        engine.request(&request).unwrap();

        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert!(engine.cache().is_empty());
    }

    #[test]
    fn test_completion_accessors() {
        let completion = Completion {
            key: CacheKey::new("a", 0),
            result: Err(ImageError::Fetch {
                status: StatusCode::NETWORK_ERROR,
            }),
        };
        assert_eq!(completion.resource(), "a");
        assert!(completion.image().is_none());
        assert_eq!(completion.status(), StatusCode::NETWORK_ERROR);
    }

    #[test]
    fn test_reuse_disabled_for_incapable_decoder() {
        let (engine, _) = engine(&[]);
        assert!(!engine.buffer_reuse_enabled());
        assert!(!engine.recycle(Arc::new(DecodedImage::blank(2, 2))));
    }
}
