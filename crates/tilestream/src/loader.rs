//! The tile content loader.
//!
//! [`TileContentLoader`] turns overlapping consumer requests into one fetch
//! per key, caches decoded content and hands it to every waiting consumer
//! in priority order.
//!
//! All bookkeeping (cache, registrations, both queues and the in-flight
//! table) sits behind one mutex. Consumer callbacks, ranking closures,
//! diagnostics and fetches always run with the mutex released, so any of
//! them may call straight back into the loader. The release hook is the
//! one exception.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::cache::ContentCache;
use crate::config::LoaderConfig;
use crate::diagnostics::{DiagnosticsSink, TracingDiagnostics};
use crate::driver::{self, DriverHandle};
use crate::error::{Error, Result};
use crate::fetch::{Fetcher, RoutingFetcher};
use crate::format::{DecodedContent, FormatDispatcher};
use crate::key::ResourceKey;
use crate::registry::{RequestRegistry, deliver};
use crate::scheduler::{DeliveryTask, FetchTask, Ranking, TaskQueue, plan_batch};
use crate::types::{Callback, ConsumerId, Delivery, LoaderStats, PriorityFn, SiblingsFn};

/// One consumer's request for one key.
///
/// A request without a priority function is unconditional: it is fetched
/// and delivered before any ranked request. Use this for tileset manifests.
#[derive(Debug, Clone)]
pub struct TileRequest {
    pub key: ResourceKey,
    pub consumer: ConsumerId,
    pub ranking: Ranking,
    /// Withdraws the request at the next tick once fired.
    pub cancel: Option<CancellationToken>,
}

impl TileRequest {
    #[must_use]
    pub fn new(key: impl Into<ResourceKey>, consumer: ConsumerId) -> Self {
        Self {
            key: key.into(),
            consumer,
            ranking: Ranking::unconditional(),
            cancel: None,
        }
    }

    /// Rank by `priority() * depth`; smaller is sooner.
    ///
    /// Evaluated at every tick with the loader unlocked, so it may query
    /// the loader.
    #[must_use]
    pub fn priority(mut self, priority: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.ranking.priority = Some(Arc::new(priority) as PriorityFn);
        self
    }

    /// Keys to load in the same batch as this one.
    ///
    /// Like the priority, evaluated with the loader unlocked.
    #[must_use]
    pub fn siblings(
        mut self,
        siblings: impl Fn() -> Vec<ResourceKey> + Send + Sync + 'static,
    ) -> Self {
        self.ranking.siblings = Arc::new(siblings) as SiblingsFn;
        self
    }

    #[must_use]
    pub fn depth(mut self, depth: u32) -> Self {
        self.ranking.depth = depth;
        self
    }

    #[must_use]
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Builder for [`TileContentLoader`].
pub struct LoaderBuilder {
    config: LoaderConfig,
    formats: Option<FormatDispatcher>,
    fetcher: Option<Arc<dyn Fetcher>>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    release: Option<crate::cache::ReleaseHook<Arc<DecodedContent>>>,
}

impl LoaderBuilder {
    fn new() -> Self {
        Self {
            config: LoaderConfig::default(),
            formats: None,
            fetcher: None,
            diagnostics: Arc::new(TracingDiagnostics),
            release: None,
        }
    }

    #[must_use]
    pub fn config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the built-in formats.
    #[must_use]
    pub fn formats(mut self, formats: FormatDispatcher) -> Self {
        self.formats = Some(formats);
        self
    }

    /// Replace the default [`RoutingFetcher`].
    #[must_use]
    pub fn fetcher(mut self, fetcher: impl Fetcher + 'static) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    /// Replace the default [`TracingDiagnostics`].
    #[must_use]
    pub fn diagnostics(mut self, diagnostics: impl DiagnosticsSink + 'static) -> Self {
        self.diagnostics = Arc::new(diagnostics);
        self
    }

    /// Called for every cache entry that is evicted, replaced or cleared.
    ///
    /// The hook runs while the loader's lock is held and must not call
    /// back into the loader.
    #[must_use]
    pub fn release_hook(
        mut self,
        hook: impl Fn(&ResourceKey, &Arc<DecodedContent>) + Send + Sync + 'static,
    ) -> Self {
        self.release = Some(Box::new(hook));
        self
    }

    /// Build the loader.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the config is invalid.
    pub fn build(self) -> Result<TileContentLoader> {
        self.config.validate()?;

        let formats = self
            .formats
            .unwrap_or_else(|| FormatDispatcher::with_builtin(self.config.decode_options()));
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(RoutingFetcher::default()));
        let cache = match self.release {
            Some(hook) => ContentCache::with_release_hook(hook),
            None => ContentCache::new(),
        };

        Ok(TileContentLoader {
            shared: Arc::new(Shared {
                config: self.config,
                formats,
                fetcher,
                diagnostics: self.diagnostics,
                state: Mutex::new(State {
                    cache,
                    registry: RequestRegistry::new(),
                    fetch_queue: TaskQueue::new(),
                    delivery_queue: TaskQueue::new(),
                    in_flight: HashMap::new(),
                    next_generation: 0,
                }),
            }),
        })
    }
}

/// Deduplicating, priority-scheduled loader for tile content.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct TileContentLoader {
    pub(crate) shared: Arc<Shared>,
}

pub(crate) struct Shared {
    config: LoaderConfig,
    formats: FormatDispatcher,
    fetcher: Arc<dyn Fetcher>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    state: Mutex<State>,
}

struct InFlight {
    cancel: CancellationToken,
    generation: u64,
    ranking: Ranking,
}

struct State {
    cache: ContentCache<Arc<DecodedContent>>,
    registry: RequestRegistry,
    fetch_queue: TaskQueue<FetchTask>,
    delivery_queue: TaskQueue<DeliveryTask>,
    in_flight: HashMap<ResourceKey, InFlight>,
    next_generation: u64,
}

/// A consumer removed at a tick because its cancel token fired.
struct Swept {
    key: ResourceKey,
    callback: Callback,
    aborted: bool,
}

impl State {
    fn enqueue_fetch(&mut self, key: ResourceKey, ranking: Ranking) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.fetch_queue.push(FetchTask {
            key,
            ranking,
            cancel: CancellationToken::new(),
            generation,
        });
    }

    fn enqueue_delivery(&mut self, key: ResourceKey, ranking: Ranking) {
        if !self.delivery_queue.contains(&key) {
            self.delivery_queue.push(DeliveryTask { key, ranking });
        }
    }

    fn free_fetch_slots(&self, batch_size: usize) -> usize {
        batch_size.saturating_sub(self.in_flight.len())
    }

    fn fetch_pending(&self, key: &ResourceKey) -> bool {
        self.in_flight.contains_key(key) || self.fetch_queue.contains(key)
    }

    /// Drop all work for `key` once nobody waits on it.
    ///
    /// Returns whether an in-flight fetch was aborted.
    fn abandon_if_orphaned(&mut self, key: &ResourceKey) -> bool {
        if self.registry.is_live(key) {
            return false;
        }
        self.fetch_queue.remove(key);
        self.delivery_queue.remove(key);
        match self.in_flight.remove(key) {
            Some(flight) => {
                flight.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn sweep_cancelled(&mut self) -> Vec<Swept> {
        let swept = self.registry.sweep_cancelled();
        swept
            .into_iter()
            .map(|(key, callback)| {
                let aborted = self.abandon_if_orphaned(&key);
                Swept {
                    key,
                    callback,
                    aborted,
                }
            })
            .collect()
    }
}

impl TileContentLoader {
    #[must_use]
    pub fn builder() -> LoaderBuilder {
        LoaderBuilder::new()
    }

    /// Create a loader with `config` and every other collaborator at its
    /// default.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the config is invalid.
    pub fn new(config: LoaderConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    #[must_use]
    pub fn config(&self) -> &LoaderConfig {
        &self.shared.config
    }

    /// Register `request` and arrange for `on_complete` to be called once
    /// with its outcome.
    ///
    /// A cached key is delivered at the next delivery tick. An uncached key
    /// is fetched at a fetch tick unless another consumer's fetch is
    /// already pending.
    ///
    /// # Errors
    ///
    /// - [`Error::Dispatch`] if no format supports the key.
    /// - [`Error::DuplicateRegistration`] if the consumer already waits on
    ///   the key.
    ///
    /// On error `on_complete` is dropped without being called.
    pub fn request(
        &self,
        request: TileRequest,
        on_complete: impl FnOnce(Delivery) + Send + 'static,
    ) -> Result<()> {
        let TileRequest {
            key,
            consumer,
            ranking,
            cancel,
        } = request;

        self.shared.formats.dispatch(&key)?;

        let mut state = self.shared.state.lock();
        let already_cached = state.cache.contains(&key);
        let registered = state.registry.register(
            &key,
            consumer,
            Box::new(on_complete),
            cancel,
            already_cached,
        )?;

        if registered.already_cached {
            tracing::debug!(key = %key, consumer = %consumer, "cache hit");
            state.enqueue_delivery(key, ranking);
        } else if registered.is_first_consumer {
            tracing::debug!(key = %key, consumer = %consumer, "queued fetch");
            state.enqueue_fetch(key, ranking);
        }

        Ok(())
    }

    /// Like [`TileContentLoader::request`], but returns a receiver for the
    /// delivery instead of taking a callback.
    ///
    /// # Errors
    ///
    /// As [`TileContentLoader::request`].
    pub fn request_async(&self, request: TileRequest) -> Result<oneshot::Receiver<Delivery>> {
        let (tx, rx) = oneshot::channel();
        self.request(request, move |delivery| {
            let _ = tx.send(delivery);
        })?;
        Ok(rx)
    }

    /// Withdraw `consumer`'s request for `key`.
    ///
    /// The consumer's callback receives [`Delivery::Cancelled`]. If it was
    /// the last consumer, queued work for the key is dropped and an
    /// in-flight fetch is aborted. Returns false if the consumer was not
    /// waiting on the key.
    pub fn invalidate(&self, key: &ResourceKey, consumer: ConsumerId) -> bool {
        let (callback, aborted) = {
            let mut state = self.shared.state.lock();
            let Some(callback) = state.registry.unregister(key, consumer) else {
                return false;
            };
            (callback, state.abandon_if_orphaned(key))
        };

        self.shared.diagnostics.cancelled(key, aborted);
        callback(Delivery::Cancelled);
        true
    }

    /// Start as many queued fetches as there are free slots.
    ///
    /// Must be called from within a tokio runtime. Returns the number of
    /// fetches started.
    pub fn tick_fetch(&self) -> usize {
        let (swept, candidates, free) = {
            let mut state = self.shared.state.lock();
            let swept = state.sweep_cancelled();
            let free = state.free_fetch_slots(self.shared.config.batch_size);
            let candidates = if free > 0 {
                state.fetch_queue.candidates()
            } else {
                Vec::new()
            };
            (swept, candidates, free)
        };

        self.notify_swept(swept);

        // Ranking closures may call back into the loader.
        let plan = plan_batch(&candidates, free);
        if plan.is_empty() {
            return 0;
        }

        let batch = {
            let mut state = self.shared.state.lock();
            let free = state.free_fetch_slots(self.shared.config.batch_size);
            let batch = state.fetch_queue.take_planned(&plan, free);
            for task in &batch {
                state.in_flight.insert(
                    task.key.clone(),
                    InFlight {
                        cancel: task.cancel.clone(),
                        generation: task.generation,
                        ranking: task.ranking.clone(),
                    },
                );
            }
            batch
        };

        let started = batch.len();
        if started > 0 {
            tracing::debug!(started, "fetch tick");
        }
        for task in batch {
            tokio::spawn(run_fetch(Arc::clone(&self.shared), task));
        }
        started
    }

    /// Deliver the next batch of cached content to its consumers, then
    /// evict unwanted entries above the cache size.
    ///
    /// Returns the number of delivery tasks processed.
    pub fn tick_delivery(&self) -> usize {
        let (swept, candidates) = {
            let mut state = self.shared.state.lock();
            (state.sweep_cancelled(), state.delivery_queue.candidates())
        };

        self.notify_swept(swept);

        let plan = plan_batch(&candidates, usize::MAX);

        let (deliveries, processed) = {
            let mut state = self.shared.state.lock();
            let batch = state.delivery_queue.take_planned(&plan, usize::MAX);
            let processed = batch.len();

            let mut deliveries = Vec::with_capacity(batch.len());
            for task in batch {
                if let Some(content) = state.cache.get(&task.key).cloned() {
                    let callbacks = state.registry.take(&task.key);
                    deliveries.push((callbacks, content));
                } else if state.registry.is_live(&task.key) && !state.fetch_pending(&task.key) {
                    // Cleared from under its consumers; load it again.
                    state.enqueue_fetch(task.key, task.ranking);
                }
            }

            let State {
                cache, registry, ..
            } = &mut *state;
            let evicted = cache.evict_excess(self.shared.config.cache_size, |key| {
                registry.is_live(key)
            });
            if evicted > 0 {
                tracing::debug!(evicted, remaining = cache.len(), "evicted");
            }

            (deliveries, processed)
        };

        for (callbacks, content) in deliveries {
            deliver(callbacks, &Delivery::Loaded(content));
        }
        processed
    }

    /// Release every cached entry.
    ///
    /// Consumers still waiting on a cleared key are served by a fresh
    /// fetch.
    pub fn clear_cache(&self) {
        self.shared.state.lock().cache.clear();
    }

    #[must_use]
    pub fn stats(&self) -> LoaderStats {
        let state = self.shared.state.lock();
        LoaderStats {
            cache_size: state.cache.len(),
            pending_fetches: state.fetch_queue.len(),
            in_flight_fetches: state.in_flight.len(),
            pending_deliveries: state.delivery_queue.len(),
            registered_keys: state.registry.registered_keys().count(),
            supported_formats: self.shared.formats.supported_formats(),
        }
    }

    /// Whether the loader has no queued, in-flight or undelivered work.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        state.fetch_queue.is_empty()
            && state.in_flight.is_empty()
            && state.delivery_queue.is_empty()
    }

    pub(crate) fn has_pending_deliveries(&self) -> bool {
        !self.shared.state.lock().delivery_queue.is_empty()
    }

    /// Run the fetch and delivery ticks periodically on the current tokio
    /// runtime until the returned handle is dropped.
    #[must_use = "dropping the handle stops the drivers"]
    pub fn spawn_drivers(&self) -> DriverHandle {
        driver::spawn(self)
    }

    fn notify_swept(&self, swept: Vec<Swept>) {
        for Swept {
            key,
            callback,
            aborted,
        } in swept
        {
            self.shared.diagnostics.cancelled(&key, aborted);
            callback(Delivery::Cancelled);
        }
    }
}

impl std::fmt::Debug for TileContentLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileContentLoader")
            .field("config", &self.shared.config)
            .field("formats", &self.shared.formats)
            .finish_non_exhaustive()
    }
}

async fn run_fetch(shared: Arc<Shared>, task: FetchTask) {
    let FetchTask {
        key,
        cancel,
        generation,
        ..
    } = task;

    let result = tokio::select! {
        () = cancel.cancelled() => {
            tracing::debug!(key = %key, "fetch aborted");
            return;
        }
        result = load(&shared, &key) => result,
    };

    complete(&shared, &key, generation, result);
}

async fn load(shared: &Shared, key: &ResourceKey) -> Result<DecodedContent> {
    let format = shared.formats.dispatch(key)?;
    let bytes = shared.fetcher.fetch(key).await?;

    let owned_key = key.clone();
    tokio::task::spawn_blocking(move || format.load(&owned_key, bytes))
        .await
        .map_err(|e| {
            if e.is_cancelled() {
                Error::Cancelled {
                    key: key.to_string(),
                }
            } else {
                Error::Fetch {
                    key: key.to_string(),
                    message: format!("decode task failed: {e}"),
                }
            }
        })?
}

fn complete(
    shared: &Shared,
    key: &ResourceKey,
    generation: u64,
    result: Result<DecodedContent>,
) {
    let outcome = {
        let mut state = shared.state.lock();
        match state.in_flight.get(key) {
            Some(flight) if flight.generation == generation => {}
            // Superseded or abandoned while in flight.
            _ => return,
        }
        let Some(flight) = state.in_flight.remove(key) else {
            return;
        };

        match result {
            Ok(content) => {
                let content = Arc::new(content);
                state.cache.put(key.clone(), Arc::clone(&content));
                state.enqueue_delivery(key.clone(), flight.ranking);
                Ok(content)
            }
            Err(error) => {
                state.delivery_queue.remove(key);
                Err((error, state.registry.take(key)))
            }
        }
    };

    match outcome {
        Ok(content) => shared.diagnostics.loaded(key, &content),
        Err((error, callbacks)) => {
            shared.diagnostics.failed(key, &error);
            deliver(callbacks, &Delivery::Failed(Arc::new(error)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchFuture, MemoryFetcher};
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tilestream_decode::ContainerEncoder;

    fn tile(batch_length: u32) -> Bytes {
        ContainerEncoder::new(b"glTF\x02\x00\x00\x00".to_vec())
            .feature_json(json!({ "BATCH_LENGTH": batch_length }))
            .encode()
            .unwrap()
            .into()
    }

    /// A fetcher whose fetches never complete.
    struct Stalled;

    impl Fetcher for Stalled {
        fn fetch<'a>(&'a self, _key: &'a ResourceKey) -> FetchFuture<'a> {
            Box::pin(std::future::pending())
        }
    }

    fn loader_with(fetcher: impl Fetcher + 'static, config: LoaderConfig) -> TileContentLoader {
        TileContentLoader::builder()
            .config(config)
            .fetcher(fetcher)
            .build()
            .unwrap()
    }

    async fn settle(loader: &TileContentLoader) {
        for _ in 0..2000 {
            if loader.stats().in_flight_fetches == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("fetches did not settle");
    }

    fn take(rx: &mut oneshot::Receiver<Delivery>) -> Delivery {
        rx.try_recv().expect("delivery should have arrived")
    }

    #[tokio::test]
    async fn test_many_consumers_share_one_fetch() {
        let fetcher = Arc::new(MemoryFetcher::new().with("tiles/0.b3dm", tile(3)));
        let loader = loader_with(Arc::clone(&fetcher), LoaderConfig::default());

        let mut receivers: Vec<_> = (0..3u64)
            .map(|id| {
                let request = TileRequest::new("tiles/0.b3dm", ConsumerId(id))
                    .priority(|| 1.0)
                    .depth(1);
                loader.request_async(request).unwrap()
            })
            .collect();
        assert_eq!(loader.stats().pending_fetches, 1);

        assert_eq!(loader.tick_fetch(), 1);
        settle(&loader).await;
        assert_eq!(loader.stats().pending_deliveries, 1);
        assert_eq!(loader.tick_delivery(), 1);

        let contents: Vec<_> = receivers
            .iter_mut()
            .map(|rx| take(rx).content().cloned().unwrap())
            .collect();
        assert!(contents.iter().all(|c| Arc::ptr_eq(c, &contents[0])));
        assert_eq!(contents[0].as_tile().unwrap().batch_length(), 3);
        assert_eq!(fetcher.total_fetches(), 1);
        assert_eq!(loader.stats().registered_keys, 0);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_fetch() {
        let fetcher = Arc::new(MemoryFetcher::new().with("a.b3dm", tile(1)));
        let loader = loader_with(Arc::clone(&fetcher), LoaderConfig::default());

        let mut first = loader
            .request_async(TileRequest::new("a.b3dm", ConsumerId(1)))
            .unwrap();
        loader.tick_fetch();
        settle(&loader).await;
        loader.tick_delivery();
        assert!(take(&mut first).is_loaded());

        let mut second = loader
            .request_async(TileRequest::new("a.b3dm", ConsumerId(2)))
            .unwrap();
        let stats = loader.stats();
        assert_eq!(stats.pending_fetches, 0);
        assert_eq!(stats.pending_deliveries, 1);

        loader.tick_delivery();
        assert!(take(&mut second).is_loaded());
        assert_eq!(fetcher.total_fetches(), 1);
    }

    #[tokio::test]
    async fn test_query_strings_alias() {
        let fetcher = Arc::new(MemoryFetcher::new().with("a.b3dm", tile(1)));
        let loader = loader_with(Arc::clone(&fetcher), LoaderConfig::default());

        let mut a = loader
            .request_async(TileRequest::new("a.b3dm?v=1", ConsumerId(1)))
            .unwrap();
        let mut b = loader
            .request_async(TileRequest::new("./a.b3dm#x", ConsumerId(2)))
            .unwrap();
        loader.tick_fetch();
        settle(&loader).await;
        loader.tick_delivery();

        assert!(take(&mut a).is_loaded());
        assert!(take(&mut b).is_loaded());
        assert_eq!(fetcher.total_fetches(), 1);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter_and_is_not_cached() {
        let fetcher = Arc::new(MemoryFetcher::new().with("bad.b3dm", Bytes::from_static(b"junk")));
        let loader = loader_with(Arc::clone(&fetcher), LoaderConfig::default());

        let mut missing: Vec<_> = (0..2u64)
            .map(|id| {
                loader
                    .request_async(TileRequest::new("missing.b3dm", ConsumerId(id)))
                    .unwrap()
            })
            .collect();
        let mut bad = loader
            .request_async(TileRequest::new("bad.b3dm", ConsumerId(9)))
            .unwrap();

        loader.tick_fetch();
        settle(&loader).await;

        for rx in &mut missing {
            assert!(matches!(take(rx), Delivery::Failed(e) if matches!(*e, Error::Fetch { .. })));
        }
        assert!(matches!(take(&mut bad), Delivery::Failed(e) if matches!(*e, Error::Decode(_))));

        let stats = loader.stats();
        assert_eq!(stats.cache_size, 0);
        assert_eq!(stats.registered_keys, 0);
        assert_eq!(stats.pending_deliveries, 0);

        let _retry = loader
            .request_async(TileRequest::new("missing.b3dm", ConsumerId(0)))
            .unwrap();
        loader.tick_fetch();
        settle(&loader).await;
        assert_eq!(fetcher.fetch_count(&ResourceKey::new("missing.b3dm")), 2);
    }

    #[tokio::test]
    async fn test_invalidate_last_consumer_aborts_fetch() {
        let loader = loader_with(Stalled, LoaderConfig::default());
        let key = ResourceKey::new("a.b3dm");

        let mut first = loader
            .request_async(TileRequest::new("a.b3dm", ConsumerId(1)))
            .unwrap();
        let mut second = loader
            .request_async(TileRequest::new("a.b3dm", ConsumerId(2)))
            .unwrap();
        loader.tick_fetch();
        assert_eq!(loader.stats().in_flight_fetches, 1);

        assert!(loader.invalidate(&key, ConsumerId(1)));
        assert!(take(&mut first).is_cancelled());
        assert_eq!(loader.stats().in_flight_fetches, 1);

        assert!(loader.invalidate(&key, ConsumerId(2)));
        assert!(take(&mut second).is_cancelled());
        assert_eq!(loader.stats().in_flight_fetches, 0);
        assert!(loader.is_idle());

        assert!(!loader.invalidate(&key, ConsumerId(2)));
    }

    #[tokio::test]
    async fn test_invalidate_drops_queued_fetch() {
        let fetcher = Arc::new(MemoryFetcher::new().with("a.b3dm", tile(1)));
        let loader = loader_with(Arc::clone(&fetcher), LoaderConfig::default());

        let _rx = loader
            .request_async(TileRequest::new("a.b3dm", ConsumerId(1)))
            .unwrap();
        assert!(loader.invalidate(&ResourceKey::new("a.b3dm"), ConsumerId(1)));
        assert_eq!(loader.tick_fetch(), 0);
        assert_eq!(fetcher.total_fetches(), 0);
    }

    #[tokio::test]
    async fn test_cancel_token_is_swept_at_tick() {
        let loader = loader_with(Stalled, LoaderConfig::default());
        let token = CancellationToken::new();

        let mut rx = loader
            .request_async(TileRequest::new("a.b3dm", ConsumerId(1)).cancel_on(token.clone()))
            .unwrap();
        loader.tick_fetch();
        token.cancel();
        loader.tick_fetch();

        assert!(take(&mut rx).is_cancelled());
        assert!(loader.is_idle());
    }

    #[tokio::test]
    async fn test_request_errors() {
        let loader = loader_with(Stalled, LoaderConfig::default());

        assert!(matches!(
            loader.request(TileRequest::new("a.pnts", ConsumerId(1)), |_| {}),
            Err(Error::Dispatch { .. })
        ));

        loader
            .request(TileRequest::new("a.b3dm", ConsumerId(1)), |_| {})
            .unwrap();
        assert!(matches!(
            loader.request(TileRequest::new("a.b3dm", ConsumerId(1)), |_| {}),
            Err(Error::DuplicateRegistration { .. })
        ));
        assert_eq!(loader.stats().pending_fetches, 1);
    }

    #[tokio::test]
    async fn test_batch_size_bounds_in_flight() {
        let loader = loader_with(Stalled, LoaderConfig::default().with_batch_size(2));
        for (id, key) in (0u64..).zip(["a.b3dm", "b.b3dm", "c.b3dm"]) {
            loader
                .request(TileRequest::new(key, ConsumerId(id)), |_| {})
                .unwrap();
        }

        assert_eq!(loader.tick_fetch(), 2);
        assert_eq!(loader.tick_fetch(), 0);
        let stats = loader.stats();
        assert_eq!(stats.in_flight_fetches, 2);
        assert_eq!(stats.pending_fetches, 1);
    }

    #[tokio::test]
    async fn test_fetch_order_follows_priority() {
        let loader = loader_with(Stalled, LoaderConfig::default().with_batch_size(1));
        let far = TileRequest::new("far.b3dm", ConsumerId(1))
            .priority(|| 10.0)
            .depth(1);
        let near = TileRequest::new("near.b3dm", ConsumerId(1))
            .priority(|| 2.0)
            .depth(2);
        loader.request(far, |_| {}).unwrap();
        loader.request(near, |_| {}).unwrap();
        loader
            .request(TileRequest::new("tileset.json", ConsumerId(1)), |_| {})
            .unwrap();

        let in_flight = |key: &str| {
            let state = loader.shared.state.lock();
            state.in_flight.contains_key(&ResourceKey::new(key))
        };

        loader.tick_fetch();
        assert!(in_flight("tileset.json"));
        loader.invalidate(&ResourceKey::new("tileset.json"), ConsumerId(1));

        loader.tick_fetch();
        assert!(in_flight("near.b3dm"));
    }

    #[tokio::test]
    async fn test_eviction_spares_live_entries() {
        let released = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&released);
        let fetcher = MemoryFetcher::new()
            .with("a.b3dm", tile(1))
            .with("b.b3dm", tile(2));
        let loader = TileContentLoader::builder()
            .config(LoaderConfig::default().with_cache_size(1))
            .fetcher(fetcher)
            .release_hook(move |key, _| sink.lock().push(key.to_string()))
            .build()
            .unwrap();

        for key in ["a.b3dm", "b.b3dm"] {
            let _rx = loader
                .request_async(TileRequest::new(key, ConsumerId(1)))
                .unwrap();
            loader.tick_fetch();
            settle(&loader).await;
        }
        // Nothing is evicted while both entries still have waiters.
        assert_eq!(loader.stats().cache_size, 2);

        loader.tick_delivery();
        assert_eq!(loader.stats().cache_size, 1);
        assert_eq!(*released.lock(), ["a.b3dm"]);

        loader.clear_cache();
        assert_eq!(loader.stats().cache_size, 0);
        assert_eq!(*released.lock(), ["a.b3dm", "b.b3dm"]);
    }

    #[tokio::test]
    async fn test_cleared_entry_is_refetched_for_waiters() {
        let fetcher = Arc::new(MemoryFetcher::new().with("a.b3dm", tile(1)));
        let loader = loader_with(Arc::clone(&fetcher), LoaderConfig::default());

        let _first = loader
            .request_async(TileRequest::new("a.b3dm", ConsumerId(1)))
            .unwrap();
        loader.tick_fetch();
        settle(&loader).await;
        loader.tick_delivery();

        let mut second = loader
            .request_async(TileRequest::new("a.b3dm", ConsumerId(2)))
            .unwrap();
        loader.clear_cache();
        loader.tick_delivery();
        assert_eq!(loader.stats().pending_fetches, 1);

        loader.tick_fetch();
        settle(&loader).await;
        loader.tick_delivery();
        assert!(take(&mut second).is_loaded());
        assert_eq!(fetcher.total_fetches(), 2);
    }

    #[tokio::test]
    async fn test_callback_may_reenter_loader() {
        let fetcher = MemoryFetcher::new()
            .with("tileset.json", Bytes::from_static(br#"{"root":{}}"#))
            .with("child.b3dm", tile(1));
        let loader = loader_with(fetcher, LoaderConfig::default());

        let inner = loader.clone();
        loader
            .request(TileRequest::new("tileset.json", ConsumerId(1)), move |delivery| {
                assert!(delivery.is_loaded());
                inner
                    .request(TileRequest::new("child.b3dm", ConsumerId(1)), |_| {})
                    .unwrap();
            })
            .unwrap();

        loader.tick_fetch();
        settle(&loader).await;
        loader.tick_delivery();

        assert_eq!(loader.stats().pending_fetches, 1);
    }

    /// Run `tick` on another thread, failing if it does not return.
    fn tick_elsewhere(loader: &TileContentLoader, tick: fn(&TileContentLoader) -> usize) -> usize {
        let (tx, rx) = std::sync::mpsc::channel();
        let loader = loader.clone();
        let runtime = tokio::runtime::Handle::current();
        std::thread::spawn(move || {
            let _guard = runtime.enter();
            let _ = tx.send(tick(&loader));
        });
        rx.recv_timeout(Duration::from_secs(5))
            .expect("tick blocked on the loader lock")
    }

    #[tokio::test]
    async fn test_ranking_closures_may_query_loader() {
        let fetcher = MemoryFetcher::new().with("a.b3dm", tile(1));
        let loader = loader_with(fetcher, LoaderConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let (for_priority, for_siblings) = (loader.clone(), loader.clone());
        let (priority_calls, sibling_calls) = (Arc::clone(&calls), Arc::clone(&calls));
        let request = TileRequest::new("a.b3dm", ConsumerId(1))
            .priority(move || {
                priority_calls.fetch_add(1, Ordering::SeqCst);
                if for_priority.stats().cache_size == 0 {
                    1.0
                } else {
                    2.0
                }
            })
            .siblings(move || {
                sibling_calls.fetch_add(1, Ordering::SeqCst);
                if for_siblings.is_idle() {
                    Vec::new()
                } else {
                    vec![ResourceKey::new("b.b3dm")]
                }
            })
            .depth(1);
        let mut rx = loader.request_async(request).unwrap();

        assert_eq!(tick_elsewhere(&loader, TileContentLoader::tick_fetch), 1);
        settle(&loader).await;
        assert_eq!(tick_elsewhere(&loader, TileContentLoader::tick_delivery), 1);

        assert!(take(&mut rx).is_loaded());
        assert!(calls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_share_one_fetch() {
        const CONSUMERS: usize = 16;

        let fetcher = Arc::new(MemoryFetcher::new().with("shared.b3dm", tile(2)));
        let loader = loader_with(
            Arc::clone(&fetcher),
            LoaderConfig::default()
                .with_fetch_interval(Duration::from_millis(1))
                .with_delivery_interval(Duration::from_millis(1)),
        );
        let _drivers = loader.spawn_drivers();

        let barrier = Arc::new(std::sync::Barrier::new(CONSUMERS));
        let threads: Vec<_> = (0u64..)
            .take(CONSUMERS)
            .map(|id| {
                let loader = loader.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    loader
                        .request_async(TileRequest::new("shared.b3dm", ConsumerId(id)))
                        .unwrap()
                })
            })
            .collect();
        let receivers: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        let mut delivered = 0;
        for rx in receivers {
            let delivery = tokio::time::timeout(Duration::from_secs(5), rx)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(delivery.content().unwrap().as_tile().unwrap().batch_length(), 2);
            delivered += 1;
        }

        assert_eq!(delivered, CONSUMERS);
        assert_eq!(fetcher.total_fetches(), 1);
    }

    #[tokio::test]
    async fn test_drivers_deliver() {
        let fetcher = MemoryFetcher::new().with("a.b3dm", tile(4));
        let loader = loader_with(
            fetcher,
            LoaderConfig::default()
                .with_fetch_interval(Duration::from_millis(1))
                .with_delivery_interval(Duration::from_millis(1)),
        );
        let _drivers = loader.spawn_drivers();

        let rx = loader
            .request_async(TileRequest::new("a.b3dm", ConsumerId(1)))
            .unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(delivery.content().unwrap().as_tile().unwrap().batch_length(), 4);
    }
}
