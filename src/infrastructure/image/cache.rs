//! Image cache façade.
//!
//! Deduplicates requests by cache key, schedules operations on a bounded
//! worker pool and exposes direct access to the disk tier.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, error, info};

use crate::domain::entities::{CacheKey, FetchOutcome, FetchRequest, OperationState};
use crate::domain::errors::{CacheError, CacheResult};
use crate::domain::ports::{HttpTransport, ImageCachePort};
use crate::domain::transform::Transform;
use crate::infrastructure::http::ReqwestTransport;

use super::disk_cache::{DEFAULT_MAX_CACHE_SIZE, DiskImageCache, default_cache_dir};
use super::in_flight::InFlightTable;
use super::memory_cache::{CacheStats, DEFAULT_CACHE_SIZE, MemoryImageCache};
use super::operation::{
    FetchOperation, OperationContext, OperationFactory, Subscriber, SubscriberId,
    TieredOperationFactory,
};

static SHARED: OnceLock<Arc<ImageCache>> = OnceLock::new();

/// Configuration for the image cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageCacheConfig {
    /// Maximum decoded images kept in memory.
    pub memory_capacity: usize,
    /// Maximum disk cache size in bytes.
    pub disk_cache_size: u64,
    /// Disk cache directory; the platform cache dir when unset.
    pub cache_dir: Option<PathBuf>,
    /// Maximum operations resolving at once.
    pub max_concurrent_operations: usize,
    /// Network request timeout in seconds.
    pub timeout_secs: u64,
    /// Global switch for the disk tier. When off, no request reads or writes disk.
    pub use_disk_cache: bool,
    /// User agent for network requests.
    pub user_agent: Option<String>,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: DEFAULT_CACHE_SIZE,
            disk_cache_size: DEFAULT_MAX_CACHE_SIZE,
            cache_dir: None,
            max_concurrent_operations: 4,
            timeout_secs: 30,
            use_disk_cache: true,
            user_agent: None,
        }
    }
}

impl ImageCacheConfig {
    /// Returns the configured cache directory or the platform default.
    #[must_use]
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }
}

#[derive(Debug)]
enum WorkerCommand {
    Run(Arc<FetchOperation>),
    CancelAll,
}

/// State for the background worker loop.
struct WorkerState {
    in_flight: Arc<InFlightTable>,
    semaphore: Arc<Semaphore>,
    request_rx: mpsc::UnboundedReceiver<WorkerCommand>,
}

/// One subscriber's attachment to an operation.
///
/// Cloneable so a request can be cancelled from a different task than the
/// one awaiting it.
#[derive(Clone)]
pub struct Subscription {
    operation: Arc<FetchOperation>,
    in_flight: Arc<InFlightTable>,
    id: SubscriberId,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", self.operation.key())
            .field("id", &self.id)
            .finish()
    }
}

impl Subscription {
    /// Withdraws this subscriber. It receives `Cancelled` unless it was
    /// already notified; the operation stops only if no subscribers remain.
    ///
    /// Returns false if there was nothing to withdraw.
    pub fn cancel(&self) -> bool {
        let cancelled = self.in_flight.detach(&self.operation, self.id);
        if cancelled {
            debug!(key = %self.operation.key(), subscriber = self.id, "Request cancelled");
        }
        cancelled
    }

    /// Returns the cache key being resolved.
    #[must_use]
    pub fn cache_key(&self) -> &CacheKey {
        self.operation.key()
    }

    /// Returns the state of the underlying operation.
    #[must_use]
    pub fn state(&self) -> OperationState {
        self.operation.state()
    }
}

/// Handle to a pending request. Dropping it does not cancel the request.
#[derive(Debug)]
pub struct FetchHandle {
    subscription: Subscription,
    receiver: oneshot::Receiver<FetchOutcome>,
}

impl FetchHandle {
    /// Withdraws this request; `wait` then yields `Cancelled`.
    pub fn cancel(&self) -> bool {
        self.subscription.cancel()
    }

    /// Returns the cache key being resolved.
    #[must_use]
    pub fn cache_key(&self) -> &CacheKey {
        self.subscription.cache_key()
    }

    /// Returns a cloneable subscription for cancelling from elsewhere.
    #[must_use]
    pub fn subscription(&self) -> Subscription {
        self.subscription.clone()
    }

    /// Waits for the outcome.
    pub async fn wait(self) -> FetchOutcome {
        self.receiver.await.unwrap_or(FetchOutcome::Cancelled)
    }
}

/// Coordinates memory, disk and network tiers for image requests.
pub struct ImageCache {
    memory_cache: Arc<MemoryImageCache>,
    disk_cache: Arc<DiskImageCache>,
    in_flight: Arc<InFlightTable>,
    factory: Arc<dyn OperationFactory>,
    request_tx: mpsc::UnboundedSender<WorkerCommand>,
    config: ImageCacheConfig,
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl ImageCache {
    /// Creates a cache over the given disk tier and transport.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(
        config: ImageCacheConfig,
        disk_cache: Arc<DiskImageCache>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let memory_cache = Arc::new(MemoryImageCache::new(config.memory_capacity));
        let factory = TieredOperationFactory::new(OperationContext {
            memory: memory_cache.clone(),
            disk: disk_cache.clone(),
            transport,
        });
        Self::with_factory(config, memory_cache, disk_cache, Arc::new(factory))
    }

    /// Creates a cache whose operations are built by `factory`.
    ///
    /// `memory_cache` and `disk_cache` back the lookup and disk utility
    /// methods; the factory decides which stores operations use.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn with_factory(
        config: ImageCacheConfig,
        memory_cache: Arc<MemoryImageCache>,
        disk_cache: Arc<DiskImageCache>,
        factory: Arc<dyn OperationFactory>,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(InFlightTable::new());

        let worker_state = WorkerState {
            in_flight: in_flight.clone(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_operations.max(1))),
            request_rx,
        };
        tokio::spawn(Self::run_worker_loop(worker_state));

        Self {
            memory_cache,
            disk_cache,
            in_flight,
            factory,
            request_tx,
            config,
        }
    }

    /// Opens the disk tier and HTTP transport described by `config`.
    ///
    /// # Errors
    /// Returns error if the cache directory or HTTP client cannot be created.
    pub async fn open(config: ImageCacheConfig) -> CacheResult<Self> {
        let disk_cache =
            DiskImageCache::new(config.resolved_cache_dir(), config.disk_cache_size).await?;
        let transport = ReqwestTransport::from_config(&config)?;
        info!(
            cache_dir = %disk_cache.cache_dir().display(),
            entries = disk_cache.len(),
            "Image cache opened"
        );
        Ok(Self::new(config, Arc::new(disk_cache), Arc::new(transport)))
    }

    /// Returns the process-wide cache, if one was installed.
    #[must_use]
    pub fn shared() -> Option<Arc<Self>> {
        SHARED.get().cloned()
    }

    /// Returns the process-wide cache, opening it with `config` on first use.
    ///
    /// # Errors
    /// Returns error if the cache must be opened and opening fails.
    pub async fn init_shared(config: ImageCacheConfig) -> CacheResult<Arc<Self>> {
        if let Some(cache) = SHARED.get() {
            return Ok(cache.clone());
        }
        let cache = Arc::new(Self::open(config).await?);
        Ok(SHARED.get_or_init(|| cache).clone())
    }

    /// Installs `cache` as the process-wide instance.
    ///
    /// # Errors
    /// Returns the cache back if one was already installed.
    pub fn install_shared(cache: Arc<Self>) -> Result<(), Arc<Self>> {
        SHARED.set(cache)
    }

    /// Worker loop that runs operations under the concurrency limit.
    async fn run_worker_loop(mut state: WorkerState) {
        let mut queue: VecDeque<Arc<FetchOperation>> = VecDeque::new();

        loop {
            tokio::select! {
                cmd = state.request_rx.recv() => {
                    match cmd {
                        Some(WorkerCommand::Run(operation)) => queue.push_front(operation),
                        Some(WorkerCommand::CancelAll) => queue.clear(),
                        None => break,
                    }
                }
                Ok(permit) = state.semaphore.clone().acquire_owned(), if !queue.is_empty() => {
                    let Some(operation) = queue.pop_front() else {
                        continue;
                    };
                    if operation.state().is_terminal() {
                        continue;
                    }

                    let in_flight = state.in_flight.clone();
                    tokio::spawn(async move {
                        let outcome = operation.resolve().await;
                        in_flight.finish(&operation, outcome);
                        drop(permit);
                    });
                }
            }
        }
        debug!("Image cache worker stopped");
    }

    /// Requests an image; the outcome is awaited through the handle.
    pub fn request(&self, request: FetchRequest) -> FetchHandle {
        let (tx, receiver) = oneshot::channel();
        let subscription = self.subscribe(request, Subscriber::Channel(tx));
        FetchHandle {
            subscription,
            receiver,
        }
    }

    /// Requests an image; `callback` runs once with the outcome on the task
    /// that resolved it, or on the cancelling caller's task.
    pub fn request_with_callback(
        &self,
        request: FetchRequest,
        callback: impl FnOnce(FetchOutcome) + Send + 'static,
    ) -> Subscription {
        self.subscribe(request, Subscriber::Callback(Box::new(callback)))
    }

    /// Requests several images at once.
    pub fn request_batch(&self, requests: impl IntoIterator<Item = FetchRequest>) -> Vec<FetchHandle> {
        requests.into_iter().map(|r| self.request(r)).collect()
    }

    /// Warms the caches for `requests` without waiting for them.
    pub fn prefetch(&self, requests: impl IntoIterator<Item = FetchRequest>) {
        let mut count = 0usize;
        for request in requests {
            self.request_with_callback(request, |_| {});
            count += 1;
        }
        debug!(count = count, "Prefetch scheduled");
    }

    /// Requests an image and waits for the outcome.
    pub async fn load(&self, request: FetchRequest) -> FetchOutcome {
        self.request(request).wait().await
    }

    fn subscribe(&self, mut request: FetchRequest, subscriber: Subscriber) -> Subscription {
        request.use_disk_cache &= self.config.use_disk_cache;

        let joined = self
            .in_flight
            .join_or_create(&request, subscriber, |key, request| {
                self.factory.create(key, request)
            });

        if joined.created
            && self
                .request_tx
                .send(WorkerCommand::Run(joined.operation.clone()))
                .is_err()
        {
            error!(key = %joined.operation.key(), "Image cache worker is gone");
            self.in_flight
                .finish(&joined.operation, FetchOutcome::Failed(CacheError::Shutdown));
        }

        Subscription {
            operation: joined.operation,
            in_flight: self.in_flight.clone(),
            id: joined.id,
        }
    }

    /// Returns the in-memory image for `(url, transform)` without starting
    /// an operation or touching recency.
    pub async fn cached_image(&self, url: &str, transform: &Transform) -> Option<Arc<DynamicImage>> {
        self.memory_cache
            .peek(&CacheKey::derive(url, transform))
            .await
    }

    /// Derives the cache key for `(url, transform)`.
    #[must_use]
    pub fn cache_key(url: &str, transform: &Transform) -> CacheKey {
        CacheKey::derive(url, transform)
    }

    /// Derives the disk file name for `(url, transform)`.
    #[must_use]
    pub fn cache_filename(url: &str, transform: &Transform) -> String {
        CacheKey::derive(url, transform).filename()
    }

    /// Returns where the disk entry for `(url, transform)` lives. The file
    /// may not exist.
    #[must_use]
    pub fn disk_cache_location(&self, url: &str, transform: &Transform) -> PathBuf {
        self.disk_cache.location(&CacheKey::derive(url, transform))
    }

    /// Reads raw cached bytes for `(url, transform)` without decoding.
    pub async fn read_disk_cache(&self, url: &str, transform: &Transform) -> Option<Vec<u8>> {
        self.disk_cache
            .get_bytes(&CacheKey::derive(url, transform))
            .await
    }

    /// Writes raw bytes for `(url, transform)` to the disk tier.
    ///
    /// Returns false if the write failed, or if `overwrite` is false and an
    /// entry already exists.
    pub async fn write_disk_cache(
        &self,
        bytes: &[u8],
        url: &str,
        transform: &Transform,
        overwrite: bool,
    ) -> bool {
        let key = CacheKey::derive(url, transform);
        match self.disk_cache.store(&key, bytes, overwrite).await {
            Ok(written) => written,
            Err(e) => {
                error!(key = %key, error = %e, "Failed to write disk cache entry");
                false
            }
        }
    }

    /// Returns memory tier statistics.
    #[must_use]
    pub fn memory_cache_stats(&self) -> CacheStats {
        self.memory_cache.stats()
    }

    /// Returns the number of operations in flight.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns true if an operation for `(url, transform)` is in flight.
    #[must_use]
    pub fn is_in_flight(&self, url: &str, transform: &Transform) -> bool {
        self.in_flight.contains(&CacheKey::derive(url, transform))
    }

    /// Cancels every in-flight operation; all their subscribers receive
    /// `Cancelled`. Returns the number of operations cancelled.
    pub fn clear_in_flight(&self) -> usize {
        if let Err(e) = self.request_tx.send(WorkerCommand::CancelAll) {
            error!("Failed to send cancel all request: {}", e);
        }
        self.in_flight.clear()
    }

    /// Empties the memory tier.
    pub async fn clear_memory(&self) {
        self.memory_cache.clear().await;
    }

    /// Empties the disk tier.
    ///
    /// # Errors
    /// Returns error if the cache directory cannot be read.
    pub async fn clear_disk(&self) -> CacheResult<()> {
        self.disk_cache.clear().await
    }

    /// Cancels everything in flight and empties both tiers.
    ///
    /// # Errors
    /// Returns error if the cache directory cannot be read.
    pub async fn clear_all(&self) -> CacheResult<()> {
        self.clear_in_flight();
        self.clear_memory().await;
        self.clear_disk().await
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ImageCacheConfig {
        &self.config
    }

    /// Returns the disk tier.
    #[must_use]
    pub const fn disk_cache(&self) -> &Arc<DiskImageCache> {
        &self.disk_cache
    }
}
