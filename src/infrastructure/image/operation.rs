//! A single deduplicated fetch: memory -> disk -> network.
//!
//! An operation is shared by every subscriber whose request derives the same
//! cache key. It is cancelled only when its last subscriber detaches; the
//! cancellation flag is checked before each tier and after each await, and
//! an in-progress download is dropped as soon as the flag flips.
//!
//! A refresh request joining a plain operation upgrades it: cached tiers
//! are skipped from then on and a download started without refresh is
//! restarted, so exactly one operation writes the caches for a key.

use std::sync::Arc;

use bytes::Bytes;
use image::DynamicImage;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};

use crate::domain::entities::{CacheKey, FetchOutcome, FetchRequest, ImageSource, OperationState};
use crate::domain::errors::{CacheError, CacheResult};
use crate::domain::ports::{HttpTransport, ImageCachePort};
use crate::domain::transform::Transform;

use super::disk_cache::DiskImageCache;

/// Identifies one subscriber within an operation.
pub type SubscriberId = u64;

/// Receiver of an operation's terminal outcome. Fired exactly once.
pub enum Subscriber {
    /// Outcome sent over a oneshot channel.
    Channel(oneshot::Sender<FetchOutcome>),
    /// Outcome passed to a callback, invoked on the task that finished the operation.
    Callback(Box<dyn FnOnce(FetchOutcome) + Send>),
}

impl Subscriber {
    pub(crate) fn deliver(self, outcome: FetchOutcome) {
        match self {
            Self::Channel(tx) => {
                // Receiver gone means the caller dropped its handle.
                let _ = tx.send(outcome);
            }
            Self::Callback(callback) => callback(outcome),
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel(_) => f.write_str("Subscriber::Channel"),
            Self::Callback(_) => f.write_str("Subscriber::Callback"),
        }
    }
}

/// Stores and transport shared by all operations.
#[derive(Clone)]
pub struct OperationContext {
    /// Decoded-image tier.
    pub memory: Arc<dyn ImageCachePort>,
    /// Raw-bytes tier.
    pub disk: Arc<DiskImageCache>,
    /// Network collaborator.
    pub transport: Arc<dyn HttpTransport>,
}

/// Creates operations for the cache façade.
///
/// Swapping the factory lets callers wrap or replace how operations are
/// built, e.g. to count creations or to route through different stores.
pub trait OperationFactory: Send + Sync {
    /// Builds the operation for `key`.
    fn create(&self, key: CacheKey, request: FetchRequest) -> FetchOperation;
}

/// Default factory: every operation walks the shared memory, disk and
/// network tiers.
pub struct TieredOperationFactory {
    context: OperationContext,
}

impl TieredOperationFactory {
    /// Creates a factory over the given tiers.
    #[must_use]
    pub const fn new(context: OperationContext) -> Self {
        Self { context }
    }
}

impl OperationFactory for TieredOperationFactory {
    fn create(&self, key: CacheKey, request: FetchRequest) -> FetchOperation {
        FetchOperation::new(key, request, self.context.clone())
    }
}

struct OperationInner {
    state: OperationState,
    subscribers: Vec<(SubscriberId, Subscriber)>,
    next_subscriber: SubscriberId,
    /// Set once `resolve` has settled on its outcome. No further subscribers
    /// or refresh upgrades are accepted.
    sealed: bool,
}

/// Result of removing one subscriber.
pub(crate) struct Detached {
    /// The removed subscriber, if it was still attached.
    pub subscriber: Option<Subscriber>,
    /// True if that was the last subscriber and the operation is now cancelled.
    pub operation_cancelled: bool,
}

/// Unit of work resolving one cache key.
pub struct FetchOperation {
    key: CacheKey,
    request: FetchRequest,
    context: OperationContext,
    inner: Mutex<OperationInner>,
    cancel: watch::Sender<bool>,
    refresh: watch::Sender<bool>,
}

impl std::fmt::Debug for FetchOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOperation")
            .field("key", &self.key)
            .field("refresh", &self.is_refresh())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl FetchOperation {
    /// Creates a pending operation with no subscribers.
    #[must_use]
    pub fn new(key: CacheKey, request: FetchRequest, context: OperationContext) -> Self {
        let (cancel, _) = watch::channel(false);
        let (refresh, _) = watch::channel(request.refresh);
        Self {
            key,
            request,
            context,
            inner: Mutex::new(OperationInner {
                state: OperationState::Pending,
                subscribers: Vec::new(),
                next_subscriber: 0,
                sealed: false,
            }),
            cancel,
            refresh,
        }
    }

    /// Returns the cache key this operation resolves.
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Returns the request that created this operation.
    #[must_use]
    pub const fn request(&self) -> &FetchRequest {
        &self.request
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> OperationState {
        self.inner.lock().state.clone()
    }

    /// Returns the number of attached subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Returns true once every subscriber has withdrawn.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Returns true if cached tiers are bypassed, either because the
    /// creating request asked for it or because a refresh joined later.
    #[must_use]
    pub fn is_refresh(&self) -> bool {
        *self.refresh.borrow()
    }

    /// Attaches a subscriber unless the operation already settled.
    /// With `refresh`, the operation is upgraded to bypass cached tiers.
    pub(crate) fn attach(
        &self,
        subscriber: Subscriber,
        refresh: bool,
    ) -> Result<SubscriberId, Subscriber> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() || inner.sealed {
            return Err(subscriber);
        }
        if refresh && !self.is_refresh() {
            self.refresh.send_replace(true);
            debug!(key = %self.key, "Operation upgraded to refresh");
        }
        Ok(Self::push_subscriber(&mut inner, subscriber))
    }

    /// Attaches the first subscriber of a freshly created operation.
    pub(crate) fn attach_initial(&self, subscriber: Subscriber) -> SubscriberId {
        Self::push_subscriber(&mut self.inner.lock(), subscriber)
    }

    fn push_subscriber(inner: &mut OperationInner, subscriber: Subscriber) -> SubscriberId {
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.push((id, subscriber));
        id
    }

    /// Removes one subscriber; cancels the operation if none remain.
    pub(crate) fn detach(&self, id: SubscriberId) -> Detached {
        let mut inner = self.inner.lock();
        let position = inner.subscribers.iter().position(|(sid, _)| *sid == id);
        let subscriber = position.map(|pos| inner.subscribers.remove(pos).1);

        let operation_cancelled = subscriber.is_some()
            && inner.subscribers.is_empty()
            && !inner.state.is_terminal();
        if operation_cancelled {
            inner.state = OperationState::Cancelled;
            self.cancel.send_replace(true);
            debug!(key = %self.key, "Last subscriber detached, cancelling operation");
        }

        Detached {
            subscriber,
            operation_cancelled,
        }
    }

    /// Moves to the terminal state for `outcome` and hands back the
    /// subscribers to notify. Returns `None` if already terminal.
    pub(crate) fn complete(&self, outcome: &FetchOutcome) -> Option<Vec<Subscriber>> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return None;
        }
        inner.state = OperationState::from_outcome(outcome);
        if outcome.is_cancelled() {
            self.cancel.send_replace(true);
        }
        Some(
            std::mem::take(&mut inner.subscribers)
                .into_iter()
                .map(|(_, s)| s)
                .collect(),
        )
    }

    fn transition(&self, tier: ImageSource) {
        let mut inner = self.inner.lock();
        if !inner.state.is_terminal() {
            inner.state = OperationState::Resolving(tier);
            trace!(key = %self.key, tier = %tier, "Resolving");
        }
    }

    /// Settles on `outcome` unless a refresh arrived after a walk that
    /// started without one. Returns false if the tiers must be walked again.
    fn seal(&self, outcome: &FetchOutcome, refresh_at_start: bool) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return true;
        }
        if !refresh_at_start && self.is_refresh() && !outcome.is_cancelled() {
            return false;
        }
        inner.sealed = true;
        true
    }

    async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    async fn refreshed(&self) {
        let mut rx = self.refresh.subscribe();
        let _ = rx.wait_for(|refresh| *refresh).await;
    }

    /// Walks the tiers and returns the outcome. Does not notify subscribers.
    pub async fn resolve(&self) -> FetchOutcome {
        loop {
            let refresh = self.is_refresh();
            if let Some(outcome) = self.walk_tiers(refresh).await
                && self.seal(&outcome, refresh)
            {
                return outcome;
            }
            debug!(key = %self.key, "Refresh requested while resolving, fetching again");
        }
    }

    /// Returns `None` when a refresh upgrade interrupted a plain walk.
    async fn walk_tiers(&self, refresh: bool) -> Option<FetchOutcome> {
        if !refresh {
            if self.is_cancelled() {
                return Some(FetchOutcome::Cancelled);
            }
            self.transition(ImageSource::MemoryCache);
            if let Some(outcome) = self.from_memory().await {
                return Some(outcome);
            }

            if self.request.use_disk_cache {
                if self.is_cancelled() {
                    return Some(FetchOutcome::Cancelled);
                }
                self.transition(ImageSource::DiskCache);
                if let Some(outcome) = self.from_disk().await {
                    return Some(outcome);
                }
            }
        }

        if self.is_cancelled() {
            return Some(FetchOutcome::Cancelled);
        }
        self.transition(ImageSource::Network);
        self.from_network(refresh).await
    }

    async fn from_memory(&self) -> Option<FetchOutcome> {
        let memory = &self.context.memory;
        if let Some(image) = memory.get(&self.key).await {
            debug!(key = %self.key, source = "memory", "Image loaded");
            return Some(FetchOutcome::SuccessFromMemoryCache(image));
        }

        // A decoded original lets us derive the transformed image without I/O.
        if self.request.transform.is_identity() {
            return None;
        }
        let original_key = CacheKey::derive(&self.request.url, &Transform::identity());
        let original = memory.peek(&original_key).await?;
        if self.is_cancelled() {
            return Some(FetchOutcome::Cancelled);
        }

        let transform = self.request.transform.clone();
        let derived = tokio::task::spawn_blocking(move || transform.apply_to_image(&original))
            .await
            .map_err(|e| warn!(key = %self.key, error = %e, "Transform task panicked"))
            .ok()?;
        let derived = Arc::new(derived);

        memory.put(self.key.clone(), derived.clone()).await;
        debug!(key = %self.key, source = "memory", "Derived image from cached original");
        Some(FetchOutcome::SuccessFromMemoryCache(derived))
    }

    async fn from_disk(&self) -> Option<FetchOutcome> {
        let bytes = self.context.disk.get_bytes(&self.key).await?;
        if self.is_cancelled() {
            return Some(FetchOutcome::Cancelled);
        }

        match self.apply_transform(Bytes::from(bytes)).await {
            Ok(image) => {
                self.context.memory.put(self.key.clone(), image.clone()).await;
                debug!(key = %self.key, source = "disk", "Image loaded");
                Some(FetchOutcome::SuccessFromDiskCache(image))
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "Ignoring unreadable disk cache entry");
                None
            }
        }
    }

    async fn from_network(&self, refresh: bool) -> Option<FetchOutcome> {
        let url = self.request.url.as_str();
        debug!(key = %self.key, url = %url, refresh = refresh, "Downloading image from network");

        let response = tokio::select! {
            biased;
            () = self.cancelled() => {
                debug!(key = %self.key, "Download aborted");
                return Some(FetchOutcome::Cancelled);
            }
            () = self.refreshed(), if !refresh => {
                debug!(key = %self.key, "Download superseded by refresh");
                return None;
            }
            response = self.context.transport.get(url) => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Download failed");
                return Some(FetchOutcome::Failed(e));
            }
        };

        if !response.is_success() {
            warn!(key = %self.key, status = response.status, "Download rejected");
            return Some(FetchOutcome::Failed(CacheError::HttpStatus {
                status: response.status,
                url: url.to_string(),
            }));
        }

        if self.is_cancelled() {
            return Some(FetchOutcome::Cancelled);
        }

        // From here on the result is committed to the caches even if every
        // subscriber detaches; only delivery is skipped.
        let body = response.body;
        let image = match self.apply_transform(body.clone()).await {
            Ok(image) => image,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Transform of downloaded image failed");
                return Some(FetchOutcome::Failed(e));
            }
        };

        // Bytes fetched before a refresh joined must not reach the caches.
        if !refresh && self.is_refresh() {
            return None;
        }

        if self.request.use_disk_cache
            && let Err(e) = self.context.disk.put_bytes(&self.key, &body).await
        {
            warn!(key = %self.key, error = %e, "Failed to cache to disk");
        }
        self.context.memory.put(self.key.clone(), image.clone()).await;

        debug!(key = %self.key, source = "network", "Image loaded");
        Some(FetchOutcome::SuccessFromUrl(image))
    }

    async fn apply_transform(&self, bytes: Bytes) -> CacheResult<Arc<DynamicImage>> {
        let transform = self.request.transform.clone();
        let name = transform.name();
        tokio::task::spawn_blocking(move || transform.apply_to_bytes(&bytes))
            .await
            .map_err(|e| CacheError::transform(name.as_str(), format!("transform task panicked: {e}")))?
            .map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::mocks::{StubResponse, StubTransport};
    use crate::domain::transform::filters::encode_png;
    use crate::infrastructure::image::memory_cache::MemoryImageCache;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    const URL: &str = "https://x/img.png";

    struct Fixture {
        memory: Arc<MemoryImageCache>,
        disk: Arc<DiskImageCache>,
        stub: Arc<StubTransport>,
        _dir: TempDir,
    }

    impl Fixture {
        async fn new(stub: StubTransport) -> Self {
            let dir = TempDir::new().unwrap();
            let disk = DiskImageCache::new(dir.path().to_path_buf(), 1024 * 1024)
                .await
                .unwrap();
            Self {
                memory: Arc::new(MemoryImageCache::new(10)),
                disk: Arc::new(disk),
                stub: Arc::new(stub),
                _dir: dir,
            }
        }

        fn operation(&self, request: FetchRequest) -> FetchOperation {
            let context = OperationContext {
                memory: self.memory.clone(),
                disk: self.disk.clone(),
                transport: self.stub.clone(),
            };
            TieredOperationFactory::new(context).create(request.cache_key(), request)
        }
    }

    fn png(color: [u8; 3]) -> Bytes {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb(color)));
        Bytes::from(encode_png(&img))
    }

    #[tokio::test]
    async fn test_network_success_populates_both_tiers() {
        let fx = Fixture::new(StubTransport::new()).await;
        fx.stub.set(URL, StubResponse::Body(png([9, 9, 9])));
        let request = FetchRequest::new(URL).with_transform(Transform::grayscale());
        let key = request.cache_key();
        let op = fx.operation(request);

        let outcome = op.resolve().await;

        assert_eq!(outcome.source(), Some(ImageSource::Network));
        assert!(fx.memory.contains(&key).await);
        assert!(fx.disk.contains(&key).await);
        assert_eq!(op.state(), OperationState::Resolving(ImageSource::Network));
    }

    #[tokio::test]
    async fn test_memory_hit_skips_io() {
        let fx = Fixture::new(StubTransport::new()).await;
        let request = FetchRequest::new(URL);
        fx.memory
            .put(request.cache_key(), Arc::new(DynamicImage::new_rgb8(2, 2)))
            .await;

        let outcome = fx.operation(request).resolve().await;

        assert_eq!(outcome.source(), Some(ImageSource::MemoryCache));
        assert_eq!(fx.stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_transformed_image_derived_from_cached_original() {
        let fx = Fixture::new(StubTransport::new()).await;
        let original = DynamicImage::ImageRgb8(RgbImage::from_pixel(6, 4, Rgb([1, 2, 3])));
        fx.memory
            .put(CacheKey::derive(URL, &Transform::identity()), Arc::new(original))
            .await;
        let request = FetchRequest::new(URL).with_transform(Transform::circular());
        let key = request.cache_key();

        let outcome = fx.operation(request).resolve().await;

        assert_eq!(outcome.source(), Some(ImageSource::MemoryCache));
        assert_eq!(outcome.image().unwrap().width(), 4);
        assert!(fx.memory.contains(&key).await);
        assert_eq!(fx.stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_disk_hit_populates_memory() {
        let fx = Fixture::new(StubTransport::new()).await;
        let request = FetchRequest::new(URL);
        let key = request.cache_key();
        fx.disk.put_bytes(&key, &png([5, 5, 5])).await.unwrap();

        let outcome = fx.operation(request).resolve().await;

        assert_eq!(outcome.source(), Some(ImageSource::DiskCache));
        assert!(fx.memory.contains(&key).await);
        assert_eq!(fx.stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_disk_entry_falls_through_and_is_replaced() {
        let fx = Fixture::new(StubTransport::new()).await;
        let valid = png([7, 7, 7]);
        fx.stub.set(URL, StubResponse::Body(valid.clone()));
        let request = FetchRequest::new(URL);
        let key = request.cache_key();
        fx.disk.put_bytes(&key, b"not an image").await.unwrap();

        let outcome = fx.operation(request).resolve().await;

        assert_eq!(outcome.source(), Some(ImageSource::Network));
        assert_eq!(fx.disk.get_bytes(&key).await.unwrap(), valid.to_vec());
    }

    #[tokio::test]
    async fn test_disk_tier_skipped_when_disabled() {
        let fx = Fixture::new(StubTransport::new()).await;
        fx.stub.set(URL, StubResponse::Body(png([1, 1, 1])));
        let request = FetchRequest::new(URL).with_disk_cache(false);
        let key = request.cache_key();
        let stale = png([2, 2, 2]);
        fx.disk.put_bytes(&key, &stale).await.unwrap();

        let outcome = fx.operation(request).resolve().await;

        assert_eq!(outcome.source(), Some(ImageSource::Network));
        assert_eq!(fx.disk.get_bytes(&key).await.unwrap(), stale.to_vec());
        assert!(fx.memory.contains(&key).await);
    }

    #[tokio::test]
    async fn test_refresh_ignores_cached_entries() {
        let fx = Fixture::new(StubTransport::new()).await;
        fx.stub.set(URL, StubResponse::Body(png([3, 3, 3])));
        let request = FetchRequest::new(URL).with_refresh(true);
        let key = request.cache_key();
        fx.memory
            .put(key.clone(), Arc::new(DynamicImage::new_rgb8(1, 1)))
            .await;
        fx.disk.put_bytes(&key, &png([4, 4, 4])).await.unwrap();

        let outcome = fx.operation(request).resolve().await;

        assert_eq!(outcome.source(), Some(ImageSource::Network));
        assert_eq!(fx.stub.calls(), 1);
        assert_eq!(fx.memory.peek(&key).await.unwrap().width(), 4);
    }

    #[tokio::test]
    async fn test_http_error_fails_without_caching() {
        let fx = Fixture::new(StubTransport::new()).await;
        fx.stub.set(URL, StubResponse::Status(500));
        let request = FetchRequest::new(URL);
        let key = request.cache_key();

        let outcome = fx.operation(request).resolve().await;

        assert!(matches!(
            outcome.error(),
            Some(CacheError::HttpStatus { status: 500, .. })
        ));
        assert!(!fx.memory.contains(&key).await);
        assert!(!fx.disk.contains(&key).await);
    }

    #[tokio::test]
    async fn test_undecodable_download_fails() {
        let fx = Fixture::new(StubTransport::new()).await;
        fx.stub
            .set(URL, StubResponse::Body(Bytes::from_static(b"<html>")));

        let outcome = fx.operation(FetchRequest::new(URL)).resolve().await;

        assert!(outcome.error().is_some_and(CacheError::is_decode));
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let fx = Fixture::new(StubTransport::new()).await;
        fx.stub.set(
            URL,
            StubResponse::Error(CacheError::Timeout { url: URL.into() }),
        );

        let outcome = fx.operation(FetchRequest::new(URL)).resolve().await;

        assert_eq!(
            outcome.error(),
            Some(&CacheError::Timeout { url: URL.into() })
        );
    }

    #[tokio::test]
    async fn test_detaching_last_subscriber_aborts_download() {
        let fx = Fixture::new(StubTransport::held()).await;
        fx.stub.set(URL, StubResponse::Body(png([1, 1, 1])));
        let op = Arc::new(fx.operation(FetchRequest::new(URL)));
        let id = op.attach_initial(Subscriber::Callback(Box::new(|_| {})));

        let task = tokio::spawn({
            let op = op.clone();
            async move { op.resolve().await }
        });
        fx.stub.wait_for_calls(1).await;

        let detached = op.detach(id);
        assert!(detached.subscriber.is_some());
        assert!(detached.operation_cancelled);

        let outcome = task.await.unwrap();
        assert!(outcome.is_cancelled());
        assert_eq!(op.state(), OperationState::Cancelled);

        fx.stub.release();
        tokio::task::yield_now().await;
        assert_eq!(fx.stub.completed(), 0);
    }

    #[tokio::test]
    async fn test_partial_detach_keeps_operation_alive() {
        let fx = Fixture::new(StubTransport::new()).await;
        let op = fx.operation(FetchRequest::new(URL));
        let first = op.attach_initial(Subscriber::Callback(Box::new(|_| {})));
        let _second = op
            .attach(Subscriber::Callback(Box::new(|_| {})), false)
            .unwrap();

        let detached = op.detach(first);

        assert!(detached.subscriber.is_some());
        assert!(!detached.operation_cancelled);
        assert!(!op.is_cancelled());
        assert_eq!(op.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_no_attach_after_completion() {
        let fx = Fixture::new(StubTransport::new()).await;
        let op = fx.operation(FetchRequest::new(URL));
        op.attach_initial(Subscriber::Callback(Box::new(|_| {})));

        let subscribers = op.complete(&FetchOutcome::Cancelled).unwrap();
        assert_eq!(subscribers.len(), 1);
        assert!(op.complete(&FetchOutcome::Cancelled).is_none());
        assert!(
            op.attach(Subscriber::Callback(Box::new(|_| {})), false)
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_refresh_upgrade_before_resolve_bypasses_memory() {
        let fx = Fixture::new(StubTransport::new()).await;
        fx.stub.set(URL, StubResponse::Body(png([8, 8, 8])));
        let request = FetchRequest::new(URL);
        let key = request.cache_key();
        fx.memory
            .put(key.clone(), Arc::new(DynamicImage::new_rgb8(1, 1)))
            .await;
        let op = fx.operation(request);
        op.attach_initial(Subscriber::Callback(Box::new(|_| {})));

        op.attach(Subscriber::Callback(Box::new(|_| {})), true)
            .unwrap();
        assert!(op.is_refresh());
        let outcome = op.resolve().await;

        assert_eq!(outcome.source(), Some(ImageSource::Network));
        assert_eq!(fx.stub.calls(), 1);
        assert_eq!(fx.memory.peek(&key).await.unwrap().width(), 4);
    }

    #[tokio::test]
    async fn test_refresh_upgrade_restarts_plain_download() {
        let fx = Fixture::new(StubTransport::held()).await;
        fx.stub.set(URL, StubResponse::Body(png([1, 1, 1])));
        let op = Arc::new(fx.operation(FetchRequest::new(URL)));
        op.attach_initial(Subscriber::Callback(Box::new(|_| {})));

        let task = tokio::spawn({
            let op = op.clone();
            async move { op.resolve().await }
        });
        fx.stub.wait_for_calls(1).await;

        fx.stub.set(URL, StubResponse::Body(png([200, 200, 200])));
        op.attach(Subscriber::Callback(Box::new(|_| {})), true)
            .unwrap();
        fx.stub.wait_for_calls(2).await;
        fx.stub.release();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.source(), Some(ImageSource::Network));
        assert_eq!(outcome.image().unwrap().to_rgb8().get_pixel(0, 0)[0], 200);
        assert_eq!(fx.stub.completed(), 1);
        assert_eq!(
            fx.disk.get_bytes(op.key()).await.unwrap(),
            png([200, 200, 200]).to_vec()
        );
    }

    #[tokio::test]
    async fn test_settled_operation_rejects_subscribers() {
        let fx = Fixture::new(StubTransport::new()).await;
        fx.stub.set(URL, StubResponse::Body(png([2, 2, 2])));
        let op = fx.operation(FetchRequest::new(URL));
        op.attach_initial(Subscriber::Callback(Box::new(|_| {})));

        let outcome = op.resolve().await;

        assert!(outcome.is_success());
        assert!(!op.state().is_terminal());
        assert!(
            op.attach(Subscriber::Callback(Box::new(|_| {})), true)
                .is_err()
        );
        assert!(!op.is_refresh());
    }
}
