//! Table of operations currently resolving, keyed by cache key.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::domain::entities::{CacheKey, FetchOutcome, FetchRequest};

use super::operation::{FetchOperation, Subscriber, SubscriberId};

/// How a request was matched to an operation.
#[derive(Debug)]
pub(crate) struct Joined {
    pub operation: Arc<FetchOperation>,
    pub id: SubscriberId,
    /// True if the operation was created for this request and must be scheduled.
    pub created: bool,
}

/// At most one operation per cache key.
///
/// Lock order is table, then operation. Subscribers are always notified
/// after both locks are released.
#[derive(Default)]
pub struct InFlightTable {
    operations: Mutex<HashMap<CacheKey, Arc<FetchOperation>>>,
}

impl std::fmt::Debug for InFlightTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightTable")
            .field("len", &self.len())
            .finish()
    }
}

impl InFlightTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `subscriber` to the live operation for the request's key, or
    /// registers a new one built by `create`.
    ///
    /// A refresh request joining a plain operation upgrades it to refresh.
    /// A new operation replaces the registered one only once that one has
    /// settled and will write nothing more.
    pub(crate) fn join_or_create(
        &self,
        request: &FetchRequest,
        subscriber: Subscriber,
        create: impl FnOnce(CacheKey, FetchRequest) -> FetchOperation,
    ) -> Joined {
        let key = request.cache_key();
        let mut operations = self.operations.lock();

        let mut subscriber = subscriber;
        if let Some(existing) = operations.get(&key) {
            match existing.attach(subscriber, request.refresh) {
                Ok(id) => {
                    trace!(key = %key, subscriber = id, "Joined in-flight operation");
                    return Joined {
                        operation: existing.clone(),
                        id,
                        created: false,
                    };
                }
                Err(rejected) => subscriber = rejected,
            }
        }

        let operation = Arc::new(create(key.clone(), request.clone()));
        let id = operation.attach_initial(subscriber);
        if operations.insert(key.clone(), operation.clone()).is_some() {
            debug!(key = %key, "Replaced settled in-flight operation");
        }
        debug!(key = %key, refresh = request.refresh, "Created fetch operation");

        Joined {
            operation,
            id,
            created: true,
        }
    }

    /// Closes `operation` with `outcome` and notifies its subscribers.
    /// Returns how many were notified; zero if it was already closed.
    pub fn finish(&self, operation: &Arc<FetchOperation>, outcome: FetchOutcome) -> usize {
        let subscribers = {
            let mut operations = self.operations.lock();
            Self::deregister(&mut operations, operation);
            operation.complete(&outcome)
        };

        let Some(subscribers) = subscribers else {
            trace!(key = %operation.key(), "Operation already closed");
            return 0;
        };

        let count = subscribers.len();
        trace!(key = %operation.key(), subscribers = count, outcome = %outcome, "Delivering outcome");
        for subscriber in subscribers {
            subscriber.deliver(outcome.clone());
        }
        count
    }

    /// Withdraws one subscriber, delivering `Cancelled` to it.
    ///
    /// Cancels and deregisters the operation if no subscribers remain.
    /// Returns false if the subscriber was already gone.
    pub fn detach(&self, operation: &Arc<FetchOperation>, id: SubscriberId) -> bool {
        let detached = {
            let mut operations = self.operations.lock();
            let detached = operation.detach(id);
            if detached.operation_cancelled {
                Self::deregister(&mut operations, operation);
            }
            detached
        };

        match detached.subscriber {
            Some(subscriber) => {
                subscriber.deliver(FetchOutcome::Cancelled);
                true
            }
            None => false,
        }
    }

    fn deregister(
        operations: &mut HashMap<CacheKey, Arc<FetchOperation>>,
        operation: &Arc<FetchOperation>,
    ) {
        if operations
            .get(operation.key())
            .is_some_and(|current| Arc::ptr_eq(current, operation))
        {
            operations.remove(operation.key());
        }
    }

    /// Returns the live operation for `key`.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<Arc<FetchOperation>> {
        self.operations.lock().get(key).cloned()
    }

    /// Returns true if an operation for `key` is live.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.operations.lock().contains_key(key)
    }

    /// Returns the number of live operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.lock().len()
    }

    /// Returns true if nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels every live operation and notifies all subscribers.
    /// Returns the number of operations cancelled.
    pub fn clear(&self) -> usize {
        let closed: Vec<_> = {
            let mut operations = self.operations.lock();
            operations
                .drain()
                .filter_map(|(_, op)| op.complete(&FetchOutcome::Cancelled))
                .collect()
        };

        let count = closed.len();
        for subscriber in closed.into_iter().flatten() {
            subscriber.deliver(FetchOutcome::Cancelled);
        }
        if count > 0 {
            debug!(count = count, "Cancelled all in-flight operations");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::OperationState;
    use crate::domain::ports::mocks::StubTransport;
    use crate::domain::transform::Transform;
    use crate::infrastructure::image::disk_cache::DiskImageCache;
    use crate::infrastructure::image::memory_cache::MemoryImageCache;
    use crate::infrastructure::image::operation::{
        OperationContext, OperationFactory, TieredOperationFactory,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    const URL: &str = "https://x/img.png";

    async fn factory() -> (TieredOperationFactory, TempDir) {
        let dir = TempDir::new().unwrap();
        let disk = DiskImageCache::new(dir.path().to_path_buf(), 1024)
            .await
            .unwrap();
        let context = OperationContext {
            memory: Arc::new(MemoryImageCache::new(4)),
            disk: Arc::new(disk),
            transport: Arc::new(StubTransport::new()),
        };
        (TieredOperationFactory::new(context), dir)
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Subscriber {
        let counter = counter.clone();
        Subscriber::Callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[tokio::test]
    async fn test_equal_keys_share_one_operation() {
        let (factory, _dir) = factory().await;
        let table = InFlightTable::new();
        let created = AtomicUsize::new(0);
        let create = |k, r| {
            created.fetch_add(1, Ordering::SeqCst);
            factory.create(k, r)
        };

        let request = FetchRequest::new(URL).with_transform(Transform::blur(2.0));
        let first = table.join_or_create(&request, Subscriber::Callback(Box::new(|_| {})), create);
        let second = table.join_or_create(
            &FetchRequest::new(URL).with_transform(Transform::blur(2.0)),
            Subscriber::Callback(Box::new(|_| {})),
            |k, r| factory.create(k, r),
        );

        assert!(first.created);
        assert!(!second.created);
        assert!(Arc::ptr_eq(&first.operation, &second.operation));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(first.operation.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_different_transforms_do_not_coalesce() {
        let (factory, _dir) = factory().await;
        let table = InFlightTable::new();

        let a = table.join_or_create(
            &FetchRequest::new(URL),
            Subscriber::Callback(Box::new(|_| {})),
            |k, r| factory.create(k, r),
        );
        let b = table.join_or_create(
            &FetchRequest::new(URL).with_transform(Transform::grayscale()),
            Subscriber::Callback(Box::new(|_| {})),
            |k, r| factory.create(k, r),
        );

        assert!(a.created && b.created);
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_finish_delivers_once_and_deregisters() {
        let (factory, _dir) = factory().await;
        let table = InFlightTable::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let request = FetchRequest::new(URL);

        let joined = table.join_or_create(&request, counting(&delivered), |k, r| factory.create(k, r));
        table.join_or_create(&request, counting(&delivered), |k, r| factory.create(k, r));

        assert_eq!(table.finish(&joined.operation, FetchOutcome::Cancelled), 2);
        assert_eq!(table.finish(&joined.operation, FetchOutcome::Cancelled), 0);
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_detach_last_subscriber_cancels_and_deregisters() {
        let (factory, _dir) = factory().await;
        let table = InFlightTable::new();
        let (tx, rx) = oneshot::channel();
        let request = FetchRequest::new(URL);

        let joined = table.join_or_create(&request, Subscriber::Channel(tx), |k, r| factory.create(k, r));
        assert!(table.detach(&joined.operation, joined.id));
        assert!(!table.detach(&joined.operation, joined.id));

        assert!(rx.await.unwrap().is_cancelled());
        assert_eq!(joined.operation.state(), OperationState::Cancelled);
        assert!(!table.contains(&request.cache_key()));

        let again = table.join_or_create(&request, Subscriber::Callback(Box::new(|_| {})), |k, r| {
            factory.create(k, r)
        });
        assert!(again.created);
        assert!(!Arc::ptr_eq(&again.operation, &joined.operation));
    }

    #[tokio::test]
    async fn test_detach_one_of_two_keeps_operation() {
        let (factory, _dir) = factory().await;
        let table = InFlightTable::new();
        let request = FetchRequest::new(URL);

        let first = table.join_or_create(&request, Subscriber::Callback(Box::new(|_| {})), |k, r| {
            factory.create(k, r)
        });
        table.join_or_create(&request, Subscriber::Callback(Box::new(|_| {})), |k, r| {
            factory.create(k, r)
        });

        table.detach(&first.operation, first.id);

        assert!(!first.operation.is_cancelled());
        assert!(table.contains(&request.cache_key()));
    }

    #[tokio::test]
    async fn test_refresh_upgrades_plain_operation() {
        let (factory, _dir) = factory().await;
        let table = InFlightTable::new();
        let plain = FetchRequest::new(URL);
        let refresh = FetchRequest::new(URL).with_refresh(true);

        let first = table.join_or_create(&plain, Subscriber::Callback(Box::new(|_| {})), |k, r| {
            factory.create(k, r)
        });
        assert!(!first.operation.is_refresh());
        let second = table.join_or_create(&refresh, Subscriber::Callback(Box::new(|_| {})), |k, r| {
            factory.create(k, r)
        });

        assert!(!second.created);
        assert!(Arc::ptr_eq(&first.operation, &second.operation));
        assert!(first.operation.is_refresh());
        assert_eq!(table.len(), 1);
        assert_eq!(first.operation.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_replaced_operation_finishing_keeps_successor() {
        let (factory, _dir) = factory().await;
        let table = InFlightTable::new();
        let request = FetchRequest::new(URL);
        let old = Arc::new(factory.create(request.cache_key(), request.clone()));
        old.attach_initial(Subscriber::Callback(Box::new(|_| {})));
        old.resolve().await;
        table
            .operations
            .lock()
            .insert(request.cache_key(), old.clone());

        let new = table.join_or_create(
            &request.clone().with_refresh(true),
            Subscriber::Callback(Box::new(|_| {})),
            |k, r| factory.create(k, r),
        );
        assert!(new.created);
        assert!(!old.is_refresh());

        table.finish(&old, FetchOutcome::Cancelled);
        assert!(Arc::ptr_eq(
            &table.get(&request.cache_key()).unwrap(),
            &new.operation
        ));
    }

    #[tokio::test]
    async fn test_terminal_operation_is_never_joined() {
        let (factory, _dir) = factory().await;
        let table = InFlightTable::new();
        let request = FetchRequest::new(URL);
        let stale = Arc::new(factory.create(request.cache_key(), request.clone()));
        stale.complete(&FetchOutcome::Cancelled);
        table
            .operations
            .lock()
            .insert(request.cache_key(), stale.clone());

        let joined = table.join_or_create(&request, Subscriber::Callback(Box::new(|_| {})), |k, r| {
            factory.create(k, r)
        });

        assert!(joined.created);
        assert!(!Arc::ptr_eq(&joined.operation, &stale));
    }

    #[tokio::test]
    async fn test_clear_cancels_everything() {
        let (factory, _dir) = factory().await;
        let table = InFlightTable::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        for url in ["https://x/1.png", "https://x/2.png"] {
            table.join_or_create(&FetchRequest::new(url), counting(&delivered), |k, r| {
                factory.create(k, r)
            });
        }

        assert_eq!(table.clear(), 2);
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert!(table.is_empty());
    }
}
