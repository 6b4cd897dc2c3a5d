//! Tracks live subscriptions and serializes delivery to each of them.
//!
//! Every subscription owns a bounded queue that is drained by a dedicated task,
//! so the index never waits on a listener. A listener that falls a full queue
//! behind is unsubscribed; its consumer is expected to resubscribe and obtain a
//! fresh snapshot.

use ahash::AHashMap as HashMap;
use linkerd_destination_core::{Closed, Endpoint, EndpointsListener, Profile, ProfileListener};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn, Instrument};

/// A notification for an endpoints listener.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum EndpointsEvent {
    Update {
        added: Vec<Endpoint>,
        removed: Vec<Endpoint>,
    },
    NoEndpoints {
        exists: bool,
    },
}

/// A notification for a profile listener. `None` indicates the default profile.
pub(crate) type ProfileEvent = Option<Arc<Profile>>;

/// Applies a single event to a listener.
#[async_trait::async_trait]
pub(crate) trait Deliver<E>: Send + 'static {
    async fn deliver(&mut self, event: E);
}

#[derive(Debug)]
pub(crate) struct Registry<E> {
    subscribers: Arc<Mutex<Subscribers<E>>>,
    capacity: usize,
}

/// Removes a subscription from its registry.
///
/// Unsubscribing is idempotent. Dropping the handle does not unsubscribe; the
/// subscription otherwise ends when its liveness signal fires.
pub struct Subscription {
    id: u64,
    unsubscribe: Box<dyn Fn(u64) + Send + Sync>,
}

#[derive(Debug)]
struct Subscribers<E> {
    next_id: u64,
    by_id: HashMap<u64, Entry<E>>,
}

#[derive(Debug)]
struct Entry<E> {
    tx: mpsc::Sender<E>,
    stop: Arc<Notify>,
}

// === impl Registry ===

impl<E> Registry<E>
where
    E: Clone + Send + 'static,
{
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Subscribers {
                next_id: 0,
                by_id: HashMap::default(),
            })),
            // The initial state may require two events.
            capacity: capacity.max(2),
        }
    }

    /// Registers a listener, enqueueing `initial` ahead of any subsequent
    /// notification, and spawns the task that drives it.
    pub(crate) fn subscribe<L>(&self, mut listener: L, initial: Vec<E>, closed: Closed) -> Subscription
    where
        L: Deliver<E>,
    {
        let (tx, mut rx) = mpsc::channel(self.capacity.max(initial.len()));
        for event in initial {
            // The queue is sized to fit the initial state.
            let res = tx.try_send(event);
            debug_assert!(res.is_ok());
        }

        let stop = Arc::new(Notify::new());
        let id = {
            let mut subs = self.subscribers.lock();
            let id = subs.next_id;
            subs.next_id += 1;
            subs.by_id.insert(
                id,
                Entry {
                    tx,
                    stop: stop.clone(),
                },
            );
            id
        };

        let guard = Remove {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        };
        tokio::spawn(
            async move {
                let _guard = guard;
                tokio::pin!(closed);
                let stopped = stop.notified();
                tokio::pin!(stopped);
                loop {
                    let event = tokio::select! {
                        _ = &mut closed => return,
                        _ = &mut stopped => return,
                        event = rx.recv() => match event {
                            Some(event) => event,
                            None => return,
                        },
                    };
                    tokio::select! {
                        _ = &mut closed => return,
                        _ = &mut stopped => return,
                        _ = listener.deliver(event) => {}
                    }
                }
            }
            .instrument(tracing::debug_span!("listener", id)),
        );

        let subscribers = Arc::downgrade(&self.subscribers);
        Subscription {
            id,
            unsubscribe: Box::new(move |id| {
                if let Some(subscribers) = subscribers.upgrade() {
                    if let Some(Entry { stop, .. }) = subscribers.lock().by_id.remove(&id) {
                        debug!(id, "Unsubscribed");
                        stop.notify_one();
                    }
                }
            }),
        }
    }

    /// Enqueues an event for every subscriber without waiting.
    pub(crate) fn notify(&self, event: &E) {
        self.subscribers.lock().by_id.retain(|id, entry| {
            match entry.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(id, "Listener is lagging; dropping its subscription");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.subscribers.lock().by_id.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// === impl Subscription ===

impl Subscription {
    pub fn unsubscribe(&self) {
        (self.unsubscribe)(self.id)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Removes a subscription when its task completes.
struct Remove<E> {
    id: u64,
    subscribers: Weak<Mutex<Subscribers<E>>>,
}

impl<E> Drop for Remove<E> {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            if subscribers.lock().by_id.remove(&self.id).is_some() {
                debug!(id = self.id, "Listener closed");
            }
        }
    }
}

// === impl Deliver ===

#[async_trait::async_trait]
impl Deliver<EndpointsEvent> for Box<dyn EndpointsListener> {
    async fn deliver(&mut self, event: EndpointsEvent) {
        match event {
            EndpointsEvent::Update { added, removed } => self.update(added, removed).await,
            EndpointsEvent::NoEndpoints { exists } => self.no_endpoints(exists).await,
        }
    }
}

#[async_trait::async_trait]
impl Deliver<ProfileEvent> for Box<dyn ProfileListener> {
    async fn deliver(&mut self, profile: ProfileEvent) {
        self.update(profile).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    struct Collect(mpsc::UnboundedSender<u32>);

    #[async_trait::async_trait]
    impl Deliver<u32> for Collect {
        async fn deliver(&mut self, n: u32) {
            let _ = self.0.send(n);
        }
    }

    /// Blocks each delivery until the test releases it.
    struct Gated {
        gate: Arc<tokio::sync::Semaphore>,
        tx: mpsc::UnboundedSender<u32>,
    }

    #[async_trait::async_trait]
    impl Deliver<u32> for Gated {
        async fn deliver(&mut self, n: u32) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            let _ = self.tx.send(n);
        }
    }

    fn never() -> Closed {
        Box::pin(std::future::pending())
    }

    #[tokio::test]
    async fn delivers_initial_state_then_updates_in_order() {
        let registry = Registry::<u32>::new(10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = registry.subscribe(Collect(tx), vec![0], never());
        for n in 1..=5 {
            registry.notify(&n);
        }
        for n in 0..=5 {
            assert_eq!(rx.recv().await, Some(n));
        }
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let registry = Registry::<u32>::new(10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = registry.subscribe(Collect(tx), vec![], never());
        assert_eq!(registry.len(), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(registry.is_empty());

        // The listener's task completes and drops the listener.
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn liveness_signal_unsubscribes() {
        let registry = Registry::<u32>::new(10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
        let sub = registry.subscribe(
            Collect(tx),
            vec![],
            Box::pin(async move {
                let _ = close_rx.await;
            }),
        );

        drop(close_tx);
        assert_eq!(rx.recv().await, None);
        assert!(registry.is_empty());

        // Explicitly unsubscribing afterwards is a no-op.
        sub.unsubscribe();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn lagging_listener_does_not_block_others() {
        let registry = Registry::<u32>::new(2);

        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let (slow_tx, mut slow_rx) = mpsc::unbounded_channel();
        let _slow = registry.subscribe(
            Gated {
                gate: gate.clone(),
                tx: slow_tx,
            },
            vec![],
            never(),
        );

        let (fast_tx, mut fast_rx) = mpsc::unbounded_channel();
        let _fast = registry.subscribe(Collect(fast_tx), vec![], never());

        for n in 1..=4 {
            registry.notify(&n);
            assert_eq!(
                time::timeout(time::Duration::from_secs(1), fast_rx.recv())
                    .await
                    .expect("fast listener must not be blocked"),
                Some(n)
            );
        }

        // The slow listener overflowed its queue and was dropped. Releasing it
        // delivers what had been queued before its channel closes.
        assert_eq!(registry.len(), 1);
        gate.add_permits(10);
        let mut seen = vec![];
        while let Some(n) = slow_rx.recv().await {
            seen.push(n);
        }
        assert!(!seen.is_empty());
        assert!(seen.len() < 4, "{seen:?}");
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
    }
}
