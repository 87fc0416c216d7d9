//! Producer core: a subscriber registry with broadcast fan-out.
//!
//! A [`Producer`] keeps three registries, one per [`Subscriber`] kind, and
//! delivers every item handed to [`Producer::broadcast`] to all of them. Anything
//! that generates data wraps a producer and calls `broadcast`; everyone else uses
//! [`subscribe`](Producer::subscribe) or the [`get`](Producer::get) shortcut.
//!
//! The [`threaded`] and [`process`] modules run the data acquisition on a worker
//! thread or in a child process and marshal every item back onto the runtime that
//! owns the producer, so broadcasts never overlap.

pub mod process;
pub mod threaded;
pub mod worker;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::core::{Error, Readiness, Result, ShutdownFlag, Subscription};
use crate::subscriptions::{
    queue_factory, AsyncCallback, Callback, SharedSubscription, Subscriber, SubscriberKey,
    SubscriberKind, SubscriptionFactory,
};

/// Configuration for a producer
pub struct ProducerConfig<T> {
    /// Builds subscriptions for `subscribe()` and the default subscription
    pub default_subscription: SubscriptionFactory<T>,
    /// Create the default subscription right away instead of on the first `get()`,
    /// so it never misses data. Unread items pile up if `get()` is never called.
    pub autosubscribe: bool,
    /// Start out ready. Producers with background setup start not ready and call
    /// [`Producer::set_ready`] once set up.
    pub ready: bool,
}

impl<T: Send + 'static> ProducerConfig<T> {
    /// Use `factory` for default subscriptions
    pub fn default_subscription<F, S>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<S> + Send + Sync + 'static,
        S: Subscription<Item = T>,
    {
        self.default_subscription = Arc::new(move || factory() as SharedSubscription<T>);
        self
    }

    /// Create the default subscription eagerly
    pub fn autosubscribe(mut self, autosubscribe: bool) -> Self {
        self.autosubscribe = autosubscribe;
        self
    }

    /// Set the initial readiness
    pub fn ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }
}

impl<T: Send + 'static> Default for ProducerConfig<T> {
    fn default() -> Self {
        Self {
            default_subscription: queue_factory(),
            autosubscribe: false,
            ready: true,
        }
    }
}

impl<T> Clone for ProducerConfig<T> {
    fn clone(&self) -> Self {
        Self {
            default_subscription: self.default_subscription.clone(),
            autosubscribe: self.autosubscribe,
            ready: self.ready,
        }
    }
}

impl<T> std::fmt::Debug for ProducerConfig<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerConfig")
            .field("autosubscribe", &self.autosubscribe)
            .field("ready", &self.ready)
            .finish_non_exhaustive()
    }
}

struct Registry<T> {
    queues: HashMap<SubscriberKey, SharedSubscription<T>>,
    callbacks: HashMap<SubscriberKey, Callback<T>>,
    async_callbacks: HashMap<SubscriberKey, AsyncCallback<T>>,
    default: Option<SharedSubscription<T>>,
}

impl<T: Send + 'static> Registry<T> {
    fn new() -> Self {
        Self {
            queues: HashMap::new(),
            callbacks: HashMap::new(),
            async_callbacks: HashMap::new(),
            default: None,
        }
    }

    fn insert(&mut self, subscriber: &Subscriber<T>) {
        let key = subscriber.key();
        match subscriber {
            Subscriber::Queue(s) => {
                self.queues.insert(key, s.clone());
            }
            Subscriber::Callback(f) => {
                self.callbacks.insert(key, f.clone());
            }
            Subscriber::AsyncCallback(f) => {
                self.async_callbacks.insert(key, f.clone());
            }
        }
    }

    fn remove(&mut self, key: SubscriberKey, kind: SubscriberKind) -> bool {
        match kind {
            SubscriberKind::Queue => self.queues.remove(&key).is_some(),
            SubscriberKind::Callback => self.callbacks.remove(&key).is_some(),
            SubscriberKind::AsyncCallback => self.async_callbacks.remove(&key).is_some(),
        }
    }

    fn len(&self) -> usize {
        self.queues.len() + self.callbacks.len() + self.async_callbacks.len()
    }
}

struct Shared<T> {
    registry: Mutex<Registry<T>>,
    config: ProducerConfig<T>,
    readiness: Readiness,
    shutdown: ShutdownFlag,
    runtime: Option<Handle>,
}

/// The fan-out half of every data source.
///
/// Cloning a `Producer` yields another handle to the same registry.
///
/// # Examples
///
/// ```rust
/// use subweld::prelude::*;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<()> {
/// let producer = Producer::<u32>::default();
/// let subscription = producer.subscribe();
///
/// producer.broadcast(1);
/// producer.broadcast(2);
///
/// assert_eq!(subscription.get().await?, 1);
/// assert_eq!(subscription.get().await?, 2);
/// # Ok(())
/// # }
/// ```
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Producer<T>
where
    T: Clone + Send + 'static,
{
    /// Create a producer
    pub fn new(config: ProducerConfig<T>) -> Self {
        let producer = Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::new()),
                readiness: Readiness::new(config.ready),
                shutdown: ShutdownFlag::new(),
                runtime: Handle::try_current().ok(),
                config,
            }),
        };
        if producer.shared.config.autosubscribe {
            producer.default_subscription();
        }
        producer
    }

    fn registry(&self) -> MutexGuard<'_, Registry<T>> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe with a new subscription of the configured default type.
    ///
    /// Every call returns a new, independent subscription.
    pub fn subscribe(&self) -> SharedSubscription<T> {
        let subscription = (self.shared.config.default_subscription)();
        self.subscribe_with(Subscriber::Queue(subscription.clone()));
        subscription
    }

    /// Register an existing subscription or callback and hand it back.
    ///
    /// Registering the same object twice keeps a single registration.
    pub fn subscribe_with(&self, subscriber: impl Into<Subscriber<T>>) -> Subscriber<T> {
        let subscriber = subscriber.into();
        if self.shared.shutdown.is_set() {
            debug!(kind = ?subscriber.kind(), "producer already closed, subscriber will see no data");
            if let Subscriber::Queue(s) = &subscriber {
                s.close();
            }
            return subscriber;
        }
        debug!(kind = ?subscriber.kind(), "added subscriber");
        self.registry().insert(&subscriber);
        subscriber
    }

    /// Remove a subscriber so it no longer gets updates.
    ///
    /// Fails with [`Error::NotRegistered`] if it is not currently subscribed.
    pub fn unsubscribe(&self, subscriber: &Subscriber<T>) -> Result<()> {
        self.remove(subscriber.key(), subscriber.kind())
    }

    /// Remove a subscription returned by [`subscribe`](Producer::subscribe)
    pub fn unsubscribe_subscription(&self, subscription: &SharedSubscription<T>) -> Result<()> {
        self.remove(
            Subscriber::Queue(subscription.clone()).key(),
            SubscriberKind::Queue,
        )
    }

    fn remove(&self, key: SubscriberKey, kind: SubscriberKind) -> Result<()> {
        if self.registry().remove(key, kind) {
            debug!(?kind, "removed subscriber");
            Ok(())
        } else {
            Err(Error::NotRegistered)
        }
    }

    /// Remove the default subscription created by [`get`](Producer::get).
    ///
    /// Does nothing if there is none. The next `get` starts a fresh one.
    pub fn unsubscribe_default(&self) {
        let mut registry = self.registry();
        match registry.default.take() {
            Some(default) => {
                let key = Subscriber::Queue(default).key();
                registry.remove(key, SubscriberKind::Queue);
                debug!("removed default subscription");
            }
            None => debug!("no default subscription to remove"),
        }
    }

    /// Remove every subscriber, including the default subscription
    pub fn unsubscribe_all(&self) {
        *self.registry() = Registry::new();
        debug!("removed all subscribers");
    }

    fn default_subscription(&self) -> SharedSubscription<T> {
        if let Some(existing) = self.registry().default.clone() {
            return existing;
        }
        let subscription = self.subscribe();
        let mut registry = self.registry();
        match registry.default.clone() {
            Some(existing) => {
                // Lost a race with another caller; keep theirs.
                registry.remove(
                    Subscriber::Queue(subscription).key(),
                    SubscriberKind::Queue,
                );
                existing
            }
            None => {
                debug!("created default subscription");
                registry.default = Some(subscription.clone());
                subscription
            }
        }
    }

    /// Wait for the next item on the default subscription.
    ///
    /// The first call creates the default subscription; later calls reuse it until
    /// [`unsubscribe_default`](Producer::unsubscribe_default) is called. After
    /// [`close`](Producer::close) the items already buffered there can still be read.
    pub async fn get(&self) -> Result<T> {
        let existing = self.registry().default.clone();
        let subscription = match existing {
            Some(subscription) => subscription,
            None if self.shared.shutdown.is_set() => return Err(Error::Closed),
            None => self.default_subscription(),
        };
        subscription.get().await
    }

    /// Deliver `item` to every subscriber.
    ///
    /// Queue subscribers get it through `put_nowait`, callbacks are invoked inline,
    /// and async callbacks are spawned on the owning runtime without being awaited.
    /// Meant for whatever generates the data, not for readers.
    pub fn broadcast(&self, item: T) {
        let (queues, callbacks, async_callbacks) = {
            let registry = self.registry();
            (
                registry.queues.values().cloned().collect::<Vec<_>>(),
                registry.callbacks.values().cloned().collect::<Vec<_>>(),
                registry.async_callbacks.values().cloned().collect::<Vec<_>>(),
            )
        };

        for subscription in &queues {
            if let Err(e) = subscription.put_nowait(item.clone()) {
                warn!(error = %e, "subscription rejected item");
            }
        }
        for callback in &callbacks {
            callback(item.clone());
        }
        if async_callbacks.is_empty() {
            return;
        }
        match self.runtime() {
            Some(runtime) => {
                for callback in &async_callbacks {
                    runtime.spawn(callback(item.clone()));
                }
            }
            None => warn!(
                count = async_callbacks.len(),
                "no tokio runtime available, async callbacks skipped"
            ),
        }
    }

    fn runtime(&self) -> Option<Handle> {
        Handle::try_current()
            .ok()
            .or_else(|| self.shared.runtime.clone())
    }

    /// Stop producing: closes every queue subscriber, drops all subscriptions and
    /// marks the producer not ready. Calling it again does nothing.
    ///
    /// Readers drain what is already buffered, then see [`Error::Closed`].
    pub fn close(&self) {
        if self.shared.shutdown.set() {
            debug!("closing producer");
        }
        let registry = {
            let mut current = self.registry();
            let mut closed = Registry::new();
            closed.default = current.default.clone();
            std::mem::replace(&mut *current, closed)
        };
        for subscription in registry.queues.values() {
            subscription.close();
        }
        self.shared.readiness.close();
    }

    /// Mark the producer ready to deliver data
    pub fn set_ready(&self) {
        self.shared.readiness.set_ready();
    }

    /// Whether the producer finished setting up and is not closed
    pub fn is_ready(&self) -> bool {
        self.shared.readiness.is_ready()
    }

    /// Whether [`close`](Producer::close) was called
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_set()
    }

    /// The readiness flag, for sharing with background setup code
    pub fn readiness(&self) -> Readiness {
        self.shared.readiness.clone()
    }

    /// The shutdown flag observed by acquisition loops
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shared.shutdown.clone()
    }

    /// Number of registered subscribers of all kinds
    pub fn subscriber_count(&self) -> usize {
        self.registry().len()
    }
}

impl<T> Default for Producer<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new(ProducerConfig::default())
    }
}

impl<T> std::fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("readiness", &self.shared.readiness.state())
            .field("closed", &self.shared.shutdown.is_set())
            .finish_non_exhaustive()
    }
}
