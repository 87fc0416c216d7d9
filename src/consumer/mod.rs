//! Consumer core: a single switchable input with a cancellation-safe wait loop.
//!
//! A [`Consumer`] reads from exactly one active subscription at a time. By default
//! that is an internal direct-feed queue filled through
//! [`put_nowait`](Consumer::put_nowait); [`put_subscription`](Consumer::put_subscription)
//! swaps in any other subscription, at any time, even while a reader is blocked in
//! [`next`](Consumer::next). The swap cancels the pending wait, and the reader
//! transparently starts waiting on the new subscription.
//!
//! Swaps work through a generation token: every active subscription gets a fresh
//! child of the consumer's close token, and waits race the subscription's `get`
//! against it. Replacing the subscription cancels the generation; closing cancels
//! the parent and with it every generation.

pub mod threaded;

use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::core::{Error, Readiness, Result, ShutdownFlag};
use crate::subscriptions::{
    queue_factory, same_subscription, SharedSubscription, SubscriptionFactory,
};
use crate::util::cancellable;

/// Configuration for a consumer
pub struct ConsumerConfig<T> {
    /// Builds the internal direct-feed subscription
    pub direct_feed: SubscriptionFactory<T>,
    /// Start out ready
    pub ready: bool,
}

impl<T: Send + 'static> ConsumerConfig<T> {
    /// Use `factory` for the direct-feed subscription
    pub fn direct_feed(mut self, factory: SubscriptionFactory<T>) -> Self {
        self.direct_feed = factory;
        self
    }

    /// Set the initial readiness
    pub fn ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }
}

impl<T: Send + 'static> Default for ConsumerConfig<T> {
    fn default() -> Self {
        Self {
            direct_feed: queue_factory(),
            ready: true,
        }
    }
}

impl<T> Clone for ConsumerConfig<T> {
    fn clone(&self) -> Self {
        Self {
            direct_feed: self.direct_feed.clone(),
            ready: self.ready,
        }
    }
}

impl<T> std::fmt::Debug for ConsumerConfig<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("ready", &self.ready)
            .finish_non_exhaustive()
    }
}

struct State<T> {
    active: SharedSubscription<T>,
    direct: SharedSubscription<T>,
    generation: CancellationToken,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    closing: CancellationToken,
    readiness: Readiness,
    shutdown: ShutdownFlag,
    direct_feed: SubscriptionFactory<T>,
}

/// The switchable-input half of every data sink.
///
/// Cloning a `Consumer` yields another handle to the same state.
///
/// # Examples
///
/// ```rust
/// use subweld::prelude::*;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<()> {
/// let producer = Producer::<&str>::default();
/// let consumer = Consumer::<&str>::default();
///
/// consumer.put_subscription(producer.subscribe());
/// producer.broadcast("hello");
/// assert_eq!(consumer.next().await?, "hello");
///
/// // Pushing directly detaches the producer's subscription.
/// consumer.put_nowait("direct")?;
/// assert!(consumer.subscription().is_none());
/// assert_eq!(consumer.next().await?, "direct");
///
/// consumer.close();
/// assert!(consumer.next().await.unwrap_err().is_closed());
/// # Ok(())
/// # }
/// ```
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Consumer<T> {
    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Close the consumer. Pending and future waits fail with [`Error::Closed`].
    pub fn close(&self) {
        // Hold the state lock so no wait can be submitted between the flag and the cancel.
        let _state = self.state();
        if self.shared.shutdown.set() {
            debug!("closing consumer");
        }
        self.shared.readiness.close();
        self.shared.closing.cancel();
    }
}

impl<T: Send + 'static> Consumer<T> {
    /// Create a consumer reading from a fresh direct-feed subscription
    pub fn new(config: ConsumerConfig<T>) -> Self {
        let closing = CancellationToken::new();
        let direct = (config.direct_feed)();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    active: direct.clone(),
                    direct,
                    generation: closing.child_token(),
                }),
                closing,
                readiness: Readiness::new(config.ready),
                shutdown: ShutdownFlag::new(),
                direct_feed: config.direct_feed,
            }),
        }
    }

    /// Capture the active subscription and its generation token, then hand both
    /// to `submit` while the state lock is still held.
    ///
    /// Returns `None` once the consumer is closed.
    pub(crate) fn submit_wait<R>(
        &self,
        submit: impl FnOnce(SharedSubscription<T>, CancellationToken) -> R,
    ) -> Option<R> {
        let state = self.state();
        if self.shared.shutdown.is_set() {
            return None;
        }
        Some(submit(state.active.clone(), state.generation.clone()))
    }

    /// Wait for the next item from whichever subscription is active.
    ///
    /// A subscription swap during the wait is handled internally: the wait moves on
    /// to the new subscription and never returns an item from the old one. Errors
    /// raised by a subscription are logged and the wait retried. An exhausted
    /// subscription parks the wait until a new one is installed.
    ///
    /// Fails with [`Error::Closed`] once [`close`](Consumer::close) is called; treat
    /// that as the signal to stop processing.
    pub async fn next(&self) -> Result<T> {
        while let Some((subscription, generation)) = self.submit_wait(|s, g| (s, g)) {
            trace!("waiting for new data");
            match cancellable(subscription.get(), &generation).await {
                Ok(Ok(item)) => return Ok(item),
                Err(_) => debug!("subscription switched, checking for the new one"),
                Ok(Err(Error::Closed)) => {
                    debug!("incoming subscription closed, waiting for a new one");
                    generation.cancelled().await;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "unexpected error from subscription, ignoring");
                    tokio::task::yield_now().await;
                }
            }
        }
        debug!("consumer closed");
        Err(Error::Closed)
    }

    /// Push an item straight to the reader.
    ///
    /// If an external subscription is active it is detached first, as by
    /// [`stop`](Consumer::stop).
    pub fn put_nowait(&self, item: T) -> Result<()> {
        let mut state = self.state();
        if !same_subscription(&state.active, &state.direct) {
            self.detach(&mut state);
        }
        state.direct.put_nowait(item)
    }

    /// Read from `subscription` until it is replaced.
    ///
    /// A wait in progress on the previous subscription is cancelled and restarted
    /// on this one. Installing the active subscription again does nothing.
    pub fn put_subscription(&self, subscription: SharedSubscription<T>) {
        let mut state = self.state();
        self.install(&mut state, subscription);
    }

    /// Stop reading the current subscription and go back to a fresh direct feed.
    ///
    /// Items buffered in the detached subscription are not read.
    pub fn stop(&self) {
        let mut state = self.state();
        self.detach(&mut state);
    }

    fn detach(&self, state: &mut State<T>) {
        let fresh = (self.shared.direct_feed)();
        state.direct = fresh.clone();
        self.install(state, fresh);
    }

    fn install(&self, state: &mut State<T>, subscription: SharedSubscription<T>) {
        if same_subscription(&state.active, &subscription) {
            return;
        }
        debug!("changing subscription");
        state.active = subscription;
        state.generation.cancel();
        state.generation = self.shared.closing.child_token();
    }

    /// The active subscription, or `None` while reading the direct feed
    pub fn subscription(&self) -> Option<SharedSubscription<T>> {
        let state = self.state();
        if same_subscription(&state.active, &state.direct) {
            None
        } else {
            Some(state.active.clone())
        }
    }

    /// Mark the consumer ready
    pub fn set_ready(&self) {
        self.shared.readiness.set_ready();
    }

    /// Whether the consumer finished setting up and is not closed
    pub fn is_ready(&self) -> bool {
        self.shared.readiness.is_ready()
    }

    /// Whether [`close`](Consumer::close) was called
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_set()
    }

    /// The readiness flag, for sharing with background setup code
    pub fn readiness(&self) -> Readiness {
        self.shared.readiness.clone()
    }
}

impl<T: Send + 'static> Default for Consumer<T> {
    fn default() -> Self {
        Self::new(ConsumerConfig::default())
    }
}

impl<T> std::fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("readiness", &self.shared.readiness.state())
            .field("closed", &self.shared.shutdown.is_set())
            .finish_non_exhaustive()
    }
}
