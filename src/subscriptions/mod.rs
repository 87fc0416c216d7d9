//! Subscription implementations and the subscriber union accepted by producers.
//!
//! [`Queue`] is the default subscription: an unbounded FIFO that never blocks the
//! producer. [`Subscriber`] is what a producer stores: a queue, a synchronous
//! callback, or an asynchronous callback. The kind is fixed when the subscriber
//! is built, never re-inspected on delivery.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::core::{Error, Result, Subscription};

/// A subscription shared between a producer and its readers
pub type SharedSubscription<T> = Arc<dyn Subscription<Item = T>>;

/// Builds fresh subscriptions, e.g. a producer's default or a consumer's direct feed
pub type SubscriptionFactory<T> = Arc<dyn Fn() -> SharedSubscription<T> + Send + Sync>;

/// A factory producing unbounded [`Queue`]s
pub fn queue_factory<T: Send + 'static>() -> SubscriptionFactory<T> {
    Arc::new(|| Queue::<T>::shared() as SharedSubscription<T>)
}

/// An unbounded FIFO subscription.
///
/// Cheap to share through an `Arc`; every clone of the `Arc` is the same
/// subscription. After [`close`](Subscription::close) buffered items can still be
/// read, then `get` returns [`Error::Closed`].
pub struct Queue<T> {
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
}

impl<T: Send + 'static> Queue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    /// Create an empty queue already wrapped for sharing
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Take the next item if one is buffered, without waiting
    pub fn try_get(&self) -> Result<Option<T>> {
        let mut receiver = self
            .receiver
            .try_lock()
            .map_err(|_| Error::custom("queue is being read concurrently"))?;
        match receiver.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(Error::Closed),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Subscription for Queue<T> {
    type Item = T;

    fn put_nowait(&self, item: T) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| Error::custom("queue lock poisoned"))?;
        match sender.as_ref() {
            Some(tx) => tx.send(item).map_err(Error::from),
            None => Err(Error::Closed),
        }
    }

    async fn get(&self) -> Result<T> {
        // Both the lock and recv are cancel-safe, so dropping this future loses nothing.
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await.ok_or(Error::Closed)
    }

    fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

impl<T: Send + 'static> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue").finish_non_exhaustive()
    }
}

/// Identity of a registered subscriber: the address of its shared allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberKey(usize);

impl SubscriberKey {
    fn of<U: ?Sized>(arc: &Arc<U>) -> Self {
        SubscriberKey(Arc::as_ptr(arc) as *const () as usize)
    }
}

/// Whether two shared subscriptions are the same object
pub fn same_subscription<T: Send + 'static>(
    a: &SharedSubscription<T>,
    b: &SharedSubscription<T>,
) -> bool {
    SubscriberKey::of(a) == SubscriberKey::of(b)
}

/// A synchronous callback invoked inline for every item
pub type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// An asynchronous callback; one future is spawned per item and never awaited
pub type AsyncCallback<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Which registry a subscriber lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberKind {
    Queue,
    Callback,
    AsyncCallback,
}

/// Anything a producer can deliver items to.
pub enum Subscriber<T> {
    /// A buffered subscription, fed with `put_nowait`
    Queue(SharedSubscription<T>),
    /// A function called inline with each item
    Callback(Callback<T>),
    /// A function whose future is spawned for each item
    AsyncCallback(AsyncCallback<T>),
}

impl<T: Send + 'static> Subscriber<T> {
    /// Wrap a subscription
    pub fn queue<S>(subscription: Arc<S>) -> Self
    where
        S: Subscription<Item = T>,
    {
        Subscriber::Queue(subscription)
    }

    /// Wrap a synchronous callback
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Subscriber::Callback(Arc::new(f))
    }

    /// Wrap an asynchronous callback
    pub fn async_callback<F, Fut>(f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Subscriber::AsyncCallback(Arc::new(move |item: T| {
            Box::pin(f(item)) as BoxFuture<'static, ()>
        }))
    }

    /// Which kind of subscriber this is
    pub fn kind(&self) -> SubscriberKind {
        match self {
            Subscriber::Queue(_) => SubscriberKind::Queue,
            Subscriber::Callback(_) => SubscriberKind::Callback,
            Subscriber::AsyncCallback(_) => SubscriberKind::AsyncCallback,
        }
    }

    /// Identity used for registration
    pub fn key(&self) -> SubscriberKey {
        match self {
            Subscriber::Queue(s) => SubscriberKey::of(s),
            Subscriber::Callback(f) => SubscriberKey::of(f),
            Subscriber::AsyncCallback(f) => SubscriberKey::of(f),
        }
    }
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        match self {
            Subscriber::Queue(s) => Subscriber::Queue(s.clone()),
            Subscriber::Callback(f) => Subscriber::Callback(f.clone()),
            Subscriber::AsyncCallback(f) => Subscriber::AsyncCallback(f.clone()),
        }
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscriber::Queue(_) => write!(f, "Queue(..)"),
            Subscriber::Callback(_) => write!(f, "Callback(..)"),
            Subscriber::AsyncCallback(_) => write!(f, "AsyncCallback(..)"),
        }
    }
}

impl<T, S> From<Arc<S>> for Subscriber<T>
where
    T: Send + 'static,
    S: Subscription<Item = T>,
{
    fn from(subscription: Arc<S>) -> Self {
        Subscriber::Queue(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let q = Queue::new();
        for i in 0..5 {
            q.put_nowait(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(q.get().await.unwrap(), i);
        }
        assert_eq!(q.try_get().unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_queue_drains_then_reports_closed() {
        let q = Queue::new();
        q.put_nowait("a").unwrap();
        q.close();
        assert!(matches!(q.put_nowait("b"), Err(Error::Closed)));
        assert_eq!(q.get().await.unwrap(), "a");
        assert!(matches!(q.get().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_cancelled_get_loses_nothing() {
        let q = Queue::<u32>::shared();
        let pending = tokio::time::timeout(std::time::Duration::from_millis(10), q.get()).await;
        assert!(pending.is_err());
        q.put_nowait(7).unwrap();
        assert_eq!(q.get().await.unwrap(), 7);
    }

    #[test]
    fn test_subscriber_identity() {
        let q = Queue::<u8>::shared();
        let a: Subscriber<u8> = q.clone().into();
        let b = Subscriber::queue(q);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.kind(), SubscriberKind::Queue);

        let cb = Subscriber::<u8>::callback(|_| {});
        assert_eq!(cb.key(), cb.clone().key());
        assert_ne!(cb.key(), a.key());

        let acb = Subscriber::<u8>::async_callback(|_| async {});
        assert_eq!(acb.kind(), SubscriberKind::AsyncCallback);
    }
}
