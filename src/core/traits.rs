//! Core traits for the subscription system.
//!
//! A subscription is the pipe between a producer and whoever reads its data:
//! producers push into it without ever waiting, readers pull from it and suspend
//! until something arrives. Everything else in this crate is built on this one
//! contract.

use crate::core::error::Result;
use async_trait::async_trait;

/// A buffered sink/source pair used to move items from a producer to a reader.
///
/// Producers call [`put_nowait`](Subscription::put_nowait) for every item they
/// broadcast; consumers call [`get`](Subscription::get) to receive the next one.
/// `get` must be cancel-safe: if the returned future is dropped before it
/// completes, no item may be lost.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use std::sync::Mutex;
/// use subweld::core::{Error, Result, Subscription};
///
/// /// Keeps only the most recent value.
/// struct Latest {
///     value: Mutex<Option<u32>>,
///     notify: tokio::sync::Notify,
/// }
///
/// #[async_trait]
/// impl Subscription for Latest {
///     type Item = u32;
///
///     fn put_nowait(&self, item: u32) -> Result<()> {
///         *self.value.lock().map_err(|_| Error::custom("poisoned"))? = Some(item);
///         self.notify.notify_one();
///         Ok(())
///     }
///
///     async fn get(&self) -> Result<u32> {
///         loop {
///             let notified = self.notify.notified();
///             let taken = self.value.lock().map_err(|_| Error::custom("poisoned"))?.take();
///             if let Some(v) = taken {
///                 return Ok(v);
///             }
///             notified.await;
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Subscription: Send + Sync + 'static {
    /// The type of items carried by this subscription
    type Item: Send + 'static;

    /// Enqueue an item without suspending.
    ///
    /// Overflow policy is the subscription's own concern; the default
    /// [`Queue`](crate::subscriptions::Queue) is unbounded.
    fn put_nowait(&self, item: Self::Item) -> Result<()>;

    /// Wait for the next item.
    ///
    /// Returns [`Error::Closed`](crate::core::Error::Closed) once the subscription
    /// is exhausted and will never yield another item.
    async fn get(&self) -> Result<Self::Item>;

    /// Stop accepting items. Items already buffered stay readable.
    ///
    /// Called by a producer on every queue subscriber when it closes.
    fn close(&self) {}
}
