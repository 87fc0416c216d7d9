//! Consumers whose processing runs on a dedicated OS thread.
//!
//! The routine pulls items with the blocking [`ConsumerContext::next`]. Each wait
//! is submitted to the consumer's owning runtime as a cancellable `get` on the
//! active subscription, so swaps and closes from any thread interrupt it exactly
//! like they interrupt [`Consumer::next`].

use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, error, trace, warn};

use super::{Consumer, ConsumerConfig};
use crate::core::{Error, Result, ThreadConfig};
use crate::util::cancellable;

/// The worker-thread side of a [`ThreadedConsumer`].
pub struct ConsumerContext<T> {
    consumer: Consumer<T>,
    runtime: Handle,
    poll_interval: Duration,
    pending: Option<Receiver<Result<T>>>,
}

impl<T: Send + 'static> ConsumerContext<T> {
    /// Mark the consumer ready; call once processing is set up
    pub fn set_ready(&self) {
        self.consumer.set_ready();
    }

    /// Whether the routine should return
    pub fn should_close(&self) -> bool {
        self.consumer.is_closed()
    }

    /// Block until the next item arrives on whichever subscription is active.
    ///
    /// Fails with [`Error::Closed`] once the consumer is closed, within one
    /// `poll_interval`.
    pub fn next(&mut self) -> Result<T> {
        self.wait(None)
    }

    /// Like [`next`](ConsumerContext::next), but gives up with [`Error::Timeout`]
    /// after `timeout`. The wait stays in flight, so the next call picks up an item
    /// that arrives in between.
    pub fn next_timeout(&mut self, timeout: Duration) -> Result<T> {
        self.wait(Some(timeout))
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<T> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let pending = match self.pending.take() {
                Some(pending) => pending,
                None => match self.submit() {
                    Some(pending) => pending,
                    None => return Err(Error::Closed),
                },
            };

            let mut step = self.poll_interval;
            if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    self.pending = Some(pending);
                    return Err(Error::timeout(timeout));
                }
                step = step.min(left);
            }

            match pending.recv_timeout(step) {
                Ok(Ok(item)) => return Ok(item),
                Ok(Err(Error::Cancelled)) => debug!("subscription switched, checking for the new one"),
                Ok(Err(e)) => warn!(error = %e, "unexpected error from subscription, ignoring"),
                Err(RecvTimeoutError::Timeout) => {
                    if self.consumer.is_closed() {
                        return Err(Error::Closed);
                    }
                    trace!("no data yet, still waiting");
                    // Keep the same get in flight so no item is taken twice.
                    self.pending = Some(pending);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("owning runtime dropped the pending wait");
                    return Err(Error::Closed);
                }
            }
        }
    }

    fn submit(&self) -> Option<Receiver<Result<T>>> {
        self.consumer.submit_wait(|subscription, generation| {
            let (outcome, pending) = crossbeam_channel::bounded(1);
            self.runtime.spawn(async move {
                let result = match cancellable(subscription.get(), &generation).await {
                    Ok(Ok(item)) => Ok(item),
                    Ok(Err(Error::Closed)) => {
                        debug!("incoming subscription closed, waiting for a new one");
                        generation.cancelled().await;
                        Err(Error::Cancelled)
                    }
                    Ok(Err(e)) => {
                        tokio::task::yield_now().await;
                        Err(e)
                    }
                    Err(e) => Err(e),
                };
                let _ = outcome.send(result);
            });
            pending
        })
    }
}

/// A [`Consumer`] drained by a routine running on its own thread.
///
/// Dereferences to the inner [`Consumer`], so subscriptions can be swapped and
/// items pushed from async code while the routine is blocked. The consumer
/// starts out not ready; the routine calls [`ConsumerContext::set_ready`].
///
/// # Examples
///
/// ```rust
/// use subweld::prelude::*;
/// use subweld::consumer::threaded::ThreadedConsumer;
///
/// # #[tokio::main]
/// # async fn main() -> Result<()> {
/// let (seen, mut results) = tokio::sync::mpsc::unbounded_channel();
/// let consumer = ThreadedConsumer::<&str>::spawn(
///     ConsumerConfig::default(),
///     ThreadConfig::default(),
///     move |mut ctx| {
///         ctx.set_ready();
///         while let Ok(line) = ctx.next() {
///             let _ = seen.send(format!("processed {line}"));
///         }
///         Ok(())
///     },
/// )?;
///
/// consumer.put_nowait("frame")?;
/// assert_eq!(results.recv().await.unwrap(), "processed frame");
///
/// tokio::task::spawn_blocking(move || consumer.close()).await.unwrap();
/// # Ok(())
/// # }
/// ```
pub struct ThreadedConsumer<T> {
    consumer: Consumer<T>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<T: Send + 'static> ThreadedConsumer<T> {
    /// Start `routine` on a new thread. Must be called inside a tokio runtime,
    /// which becomes the consumer's owning runtime.
    pub fn spawn<F>(config: ConsumerConfig<T>, settings: ThreadConfig, routine: F) -> Result<Self>
    where
        F: FnOnce(ConsumerContext<T>) -> Result<()> + Send + 'static,
    {
        let runtime = Handle::try_current()
            .map_err(|_| Error::custom("threaded consumer must be spawned inside a tokio runtime"))?;
        let consumer = Consumer::new(config.ready(false));

        let context = ConsumerContext {
            consumer: consumer.clone(),
            runtime,
            poll_interval: settings.poll_interval,
            pending: None,
        };
        let name = settings.name.clone();
        let worker = thread::Builder::new().name(settings.name).spawn(move || {
            debug!(thread = %name, "consumer worker started");
            match catch_unwind(AssertUnwindSafe(move || routine(context))) {
                Ok(Ok(())) => debug!(thread = %name, "consumer worker finished"),
                Ok(Err(e)) => error!(thread = %name, error = %e, "consumer worker failed"),
                Err(payload) => {
                    error!(thread = %name, error = %Error::from_panic(payload), "consumer worker panicked")
                }
            }
        });
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                consumer.close();
                return Err(e.into());
            }
        };

        Ok(Self {
            consumer,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Close the consumer and wait for the routine to return. Calling it again
    /// does nothing.
    ///
    /// Blocks the calling thread. From async code, call it through
    /// [`tokio::task::spawn_blocking`].
    pub fn close(&self) {
        self.consumer.close();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(payload) = worker.join() {
                error!(error = %Error::from_panic(payload), "consumer worker thread panicked");
            }
        }
    }

    /// The inner consumer
    pub fn consumer(&self) -> &Consumer<T> {
        &self.consumer
    }
}

impl<T> Deref for ThreadedConsumer<T> {
    type Target = Consumer<T>;

    fn deref(&self) -> &Self::Target {
        &self.consumer
    }
}

impl<T> Drop for ThreadedConsumer<T> {
    fn drop(&mut self) {
        // The routine sees `Closed` within one poll interval; it is not joined here.
        self.consumer.close();
    }
}

impl<T> std::fmt::Debug for ThreadedConsumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedConsumer")
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Subscription;
    use crate::subscriptions::Queue;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn recording(
        poll_interval: Duration,
    ) -> (Arc<ThreadedConsumer<u32>>, mpsc::UnboundedReceiver<Result<u32>>) {
        let (seen, results) = mpsc::unbounded_channel();
        let consumer = ThreadedConsumer::spawn(
            ConsumerConfig::default(),
            ThreadConfig::default().poll_interval(poll_interval),
            move |mut ctx| {
                ctx.set_ready();
                loop {
                    let next = ctx.next();
                    let done = next.is_err();
                    let _ = seen.send(next);
                    if done {
                        return Ok(());
                    }
                }
            },
        )
        .unwrap();
        (Arc::new(consumer), results)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_direct_feed_in_order() {
        let (consumer, mut results) = recording(Duration::from_millis(20));
        for i in 0..5 {
            consumer.put_nowait(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(results.recv().await.unwrap().unwrap(), i);
        }
        tokio::task::spawn_blocking(move || consumer.close())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_survives_timeouts_without_losing_items() {
        let (consumer, mut results) = recording(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        for i in 0..3 {
            consumer.put_nowait(i).unwrap();
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        for i in 0..3 {
            assert_eq!(results.recv().await.unwrap().unwrap(), i);
        }
        tokio::task::spawn_blocking(move || consumer.close())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_next_timeout_keeps_the_wait() {
        let (seen, mut results) = mpsc::unbounded_channel();
        let consumer = Arc::new(
            ThreadedConsumer::<u32>::spawn(
                ConsumerConfig::default(),
                ThreadConfig::default().poll_interval(Duration::from_millis(5)),
                move |mut ctx| {
                    let _ = seen.send(ctx.next_timeout(Duration::from_millis(20)));
                    let _ = seen.send(ctx.next_timeout(Duration::from_secs(10)));
                    Ok(())
                },
            )
            .unwrap(),
        );

        assert!(matches!(
            results.recv().await.unwrap(),
            Err(Error::Timeout { duration_ms: 20 })
        ));
        consumer.put_nowait(7).unwrap();
        assert_eq!(results.recv().await.unwrap().unwrap(), 7);
        tokio::task::spawn_blocking(move || consumer.close())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_swap_while_blocked() {
        let (consumer, mut results) = recording(Duration::from_millis(20));
        let old = Queue::shared();
        let new = Queue::shared();
        consumer.put_subscription(old.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;

        consumer.put_subscription(new.clone());
        new.put_nowait(2).unwrap();
        assert_eq!(results.recv().await.unwrap().unwrap(), 2);

        old.put_nowait(1).unwrap();
        assert_eq!(old.try_get().unwrap(), Some(1));
        tokio::task::spawn_blocking(move || consumer.close())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_ends_the_routine() {
        let (consumer, mut results) = recording(Duration::from_millis(10));
        assert!(!consumer.is_closed());

        let closer = consumer.clone();
        tokio::task::spawn_blocking(move || closer.close())
            .await
            .unwrap();
        assert!(matches!(results.recv().await.unwrap(), Err(Error::Closed)));
        assert!(consumer.is_closed());
        assert!(!consumer.is_ready());

        let closer = consumer.clone();
        tokio::task::spawn_blocking(move || closer.close())
            .await
            .unwrap();
    }
}
