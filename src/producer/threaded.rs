//! Producers whose data acquisition runs on a dedicated OS thread.
//!
//! Blocking acquisition code (device reads, synchronous SDKs) runs in a routine on
//! a worker thread. Every item it hands to [`ProducerContext::put`] crosses a
//! bounded channel to a pump task on the runtime that owns the producer, which
//! broadcasts it. Subscribers therefore only ever see broadcasts from the pump, in
//! the order the routine produced them.

use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{Producer, ProducerConfig};
use crate::core::{Error, Readiness, Result, ShutdownFlag, ThreadConfig};

/// The worker-thread side of a [`ThreadedProducer`].
pub struct ProducerContext<T> {
    sender: mpsc::Sender<T>,
    readiness: Readiness,
    shutdown: ShutdownFlag,
}

impl<T: Send + 'static> ProducerContext<T> {
    /// Mark the producer ready; call once acquisition is set up
    pub fn set_ready(&self) {
        self.readiness.set_ready();
    }

    /// Whether the routine should return
    pub fn should_close(&self) -> bool {
        self.shutdown.is_set()
    }

    /// Hand an item to the owning runtime for broadcast.
    ///
    /// Blocks while the channel is full. Fails with [`Error::Closed`] if the
    /// runtime side has gone away.
    pub fn put(&self, item: T) -> Result<()> {
        self.sender.blocking_send(item).map_err(Error::from)
    }
}

/// A [`Producer`] fed by a routine running on its own thread.
///
/// Dereferences to the inner [`Producer`] for subscribing and reading. The
/// producer starts out not ready; the routine calls
/// [`ProducerContext::set_ready`]. When the routine returns (or panics) the
/// remaining items are broadcast and the producer closes itself.
///
/// # Examples
///
/// ```rust
/// use subweld::prelude::*;
/// use subweld::producer::threaded::ThreadedProducer;
///
/// # #[tokio::main]
/// # async fn main() -> Result<()> {
/// let (go, wait) = crossbeam_channel::unbounded::<()>();
/// let producer = ThreadedProducer::spawn(
///     ProducerConfig::default(),
///     ThreadConfig::default().name("counter"),
///     move |ctx| {
///         ctx.set_ready();
///         let _ = wait.recv();
///         for i in 0..3u32 {
///             ctx.put(i)?;
///         }
///         Ok(())
///     },
/// )?;
///
/// let subscription = producer.subscribe();
/// go.send(()).unwrap();
/// for i in 0..3 {
///     assert_eq!(subscription.get().await?, i);
/// }
/// assert!(subscription.get().await.unwrap_err().is_closed());
///
/// tokio::task::spawn_blocking(move || producer.close()).await.unwrap();
/// # Ok(())
/// # }
/// ```
pub struct ThreadedProducer<T> {
    producer: Producer<T>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<T> ThreadedProducer<T>
where
    T: Clone + Send + 'static,
{
    /// Start `routine` on a new thread. Must be called inside a tokio runtime,
    /// which becomes the producer's owning runtime.
    pub fn spawn<F>(config: ProducerConfig<T>, settings: ThreadConfig, routine: F) -> Result<Self>
    where
        F: FnOnce(ProducerContext<T>) -> Result<()> + Send + 'static,
    {
        let runtime = Handle::try_current()
            .map_err(|_| Error::custom("threaded producer must be spawned inside a tokio runtime"))?;
        let producer = Producer::new(config.ready(false));
        let (sender, receiver) = mpsc::channel(settings.channel_capacity.max(1));

        let pump = runtime.spawn(pump(producer.clone(), receiver));

        let context = ProducerContext {
            sender,
            readiness: producer.readiness(),
            shutdown: producer.shutdown_flag(),
        };
        let name = settings.name.clone();
        let worker = thread::Builder::new().name(settings.name).spawn(move || {
            debug!(thread = %name, "producer worker started");
            match catch_unwind(AssertUnwindSafe(move || routine(context))) {
                Ok(Ok(())) => debug!(thread = %name, "producer worker finished"),
                Ok(Err(e)) => error!(thread = %name, error = %e, "producer worker failed"),
                Err(payload) => {
                    error!(thread = %name, error = %Error::from_panic(payload), "producer worker panicked")
                }
            }
        });
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                pump.abort();
                producer.close();
                return Err(e.into());
            }
        };

        Ok(Self {
            producer,
            worker: Mutex::new(Some(worker)),
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Ask the routine to stop, wait for it, then wait for the pump to broadcast
    /// everything it produced. Calling it again does nothing.
    ///
    /// Blocks the calling thread. From async code, call it through
    /// [`tokio::task::spawn_blocking`].
    pub fn close(&self) {
        if self.producer.shutdown_flag().set() {
            debug!("closing threaded producer");
        }

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(payload) = worker.join() {
                error!(error = %Error::from_panic(payload), "producer worker thread panicked");
            }
        }

        let pump = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(pump) = pump {
            if let Err(e) = futures::executor::block_on(pump) {
                warn!(error = %e, "producer pump did not finish cleanly");
            }
        }

        self.producer.close();
    }

    /// The inner producer
    pub fn producer(&self) -> &Producer<T> {
        &self.producer
    }
}

impl<T> Deref for ThreadedProducer<T> {
    type Target = Producer<T>;

    fn deref(&self) -> &Self::Target {
        &self.producer
    }
}

impl<T> Drop for ThreadedProducer<T> {
    fn drop(&mut self) {
        // The routine is told to stop but never joined here.
        self.producer.shared.shutdown.set();
    }
}

impl<T> std::fmt::Debug for ThreadedProducer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedProducer")
            .field("producer", &self.producer)
            .finish_non_exhaustive()
    }
}

/// Broadcast everything the worker sends, then close the producer.
pub(crate) async fn pump<T>(producer: Producer<T>, mut receiver: mpsc::Receiver<T>)
where
    T: Clone + Send + 'static,
{
    while let Some(item) = receiver.recv().await {
        producer.broadcast(item);
    }
    debug!("worker channel drained, closing producer");
    producer.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Subscription;
    use std::sync::Arc;
    use std::time::Duration;

    fn gated<F>(routine: F) -> (crossbeam_channel::Sender<()>, impl FnOnce(ProducerContext<u32>) -> Result<()>)
    where
        F: FnOnce(&ProducerContext<u32>) -> Result<()> + Send + 'static,
    {
        let (go, wait) = crossbeam_channel::unbounded::<()>();
        (go, move |ctx: ProducerContext<u32>| {
            ctx.set_ready();
            let _ = wait.recv();
            routine(&ctx)
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_delivers_all_items_then_closes() {
        let (go, routine) = gated(|ctx| {
            for i in 0..100 {
                ctx.put(i)?;
            }
            Ok(())
        });
        let producer = Arc::new(
            ThreadedProducer::spawn(ProducerConfig::default(), ThreadConfig::default(), routine)
                .unwrap(),
        );
        let subscription = producer.subscribe();
        go.send(()).unwrap();

        for i in 0..100 {
            assert_eq!(subscription.get().await.unwrap(), i);
        }
        assert!(matches!(subscription.get().await, Err(Error::Closed)));

        let closer = producer.clone();
        tokio::task::spawn_blocking(move || closer.close()).await.unwrap();
        assert!(producer.is_closed());
        assert!(!producer.is_ready());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_stops_a_running_routine() {
        let producer = Arc::new(
            ThreadedProducer::spawn(
                ProducerConfig::default(),
                ThreadConfig::default().channel_capacity(4),
                |ctx: ProducerContext<u32>| {
                    ctx.set_ready();
                    let mut i = 0;
                    while !ctx.should_close() {
                        ctx.put(i)?;
                        i += 1;
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Ok(())
                },
            )
            .unwrap(),
        );
        let subscription = producer.subscribe();
        let first = subscription.get().await.unwrap();

        let closer = producer.clone();
        tokio::task::spawn_blocking(move || closer.close()).await.unwrap();
        let closer = producer.clone();
        tokio::task::spawn_blocking(move || closer.close()).await.unwrap();

        let mut last = first;
        loop {
            match subscription.get().await {
                Ok(item) => {
                    assert_eq!(item, last + 1);
                    last = item;
                }
                Err(e) => {
                    assert!(e.is_closed());
                    break;
                }
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_routine_still_closes() {
        let (go, routine) = gated(|ctx| {
            ctx.put(1)?;
            panic!("sensor unplugged");
        });
        let producer = Arc::new(
            ThreadedProducer::spawn(ProducerConfig::default(), ThreadConfig::default(), routine)
                .unwrap(),
        );
        let subscription = producer.subscribe();
        go.send(()).unwrap();

        assert_eq!(subscription.get().await.unwrap(), 1);
        assert!(matches!(subscription.get().await, Err(Error::Closed)));

        let closer = producer.clone();
        tokio::task::spawn_blocking(move || closer.close()).await.unwrap();
    }

    #[test]
    fn test_spawn_outside_runtime_fails() {
        let result = ThreadedProducer::<u32>::spawn(
            ProducerConfig::default(),
            ThreadConfig::default(),
            |_| Ok(()),
        );
        assert!(result.is_err());
    }
}
