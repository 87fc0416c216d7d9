//! Components that both consume and produce, such as filters and transforms.

use crate::consumer::{Consumer, ConsumerConfig};
use crate::core::Result;
use crate::producer::{Producer, ProducerConfig};
use crate::subscriptions::{SharedSubscription, Subscriber};

/// A consumer of `In` and a producer of `Out` sharing one lifecycle.
///
/// The two halves keep their own state; the duplex only ties readiness and
/// closing together.
///
/// # Examples
///
/// ```rust
/// use subweld::prelude::*;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<()> {
/// let source = Producer::<u32>::default();
/// let doubler = Duplex::<u32, u32>::default();
/// let output = doubler.subscribe();
///
/// doubler.put_subscription(source.subscribe());
/// source.broadcast(21);
///
/// let item = doubler.next().await?;
/// doubler.broadcast(item * 2);
/// assert_eq!(output.get().await?, 42);
///
/// doubler.close();
/// assert!(doubler.next().await.unwrap_err().is_closed());
/// # Ok(())
/// # }
/// ```
pub struct Duplex<In, Out> {
    consumer: Consumer<In>,
    producer: Producer<Out>,
}

impl<In, Out> Clone for Duplex<In, Out> {
    fn clone(&self) -> Self {
        Self {
            consumer: self.consumer.clone(),
            producer: self.producer.clone(),
        }
    }
}

impl<In, Out> Duplex<In, Out>
where
    In: Send + 'static,
    Out: Clone + Send + 'static,
{
    /// Create a duplex from the configuration of each half
    pub fn new(consumer: ConsumerConfig<In>, producer: ProducerConfig<Out>) -> Self {
        Self {
            consumer: Consumer::new(consumer),
            producer: Producer::new(producer),
        }
    }

    /// The inbound half
    pub fn consumer(&self) -> &Consumer<In> {
        &self.consumer
    }

    /// The outbound half
    pub fn producer(&self) -> &Producer<Out> {
        &self.producer
    }

    /// Wait for the next inbound item. See [`Consumer::next`].
    pub async fn next(&self) -> Result<In> {
        self.consumer.next().await
    }

    /// Push an inbound item directly. See [`Consumer::put_nowait`].
    pub fn put_nowait(&self, item: In) -> Result<()> {
        self.consumer.put_nowait(item)
    }

    /// Read inbound items from `subscription`
    pub fn put_subscription(&self, subscription: SharedSubscription<In>) {
        self.consumer.put_subscription(subscription)
    }

    /// Detach the inbound subscription
    pub fn stop(&self) {
        self.consumer.stop()
    }

    /// The inbound subscription, if an external one is active
    pub fn subscription(&self) -> Option<SharedSubscription<In>> {
        self.consumer.subscription()
    }

    /// Subscribe to outbound items
    pub fn subscribe(&self) -> SharedSubscription<Out> {
        self.producer.subscribe()
    }

    /// Register an outbound subscriber
    pub fn subscribe_with(&self, subscriber: impl Into<Subscriber<Out>>) -> Subscriber<Out> {
        self.producer.subscribe_with(subscriber)
    }

    /// Remove an outbound subscriber
    pub fn unsubscribe(&self, subscriber: &Subscriber<Out>) -> Result<()> {
        self.producer.unsubscribe(subscriber)
    }

    /// Wait for the next outbound item on the default subscription
    pub async fn get(&self) -> Result<Out> {
        self.producer.get().await
    }

    /// Deliver an outbound item to every subscriber
    pub fn broadcast(&self, item: Out) {
        self.producer.broadcast(item)
    }

    /// Mark both halves ready
    pub fn set_ready(&self) {
        self.consumer.set_ready();
        self.producer.set_ready();
    }

    /// Whether both halves are ready
    pub fn is_ready(&self) -> bool {
        self.consumer.is_ready() && self.producer.is_ready()
    }

    /// Whether the duplex was closed
    pub fn is_closed(&self) -> bool {
        self.consumer.is_closed() && self.producer.is_closed()
    }

    /// Close both halves. Calling it again does nothing.
    pub fn close(&self) {
        self.consumer.close();
        self.producer.close();
    }
}

impl<In, Out> Default for Duplex<In, Out>
where
    In: Send + 'static,
    Out: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new(ConsumerConfig::default(), ProducerConfig::default())
    }
}

impl<In, Out> std::fmt::Debug for Duplex<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Duplex")
            .field("consumer", &self.consumer)
            .field("producer", &self.producer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Error, Subscription};

    #[tokio::test]
    async fn test_close_closes_both_halves() {
        let duplex = Duplex::<u32, String>::default();
        let output = duplex.subscribe();
        duplex.broadcast("last".to_string());

        duplex.close();
        duplex.close();

        assert!(duplex.is_closed());
        assert!(!duplex.is_ready());
        assert!(matches!(duplex.next().await, Err(Error::Closed)));
        assert_eq!(output.get().await.unwrap(), "last");
        assert!(matches!(output.get().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_readiness_needs_both_halves() {
        let duplex = Duplex::<u32, u32>::new(
            ConsumerConfig::default().ready(false),
            ProducerConfig::default(),
        );
        assert!(!duplex.is_ready());
        duplex.set_ready();
        assert!(duplex.is_ready());
    }

    #[tokio::test]
    async fn test_stage_chain() {
        let upstream = Producer::<u32>::default();
        let stage = Duplex::<u32, String>::default();
        let downstream = Consumer::<String>::default();

        stage.put_subscription(upstream.subscribe());
        downstream.put_subscription(stage.subscribe());

        let worker = tokio::spawn({
            let stage = stage.clone();
            async move {
                while let Ok(n) = stage.next().await {
                    stage.broadcast(format!("#{n}"));
                }
            }
        });

        for n in 1..=3 {
            upstream.broadcast(n);
        }
        for n in 1..=3 {
            assert_eq!(downstream.next().await.unwrap(), format!("#{n}"));
        }

        stage.close();
        worker.await.unwrap();
    }
}
