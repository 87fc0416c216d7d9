//! # Subscription fan-out and switchable consumers
//!
//! This crate provides the plumbing for data-flow components that hand items to
//! each other through subscriptions, designed around tokio and Rust's ownership
//! model rather than shared mutable state.
//!
//! ## Core Concepts
//!
//! - **Subscription**: A buffer (or callback) items are pushed into and read from
//! - **Producer**: Keeps a registry of subscribers and broadcasts each item to all of them
//! - **Consumer**: Reads from one switchable subscription; swapping it interrupts a pending wait
//! - **Duplex**: A consumer and a producer with one lifecycle, for filters and transforms
//! - **Bridges**: Producers and consumers whose work runs on an OS thread or in a child process
//!
//! ## Example
//!
//! ```rust
//! use subweld::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let camera = Producer::<u64>::default();
//!     let recorder = Consumer::<u64>::default();
//!     recorder.put_subscription(camera.subscribe());
//!
//!     camera.subscribe_with(Subscriber::callback(|frame: u64| println!("frame {frame}")));
//!
//!     for frame in 1..=3 {
//!         camera.broadcast(frame);
//!     }
//!     for frame in 1..=3 {
//!         assert_eq!(recorder.next().await?, frame);
//!     }
//!
//!     camera.close();
//!     recorder.close();
//!     Ok(())
//! }
//! ```

pub mod consumer;
pub mod core;
pub mod duplex;
pub mod producer;
pub mod subscriptions;
pub mod util;

// Re-export commonly used items
pub mod prelude {
    pub use crate::consumer::{Consumer, ConsumerConfig};
    pub use crate::core::{Error, ReadyState, Result, Subscription, ThreadConfig};
    pub use crate::duplex::Duplex;
    pub use crate::producer::{Producer, ProducerConfig};
    pub use crate::subscriptions::{Queue, SharedSubscription, Subscriber};
}

// Re-export main error type
pub use crate::core::{Error, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
