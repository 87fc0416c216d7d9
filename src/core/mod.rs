//! Core traits and types for the subweld library.
//!
//! This module contains the subscription contract, the error type, and the
//! lifecycle flags every producer and consumer carries.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod traits;

// Re-export core items
pub use config::ThreadConfig;
pub use error::{Error, Result};
pub use lifecycle::{ReadyState, Readiness, ShutdownFlag};
pub use traits::Subscription;
