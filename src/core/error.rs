//! Error types for producers, consumers and subscriptions.

use std::sync::Arc;
use thiserror::Error;

/// The main error type for subscription producers and consumers.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The consumer (or the subscription being read) was closed and no more data
    /// will arrive. This is the normal termination signal for a processing loop.
    #[error("subscription closed")]
    Closed,

    /// An in-flight wait was interrupted by a subscription swap or a close request
    #[error("wait was cancelled")]
    Cancelled,

    /// `unsubscribe` was called with something that is not a current subscriber
    #[error("subscriber is not registered with this producer")]
    NotRegistered,

    /// A bounded wait elapsed
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// A subscription failed while being read or written
    #[error("subscription error: {0}")]
    Subscription(Arc<dyn std::error::Error + Send + Sync>),

    /// Transport failure on a worker process pipe
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// A frame on the worker process channel could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),

    /// A worker thread or worker routine panicked
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),

    /// A custom error with a message
    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// Create a subscription error from any error type
    pub fn subscription<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Subscription(Arc::new(error))
    }

    /// Create a timeout error
    pub fn timeout(duration: std::time::Duration) -> Self {
        Error::Timeout {
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Create a custom error with a message
    pub fn custom<S: Into<String>>(message: S) -> Self {
        Error::Custom(message.into())
    }

    /// Whether this is the terminal closed signal
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    /// Build a [`Error::WorkerPanicked`] from a caught panic payload
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Error::WorkerPanicked(message)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Closed
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Custom(s.to_string())
    }
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_payloads() {
        let err = Error::from_panic(Box::new("boom"));
        assert!(matches!(err, Error::WorkerPanicked(ref m) if m == "boom"));

        let err = Error::from_panic(Box::new(String::from("bang")));
        assert!(matches!(err, Error::WorkerPanicked(ref m) if m == "bang"));

        let err = Error::from_panic(Box::new(42u8));
        assert!(matches!(err, Error::WorkerPanicked(_)));
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::Closed.to_string(), "subscription closed");
        assert_eq!(
            Error::timeout(std::time::Duration::from_millis(250)).to_string(),
            "operation timed out after 250ms"
        );
        assert!(Error::Closed.is_closed());
        assert!(!Error::NotRegistered.is_closed());
    }

    #[test]
    fn test_subscription_error_keeps_source() {
        let err = Error::subscription(std::io::Error::other("usb unplugged"));
        assert_eq!(err.to_string(), "subscription error: usb unplugged");
        let copy = err.clone();
        assert!(matches!(copy, Error::Subscription(ref source) if source.to_string() == "usb unplugged"));
    }
}
