//! Readiness and shutdown state shared by producers and consumers.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

const STARTING: u8 = 0;
const READY: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle of a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Constructing, or background setup still running
    Starting,
    /// May produce or consume
    Ready,
    /// Closed; terminal
    Closed,
}

/// Tri-state readiness flag, cheap to clone and share across threads.
///
/// Once `Closed` it never leaves that state.
#[derive(Debug, Clone)]
pub struct Readiness(Arc<AtomicU8>);

impl Readiness {
    /// Create a flag, starting out ready if `ready` is set
    pub fn new(ready: bool) -> Self {
        Self(Arc::new(AtomicU8::new(if ready { READY } else { STARTING })))
    }

    /// Current state
    pub fn state(&self) -> ReadyState {
        match self.0.load(Ordering::Acquire) {
            STARTING => ReadyState::Starting,
            READY => ReadyState::Ready,
            _ => ReadyState::Closed,
        }
    }

    /// Whether the component is ready
    pub fn is_ready(&self) -> bool {
        self.state() == ReadyState::Ready
    }

    /// Mark the component ready. Returns false if it was already closed.
    pub fn set_ready(&self) -> bool {
        self.0
            .compare_exchange(STARTING, READY, Ordering::AcqRel, Ordering::Acquire)
            .map_or_else(|current| current == READY, |_| true)
    }

    /// Move to the terminal state. Returns true if this call closed it.
    pub fn close(&self) -> bool {
        self.0.swap(CLOSED, Ordering::AcqRel) != CLOSED
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Monotonic shutdown flag: false until set, then true forever.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    /// Create an unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether shutdown was requested
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Request shutdown. Returns true if this call set the flag.
    pub fn set(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_transitions() {
        let r = Readiness::new(false);
        assert_eq!(r.state(), ReadyState::Starting);
        assert!(r.set_ready());
        assert!(r.is_ready());
        assert!(r.set_ready());

        assert!(r.close());
        assert!(!r.close());
        assert!(!r.set_ready());
        assert_eq!(r.state(), ReadyState::Closed);
    }

    #[test]
    fn test_shutdown_flag_is_monotonic() {
        let flag = ShutdownFlag::new();
        let shared = flag.clone();
        assert!(!shared.is_set());
        assert!(flag.set());
        assert!(!flag.set());
        assert!(shared.is_set());
    }
}
