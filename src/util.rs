//! Utility functions and helper types.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::{Error, Result};

/// Run `future` until it completes or `token` is cancelled.
///
/// Cancellation is checked first, so once the token fires no further output of
/// `future` is observed; the future is dropped and must be cancel-safe.
pub async fn cancellable<F>(future: F, token: &CancellationToken) -> Result<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        output = future => Ok(output),
    }
}

/// Poll `check` every `interval` until it returns `Some`, or `timeout` elapses.
///
/// Used to wait on things that only offer a non-blocking check, such as
/// [`std::process::Child::try_wait`].
pub fn poll_until<T, F>(timeout: Duration, interval: Duration, mut check: F) -> Result<Option<T>>
where
    F: FnMut() -> Result<Option<T>>,
{
    let start = Instant::now();
    loop {
        if let Some(value) = check()? {
            return Ok(Some(value));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        std::thread::sleep(interval.min(timeout.saturating_sub(start.elapsed())));
    }
}
