//! The child-process side of a [`ProcessProducer`](super::process::ProcessProducer).
//!
//! A worker binary calls [`run`] with its acquisition routine. Parent and worker
//! talk over one newline-delimited JSON channel: frames from the worker go to
//! stdout, control frames from the parent arrive on stdin. End of input counts as
//! a shutdown request, so a worker never outlives a parent that went away.
//!
//! Nothing else may write to stdout in a worker process.
//!
//! ```rust,no_run
//! use subweld::producer::worker;
//!
//! fn main() -> subweld::Result<()> {
//!     worker::run(|ctx| {
//!         ctx.set_ready()?;
//!         let mut tick = 0u64;
//!         while !ctx.should_close() {
//!             ctx.put(tick)?;
//!             tick += 1;
//!             std::thread::sleep(std::time::Duration::from_millis(100));
//!         }
//!         Ok(())
//!     })
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error, warn};

use crate::core::{Error, Result, ShutdownFlag};

/// Environment variable set on every worker process
pub const WORKER_ENV: &str = "SUBWELD_WORKER";

/// Whether this process was started by a [`ProcessProducer`](super::process::ProcessProducer)
pub fn is_worker() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

/// Frames sent from the worker to the parent
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum WorkerFrame<T> {
    Ready,
    Item { data: T },
    Stopped { error: Option<String> },
}

/// Frames sent from the parent to the worker
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ControlFrame {
    Shutdown,
}

/// Write one frame as a single line and flush it
pub(crate) fn write_frame<W, F>(writer: &mut W, frame: &F) -> Result<()>
where
    W: Write + ?Sized,
    F: Serialize,
{
    serde_json::to_writer(&mut *writer, frame)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Handle given to the routine running inside a worker process.
pub struct WorkerContext<T> {
    output: Mutex<Box<dyn Write + Send>>,
    shutdown: ShutdownFlag,
    ready_sent: AtomicBool,
    _item: PhantomData<fn(T)>,
}

impl<T: Serialize> WorkerContext<T> {
    fn send<F: Serialize>(&self, frame: &F) -> Result<()> {
        let mut output = self
            .output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        write_frame(&mut **output, frame)
    }

    /// Tell the parent acquisition is set up. Only the first call sends anything.
    pub fn set_ready(&self) -> Result<()> {
        if self.ready_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.send(&WorkerFrame::<&T>::Ready)
    }

    /// Whether the parent asked the worker to stop
    pub fn should_close(&self) -> bool {
        self.shutdown.is_set()
    }

    /// Send an item to the parent for broadcast
    pub fn put(&self, item: T) -> Result<()> {
        self.send(&WorkerFrame::Item { data: &item })
    }
}

/// Run `routine` as a worker over this process's stdin and stdout.
///
/// SIGINT is ignored with a warning while the routine runs; the parent decides
/// when its workers stop. Errors and panics of the routine are reported to the
/// parent in the final `stopped` frame and returned.
pub fn run<T, F>(routine: F) -> Result<()>
where
    T: Serialize,
    F: FnOnce(&WorkerContext<T>) -> Result<()>,
{
    let interrupt = InterruptGuard::install();
    let result = run_with(BufReader::new(std::io::stdin()), std::io::stdout(), routine);
    drop(interrupt);
    result
}

/// Run `routine` as a worker over arbitrary input and output streams.
pub fn run_with<T, R, W, F>(input: R, output: W, routine: F) -> Result<()>
where
    T: Serialize,
    R: BufRead + Send + 'static,
    W: Write + Send + 'static,
    F: FnOnce(&WorkerContext<T>) -> Result<()>,
{
    let context = WorkerContext {
        output: Mutex::new(Box::new(output)),
        shutdown: ShutdownFlag::new(),
        ready_sent: AtomicBool::new(false),
        _item: PhantomData,
    };

    let shutdown = context.shutdown.clone();
    // Never joined: a blocking read on stdin cannot be interrupted.
    thread::Builder::new()
        .name("subweld-control".to_string())
        .spawn(move || watch_control(input, shutdown))?;

    debug!("worker routine starting");
    let result = match catch_unwind(AssertUnwindSafe(|| routine(&context))) {
        Ok(result) => result,
        Err(payload) => Err(Error::from_panic(payload)),
    };

    let error = match &result {
        Ok(()) => {
            debug!("worker routine finished");
            None
        }
        Err(e) => {
            error!(error = %e, "worker routine failed");
            Some(e.to_string())
        }
    };
    context.shutdown.set();
    if let Err(e) = context.send(&WorkerFrame::<&T>::Stopped { error }) {
        warn!(error = %e, "could not report worker stop to parent");
    }
    result
}

fn watch_control<R: BufRead>(input: R, shutdown: ShutdownFlag) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "control channel read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ControlFrame>(&line) {
            Ok(ControlFrame::Shutdown) => {
                debug!("shutdown requested by parent");
                break;
            }
            Err(e) => warn!(error = %e, "ignoring malformed control frame"),
        }
    }
    shutdown.set();
}

/// Swallows SIGINT for as long as it lives. Once dropped, SIGINT terminates the
/// process again.
struct InterruptGuard {
    #[cfg(unix)]
    registration: Option<(signal_hook::SigId, Arc<AtomicBool>)>,
}

/// Raised whenever no guard is installed. Backs a single process-wide
/// conditional-default action for SIGINT.
#[cfg(unix)]
static SIGINT_DEFAULT: std::sync::OnceLock<Option<Arc<AtomicBool>>> = std::sync::OnceLock::new();

#[cfg(unix)]
fn sigint_default() -> Option<&'static Arc<AtomicBool>> {
    SIGINT_DEFAULT
        .get_or_init(|| {
            let restore = Arc::new(AtomicBool::new(true));
            match signal_hook::flag::register_conditional_default(signal_hook::consts::SIGINT, restore.clone()) {
                Ok(_) => Some(restore),
                Err(e) => {
                    warn!(error = %e, "could not install SIGINT fallback");
                    None
                }
            }
        })
        .as_ref()
}

impl InterruptGuard {
    #[cfg(unix)]
    fn install() -> Self {
        let Some(restore) = sigint_default() else {
            return Self { registration: None };
        };
        let flag = Arc::new(AtomicBool::new(false));
        match signal_hook::flag::register(signal_hook::consts::SIGINT, flag.clone()) {
            Ok(id) => {
                restore.store(false, Ordering::Release);
                Self {
                    registration: Some((id, flag)),
                }
            }
            Err(e) => {
                warn!(error = %e, "could not install SIGINT handler");
                Self { registration: None }
            }
        }
    }

    #[cfg(not(unix))]
    fn install() -> Self {
        Self {}
    }

    /// Whether SIGINT arrived while the guard was installed
    #[cfg(unix)]
    fn interrupted(&self) -> bool {
        self.registration
            .as_ref()
            .is_some_and(|(_, flag)| flag.load(Ordering::Acquire))
    }
}

#[cfg(unix)]
impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.interrupted() {
            warn!("worker received SIGINT; ignored, the parent process handles interrupts");
        }
        if let Some((id, _)) = self.registration.take() {
            signal_hook::low_level::unregister(id);
            if let Some(restore) = sigint_default() {
                restore.store(true, Ordering::Release);
            }
        }
    }
}
