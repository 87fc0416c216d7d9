//! Producers whose data acquisition runs in a child process.
//!
//! The child is any program that calls [`worker::run`](super::worker::run). Its
//! stdout carries `ready`, `item` and `stopped` frames, its stdin carries the
//! `shutdown` request. In the parent, a reader thread decodes frames and a bridge
//! thread hands items to the same kind of pump task the
//! [`ThreadedProducer`](super::threaded::ThreadedProducer) uses.
//!
//! On unix the worker leads its own process group, and a worker that has to be
//! killed takes everything it forked down with it.

use crossbeam_channel::{Receiver, Sender};
use serde::de::DeserializeOwned;
use std::io::{BufRead, BufReader};
use std::ops::Deref;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::threaded::pump;
use super::worker::{write_frame, ControlFrame, WorkerFrame, WORKER_ENV};
use super::{Producer, ProducerConfig};
use crate::core::{Error, Readiness, Result, ShutdownFlag};
use crate::util::poll_until;

const EXIT_POLL: Duration = Duration::from_millis(10);

/// Configuration for a worker process
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    /// How long `close` waits for the worker to exit before killing it, and then
    /// for its remaining output before abandoning it
    pub join_timeout: Duration,
    /// How long the bridge waits for a frame before re-checking the shutdown flag
    pub poll_interval: Duration,
    /// Items buffered between the bridge and the runtime
    pub channel_capacity: usize,
}

impl ProcessConfig {
    /// Set the graceful exit timeout
    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Set the shutdown polling interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the bridge to runtime channel capacity (at least 1)
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            channel_capacity: 1024,
        }
    }
}

#[derive(Default)]
struct Threads {
    reader: Option<thread::JoinHandle<()>>,
    bridge: Option<thread::JoinHandle<()>>,
    halt: Option<Sender<()>>,
    pump: Option<JoinHandle<()>>,
}

/// A [`Producer`] fed by a worker process.
///
/// Dereferences to the inner [`Producer`]. Readiness follows the worker: it
/// turns ready on the worker's `ready` frame and closes on its `stopped` frame,
/// after which the producer shuts down on its own.
pub struct ProcessProducer<T> {
    producer: Producer<T>,
    config: ProcessConfig,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    threads: Mutex<Threads>,
    pid: u32,
}

impl<T> ProcessProducer<T>
where
    T: Clone + Send + DeserializeOwned + 'static,
{
    /// Start `command` as a worker process. Must be called inside a tokio runtime,
    /// which becomes the producer's owning runtime.
    ///
    /// The command's stdin and stdout are taken over for the frame channel and
    /// [`WORKER_ENV`] is set in its environment.
    pub fn spawn(config: ProducerConfig<T>, settings: ProcessConfig, mut command: Command) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| Error::custom("process producer must be spawned inside a tokio runtime"))?;

        command
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command.spawn()?;
        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                reap(&mut child);
                return Err(Error::custom("worker process has no stdout"));
            }
        };
        debug!(pid, "worker process started");

        let producer = Producer::new(config.ready(false));
        let (sender, receiver) = mpsc::channel(settings.channel_capacity.max(1));
        let pump = runtime.spawn(pump(producer.clone(), receiver));

        let (frames, inbox) = crossbeam_channel::unbounded();
        let (halt, halted) = crossbeam_channel::bounded(1);
        let threads = thread::Builder::new()
            .name(format!("subweld-reader-{pid}"))
            .spawn(move || read_frames(stdout, frames))
            .and_then(|reader| {
                let bridge = Bridge {
                    inbox,
                    outbox: sender,
                    halt: halted,
                    readiness: producer.readiness(),
                    shutdown: producer.shutdown_flag(),
                    poll_interval: settings.poll_interval,
                };
                thread::Builder::new()
                    .name(format!("subweld-bridge-{pid}"))
                    .spawn(move || bridge.run())
                    .map(|bridge| (reader, bridge))
            });
        let (reader, bridge) = match threads {
            Ok(threads) => threads,
            Err(e) => {
                drop(stdin);
                reap(&mut child);
                pump.abort();
                producer.close();
                return Err(e.into());
            }
        };

        Ok(Self {
            producer,
            config: settings,
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(stdin),
            threads: Mutex::new(Threads {
                reader: Some(reader),
                bridge: Some(bridge),
                halt: Some(halt),
                pump: Some(pump),
            }),
            pid,
        })
    }

    /// Stop the worker process and wait for everything it sent to be broadcast.
    ///
    /// The worker is asked to shut down and given `join_timeout` to exit, then
    /// killed. Output still in flight gets another `join_timeout` to arrive; if
    /// something the worker left behind keeps its stdout open past that, the rest
    /// is dropped. Calling it again does nothing. Blocks the calling thread; from
    /// async code, call it through [`tokio::task::spawn_blocking`].
    pub fn close(&self) {
        if self.producer.shutdown_flag().set() {
            debug!(pid = self.pid, "closing process producer");
        }

        let stdin = self
            .stdin
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut stdin) = stdin {
            if let Err(e) = write_frame(&mut stdin, &ControlFrame::Shutdown) {
                debug!(pid = self.pid, error = %e, "could not send shutdown, worker already gone");
            }
        }

        let child = self
            .child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut child) = child {
            let exited = poll_until(self.config.join_timeout, EXIT_POLL, || {
                child.try_wait().map_err(Error::from)
            });
            match exited {
                Ok(Some(status)) => debug!(pid = self.pid, %status, "worker process exited"),
                Ok(None) => {
                    warn!(
                        pid = self.pid,
                        timeout_ms = self.config.join_timeout.as_millis() as u64,
                        "worker process did not stop in time, killing it"
                    );
                    reap(&mut child);
                }
                Err(e) => {
                    warn!(pid = self.pid, error = %e, "could not wait for worker process, killing it");
                    reap(&mut child);
                }
            }
        }

        let threads = std::mem::take(
            &mut *self
                .threads
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        if let Some(bridge) = threads.bridge {
            let drained = poll_until(self.config.join_timeout, EXIT_POLL, || {
                Ok(bridge.is_finished().then_some(()))
            });
            if !matches!(drained, Ok(Some(()))) {
                warn!(pid = self.pid, "worker output still open after exit, abandoning it");
                if let Some(halt) = &threads.halt {
                    let _ = halt.try_send(());
                }
            }
            if let Err(payload) = bridge.join() {
                error!(error = %Error::from_panic(payload), "worker bridge thread panicked");
            }
        }
        if let Some(reader) = threads.reader {
            if reader.is_finished() {
                if let Err(payload) = reader.join() {
                    error!(error = %Error::from_panic(payload), "worker reader thread panicked");
                }
            } else {
                // Blocked on a pipe held by a process outside our reach; it ends
                // when that process closes it.
                debug!(pid = self.pid, "leaving worker reader behind");
            }
        }
        if let Some(pump) = threads.pump {
            if let Err(e) = futures::executor::block_on(pump) {
                warn!(error = %e, "producer pump did not finish cleanly");
            }
        }

        self.producer.close();
    }

    /// Process id of the worker
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl<T> Deref for ProcessProducer<T> {
    type Target = Producer<T>;

    fn deref(&self) -> &Self::Target {
        &self.producer
    }
}

impl<T> Drop for ProcessProducer<T> {
    fn drop(&mut self) {
        // Closing stdin is a shutdown request the worker honours on its own.
        self.producer.shared.shutdown.set();
        if let Ok(mut stdin) = self.stdin.lock() {
            stdin.take();
        }
    }
}

impl<T> std::fmt::Debug for ProcessProducer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessProducer")
            .field("pid", &self.pid)
            .field("producer", &self.producer)
            .finish_non_exhaustive()
    }
}

fn reap(child: &mut Child) {
    #[cfg(unix)]
    kill_group(child.id());
    if let Err(e) = child.kill() {
        debug!(error = %e, "kill failed, worker probably already exited");
    }
    match child.wait() {
        Ok(status) => debug!(%status, "worker process reaped"),
        Err(e) => warn!(error = %e, "could not reap worker process"),
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    let Ok(group) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill has no memory effects; a negative pid addresses the group
    // the worker leads.
    if unsafe { libc::kill(-group, libc::SIGKILL) } != 0 {
        debug!(
            pid,
            error = %std::io::Error::last_os_error(),
            "could not kill worker process group"
        );
    }
}

fn read_frames<T: DeserializeOwned>(stdout: ChildStdout, frames: Sender<WorkerFrame<T>>) {
    for line in BufReader::new(stdout).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "worker output read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WorkerFrame<T>>(&line) {
            Ok(frame) => {
                if frames.send(frame).is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "ignoring malformed worker frame"),
        }
    }
    debug!("worker output closed");
}

struct Bridge<T> {
    inbox: Receiver<WorkerFrame<T>>,
    outbox: mpsc::Sender<T>,
    halt: Receiver<()>,
    readiness: Readiness,
    shutdown: ShutdownFlag,
    poll_interval: Duration,
}

impl<T> Bridge<T> {
    fn run(self) {
        loop {
            crossbeam_channel::select! {
                recv(self.halt) -> _ => {
                    debug!("worker bridge halted");
                    break;
                }
                recv(self.inbox) -> frame => match frame {
                    Ok(WorkerFrame::Item { data }) => {
                        if self.outbox.blocking_send(data).is_err() {
                            debug!("producer pump gone, dropping worker output");
                            break;
                        }
                    }
                    Ok(WorkerFrame::Ready) => {
                        debug!("worker process ready");
                        self.readiness.set_ready();
                    }
                    Ok(WorkerFrame::Stopped { error }) => {
                        match error {
                            Some(e) => error!(error = %e, "worker process stopped with an error"),
                            None => debug!("worker process stopped"),
                        }
                        self.readiness.close();
                        self.shutdown.set();
                    }
                    Err(_) => break,
                },
                default(self.poll_interval) => {
                    if self.shutdown.is_set() {
                        break;
                    }
                }
            }
        }
        // Dropping the outbox lets the pump drain and close the producer.
        debug!("worker bridge finished");
    }
}
