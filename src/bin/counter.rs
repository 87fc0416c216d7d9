//! Worker process that counts: emits `0..N` and then waits for shutdown.
//!
//! ```text
//! subweld-counter [N] [--ignore-shutdown] [--fail] [--ready-after MS]
//! ```
//!
//! `--ignore-shutdown` keeps running after the parent asks it to stop, so the
//! parent has to kill it. `--fail` reports an error right after counting.
//! `--ready-after` holds back the `ready` frame and the count for `MS` milliseconds.

use std::thread;
use std::time::Duration;

use subweld::producer::worker;
use subweld::{Error, Result};

fn main() -> Result<()> {
    let mut count = 100u64;
    let mut ignore_shutdown = false;
    let mut fail = false;
    let mut ready_after = Duration::ZERO;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--ignore-shutdown" => ignore_shutdown = true,
            "--fail" => fail = true,
            "--ready-after" => {
                let ms = args
                    .next()
                    .and_then(|ms| ms.parse().ok())
                    .ok_or_else(|| Error::custom("--ready-after needs a number of milliseconds"))?;
                ready_after = Duration::from_millis(ms);
            }
            n => {
                count = n
                    .parse()
                    .map_err(|_| Error::custom(format!("invalid count: {n}")))?
            }
        }
    }

    if !worker::is_worker() {
        eprintln!("subweld-counter is meant to be started by a ProcessProducer");
    }

    worker::run(|ctx| {
        thread::sleep(ready_after);
        ctx.set_ready()?;
        for i in 0..count {
            ctx.put(i)?;
        }
        if fail {
            return Err(Error::custom("counter failed on request"));
        }
        while ignore_shutdown || !ctx.should_close() {
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    })
}
