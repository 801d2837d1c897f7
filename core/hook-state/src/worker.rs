//! Background cache-expiry worker.
//!
//! One thread per engine. It sleeps on a [`StopSignal`] for the configured
//! interval and runs a sweep on every timed wake. A stop wakes it at once and
//! it exits without a final sweep.
//!
//! ```text
//! spawn ──► wait(interval) ──timeout──► sweep ──┐
//!              ▲                                │
//!              └────────────────────────────────┘
//!              │
//!            stopped ──► exit (sends exit notice)
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{HookStateError, Result};

/// A one-shot cancellation flag that sleeping threads can wait on.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cvar: Condvar,
}

impl StopSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stop(&self) {
        let mut stopped = self.stopped.lock();
        *stopped = true;
        self.cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Blocks for up to `timeout`. Returns true if stop was signalled.
    /// A timeout too large to express as a deadline waits for the stop.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut stopped = self.stopped.lock();
        while !*stopped {
            match deadline {
                Some(deadline) => {
                    if self.cvar.wait_until(&mut stopped, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cvar.wait(&mut stopped),
            }
        }
        *stopped
    }
}

/// Sends on drop so the owner learns about exit even if the thread panicked.
struct ExitNotice(mpsc::Sender<()>);

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

pub struct CacheSweeper {
    signal: Arc<StopSignal>,
    handle: JoinHandle<()>,
    exited: mpsc::Receiver<()>,
}

impl CacheSweeper {
    pub fn spawn<F>(name: &str, interval: Duration, sweep: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let signal = StopSignal::new();
        let (exit_tx, exited) = mpsc::channel();
        let thread_signal = Arc::clone(&signal);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _notice = ExitNotice(exit_tx);
                while !thread_signal.wait(interval) {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(&sweep)) {
                        tracing::warn!(
                            error = %panic_message(payload.as_ref()),
                            "Cache cleanup sweep failed"
                        );
                    }
                }
            })
            .map_err(|e| HookStateError::io("spawn cache cleanup thread", e))?;

        tracing::debug!(worker = name, interval_secs = interval.as_secs_f64(), "Started cache cleanup thread");
        Ok(CacheSweeper {
            signal,
            handle,
            exited,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the worker and waits up to `timeout` for it to exit.
    ///
    /// A worker that misses the deadline is detached and reported as
    /// [`HookStateError::WorkerJoinTimeout`]; it still exits on its next wake.
    pub fn shutdown(self, timeout: Duration) -> Result<()> {
        self.signal.stop();
        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    tracing::warn!("Cache cleanup thread exited with a panic");
                }
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                let name = self.handle.thread().name().unwrap_or("cache-sweeper").to_string();
                tracing::warn!(worker = %name, ?timeout, "Thread did not finish within timeout");
                Err(HookStateError::WorkerJoinTimeout { timeout })
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
