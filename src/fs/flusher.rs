//! Background commit thread.
//!
//! The flusher wakes every interval and commits whatever the mounted
//! filesystem accumulated. It holds only a weak handle, so it never keeps a
//! filesystem alive, and exits once the handle is gone or it is stopped.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::Filesystem;

#[derive(Default)]
struct Signal {
    stop: Mutex<bool>,
    wakeup: Condvar,
}

/// Handle to a running flusher thread.
pub(crate) struct Flusher {
    signal: Arc<Signal>,
    worker: Option<JoinHandle<()>>,
}

impl Flusher {
    /// Spawns a flusher committing `fs` every `interval`.
    pub(crate) fn spawn(fs: Weak<Filesystem>, interval: Duration) -> std::io::Result<Self> {
        let signal = Arc::new(Signal::default());
        let worker_signal = Arc::clone(&signal);
        let worker = thread::Builder::new()
            .name("arborfs-flusher".into())
            .spawn(move || Self::worker_loop(fs, worker_signal, interval))?;
        Ok(Self {
            signal,
            worker: Some(worker),
        })
    }

    fn worker_loop(fs: Weak<Filesystem>, signal: Arc<Signal>, interval: Duration) {
        loop {
            {
                let mut stop = signal.stop.lock();
                if !*stop {
                    signal.wakeup.wait_for(&mut stop, interval);
                }
                if *stop {
                    break;
                }
            }
            let Some(fs) = fs.upgrade() else {
                break;
            };
            match fs.flush() {
                Ok(Some(stats)) => debug!(generation = stats.generation, "flusher.committed"),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "flusher.commit_failed"),
            }
        }
        debug!("flusher.exit");
    }

    /// Asks the thread to exit and waits for it, unless called from the
    /// flusher thread itself.
    pub(crate) fn stop(&mut self) {
        *self.signal.stop.lock() = true;
        self.signal.wakeup.notify_all();
        let Some(worker) = self.worker.take() else {
            return;
        };
        if worker.thread().id() == current_thread() {
            return;
        }
        if worker.join().is_err() {
            warn!("flusher.panicked");
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn current_thread() -> ThreadId {
    thread::current().id()
}
