//! Batched physical writes fanned out to one worker thread per device.

use std::collections::BTreeMap;
use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use super::FileIo;
use crate::types::{ArborError, Result};

/// Completion barrier shared by every write of one dispatch batch.
///
/// Keeps the first error reported; later errors are dropped.
#[derive(Default)]
pub struct Completion {
    state: Mutex<CompletionState>,
    cv: Condvar,
}

#[derive(Default)]
struct CompletionState {
    pending: usize,
    first_error: Option<ArborError>,
}

impl Completion {
    fn begin(&self, n: usize) {
        self.state.lock().pending += n;
    }

    fn finish(&self, result: Result<()>) {
        let mut state = self.state.lock();
        if let Err(err) = result {
            if state.first_error.is_none() {
                state.first_error = Some(err);
            }
        }
        state.pending -= 1;
        if state.pending == 0 {
            self.cv.notify_all();
        }
    }

    /// Blocks until every submitted write has finished.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        while state.pending > 0 {
            self.cv.wait(&mut state);
        }
        match state.first_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct DeviceQueue {
    io: Arc<dyn FileIo>,
    writes: Vec<(u64, Vec<u8>)>,
}

/// Collects physical writes and issues them concurrently, one worker per
/// device, behind a single [`Completion`].
pub struct DispatchContext {
    queues: BTreeMap<u64, DeviceQueue>,
    completion: Arc<Completion>,
    workers: Vec<JoinHandle<()>>,
    submitted: usize,
}

impl Default for DispatchContext {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchContext {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self {
            queues: BTreeMap::new(),
            completion: Arc::new(Completion::default()),
            workers: Vec::new(),
            submitted: 0,
        }
    }

    /// Queues `data` for writing at physical `offset` of device `dev_id`.
    pub fn submit(&mut self, dev_id: u64, io: Arc<dyn FileIo>, offset: u64, data: Vec<u8>) {
        self.queues
            .entry(dev_id)
            .or_insert_with(|| DeviceQueue {
                io,
                writes: Vec::new(),
            })
            .writes
            .push((offset, data));
    }

    /// Number of physical writes handed to workers so far.
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Starts workers for everything queued since the last dispatch.
    pub fn dispatch(&mut self) {
        let queues = std::mem::take(&mut self.queues);
        for (dev_id, queue) in queues {
            let count = queue.writes.len();
            if count == 0 {
                continue;
            }
            self.submitted += count;
            self.completion.begin(count);
            let completion = Arc::clone(&self.completion);
            let spawned = thread::Builder::new()
                .name(format!("arborfs-write-{dev_id}"))
                .spawn(move || run_queue(dev_id, queue, &completion));
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(err) => {
                    warn!(dev_id, error = %err, "dispatch.spawn_failed");
                    for _ in 0..count {
                        let source = std::io::Error::new(err.kind(), "write worker unavailable");
                        self.completion
                            .finish(Err(ArborError::DeviceWrite { dev_id, source }));
                    }
                }
            }
        }
    }

    /// Dispatches anything still queued and blocks until the batch completes.
    ///
    /// Returns the first error any write reported.
    pub fn wait(&mut self) -> Result<()> {
        self.dispatch();
        let result = self.completion.wait();
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("arborfs-write").to_owned();
            if worker.join().is_err() {
                warn!(worker = %name, "dispatch.worker_panicked");
            }
        }
        result
    }

    /// Writes one buffer synchronously, outside of any batch.
    pub fn write_now(dev_id: u64, io: &dyn FileIo, offset: u64, data: &[u8]) -> Result<()> {
        io.write_at(offset, data).map_err(|err| tag_device(dev_id, err))
    }
}

/// Finishes whatever a worker still owes the completion if it unwinds.
struct Outstanding<'a> {
    dev_id: u64,
    remaining: usize,
    completion: &'a Completion,
}

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        for _ in 0..self.remaining {
            let source = io::Error::new(ErrorKind::Other, "write worker panicked");
            self.completion.finish(Err(ArborError::DeviceWrite {
                dev_id: self.dev_id,
                source,
            }));
        }
    }
}

fn run_queue(dev_id: u64, queue: DeviceQueue, completion: &Completion) {
    let mut outstanding = Outstanding {
        dev_id,
        remaining: queue.writes.len(),
        completion,
    };
    for (offset, data) in queue.writes {
        trace!(dev_id, offset, len = data.len(), "dispatch.write");
        let result = queue
            .io
            .write_at(offset, &data)
            .map_err(|err| tag_device(dev_id, err));
        outstanding.remaining -= 1;
        completion.finish(result);
    }
}

fn tag_device(dev_id: u64, err: ArborError) -> ArborError {
    match err {
        ArborError::Io(source) => ArborError::DeviceWrite { dev_id, source },
        other => other,
    }
}
