//! Batched dispatch of sync items to a pool of transfer workers.
//!
//! ```text
//!              +----------+
//! enqueue ---> |  queue   | ---> worker 1 --> sink(batch)
//!              | (mpmc)   | ---> worker 2 --> sink(batch)
//!              +----------+ ---> worker N --> sink(batch)
//! ```
//!
//! Each worker drains up to `batch_capacity` items, hands them to the sink,
//! and repeats. `wait()` closes the queue; workers flush what is left and
//! exit, so every item enqueued before `wait()` lands in exactly one batch.

pub mod sink;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

pub use sink::{RsyncSink, TransferError, TransferOutput, TransferSink};

/// Default number of concurrent transfer workers
pub const DEFAULT_WORKERS: usize = 3;

/// Default maximum number of paths per transfer
pub const DEFAULT_BATCH_CAPACITY: usize = 1000;

/// Default pause when the queue is momentarily empty
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub workers: usize,
    pub batch_capacity: usize,
    pub poll_interval: Duration,
    /// Extra attempts for a failed batch before its items are given up
    pub retries: u32,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retries: 1,
        }
    }
}

/// Outcome of a dispatcher's lifetime
#[derive(Debug, Default, Clone)]
pub struct DispatchReport {
    /// Batches the sink accepted
    pub batches: usize,
    /// Items in accepted batches
    pub synced: usize,
    /// Items whose batch failed every attempt
    pub failed: Vec<String>,
    /// Workers that died; their in-flight items are unaccounted for
    pub panicked_workers: usize,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.panicked_workers == 0
    }

    fn merge(&mut self, other: DispatchReport) {
        self.batches += other.batches;
        self.synced += other.synced;
        self.failed.extend(other.failed);
        self.panicked_workers += other.panicked_workers;
    }
}

/// Worker pool owned for one sync cycle
pub struct BatchDispatcher {
    tx: Sender<String>,
    rx: Receiver<String>,
    workers: Vec<JoinHandle<DispatchReport>>,
}

impl BatchDispatcher {
    pub fn new(sink: Arc<dyn TransferSink>, options: DispatchOptions) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let options = DispatchOptions {
            workers: options.workers.max(1),
            batch_capacity: options.batch_capacity.max(1),
            ..options
        };

        let workers = (1..=options.workers)
            .map(|label| {
                let worker = Worker {
                    label,
                    rx: rx.clone(),
                    sink: Arc::clone(&sink),
                    options: options.clone(),
                };
                thread::Builder::new()
                    .name(format!("sync-worker-{}", label))
                    .spawn(move || worker.run())
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::error!(error = %e, "failed to start sync worker");
                    None
                }
            })
            .collect::<Vec<_>>();

        if workers.is_empty() {
            tracing::error!("no sync workers running");
        }

        Self { tx, rx, workers }
    }

    /// Queue items for syncing; never blocks
    pub fn enqueue<I>(&self, items: I)
    where
        I: IntoIterator<Item = String>,
    {
        for item in items {
            // `self.rx` keeps the channel open
            let _ = self.tx.send(item);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Close the queue and block until every worker has flushed and exited
    pub fn wait(self) -> DispatchReport {
        let BatchDispatcher { tx, rx, workers } = self;
        drop(tx);

        let mut report = DispatchReport::default();
        for handle in workers {
            match handle.join() {
                Ok(worker_report) => report.merge(worker_report),
                Err(_) => {
                    tracing::error!("sync worker panicked");
                    report.panicked_workers += 1;
                }
            }
        }

        // Only non-empty when no worker could be started
        let stranded: Vec<String> = rx.try_iter().collect();
        if !stranded.is_empty() {
            tracing::error!(items = stranded.len(), "items left unsynced");
            report.failed.extend(stranded);
        }
        report
    }
}

struct Worker {
    label: usize,
    rx: Receiver<String>,
    sink: Arc<dyn TransferSink>,
    options: DispatchOptions,
}

impl Worker {
    fn run(self) -> DispatchReport {
        let mut report = DispatchReport::default();
        loop {
            let (batch, closed) = self.next_batch();
            let full = batch.len() >= self.options.batch_capacity;
            if !batch.is_empty() {
                self.sync(batch, &mut report);
            }
            if closed {
                break;
            }
            if !full {
                thread::sleep(self.options.poll_interval);
            }
        }
        report
    }

    /// Drain up to a batch of items without blocking.
    /// The flag is set once the queue is closed and empty.
    fn next_batch(&self) -> (Vec<String>, bool) {
        let mut items = Vec::new();
        while items.len() < self.options.batch_capacity {
            match self.rx.try_recv() {
                Ok(item) => items.push(item),
                Err(TryRecvError::Empty) => return (items, false),
                Err(TryRecvError::Disconnected) => return (items, true),
            }
        }
        (items, false)
    }

    fn sync(&self, batch: Vec<String>, report: &mut DispatchReport) {
        let attempts = self.options.retries + 1;
        for attempt in 1..=attempts {
            match self.transfer(&batch) {
                Ok(output) => {
                    tracing::debug!(label = self.label, items = batch.len(), "sync job completed");
                    if !output.stderr.trim().is_empty() {
                        tracing::debug!(label = self.label, stderr = %output.stderr.trim(), "sync job output");
                    }
                    report.batches += 1;
                    report.synced += batch.len();
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        label = self.label,
                        attempt,
                        attempts,
                        items = batch.len(),
                        error = %e,
                        "sync job failed"
                    );
                }
            }
        }
        tracing::error!(label = self.label, items = batch.len(), "giving up on batch");
        report.failed.extend(batch);
    }

    fn transfer(&self, batch: &[String]) -> Result<TransferOutput, TransferError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.sink.transfer(self.label, batch)))
            .unwrap_or_else(|payload| {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(TransferError::Panicked(msg))
            })
    }
}
