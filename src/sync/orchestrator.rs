//! The control loop: scan the change feed, skip what is already applied,
//! resolve changed objects to paths, sync them in batches, then checkpoint
//! and acknowledge.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use super::retry::RetryList;
use super::{CycleOutcome, CycleReport, CycleState, DEFAULT_CYCLE_INTERVAL, DEFAULT_MAX_DEFERRALS};
use crate::changelog::{parse_segment_file, ChangeFeed, FeedError, Registration, Segment};
use crate::checkpoint::{first_candidate, Checkpoint, CheckpointStore};
use crate::dispatch::{BatchDispatcher, DispatchOptions, TransferSink};
use crate::error::Result;
use crate::oid::Oid;
use crate::resolver::{ObjectStore, PathResolver};

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub registration: Registration,
    /// Checkpoint key, normally the brick path
    pub partition: String,
    pub dispatch: DispatchOptions,
    pub cycle_interval: Duration,
    /// Copy threads used when staging history
    pub history_parallelism: usize,
    /// Consecutive cycles a failing path may hold the checkpoint back
    /// before it is parked on the retry list
    pub max_deferrals: u32,
}

impl OrchestratorOptions {
    pub fn new(registration: Registration) -> Self {
        Self {
            partition: registration.brick.to_string_lossy().into_owned(),
            registration,
            dispatch: DispatchOptions::default(),
            cycle_interval: DEFAULT_CYCLE_INTERVAL,
            history_parallelism: 1,
            max_deferrals: DEFAULT_MAX_DEFERRALS,
        }
    }
}

pub struct SyncOrchestrator<F, C, S> {
    feed: F,
    checkpoints: C,
    resolver: PathResolver<S>,
    sink: Arc<dyn TransferSink>,
    options: OrchestratorOptions,
    state: CycleState,
    retry: RetryList,
    /// Deferred cycles in a row
    deferrals: u32,
}

impl<F, C, S> SyncOrchestrator<F, C, S>
where
    F: ChangeFeed,
    C: CheckpointStore,
    S: ObjectStore,
{
    pub fn new(
        feed: F,
        checkpoints: C,
        resolver: PathResolver<S>,
        sink: Arc<dyn TransferSink>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            feed,
            checkpoints,
            resolver,
            sink,
            options,
            state: CycleState::Unregistered,
            retry: RetryList::in_memory(),
            deferrals: 0,
        }
    }

    /// Use a persisted retry list instead of an in-memory one
    pub fn with_retry_list(mut self, retry: RetryList) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_list(&self) -> &RetryList {
        &self.retry
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn feed(&self) -> &F {
        &self.feed
    }

    pub fn checkpoints(&self) -> &C {
        &self.checkpoints
    }

    pub fn checkpoint(&self) -> Result<Checkpoint> {
        self.checkpoints.get(&self.options.partition)
    }

    fn transition(&mut self, next: CycleState) {
        tracing::trace!(from = %self.state, to = %next, "cycle state");
        self.state = next;
    }

    /// Attach to the change feed. A failure here is fatal for the worker.
    pub fn start(&mut self) -> Result<()> {
        let registration = &self.options.registration;
        self.feed.register(registration)?;
        tracing::info!(
            brick = %registration.brick.display(),
            workdir = %registration.workdir.display(),
            "registered for changelogs"
        );
        self.transition(CycleState::Registered);
        Ok(())
    }

    /// Replay retained history from the checkpoint up to `now`.
    ///
    /// Returns `None` when there is nothing to replay, including when the
    /// requested range is no longer retained (a full resync is then needed).
    pub fn catch_up(&mut self, now: u64) -> Result<Option<CycleReport>> {
        let checkpoint = self.checkpoint()?;
        if checkpoint.0 == 0 || checkpoint.0 >= now {
            return Ok(None);
        }

        let started = Instant::now();
        let parallelism = self.options.history_parallelism;
        match self.feed.history_list(checkpoint.0, now, parallelism) {
            Ok(end) => tracing::info!(start = checkpoint.0, end, "replaying changelog history"),
            Err(FeedError::HistoryNotAvailable { start, end }) => {
                tracing::warn!(
                    start,
                    end,
                    "changelog history not available, a full resync is required"
                );
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        if self.feed.history_scan()? == 0 {
            return Ok(None);
        }
        let segments = self.feed.history_pending()?;
        let scan_time = started.elapsed();
        self.process(segments, started, scan_time).map(Some)
    }

    /// Run cycles until `shutdown` fires or disconnects
    pub fn run(&mut self, shutdown: &Receiver<()>) -> Result<()> {
        let mut cycles: u64 = 0;
        loop {
            match self.run_cycle() {
                Ok(report) if report.is_idle() => {}
                Ok(report) => tracing::debug!(cycle = cycles, ?report, "cycle finished"),
                Err(e) => tracing::error!(cycle = cycles, error = %e, "sync cycle failed"),
            }
            cycles += 1;

            match shutdown.recv_timeout(self.options.cycle_interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => {
                    tracing::info!(cycles, "sync loop stopping");
                    return Ok(());
                }
            }
        }
    }

    /// One pass over the live change feed
    pub fn run_cycle(&mut self) -> Result<CycleReport> {
        let started = Instant::now();

        self.transition(CycleState::Scanning);
        if let Err(e) = self.feed.scan() {
            tracing::warn!(error = %e, "changelog scan failed");
        }
        let segments = self.feed.list_pending()?;
        let scan_time = started.elapsed();

        self.process(segments, started, scan_time)
    }

    fn process(
        &mut self,
        segments: Vec<Segment>,
        started: Instant,
        scan_time: Duration,
    ) -> Result<CycleReport> {
        let mut report = CycleReport {
            scan_time,
            ..Default::default()
        };

        if segments.is_empty() && self.retry.is_empty() {
            tracing::debug!("nothing to process. no changelogs");
            self.transition(CycleState::Idle);
            return Ok(report);
        }

        self.transition(CycleState::Filtering);
        let checkpoint = self.checkpoint()?;
        let start = first_candidate(&segments, checkpoint);
        let (applied, candidates) = segments.split_at(start);
        if !applied.is_empty() {
            self.feed.delete_segments(applied);
        }
        report.segments_skipped = applied.len();
        report.cleanup_time = started.elapsed().saturating_sub(scan_time);

        if candidates.is_empty() && self.retry.is_empty() {
            tracing::debug!(
                checkpoint = %checkpoint,
                "nothing to process after skipping processed changelogs"
            );
            self.transition(CycleState::Idle);
            report.total_time = started.elapsed();
            return Ok(report);
        }
        report.first_segment = candidates.first().map(|s| s.suffix);
        report.last_segment = candidates.last().map(|s| s.suffix);
        report.segments_processed = candidates.len();

        self.transition(CycleState::Dispatching);
        let dispatcher =
            BatchDispatcher::new(Arc::clone(&self.sink), self.options.dispatch.clone());
        let mut unresolved: BTreeSet<String> = BTreeSet::new();

        let carried = self.retry.items().clone();
        let mut seen = carried.clone();
        if !carried.is_empty() {
            tracing::debug!(items = carried.len(), "retrying parked paths");
            dispatcher.enqueue(carried.iter().cloned().collect::<Vec<_>>());
        }
        report.retried = carried.len();

        for segment in candidates {
            let changes = match parse_segment_file(&segment.path) {
                Ok(changes) => changes,
                Err(e) => {
                    // Let in-flight batches finish; nothing is checkpointed.
                    dispatcher.wait();
                    self.transition(CycleState::Idle);
                    return Err(e);
                }
            };
            report.parse_warnings += changes.warnings;

            let mut resolution = self.resolver.resolve_all(&changes.oids);
            for entry in &changes.removed {
                match self.resolver.resolve_entry(entry) {
                    Ok(path) => {
                        resolution.paths.insert(path);
                    }
                    Err(e) => {
                        tracing::debug!(
                            parent = %entry.parent,
                            name = %entry.name,
                            error = %e,
                            "removed entry unresolved"
                        );
                        unresolved.insert(format!("{}/{}", entry.parent, entry.name));
                    }
                }
            }
            unresolved.extend(resolution.unresolved.iter().map(Oid::to_string));

            let fresh: Vec<String> = resolution
                .paths
                .into_iter()
                .filter(|p| seen.insert(p.clone()))
                .collect();
            tracing::trace!(segment = %segment, items = fresh.len(), "enqueueing");
            dispatcher.enqueue(fresh);
        }

        if !unresolved.is_empty() {
            tracing::warn!(
                count = unresolved.len(),
                oids = %unresolved.iter().cloned().collect::<Vec<_>>().join(" "),
                "failed to convert OID to path. Rebalance may have moved the file or \
                 GFID to path xattrs are not updated"
            );
        }
        report.items = seen.len();
        report.unresolved = unresolved.into_iter().collect();

        self.transition(CycleState::Waiting);
        let dispatch = dispatcher.wait();
        report.batches = dispatch.batches;
        report.sync_time = started
            .elapsed()
            .saturating_sub(scan_time + report.cleanup_time);

        let failed: BTreeSet<String> = dispatch.failed.iter().cloned().collect();
        let newly_failed: Vec<&String> = failed.iter().filter(|p| !carried.contains(*p)).collect();

        let hold = dispatch.panicked_workers > 0
            || (!newly_failed.is_empty() && self.deferrals < self.options.max_deferrals);
        if hold {
            self.deferrals += 1;
            // parked paths that went through leave the list
            self.retry
                .replace(carried.intersection(&failed).cloned().collect())?;
            tracing::warn!(
                failed = failed.len(),
                panicked = dispatch.panicked_workers,
                first = ?report.first_segment,
                last = ?report.last_segment,
                deferrals = self.deferrals,
                "sync incomplete, changelogs kept for the next cycle"
            );
            report.outcome = CycleOutcome::Deferred {
                failed_items: failed.len(),
            };
            report.deferrals = self.deferrals;
            report.retry_pending = self.retry.len();
            self.transition(CycleState::Idle);
            report.total_time = started.elapsed();
            return Ok(report);
        }

        if !newly_failed.is_empty() {
            tracing::error!(
                count = newly_failed.len(),
                deferrals = self.deferrals,
                paths = %newly_failed.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(" "),
                "giving up on paths after repeated transfer failures, parked for retry"
            );
        }
        report.parked = newly_failed.len();
        self.retry.replace(failed)?;
        self.deferrals = 0;
        report.retry_pending = self.retry.len();

        let (Some(first), Some(last)) = (candidates.first(), candidates.last()) else {
            // only parked paths were offered
            self.transition(CycleState::Idle);
            report.total_time = started.elapsed();
            return Ok(report);
        };

        self.transition(CycleState::Checkpointing);
        let reached = Checkpoint(last.suffix);
        self.checkpoints.advance(&self.options.partition, reached)?;

        self.transition(CycleState::Acknowledging);
        self.feed.delete_segments(candidates);

        self.transition(CycleState::Idle);
        report.outcome = CycleOutcome::Synced {
            checkpoint: reached.0,
        };
        report.total_time = started.elapsed();

        tracing::info!(
            changelog_start = first.suffix,
            changelog_end = last.suffix,
            items = report.items,
            batches = report.batches,
            parked = report.retry_pending,
            scan_time = ?report.scan_time,
            cleanup_time = ?report.cleanup_time,
            sync_time = ?report.sync_time,
            total_time = ?report.total_time,
            "Batch completed"
        );
        Ok(report)
    }
}
