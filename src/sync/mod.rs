//! Changelog-driven sync cycles.
//!
//! ```text
//! Registered -> Scanning -> Filtering -> Dispatching -> Waiting
//!      ^                                                   |
//!      |      Idle <- Acknowledging <- Checkpointing <-----+
//!      +------/
//! ```

pub mod orchestrator;
pub mod retry;

use std::fmt;
use std::time::Duration;

use serde::Serialize;

pub use orchestrator::{OrchestratorOptions, SyncOrchestrator};
pub use retry::RetryList;

/// Default pause between cycles
pub const DEFAULT_CYCLE_INTERVAL: Duration = Duration::from_secs(2);

/// Deferred cycles in a row before failing paths are parked
pub const DEFAULT_MAX_DEFERRALS: u32 = 3;

/// Where the control loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CycleState {
    Unregistered,
    Registered,
    Scanning,
    Filtering,
    Dispatching,
    Waiting,
    Checkpointing,
    Acknowledging,
    Idle,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Unregistered => "unregistered",
            CycleState::Registered => "registered",
            CycleState::Scanning => "scanning",
            CycleState::Filtering => "filtering",
            CycleState::Dispatching => "dispatching",
            CycleState::Waiting => "waiting",
            CycleState::Checkpointing => "checkpointing",
            CycleState::Acknowledging => "acknowledging",
            CycleState::Idle => "idle",
        }
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// No segment needed processing
    #[default]
    Idle,
    /// Segments synced; checkpoint moved to `checkpoint`
    Synced { checkpoint: u64 },
    /// Some batches failed; segments stay pending for the next cycle
    Deferred { failed_items: usize },
}

/// Statistics for one cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    #[serde(flatten)]
    pub outcome: CycleOutcome,

    /// Suffix range of the processed segments
    pub first_segment: Option<u64>,
    pub last_segment: Option<u64>,

    /// Already-applied segments acknowledged without processing
    pub segments_skipped: usize,
    pub segments_processed: usize,

    /// Distinct paths handed to the dispatcher, parked ones included
    pub items: usize,
    pub batches: usize,

    /// Parked paths offered again this cycle
    pub retried: usize,
    /// Paths newly given up on and parked this cycle
    pub parked: usize,
    /// Size of the retry list after the cycle
    pub retry_pending: usize,
    /// Deferred cycles in a row, this one included
    pub deferrals: u32,

    /// OIDs (and removed entries' parents) that could not be mapped to paths
    pub unresolved: Vec<String>,
    pub parse_warnings: usize,

    pub scan_time: Duration,
    pub cleanup_time: Duration,
    pub sync_time: Duration,
    pub total_time: Duration,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.outcome == CycleOutcome::Idle
    }
}
