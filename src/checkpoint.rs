// Sync time tracking
//
// A checkpoint records that every change up to and including a changelog
// suffix has been replicated. One value per brick partition, persisted in a
// text file in the worker's working directory.

use crate::changelog::Segment;
use crate::error::{Result, SyncError};
use fs2::FileExt;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Suffix of the last fully synced segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checkpoint(pub u64);

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub trait CheckpointStore {
    /// Current checkpoint; zero when the partition was never synced
    fn get(&self, partition: &str) -> Result<Checkpoint>;

    /// Move the checkpoint forward. Returns false, leaving the stored value
    /// alone, when `checkpoint` is behind it.
    fn advance(&mut self, partition: &str, checkpoint: Checkpoint) -> Result<bool>;
}

/// Index of the first segment not yet applied.
///
/// Segments before it have a suffix below the checkpoint. `segments` must be
/// sorted by suffix.
pub fn first_candidate(segments: &[Segment], checkpoint: Checkpoint) -> usize {
    segments.partition_point(|s| s.suffix < checkpoint.0)
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    values: HashMap<String, Checkpoint>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(partition: &str, checkpoint: Checkpoint) -> Self {
        let mut store = Self::new();
        store.values.insert(partition.to_string(), checkpoint);
        store
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, partition: &str) -> Result<Checkpoint> {
        Ok(self.values.get(partition).copied().unwrap_or_default())
    }

    fn advance(&mut self, partition: &str, checkpoint: Checkpoint) -> Result<bool> {
        let current = self.values.entry(partition.to_string()).or_default();
        if checkpoint < *current {
            tracing::debug!(partition, %current, requested = %checkpoint, "checkpoint not advanced");
            return Ok(false);
        }
        *current = checkpoint;
        Ok(true)
    }
}

/// Checkpoint file in a working directory (text-based, atomic rewrite).
///
/// Holds an exclusive lock on `<workdir>/.lock` for its lifetime so that only
/// one worker drives a working directory.
pub struct FileCheckpointStore {
    state_file: PathBuf,
    values: BTreeMap<String, Checkpoint>,
    _lock: fs::File,
}

impl FileCheckpointStore {
    /// Format version
    const FORMAT_VERSION: &'static str = "v1";
    const STATE_FILE: &'static str = "checkpoints.lst";
    const LOCK_FILE: &'static str = ".lock";

    pub fn open(workdir: &Path) -> Result<Self> {
        fs::create_dir_all(workdir)?;

        let lock_path = workdir.join(Self::LOCK_FILE);
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock.try_lock_exclusive()
            .map_err(|_| SyncError::WorkdirLocked {
                path: workdir.to_path_buf(),
            })?;

        let state_file = workdir.join(Self::STATE_FILE);
        let values = if state_file.exists() {
            Self::load_from_file(&state_file)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            state_file,
            values,
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }

    fn load_from_file(path: &Path) -> Result<BTreeMap<String, Checkpoint>> {
        let reader = BufReader::new(fs::File::open(path)?);
        let mut values = BTreeMap::new();

        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // Parse: <checkpoint> <partition>
            let parsed = line
                .split_once(' ')
                .and_then(|(value, partition)| Some((value.parse::<u64>().ok()?, partition)));
            let Some((value, partition)) = parsed else {
                return Err(SyncError::Checkpoint {
                    path: path.to_path_buf(),
                    message: format!("malformed line {}: {:?}", lineno + 1, line),
                });
            };
            values.insert(partition.to_string(), Checkpoint(value));
        }

        Ok(values)
    }

    fn save_to_file(&self, values: &BTreeMap<String, Checkpoint>) -> Result<()> {
        let dir = self.state_file.parent().unwrap_or(Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;

        writeln!(temp, "# geosync checkpoints {}", Self::FORMAT_VERSION)?;
        writeln!(temp, "# updated: {}", chrono::Utc::now().to_rfc3339())?;
        for (partition, value) in values {
            writeln!(temp, "{} {}", value, partition)?;
        }
        temp.as_file().sync_all()?;

        temp.persist(&self.state_file)
            .map_err(|e| SyncError::Io(e.error))?;
        Ok(())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn get(&self, partition: &str) -> Result<Checkpoint> {
        Ok(self.values.get(partition).copied().unwrap_or_default())
    }

    fn advance(&mut self, partition: &str, checkpoint: Checkpoint) -> Result<bool> {
        let current = self.get(partition)?;
        if checkpoint < current {
            tracing::debug!(partition, %current, requested = %checkpoint, "checkpoint not advanced");
            return Ok(false);
        }
        if checkpoint == current && self.values.contains_key(partition) {
            return Ok(true);
        }
        // memory changes only once the file is written
        let mut next = self.values.clone();
        next.insert(partition.to_string(), checkpoint);
        self.save_to_file(&next)?;
        self.values = next;
        Ok(true)
    }
}
