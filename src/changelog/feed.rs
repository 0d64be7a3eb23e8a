//! Change feed provider interface.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Changelog library log levels, indexed by severity
pub const CHANGELOG_LOG_LEVELS: [&str; 10] = [
    "NONE", "EMERG", "ALERT", "CRITICAL", "ERROR", "WARNING", "NOTICE", "INFO", "DEBUG", "TRACE",
];

/// Numeric changelog log level for a level name
pub fn changelog_log_level(name: &str) -> Option<u32> {
    CHANGELOG_LOG_LEVELS
        .iter()
        .position(|l| l.eq_ignore_ascii_case(name))
        .map(|i| i as u32)
}

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("changelog {op} failed: {source} (errno {})", .source.raw_os_error().unwrap_or(0))]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("changelog history not available for range {start}..={end}")]
    HistoryNotAvailable { start: u64, end: u64 },

    #[error("changelog consumer is not registered")]
    NotRegistered,
}

impl FeedError {
    pub fn os(op: &'static str, source: io::Error) -> Self {
        FeedError::Os { op, source }
    }

    /// Underlying errno, if the failure came from the OS
    pub fn os_code(&self) -> Option<i32> {
        match self {
            FeedError::Os { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// One changelog segment file, named `<prefix>.<suffix>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub path: PathBuf,
    pub suffix: u64,
}

impl Segment {
    /// Build from a file path; `None` when the name carries no numeric suffix
    pub fn from_path(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let suffix = path
            .file_name()?
            .to_str()?
            .rsplit_once('.')?
            .1
            .parse()
            .ok()?;
        Some(Segment { path, suffix })
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Parameters for attaching to a brick's change feed
#[derive(Debug, Clone)]
pub struct Registration {
    pub brick: PathBuf,
    pub workdir: PathBuf,
    pub log_file: PathBuf,
    pub log_level: u32,
    pub retries: u32,
}

impl Registration {
    pub fn new(brick: &Path, workdir: &Path, log_file: &Path, log_level: u32) -> Self {
        Self {
            brick: brick.to_path_buf(),
            workdir: workdir.to_path_buf(),
            log_file: log_file.to_path_buf(),
            log_level,
            retries: 0,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Source of ordered changelog segments for one brick.
///
/// Listings are sorted by suffix. Acknowledging a segment deletes the working
/// copy handed out by the provider; backend segments are never touched.
pub trait ChangeFeed {
    fn register(&mut self, registration: &Registration) -> Result<(), FeedError>;

    /// Flush pending changes into the working directory
    fn scan(&mut self) -> Result<(), FeedError>;

    fn list_pending(&mut self) -> Result<Vec<Segment>, FeedError>;

    /// Best effort; failures are logged by the provider
    fn delete_segments(&mut self, segments: &[Segment]);

    /// Stage retained segments within `start..=end` for replay.
    /// Returns the suffix of the last staged segment.
    fn history_list(&mut self, start: u64, end: u64, parallelism: usize)
        -> Result<u64, FeedError>;

    /// Number of staged history segments ready to be listed
    fn history_scan(&mut self) -> Result<usize, FeedError>;

    fn history_pending(&mut self) -> Result<Vec<Segment>, FeedError>;
}

/// Sort segments by suffix, the temporal order of their changes
pub fn sort_segments(segments: &mut [Segment]) {
    segments.sort_by_key(|s| s.suffix);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_suffix() {
        let seg = Segment::from_path("/work/.processing/CHANGELOG.1700000123").unwrap();
        assert_eq!(seg.suffix, 1700000123);
        assert_eq!(seg.name(), "CHANGELOG.1700000123");
        assert!(Segment::from_path("/work/.processing/CHANGELOG").is_none());
        assert!(Segment::from_path("/work/.processing/CHANGELOG.tmp").is_none());
    }

    #[test]
    fn test_sort_segments() {
        let mut segs = vec![
            Segment::from_path("CHANGELOG.30").unwrap(),
            Segment::from_path("CHANGELOG.4").unwrap(),
            Segment::from_path("CHANGELOG.100").unwrap(),
        ];
        sort_segments(&mut segs);
        let suffixes: Vec<u64> = segs.iter().map(|s| s.suffix).collect();
        assert_eq!(suffixes, vec![4, 30, 100]);
    }

    #[test]
    fn test_changelog_log_level() {
        assert_eq!(changelog_log_level("NONE"), Some(0));
        assert_eq!(changelog_log_level("INFO"), Some(7));
        assert_eq!(changelog_log_level("trace"), Some(9));
        assert_eq!(changelog_log_level("VERBOSE"), None);
    }

    #[test]
    fn test_os_code() {
        let err = FeedError::os("scan", io::Error::from_raw_os_error(libc::ENOENT));
        assert_eq!(err.os_code(), Some(libc::ENOENT));
        assert_eq!(FeedError::NotRegistered.os_code(), None);
    }
}
