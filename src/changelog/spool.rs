//! Directory-spool change feed.
//!
//! The brick writes rolled-over changelogs to
//! `<brick>/.glusterfs/changelogs/CHANGELOG.<ts>`. Scanning copies new ones
//! into `<workdir>/.processing/`, which is what consumers list and delete.
//! History replay stages retained segments in `<workdir>/.history/.processing/`.
//! Backend segments are only ever read.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use super::feed::{sort_segments, ChangeFeed, FeedError, Registration, Segment};

const BACKEND_DIR: &str = ".glusterfs/changelogs";
const PROCESSING_DIR: &str = ".processing";
const HISTORY_DIR: &str = ".history";
const TRACKER_FILE: &str = ".tracker";
const SEGMENT_PREFIX: &str = "CHANGELOG.";

/// Delay between registration attempts
const REGISTER_RETRY_DELAY: Duration = Duration::from_secs(1);

// Level indices from CHANGELOG_LOG_LEVELS
const LEVEL_ERROR: u32 = 4;
const LEVEL_WARNING: u32 = 5;
const LEVEL_INFO: u32 = 7;
const LEVEL_DEBUG: u32 = 8;

#[derive(Debug)]
struct Attached {
    backend: PathBuf,
    workdir: PathBuf,
    log_file: PathBuf,
    log_level: u32,
}

/// Change feed backed by the brick's changelog directory
#[derive(Debug, Default)]
pub struct SpoolFeed {
    attached: Option<Attached>,
    retry_delay: Option<Duration>,
}

impl SpoolFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the pause between registration attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    fn attached(&self) -> Result<&Attached, FeedError> {
        self.attached.as_ref().ok_or(FeedError::NotRegistered)
    }

    fn processing_dir(&self) -> Result<PathBuf, FeedError> {
        Ok(self.attached()?.workdir.join(PROCESSING_DIR))
    }

    fn history_processing_dir(&self) -> Result<PathBuf, FeedError> {
        Ok(self
            .attached()?
            .workdir
            .join(HISTORY_DIR)
            .join(PROCESSING_DIR))
    }

    /// Append a line to the provider log if `level` passes the registered filter
    fn log(&self, level: u32, message: &str) {
        let Some(attached) = &self.attached else {
            return;
        };
        if level > attached.log_level {
            return;
        }
        let tag = if level <= LEVEL_ERROR {
            'E'
        } else if level == LEVEL_WARNING {
            'W'
        } else if level >= LEVEL_DEBUG {
            'D'
        } else {
            'I'
        };
        let line = format!(
            "[{}] {} [spool] {}\n",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            tag,
            message
        );
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&attached.log_file)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = written {
            tracing::debug!(path = %attached.log_file.display(), error = %e, "changelog log write failed");
        }
    }

    fn read_tracker(&self) -> Result<u64, FeedError> {
        let path = self.attached()?.workdir.join(TRACKER_FILE);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(s.trim().parse().unwrap_or(0)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(FeedError::os("scan", e)),
        }
    }

    fn write_tracker(&self, suffix: u64) -> Result<(), FeedError> {
        let workdir = &self.attached()?.workdir;
        let tmp = tempfile::NamedTempFile::new_in(workdir).map_err(|e| FeedError::os("scan", e))?;
        fs::write(tmp.path(), format!("{}\n", suffix)).map_err(|e| FeedError::os("scan", e))?;
        tmp.persist(workdir.join(TRACKER_FILE))
            .map_err(|e| FeedError::os("scan", e.error))?;
        Ok(())
    }

    fn backend_segments(&self) -> Result<Vec<Segment>, FeedError> {
        list_segments(&self.attached()?.backend).map_err(|e| FeedError::os("list", e))
    }
}

/// Segment files in `dir`, sorted by suffix
fn list_segments(dir: &Path) -> io::Result<Vec<Segment>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(SEGMENT_PREFIX) {
            continue;
        }
        match Segment::from_path(entry.path()) {
            Some(seg) => segments.push(seg),
            None => tracing::warn!(name = name, "ignoring changelog with non-numeric suffix"),
        }
    }
    sort_segments(&mut segments);
    Ok(segments)
}

fn copy_segments(segments: &[Segment], dest: &Path, parallelism: usize) -> io::Result<()> {
    let chunk = segments.len().div_ceil(parallelism.max(1)).max(1);
    thread::scope(|s| {
        let handles: Vec<_> = segments
            .chunks(chunk)
            .map(|part| {
                s.spawn(move || -> io::Result<()> {
                    for seg in part {
                        fs::copy(&seg.path, dest.join(seg.name()))?;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "copy thread panicked"))??;
        }
        Ok(())
    })
}

impl ChangeFeed for SpoolFeed {
    fn register(&mut self, registration: &Registration) -> Result<(), FeedError> {
        let backend = registration.brick.join(BACKEND_DIR);
        let delay = self.retry_delay.unwrap_or(REGISTER_RETRY_DELAY);

        let mut attempt = 0;
        loop {
            match fs::metadata(&backend) {
                Ok(meta) if meta.is_dir() => break,
                Ok(_) => {
                    return Err(FeedError::os(
                        "register",
                        io::Error::from_raw_os_error(libc::ENOTDIR),
                    ))
                }
                Err(e) if attempt >= registration.retries => {
                    return Err(FeedError::os("register", e));
                }
                Err(e) => {
                    attempt += 1;
                    tracing::warn!(
                        brick = %registration.brick.display(),
                        attempt,
                        error = %e,
                        "changelog not ready, retrying registration"
                    );
                    thread::sleep(delay);
                }
            }
        }

        for dir in [
            registration.workdir.join(PROCESSING_DIR),
            registration.workdir.join(HISTORY_DIR).join(PROCESSING_DIR),
        ] {
            fs::create_dir_all(&dir).map_err(|e| FeedError::os("register", e))?;
        }

        self.attached = Some(Attached {
            backend,
            workdir: registration.workdir.clone(),
            log_file: registration.log_file.clone(),
            log_level: registration.log_level,
        });
        self.log(
            LEVEL_INFO,
            &format!("registered brick={}", registration.brick.display()),
        );
        Ok(())
    }

    fn scan(&mut self) -> Result<(), FeedError> {
        let tracker = self.read_tracker()?;
        let fresh: Vec<Segment> = self
            .backend_segments()?
            .into_iter()
            .filter(|s| s.suffix > tracker)
            .collect();

        let Some(last) = fresh.last() else {
            return Ok(());
        };
        let last = last.suffix;

        let dest = self.processing_dir()?;
        if let Err(e) = copy_segments(&fresh, &dest, 1) {
            self.log(LEVEL_ERROR, &format!("scan failed: {}", e));
            return Err(FeedError::os("scan", e));
        }
        self.write_tracker(last)?;
        self.log(
            LEVEL_DEBUG,
            &format!("scanned {} changelogs up to {}", fresh.len(), last),
        );
        Ok(())
    }

    fn list_pending(&mut self) -> Result<Vec<Segment>, FeedError> {
        list_segments(&self.processing_dir()?).map_err(|e| FeedError::os("list", e))
    }

    fn delete_segments(&mut self, segments: &[Segment]) {
        for seg in segments {
            if let Err(e) = fs::remove_file(&seg.path) {
                tracing::warn!(
                    path = %seg.path.display(),
                    error = %e,
                    "failed to remove processed changelog file"
                );
                self.log(
                    LEVEL_WARNING,
                    &format!("failed to remove {}: {}", seg.path.display(), e),
                );
            }
        }
    }

    fn history_list(
        &mut self,
        start: u64,
        end: u64,
        parallelism: usize,
    ) -> Result<u64, FeedError> {
        let retained = self.backend_segments()?;
        let tracker = self.read_tracker()?;
        let first_retained = match retained.first() {
            Some(first) if first.suffix <= start => first.suffix,
            // Pruned segments up to the first retained one were spooled by an
            // earlier scan and are still pending unless already applied.
            Some(first) if tracker >= first.suffix => first.suffix,
            _ => {
                self.log(
                    LEVEL_WARNING,
                    &format!("history {}..={} not retained", start, end),
                );
                return Err(FeedError::HistoryNotAvailable { start, end });
            }
        };

        let spooled = list_segments(&self.processing_dir()?)
            .map_err(|e| FeedError::os("history", e))?
            .into_iter()
            .filter(|s| s.suffix < first_retained);
        let wanted: Vec<Segment> = spooled
            .chain(retained)
            .filter(|s| s.suffix >= start && s.suffix <= end)
            .collect();
        let actual_end = wanted.last().map(|s| s.suffix).unwrap_or(start);

        copy_segments(&wanted, &self.history_processing_dir()?, parallelism)
            .map_err(|e| FeedError::os("history", e))?;
        self.log(
            LEVEL_INFO,
            &format!(
                "staged {} history changelogs {}..={}",
                wanted.len(),
                start,
                actual_end
            ),
        );
        Ok(actual_end)
    }

    fn history_scan(&mut self) -> Result<usize, FeedError> {
        Ok(self.history_pending()?.len())
    }

    fn history_pending(&mut self) -> Result<Vec<Segment>, FeedError> {
        list_segments(&self.history_processing_dir()?).map_err(|e| FeedError::os("history", e))
    }
}
