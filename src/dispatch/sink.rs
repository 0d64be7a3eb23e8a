//! Transfer sink - hands a batch of relative paths to the byte mover.
//!
//! The shipped sink pipes the batch into `rsync --files-from`, so one
//! invocation copies every listed path from the source root to the replica.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// How often a running transfer is checked against its deadline
const WAIT_POLL: Duration = Duration::from_millis(50);

/// rsync: some source files vanished before they could be transferred
const RSYNC_VANISHED: i32 = 24;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transfer I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },

    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),

    #[error("transfer panicked: {0}")]
    Panicked(String),
}

/// Captured output of one transfer
#[derive(Debug, Default, Clone)]
pub struct TransferOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Destination for batches. Invoked synchronously from worker threads, so
/// implementations must tolerate concurrent calls and be idempotent: a batch
/// may be replayed after a crash or a deferred cycle.
pub trait TransferSink: Send + Sync {
    fn transfer(&self, label: usize, paths: &[String]) -> Result<TransferOutput, TransferError>;
}

/// rsync-backed sink.
///
/// Paths removed from the source are deleted on the replica through
/// `--delete-missing-args`.
#[derive(Debug, Clone)]
pub struct RsyncSink {
    program: PathBuf,
    source_root: PathBuf,
    dest_root: String,
    extra_args: Vec<String>,
    timeout: Option<Duration>,
}

impl RsyncSink {
    pub const BASE_ARGS: [&'static str; 6] = [
        "--from0",
        "--files-from=-",
        "--links",
        "--perms",
        "--times",
        "--delete-missing-args",
    ];

    pub fn new(source_root: &Path, dest_root: impl Into<String>) -> Self {
        Self {
            program: PathBuf::from("rsync"),
            source_root: source_root.to_path_buf(),
            dest_root: dest_root.into(),
            extra_args: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Additional rsync arguments (ssh options, bandwidth limits, ...)
    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra_args.extend(args);
        self
    }

    /// Kill transfers running longer than `timeout`; `None` waits forever
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self) -> Command {
        let mut source = self.source_root.to_string_lossy().into_owned();
        if !source.ends_with('/') {
            source.push('/');
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(Self::BASE_ARGS);
        cmd.args(&self.extra_args);
        cmd.arg(source);
        cmd.arg(&self.dest_root);

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

impl TransferSink for RsyncSink {
    fn transfer(&self, label: usize, paths: &[String]) -> Result<TransferOutput, TransferError> {
        let mut child = self.command().spawn().map_err(|source| TransferError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let writer = child.stdin.take().map(|mut stdin| {
            let input = paths.join("\0");
            thread::spawn(move || match stdin.write_all(input.as_bytes()) {
                // rsync may exit early on bad arguments; the exit status reports it
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            })
        });

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    tracing::warn!(label, ?timeout, "killing stalled transfer");
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TransferError::Timeout(timeout));
                }
            }
            thread::sleep(WAIT_POLL);
        };

        if let Some(Ok(Err(e))) = writer.map(|h| h.join()) {
            return Err(e.into());
        }

        let output = TransferOutput {
            stdout: stdout.and_then(|h| h.join().ok()).unwrap_or_default(),
            stderr: stderr.and_then(|h| h.join().ok()).unwrap_or_default(),
        };

        if status.code() == Some(RSYNC_VANISHED) {
            // a later changelog records the removal
            tracing::warn!(
                label,
                stderr = %output.stderr.trim(),
                "some files vanished during transfer"
            );
            return Ok(output);
        }
        if !status.success() {
            return Err(TransferError::Failed {
                status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}
