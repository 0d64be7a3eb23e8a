use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::changelog::FeedError;
use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Change feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Failed to read changelog segment {path}: {source}")]
    SegmentRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Checkpoint store error for {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },

    #[error("Work directory {path} is locked by another worker")]
    WorkdirLocked { path: PathBuf },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
