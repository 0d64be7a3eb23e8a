//! geosync - changelog-driven incremental replication of a storage brick.
//!
//! A worker consumes the brick's changelog, maps changed object identifiers
//! to relative paths, and hands those paths to rsync in parallel batches. A
//! per-brick checkpoint records how far replication has progressed.

pub mod changelog;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod oid;
pub mod resolver;
pub mod sync;

pub use error::{Result, SyncError};
