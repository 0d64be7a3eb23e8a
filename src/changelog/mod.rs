//! Changelog consumption: the feed provider interface, the directory-spool
//! provider, and record parsing.

pub mod feed;
pub mod record;
pub mod spool;

pub use feed::{
    changelog_log_level, sort_segments, ChangeFeed, FeedError, Registration, Segment,
    CHANGELOG_LOG_LEVELS,
};
pub use record::{
    extract_oids, parse_record, parse_segment, parse_segment_file, removed_entries, EntryKind,
    EntryRef, Operation, ParseWarning, SegmentChanges,
};
pub use spool::SpoolFeed;
