//! Changelog record parsing.
//!
//! A processed segment holds one record per line:
//!
//! ```text
//! M <oid> SETATTR
//! D <oid>
//! E <oid> CREATE <mode> <uid> <gid> <parent-oid>/<name>
//! E <oid> UNLINK <parent-oid>/<name>
//! E <oid> RENAME <old-parent>/<old-name> <new-parent>/<new-name>
//! ```

use std::collections::BTreeSet;
use std::io::BufRead;
use std::path::Path;

use thiserror::Error;

use crate::error::{Result, SyncError};
use crate::oid::{InvalidOid, Oid};

/// Namespace operation carried by an `E` record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Create,
    Mkdir,
    Mknod,
    Link,
    Symlink,
    Rename,
    Unlink,
    Rmdir,
}

impl EntryKind {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(EntryKind::Create),
            "MKDIR" => Some(EntryKind::Mkdir),
            "MKNOD" => Some(EntryKind::Mknod),
            "LINK" => Some(EntryKind::Link),
            "SYMLINK" => Some(EntryKind::Symlink),
            "RENAME" => Some(EntryKind::Rename),
            "UNLINK" => Some(EntryKind::Unlink),
            "RMDIR" => Some(EntryKind::Rmdir),
            _ => None,
        }
    }

    /// Whether the record's object exists under a new name afterwards
    pub fn creates_name(&self) -> bool {
        !matches!(self, EntryKind::Unlink | EntryKind::Rmdir)
    }

    /// Minimum operand count for the record to be usable
    fn min_operands(&self) -> usize {
        match self {
            EntryKind::Create | EntryKind::Mkdir | EntryKind::Mknod => 4,
            EntryKind::Rename => 2,
            EntryKind::Link | EntryKind::Symlink | EntryKind::Unlink | EntryKind::Rmdir => 1,
        }
    }
}

/// One parsed changelog record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Meta {
        oid: Oid,
    },
    Data {
        oid: Oid,
    },
    Entry {
        oid: Oid,
        kind: EntryKind,
        operands: Vec<String>,
    },
}

impl Operation {
    pub fn oid(&self) -> &Oid {
        match self {
            Operation::Meta { oid } | Operation::Data { oid } | Operation::Entry { oid, .. } => oid,
        }
    }
}

/// A directory entry named by its parent and basename
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryRef {
    pub parent: Oid,
    pub name: String,
}

impl EntryRef {
    /// Parse `<parent-oid>/<name>`, decoding the `%20`, `%0A` and `%25`
    /// escapes the changelog writes into names.
    pub fn parse(operand: &str) -> std::result::Result<Self, ParseWarning> {
        let (parent, name) = operand
            .split_once('/')
            .filter(|(_, name)| !name.is_empty())
            .ok_or_else(|| ParseWarning::MalformedOperand(operand.to_string()))?;
        Ok(EntryRef {
            parent: Oid::parse(parent)?,
            name: unescape_name(name),
        })
    }
}

/// Single pass, so `%2520` decodes to the literal `%20`
fn unescape_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let decoded = match tail.get(1..3) {
            Some("20") => Some(' '),
            Some("0A") | Some("0a") => Some('\n'),
            Some("25") => Some('%'),
            _ => None,
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[3..];
            }
            None => {
                out.push('%');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Problems with a single record. The record is skipped, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseWarning {
    #[error("unknown op class {0:?}")]
    UnknownOpClass(String),

    #[error("record has no object identifier")]
    MissingOid,

    #[error(transparent)]
    InvalidOid(#[from] InvalidOid),

    #[error("unknown entry type {0:?}")]
    UnknownEntryType(String),

    #[error("{kind:?} record needs {expected} operands, got {got}")]
    MissingOperand {
        kind: EntryKind,
        expected: usize,
        got: usize,
    },

    #[error("malformed entry operand {0:?}")]
    MalformedOperand(String),

    #[error("record is not valid UTF-8: {0}")]
    InvalidUtf8(String),
}

/// Parse one record line
pub fn parse_record(line: &str) -> std::result::Result<Operation, ParseWarning> {
    let mut fields = line.split(' ').filter(|f| !f.is_empty());
    let class = fields.next().unwrap_or_default();
    let oid = match class {
        "M" | "D" | "E" => Oid::parse(fields.next().ok_or(ParseWarning::MissingOid)?)?,
        other => return Err(ParseWarning::UnknownOpClass(other.to_string())),
    };

    match class {
        "M" => Ok(Operation::Meta { oid }),
        "D" => Ok(Operation::Data { oid }),
        _ => {
            let raw_kind = fields.next().unwrap_or_default();
            let kind = EntryKind::from_str(raw_kind)
                .ok_or_else(|| ParseWarning::UnknownEntryType(raw_kind.to_string()))?;
            let operands: Vec<String> = fields.map(str::to_string).collect();
            if operands.len() < kind.min_operands() {
                return Err(ParseWarning::MissingOperand {
                    kind,
                    expected: kind.min_operands(),
                    got: operands.len(),
                });
            }
            Ok(Operation::Entry {
                oid,
                kind,
                operands,
            })
        }
    }
}

/// OIDs whose current paths must be synced.
///
/// Removal records are excluded: their object may be gone already, see
/// [`removed_entries`].
pub fn extract_oids<'a>(ops: impl IntoIterator<Item = &'a Operation>) -> BTreeSet<Oid> {
    ops.into_iter()
        .filter(|op| match op {
            Operation::Meta { .. } | Operation::Data { .. } => true,
            Operation::Entry { kind, .. } => kind.creates_name(),
        })
        .map(|op| op.oid().clone())
        .collect()
}

/// Entries that vanished from the namespace: UNLINK/RMDIR targets and the old
/// side of RENAME, taken from the record operands.
pub fn removed_entries<'a>(ops: impl IntoIterator<Item = &'a Operation>) -> Vec<EntryRef> {
    let mut removed = Vec::new();
    for op in ops {
        let operand = match op {
            Operation::Entry {
                kind: EntryKind::Unlink | EntryKind::Rmdir,
                operands,
                ..
            } => operands.last(),
            Operation::Entry {
                kind: EntryKind::Rename,
                operands,
                ..
            } => operands.first(),
            _ => None,
        };
        match operand.map(|o| EntryRef::parse(o)) {
            Some(Ok(entry)) => removed.push(entry),
            Some(Err(e)) => tracing::warn!(oid = %op.oid(), error = %e, "skipping removed entry"),
            None => {}
        }
    }
    removed
}

/// Everything one segment contributes to a cycle
#[derive(Debug, Default, Clone)]
pub struct SegmentChanges {
    pub oids: BTreeSet<Oid>,
    pub removed: Vec<EntryRef>,
    pub warnings: usize,
}

/// Parse every record of a segment, logging and skipping bad ones
pub fn parse_segment<R: BufRead>(mut reader: R) -> std::io::Result<SegmentChanges> {
    let mut ops = Vec::new();
    let mut warnings = 0;
    let mut buf = Vec::new();
    let mut lineno = 0;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        lineno += 1;
        let parsed = match std::str::from_utf8(&buf) {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => parse_record(line.trim()),
            Err(_) => Err(ParseWarning::InvalidUtf8(String::from_utf8_lossy(&buf).trim().to_string())),
        };
        match parsed {
            Ok(op) => ops.push(op),
            Err(e) => {
                warnings += 1;
                tracing::warn!(line = lineno, error = %e, "got invalid changelog record");
            }
        }
    }

    Ok(SegmentChanges {
        oids: extract_oids(&ops),
        removed: removed_entries(&ops),
        warnings,
    })
}

/// Open and parse a segment file
pub fn parse_segment_file(path: &Path) -> Result<SegmentChanges> {
    let read = || -> std::io::Result<SegmentChanges> {
        let file = std::fs::File::open(path)?;
        parse_segment(std::io::BufReader::new(file))
    };
    read().map_err(|source| SyncError::SegmentRead {
        path: path.to_path_buf(),
        source,
    })
}
