//! Object identifiers.
//!
//! Every object on a brick carries a stable identifier (the GFID) that is
//! independent of its path. Identifiers are canonical lowercase UUID strings.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Identifier of the brick root directory
pub const ROOT_OID: Oid = Oid(String::new());

const ROOT_OID_STR: &str = "00000000-0000-0000-0000-000000000001";

/// Length of the canonical `8-4-4-4-12` form
const OID_LEN: usize = 36;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed object identifier: {0:?}")]
pub struct InvalidOid(pub String);

/// Opaque identifier of a filesystem object.
///
/// The root identifier is stored as the empty string so that `ROOT_OID` can be
/// a `const`; `as_str` and `Display` always render the canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(String);

impl Oid {
    pub fn parse(s: &str) -> Result<Self, InvalidOid> {
        if !is_canonical(s) {
            return Err(InvalidOid(s.to_string()));
        }
        if s == ROOT_OID_STR {
            return Ok(ROOT_OID);
        }
        Ok(Oid(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        if self.0.is_empty() {
            ROOT_OID_STR
        } else {
            &self.0
        }
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Two-level fan-out used by the brick backend: `xx/yy/<oid>`
    pub fn backend_components(&self) -> (&str, &str, &str) {
        let s = self.as_str();
        (&s[0..2], &s[2..4], s)
    }
}

fn is_canonical(s: &str) -> bool {
    if s.len() != OID_LEN {
        return false;
    }
    s.bytes().enumerate().all(|(i, b)| match i {
        8 | 13 | 18 | 23 => b == b'-',
        _ => b.is_ascii_hexdigit(),
    })
}

impl FromStr for Oid {
    type Err = InvalidOid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Oid::parse(s)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_round_trip() {
        let root = Oid::parse(ROOT_OID_STR).unwrap();
        assert!(root.is_root());
        assert_eq!(root, ROOT_OID);
        assert_eq!(root.to_string(), ROOT_OID_STR);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(Oid::parse("").is_err());
        assert!(Oid::parse("not-an-oid").is_err());
        assert!(Oid::parse("0000000000000000000000000000000000001").is_err());
        assert!(Oid::parse("g0000000-0000-0000-0000-000000000001").is_err());
    }

    #[test]
    fn test_normalizes_case() {
        let oid = Oid::parse("ABCDEF01-2345-6789-ABCD-EF0123456789").unwrap();
        assert_eq!(oid.as_str(), "abcdef01-2345-6789-abcd-ef0123456789");
    }

    #[test]
    fn test_backend_components() {
        let oid = Oid::parse("abcdef01-2345-6789-abcd-ef0123456789").unwrap();
        let (a, b, full) = oid.backend_components();
        assert_eq!(a, "ab");
        assert_eq!(b, "cd");
        assert_eq!(full, oid.as_str());
    }
}
