//! Lookups against a brick backend.
//!
//! Every object has an entry at `<brick>/.glusterfs/xx/yy/<oid>`. For files it
//! is a hard link carrying one `trusted.gfid2path.<hash>` attribute per name,
//! valued `<parent-oid>/<basename>`. For directories it is a symlink to
//! `../../xx/yy/<parent-oid>/<basename>`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{ObjectStore, ParentLink, ResolveError};
use crate::oid::Oid;

const BACKEND_DIR: &str = ".glusterfs";
const GFID2PATH_PREFIX: &str = "trusted.gfid2path.";

#[derive(Debug, Clone)]
pub struct BrickStore {
    brick: PathBuf,
}

impl BrickStore {
    pub fn new(brick: impl Into<PathBuf>) -> Self {
        Self {
            brick: brick.into(),
        }
    }

    pub fn backend_path(&self, oid: &Oid) -> PathBuf {
        let (a, b, full) = oid.backend_components();
        self.brick.join(BACKEND_DIR).join(a).join(b).join(full)
    }
}

fn parse_link(oid: &Oid, value: &str) -> Result<ParentLink, ResolveError> {
    let malformed = || ResolveError::Malformed {
        oid: oid.clone(),
        detail: value.to_string(),
    };
    let (parent, name) = value.split_once('/').ok_or_else(malformed)?;
    if name.is_empty() || name.contains('/') {
        return Err(malformed());
    }
    Ok(ParentLink {
        parent: Oid::parse(parent).map_err(|_| malformed())?,
        name: name.to_string(),
    })
}

#[cfg(unix)]
fn gfid2path_values(path: &Path) -> io::Result<Vec<String>> {
    let mut values = Vec::new();
    for attr in xattr::list(path)? {
        let is_link = attr
            .to_str()
            .map(|a| a.starts_with(GFID2PATH_PREFIX))
            .unwrap_or(false);
        if !is_link {
            continue;
        }
        if let Some(value) = xattr::get(path, &attr)? {
            values.push(String::from_utf8_lossy(&value).into_owned());
        }
    }
    Ok(values)
}

#[cfg(not(unix))]
fn gfid2path_values(_path: &Path) -> io::Result<Vec<String>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "extended attributes are not supported on this platform",
    ))
}

impl ObjectStore for BrickStore {
    fn parent_links(&self, oid: &Oid) -> Result<Vec<ParentLink>, ResolveError> {
        // Attributes are read without following the entry, so a directory
        // symlink simply has no links.
        gfid2path_values(&self.backend_path(oid))
            .map_err(|e| ResolveError::from_io(oid, e))?
            .iter()
            .map(|v| parse_link(oid, v))
            .collect()
    }

    fn dir_parent(&self, oid: &Oid) -> Result<ParentLink, ResolveError> {
        let target = fs::read_link(self.backend_path(oid)).map_err(|e| ResolveError::from_io(oid, e))?;
        let malformed = || ResolveError::Malformed {
            oid: oid.clone(),
            detail: target.display().to_string(),
        };
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(malformed)?;
        let parent = target
            .parent()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
            .ok_or_else(malformed)?;
        Ok(ParentLink {
            parent: Oid::parse(parent).map_err(|_| malformed())?,
            name: name.to_string(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::oid::ROOT_OID;
    use crate::resolver::PathResolver;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    const DIR_A: &str = "aa000000-0000-0000-0000-000000000001";
    const DIR_B: &str = "bb000000-0000-0000-0000-000000000002";

    fn link_dir(store: &BrickStore, oid: &Oid, parent: &Oid, name: &str) {
        let path = store.backend_path(oid);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let (a, b, full) = parent.backend_components();
        symlink(format!("../../{}/{}/{}/{}", a, b, full, name), path).unwrap();
    }

    #[test]
    fn test_backend_path_layout() {
        let store = BrickStore::new("/bricks/b1");
        let oid = Oid::parse(DIR_A).unwrap();
        assert_eq!(
            store.backend_path(&oid),
            PathBuf::from("/bricks/b1/.glusterfs/aa/00").join(DIR_A)
        );
    }

    #[test]
    fn test_directory_chain_from_symlinks() {
        let temp = TempDir::new().unwrap();
        let store = BrickStore::new(temp.path());
        let a = Oid::parse(DIR_A).unwrap();
        let b = Oid::parse(DIR_B).unwrap();
        link_dir(&store, &a, &ROOT_OID, "projects");
        link_dir(&store, &b, &a, "docs");

        let parent = store.dir_parent(&b).unwrap();
        assert_eq!(parent.parent, a);
        assert_eq!(parent.name, "docs");

        // symlinked entries are directories: no gfid2path links
        assert!(store.parent_links(&b).unwrap().is_empty());

        let resolver = PathResolver::new(store);
        assert_eq!(resolver.dir_path(&b).unwrap(), "projects/docs");
        let res = resolver.resolve(&b);
        assert!(res.paths.contains("projects/docs"));
    }

    #[test]
    fn test_missing_backend_entry() {
        let temp = TempDir::new().unwrap();
        let store = BrickStore::new(temp.path());
        let a = Oid::parse(DIR_A).unwrap();
        assert!(matches!(
            store.dir_parent(&a),
            Err(ResolveError::NotFound(_))
        ));
        assert!(matches!(
            store.parent_links(&a),
            Err(ResolveError::NotFound(_))
        ));
    }

    #[test]
    fn test_parse_link_value() {
        let oid = Oid::parse(DIR_B).unwrap();
        let link = parse_link(&oid, &format!("{}/file.txt", DIR_A)).unwrap();
        assert_eq!(link.parent, Oid::parse(DIR_A).unwrap());
        assert_eq!(link.name, "file.txt");
        assert!(parse_link(&oid, "garbage").is_err());
        assert!(parse_link(&oid, &format!("{}/", DIR_A)).is_err());
    }
}
