//! Object identifier to path resolution.
//!
//! Files record one `(parent, basename)` link per hard link. Directories have
//! exactly one name, reachable through the backend symlink that points at
//! their parent. A path is built by walking directory parents up to the root.

pub mod brick;

use std::collections::BTreeSet;
use std::io;

use thiserror::Error;

use crate::changelog::EntryRef;
use crate::oid::Oid;

pub use brick::BrickStore;

/// Upper bound on directory nesting while walking a parent chain
pub const DEFAULT_MAX_DEPTH: usize = 4096;

/// A name of an object inside its parent directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    pub parent: Oid,
    pub name: String,
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no backend entry for {0}")]
    NotFound(Oid),

    #[error("lookup of {oid} failed: {source}")]
    Io {
        oid: Oid,
        #[source]
        source: io::Error,
    },

    #[error("malformed link for {oid}: {detail}")]
    Malformed { oid: Oid, detail: String },

    #[error("parent chain of {oid} deeper than {depth} levels")]
    DepthExceeded { oid: Oid, depth: usize },
}

impl ResolveError {
    pub fn from_io(oid: &Oid, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            ResolveError::NotFound(oid.clone())
        } else {
            ResolveError::Io {
                oid: oid.clone(),
                source,
            }
        }
    }
}

/// Backend lookups needed for resolution
pub trait ObjectStore {
    /// All names of a (non-directory) object
    fn parent_links(&self, oid: &Oid) -> Result<Vec<ParentLink>, ResolveError>;

    /// The single name of a directory
    fn dir_parent(&self, oid: &Oid) -> Result<ParentLink, ResolveError>;
}

impl<S: ObjectStore + ?Sized> ObjectStore for &S {
    fn parent_links(&self, oid: &Oid) -> Result<Vec<ParentLink>, ResolveError> {
        (**self).parent_links(oid)
    }

    fn dir_parent(&self, oid: &Oid) -> Result<ParentLink, ResolveError> {
        (**self).dir_parent(oid)
    }
}

/// Paths found for a set of objects, plus the objects that could not be placed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub paths: BTreeSet<String>,
    pub unresolved: BTreeSet<Oid>,
}

impl Resolution {
    pub fn merge(&mut self, other: Resolution) {
        self.paths.extend(other.paths);
        self.unresolved.extend(other.unresolved);
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

pub struct PathResolver<S> {
    store: S,
    max_depth: usize,
}

impl<S: ObjectStore> PathResolver<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resolve one object to all of its current paths.
    ///
    /// Never fails: lookup problems land the OID in `unresolved`. A hard link
    /// whose chain is broken marks the OID unresolved while paths found through
    /// its other links are kept.
    pub fn resolve(&self, oid: &Oid) -> Resolution {
        let mut resolution = Resolution::default();
        if oid.is_root() {
            return resolution;
        }

        let links = match self.links(oid) {
            Ok(links) => links,
            Err(e) => {
                tracing::debug!(oid = %oid, error = %e, "object lookup failed");
                resolution.unresolved.insert(oid.clone());
                return resolution;
            }
        };

        for link in links {
            match self.dir_path(&link.parent) {
                Ok(dir) => {
                    resolution.paths.insert(join(&dir, &link.name));
                }
                Err(e) => {
                    tracing::debug!(oid = %oid, error = %e, "parent chain walk failed");
                    resolution.unresolved.insert(oid.clone());
                }
            }
        }
        resolution
    }

    pub fn resolve_all<'a>(&self, oids: impl IntoIterator<Item = &'a Oid>) -> Resolution {
        let mut all = Resolution::default();
        for oid in oids {
            all.merge(self.resolve(oid));
        }
        all
    }

    /// Path a removed entry used to have, via its (still existing) parent
    pub fn resolve_entry(&self, entry: &EntryRef) -> Result<String, ResolveError> {
        Ok(join(&self.dir_path(&entry.parent)?, &entry.name))
    }

    fn links(&self, oid: &Oid) -> Result<Vec<ParentLink>, ResolveError> {
        let links = self.store.parent_links(oid)?;
        if links.is_empty() {
            return Ok(vec![self.store.dir_parent(oid)?]);
        }
        Ok(links)
    }

    /// Relative path of a directory; empty for the root
    pub fn dir_path(&self, oid: &Oid) -> Result<String, ResolveError> {
        let mut names = Vec::new();
        let mut current = oid.clone();

        while !current.is_root() {
            if names.len() >= self.max_depth {
                return Err(ResolveError::DepthExceeded {
                    oid: oid.clone(),
                    depth: self.max_depth,
                });
            }
            let link = self.store.dir_parent(&current)?;
            names.push(link.name);
            current = link.parent;
        }

        names.reverse();
        Ok(names.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oid::ROOT_OID;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemoryStore {
        files: HashMap<Oid, Vec<ParentLink>>,
        dirs: HashMap<Oid, ParentLink>,
    }

    impl MemoryStore {
        fn dir(&mut self, oid: &Oid, parent: &Oid, name: &str) {
            self.dirs.insert(
                oid.clone(),
                ParentLink {
                    parent: parent.clone(),
                    name: name.to_string(),
                },
            );
        }

        fn file(&mut self, oid: &Oid, parent: &Oid, name: &str) {
            self.files.entry(oid.clone()).or_default().push(ParentLink {
                parent: parent.clone(),
                name: name.to_string(),
            });
        }
    }

    impl ObjectStore for MemoryStore {
        fn parent_links(&self, oid: &Oid) -> Result<Vec<ParentLink>, ResolveError> {
            if self.dirs.contains_key(oid) {
                return Ok(Vec::new());
            }
            self.files
                .get(oid)
                .cloned()
                .ok_or_else(|| ResolveError::NotFound(oid.clone()))
        }

        fn dir_parent(&self, oid: &Oid) -> Result<ParentLink, ResolveError> {
            self.dirs
                .get(oid)
                .cloned()
                .ok_or_else(|| ResolveError::NotFound(oid.clone()))
        }
    }

    fn oid(n: u32) -> Oid {
        Oid::parse(&format!("{:08x}-0000-0000-0000-000000000000", n)).unwrap()
    }

    /// root/a/b with file f in b (hardlinked as root/top) and g in root
    fn tree() -> MemoryStore {
        let mut store = MemoryStore::default();
        store.dir(&oid(1), &ROOT_OID, "a");
        store.dir(&oid(2), &oid(1), "b");
        store.file(&oid(10), &oid(2), "f.txt");
        store.file(&oid(10), &ROOT_OID, "top.txt");
        store.file(&oid(11), &ROOT_OID, "g.txt");
        store
    }

    fn paths(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_file_under_root() {
        let resolver = PathResolver::new(tree());
        let res = resolver.resolve(&oid(11));
        assert_eq!(res.paths, paths(&["g.txt"]));
        assert!(res.unresolved.is_empty());
    }

    #[test]
    fn test_hardlinks_yield_all_paths() {
        let resolver = PathResolver::new(tree());
        let res = resolver.resolve(&oid(10));
        assert_eq!(res.paths, paths(&["a/b/f.txt", "top.txt"]));
    }

    #[test]
    fn test_directory_resolution() {
        let resolver = PathResolver::new(tree());
        assert_eq!(resolver.resolve(&oid(2)).paths, paths(&["a/b"]));
        assert_eq!(resolver.dir_path(&ROOT_OID).unwrap(), "");
    }

    #[test]
    fn test_root_resolves_to_nothing() {
        let resolver = PathResolver::new(tree());
        assert_eq!(resolver.resolve(&ROOT_OID), Resolution::default());
    }

    #[test]
    fn test_unknown_oid_is_unresolved() {
        let resolver = PathResolver::new(tree());
        let res = resolver.resolve(&oid(99));
        assert!(res.paths.is_empty());
        assert_eq!(res.unresolved, [oid(99)].into_iter().collect());
    }

    #[test]
    fn test_broken_chain_keeps_other_links() {
        let mut store = tree();
        // second link of 11 sits in a directory whose parent is gone
        store.dir(&oid(3), &oid(50), "orphan");
        store.file(&oid(11), &oid(3), "g2.txt");
        let resolver = PathResolver::new(store);
        let res = resolver.resolve(&oid(11));
        assert_eq!(res.paths, paths(&["g.txt"]));
        assert_eq!(res.unresolved, [oid(11)].into_iter().collect());
    }

    #[test]
    fn test_cyclic_chain_is_bounded() {
        let mut store = MemoryStore::default();
        store.dir(&oid(1), &oid(2), "x");
        store.dir(&oid(2), &oid(1), "y");
        store.file(&oid(10), &oid(1), "f");
        let resolver = PathResolver::new(store).with_max_depth(16);

        assert!(matches!(
            resolver.dir_path(&oid(1)),
            Err(ResolveError::DepthExceeded { depth: 16, .. })
        ));
        let res = resolver.resolve(&oid(10));
        assert!(res.paths.is_empty());
        assert!(res.unresolved.contains(&oid(10)));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let resolver = PathResolver::new(tree());
        assert_eq!(resolver.resolve(&oid(10)), resolver.resolve(&oid(10)));
    }

    #[test]
    fn test_resolve_all_merges() {
        let resolver = PathResolver::new(tree());
        let res = resolver.resolve_all(&[oid(10), oid(11), oid(99)]);
        assert_eq!(res.paths, paths(&["a/b/f.txt", "top.txt", "g.txt"]));
        assert_eq!(res.unresolved.len(), 1);
    }

    #[test]
    fn test_resolve_removed_entry() {
        let resolver = PathResolver::new(tree());
        let entry = EntryRef {
            parent: oid(2),
            name: "deleted.txt".to_string(),
        };
        assert_eq!(resolver.resolve_entry(&entry).unwrap(), "a/b/deleted.txt");

        let at_root = EntryRef {
            parent: ROOT_OID,
            name: "gone".to_string(),
        };
        assert_eq!(resolver.resolve_entry(&at_root).unwrap(), "gone");

        let orphan = EntryRef {
            parent: oid(77),
            name: "x".to_string(),
        };
        assert!(matches!(
            resolver.resolve_entry(&orphan),
            Err(ResolveError::NotFound(_))
        ));
    }
}
