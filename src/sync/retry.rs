// Paths parked after repeated transfer failures
//
// Once a failing batch has held the checkpoint back for the configured number
// of cycles, its paths move here and the checkpoint advances. Every later
// cycle offers them to the sink again until they go through.
//
// Stored as NUL-separated paths, the same framing the paths get on their
// way to rsync.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

#[derive(Debug, Default)]
pub struct RetryList {
    path: Option<PathBuf>,
    items: BTreeSet<String>,
}

impl RetryList {
    pub const FILE_NAME: &'static str = "retry.lst";

    /// A list that lives only as long as the worker
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load `<workdir>/retry.lst`, empty when absent
    pub fn open(workdir: &Path) -> Result<Self> {
        let path = workdir.join(Self::FILE_NAME);
        let items = match fs::read(&path) {
            Ok(bytes) => bytes
                .split(|b| *b == 0)
                .filter(|item| !item.is_empty())
                .map(|item| String::from_utf8_lossy(item).into_owned())
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            items,
        })
    }

    pub fn items(&self) -> &BTreeSet<String> {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Swap in a new set of parked paths, persisting it first
    pub fn replace(&mut self, items: BTreeSet<String>) -> Result<()> {
        if items == self.items {
            return Ok(());
        }
        if let Some(path) = &self.path {
            Self::save_to_file(path, &items)?;
        }
        self.items = items;
        Ok(())
    }

    fn save_to_file(path: &Path, items: &BTreeSet<String>) -> Result<()> {
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        for item in items {
            temp.write_all(item.as_bytes())?;
            temp.write_all(b"\0")?;
        }
        temp.as_file().sync_all()?;
        temp.persist(path)
            .map_err(|e| SyncError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let list = RetryList::open(temp.path()).unwrap();
        assert!(list.is_empty());
        assert!(!temp.path().join(RetryList::FILE_NAME).exists());
    }

    #[test]
    fn test_replace_persists() {
        let temp = TempDir::new().unwrap();
        {
            let mut list = RetryList::open(temp.path()).unwrap();
            list.replace(set(&["a/with space.txt", "line\nbreak"])).unwrap();
        }

        let list = RetryList::open(temp.path()).unwrap();
        assert_eq!(list.items(), &set(&["a/with space.txt", "line\nbreak"]));

        let mut list = list;
        list.replace(BTreeSet::new()).unwrap();
        assert!(RetryList::open(temp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_failed_save_keeps_items() {
        let temp = TempDir::new().unwrap();
        let mut list = RetryList::open(temp.path()).unwrap();
        list.replace(set(&["a"])).unwrap();

        let file = temp.path().join(RetryList::FILE_NAME);
        fs::remove_file(&file).unwrap();
        fs::create_dir(&file).unwrap();
        assert!(list.replace(set(&["a", "b"])).is_err());
        assert_eq!(list.items(), &set(&["a"]));
    }
}
