// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Key-value collaborators.

use core::fmt;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::error::PersistError;

/// A synchronous string store.
///
/// Implementations swallow their own failures: a failed `get` reads as
/// missing and a failed `set` is logged and dropped.
pub trait KeyValueStore {
    /// Returns the stored text for `key`.
    fn get(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`.
    fn set(&self, key: &str, value: String);

    /// Removes `key`.
    fn remove(&self, key: &str);
}

/// In-memory store. Clones share entries.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Rc<RefCell<HashMap<String, String>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.entries.borrow_mut().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.entries.borrow_mut().remove(key);
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("len", &self.len())
            .finish()
    }
}

/// A JSON object of strings on disk, rewritten on every change.
///
/// Entries are loaded once on [`open`](Self::open). Writes replace the file
/// through a sibling temporary file, so a crash mid-write leaves the old
/// contents intact.
pub struct FileStore {
    path: PathBuf,
    entries: RefCell<BTreeMap<String, String>>,
}

impl FileStore {
    /// Opens `path`, starting empty if it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|source| PersistError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(PersistError::Io { path, source }),
        };
        debug!(path = %path.display(), "opened file store");
        Ok(Self {
            path,
            entries: RefCell::new(entries),
        })
    }

    /// Opens `path`, discarding unreadable contents instead of failing.
    #[must_use]
    pub fn open_or_reset(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::open(&path) {
            Ok(store) => store,
            Err(error) => {
                warn!(%error, "starting with an empty file store");
                Self {
                    path,
                    entries: RefCell::new(BTreeMap::new()),
                }
            }
        }
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), PersistError> {
        let text = serde_json::to_string_pretty(&*self.entries.borrow()).map_err(|source| {
            PersistError::Corrupt {
                path: self.path.clone(),
                source,
            }
        })?;
        let tmp = self.path.with_extension("tmp");
        let io = |source| PersistError::Io {
            path: self.path.clone(),
            source,
        };
        fs::write(&tmp, text).map_err(io)?;
        fs::rename(&tmp, &self.path).map_err(io)
    }

    fn flush_or_warn(&self) {
        if let Err(error) = self.flush() {
            warn!(%error, "failed to write file store");
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.entries.borrow_mut().insert(key.to_string(), value);
        self.flush_or_warn();
    }

    fn remove(&self, key: &str) {
        if self.entries.borrow_mut().remove(key).is_some() {
            self.flush_or_warn();
        }
    }
}

impl fmt::Debug for FileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("len", &self.entries.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_clones_share_entries() {
        let a = MemoryStore::new();
        let b = a.clone();
        a.set("k", "1".into());
        assert_eq!(b.get("k").as_deref(), Some("1"));
        b.remove("k");
        assert!(a.is_empty());
    }

    #[test]
    fn file_store_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = FileStore::open(&path).unwrap();
        store.set("theme", "\"dark\"".into());

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get("theme").as_deref(), Some("\"dark\""));
        reopened.remove("theme");
        assert_eq!(FileStore::open(&path).unwrap().get("theme"), None);
    }

    #[test]
    fn corrupt_file_is_reported_or_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FileStore::open(&path),
            Err(PersistError::Corrupt { .. })
        ));
        let store = FileStore::open_or_reset(&path);
        assert_eq!(store.get("anything"), None);
    }
}
