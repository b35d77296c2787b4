// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Minimal persistent key-value collections.
//!
//! One JSON file per collection, rewritten on every mutation. Holds the
//! server identity, registered users, and peer connections; none of these
//! change often enough to need anything smarter.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub struct KvStore<T> {
    path: Option<PathBuf>,
    map: RwLock<BTreeMap<String, T>>,
}

impl<T> KvStore<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Open a file-backed collection, loading existing contents.
    pub fn open(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let map = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path: Some(path),
            map: RwLock::new(map),
        })
    }

    /// Ephemeral collection for tests.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            map: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.map.read().get(key).cloned()
    }

    pub fn put(&self, key: &str, value: T) -> crate::Result<()> {
        let mut map = self.map.write();
        map.insert(key.to_string(), value);
        self.persist(&map)
    }

    pub fn del(&self, key: &str) -> crate::Result<()> {
        let mut map = self.map.write();
        map.remove(key);
        self.persist(&map)
    }

    pub fn keys(&self) -> Vec<String> {
        self.map.read().keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(String, T)> {
        self.map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    fn persist(&self, map: &BTreeMap<String, T>) -> crate::Result<()> {
        if let Some(path) = &self.path {
            let bytes = serde_json::to_vec_pretty(map)?;
            std::fs::write(path, bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");

        let store: KvStore<String> = KvStore::open(&path).unwrap();
        store.put("alice", "hash1".to_string()).unwrap();
        store.put("bob", "hash2".to_string()).unwrap();
        store.del("bob").unwrap();

        let reopened: KvStore<String> = KvStore::open(&path).unwrap();
        assert_eq!(reopened.get("alice").as_deref(), Some("hash1"));
        assert_eq!(reopened.get("bob"), None);
        assert_eq!(reopened.keys(), ["alice"]);
    }

    #[test]
    fn test_in_memory_store_basic_ops() {
        let store: KvStore<u64> = KvStore::in_memory();
        assert!(store.is_empty());
        store.put("a", 1).unwrap();
        assert_eq!(store.get("a"), Some(1));
        assert_eq!(store.entries(), [("a".to_string(), 1)]);
    }
}
