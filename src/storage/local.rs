//! Local storage backend: one redb table holding one blob per collection.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use super::{KvStore, StoreError};
use crate::config::StorageConfig;

const DB_FILE_NAME: &str = "stride.redb";

const COLLECTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("collections");

pub struct LocalStore {
    db: Database,
}

impl LocalStore {
    /// Open the store at its configured location, creating it if needed.
    pub fn new(config: &StorageConfig) -> Result<Self, StoreError> {
        Self::open(&Self::db_path(config)?)
    }

    /// Open a store at an explicit path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        // Ensure the table exists so reads never race table creation
        let txn = db
            .begin_write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        {
            txn.open_table(COLLECTIONS)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { db })
    }

    fn db_path(config: &StorageConfig) -> Result<PathBuf, StoreError> {
        let data_dir = match &config.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .ok_or_else(|| {
                    StoreError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "could not determine data directory",
                    ))
                })?
                .join("stride"),
        };
        Ok(data_dir.join(DB_FILE_NAME))
    }
}

#[async_trait]
impl KvStore for LocalStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let table = txn
            .open_table(COLLECTIONS)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let value = table
            .get(key)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        {
            let mut table = txn
                .open_table(COLLECTIONS)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            table
                .insert(key, value)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        {
            let mut table = txn
                .open_table(COLLECTIONS)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            table
                .remove(key)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(&dir.path().join("test.redb")).unwrap();

        assert!(store.get("downloads").await.unwrap().is_none());

        store.set("downloads", b"{}").await.unwrap();
        assert_eq!(store.get("downloads").await.unwrap(), Some(b"{}".to_vec()));

        store.set("downloads", b"{\"a\":1}").await.unwrap();
        assert_eq!(
            store.get("downloads").await.unwrap(),
            Some(b"{\"a\":1}".to_vec())
        );

        store.remove("downloads").await.unwrap();
        assert!(store.get("downloads").await.unwrap().is_none());

        // Removing an absent key succeeds
        store.remove("downloads").await.unwrap();
    }

    #[tokio::test]
    async fn test_blobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.redb");

        {
            let store = LocalStore::open(&path).unwrap();
            store.set("history", b"[1,2,3]").await.unwrap();
        }

        let store = LocalStore::open(&path).unwrap();
        assert_eq!(
            store.get("history").await.unwrap(),
            Some(b"[1,2,3]".to_vec())
        );
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(&dir.path().join("test.redb")).unwrap();

        store.set("a", b"one").await.unwrap();
        store.set("b", b"two").await.unwrap();
        store.remove("a").await.unwrap();

        assert!(store.get("a").await.unwrap().is_none());
        assert_eq!(store.get("b").await.unwrap(), Some(b"two".to_vec()));
    }
}
