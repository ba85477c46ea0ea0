//! In-process storage backend. Nothing survives the process; used by tests
//! to simulate restarts (share one instance across component rebuilds) and
//! by callers that explicitly want an ephemeral session.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{KvStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let map = self
            .map
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))?;
        Ok(map.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut map = self
            .map
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))?;
        map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut map = self
            .map
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))?;
        map.remove(key);
        Ok(())
    }
}
