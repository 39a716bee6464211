//! In-process record store

use async_trait::async_trait;
use dashmap::DashMap;

use sh_core::error::StoreError;
use sh_core::traits::RecordStore;
use sh_core::types::{ServerKey, StoredRecord};

/// Record store held in memory
pub struct InMemoryStore {
    records: DashMap<ServerKey, StoredRecord>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Create a store pre-populated with records
    pub fn with_records(records: impl IntoIterator<Item = StoredRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.records.insert(record.key.clone(), record);
        }
        store
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn load(&self, key: &ServerKey) -> Result<Option<StoredRecord>, StoreError> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn save(&self, record: &StoredRecord) -> Result<(), StoreError> {
        self.records.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<StoredRecord>, StoreError> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    async fn delete_user(&self, user: &str) -> Result<(), StoreError> {
        self.records.retain(|key, _| key.user != user);
        Ok(())
    }
}
