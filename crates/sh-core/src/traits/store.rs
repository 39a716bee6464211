//! Record store trait

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{ServerKey, StoredRecord};

/// Durable storage for server records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Load one record
    async fn load(&self, key: &ServerKey) -> Result<Option<StoredRecord>, StoreError>;

    /// Insert or replace one record
    async fn save(&self, record: &StoredRecord) -> Result<(), StoreError>;

    /// Every stored record
    async fn load_all(&self) -> Result<Vec<StoredRecord>, StoreError>;

    /// Remove every record owned by `user`
    async fn delete_user(&self, user: &str) -> Result<(), StoreError>;
}
