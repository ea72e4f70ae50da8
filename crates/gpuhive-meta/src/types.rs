use anyhow::Result;
use async_trait::async_trait;

/// Revisioned key/value store holding the durable cluster configuration.
///
/// Every successful write bumps a store-wide revision; `put`/`delete` return
/// the new revision and reads return the revision of the last write to the key.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64>;
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;
    async fn delete(&self, key: &str) -> Result<u64>;

    /// Entries whose key starts with `prefix`, in key order.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>>;
}
