use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use tokio::sync::RwLock;

use crate::types::MetaStore;

/// Non-durable store, used in tests and when no registry path is configured.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetaStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, (Vec<u8>, u64)>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(inner: &mut Inner) -> u64 {
        inner.revision = inner.revision.saturating_add(1);
        inner.revision
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let rev = Self::next_revision(&mut inner);
        inner.kv.insert(key.to_string(), (value, rev));
        Ok(rev)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner.kv.get(key).map(|(v, rev)| (v.clone(), *rev)))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        if inner.kv.remove(key).is_none() {
            return Ok(inner.revision);
        }
        Ok(Self::next_revision(&mut inner))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        let out = inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, rev))| (k.clone(), v.clone(), *rev))
            .collect();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn revisions_increase_and_prefix_is_scoped() {
        let store = MemoryMetaStore::new();
        let r1 = store.put("/nodes/a", b"1".to_vec()).await.unwrap();
        let r2 = store.put("/nodes/b", b"2".to_vec()).await.unwrap();
        store.put("/other/x", b"3".to_vec()).await.unwrap();
        assert!(r2 > r1);

        let listed = store.list_prefix("/nodes/").await.unwrap();
        let keys: Vec<&str> = listed.iter().map(|(k, _, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["/nodes/a", "/nodes/b"]);

        let (value, rev) = store.get("/nodes/a").await.unwrap().unwrap();
        assert_eq!(value, b"1");
        assert_eq!(rev, r1);
    }

    #[tokio::test]
    async fn deleting_missing_key_keeps_revision() {
        let store = MemoryMetaStore::new();
        let r1 = store.put("/nodes/a", b"1".to_vec()).await.unwrap();
        assert_eq!(store.delete("/nodes/missing").await.unwrap(), r1);
        let r2 = store.delete("/nodes/a").await.unwrap();
        assert!(r2 > r1);
        assert!(store.get("/nodes/a").await.unwrap().is_none());
    }
}
