use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::types::MetaStore;

/// Durable store backed by a single JSON document.
///
/// Values must be JSON so the file stays readable and hand-editable. Every
/// write rewrites the document through a temporary file and a rename; the
/// in-memory copy only changes once the rename succeeded.
#[derive(Debug, Clone)]
pub struct FileMetaStore {
    path: PathBuf,
    doc: Arc<Mutex<Document>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Document {
    revision: u64,
    #[serde(default)]
    entries: BTreeMap<String, Entry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    revision: u64,
    value: serde_json::Value,
}

impl FileMetaStore {
    /// Opens the store, starting empty if the file does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(|b| b.is_ascii_whitespace()) => Document::default(),
            Ok(bytes) => serde_json::from_slice::<Document>(&bytes)
                .with_context(|| format!("malformed store file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Document::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        tracing::debug!(path=%path.display(), entries=doc.entries.len(), "opened file store");
        Ok(Self {
            path,
            doc: Arc::new(Mutex::new(doc)),
        })
    }

    async fn persist(&self, doc: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let bytes = serde_json::to_vec_pretty(doc)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MetaStore for FileMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let value: serde_json::Value = serde_json::from_slice(&value)
            .with_context(|| format!("value for '{key}' is not JSON"))?;

        let mut doc = self.doc.lock().await;
        let mut next = doc.clone();
        next.revision = next.revision.saturating_add(1);
        let rev = next.revision;
        next.entries.insert(
            key.to_string(),
            Entry {
                revision: rev,
                value,
            },
        );
        self.persist(&next).await?;
        *doc = next;
        Ok(rev)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let doc = self.doc.lock().await;
        match doc.entries.get(key) {
            Some(entry) => Ok(Some((serde_json::to_vec(&entry.value)?, entry.revision))),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut doc = self.doc.lock().await;
        if !doc.entries.contains_key(key) {
            return Ok(doc.revision);
        }
        let mut next = doc.clone();
        next.entries.remove(key);
        next.revision = next.revision.saturating_add(1);
        let rev = next.revision;
        self.persist(&next).await?;
        *doc = next;
        Ok(rev)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let doc = self.doc.lock().await;
        let mut out = Vec::new();
        for (k, entry) in doc
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            out.push((k.clone(), serde_json::to_vec(&entry.value)?, entry.revision));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster").join("nodes.json");

        let store = FileMetaStore::open(&path).await.unwrap();
        store
            .put("/nodes/a", br#"{"id":"a","host":"10.0.0.1"}"#.to_vec())
            .await
            .unwrap();
        store.put("/nodes/b", br#"{"id":"b"}"#.to_vec()).await.unwrap();
        store.delete("/nodes/b").await.unwrap();
        drop(store);

        let reopened = FileMetaStore::open(&path).await.unwrap();
        let listed = reopened.list_prefix("/nodes/").await.unwrap();
        assert_eq!(listed.len(), 1);
        let value: serde_json::Value = serde_json::from_slice(&listed[0].1).unwrap();
        assert_eq!(value["host"], "10.0.0.1");

        // revision counter continues where it left off
        let rev = reopened.put("/nodes/c", b"{}".to_vec()).await.unwrap();
        assert_eq!(rev, 4);
    }

    #[tokio::test]
    async fn rejects_non_json_values_without_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        let store = FileMetaStore::open(&path).await.unwrap();

        assert!(store.put("/nodes/a", b"not json".to_vec()).await.is_err());
        assert!(!path.exists());
        assert!(store.get("/nodes/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        std::fs::write(&path, "{ broken").unwrap();
        assert!(FileMetaStore::open(&path).await.is_err());
    }
}
