//! Persistent JSON document store
//!
//! Each concern persists into its own flat JSON document: completed
//! downloads, failed downloads, and the playlist. Writes go to a temp
//! file first and are renamed into place, so a crash mid-write leaves
//! the previous document intact. A document that is missing, empty, or
//! unparseable loads as "no data": the broken file is deleted rather
//! than propagated as a fatal error. Durability is best-effort per
//! document; there is no cross-document atomicity.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

/// Document name for the completed-download metadata list.
pub const DOWNLOADS_DOC: &str = "downloads.json";
/// Document name for the failed-download list.
pub const FAILED_DOC: &str = "failed.json";
/// Document name for the playlist state.
pub const PLAYLIST_DOC: &str = "playlist.json";

/// Atomic load/save of JSON documents under one data directory.
#[derive(Debug)]
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::storage(&dir, format!("failed to create data dir: {}", e)))?;
        Ok(Self { dir })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Load a document, treating a corrupt or empty file as absent.
    pub async fn load<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let path = self.path(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("failed to read {}: {}", path.display(), e);
                return None;
            }
        };

        if bytes.is_empty() {
            tracing::warn!("{} is empty, discarding", path.display());
            discard(&path).await;
            return None;
        }

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("{} failed to parse ({}), discarding", path.display(), e);
                discard(&path).await;
                None
            }
        }
    }

    /// Save a document with replace-on-write semantics.
    pub async fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.path(name);
        let tmp = self.dir.join(format!("{}.tmp", name));

        let json = serde_json::to_vec_pretty(value)?;

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| Error::storage(&tmp, format!("failed to create temp file: {}", e)))?;
        file.write_all(&json)
            .await
            .map_err(|e| Error::storage(&tmp, format!("failed to write: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| Error::storage(&tmp, format!("failed to sync: {}", e)))?;
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::storage(&path, format!("failed to replace document: {}", e)))?;

        Ok(())
    }

    /// Delete a document if it exists.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let path = self.path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(&path, format!("failed to remove: {}", e))),
        }
    }
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::debug!("failed to remove {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        version: u32,
        names: Vec<String>,
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::open(dir.path()).await.unwrap();

        let doc = Doc {
            version: 1,
            names: vec!["a".into(), "b".into()],
        };
        store.save("test.json", &doc).await.unwrap();

        let loaded: Doc = store.load("test.json").await.unwrap();
        assert_eq!(loaded, doc);
    }

    #[tokio::test]
    async fn missing_document_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::open(dir.path()).await.unwrap();
        assert!(store.load::<Doc>("nothing.json").await.is_none());
    }

    #[tokio::test]
    async fn corrupt_document_is_deleted_and_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::open(dir.path()).await.unwrap();

        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, b"{not json at all").await.unwrap();

        assert!(store.load::<Doc>("broken.json").await.is_none());
        assert!(!path.exists(), "corrupt file should have been removed");
    }

    #[tokio::test]
    async fn empty_document_is_deleted_and_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::open(dir.path()).await.unwrap();

        let path = dir.path().join("empty.json");
        tokio::fs::write(&path, b"").await.unwrap();

        assert!(store.load::<Doc>("empty.json").await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn save_replaces_previous_document() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::open(dir.path()).await.unwrap();

        let first = Doc {
            version: 1,
            names: vec!["old".into()],
        };
        let second = Doc {
            version: 1,
            names: vec!["new".into()],
        };
        store.save("doc.json", &first).await.unwrap();
        store.save("doc.json", &second).await.unwrap();

        let loaded: Doc = store.load("doc.json").await.unwrap();
        assert_eq!(loaded, second);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::open(dir.path()).await.unwrap();
        store.remove("gone.json").await.unwrap();
        store.remove("gone.json").await.unwrap();
    }
}
