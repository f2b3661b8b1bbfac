//! Durable blob storage for token objects
//!
//! One JSON index per token directory. Private blobs are sealed with the
//! master key before they reach disk; public blobs are stored as-is.

use crate::crypto::{open_blob, seal_blob};
use crate::error::{TokenError, TokenResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Identifier of a blob within one store
pub type StoreId = u64;

/// File name of the index inside a token directory
pub const STORE_FILE: &str = "token-store.json";

/// Blob persistence behind a token pool
pub trait ObjectStore: Send {
    fn get_internal_blob(&self, name: &str) -> Option<Vec<u8>>;

    fn set_internal_blob(&mut self, name: &str, blob: &[u8]) -> TokenResult<()>;

    /// Key for sealing private blobs; loads fail until it is set
    fn set_encryption_key(&mut self, key: &[u8]) -> TokenResult<()>;

    /// Forget the key so private blobs can no longer be sealed or opened
    fn clear_encryption_key(&mut self);

    fn insert_object_blob(&mut self, blob: &[u8], is_private: bool) -> TokenResult<StoreId>;

    fn update_object_blob(&mut self, id: StoreId, blob: &[u8], is_private: bool) -> TokenResult<()>;

    fn delete_object_blob(&mut self, id: StoreId) -> TokenResult<()>;

    /// Remove every object and internal blob
    fn delete_all(&mut self) -> TokenResult<()>;

    fn load_public_object_blobs(&self) -> TokenResult<Vec<(StoreId, Vec<u8>)>>;

    /// Open every private blob the key can open. Fails only when private
    /// blobs exist and none of them opens.
    fn load_private_object_blobs(&self) -> TokenResult<Vec<(StoreId, Zeroizing<Vec<u8>>)>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    blob: String,
    is_private: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreIndex {
    next_id: StoreId,
    objects: BTreeMap<StoreId, StoredRecord>,
    internal: BTreeMap<String, String>,
    last_updated: DateTime<Utc>,
}

impl StoreIndex {
    fn new() -> Self {
        Self {
            next_id: 1,
            objects: BTreeMap::new(),
            internal: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }
}

/// `ObjectStore` persisted as `token-store.json` under a token directory
pub struct FileObjectStore {
    path: PathBuf,
    index: StoreIndex,
    key: Option<Zeroizing<Vec<u8>>>,
}

impl FileObjectStore {
    /// Open (or create) the store inside `dir`
    pub fn open(dir: impl AsRef<Path>) -> TokenResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(STORE_FILE);
        if path.exists() {
            let json = std::fs::read_to_string(&path)?;
            let index: StoreIndex = serde_json::from_str(&json)
                .map_err(|e| TokenError::GeneralError(format!("Corrupt token store {}: {}", path.display(), e)))?;
            log::debug!("Opened token store {} ({} objects)", path.display(), index.objects.len());
            return Ok(Self { path, index, key: None });
        }

        let store = Self {
            path,
            index: StoreIndex::new(),
            key: None,
        };
        store.write(&store.index)?;
        log::info!("Created token store {}", store.path.display());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `next` and adopt it only once it is on disk
    fn commit(&mut self, mut next: StoreIndex) -> TokenResult<()> {
        next.last_updated = Utc::now();
        self.write(&next)?;
        self.index = next;
        Ok(())
    }

    fn write(&self, index: &StoreIndex) -> TokenResult<()> {
        let json = serde_json::to_string_pretty(index)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn encode(&self, blob: &[u8], is_private: bool) -> TokenResult<String> {
        if !is_private {
            return Ok(hex::encode(blob));
        }
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| TokenError::GeneralError("Private objects are not available yet".into()))?;
        Ok(hex::encode(seal_blob(key, blob)?))
    }
}

impl ObjectStore for FileObjectStore {
    fn get_internal_blob(&self, name: &str) -> Option<Vec<u8>> {
        self.index.internal.get(name).and_then(|v| hex::decode(v).ok())
    }

    fn set_internal_blob(&mut self, name: &str, blob: &[u8]) -> TokenResult<()> {
        let mut next = self.index.clone();
        next.internal.insert(name.to_string(), hex::encode(blob));
        self.commit(next)
    }

    fn set_encryption_key(&mut self, key: &[u8]) -> TokenResult<()> {
        if key.len() != 32 {
            return Err(TokenError::GeneralError("Master key must be 32 bytes".into()));
        }
        self.key = Some(Zeroizing::new(key.to_vec()));
        Ok(())
    }

    fn clear_encryption_key(&mut self) {
        self.key = None;
    }

    fn insert_object_blob(&mut self, blob: &[u8], is_private: bool) -> TokenResult<StoreId> {
        let encoded = self.encode(blob, is_private)?;
        let mut next = self.index.clone();
        let id = next.next_id;
        next.next_id = id
            .checked_add(1)
            .ok_or_else(|| TokenError::GeneralError("Store id space exhausted".into()))?;
        next.objects.insert(
            id,
            StoredRecord {
                blob: encoded,
                is_private,
            },
        );
        self.commit(next)?;
        Ok(id)
    }

    fn update_object_blob(&mut self, id: StoreId, blob: &[u8], is_private: bool) -> TokenResult<()> {
        if !self.index.objects.contains_key(&id) {
            return Err(TokenError::GeneralError(format!("No stored object {}", id)));
        }
        let encoded = self.encode(blob, is_private)?;
        let mut next = self.index.clone();
        next.objects.insert(
            id,
            StoredRecord {
                blob: encoded,
                is_private,
            },
        );
        self.commit(next)
    }

    fn delete_object_blob(&mut self, id: StoreId) -> TokenResult<()> {
        let mut next = self.index.clone();
        if next.objects.remove(&id).is_none() {
            return Err(TokenError::GeneralError(format!("No stored object {}", id)));
        }
        self.commit(next)
    }

    fn delete_all(&mut self) -> TokenResult<()> {
        self.commit(StoreIndex::new())?;
        self.key = None;
        Ok(())
    }

    fn load_public_object_blobs(&self) -> TokenResult<Vec<(StoreId, Vec<u8>)>> {
        self.index
            .objects
            .iter()
            .filter(|(_, record)| !record.is_private)
            .map(|(id, record)| Ok((*id, hex::decode(&record.blob)?)))
            .collect()
    }

    fn load_private_object_blobs(&self) -> TokenResult<Vec<(StoreId, Zeroizing<Vec<u8>>)>> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| TokenError::GeneralError("Master key not set".into()))?;
        let mut total = 0;
        let mut opened = Vec::new();
        for (id, record) in self.index.objects.iter().filter(|(_, record)| record.is_private) {
            total += 1;
            let result = hex::decode(&record.blob)
                .map_err(TokenError::from)
                .and_then(|sealed| open_blob(key, &sealed));
            match result {
                Ok(blob) => opened.push((*id, blob)),
                Err(e) => log::warn!("Skipping unopenable private blob {}: {}", id, e),
            }
        }
        if total > 0 && opened.is_empty() {
            return Err(TokenError::GeneralError(format!(
                "Master key opens none of {} private blobs",
                total
            )));
        }
        Ok(opened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("tpmtok-store-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_public_blobs_persist() {
        let dir = temp_dir();
        {
            let mut store = FileObjectStore::open(&dir).unwrap();
            store.insert_object_blob(b"public one", false).unwrap();
            store.set_internal_blob("auth_key", b"wrapped").unwrap();
        }

        let store = FileObjectStore::open(&dir).unwrap();
        let blobs = store.load_public_object_blobs().unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].1, b"public one");
        assert_eq!(store.get_internal_blob("auth_key"), Some(b"wrapped".to_vec()));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_private_blobs_need_key() {
        let dir = temp_dir();
        let master = [9u8; 32];
        {
            let mut store = FileObjectStore::open(&dir).unwrap();
            assert!(store.insert_object_blob(b"secret", true).is_err());
            store.set_encryption_key(&master).unwrap();
            store.insert_object_blob(b"secret", true).unwrap();
        }

        let raw = std::fs::read_to_string(dir.join(STORE_FILE)).unwrap();
        assert!(!raw.contains(&hex::encode(b"secret")));

        let mut store = FileObjectStore::open(&dir).unwrap();
        assert!(store.load_private_object_blobs().is_err());
        store.set_encryption_key(&[1u8; 32]).unwrap();
        assert!(store.load_private_object_blobs().is_err());
        store.set_encryption_key(&master).unwrap();
        let blobs = store.load_private_object_blobs().unwrap();
        assert_eq!(blobs[0].1.as_slice(), b"secret");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_unopenable_private_blob_skipped() {
        let dir = temp_dir();
        let master = [9u8; 32];
        let mut store = FileObjectStore::open(&dir).unwrap();
        store.set_encryption_key(&master).unwrap();
        store.insert_object_blob(b"good", true).unwrap();
        store.set_encryption_key(&[5u8; 32]).unwrap();
        store.insert_object_blob(b"stray", true).unwrap();

        store.set_encryption_key(&master).unwrap();
        let blobs = store.load_private_object_blobs().unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].1.as_slice(), b"good");

        store.clear_encryption_key();
        assert!(store.load_private_object_blobs().is_err());
        assert!(store.insert_object_blob(b"late", true).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_update_delete_and_wipe() {
        let dir = temp_dir();
        let mut store = FileObjectStore::open(&dir).unwrap();
        let id = store.insert_object_blob(b"v1", false).unwrap();
        store.update_object_blob(id, b"v2", false).unwrap();
        assert_eq!(store.load_public_object_blobs().unwrap()[0].1, b"v2");

        store.delete_object_blob(id).unwrap();
        assert!(store.delete_object_blob(id).is_err());
        assert!(store.update_object_blob(id, b"v3", false).is_err());

        store.insert_object_blob(b"x", false).unwrap();
        store.set_internal_blob("marker", b"1").unwrap();
        store.delete_all().unwrap();
        assert!(store.load_public_object_blobs().unwrap().is_empty());
        assert_eq!(store.get_internal_blob("marker"), None);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_index_reported() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(STORE_FILE), "{ not json").unwrap();
        assert!(matches!(FileObjectStore::open(&dir), Err(TokenError::GeneralError(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
