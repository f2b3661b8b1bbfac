//! One-time import of objects from an older token format
//!
//! The import runs in two stages: public objects when the pool opens,
//! private objects once the master key is known. The pool records progress
//! in [`InternalBlobId::ImportState`] so each stage runs once.

use super::{InternalBlobId, ObjectPool};
use crate::error::TokenResult;
use crate::object::{AttributeType, Object, CKA_LEGACY_KEY, CKA_PRIVATE, CKA_TOKEN};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Legacy object listing inside a legacy token directory
pub const LEGACY_OBJECTS_FILE: &str = "legacy-objects.json";
/// Wrapped legacy root key inside a legacy token directory
pub const LEGACY_ROOT_KEY_FILE: &str = "legacy-root-key.blob";

/// Source of objects to migrate into a token pool
pub trait ObjectImporter: Send {
    fn import_public_objects(&mut self, pool: &dyn ObjectPool) -> TokenResult<()>;

    fn import_private_objects(&mut self, pool: &dyn ObjectPool) -> TokenResult<()>;
}

#[derive(Debug, Deserialize)]
struct LegacyObject {
    #[serde(default)]
    private: bool,
    attributes: BTreeMap<AttributeType, String>,
}

#[derive(Debug, Deserialize)]
struct LegacyListing {
    objects: Vec<LegacyObject>,
}

/// Imports a legacy token directory
///
/// TPM-wrapped keys in the legacy listing hang off the legacy root key; they
/// are tagged with `CKA_LEGACY_KEY` so sessions load them through that root.
pub struct LegacyTokenImporter {
    dir: PathBuf,
}

impl LegacyTokenImporter {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Whether `dir` looks like a legacy token directory
    pub fn is_legacy_dir(dir: &Path) -> bool {
        dir.join(LEGACY_OBJECTS_FILE).exists()
    }

    fn read_listing(&self) -> TokenResult<LegacyListing> {
        let path = self.dir.join(LEGACY_OBJECTS_FILE);
        if !path.exists() {
            return Ok(LegacyListing { objects: Vec::new() });
        }
        let json = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    fn import(&self, pool: &dyn ObjectPool, private: bool) -> TokenResult<usize> {
        let mut imported = 0;
        for entry in self.read_listing()?.objects.into_iter().filter(|o| o.private == private) {
            let mut object = Object::new();
            for (kind, value) in &entry.attributes {
                object.set_bytes(*kind, hex::decode(value)?);
            }
            object.set_bool(CKA_TOKEN, true);
            object.set_bool(CKA_PRIVATE, private);
            if object.is_tpm_backed() {
                object.set_bool(CKA_LEGACY_KEY, true);
            }
            pool.insert(object)?;
            imported += 1;
        }
        Ok(imported)
    }
}

impl ObjectImporter for LegacyTokenImporter {
    fn import_public_objects(&mut self, pool: &dyn ObjectPool) -> TokenResult<()> {
        let root = self.dir.join(LEGACY_ROOT_KEY_FILE);
        if root.exists() {
            pool.set_internal_blob(InternalBlobId::LegacyRootKey, &std::fs::read(&root)?)?;
        }
        let count = self.import(pool, false)?;
        log::info!("Imported {} public objects from {}", count, self.dir.display());
        Ok(())
    }

    fn import_private_objects(&mut self, pool: &dyn ObjectPool) -> TokenResult<()> {
        let count = self.import(pool, true)?;
        log::info!("Imported {} private objects from {}", count, self.dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{CKA_CLASS, CKA_LABEL, CKA_TPM_KEY_BLOB, CKO_DATA, CKO_PRIVATE_KEY};
    use crate::pool::{FileObjectStore, HandleGenerator, TokenObjectPool};
    use std::sync::Arc;

    fn legacy_fixture(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        let listing = serde_json::json!({
            "objects": [
                {
                    "private": false,
                    "attributes": {
                        CKA_CLASS.to_string(): hex::encode(CKO_DATA.to_le_bytes()),
                        CKA_LABEL.to_string(): hex::encode(b"old data"),
                    }
                },
                {
                    "private": true,
                    "attributes": {
                        CKA_CLASS.to_string(): hex::encode(CKO_PRIVATE_KEY.to_le_bytes()),
                        CKA_TPM_KEY_BLOB.to_string(): hex::encode(b"wrapped"),
                    }
                }
            ]
        });
        std::fs::write(dir.join(LEGACY_OBJECTS_FILE), listing.to_string()).unwrap();
        std::fs::write(dir.join(LEGACY_ROOT_KEY_FILE), b"root blob").unwrap();
    }

    #[test]
    fn test_two_stage_import_runs_once() {
        let base = std::env::temp_dir().join(format!("tpmtok-import-{}", uuid::Uuid::new_v4()));
        let legacy = base.join("legacy");
        legacy_fixture(&legacy);
        assert!(LegacyTokenImporter::is_legacy_dir(&legacy));

        let open = || {
            let store = FileObjectStore::open(base.join("store")).unwrap();
            let importer: Box<dyn ObjectImporter> = Box::new(LegacyTokenImporter::new(&legacy));
            TokenObjectPool::new(Arc::new(HandleGenerator::new()), Box::new(store), Some(importer)).unwrap()
        };

        {
            let pool = open();
            assert_eq!(pool.len(), 1);
            assert_eq!(pool.get_internal_blob(InternalBlobId::LegacyRootKey), Some(b"root blob".to_vec()));
            assert!(pool.set_encryption_key(&[3u8; 32]));
            assert_eq!(pool.len(), 2);

            let legacy_keys = Object::from_template(&[crate::object::Attribute::bool(CKA_LEGACY_KEY, true)]);
            assert_eq!(pool.find(&legacy_keys).len(), 1);
        }

        let pool = open();
        assert_eq!(pool.len(), 1);
        assert!(pool.set_encryption_key(&[3u8; 32]));
        assert_eq!(pool.len(), 2);

        let _ = std::fs::remove_dir_all(&base);
    }
}
