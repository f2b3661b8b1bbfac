//! Object pools — where a token's keys, certificates and data objects live
//!
//! - **SessionObjectPool**: memory only, dies with its session
//! - **TokenObjectPool**: cached view over a durable `ObjectStore`; private
//!   objects stay invisible until the master key is installed
//! - **ObjectStore / FileObjectStore**: blob persistence
//! - **ObjectImporter / LegacyTokenImporter**: one-time import of an older token
//!
//! Pools own their objects. Everyone else holds handles and works on copies
//! that are written back with `flush`.

pub mod importer;
pub mod session_pool;
pub mod store;
pub mod token_pool;

pub use importer::{LegacyTokenImporter, ObjectImporter};
pub use session_pool::SessionObjectPool;
pub use store::{FileObjectStore, ObjectStore, StoreId};
pub use token_pool::{PrivateLoadState, TokenObjectPool};

use crate::error::{TokenError, TokenResult};
use crate::object::{Object, ObjectHandle, INVALID_HANDLE};
use std::sync::atomic::{AtomicU64, Ordering};

/// Non-object metadata kept alongside a token's objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalBlobId {
    /// `{version, hash_byte}` over the raw authorization data
    AuthDataHash,
    /// Authorization key wrapping the master key (TPM 1.2 hierarchy)
    AuthKey,
    /// Master key, bound or sealed by the TPM
    EncryptedMasterKey,
    /// Root key of an imported legacy hierarchy
    LegacyRootKey,
    /// Progress marker of the one-time legacy import
    ImportState,
}

impl InternalBlobId {
    pub fn name(&self) -> &'static str {
        match self {
            InternalBlobId::AuthDataHash => "auth_data_hash",
            InternalBlobId::AuthKey => "auth_key",
            InternalBlobId::EncryptedMasterKey => "encrypted_master_key",
            InternalBlobId::LegacyRootKey => "legacy_root_key",
            InternalBlobId::ImportState => "import_state",
        }
    }
}

/// Process-wide object handle source shared by every pool
#[derive(Debug)]
pub struct HandleGenerator {
    next: AtomicU64,
}

impl HandleGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(INVALID_HANDLE + 1),
        }
    }

    /// Next unused handle; exhaustion is an error rather than reuse
    pub fn next_handle(&self) -> TokenResult<ObjectHandle> {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |h| h.checked_add(1))
            .map_err(|_| TokenError::GeneralError("Object handle space exhausted".into()))
    }
}

impl Default for HandleGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared contract of session and token pools
pub trait ObjectPool: Send + Sync {
    fn get_internal_blob(&self, id: InternalBlobId) -> Option<Vec<u8>>;

    fn set_internal_blob(&self, id: InternalBlobId, blob: &[u8]) -> TokenResult<()>;

    /// Install the master key, loading deferred private objects. Returns
    /// false if the private objects could not be decrypted.
    fn set_encryption_key(&self, key: &[u8]) -> bool;

    fn is_private_loaded(&self) -> bool;

    /// Track a new object and return its handle
    fn insert(&self, object: Object) -> TokenResult<ObjectHandle>;

    /// Handles of all visible objects matching every attribute in `template`
    fn find(&self, template: &Object) -> Vec<ObjectHandle>;

    fn get_object(&self, handle: ObjectHandle) -> TokenResult<Object>;

    /// Working copy of a tracked object; changes take effect on `flush`
    fn get_modifiable_object(&self, handle: ObjectHandle) -> TokenResult<Object>;

    /// Write back a modified copy
    fn flush(&self, object: &Object) -> TokenResult<()>;

    fn delete(&self, handle: ObjectHandle) -> TokenResult<()>;

    fn delete_all(&self) -> TokenResult<()>;

    fn contains(&self, handle: ObjectHandle) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_handles_unique_across_threads() {
        let generator = Arc::new(HandleGenerator::new());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || (0..500).map(|_| generator.next_handle().unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for t in threads {
            for handle in t.join().unwrap() {
                assert_ne!(handle, INVALID_HANDLE);
                assert!(seen.insert(handle));
            }
        }
        assert_eq!(seen.len(), 2000);
    }

    #[test]
    fn test_handle_exhaustion() {
        let generator = HandleGenerator {
            next: AtomicU64::new(u64::MAX),
        };
        assert!(generator.next_handle().is_err());
    }
}
