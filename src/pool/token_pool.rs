//! Persistent pool for token objects
//!
//! Public objects are loaded when the pool is created. Private objects are
//! sealed under the token's master key and only appear once
//! [`ObjectPool::set_encryption_key`] succeeds, which happens on a
//! background thread during token load. Readers that need them can block on
//! [`TokenObjectPool::wait_for_private_objects`].

use super::{HandleGenerator, InternalBlobId, ObjectImporter, ObjectPool, ObjectStore, StoreId};
use crate::error::{TokenError, TokenResult};
use crate::object::{Object, ObjectHandle};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Import marker: public stage done
const IMPORT_PUBLIC_DONE: u8 = 1;
/// Import marker: both stages done
const IMPORT_COMPLETE: u8 = 2;

/// Progress of the deferred private-object load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivateLoadState {
    /// Master key not installed yet
    Pending,
    /// Private objects decrypted and visible
    Ready,
    /// Token init failed or was abandoned; private objects stay hidden
    Failed,
}

struct PoolInner {
    store: Box<dyn ObjectStore>,
    objects: BTreeMap<ObjectHandle, Object>,
    store_ids: HashMap<ObjectHandle, StoreId>,
    /// Set once a master key has opened the private blobs
    key_installed: bool,
}

impl PoolInner {
    fn track(&mut self, handles: &HandleGenerator, id: StoreId, mut object: Object) -> TokenResult<ObjectHandle> {
        let handle = handles.next_handle()?;
        object.set_handle(handle);
        self.objects.insert(handle, object);
        self.store_ids.insert(handle, id);
        Ok(handle)
    }

    fn check_private_writable(&self, object: &Object) -> TokenResult<()> {
        if object.is_private() && !self.key_installed {
            return Err(TokenError::GeneralError("Private objects are not available".into()));
        }
        Ok(())
    }
}

/// Cached, write-through view over an [`ObjectStore`]
pub struct TokenObjectPool {
    handles: Arc<HandleGenerator>,
    inner: Mutex<PoolInner>,
    private_state: Mutex<PrivateLoadState>,
    private_changed: Condvar,
    importer: Mutex<Option<Box<dyn ObjectImporter>>>,
}

impl TokenObjectPool {
    /// Open the pool over `store`, loading public objects and running the
    /// public stage of `importer` if a legacy import is still outstanding.
    pub fn new(
        handles: Arc<HandleGenerator>,
        store: Box<dyn ObjectStore>,
        importer: Option<Box<dyn ObjectImporter>>,
    ) -> TokenResult<Self> {
        let blobs = store.load_public_object_blobs()?;
        let mut inner = PoolInner {
            store,
            objects: BTreeMap::new(),
            store_ids: HashMap::new(),
            key_installed: false,
        };
        for (id, blob) in blobs {
            match Object::from_blob(&blob) {
                Ok(object) => {
                    inner.track(&handles, id, object)?;
                }
                Err(e) => log::warn!("Skipping unreadable token object {}: {}", id, e),
            }
        }
        log::debug!("Loaded {} public token objects", inner.objects.len());

        let pool = Self {
            handles,
            inner: Mutex::new(inner),
            private_state: Mutex::new(PrivateLoadState::Pending),
            private_changed: Condvar::new(),
            importer: Mutex::new(importer),
        };

        if pool.get_internal_blob(InternalBlobId::ImportState).is_none() {
            pool.run_import(false);
        }
        Ok(pool)
    }

    pub fn private_load_state(&self) -> PrivateLoadState {
        *self.private_state.lock()
    }

    /// Block until private objects are loaded, the load fails, or `timeout`
    /// expires. Returns the state observed last.
    pub fn wait_for_private_objects(&self, timeout: Duration) -> PrivateLoadState {
        let deadline = Instant::now() + timeout;
        let mut state = self.private_state.lock();
        while *state == PrivateLoadState::Pending {
            if self.private_changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        *state
    }

    /// Give up on private objects (token init failed); releases waiters
    pub fn abandon_private_objects(&self) {
        self.set_private_state(PrivateLoadState::Failed);
    }

    /// Number of objects currently visible
    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_private_state(&self, next: PrivateLoadState) {
        *self.private_state.lock() = next;
        self.private_changed.notify_all();
    }

    /// Run one stage of the outstanding legacy import, if any. The importer
    /// calls back into the pool, so no pool lock is held meanwhile.
    fn run_import(&self, private_stage: bool) {
        let Some(mut importer) = self.importer.lock().take() else {
            return;
        };

        let (result, marker) = if private_stage {
            (importer.import_private_objects(self), IMPORT_COMPLETE)
        } else {
            (importer.import_public_objects(self), IMPORT_PUBLIC_DONE)
        };

        match result.and_then(|_| self.set_internal_blob(InternalBlobId::ImportState, &[marker])) {
            Ok(()) => log::info!("Legacy import stage {} complete", marker),
            Err(e) => log::error!("Legacy import failed: {}", e),
        }

        if !private_stage {
            *self.importer.lock() = Some(importer);
        }
    }

    /// Install `key` and track the private objects it opens. On failure the
    /// key is removed again and nothing is tracked.
    fn load_private_objects(&self, key: &[u8]) -> TokenResult<usize> {
        let mut inner = self.inner.lock();
        inner.store.set_encryption_key(key)?;
        let blobs = match inner.store.load_private_object_blobs() {
            Ok(blobs) => blobs,
            Err(e) => {
                inner.store.clear_encryption_key();
                inner.key_installed = false;
                return Err(e);
            }
        };

        let mut objects = Vec::with_capacity(blobs.len());
        for (id, blob) in blobs {
            match Object::from_blob(&blob) {
                Ok(object) => objects.push((id, object)),
                Err(e) => log::warn!("Skipping unreadable private object {}: {}", id, e),
            }
        }
        let loaded = objects.len();
        for (id, object) in objects {
            inner.track(&self.handles, id, object)?;
        }
        inner.key_installed = true;
        Ok(loaded)
    }
}

impl ObjectPool for TokenObjectPool {
    fn get_internal_blob(&self, id: InternalBlobId) -> Option<Vec<u8>> {
        self.inner.lock().store.get_internal_blob(id.name())
    }

    fn set_internal_blob(&self, id: InternalBlobId, blob: &[u8]) -> TokenResult<()> {
        self.inner.lock().store.set_internal_blob(id.name(), blob)
    }

    fn set_encryption_key(&self, key: &[u8]) -> bool {
        if self.private_load_state() == PrivateLoadState::Ready {
            log::debug!("Private objects already loaded");
            return true;
        }

        match self.load_private_objects(key) {
            Ok(count) => log::debug!("Loaded {} private token objects", count),
            Err(e) => {
                log::error!("Failed to load private objects: {}", e);
                self.set_private_state(PrivateLoadState::Failed);
                return false;
            }
        }

        if self.get_internal_blob(InternalBlobId::ImportState) != Some(vec![IMPORT_COMPLETE]) {
            self.run_import(true);
        }

        self.set_private_state(PrivateLoadState::Ready);
        true
    }

    fn is_private_loaded(&self) -> bool {
        self.private_load_state() == PrivateLoadState::Ready
    }

    fn insert(&self, mut object: Object) -> TokenResult<ObjectHandle> {
        let mut inner = self.inner.lock();
        if inner.objects.contains_key(&object.handle()) {
            return Err(TokenError::GeneralError("Object already tracked".into()));
        }
        inner.check_private_writable(&object)?;
        let id = inner.store.insert_object_blob(&object.to_blob()?, object.is_private())?;
        let handle = self.handles.next_handle()?;
        object.set_handle(handle);
        inner.objects.insert(handle, object);
        inner.store_ids.insert(handle, id);
        Ok(handle)
    }

    fn find(&self, template: &Object) -> Vec<ObjectHandle> {
        self.inner
            .lock()
            .objects
            .values()
            .filter(|object| object.matches(template))
            .map(|object| object.handle())
            .collect()
    }

    fn get_object(&self, handle: ObjectHandle) -> TokenResult<Object> {
        self.inner
            .lock()
            .objects
            .get(&handle)
            .cloned()
            .ok_or(TokenError::ObjectHandleInvalid)
    }

    fn get_modifiable_object(&self, handle: ObjectHandle) -> TokenResult<Object> {
        self.get_object(handle)
    }

    fn flush(&self, object: &Object) -> TokenResult<()> {
        let mut inner = self.inner.lock();
        let id = *inner
            .store_ids
            .get(&object.handle())
            .ok_or(TokenError::ObjectHandleInvalid)?;
        inner.check_private_writable(object)?;
        inner
            .store
            .update_object_blob(id, &object.to_blob()?, object.is_private())?;
        inner.objects.insert(object.handle(), object.clone());
        Ok(())
    }

    fn delete(&self, handle: ObjectHandle) -> TokenResult<()> {
        let mut inner = self.inner.lock();
        let id = *inner.store_ids.get(&handle).ok_or(TokenError::ObjectHandleInvalid)?;
        inner.store.delete_object_blob(id)?;
        inner.objects.remove(&handle);
        inner.store_ids.remove(&handle);
        Ok(())
    }

    fn delete_all(&self) -> TokenResult<()> {
        {
            let mut inner = self.inner.lock();
            inner.store.delete_all()?;
            inner.objects.clear();
            inner.store_ids.clear();
            inner.key_installed = false;
        }
        self.importer.lock().take();
        self.set_private_state(PrivateLoadState::Pending);
        Ok(())
    }

    fn contains(&self, handle: ObjectHandle) -> bool {
        self.inner.lock().objects.contains_key(&handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Attribute, CKA_CLASS, CKA_LABEL, CKA_PRIVATE, CKA_TOKEN, CKO_DATA};
    use crate::pool::FileObjectStore;
    use std::path::PathBuf;

    const MASTER: [u8; 32] = [0x42; 32];

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("tpmtok-pool-{}", uuid::Uuid::new_v4()))
    }

    fn open(dir: &PathBuf) -> TokenObjectPool {
        let store = FileObjectStore::open(dir).unwrap();
        TokenObjectPool::new(Arc::new(HandleGenerator::new()), Box::new(store), None).unwrap()
    }

    fn data_object(label: &str, private: bool) -> Object {
        Object::from_template(&[
            Attribute::ulong(CKA_CLASS, CKO_DATA),
            Attribute::bool(CKA_TOKEN, true),
            Attribute::bool(CKA_PRIVATE, private),
            Attribute::bytes(CKA_LABEL, label.as_bytes().to_vec()),
        ])
    }

    #[test]
    fn test_private_objects_gated_on_master_key() {
        let dir = temp_dir();
        {
            let pool = open(&dir);
            assert!(pool.set_encryption_key(&MASTER));
            for i in 0..3 {
                pool.insert(data_object(&format!("secret-{}", i), true)).unwrap();
            }
            for i in 0..2 {
                pool.insert(data_object(&format!("public-{}", i), false)).unwrap();
            }
        }

        let pool = open(&dir);
        let private = Object::from_template(&[Attribute::bool(CKA_PRIVATE, true)]);
        assert!(!pool.is_private_loaded());
        assert_eq!(pool.find(&private).len(), 0);
        assert_eq!(pool.find(&Object::new()).len(), 2);

        assert!(pool.set_encryption_key(&MASTER));
        assert!(pool.is_private_loaded());
        assert_eq!(pool.find(&private).len(), 3);
        assert_eq!(pool.find(&Object::new()).len(), 5);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_wrong_master_key_fails_load() {
        let dir = temp_dir();
        {
            let pool = open(&dir);
            pool.set_encryption_key(&MASTER);
            pool.insert(data_object("secret", true)).unwrap();
        }

        let pool = open(&dir);
        assert!(!pool.set_encryption_key(&[0u8; 32]));
        assert_eq!(pool.private_load_state(), PrivateLoadState::Failed);
        assert_eq!(pool.len(), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_failed_key_blocks_private_writes() {
        let dir = temp_dir();
        {
            let pool = open(&dir);
            assert!(pool.set_encryption_key(&MASTER));
            pool.insert(data_object("kept", true)).unwrap();
        }
        {
            let pool = open(&dir);
            assert!(!pool.set_encryption_key(&[7u8; 32]));
            assert_eq!(pool.private_load_state(), PrivateLoadState::Failed);
            assert!(pool.insert(data_object("stray", true)).is_err());
            pool.insert(data_object("public", false)).unwrap();
        }

        let pool = open(&dir);
        assert!(pool.set_encryption_key(&MASTER));
        let private = Object::from_template(&[Attribute::bool(CKA_PRIVATE, true)]);
        let found = pool.find(&private);
        assert_eq!(found.len(), 1);
        assert_eq!(pool.get_object(found[0]).unwrap().get_bytes(CKA_LABEL), Some(&b"kept"[..]));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_private_insert_needs_key() {
        let dir = temp_dir();
        let pool = open(&dir);
        assert!(pool.insert(data_object("secret", true)).is_err());
        assert!(pool.is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_flush_and_delete_persist() {
        let dir = temp_dir();
        {
            let pool = open(&dir);
            let keep = pool.insert(data_object("keep", false)).unwrap();
            let gone = pool.insert(data_object("gone", false)).unwrap();

            let mut copy = pool.get_modifiable_object(keep).unwrap();
            copy.set_bytes(CKA_LABEL, b"kept".to_vec());
            pool.flush(&copy).unwrap();
            pool.delete(gone).unwrap();
            assert!(!pool.contains(gone));
        }

        let pool = open(&dir);
        let handles = pool.find(&Object::new());
        assert_eq!(handles.len(), 1);
        assert_eq!(pool.get_object(handles[0]).unwrap().get_bytes(CKA_LABEL), Some(&b"kept"[..]));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_wait_for_private_objects() {
        let dir = temp_dir();
        let pool = Arc::new(open(&dir));
        assert_eq!(
            pool.wait_for_private_objects(Duration::from_millis(20)),
            PrivateLoadState::Pending
        );

        let loader = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                pool.set_encryption_key(&MASTER)
            })
        };
        assert_eq!(pool.wait_for_private_objects(Duration::from_secs(10)), PrivateLoadState::Ready);
        assert!(loader.join().unwrap());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_abandon_releases_waiters() {
        let dir = temp_dir();
        let pool = Arc::new(open(&dir));
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.wait_for_private_objects(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(20));
        pool.abandon_private_objects();
        assert_eq!(waiter.join().unwrap(), PrivateLoadState::Failed);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_delete_all_resets() {
        let dir = temp_dir();
        let pool = open(&dir);
        pool.set_encryption_key(&MASTER);
        pool.insert(data_object("a", true)).unwrap();
        pool.set_internal_blob(InternalBlobId::AuthDataHash, &[1, 7]).unwrap();

        pool.delete_all().unwrap();
        assert!(pool.is_empty());
        assert_eq!(pool.get_internal_blob(InternalBlobId::AuthDataHash), None);
        assert_eq!(pool.private_load_state(), PrivateLoadState::Pending);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
