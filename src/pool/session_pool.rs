//! Memory-only pool for session objects

use super::{HandleGenerator, InternalBlobId, ObjectPool};
use crate::error::{TokenError, TokenResult};
use crate::object::{Object, ObjectHandle, INVALID_HANDLE};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct SessionObjectPool {
    handles: Arc<HandleGenerator>,
    objects: Mutex<BTreeMap<ObjectHandle, Object>>,
}

impl SessionObjectPool {
    pub fn new(handles: Arc<HandleGenerator>) -> Self {
        Self {
            handles,
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectPool for SessionObjectPool {
    fn get_internal_blob(&self, _id: InternalBlobId) -> Option<Vec<u8>> {
        None
    }

    fn set_internal_blob(&self, _id: InternalBlobId, _blob: &[u8]) -> TokenResult<()> {
        Err(TokenError::GeneralError("Session pools hold no internal blobs".into()))
    }

    fn set_encryption_key(&self, _key: &[u8]) -> bool {
        true
    }

    fn is_private_loaded(&self) -> bool {
        true
    }

    fn insert(&self, mut object: Object) -> TokenResult<ObjectHandle> {
        let mut objects = self.objects.lock();
        if object.handle() != INVALID_HANDLE && objects.contains_key(&object.handle()) {
            return Err(TokenError::GeneralError("Object already tracked".into()));
        }
        let handle = self.handles.next_handle()?;
        object.set_handle(handle);
        objects.insert(handle, object);
        Ok(handle)
    }

    fn find(&self, template: &Object) -> Vec<ObjectHandle> {
        self.objects
            .lock()
            .values()
            .filter(|object| object.matches(template))
            .map(|object| object.handle())
            .collect()
    }

    fn get_object(&self, handle: ObjectHandle) -> TokenResult<Object> {
        self.objects.lock().get(&handle).cloned().ok_or(TokenError::ObjectHandleInvalid)
    }

    fn get_modifiable_object(&self, handle: ObjectHandle) -> TokenResult<Object> {
        self.get_object(handle)
    }

    fn flush(&self, object: &Object) -> TokenResult<()> {
        let mut objects = self.objects.lock();
        let slot = objects.get_mut(&object.handle()).ok_or(TokenError::ObjectHandleInvalid)?;
        *slot = object.clone();
        Ok(())
    }

    fn delete(&self, handle: ObjectHandle) -> TokenResult<()> {
        self.objects
            .lock()
            .remove(&handle)
            .map(|_| ())
            .ok_or(TokenError::ObjectHandleInvalid)
    }

    fn delete_all(&self) -> TokenResult<()> {
        self.objects.lock().clear();
        Ok(())
    }

    fn contains(&self, handle: ObjectHandle) -> bool {
        self.objects.lock().contains_key(&handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Attribute, CKA_CLASS, CKA_LABEL, CKO_DATA, CKO_SECRET_KEY};

    fn pool() -> SessionObjectPool {
        SessionObjectPool::new(Arc::new(HandleGenerator::new()))
    }

    #[test]
    fn test_insert_find_delete() {
        let pool = pool();
        let a = pool
            .insert(Object::from_template(&[Attribute::ulong(CKA_CLASS, CKO_DATA)]))
            .unwrap();
        let b = pool
            .insert(Object::from_template(&[Attribute::ulong(CKA_CLASS, CKO_SECRET_KEY)]))
            .unwrap();
        assert_ne!(a, b);

        let data = Object::from_template(&[Attribute::ulong(CKA_CLASS, CKO_DATA)]);
        assert_eq!(pool.find(&data), vec![a]);
        assert_eq!(pool.find(&Object::new()), vec![a, b]);

        pool.delete(a).unwrap();
        assert!(!pool.contains(a));
        assert_eq!(pool.delete(a), Err(TokenError::ObjectHandleInvalid));
    }

    #[test]
    fn test_flush_writes_back() {
        let pool = pool();
        let handle = pool.insert(Object::new()).unwrap();
        let mut copy = pool.get_modifiable_object(handle).unwrap();
        copy.set_bytes(CKA_LABEL, b"renamed".to_vec());
        assert!(!pool.get_object(handle).unwrap().has(CKA_LABEL));

        pool.flush(&copy).unwrap();
        assert_eq!(pool.get_object(handle).unwrap().get_bytes(CKA_LABEL), Some(&b"renamed"[..]));
    }

    #[test]
    fn test_reinsert_tracked_object_rejected() {
        let pool = pool();
        let handle = pool.insert(Object::new()).unwrap();
        let tracked = pool.get_object(handle).unwrap();
        assert!(pool.insert(tracked).is_err());
    }

    #[test]
    fn test_no_internal_blobs() {
        let pool = pool();
        assert!(pool.set_internal_blob(InternalBlobId::AuthKey, b"x").is_err());
        assert_eq!(pool.get_internal_blob(InternalBlobId::AuthKey), None);
        assert!(pool.is_private_loaded());
    }
}
