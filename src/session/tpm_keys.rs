//! Per-session cache of TPM key handles and the legacy root capability

use crate::error::{TokenError, TokenResult};
use crate::object::{Object, ObjectHandle, CKA_LEGACY_KEY, CKA_TPM_AUTH_DATA, CKA_TPM_KEY_BLOB};
use crate::pool::{InternalBlobId, ObjectPool};
use crate::tpm::{SlotId, TpmKeyHandle, TpmThread};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counter bumped whenever the slot's TPM keys are unloaded; handles cached
/// under an older value are stale
#[derive(Debug, Default)]
pub struct KeyEpoch(AtomicU64);

impl KeyEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Root key of an imported legacy hierarchy, loaded at most once per epoch
#[derive(Debug, Default)]
struct LegacyRoot {
    loaded: bool,
    handle: TpmKeyHandle,
}

/// Object handle → loaded TPM key handle, private to one session
#[derive(Debug)]
pub struct KeyHandleMap {
    slot: SlotId,
    epoch: Arc<KeyEpoch>,
    seen_epoch: u64,
    handles: HashMap<ObjectHandle, TpmKeyHandle>,
    legacy_root: LegacyRoot,
}

impl KeyHandleMap {
    pub fn new(slot: SlotId, epoch: Arc<KeyEpoch>) -> Self {
        let seen_epoch = epoch.current();
        Self {
            slot,
            epoch,
            seen_epoch,
            handles: HashMap::new(),
            legacy_root: LegacyRoot::default(),
        }
    }

    fn refresh(&mut self) {
        let current = self.epoch.current();
        if current != self.seen_epoch {
            log::debug!("Slot {} keys were unloaded, dropping {} cached handles", self.slot, self.handles.len());
            self.handles.clear();
            self.legacy_root = LegacyRoot::default();
            self.seen_epoch = current;
        }
    }

    pub fn get(&mut self, object: ObjectHandle) -> Option<TpmKeyHandle> {
        self.refresh();
        self.handles.get(&object).copied()
    }

    pub fn insert(&mut self, object: ObjectHandle, handle: TpmKeyHandle) {
        self.refresh();
        self.handles.insert(object, handle);
    }

    pub fn forget(&mut self, object: ObjectHandle) {
        self.handles.remove(&object);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// TPM handle for a TPM-backed key object, loading it on first use
    pub fn load(&mut self, tpm: &TpmThread, pool: &dyn ObjectPool, object: &Object) -> TokenResult<TpmKeyHandle> {
        if let Some(handle) = self.get(object.handle()) {
            return Ok(handle);
        }

        let blob = object
            .get_bytes(CKA_TPM_KEY_BLOB)
            .ok_or(TokenError::KeyHandleInvalid)?
            .to_vec();
        let auth = object.get_bytes(CKA_TPM_AUTH_DATA).unwrap_or_default().to_vec();
        let slot = self.slot;

        let handle = if object.get_bool(CKA_LEGACY_KEY, false) {
            let parent = self.legacy_root(tpm, pool)?;
            tpm.call(move |t| t.load_key_with_parent(slot, &blob, &auth, parent))?
        } else {
            tpm.call(move |t| t.load_key(slot, &blob, &auth))?
        };

        log::debug!("Loaded key object {} as TPM handle {:#x}", object.handle(), handle);
        self.handles.insert(object.handle(), handle);
        Ok(handle)
    }

    fn legacy_root(&mut self, tpm: &TpmThread, pool: &dyn ObjectPool) -> TokenResult<TpmKeyHandle> {
        if self.legacy_root.loaded {
            return Ok(self.legacy_root.handle);
        }
        let blob = pool
            .get_internal_blob(InternalBlobId::LegacyRootKey)
            .ok_or_else(|| TokenError::tpm("legacy root key missing"))?;
        let slot = self.slot;
        let handle = tpm.call(move |t| t.load_key(slot, &blob, &[]))?;
        self.legacy_root = LegacyRoot { loaded: true, handle };
        log::info!("Loaded legacy root key for slot {}", slot);
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Attribute, CKA_CLASS, CKO_PRIVATE_KEY};
    use crate::pool::{HandleGenerator, SessionObjectPool};
    use crate::tpm::{SimulatedTpm, TpmUtility, TpmVersion};

    fn tpm() -> TpmThread {
        let mut tpm = SimulatedTpm::new(TpmVersion::V2_0, None);
        tpm.init().unwrap();
        TpmThread::start(Box::new(tpm)).unwrap()
    }

    fn key_object(blob: Vec<u8>, auth: &[u8], handle: ObjectHandle) -> Object {
        let mut object = Object::from_template(&[
            Attribute::ulong(CKA_CLASS, CKO_PRIVATE_KEY),
            Attribute::bytes(CKA_TPM_KEY_BLOB, blob),
            Attribute::bytes(CKA_TPM_AUTH_DATA, auth.to_vec()),
        ]);
        object.set_handle(handle);
        object
    }

    #[test]
    fn test_load_once_then_cached() {
        let tpm = tpm();
        let pool = SessionObjectPool::new(Arc::new(HandleGenerator::new()));
        let key = tpm.call(|t| t.generate_rsa_key(1, 512, &[], b"auth")).unwrap();
        let object = key_object(key.blob, b"auth", 7);

        let epoch = Arc::new(KeyEpoch::new());
        let mut map = KeyHandleMap::new(1, epoch.clone());
        let first = map.load(&tpm, &pool, &object).unwrap();
        let second = map.load(&tpm, &pool, &object).unwrap();
        assert_eq!(first, second);
        assert_eq!(map.len(), 1);

        epoch.bump();
        assert_eq!(map.get(7), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_wrong_auth_fails() {
        let tpm = tpm();
        let pool = SessionObjectPool::new(Arc::new(HandleGenerator::new()));
        let key = tpm.call(|t| t.generate_rsa_key(1, 512, &[], b"auth")).unwrap();
        let object = key_object(key.blob, b"other", 3);

        let mut map = KeyHandleMap::new(1, Arc::new(KeyEpoch::new()));
        assert!(matches!(map.load(&tpm, &pool, &object), Err(TokenError::FunctionFailed(_))));
    }

    #[test]
    fn test_object_without_blob() {
        let tpm = tpm();
        let pool = SessionObjectPool::new(Arc::new(HandleGenerator::new()));
        let mut map = KeyHandleMap::new(1, Arc::new(KeyEpoch::new()));
        assert_eq!(map.load(&tpm, &pool, &Object::new()), Err(TokenError::KeyHandleInvalid));
    }
}
