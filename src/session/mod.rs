//! Sessions — one logical connection to a loaded token
//!
//! A session owns its session objects, a find cursor, one operation context
//! per family and a cache of TPM key handles. Token objects are reached
//! through the slot's shared [`TokenObjectPool`]; every object access works
//! on a copy and writes back through the owning pool.

pub mod keygen;
pub mod operation;
pub mod tpm_keys;

pub use operation::OperationType;
pub use tpm_keys::{KeyEpoch, KeyHandleMap};

use crate::config::ServiceConfig;
use crate::error::{TokenError, TokenResult};
use crate::object::{
    Attribute, AttributeType, Object, ObjectHandle, ObjectPolicy, CKA_LABEL, CKA_PRIVATE, CKA_TOKEN, INVALID_HANDLE,
};
use crate::pool::{HandleGenerator, ObjectPool, PrivateLoadState, SessionObjectPool, TokenObjectPool};
use crate::tpm::{SlotId, TpmThread};
use operation::OperationContext;
use std::sync::Arc;
use std::time::Duration;

/// Session handle (0 is never assigned)
pub type SessionHandle = u64;

/// How long a find waits for a token's private objects to finish loading
pub const PRIVATE_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

pub const CKF_RW_SESSION: u64 = 0x0002;
pub const CKF_SERIAL_SESSION: u64 = 0x0004;

/// PKCS#11 session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    ReadOnlyPublic,
    ReadOnlyUser,
    ReadWritePublic,
    ReadWriteUser,
}

impl SessionState {
    /// The `CKS_*` value
    pub fn code(&self) -> u64 {
        match self {
            SessionState::ReadOnlyPublic => 0,
            SessionState::ReadOnlyUser => 1,
            SessionState::ReadWritePublic => 2,
            SessionState::ReadWriteUser => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub slot_id: SlotId,
    pub state: SessionState,
    pub flags: u64,
}

/// PKCS#11 user types accepted by `login`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserType {
    SecurityOfficer,
    User,
}

/// Everything a session shares with the other sessions on its slot
#[derive(Clone)]
pub struct TokenContext {
    pub slot: SlotId,
    pub config: Arc<ServiceConfig>,
    pub tpm: Arc<TpmThread>,
    pub pool: Arc<TokenObjectPool>,
    pub handles: Arc<HandleGenerator>,
    pub key_epoch: Arc<KeyEpoch>,
}

struct FindCursor {
    results: Vec<ObjectHandle>,
    offset: usize,
}

/// Which pool an object lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolKind {
    Session,
    Token,
}

pub struct Session {
    handle: SessionHandle,
    read_only: bool,
    logged_in: bool,
    token: TokenContext,
    objects: SessionObjectPool,
    key_handles: KeyHandleMap,
    find_cursor: Option<FindCursor>,
    contexts: [OperationContext; OperationType::COUNT],
}

impl Session {
    pub fn new(handle: SessionHandle, read_only: bool, token: TokenContext) -> Self {
        let key_handles = KeyHandleMap::new(token.slot, token.key_epoch.clone());
        let objects = SessionObjectPool::new(token.handles.clone());
        Self {
            handle,
            read_only,
            logged_in: false,
            token,
            objects,
            key_handles,
            find_cursor: None,
            contexts: Default::default(),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn slot(&self) -> SlotId {
        self.token.slot
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn get_session_info(&self) -> SessionInfo {
        let state = match (self.read_only, self.logged_in) {
            (true, false) => SessionState::ReadOnlyPublic,
            (true, true) => SessionState::ReadOnlyUser,
            (false, false) => SessionState::ReadWritePublic,
            (false, true) => SessionState::ReadWriteUser,
        };
        let flags = CKF_SERIAL_SESSION | if self.read_only { 0 } else { CKF_RW_SESSION };
        SessionInfo {
            slot_id: self.token.slot,
            state,
            flags,
        }
    }

    /// Authentication is done by the TPM at token load; the PIN is only
    /// accepted for compatibility. `None` is the protected authentication path.
    pub fn login(&mut self, user: UserType, pin: Option<&str>) -> TokenResult<()> {
        if user == UserType::SecurityOfficer {
            return Err(TokenError::PinIncorrect);
        }
        match pin {
            None => {}
            Some(pin) if pin == self.token.config.legacy_default_pin => {}
            Some(_) => return Err(TokenError::PinIncorrect),
        }
        if self.logged_in {
            return Err(TokenError::UserAlreadyLoggedIn);
        }
        self.logged_in = true;
        Ok(())
    }

    pub fn logout(&mut self) -> TokenResult<()> {
        if !self.logged_in {
            return Err(TokenError::UserNotLoggedIn);
        }
        self.logged_in = false;
        Ok(())
    }

    fn pool(&self, kind: PoolKind) -> &dyn ObjectPool {
        match kind {
            PoolKind::Session => &self.objects,
            PoolKind::Token => self.token.pool.as_ref(),
        }
    }

    fn pool_for(object: &Object) -> PoolKind {
        if object.is_token_object() {
            PoolKind::Token
        } else {
            PoolKind::Session
        }
    }

    fn locate(&self, handle: ObjectHandle) -> TokenResult<PoolKind> {
        if self.objects.contains(handle) {
            Ok(PoolKind::Session)
        } else if self.token.pool.contains(handle) {
            Ok(PoolKind::Token)
        } else {
            Err(TokenError::ObjectHandleInvalid)
        }
    }

    /// Copy of a visible object
    pub(crate) fn get_object(&self, handle: ObjectHandle) -> TokenResult<Object> {
        let kind = self.locate(handle)?;
        self.pool(kind).get_object(handle)
    }

    fn check_writable_pool(&self, kind: PoolKind) -> TokenResult<()> {
        if kind == PoolKind::Token && self.read_only {
            return Err(TokenError::SessionReadOnly);
        }
        Ok(())
    }

    /// Insert a finished object into the pool its `CKA_TOKEN` selects
    pub(crate) fn store_object(&self, object: Object) -> TokenResult<ObjectHandle> {
        let kind = Self::pool_for(&object);
        self.check_writable_pool(kind)?;
        self.pool(kind).insert(object)
    }

    pub fn create_object(&mut self, template: &[Attribute]) -> TokenResult<ObjectHandle> {
        let mut object = Object::from_template(template);
        ObjectPolicy::validate_new(&object)?;
        ObjectPolicy::apply_defaults(&mut object);
        self.check_writable_pool(Self::pool_for(&object))?;

        let wrapped = self.wrap_imported_private_key(&mut object)?;
        let handle = self.store_object(object)?;
        if let Some(tpm_handle) = wrapped {
            self.key_handles.insert(handle, tpm_handle);
        }
        log::debug!("Session {} created object {}", self.handle, handle);
        Ok(handle)
    }

    pub fn copy_object(&mut self, handle: ObjectHandle, template: &[Attribute]) -> TokenResult<ObjectHandle> {
        let mut copy = self.get_object(handle)?;
        for attr in template {
            // Storage attributes may differ on the copy
            if !matches!(attr.kind, CKA_TOKEN | CKA_PRIVATE) {
                ObjectPolicy::check_writable(&copy, attr)?;
            }
            copy.set_bytes(attr.kind, attr.value.clone());
        }
        copy.set_handle(INVALID_HANDLE);
        self.check_writable_pool(Self::pool_for(&copy))?;

        let wrapped = self.wrap_imported_private_key(&mut copy)?;
        let copy_handle = self.store_object(copy)?;
        if let Some(tpm_handle) = wrapped {
            self.key_handles.insert(copy_handle, tpm_handle);
        }
        Ok(copy_handle)
    }

    pub fn destroy_object(&mut self, handle: ObjectHandle) -> TokenResult<()> {
        let kind = self.locate(handle)?;
        self.check_writable_pool(kind)?;
        self.pool(kind).delete(handle)?;
        self.key_handles.forget(handle);
        Ok(())
    }

    pub fn get_object_size(&self, handle: ObjectHandle) -> TokenResult<usize> {
        Ok(self.get_object(handle)?.size())
    }

    /// Values of the requested attributes; the first unreadable one fails
    /// the whole call
    pub fn get_attribute_value(&self, handle: ObjectHandle, kinds: &[AttributeType]) -> TokenResult<Vec<Attribute>> {
        let object = self.get_object(handle)?;
        kinds
            .iter()
            .map(|kind| {
                ObjectPolicy::check_readable(&object, *kind)?;
                let value = object.get_bytes(*kind).unwrap_or_default().to_vec();
                Ok(Attribute::bytes(*kind, value))
            })
            .collect()
    }

    pub fn set_attribute_value(&mut self, handle: ObjectHandle, template: &[Attribute]) -> TokenResult<()> {
        let kind = self.locate(handle)?;
        self.check_writable_pool(kind)?;
        let pool = self.pool(kind);
        let mut object = pool.get_modifiable_object(handle)?;
        for attr in template {
            ObjectPolicy::check_writable(&object, attr)?;
        }
        for attr in template {
            object.set_bytes(attr.kind, attr.value.clone());
        }
        pool.flush(&object)
    }

    pub fn find_objects_init(&mut self, template: &[Attribute]) -> TokenResult<()> {
        if self.find_cursor.is_some() {
            return Err(TokenError::OperationActive);
        }
        let template = Object::from_template(template);
        if template.attribute_types().any(ObjectPolicy::is_hidden) {
            return Err(TokenError::AttributeTypeInvalid);
        }

        let may_be_private = template.get_bool(CKA_PRIVATE, true);
        if may_be_private && self.token.pool.private_load_state() == PrivateLoadState::Pending {
            log::debug!("Session {} waiting for private objects", self.handle);
            let state = self.token.pool.wait_for_private_objects(PRIVATE_LOAD_TIMEOUT);
            if state != PrivateLoadState::Ready {
                log::warn!("Private objects unavailable on slot {} ({:?})", self.token.slot, state);
            }
        }

        let mut results = self.objects.find(&template);
        results.extend(self.token.pool.find(&template));
        self.find_cursor = Some(FindCursor { results, offset: 0 });
        Ok(())
    }

    pub fn find_objects(&mut self, max_count: usize) -> TokenResult<Vec<ObjectHandle>> {
        let cursor = self.find_cursor.as_mut().ok_or(TokenError::OperationNotInitialized)?;
        let end = cursor.results.len().min(cursor.offset.saturating_add(max_count));
        let batch = cursor.results[cursor.offset..end].to_vec();
        cursor.offset = end;
        Ok(batch)
    }

    pub fn find_objects_final(&mut self) -> TokenResult<()> {
        self.find_cursor
            .take()
            .map(|_| ())
            .ok_or(TokenError::OperationNotInitialized)
    }

    /// Random bytes from the TPM when present, the OS otherwise
    pub fn generate_random(&self, num_bytes: usize) -> TokenResult<Vec<u8>> {
        if self.token.tpm.is_tpm_available() {
            self.token.tpm.call(move |tpm| tpm.generate_random(num_bytes))
        } else {
            Ok(crate::crypto::random_bytes(num_bytes))
        }
    }

    pub fn seed_random(&self, seed: &[u8]) -> TokenResult<()> {
        if !self.token.tpm.is_tpm_available() {
            // OS RNG reseeds itself
            return Ok(());
        }
        let seed = seed.to_vec();
        self.token.tpm.call(move |tpm| tpm.stir_random(&seed))
    }

    /// Label of an object, for logs and the CLI
    pub fn object_label(&self, handle: ObjectHandle) -> TokenResult<String> {
        let object = self.get_object(handle)?;
        Ok(String::from_utf8_lossy(object.get_bytes(CKA_LABEL).unwrap_or_default()).into_owned())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::object::*;
    use crate::pool::FileObjectStore;
    use crate::tpm::{SimulatedTpm, StubTpm, TpmUtility, TpmVersion};
    use std::path::PathBuf;

    pub(crate) struct Fixture {
        pub dir: PathBuf,
        pub token: TokenContext,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    impl Fixture {
        pub fn session(&self, read_only: bool) -> Session {
            Session::new(1, read_only, self.token.clone())
        }
    }

    fn fixture_with(tpm: Box<dyn TpmUtility>) -> Fixture {
        let dir = std::env::temp_dir().join(format!("tpmtok-session-{}", uuid::Uuid::new_v4()));
        let handles = Arc::new(HandleGenerator::new());
        let store = FileObjectStore::open(&dir).unwrap();
        let pool = Arc::new(TokenObjectPool::new(handles.clone(), Box::new(store), None).unwrap());
        assert!(pool.set_encryption_key(&[0x11; 32]));
        Fixture {
            dir,
            token: TokenContext {
                slot: 0,
                config: Arc::new(ServiceConfig::default()),
                tpm: Arc::new(TpmThread::start(tpm).unwrap()),
                pool,
                handles,
                key_epoch: Arc::new(KeyEpoch::new()),
            },
        }
    }

    /// Token with a simulated TPM 2.0 and its master key installed
    pub(crate) fn fixture() -> Fixture {
        let mut tpm = SimulatedTpm::new(TpmVersion::V2_0, None);
        tpm.init().unwrap();
        fixture_with(Box::new(tpm))
    }

    pub(crate) fn software_fixture() -> Fixture {
        fixture_with(Box::new(StubTpm))
    }

    fn data_template(token: bool, label: &str) -> Vec<Attribute> {
        vec![
            Attribute::ulong(CKA_CLASS, CKO_DATA),
            Attribute::bool(CKA_TOKEN, token),
            Attribute::bytes(CKA_LABEL, label.as_bytes().to_vec()),
            Attribute::bytes(CKA_VALUE, b"payload".to_vec()),
        ]
    }

    #[test]
    fn test_login_rules() {
        let fx = software_fixture();
        let mut session = fx.session(false);
        assert_eq!(session.logout(), Err(TokenError::UserNotLoggedIn));
        assert_eq!(session.login(UserType::SecurityOfficer, None), Err(TokenError::PinIncorrect));
        assert_eq!(session.login(UserType::User, Some("000000")), Err(TokenError::PinIncorrect));
        session.login(UserType::User, Some("111111")).unwrap();
        assert_eq!(session.get_session_info().state, SessionState::ReadWriteUser);
        assert_eq!(session.login(UserType::User, None), Err(TokenError::UserAlreadyLoggedIn));
        session.logout().unwrap();
        session.login(UserType::User, None).unwrap();
    }

    #[test]
    fn test_session_info() {
        let fx = software_fixture();
        let session = fx.session(true);
        let info = session.get_session_info();
        assert_eq!(info.state, SessionState::ReadOnlyPublic);
        assert_eq!(info.flags & CKF_RW_SESSION, 0);
        assert_ne!(info.flags & CKF_SERIAL_SESSION, 0);
    }

    #[test]
    fn test_object_lifecycle() {
        let fx = software_fixture();
        let mut session = fx.session(false);
        let token_obj = session.create_object(&data_template(true, "persistent")).unwrap();
        let session_obj = session.create_object(&data_template(false, "volatile")).unwrap();
        assert_ne!(token_obj, session_obj);
        assert!(fx.token.pool.contains(token_obj));
        assert!(!fx.token.pool.contains(session_obj));

        assert_eq!(session.object_label(session_obj).unwrap(), "volatile");
        assert!(session.get_object_size(token_obj).unwrap() > 0);

        session
            .set_attribute_value(token_obj, &[Attribute::bytes(CKA_LABEL, b"renamed".to_vec())])
            .unwrap();
        let attrs = session.get_attribute_value(token_obj, &[CKA_LABEL]).unwrap();
        assert_eq!(attrs[0].value, b"renamed");
        assert_eq!(
            session.set_attribute_value(token_obj, &[Attribute::ulong(CKA_CLASS, CKO_CERTIFICATE)]),
            Err(TokenError::AttributeReadOnly)
        );

        let copy = session
            .copy_object(token_obj, &[Attribute::bool(CKA_TOKEN, false)])
            .unwrap();
        assert!(!fx.token.pool.contains(copy));
        assert_eq!(session.object_label(copy).unwrap(), "renamed");

        session.destroy_object(token_obj).unwrap();
        assert_eq!(session.get_object_size(token_obj), Err(TokenError::ObjectHandleInvalid));
    }

    #[test]
    fn test_read_only_session_cannot_touch_token_objects() {
        let fx = software_fixture();
        let mut writer = fx.session(false);
        let handle = writer.create_object(&data_template(true, "x")).unwrap();

        let mut reader = fx.session(true);
        assert_eq!(reader.create_object(&data_template(true, "y")), Err(TokenError::SessionReadOnly));
        assert_eq!(reader.destroy_object(handle), Err(TokenError::SessionReadOnly));
        assert!(reader.create_object(&data_template(false, "z")).is_ok());
    }

    #[test]
    fn test_hidden_attributes_rejected_on_create() {
        let fx = software_fixture();
        let mut session = fx.session(false);
        let mut template = data_template(false, "x");
        template.push(Attribute::bytes(CKA_TPM_KEY_BLOB, vec![1]));
        assert_eq!(session.create_object(&template), Err(TokenError::AttributeTypeInvalid));
    }

    #[test]
    fn test_find_cursor() {
        let fx = software_fixture();
        let mut session = fx.session(false);
        for i in 0..5 {
            session.create_object(&data_template(i % 2 == 0, &format!("obj{}", i))).unwrap();
        }

        assert_eq!(session.find_objects(1), Err(TokenError::OperationNotInitialized));
        session
            .find_objects_init(&[Attribute::ulong(CKA_CLASS, CKO_DATA)])
            .unwrap();
        assert_eq!(session.find_objects_init(&[]), Err(TokenError::OperationActive));
        assert_eq!(session.find_objects(3).unwrap().len(), 3);
        assert_eq!(session.find_objects(3).unwrap().len(), 2);
        assert!(session.find_objects(3).unwrap().is_empty());
        session.find_objects_final().unwrap();
        assert_eq!(session.find_objects_final(), Err(TokenError::OperationNotInitialized));
    }

    #[test]
    fn test_sessions_do_not_see_each_others_session_objects() {
        let fx = software_fixture();
        let mut a = fx.session(false);
        let b = fx.session(false);
        let handle = a.create_object(&data_template(false, "mine")).unwrap();
        assert_eq!(b.get_object_size(handle), Err(TokenError::ObjectHandleInvalid));
    }

    #[test]
    fn test_random() {
        let fx = fixture();
        let session = fx.session(true);
        assert_eq!(session.generate_random(33).unwrap().len(), 33);
        session.seed_random(b"entropy").unwrap();

        let soft = software_fixture();
        let session = soft.session(true);
        assert_eq!(session.generate_random(8).unwrap().len(), 8);
        session.seed_random(b"entropy").unwrap();
    }
}
