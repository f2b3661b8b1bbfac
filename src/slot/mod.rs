//! Slot/Isolate Manager — authorization boundary and token lifecycle
//!
//! Owns the slot table, the isolate → accessible-slot mapping and the
//! session registry, all behind one registry lock that is held for
//! bookkeeping only. Pool I/O, TPM work and thread joins happen outside it.
//!
//! Loading a token installs its pool right away (public objects are usable
//! immediately) and derives or recovers the master key on a background
//! thread; private objects appear once that finishes.

pub mod info;
pub mod isolate;
pub mod token_init;

pub use info::{SlotInfo, TokenInfo};
pub use isolate::{short_id, IsolateCredential, DEFAULT_ISOLATE, ISOLATE_CREDENTIAL_LEN};

use crate::config::ServiceConfig;
use crate::error::{TokenError, TokenResult};
use crate::mechanism::{mechanism_info, mechanism_table, MechanismInfo, MechanismType};
use crate::pool::{
    FileObjectStore, HandleGenerator, InternalBlobId, LegacyTokenImporter, ObjectImporter, ObjectPool,
    PrivateLoadState, TokenObjectPool,
};
use crate::session::{KeyEpoch, Session, SessionHandle, TokenContext};
use crate::tpm::{SlotId, TpmBackend, TpmThread, TpmUtility};
use chrono::{DateTime, Utc};
use isolate::IsolateTable;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use token_init::{auth_data_hash, auth_data_hash_matches, auth_protected_blob, TokenInit};
use zeroize::Zeroizing;

/// Subdirectory of a token path holding an older token to import
pub const LEGACY_SUBDIR: &str = "legacy";

/// Slot id passed to the TPM for tokens that are not loaded anywhere
const DETACHED_SLOT: SlotId = SlotId::MAX;

/// A session as handed out by the registry
pub type SharedSession = Arc<Mutex<Session>>;

struct LoadedToken {
    path: PathBuf,
    label: String,
    context: TokenContext,
    loaded_at: DateTime<Utc>,
    init: Option<JoinHandle<()>>,
}

enum TokenSlot {
    Empty,
    Loaded(Box<LoadedToken>),
    /// Teardown of the token at this path in progress; not reusable yet
    Unloading(PathBuf),
}

struct Slot {
    info: SlotInfo,
    token: TokenSlot,
}

impl Slot {
    fn new(id: SlotId, hardware: bool) -> Self {
        Self {
            info: SlotInfo::new(id, hardware),
            token: TokenSlot::Empty,
        }
    }
}

struct SessionEntry {
    slot: SlotId,
    read_only: bool,
    session: SharedSession,
}

struct Registry {
    slots: Vec<Slot>,
    isolates: IsolateTable,
    sessions: HashMap<SessionHandle, SessionEntry>,
    last_session: SessionHandle,
}

impl Registry {
    fn slot(&self, slot: SlotId) -> TokenResult<&Slot> {
        usize::try_from(slot)
            .ok()
            .and_then(|index| self.slots.get(index))
            .ok_or(TokenError::SlotIdInvalid)
    }

    fn loaded(&self, slot: SlotId) -> TokenResult<&LoadedToken> {
        match &self.slot(slot)?.token {
            TokenSlot::Loaded(token) => Ok(&**token),
            _ => Err(TokenError::TokenNotPresent),
        }
    }

    fn find_path(&self, path: &Path) -> Option<SlotId> {
        self.slots.iter().position(|slot| match &slot.token {
            TokenSlot::Loaded(token) => token.path == path,
            _ => false,
        })
        .map(|index| index as SlotId)
    }

    fn is_unloading(&self, path: &Path) -> bool {
        self.slots
            .iter()
            .any(|slot| matches!(&slot.token, TokenSlot::Unloading(unloading) if unloading == path))
    }

    /// An empty slot no other isolate can see, created if needed
    fn free_slot(&mut self, isolate: &IsolateCredential, hardware: bool) -> SlotId {
        let reusable = self.slots.iter().enumerate().position(|(index, slot)| {
            let id = index as SlotId;
            matches!(slot.token, TokenSlot::Empty) && !self.isolates.is_slot_referenced_by_other(id, isolate)
        });
        match reusable {
            Some(index) => index as SlotId,
            None => {
                let id = self.slots.len() as SlotId;
                self.slots.push(Slot::new(id, hardware));
                id
            }
        }
    }

    fn next_session_handle(&mut self) -> TokenResult<SessionHandle> {
        let next = self.last_session.checked_add(1).ok_or(TokenError::SessionCount)?;
        self.last_session = next;
        Ok(next)
    }

    fn session_entry(&self, isolate: &IsolateCredential, handle: SessionHandle) -> TokenResult<&SessionEntry> {
        self.sessions
            .get(&handle)
            .filter(|entry| self.isolates.can_access(isolate, entry.slot))
            .ok_or(TokenError::SessionHandleInvalid)
    }

    fn remove_sessions(&mut self, slot: SlotId) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| entry.slot != slot);
        before - self.sessions.len()
    }

    /// `(all, read-write)` sessions open on `slot`
    fn session_counts(&self, slot: SlotId) -> (usize, usize) {
        self.sessions
            .values()
            .filter(|entry| entry.slot == slot)
            .fold((0, 0), |(all, rw), entry| (all + 1, rw + usize::from(!entry.read_only)))
    }
}

pub struct SlotManager {
    config: Arc<ServiceConfig>,
    tpm: Arc<TpmThread>,
    handles: Arc<HandleGenerator>,
    hardware: bool,
    initial_slots: usize,
    registry: Mutex<Registry>,
    /// Signalled whenever an unloading slot becomes empty
    slot_freed: Condvar,
}

impl SlotManager {
    /// Bring up the configured TPM backend and the initial slots
    pub fn new(config: ServiceConfig) -> TokenResult<Self> {
        config
            .validate()
            .map_err(|e| TokenError::ArgumentsBad(e.to_string()))?;
        let tpm = TpmBackend::select(&config)?;
        Self::with_tpm(config, tpm)
    }

    pub fn with_tpm(config: ServiceConfig, tpm: Box<dyn TpmUtility>) -> TokenResult<Self> {
        let tpm = Arc::new(TpmThread::start(tpm)?);
        let hardware = config.tpm_backend.is_hardware() && tpm.is_tpm_available();
        let initial_slots = config.initial_slot_count;

        let mut isolates = IsolateTable::new();
        let slots = (0..initial_slots as SlotId)
            .map(|id| {
                isolates.grant(&DEFAULT_ISOLATE, id);
                Slot::new(id, hardware)
            })
            .collect();

        log::info!(
            "Slot manager ready: {} slots, TPM available={}",
            initial_slots,
            tpm.is_tpm_available()
        );
        Ok(Self {
            config: Arc::new(config),
            tpm,
            handles: Arc::new(HandleGenerator::new()),
            hardware,
            initial_slots,
            registry: Mutex::new(Registry {
                slots,
                isolates,
                sessions: HashMap::new(),
                last_session: 0,
            }),
            slot_freed: Condvar::new(),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn is_tpm_available(&self) -> bool {
        self.tpm.is_tpm_available()
    }

    // ----- isolates -----

    /// Reference `credential` if known, otherwise mint a fresh isolate
    pub fn open_isolate(&self, credential: &IsolateCredential) -> TokenResult<(IsolateCredential, bool)> {
        let (credential, created) = self.registry.lock().isolates.open(credential)?;
        if created {
            log::info!("Opened new isolate {}", short_id(&credential));
        }
        Ok((credential, created))
    }

    /// Drop a reference; the last one unloads tokens nobody else can reach
    pub fn close_isolate(&self, credential: &IsolateCredential) {
        let orphaned: Vec<SlotId> = {
            let mut registry = self.registry.lock();
            let Some(slots) = registry.isolates.close(credential) else {
                return;
            };
            log::info!("Closed isolate {}", short_id(credential));
            slots
                .into_iter()
                .filter(|slot| !registry.isolates.is_slot_referenced(*slot))
                .collect()
        };
        for slot in orphaned {
            match self.unload_slot(slot) {
                Ok(()) | Err(TokenError::TokenNotPresent) => {}
                Err(e) => log::error!("Failed to unload slot {}: {}", slot, e),
            }
        }
    }

    // ----- tokens -----

    /// Load the token stored at `path` and return its slot. Loading a path
    /// that is already loaded returns the existing slot.
    pub fn load_token(
        &self,
        isolate: &IsolateCredential,
        path: &Path,
        auth_data: &[u8],
        label: &str,
    ) -> TokenResult<SlotId> {
        std::fs::create_dir_all(path)?;
        let path = std::fs::canonicalize(path)?;
        let (pool, mut registry) = loop {
            if let Some(slot) = self.attach_loaded(isolate, &path)? {
                return Ok(slot);
            }
            let pool = self.open_pool(&path)?;

            let mut registry = self.registry.lock();
            // A teardown that started meanwhile may still write the store
            if self.wait_for_unload(&mut registry, &path) {
                continue;
            }
            if let Some(slot) = registry.find_path(&path) {
                registry.isolates.grant(isolate, slot);
                return Ok(slot);
            }
            break (pool, registry);
        };
        let slot = registry.free_slot(isolate, self.hardware);
        let context = TokenContext {
            slot,
            config: self.config.clone(),
            tpm: self.tpm.clone(),
            pool: pool.clone(),
            handles: self.handles.clone(),
            key_epoch: Arc::new(KeyEpoch::new()),
        };
        let init = TokenInit {
            slot,
            auth_data: Zeroizing::new(auth_data.to_vec()),
            config: self.config.clone(),
            tpm: self.tpm.clone(),
            pool,
        }
        .spawn()?;

        let entry = &mut registry.slots[slot as usize];
        entry.info.set_token_present(true);
        entry.token = TokenSlot::Loaded(Box::new(LoadedToken {
            path: path.clone(),
            label: label.to_string(),
            context,
            loaded_at: Utc::now(),
            init: Some(init),
        }));
        registry.isolates.grant(isolate, slot);
        log::info!(
            "Loaded token {} into slot {} for isolate {}",
            path.display(),
            slot,
            short_id(isolate)
        );
        Ok(slot)
    }

    fn attach_loaded(&self, isolate: &IsolateCredential, path: &Path) -> TokenResult<Option<SlotId>> {
        let mut registry = self.registry.lock();
        if !registry.isolates.contains(isolate) {
            return Err(TokenError::ArgumentsBad("unknown isolate".into()));
        }
        self.wait_for_unload(&mut registry, path);
        let slot = registry.find_path(path);
        if let Some(slot) = slot {
            registry.isolates.grant(isolate, slot);
            log::debug!("Token {} already loaded in slot {}", path.display(), slot);
        }
        Ok(slot)
    }

    /// Block while a slot holding `path` is being torn down. Returns whether
    /// it had to wait.
    fn wait_for_unload(&self, registry: &mut MutexGuard<'_, Registry>, path: &Path) -> bool {
        let mut waited = false;
        while registry.is_unloading(path) {
            log::debug!("Waiting for {} to finish unloading", path.display());
            self.slot_freed.wait(registry);
            waited = true;
        }
        waited
    }

    fn open_pool(&self, path: &Path) -> TokenResult<Arc<TokenObjectPool>> {
        let store = FileObjectStore::open(path)?;
        let legacy = path.join(LEGACY_SUBDIR);
        let importer: Option<Box<dyn ObjectImporter>> = if LegacyTokenImporter::is_legacy_dir(&legacy) {
            log::info!("Found legacy token at {}", legacy.display());
            Some(Box::new(LegacyTokenImporter::new(&legacy)))
        } else {
            None
        };
        Ok(Arc::new(TokenObjectPool::new(
            self.handles.clone(),
            Box::new(store),
            importer,
        )?))
    }

    /// Unload the token at `path`: its sessions close and its TPM keys are
    /// unloaded once any in-flight initialization has finished
    pub fn unload_token(&self, isolate: &IsolateCredential, path: &Path) -> TokenResult<()> {
        let path = std::fs::canonicalize(path).map_err(|_| TokenError::TokenNotPresent)?;
        let slot = {
            let registry = self.registry.lock();
            let slot = registry.find_path(&path).ok_or(TokenError::TokenNotPresent)?;
            registry.isolates.check_access(isolate, slot)?;
            slot
        };
        self.unload_slot(slot)
    }

    fn unload_slot(&self, slot: SlotId) -> TokenResult<()> {
        let (mut token, closed) = {
            let mut registry = self.registry.lock();
            let index = usize::try_from(slot).map_err(|_| TokenError::SlotIdInvalid)?;
            let entry = registry.slots.get_mut(index).ok_or(TokenError::SlotIdInvalid)?;
            let token = match std::mem::replace(&mut entry.token, TokenSlot::Empty) {
                TokenSlot::Loaded(token) => {
                    entry.token = TokenSlot::Unloading(token.path.clone());
                    token
                }
                other => {
                    entry.token = other;
                    return Err(TokenError::TokenNotPresent);
                }
            };
            entry.info.set_token_present(false);
            let closed = registry.remove_sessions(slot);
            registry.isolates.revoke_all(slot);
            if index < self.initial_slots {
                registry.isolates.grant(&DEFAULT_ISOLATE, slot);
            }
            (token, closed)
        };

        if let Some(init) = token.init.take() {
            if init.join().is_err() {
                log::error!("Token initialization thread for slot {} panicked", slot);
            }
        }
        token.context.key_epoch.bump();
        let posted = self.tpm.post(move |tpm| tpm.unload_keys_for_slot(slot));

        if let Some(entry) = self.registry.lock().slots.get_mut(slot as usize) {
            entry.token = TokenSlot::Empty;
        }
        self.slot_freed.notify_all();
        log::info!(
            "Unloaded token {} from slot {} ({} sessions closed)",
            token.path.display(),
            slot,
            closed
        );
        posted
    }

    /// Re-protect the token's key hierarchy under new authorization data.
    /// Works whether or not the token is loaded.
    pub fn change_token_auth_data(&self, path: &Path, old_auth_data: &[u8], new_auth_data: &[u8]) -> TokenResult<()> {
        let path = std::fs::canonicalize(path).map_err(|_| TokenError::TokenNotPresent)?;
        let loaded = {
            let mut registry = self.registry.lock();
            self.wait_for_unload(&mut registry, &path);
            registry
                .find_path(&path)
                .and_then(|slot| registry.loaded(slot).ok())
                .map(|token| (token.context.slot, token.context.pool.clone()))
        };
        let (slot, pool) = match loaded {
            Some(loaded) => loaded,
            None => (DETACHED_SLOT, self.open_pool(&path)?),
        };

        let stored_hash = pool
            .get_internal_blob(InternalBlobId::AuthDataHash)
            .ok_or(TokenError::TokenNotPresent)?;
        if !auth_data_hash_matches(Some(stored_hash.as_slice()), old_auth_data) {
            return Err(TokenError::PinIncorrect);
        }

        let blob_id = auth_protected_blob(self.tpm.version());
        let blob = pool.get_internal_blob(blob_id).ok_or(TokenError::TokenNotPresent)?;
        let old = Zeroizing::new(old_auth_data.to_vec());
        let new = Zeroizing::new(new_auth_data.to_vec());
        let rewrapped = self
            .tpm
            .call(move |tpm| tpm.change_auth_data(slot, &old, &new, &blob))?;

        pool.set_internal_blob(blob_id, &rewrapped)?;
        pool.set_internal_blob(InternalBlobId::AuthDataHash, &auth_data_hash(new_auth_data))?;
        log::info!("Changed authorization data for token {}", path.display());
        Ok(())
    }

    /// Block until the slot's private objects are loaded (or failed to load)
    pub fn wait_for_token(
        &self,
        isolate: &IsolateCredential,
        slot: SlotId,
        timeout: Duration,
    ) -> TokenResult<PrivateLoadState> {
        let pool = {
            let registry = self.registry.lock();
            registry.isolates.check_access(isolate, slot)?;
            registry.loaded(slot)?.context.pool.clone()
        };
        Ok(pool.wait_for_private_objects(timeout))
    }

    pub fn is_token_loaded(&self, path: &Path) -> bool {
        std::fs::canonicalize(path)
            .map(|path| self.registry.lock().find_path(&path).is_some())
            .unwrap_or(false)
    }

    // ----- sessions -----

    pub fn open_session(&self, isolate: &IsolateCredential, slot: SlotId, read_only: bool) -> TokenResult<SessionHandle> {
        let mut registry = self.registry.lock();
        registry.isolates.check_access(isolate, slot)?;
        let context = registry.loaded(slot)?.context.clone();
        let handle = registry.next_session_handle()?;
        let session = Session::new(handle, read_only, context);
        registry.sessions.insert(
            handle,
            SessionEntry {
                slot,
                read_only,
                session: Arc::new(Mutex::new(session)),
            },
        );
        log::debug!("Opened session {} on slot {} (read_only={})", handle, slot, read_only);
        Ok(handle)
    }

    pub fn close_session(&self, isolate: &IsolateCredential, handle: SessionHandle) -> TokenResult<()> {
        let mut registry = self.registry.lock();
        registry.session_entry(isolate, handle)?;
        registry.sessions.remove(&handle);
        log::debug!("Closed session {}", handle);
        Ok(())
    }

    pub fn close_all_sessions(&self, isolate: &IsolateCredential, slot: SlotId) -> TokenResult<()> {
        let mut registry = self.registry.lock();
        registry.isolates.check_access(isolate, slot)?;
        let closed = registry.remove_sessions(slot);
        log::debug!("Closed {} sessions on slot {}", closed, slot);
        Ok(())
    }

    pub fn get_session(&self, isolate: &IsolateCredential, handle: SessionHandle) -> TokenResult<SharedSession> {
        let registry = self.registry.lock();
        Ok(registry.session_entry(isolate, handle)?.session.clone())
    }

    // ----- slot and token queries -----

    pub fn get_slot_list(&self, isolate: &IsolateCredential, token_present: bool) -> Vec<SlotId> {
        let registry = self.registry.lock();
        registry
            .isolates
            .slots(isolate)
            .into_iter()
            .filter(|slot| {
                !token_present || registry.slot(*slot).is_ok_and(|s| s.info.is_token_present())
            })
            .collect()
    }

    pub fn get_slot_info(&self, isolate: &IsolateCredential, slot: SlotId) -> TokenResult<SlotInfo> {
        let registry = self.registry.lock();
        registry.isolates.check_access(isolate, slot)?;
        Ok(registry.slot(slot)?.info.clone())
    }

    pub fn get_token_info(&self, isolate: &IsolateCredential, slot: SlotId) -> TokenResult<TokenInfo> {
        let registry = self.registry.lock();
        registry.isolates.check_access(isolate, slot)?;
        let token = registry.loaded(slot)?;
        Ok(TokenInfo::new(
            &token.label,
            &token.path,
            token.context.pool.private_load_state(),
            registry.session_counts(slot),
            token.loaded_at,
        ))
    }

    pub fn get_mechanism_list(&self, isolate: &IsolateCredential, slot: SlotId) -> TokenResult<Vec<MechanismType>> {
        self.check_token(isolate, slot)?;
        Ok(mechanism_table(&self.config, self.tpm.is_tpm_available())
            .into_iter()
            .map(|(mechanism, _)| mechanism)
            .collect())
    }

    pub fn get_mechanism_info(
        &self,
        isolate: &IsolateCredential,
        slot: SlotId,
        mechanism: MechanismType,
    ) -> TokenResult<MechanismInfo> {
        self.check_token(isolate, slot)?;
        mechanism_info(&self.config, self.tpm.is_tpm_available(), mechanism).ok_or(TokenError::MechanismInvalid)
    }

    pub fn is_token_accessible(&self, isolate: &IsolateCredential, slot: SlotId) -> bool {
        self.check_token(isolate, slot).is_ok()
    }

    pub fn get_token_path(&self, isolate: &IsolateCredential, slot: SlotId) -> TokenResult<PathBuf> {
        let registry = self.registry.lock();
        registry.isolates.check_access(isolate, slot)?;
        Ok(registry.loaded(slot)?.path.clone())
    }

    fn check_token(&self, isolate: &IsolateCredential, slot: SlotId) -> TokenResult<()> {
        let registry = self.registry.lock();
        registry.isolates.check_access(isolate, slot)?;
        registry.loaded(slot).map(|_| ())
    }
}

impl Drop for SlotManager {
    fn drop(&mut self) {
        let registry = self.registry.get_mut();
        registry.sessions.clear();
        for slot in &mut registry.slots {
            if let TokenSlot::Loaded(token) = &mut slot.token {
                if let Some(init) = token.init.take() {
                    let _ = init.join();
                }
            }
        }
    }
}
