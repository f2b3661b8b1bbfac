//! Background key-hierarchy setup for a freshly loaded token
//!
//! First use creates a random master key and protects it with the TPM
//! (bound to an authorization key on TPM 1.2, sealed on TPM 2.0). Later
//! loads recover it with the caller's authorization data. A token whose
//! authorization no longer matches is wiped and recreated rather than left
//! unusable.

use crate::config::ServiceConfig;
use crate::error::{TokenError, TokenResult};
use crate::pool::{InternalBlobId, ObjectPool, TokenObjectPool};
use crate::tpm::{SlotId, TpmThread, TpmVersion};
use sha1::{Digest, Sha1};
use std::sync::Arc;
use std::thread::JoinHandle;
use zeroize::Zeroizing;

pub const MASTER_KEY_LEN: usize = 32;
pub const AUTH_DATA_HASH_VERSION: u8 = 1;

/// `{version, first byte of SHA-1(auth_data)}`
pub fn auth_data_hash(auth_data: &[u8]) -> [u8; 2] {
    [AUTH_DATA_HASH_VERSION, Sha1::digest(auth_data)[0]]
}

/// Cheap pre-check before asking the TPM
pub fn auth_data_hash_matches(stored: Option<&[u8]>, auth_data: &[u8]) -> bool {
    stored.is_some_and(|stored| stored == auth_data_hash(auth_data).as_slice())
}

/// The blob whose authorization changes with the token's auth data
pub(super) fn auth_protected_blob(version: Option<TpmVersion>) -> InternalBlobId {
    match version {
        Some(TpmVersion::V1_2) => InternalBlobId::AuthKey,
        _ => InternalBlobId::EncryptedMasterKey,
    }
}

pub(super) struct TokenInit {
    pub slot: SlotId,
    pub auth_data: Zeroizing<Vec<u8>>,
    pub config: Arc<ServiceConfig>,
    pub tpm: Arc<TpmThread>,
    pub pool: Arc<TokenObjectPool>,
}

impl TokenInit {
    pub fn spawn(self) -> TokenResult<JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name(format!("token-init-{}", self.slot))
            .spawn(move || self.run())?;
        Ok(handle)
    }

    fn run(self) {
        match self.recover_or_create() {
            Ok(master) => {
                if self.pool.set_encryption_key(&master) {
                    log::info!("Private objects available on slot {}", self.slot);
                } else {
                    log::error!("Master key did not open private objects on slot {}", self.slot);
                }
            }
            Err(e) => {
                log::error!("Token initialization failed on slot {}: {}", self.slot, e);
                self.pool.abandon_private_objects();
            }
        }
    }

    fn recover_or_create(&self) -> TokenResult<Zeroizing<Vec<u8>>> {
        if !self.tpm.is_tpm_available() {
            return Err(TokenError::tpm("no TPM available"));
        }
        let Some(encrypted) = self.pool.get_internal_blob(InternalBlobId::EncryptedMasterKey) else {
            return self.create_hierarchy();
        };

        let stored_hash = self.pool.get_internal_blob(InternalBlobId::AuthDataHash);
        if !auth_data_hash_matches(stored_hash.as_deref(), &self.auth_data) {
            log::warn!("Authorization data hash mismatch on slot {}, reinitializing token", self.slot);
            return self.reinitialize();
        }

        match self.authenticate(encrypted) {
            Ok(master) => {
                log::info!("Recovered master key for slot {}", self.slot);
                Ok(master)
            }
            Err(e) => {
                log::warn!("TPM authentication failed on slot {} ({}), reinitializing token", self.slot, e);
                self.reinitialize()
            }
        }
    }

    fn authenticate(&self, encrypted: Vec<u8>) -> TokenResult<Zeroizing<Vec<u8>>> {
        let auth_key = self
            .pool
            .get_internal_blob(InternalBlobId::AuthKey)
            .unwrap_or_default();
        let auth = self.auth_data.clone();
        let slot = self.slot;
        let master = self
            .tpm
            .call(move |tpm| tpm.authenticate(slot, &auth, &auth_key, &encrypted))?;
        if master.len() != MASTER_KEY_LEN {
            return Err(TokenError::tpm("recovered master key has the wrong length"));
        }
        Ok(master)
    }

    fn reinitialize(&self) -> TokenResult<Zeroizing<Vec<u8>>> {
        self.pool.delete_all()?;
        self.create_hierarchy()
    }

    fn create_hierarchy(&self) -> TokenResult<Zeroizing<Vec<u8>>> {
        let slot = self.slot;
        let master = Zeroizing::new(self.tpm.call(|tpm| tpm.generate_random(MASTER_KEY_LEN))?);
        let auth = self.auth_data.clone();
        let secret = master.clone();

        match self.tpm.version() {
            Some(TpmVersion::V1_2) => {
                let bits = self.config.auth_key_bits;
                let (auth_key, bound) = self.tpm.call(move |tpm| {
                    let key = tpm.generate_rsa_key(slot, bits, &[], &auth)?;
                    let bound = tpm.bind(key.handle, &secret)?;
                    Ok((key.blob, bound))
                })?;
                self.pool.set_internal_blob(InternalBlobId::AuthKey, &auth_key)?;
                self.pool.set_internal_blob(InternalBlobId::EncryptedMasterKey, &bound)?;
            }
            _ => {
                let sealed = self.tpm.call(move |tpm| tpm.seal_data(slot, &auth, &secret))?;
                self.pool.set_internal_blob(InternalBlobId::EncryptedMasterKey, &sealed)?;
            }
        }
        self.pool
            .set_internal_blob(InternalBlobId::AuthDataHash, &auth_data_hash(&self.auth_data))?;
        log::info!("Created key hierarchy for slot {}", slot);
        Ok(master)
    }
}
