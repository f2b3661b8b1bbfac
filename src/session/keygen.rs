//! Key generation, TPM import of caller-supplied keys, and key wrapping

use super::operation::{modulus_bits, rsa_private_key, rsa_public_key};
use super::Session;
use crate::crypto::cipher::run_cipher;
use crate::error::{TokenError, TokenResult};
use crate::mechanism::{classify, MechanismKind, MechanismType};
use crate::object::policy::secret_key_length_valid;
use crate::object::{
    Attribute, AttributeType, Object, ObjectHandle, ObjectPolicy, CKA_CLASS, CKA_COEFFICIENT, CKA_EC_PARAMS,
    CKA_EC_POINT, CKA_EXPONENT_1, CKA_EXPONENT_2, CKA_EXTRACTABLE, CKA_KEY_TYPE, CKA_MODULUS, CKA_MODULUS_BITS,
    CKA_PRIME_1, CKA_PRIME_2, CKA_PRIVATE_EXPONENT, CKA_PUBLIC_EXPONENT, CKA_TPM_AUTH_DATA, CKA_TPM_KEY_BLOB,
    CKA_UNWRAP, CKA_VALUE, CKA_VALUE_LEN, CKA_WRAP, CKK_DES, CKK_DES3, CKK_EC, CKK_RSA, CKO_PRIVATE_KEY,
    CKO_PUBLIC_KEY, CKO_SECRET_KEY,
};
use crate::tpm::{EccCurve, PublicKeyInfo, TpmKey, TpmKeyHandle};
use p256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPrivateKey};
use zeroize::Zeroizing;

/// DER OID of NIST P-256 (prime256v1), the only supported curve
pub const EC_PARAMS_P256: &[u8] = &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];

/// 65537
pub const DEFAULT_PUBLIC_EXPONENT: &[u8] = &[0x01, 0x00, 0x01];

/// Length of the random usage authorization given to TPM keys
const KEY_AUTH_LEN: usize = 20;

/// Set `kind` to `value`, or confirm the caller already asked for it
fn require_ulong(object: &mut Object, kind: AttributeType, value: u64) -> TokenResult<()> {
    match object.get_ulong(kind) {
        None => {
            object.set_ulong(kind, value);
            Ok(())
        }
        Some(current) if current == value => Ok(()),
        Some(_) => Err(TokenError::TemplateInconsistent),
    }
}

fn reject_hidden(object: &Object) -> TokenResult<()> {
    if object.attribute_types().any(ObjectPolicy::is_hidden) {
        return Err(TokenError::AttributeTypeInvalid);
    }
    Ok(())
}

impl Session {
    /// Generate a secret key (`CKM_*_KEY_GEN`)
    pub fn generate_key(&mut self, mechanism: MechanismType, template: &[Attribute]) -> TokenResult<ObjectHandle> {
        let key_type = match classify(mechanism) {
            Some(MechanismKind::KeyGen(key_type)) => key_type,
            _ => return Err(TokenError::MechanismInvalid),
        };
        let mut object = Object::from_template(template);
        reject_hidden(&object)?;
        require_ulong(&mut object, CKA_CLASS, CKO_SECRET_KEY)?;
        require_ulong(&mut object, CKA_KEY_TYPE, key_type)?;
        if object.has(CKA_VALUE) {
            return Err(TokenError::TemplateInconsistent);
        }

        let len = match key_type {
            CKK_DES => 8,
            CKK_DES3 => 24,
            _ => object.get_ulong(CKA_VALUE_LEN).ok_or(TokenError::TemplateIncomplete)? as usize,
        };
        if !secret_key_length_valid(key_type, len) {
            return Err(TokenError::KeySizeRange);
        }

        object.set_bytes(CKA_VALUE, self.generate_random(len)?);
        object.set_ulong(CKA_VALUE_LEN, len as u64);
        ObjectPolicy::apply_defaults(&mut object);
        ObjectPolicy::finalize_generated(&mut object, mechanism);
        self.check_writable_pool(Self::pool_for(&object))?;
        let handle = self.store_object(object)?;
        log::debug!("Session {} generated {}-byte secret key {}", self.handle, len, handle);
        Ok(handle)
    }

    /// Generate an RSA or EC key pair; returns `(public, private)`
    ///
    /// Token private keys are created inside the TPM when one is available;
    /// their private components never appear on the object.
    pub fn generate_key_pair(
        &mut self,
        mechanism: MechanismType,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> TokenResult<(ObjectHandle, ObjectHandle)> {
        let key_type = match classify(mechanism) {
            Some(MechanismKind::KeyPairGen(key_type)) => key_type,
            _ => return Err(TokenError::MechanismInvalid),
        };
        let mut public = Object::from_template(public_template);
        let mut private = Object::from_template(private_template);
        for object in [&public, &private] {
            reject_hidden(object)?;
        }
        require_ulong(&mut public, CKA_CLASS, CKO_PUBLIC_KEY)?;
        require_ulong(&mut private, CKA_CLASS, CKO_PRIVATE_KEY)?;
        require_ulong(&mut public, CKA_KEY_TYPE, key_type)?;
        require_ulong(&mut private, CKA_KEY_TYPE, key_type)?;
        self.check_writable_pool(Self::pool_for(&public))?;
        self.check_writable_pool(Self::pool_for(&private))?;

        let tpm_backed = private.is_token_object() && self.token.tpm.is_tpm_available();
        let tpm_handle = match key_type {
            CKK_RSA => self.generate_rsa_pair(&mut public, &mut private, tpm_backed)?,
            CKK_EC => self.generate_ec_pair(&mut public, &mut private, tpm_backed)?,
            _ => return Err(TokenError::MechanismInvalid),
        };

        for object in [&mut public, &mut private] {
            ObjectPolicy::apply_defaults(object);
            ObjectPolicy::finalize_generated(object, mechanism);
        }

        let public_handle = self.store_object(public)?;
        let private_handle = match self.store_object(private) {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(cleanup) = self.destroy_object(public_handle) {
                    log::warn!("Could not remove orphaned public key {}: {}", public_handle, cleanup);
                }
                return Err(e);
            }
        };
        if let Some(handle) = tpm_handle {
            self.key_handles.insert(private_handle, handle);
        }
        log::debug!(
            "Session {} generated key pair ({}, {}) tpm_backed={}",
            self.handle,
            public_handle,
            private_handle,
            tpm_backed
        );
        Ok((public_handle, private_handle))
    }

    fn generate_rsa_pair(
        &mut self,
        public: &mut Object,
        private: &mut Object,
        tpm_backed: bool,
    ) -> TokenResult<Option<TpmKeyHandle>> {
        let bits = public.get_ulong(CKA_MODULUS_BITS).ok_or(TokenError::TemplateIncomplete)? as usize;
        let (min, max) = self.token.config.rsa_bounds(tpm_backed);
        if bits < min || bits > max {
            return Err(TokenError::KeySizeRange);
        }
        let exponent = public
            .get_bytes(CKA_PUBLIC_EXPONENT)
            .unwrap_or(DEFAULT_PUBLIC_EXPONENT)
            .to_vec();

        let (modulus, public_exponent, tpm_handle) = if tpm_backed {
            let auth = self.generate_random(KEY_AUTH_LEN)?;
            let slot = self.token.slot;
            let (key_exponent, key_auth) = (exponent.clone(), auth.clone());
            let (key, info) = self.token.tpm.call(move |tpm| {
                let key = tpm.generate_rsa_key(slot, bits, &key_exponent, &key_auth)?;
                let info = tpm.get_public_key(key.handle)?;
                Ok((key, info))
            })?;
            let PublicKeyInfo::Rsa {
                modulus,
                public_exponent,
            } = info
            else {
                return Err(TokenError::tpm("generated key is not RSA"));
            };
            let handle = key.handle;
            Self::attach_tpm_key(private, key, auth);
            (modulus, public_exponent, Some(handle))
        } else {
            let e = BigUint::from_bytes_be(&exponent);
            let key = RsaPrivateKey::new_with_exp(&mut OsRng, bits, &e)
                .map_err(|_| TokenError::TemplateInconsistent)?;
            let primes = key.primes();
            if primes.len() != 2 {
                return Err(TokenError::FunctionFailed("RSA key without two primes".into()));
            }
            private.set_bytes(CKA_PRIVATE_EXPONENT, key.d().to_bytes_be());
            private.set_bytes(CKA_PRIME_1, primes[0].to_bytes_be());
            private.set_bytes(CKA_PRIME_2, primes[1].to_bytes_be());
            if let (Some(dp), Some(dq), Some(qinv)) = (key.dp(), key.dq(), key.crt_coefficient()) {
                private.set_bytes(CKA_EXPONENT_1, dp.to_bytes_be());
                private.set_bytes(CKA_EXPONENT_2, dq.to_bytes_be());
                private.set_bytes(CKA_COEFFICIENT, qinv.to_bytes_be());
            }
            (key.n().to_bytes_be(), key.e().to_bytes_be(), None)
        };

        for object in [&mut *public, &mut *private] {
            object.set_bytes(CKA_MODULUS, modulus.clone());
            object.set_bytes(CKA_PUBLIC_EXPONENT, public_exponent.clone());
        }
        public.set_ulong(CKA_MODULUS_BITS, bits as u64);
        Ok(tpm_handle)
    }

    fn generate_ec_pair(
        &mut self,
        public: &mut Object,
        private: &mut Object,
        tpm_backed: bool,
    ) -> TokenResult<Option<TpmKeyHandle>> {
        let params = public.get_bytes(CKA_EC_PARAMS).ok_or(TokenError::TemplateIncomplete)?;
        if params != EC_PARAMS_P256 {
            return Err(TokenError::DomainParamsInvalid);
        }
        private.set_bytes(CKA_EC_PARAMS, EC_PARAMS_P256.to_vec());

        let (point, tpm_handle) = if tpm_backed {
            let auth = self.generate_random(KEY_AUTH_LEN)?;
            let slot = self.token.slot;
            let key_auth = auth.clone();
            let (key, info) = self.token.tpm.call(move |tpm| {
                let key = tpm.generate_ecc_key(slot, EccCurve::NistP256, &key_auth)?;
                let info = tpm.get_public_key(key.handle)?;
                Ok((key, info))
            })?;
            let PublicKeyInfo::Ec { point } = info else {
                return Err(TokenError::tpm("generated key is not EC"));
            };
            let handle = key.handle;
            Self::attach_tpm_key(private, key, auth);
            (point, Some(handle))
        } else {
            let key = SigningKey::random(&mut OsRng);
            private.set_bytes(CKA_VALUE, key.to_bytes().to_vec());
            let point = key.verifying_key().to_encoded_point(false).as_bytes().to_vec();
            (point, None)
        };
        public.set_bytes(CKA_EC_POINT, point);
        Ok(tpm_handle)
    }

    fn attach_tpm_key(private: &mut Object, key: TpmKey, auth: Vec<u8>) {
        for kind in ObjectPolicy::private_key_components() {
            private.remove(*kind);
        }
        private.remove(CKA_VALUE);
        private.set_bytes(CKA_TPM_KEY_BLOB, key.blob);
        private.set_bytes(CKA_TPM_AUTH_DATA, auth);
    }

    /// Move a caller-supplied RSA private key into the TPM before it becomes
    /// a token object. Returns the TPM handle if the key was wrapped.
    pub(super) fn wrap_imported_private_key(&mut self, object: &mut Object) -> TokenResult<Option<TpmKeyHandle>> {
        let eligible = object.class() == Some(CKO_PRIVATE_KEY)
            && object.key_type() == Some(CKK_RSA)
            && object.is_token_object()
            && !object.is_tpm_backed()
            && self.token.tpm.is_tpm_available();
        if !eligible {
            return Ok(None);
        }

        let modulus = object.get_bytes(CKA_MODULUS).ok_or(TokenError::TemplateIncomplete)?.to_vec();
        let exponent = object
            .get_bytes(CKA_PUBLIC_EXPONENT)
            .ok_or(TokenError::TemplateIncomplete)?
            .to_vec();
        let (min, max) = self.token.config.rsa_bounds(true);
        let bits = modulus_bits(&modulus);
        if bits < min || bits > max {
            return Err(TokenError::KeySizeRange);
        }
        let prime = match object.get_bytes(CKA_PRIME_1) {
            Some(prime) => prime.to_vec(),
            None => {
                let key = rsa_private_key(object).map_err(|_| TokenError::TemplateIncomplete)?;
                key.primes()
                    .first()
                    .map(|p| p.to_bytes_be())
                    .ok_or(TokenError::TemplateIncomplete)?
            }
        };

        let auth = self.generate_random(KEY_AUTH_LEN)?;
        let slot = self.token.slot;
        let key_auth = auth.clone();
        let key = self
            .token
            .tpm
            .call(move |tpm| tpm.wrap_rsa_key(slot, &exponent, &modulus, &prime, &key_auth))?;
        let handle = key.handle;
        Self::attach_tpm_key(object, key, auth);
        log::debug!("Session {} wrapped imported RSA key under the TPM", self.handle);
        Ok(Some(handle))
    }

    /// Export a secret key encrypted under `wrapping_key`
    pub fn wrap_key(
        &mut self,
        mechanism: MechanismType,
        parameter: &[u8],
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> TokenResult<Vec<u8>> {
        let kind = classify(mechanism).ok_or(TokenError::MechanismInvalid)?;
        let wrapping = self.get_object(wrapping_key).map_err(|_| TokenError::KeyHandleInvalid)?;
        let target = self.get_object(key).map_err(|_| TokenError::KeyHandleInvalid)?;
        if target.class() != Some(CKO_SECRET_KEY) {
            return Err(TokenError::KeyTypeInconsistent);
        }
        if !target.get_bool(CKA_EXTRACTABLE, true) || !wrapping.get_bool(CKA_WRAP, false) {
            return Err(TokenError::KeyFunctionNotPermitted);
        }
        let value = target.get_bytes(CKA_VALUE).ok_or(TokenError::KeyTypeInconsistent)?;

        match kind {
            MechanismKind::Cipher(alg, mode) => {
                if wrapping.class() != Some(CKO_SECRET_KEY) || wrapping.key_type() != Some(alg.key_type()) {
                    return Err(TokenError::KeyTypeInconsistent);
                }
                let wrapping_value = wrapping.get_bytes(CKA_VALUE).ok_or(TokenError::KeyTypeInconsistent)?;
                run_cipher(alg, mode, wrapping_value, parameter, true, value)
            }
            MechanismKind::RsaPkcs => {
                if wrapping.key_type() != Some(CKK_RSA) {
                    return Err(TokenError::KeyTypeInconsistent);
                }
                let public = rsa_public_key(&wrapping)?;
                public
                    .encrypt(&mut OsRng, Pkcs1v15Encrypt, value)
                    .map_err(|_| TokenError::KeySizeRange)
            }
            _ => Err(TokenError::MechanismInvalid),
        }
    }

    /// Import a secret key previously exported by `wrap_key`
    pub fn unwrap_key(
        &mut self,
        mechanism: MechanismType,
        parameter: &[u8],
        unwrapping_key: ObjectHandle,
        wrapped: &[u8],
        template: &[Attribute],
    ) -> TokenResult<ObjectHandle> {
        let kind = classify(mechanism).ok_or(TokenError::MechanismInvalid)?;
        let unwrapping = self.get_object(unwrapping_key).map_err(|_| TokenError::KeyHandleInvalid)?;
        if !unwrapping.get_bool(CKA_UNWRAP, false) {
            return Err(TokenError::KeyFunctionNotPermitted);
        }

        let mut object = Object::from_template(template);
        reject_hidden(&object)?;
        match object.class() {
            Some(CKO_SECRET_KEY) => {}
            Some(_) => return Err(TokenError::TemplateInconsistent),
            None => return Err(TokenError::TemplateIncomplete),
        }
        let key_type = object.key_type().ok_or(TokenError::TemplateIncomplete)?;
        if object.has(CKA_VALUE) {
            return Err(TokenError::TemplateInconsistent);
        }
        self.check_writable_pool(Self::pool_for(&object))?;

        let value = Zeroizing::new(match kind {
            MechanismKind::Cipher(alg, mode) => {
                if unwrapping.class() != Some(CKO_SECRET_KEY) || unwrapping.key_type() != Some(alg.key_type()) {
                    return Err(TokenError::KeyTypeInconsistent);
                }
                let key_value = unwrapping.get_bytes(CKA_VALUE).ok_or(TokenError::KeyTypeInconsistent)?;
                run_cipher(alg, mode, key_value, parameter, false, wrapped).map_err(|e| match e {
                    TokenError::MechanismParamInvalid | TokenError::KeySizeRange => e,
                    _ => TokenError::WrappedKeyInvalid,
                })?
            }
            MechanismKind::RsaPkcs => {
                if unwrapping.class() != Some(CKO_PRIVATE_KEY) || unwrapping.key_type() != Some(CKK_RSA) {
                    return Err(TokenError::KeyTypeInconsistent);
                }
                let tpm_handle = if unwrapping.is_tpm_backed() {
                    Some(self.key_handles.load(&self.token.tpm, self.token.pool.as_ref(), &unwrapping)?)
                } else {
                    None
                };
                self.rsa_private_decrypt(&unwrapping, tpm_handle, wrapped.to_vec())
                    .map_err(|_| TokenError::WrappedKeyInvalid)?
            }
            _ => return Err(TokenError::MechanismInvalid),
        });

        if !secret_key_length_valid(key_type, value.len()) {
            return Err(TokenError::WrappedKeyInvalid);
        }
        object.set_bytes(CKA_VALUE, value.to_vec());
        object.set_ulong(CKA_VALUE_LEN, value.len() as u64);
        ObjectPolicy::apply_defaults(&mut object);
        self.store_object(object)
    }

    /// Key derivation is not offered by this token
    pub fn derive_key(
        &mut self,
        _mechanism: MechanismType,
        _parameter: &[u8],
        _base_key: ObjectHandle,
        _template: &[Attribute],
    ) -> TokenResult<ObjectHandle> {
        Err(TokenError::FunctionNotSupported)
    }
}
