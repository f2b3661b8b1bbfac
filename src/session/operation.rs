//! Operation contexts and the per-family state machine
//!
//! Each family (encrypt, decrypt, digest, sign, verify) is Idle until
//! `operation_init` succeeds, then Active. `operation_final` computes the
//! result once and parks it; if the caller's buffer is too small the result
//! stays parked (Finished) and is handed out on the next call. Any other
//! error drops the family back to Idle.

use super::keygen::EC_PARAMS_P256;
use super::Session;
use crate::crypto::{BlockCipherState, DigestState, HmacState};
use crate::error::{TokenError, TokenResult};
use crate::mechanism::{classify, key_type_for, MechanismKind, MechanismType, CKM_ECDSA, CKM_RSA_PKCS};
use crate::object::{
    AttributeType, Object, ObjectHandle, CKA_DECRYPT, CKA_EC_PARAMS, CKA_EC_POINT, CKA_ENCRYPT, CKA_MODULUS,
    CKA_PRIME_1, CKA_PRIME_2, CKA_PRIVATE_EXPONENT, CKA_PUBLIC_EXPONENT, CKA_SIGN, CKA_VALUE, CKA_VERIFY, CKK_EC,
    CKO_PRIVATE_KEY, CKO_PUBLIC_KEY, CKO_SECRET_KEY,
};
use crate::tpm::TpmKeyHandle;
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};

/// PKCS#1 v1.5 padding overhead
const PKCS1_OVERHEAD: usize = 11;
/// P-256 signature as r || s
const ECDSA_P256_SIGNATURE_LEN: usize = 64;

/// Operation families; each has its own independent context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Encrypt,
    Decrypt,
    Digest,
    Sign,
    Verify,
}

impl OperationType {
    pub const COUNT: usize = 5;

    fn index(self) -> usize {
        self as usize
    }

    fn usage_attribute(self) -> Option<AttributeType> {
        match self {
            OperationType::Encrypt => Some(CKA_ENCRYPT),
            OperationType::Decrypt => Some(CKA_DECRYPT),
            OperationType::Sign => Some(CKA_SIGN),
            OperationType::Verify => Some(CKA_VERIFY),
            OperationType::Digest => None,
        }
    }

    /// Operations that need the private half of an asymmetric key
    fn uses_private_key(self) -> bool {
        matches!(self, OperationType::Decrypt | OperationType::Sign)
    }

    fn permits(self, kind: &MechanismKind) -> bool {
        use OperationType::*;
        match kind {
            MechanismKind::Cipher(..) => matches!(self, Encrypt | Decrypt),
            MechanismKind::Digest(_) => self == Digest,
            MechanismKind::Hmac(_) | MechanismKind::RsaWithDigest(_) | MechanismKind::Ecdsa(_) => {
                matches!(self, Sign | Verify)
            }
            MechanismKind::RsaPkcs => self != Digest,
            MechanismKind::KeyGen(_) | MechanismKind::KeyPairGen(_) => false,
        }
    }
}

enum Engine {
    Cipher(BlockCipherState),
    Digest(DigestState),
    Hmac { state: HmacState, mac_len: usize },
    Asymmetric(AsymmetricOp),
}

struct AsymmetricOp {
    kind: MechanismKind,
    key: Object,
    tpm_handle: Option<TpmKeyHandle>,
    digest: Option<DigestState>,
    data: Vec<u8>,
}

impl AsymmetricOp {
    fn update(&mut self, data: &[u8]) {
        match self.digest.as_mut() {
            Some(digest) => digest.update(data),
            None => self.data.extend_from_slice(data),
        }
    }

    /// Hash (for digest-bound mechanisms) or the raw accumulated input
    fn input(&mut self) -> Vec<u8> {
        match self.digest.take() {
            Some(digest) => digest.finish(),
            None => std::mem::take(&mut self.data),
        }
    }

    /// Block handed to the RSA private/public transform when signing
    fn rsa_sign_input(&mut self) -> Vec<u8> {
        let input = self.input();
        match self.kind {
            MechanismKind::RsaWithDigest(alg) => alg.digest_info(&input),
            _ => input,
        }
    }
}

/// State of one operation family
#[derive(Default)]
pub(super) struct OperationContext {
    mechanism: MechanismType,
    engine: Option<Engine>,
    /// Output computed but not yet accepted by the caller
    pending: Option<Vec<u8>>,
    active: bool,
    /// An update has fed data; single-part calls are refused from here on
    updated: bool,
    finished: bool,
}

impl OperationContext {
    fn reset(&mut self) {
        *self = Self::default();
    }

    /// Hand out the parked output if it fits; `complete` returns the family
    /// to Idle once it has been delivered
    fn drain(&mut self, max_out: usize, complete: bool) -> TokenResult<Vec<u8>> {
        let len = self.pending.as_ref().map_or(0, |p| p.len());
        if len > max_out {
            return Err(TokenError::BufferTooSmall { required: len });
        }
        let out = self.pending.take().unwrap_or_default();
        if complete {
            self.reset();
        }
        Ok(out)
    }
}

pub(super) fn modulus_bits(modulus: &[u8]) -> usize {
    let trimmed: &[u8] = match modulus.iter().position(|b| *b != 0) {
        Some(start) => &modulus[start..],
        None => return 0,
    };
    trimmed.len() * 8 - trimmed[0].leading_zeros() as usize
}

fn big(object: &Object, kind: AttributeType) -> TokenResult<BigUint> {
    object
        .get_bytes(kind)
        .map(BigUint::from_bytes_be)
        .ok_or(TokenError::KeyTypeInconsistent)
}

pub(super) fn rsa_public_key(object: &Object) -> TokenResult<RsaPublicKey> {
    RsaPublicKey::new(big(object, CKA_MODULUS)?, big(object, CKA_PUBLIC_EXPONENT)?)
        .map_err(|_| TokenError::KeyTypeInconsistent)
}

pub(super) fn rsa_private_key(object: &Object) -> TokenResult<RsaPrivateKey> {
    let primes = [CKA_PRIME_1, CKA_PRIME_2]
        .iter()
        .filter_map(|kind| object.get_bytes(*kind))
        .map(BigUint::from_bytes_be)
        .collect();
    RsaPrivateKey::from_components(
        big(object, CKA_MODULUS)?,
        big(object, CKA_PUBLIC_EXPONENT)?,
        big(object, CKA_PRIVATE_EXPONENT)?,
        primes,
    )
    .map_err(|_| TokenError::KeyTypeInconsistent)
}

fn ec_signing_key(object: &Object) -> TokenResult<SigningKey> {
    let scalar = object.get_bytes(CKA_VALUE).ok_or(TokenError::KeyTypeInconsistent)?;
    SigningKey::from_slice(scalar).map_err(|_| TokenError::KeyTypeInconsistent)
}

fn ec_verifying_key(object: &Object) -> TokenResult<VerifyingKey> {
    let point = object.get_bytes(CKA_EC_POINT).ok_or(TokenError::KeyTypeInconsistent)?;
    VerifyingKey::from_sec1_bytes(point).map_err(|_| TokenError::KeyTypeInconsistent)
}

impl Session {
    fn context(&mut self, op: OperationType) -> &mut OperationContext {
        &mut self.contexts[op.index()]
    }

    pub fn is_operation_active(&self, op: OperationType) -> bool {
        self.contexts[op.index()].active
    }

    /// Mechanism of the active operation, if any
    pub fn operation_mechanism(&self, op: OperationType) -> Option<MechanismType> {
        let ctx = &self.contexts[op.index()];
        ctx.active.then_some(ctx.mechanism)
    }

    pub fn operation_init(
        &mut self,
        op: OperationType,
        mechanism: MechanismType,
        parameter: &[u8],
        key: Option<ObjectHandle>,
    ) -> TokenResult<()> {
        if self.context(op).active {
            return Err(TokenError::OperationActive);
        }
        let engine = self.build_engine(op, mechanism, parameter, key)?;
        *self.context(op) = OperationContext {
            mechanism,
            engine: Some(engine),
            pending: None,
            active: true,
            updated: false,
            finished: false,
        };
        log::debug!("Session {} {:?} init with mechanism {:#x}", self.handle, op, mechanism);
        Ok(())
    }

    /// Feed data. For encrypt/decrypt the output of whole blocks comes back;
    /// if it does not fit in `max_out` it is kept for the retry, and the
    /// retry's `data` is ignored.
    pub fn operation_update(&mut self, op: OperationType, data: &[u8], max_out: usize) -> TokenResult<Vec<u8>> {
        let ctx = self.context(op);
        if !ctx.active {
            return Err(TokenError::OperationNotInitialized);
        }
        if ctx.finished {
            return Err(TokenError::OperationActive);
        }
        if ctx.pending.is_none() {
            let out = match ctx.engine.as_mut() {
                Some(Engine::Cipher(state)) => state.update(data),
                Some(Engine::Digest(state)) => {
                    state.update(data);
                    Vec::new()
                }
                Some(Engine::Hmac { state, .. }) => {
                    state.update(data);
                    Vec::new()
                }
                Some(Engine::Asymmetric(asym)) => {
                    asym.update(data);
                    Vec::new()
                }
                None => {
                    ctx.reset();
                    return Err(TokenError::OperationNotInitialized);
                }
            };
            ctx.pending = Some(out);
            ctx.updated = true;
        }
        ctx.drain(max_out, false)
    }

    /// Finish a multi-part operation; see the buffer rules on `operation_update`
    pub fn operation_final(&mut self, op: OperationType, max_out: usize) -> TokenResult<Vec<u8>> {
        if !self.context(op).active {
            return Err(TokenError::OperationNotInitialized);
        }
        if op == OperationType::Verify {
            return Err(TokenError::ArgumentsBad("verify finishes with verify_final".into()));
        }
        self.finish_with(op, None, max_out)
    }

    /// Update and final in one call
    pub fn operation_single_part(&mut self, op: OperationType, data: &[u8], max_out: usize) -> TokenResult<Vec<u8>> {
        let ctx = self.context(op);
        if !ctx.active {
            return Err(TokenError::OperationNotInitialized);
        }
        if op == OperationType::Verify {
            return Err(TokenError::ArgumentsBad("verify finishes with verify".into()));
        }
        if ctx.updated && !ctx.finished {
            return Err(TokenError::OperationActive);
        }
        self.finish_with(op, Some(data), max_out)
    }

    pub fn operation_cancel(&mut self, op: OperationType) {
        self.context(op).reset();
    }

    pub fn verify_final(&mut self, signature: &[u8]) -> TokenResult<()> {
        let ctx = self.context(OperationType::Verify);
        if !ctx.active {
            return Err(TokenError::OperationNotInitialized);
        }
        let engine = ctx.engine.take();
        ctx.reset();
        match engine {
            Some(Engine::Hmac { state, mac_len }) => {
                if signature.len() != mac_len {
                    return Err(TokenError::SignatureLenRange);
                }
                if state.verify(signature) {
                    Ok(())
                } else {
                    Err(TokenError::SignatureInvalid)
                }
            }
            Some(Engine::Asymmetric(mut asym)) => match asym.kind {
                MechanismKind::RsaPkcs | MechanismKind::RsaWithDigest(_) => {
                    let public = rsa_public_key(&asym.key)?;
                    if signature.len() != public.size() {
                        return Err(TokenError::SignatureLenRange);
                    }
                    let expected = asym.rsa_sign_input();
                    public
                        .verify(Pkcs1v15Sign::new_unprefixed(), &expected, signature)
                        .map_err(|_| TokenError::SignatureInvalid)
                }
                _ => {
                    if signature.len() != ECDSA_P256_SIGNATURE_LEN {
                        return Err(TokenError::SignatureLenRange);
                    }
                    let public = ec_verifying_key(&asym.key)?;
                    let signature = Signature::from_slice(signature).map_err(|_| TokenError::SignatureInvalid)?;
                    public
                        .verify_prehash(&asym.input(), &signature)
                        .map_err(|_| TokenError::SignatureInvalid)
                }
            },
            _ => Err(TokenError::OperationNotInitialized),
        }
    }

    pub fn verify(&mut self, data: &[u8], signature: &[u8]) -> TokenResult<()> {
        let ctx = self.context(OperationType::Verify);
        if ctx.active && ctx.updated {
            return Err(TokenError::OperationActive);
        }
        self.operation_update(OperationType::Verify, data, 0)?;
        self.verify_final(signature)
    }

    fn finish_with(&mut self, op: OperationType, data: Option<&[u8]>, max_out: usize) -> TokenResult<Vec<u8>> {
        let ctx = self.context(op);
        if !ctx.active {
            return Err(TokenError::OperationNotInitialized);
        }
        if !ctx.finished {
            let Some(engine) = ctx.engine.take() else {
                ctx.reset();
                return Err(TokenError::OperationNotInitialized);
            };
            // Output of an update the caller never collected goes first
            let mut out = ctx.pending.take().unwrap_or_default();
            match self.compute(op, engine, data) {
                Ok(tail) => out.extend(tail),
                Err(e) => {
                    self.context(op).reset();
                    return Err(e);
                }
            }
            let ctx = self.context(op);
            ctx.pending = Some(out);
            ctx.finished = true;
        }
        self.context(op).drain(max_out, true)
    }

    fn compute(&mut self, op: OperationType, engine: Engine, data: Option<&[u8]>) -> TokenResult<Vec<u8>> {
        match engine {
            Engine::Cipher(mut state) => {
                let mut out = data.map(|d| state.update(d)).unwrap_or_default();
                out.extend(state.finish()?);
                Ok(out)
            }
            Engine::Digest(mut state) => {
                if let Some(d) = data {
                    state.update(d);
                }
                Ok(state.finish())
            }
            Engine::Hmac { mut state, .. } => {
                if let Some(d) = data {
                    state.update(d);
                }
                Ok(state.finish())
            }
            Engine::Asymmetric(mut asym) => {
                if let Some(d) = data {
                    asym.update(d);
                }
                match op {
                    OperationType::Sign => self.asymmetric_sign(asym),
                    OperationType::Encrypt => Self::rsa_encrypt(asym),
                    OperationType::Decrypt => self.rsa_decrypt(asym),
                    _ => Err(TokenError::MechanismInvalid),
                }
            }
        }
    }

    fn asymmetric_sign(&mut self, mut asym: AsymmetricOp) -> TokenResult<Vec<u8>> {
        if let MechanismKind::Ecdsa(_) = asym.kind {
            let hash = asym.input();
            return match asym.tpm_handle {
                Some(handle) => self
                    .token
                    .tpm
                    .call(move |tpm| tpm.sign(handle, CKM_ECDSA, &[], &hash)),
                None => {
                    let key = ec_signing_key(&asym.key)?;
                    let signature: Signature = key.sign_prehash(&hash).map_err(|_| TokenError::DataLenRange)?;
                    Ok(signature.to_bytes().to_vec())
                }
            };
        }

        let input = asym.rsa_sign_input();
        let modulus_len = asym.key.get_bytes(CKA_MODULUS).map_or(0, |m| modulus_bits(m).div_ceil(8));
        if input.len() + PKCS1_OVERHEAD > modulus_len {
            return Err(TokenError::DataLenRange);
        }
        match asym.tpm_handle {
            Some(handle) => self
                .token
                .tpm
                .call(move |tpm| tpm.sign(handle, CKM_RSA_PKCS, &[], &input)),
            None => rsa_private_key(&asym.key)?
                .sign(Pkcs1v15Sign::new_unprefixed(), &input)
                .map_err(|e| TokenError::FunctionFailed(format!("RSA sign: {}", e))),
        }
    }

    fn rsa_encrypt(mut asym: AsymmetricOp) -> TokenResult<Vec<u8>> {
        let public = rsa_public_key(&asym.key)?;
        let plaintext = asym.input();
        if plaintext.len() + PKCS1_OVERHEAD > public.size() {
            return Err(TokenError::DataLenRange);
        }
        public
            .encrypt(&mut rand::rngs::OsRng, Pkcs1v15Encrypt, &plaintext)
            .map_err(|e| TokenError::FunctionFailed(format!("RSA encrypt: {}", e)))
    }

    fn rsa_decrypt(&mut self, mut asym: AsymmetricOp) -> TokenResult<Vec<u8>> {
        let ciphertext = asym.input();
        self.rsa_private_decrypt(&asym.key, asym.tpm_handle, ciphertext)
    }

    /// RSA PKCS#1 v1.5 decryption with a TPM-resident or software key
    pub(super) fn rsa_private_decrypt(
        &self,
        key: &Object,
        tpm_handle: Option<TpmKeyHandle>,
        ciphertext: Vec<u8>,
    ) -> TokenResult<Vec<u8>> {
        let modulus_len = key.get_bytes(CKA_MODULUS).map_or(0, |m| modulus_bits(m).div_ceil(8));
        if ciphertext.len() != modulus_len {
            return Err(TokenError::EncryptedDataLenRange);
        }
        match tpm_handle {
            Some(handle) => Ok(self
                .token
                .tpm
                .call(move |tpm| tpm.unbind(handle, &ciphertext))?
                .to_vec()),
            None => rsa_private_key(key)?
                .decrypt(Pkcs1v15Encrypt, &ciphertext)
                .map_err(|_| TokenError::EncryptedDataInvalid),
        }
    }

    fn build_engine(
        &mut self,
        op: OperationType,
        mechanism: MechanismType,
        parameter: &[u8],
        key: Option<ObjectHandle>,
    ) -> TokenResult<Engine> {
        let kind = classify(mechanism).ok_or(TokenError::MechanismInvalid)?;
        if !op.permits(&kind) {
            return Err(TokenError::MechanismInvalid);
        }
        if let MechanismKind::Digest(alg) = kind {
            return Ok(Engine::Digest(DigestState::new(alg)));
        }

        let handle = key.ok_or(TokenError::KeyHandleInvalid)?;
        let object = self.get_object(handle).map_err(|_| TokenError::KeyHandleInvalid)?;
        self.check_key(op, &kind, &object)?;

        let engine = match kind {
            MechanismKind::Cipher(alg, mode) => {
                let value = object.get_bytes(CKA_VALUE).ok_or(TokenError::KeyTypeInconsistent)?;
                Engine::Cipher(BlockCipherState::new(alg, mode, value, parameter, op == OperationType::Encrypt)?)
            }
            MechanismKind::Hmac(alg) => {
                let value = object.get_bytes(CKA_VALUE).ok_or(TokenError::KeyTypeInconsistent)?;
                Engine::Hmac {
                    state: HmacState::new(alg, value)?,
                    mac_len: alg.output_len(),
                }
            }
            _ => {
                let tpm_handle = if op.uses_private_key() && object.is_tpm_backed() {
                    Some(self.key_handles.load(&self.token.tpm, self.token.pool.as_ref(), &object)?)
                } else {
                    None
                };
                let digest = match kind {
                    MechanismKind::RsaWithDigest(alg) | MechanismKind::Ecdsa(Some(alg)) => Some(DigestState::new(alg)),
                    _ => None,
                };
                Engine::Asymmetric(AsymmetricOp {
                    kind,
                    key: object,
                    tpm_handle,
                    digest,
                    data: Vec::new(),
                })
            }
        };
        Ok(engine)
    }

    /// Key class, type, usage flag and size checks for `op`
    fn check_key(&self, op: OperationType, kind: &MechanismKind, key: &Object) -> TokenResult<()> {
        let class = key.class().ok_or(TokenError::KeyTypeInconsistent)?;
        match kind {
            MechanismKind::Cipher(..) | MechanismKind::Hmac(_) => {
                if class != CKO_SECRET_KEY {
                    return Err(TokenError::KeyTypeInconsistent);
                }
                // HMAC takes any secret key; ciphers need their own key type
                if matches!(kind, MechanismKind::Cipher(..)) && key.key_type() != key_type_for(kind) {
                    return Err(TokenError::KeyTypeInconsistent);
                }
            }
            _ => {
                if key.key_type() != key_type_for(kind) {
                    return Err(TokenError::KeyTypeInconsistent);
                }
                let class_ok = if op.uses_private_key() {
                    class == CKO_PRIVATE_KEY
                } else {
                    class == CKO_PUBLIC_KEY || class == CKO_PRIVATE_KEY
                };
                if !class_ok {
                    return Err(TokenError::KeyTypeInconsistent);
                }
            }
        }

        if let Some(usage) = op.usage_attribute() {
            if !key.get_bool(usage, false) {
                return Err(TokenError::KeyFunctionNotPermitted);
            }
        }

        match kind {
            MechanismKind::RsaPkcs | MechanismKind::RsaWithDigest(_) => {
                let bits = key.get_bytes(CKA_MODULUS).map_or(0, modulus_bits);
                let (min, max) = self.token.config.rsa_bounds(key.is_tpm_backed());
                if bits < min || bits > max {
                    return Err(TokenError::KeySizeRange);
                }
            }
            MechanismKind::Ecdsa(_) => {
                if key.key_type() == Some(CKK_EC) && key.get_bytes(CKA_EC_PARAMS) != Some(EC_PARAMS_P256) {
                    return Err(TokenError::DomainParamsInvalid);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanism::*;
    use crate::object::*;
    use crate::session::tests::{fixture, software_fixture};

    fn aes_key(session: &mut Session, len: u64) -> ObjectHandle {
        session
            .generate_key(
                CKM_AES_KEY_GEN,
                &[Attribute::ulong(CKA_VALUE_LEN, len), Attribute::bool(CKA_TOKEN, false)],
            )
            .unwrap()
    }

    fn hmac_key(session: &mut Session) -> ObjectHandle {
        session
            .generate_key(
                CKM_GENERIC_SECRET_KEY_GEN,
                &[Attribute::ulong(CKA_VALUE_LEN, 32), Attribute::bool(CKA_TOKEN, false)],
            )
            .unwrap()
    }

    fn rsa_pair(session: &mut Session, token: bool) -> (ObjectHandle, ObjectHandle) {
        session
            .generate_key_pair(
                CKM_RSA_PKCS_KEY_PAIR_GEN,
                &[
                    Attribute::ulong(CKA_MODULUS_BITS, 1024),
                    Attribute::bool(CKA_TOKEN, token),
                ],
                &[Attribute::bool(CKA_TOKEN, token)],
            )
            .unwrap()
    }

    #[test]
    fn test_aes_cbc_pad_end_to_end() {
        let fx = software_fixture();
        let mut session = fx.session(false);
        let key = aes_key(&mut session, 32);
        let iv = [0x24u8; 16];
        let plaintext = vec![b'B'; 22];

        session
            .operation_init(OperationType::Encrypt, CKM_AES_CBC_PAD, &iv, Some(key))
            .unwrap();
        assert_eq!(
            session.operation_update(OperationType::Encrypt, &plaintext, 0),
            Err(TokenError::BufferTooSmall { required: 16 })
        );
        let first = session.operation_update(OperationType::Encrypt, &plaintext, 16).unwrap();
        assert_eq!(first.len(), 16);

        assert_eq!(
            session.operation_final(OperationType::Encrypt, 0),
            Err(TokenError::BufferTooSmall { required: 16 })
        );
        assert!(session.is_operation_active(OperationType::Encrypt));
        let second = session.operation_final(OperationType::Encrypt, 16).unwrap();
        assert_eq!(second.len(), 16);
        assert!(!session.is_operation_active(OperationType::Encrypt));

        let ciphertext = [first, second].concat();
        assert_eq!(ciphertext.len(), 32);

        session
            .operation_init(OperationType::Decrypt, CKM_AES_CBC_PAD, &iv, Some(key))
            .unwrap();
        let recovered = session
            .operation_single_part(OperationType::Decrypt, &ciphertext, 64)
            .unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn test_operation_ordering() {
        let fx = software_fixture();
        let mut session = fx.session(false);
        let key = aes_key(&mut session, 16);
        let iv = [0u8; 16];

        for op in [
            OperationType::Encrypt,
            OperationType::Decrypt,
            OperationType::Digest,
            OperationType::Sign,
            OperationType::Verify,
        ] {
            assert_eq!(session.operation_update(op, b"x", 64), Err(TokenError::OperationNotInitialized));
            assert_eq!(session.operation_final(op, 64), Err(TokenError::OperationNotInitialized));
            assert_eq!(
                session.operation_single_part(op, b"x", 64),
                Err(TokenError::OperationNotInitialized)
            );
        }
        assert_eq!(session.verify_final(b"sig"), Err(TokenError::OperationNotInitialized));

        session
            .operation_init(OperationType::Encrypt, CKM_AES_CBC, &iv, Some(key))
            .unwrap();
        assert_eq!(
            session.operation_init(OperationType::Encrypt, CKM_AES_CBC, &iv, Some(key)),
            Err(TokenError::OperationActive)
        );
        // Other families are independent
        session
            .operation_init(OperationType::Digest, CKM_SHA256, &[], None)
            .unwrap();

        // 5 bytes cannot be finished without padding: error returns to Idle
        session.operation_update(OperationType::Encrypt, b"12345", 64).unwrap();
        assert_eq!(session.operation_final(OperationType::Encrypt, 64), Err(TokenError::DataLenRange));
        assert!(!session.is_operation_active(OperationType::Encrypt));
        session
            .operation_init(OperationType::Encrypt, CKM_AES_CBC, &iv, Some(key))
            .unwrap();

        session.operation_cancel(OperationType::Encrypt);
        assert!(!session.is_operation_active(OperationType::Encrypt));
    }

    #[test]
    fn test_single_part_refused_after_update() {
        let fx = software_fixture();
        let mut session = fx.session(false);
        let key = aes_key(&mut session, 16);
        let iv = [0u8; 16];

        session
            .operation_init(OperationType::Encrypt, CKM_AES_CBC_PAD, &iv, Some(key))
            .unwrap();
        session.operation_update(OperationType::Encrypt, b"first", 64).unwrap();
        assert_eq!(
            session.operation_single_part(OperationType::Encrypt, b"second", 64),
            Err(TokenError::OperationActive)
        );
        assert!(session.is_operation_active(OperationType::Encrypt));
        assert_eq!(session.operation_final(OperationType::Encrypt, 64).unwrap().len(), 16);

        let secret = hmac_key(&mut session);
        session
            .operation_init(OperationType::Verify, CKM_SHA256_HMAC, &[], Some(secret))
            .unwrap();
        session.operation_update(OperationType::Verify, b"part", 0).unwrap();
        assert_eq!(session.verify(b"whole", &[0u8; 32]), Err(TokenError::OperationActive));
        assert_eq!(
            session.operation_single_part(OperationType::Verify, b"whole", 0),
            Err(TokenError::ArgumentsBad("verify finishes with verify".into()))
        );
        session.operation_cancel(OperationType::Verify);
    }

    #[test]
    fn test_validation_failures_leave_idle() {
        let fx = software_fixture();
        let mut session = fx.session(false);
        let aes = aes_key(&mut session, 16);

        assert_eq!(
            session.operation_init(OperationType::Encrypt, 0xDEAD, &[], Some(aes)),
            Err(TokenError::MechanismInvalid)
        );
        assert_eq!(
            session.operation_init(OperationType::Encrypt, CKM_DES_CBC, &[0u8; 8], Some(aes)),
            Err(TokenError::KeyTypeInconsistent)
        );
        assert_eq!(
            session.operation_init(OperationType::Encrypt, CKM_AES_CBC, &[0u8; 8], Some(aes)),
            Err(TokenError::MechanismParamInvalid)
        );
        assert_eq!(
            session.operation_init(OperationType::Encrypt, CKM_SHA256, &[], Some(aes)),
            Err(TokenError::MechanismInvalid)
        );
        assert_eq!(
            session.operation_init(OperationType::Encrypt, CKM_AES_ECB, &[], Some(9999)),
            Err(TokenError::KeyHandleInvalid)
        );

        session
            .set_attribute_value(aes, &[Attribute::bool(CKA_ENCRYPT, false)])
            .unwrap();
        assert_eq!(
            session.operation_init(OperationType::Encrypt, CKM_AES_ECB, &[], Some(aes)),
            Err(TokenError::KeyFunctionNotPermitted)
        );
        assert!(!session.is_operation_active(OperationType::Encrypt));
        session
            .operation_init(OperationType::Decrypt, CKM_AES_ECB, &[], Some(aes))
            .unwrap();
    }

    #[test]
    fn test_final_buffer_retry_matches_single_call() {
        let fx = software_fixture();
        let mut session = fx.session(false);
        let key = aes_key(&mut session, 24);
        let iv = [7u8; 16];
        let data = vec![0x5a; 40];

        let run = |session: &mut Session, small_first: bool| {
            session
                .operation_init(OperationType::Encrypt, CKM_AES_CBC_PAD, &iv, Some(key))
                .unwrap();
            let mut out = session.operation_update(OperationType::Encrypt, &data, 1024).unwrap();
            if small_first {
                let err = session.operation_final(OperationType::Encrypt, 3).unwrap_err();
                assert_eq!(err.required_len(), Some(16));
            }
            out.extend(session.operation_final(OperationType::Encrypt, 1024).unwrap());
            out
        };

        let direct = run(&mut session, false);
        let retried = run(&mut session, true);
        assert_eq!(direct, retried);
        assert_eq!(direct.len(), 48);
    }

    #[test]
    fn test_digest_multi_part() {
        let fx = software_fixture();
        let mut session = fx.session(true);
        session
            .operation_init(OperationType::Digest, CKM_SHA256, &[], None)
            .unwrap();
        session.operation_update(OperationType::Digest, b"hello ", 0).unwrap();
        session.operation_update(OperationType::Digest, b"world", 0).unwrap();
        let multi = session.operation_final(OperationType::Digest, 32).unwrap();

        session
            .operation_init(OperationType::Digest, CKM_SHA256, &[], None)
            .unwrap();
        let single = session
            .operation_single_part(OperationType::Digest, b"hello world", 32)
            .unwrap();
        assert_eq!(multi, single);
        assert_eq!(
            hex::encode(&single),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_hmac_sign_verify() {
        let fx = software_fixture();
        let mut session = fx.session(false);
        let key = hmac_key(&mut session);

        session
            .operation_init(OperationType::Sign, CKM_SHA256_HMAC, &[], Some(key))
            .unwrap();
        let mac = session
            .operation_single_part(OperationType::Sign, b"message", 64)
            .unwrap();
        assert_eq!(mac.len(), 32);

        session
            .operation_init(OperationType::Verify, CKM_SHA256_HMAC, &[], Some(key))
            .unwrap();
        session.verify(b"message", &mac).unwrap();

        let mut tampered = mac.clone();
        tampered[5] ^= 1;
        session
            .operation_init(OperationType::Verify, CKM_SHA256_HMAC, &[], Some(key))
            .unwrap();
        assert_eq!(session.verify(b"message", &tampered), Err(TokenError::SignatureInvalid));

        session
            .operation_init(OperationType::Verify, CKM_SHA256_HMAC, &[], Some(key))
            .unwrap();
        assert_eq!(session.verify(b"message", &mac[..31]), Err(TokenError::SignatureLenRange));
        assert!(!session.is_operation_active(OperationType::Verify));
    }

    fn check_rsa_sign_verify(session: &mut Session, private: ObjectHandle, public: ObjectHandle, mechanism: u64) {
        session
            .operation_init(OperationType::Sign, mechanism, &[], Some(private))
            .unwrap();
        session.operation_update(OperationType::Sign, b"to be ", 0).unwrap();
        session.operation_update(OperationType::Sign, b"signed", 0).unwrap();
        let signature = session.operation_final(OperationType::Sign, 512).unwrap();
        assert_eq!(signature.len(), 128);

        session
            .operation_init(OperationType::Verify, mechanism, &[], Some(public))
            .unwrap();
        session.operation_update(OperationType::Verify, b"to be signed", 0).unwrap();
        session.verify_final(&signature).unwrap();

        let mut tampered = signature.clone();
        tampered[0] ^= 0x80;
        session
            .operation_init(OperationType::Verify, mechanism, &[], Some(public))
            .unwrap();
        assert_eq!(session.verify(b"to be signed", &tampered), Err(TokenError::SignatureInvalid));

        session
            .operation_init(OperationType::Verify, mechanism, &[], Some(public))
            .unwrap();
        assert_eq!(
            session.verify(b"to be signed", &signature[1..]),
            Err(TokenError::SignatureLenRange)
        );
    }

    #[test]
    fn test_rsa_sign_verify_software() {
        let fx = software_fixture();
        let mut session = fx.session(false);
        let (public, private) = rsa_pair(&mut session, false);
        check_rsa_sign_verify(&mut session, private, public, CKM_SHA256_RSA_PKCS);
        check_rsa_sign_verify(&mut session, private, public, CKM_SHA1_RSA_PKCS);
        check_rsa_sign_verify(&mut session, private, public, CKM_RSA_PKCS);
    }

    #[test]
    fn test_rsa_sign_verify_tpm_backed() {
        let fx = fixture();
        let mut session = fx.session(false);
        let (public, private) = rsa_pair(&mut session, true);
        check_rsa_sign_verify(&mut session, private, public, CKM_SHA256_RSA_PKCS);
        check_rsa_sign_verify(&mut session, private, public, CKM_RSA_PKCS);

        // Raw PKCS#1: caller supplies the DigestInfo
        let digest_info = DigestAlgorithm::Sha256.digest_info(&crate::crypto::digest(DigestAlgorithm::Sha256, b"x"));
        session
            .operation_init(OperationType::Sign, CKM_RSA_PKCS, &[], Some(private))
            .unwrap();
        let signature = session
            .operation_single_part(OperationType::Sign, &digest_info, 512)
            .unwrap();
        session
            .operation_init(OperationType::Verify, CKM_RSA_PKCS, &[], Some(public))
            .unwrap();
        session.verify(&digest_info, &signature).unwrap();
    }

    #[test]
    fn test_rsa_encrypt_decrypt() {
        for fx in [software_fixture(), fixture()] {
            let mut session = fx.session(false);
            let (public, private) = rsa_pair(&mut session, true);
            session
                .operation_init(OperationType::Encrypt, CKM_RSA_PKCS, &[], Some(public))
                .unwrap();
            let ciphertext = session
                .operation_single_part(OperationType::Encrypt, b"secret", 512)
                .unwrap();
            session
                .operation_init(OperationType::Decrypt, CKM_RSA_PKCS, &[], Some(private))
                .unwrap();
            let plaintext = session
                .operation_single_part(OperationType::Decrypt, &ciphertext, 512)
                .unwrap();
            assert_eq!(plaintext, b"secret");
        }
    }

    #[test]
    fn test_rsa_wrong_direction() {
        let fx = software_fixture();
        let mut session = fx.session(false);
        let (public, _) = rsa_pair(&mut session, false);
        assert_eq!(
            session.operation_init(OperationType::Sign, CKM_RSA_PKCS, &[], Some(public)),
            Err(TokenError::KeyTypeInconsistent)
        );
    }

    #[test]
    fn test_rsa_key_size_bounds() {
        let fx = software_fixture();
        let mut config = (*fx.token.config).clone();
        config.software_rsa_min_bits = 2048;
        let mut token = fx.token.clone();
        token.config = std::sync::Arc::new(config);
        let mut session = fx.session(false);
        let (_, private) = rsa_pair(&mut session, false);

        let mut strict = Session::new(2, false, token);
        // Session objects are per session; reuse the key via a token copy
        let copy = session.copy_object(private, &[Attribute::bool(CKA_TOKEN, true)]).unwrap();
        assert_eq!(
            strict.operation_init(OperationType::Sign, CKM_SHA256_RSA_PKCS, &[], Some(copy)),
            Err(TokenError::KeySizeRange)
        );
    }

    #[test]
    fn test_ecdsa_sign_verify() {
        for fx in [software_fixture(), fixture()] {
            let mut session = fx.session(false);
            let (public, private) = session
                .generate_key_pair(
                    CKM_EC_KEY_PAIR_GEN,
                    &[
                        Attribute::bytes(CKA_EC_PARAMS, EC_PARAMS_P256.to_vec()),
                        Attribute::bool(CKA_TOKEN, true),
                    ],
                    &[Attribute::bool(CKA_TOKEN, true)],
                )
                .unwrap();

            session
                .operation_init(OperationType::Sign, CKM_ECDSA_SHA256, &[], Some(private))
                .unwrap();
            let signature = session
                .operation_single_part(OperationType::Sign, b"ec message", 128)
                .unwrap();
            assert_eq!(signature.len(), 64);

            session
                .operation_init(OperationType::Verify, CKM_ECDSA_SHA256, &[], Some(public))
                .unwrap();
            session.verify(b"ec message", &signature).unwrap();

            session
                .operation_init(OperationType::Verify, CKM_ECDSA_SHA256, &[], Some(public))
                .unwrap();
            assert_eq!(session.verify(b"other", &signature), Err(TokenError::SignatureInvalid));
        }
    }

    #[test]
    fn test_modulus_bits() {
        assert_eq!(modulus_bits(&[0x00, 0x80, 0x00]), 16);
        assert_eq!(modulus_bits(&[0x01, 0xff]), 9);
        assert_eq!(modulus_bits(&[0, 0]), 0);
    }
}
