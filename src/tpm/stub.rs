//! Stand-in used when no TPM is usable

use super::{EccCurve, PublicKeyInfo, SlotId, TpmKey, TpmKeyHandle, TpmUtility, TpmVersion};
use crate::error::{TokenError, TokenResult};
use crate::mechanism::MechanismType;
use zeroize::Zeroizing;

fn unavailable<T>() -> TokenResult<T> {
    Err(TokenError::tpm("no TPM available"))
}

/// Every operation fails; `is_tpm_available` is false
pub struct StubTpm;

impl TpmUtility for StubTpm {
    fn init(&mut self) -> TokenResult<()> {
        Ok(())
    }

    fn is_tpm_available(&self) -> bool {
        false
    }

    fn version(&self) -> Option<TpmVersion> {
        None
    }

    fn generate_random(&mut self, _num_bytes: usize) -> TokenResult<Vec<u8>> {
        unavailable()
    }

    fn stir_random(&mut self, _entropy: &[u8]) -> TokenResult<()> {
        unavailable()
    }

    fn generate_rsa_key(&mut self, _: SlotId, _: usize, _: &[u8], _: &[u8]) -> TokenResult<TpmKey> {
        unavailable()
    }

    fn generate_ecc_key(&mut self, _: SlotId, _: EccCurve, _: &[u8]) -> TokenResult<TpmKey> {
        unavailable()
    }

    fn get_public_key(&mut self, _: TpmKeyHandle) -> TokenResult<PublicKeyInfo> {
        unavailable()
    }

    fn wrap_rsa_key(&mut self, _: SlotId, _: &[u8], _: &[u8], _: &[u8], _: &[u8]) -> TokenResult<TpmKey> {
        unavailable()
    }

    fn load_key(&mut self, _: SlotId, _: &[u8], _: &[u8]) -> TokenResult<TpmKeyHandle> {
        unavailable()
    }

    fn load_key_with_parent(&mut self, _: SlotId, _: &[u8], _: &[u8], _: TpmKeyHandle) -> TokenResult<TpmKeyHandle> {
        unavailable()
    }

    fn unload_keys_for_slot(&mut self, _slot: SlotId) {}

    fn bind(&mut self, _: TpmKeyHandle, _: &[u8]) -> TokenResult<Vec<u8>> {
        unavailable()
    }

    fn unbind(&mut self, _: TpmKeyHandle, _: &[u8]) -> TokenResult<Zeroizing<Vec<u8>>> {
        unavailable()
    }

    fn sign(&mut self, _: TpmKeyHandle, _: MechanismType, _: &[u8], _: &[u8]) -> TokenResult<Vec<u8>> {
        unavailable()
    }

    fn authenticate(&mut self, _: SlotId, _: &[u8], _: &[u8], _: &[u8]) -> TokenResult<Zeroizing<Vec<u8>>> {
        unavailable()
    }

    fn change_auth_data(&mut self, _: SlotId, _: &[u8], _: &[u8], _: &[u8]) -> TokenResult<Vec<u8>> {
        unavailable()
    }

    fn seal_data(&mut self, _: SlotId, _: &[u8], _: &[u8]) -> TokenResult<Vec<u8>> {
        unavailable()
    }

    fn unseal_data(&mut self, _: SlotId, _: &[u8], _: &[u8]) -> TokenResult<Zeroizing<Vec<u8>>> {
        unavailable()
    }
}
