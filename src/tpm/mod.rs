//! TPM access — the hardware root of trust behind every token
//!
//! - **TpmUtility**: the capability trait the core depends on
//! - **TpmBackend**: variant chosen once at startup (TPM 1.2 / TPM 2.0 / simulated / stub)
//! - **SimulatedTpm**: software device emulating either TPM generation
//! - **StubTpm**: stands in when no TPM is usable; every operation fails
//! - **TpmThread**: serializes all calls onto one dedicated worker

pub mod simulated;
pub mod stub;
pub mod thread;

pub use simulated::SimulatedTpm;
pub use stub::StubTpm;
pub use thread::TpmThread;

use crate::config::ServiceConfig;
use crate::error::TokenResult;
use crate::mechanism::MechanismType;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use zeroize::Zeroizing;

/// Slot identifier as seen by the TPM layer
pub type SlotId = u64;

/// Handle of a key currently loaded in the TPM
pub type TpmKeyHandle = u32;

/// TPM family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TpmVersion {
    V1_2,
    V2_0,
}

/// Elliptic curves the TPM can create keys on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccCurve {
    NistP256,
}

/// A key created or wrapped by the TPM: the opaque blob to persist and the
/// handle it is loaded under right now
#[derive(Debug, Clone)]
pub struct TpmKey {
    pub blob: Vec<u8>,
    pub handle: TpmKeyHandle,
}

/// Public half of a loaded key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKeyInfo {
    Rsa {
        modulus: Vec<u8>,
        public_exponent: Vec<u8>,
    },
    /// Uncompressed SEC1 point
    Ec { point: Vec<u8> },
}

/// Capability interface to a TPM
///
/// Failures are never retried here; callers decide. Key handles stay valid
/// until `unload_keys_for_slot` runs for their slot.
pub trait TpmUtility: Send {
    fn init(&mut self) -> TokenResult<()>;

    fn is_tpm_available(&self) -> bool;

    fn version(&self) -> Option<TpmVersion>;

    fn generate_random(&mut self, num_bytes: usize) -> TokenResult<Vec<u8>>;

    fn stir_random(&mut self, entropy: &[u8]) -> TokenResult<()>;

    /// Create an RSA key inside the TPM under the storage root
    fn generate_rsa_key(
        &mut self,
        slot: SlotId,
        modulus_bits: usize,
        public_exponent: &[u8],
        auth_data: &[u8],
    ) -> TokenResult<TpmKey>;

    fn generate_ecc_key(&mut self, slot: SlotId, curve: EccCurve, auth_data: &[u8]) -> TokenResult<TpmKey>;

    fn get_public_key(&mut self, handle: TpmKeyHandle) -> TokenResult<PublicKeyInfo>;

    /// Import caller-supplied RSA material so the private half only exists
    /// inside the TPM from now on
    fn wrap_rsa_key(
        &mut self,
        slot: SlotId,
        public_exponent: &[u8],
        modulus: &[u8],
        prime_factor: &[u8],
        auth_data: &[u8],
    ) -> TokenResult<TpmKey>;

    fn load_key(&mut self, slot: SlotId, key_blob: &[u8], auth_data: &[u8]) -> TokenResult<TpmKeyHandle>;

    fn load_key_with_parent(
        &mut self,
        slot: SlotId,
        key_blob: &[u8],
        auth_data: &[u8],
        parent: TpmKeyHandle,
    ) -> TokenResult<TpmKeyHandle>;

    fn unload_keys_for_slot(&mut self, slot: SlotId);

    fn bind(&mut self, handle: TpmKeyHandle, plaintext: &[u8]) -> TokenResult<Vec<u8>>;

    fn unbind(&mut self, handle: TpmKeyHandle, ciphertext: &[u8]) -> TokenResult<Zeroizing<Vec<u8>>>;

    /// Sign `input` (a DigestInfo for RSA, a hash for ECDSA)
    fn sign(
        &mut self,
        handle: TpmKeyHandle,
        mechanism: MechanismType,
        parameter: &[u8],
        input: &[u8],
    ) -> TokenResult<Vec<u8>>;

    /// Recover a token's master key using its authorization data
    fn authenticate(
        &mut self,
        slot: SlotId,
        auth_data: &[u8],
        auth_key_blob: &[u8],
        encrypted_master_key: &[u8],
    ) -> TokenResult<Zeroizing<Vec<u8>>>;

    /// Re-protect an auth-bearing blob (key or sealed data) under new auth data
    fn change_auth_data(
        &mut self,
        slot: SlotId,
        old_auth_data: &[u8],
        new_auth_data: &[u8],
        old_blob: &[u8],
    ) -> TokenResult<Vec<u8>>;

    fn seal_data(&mut self, slot: SlotId, auth_data: &[u8], data: &[u8]) -> TokenResult<Vec<u8>>;

    fn unseal_data(&mut self, slot: SlotId, auth_data: &[u8], sealed: &[u8]) -> TokenResult<Zeroizing<Vec<u8>>>;
}

/// TPM variants, selected once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TpmBackend {
    Tpm12,
    Tpm20,
    Simulated,
    Stub,
}

impl TpmBackend {
    pub fn name(&self) -> &str {
        match self {
            TpmBackend::Tpm12 => "TPM 1.2",
            TpmBackend::Tpm20 => "TPM 2.0",
            TpmBackend::Simulated => "Simulated (software)",
            TpmBackend::Stub => "Stub (no TPM)",
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, TpmBackend::Tpm12 | TpmBackend::Tpm20)
    }

    /// Bring up the configured variant. Hardware variants need a device
    /// driver this crate does not carry; they fall back to the simulated
    /// device emulating the same generation.
    pub fn select(config: &ServiceConfig) -> TokenResult<Box<dyn TpmUtility>> {
        let state_dir = config.simulated_tpm_state.clone();
        let mut tpm: Box<dyn TpmUtility> = match config.tpm_backend {
            TpmBackend::Tpm12 | TpmBackend::Tpm20 => {
                let version = if config.tpm_backend == TpmBackend::Tpm12 {
                    TpmVersion::V1_2
                } else {
                    TpmVersion::V2_0
                };
                if Self::probe_device() {
                    log::warn!(
                        "{} device present but no driver available, using simulated device",
                        config.tpm_backend.name()
                    );
                } else {
                    log::warn!("{} not available, falling back to simulated device", config.tpm_backend.name());
                }
                Box::new(SimulatedTpm::new(version, state_dir))
            }
            TpmBackend::Simulated => Box::new(SimulatedTpm::new(TpmVersion::V2_0, state_dir)),
            TpmBackend::Stub => Box::new(StubTpm),
        };

        if let Err(e) = tpm.init() {
            log::error!("TPM initialization failed, continuing without TPM: {}", e);
            return Ok(Box::new(StubTpm));
        }

        log::info!(
            "TPM backend initialized: {} (available={}, version={:?})",
            config.tpm_backend.name(),
            tpm.is_tpm_available(),
            tpm.version()
        );
        Ok(tpm)
    }

    fn probe_device() -> bool {
        std::path::Path::new("/dev/tpmrm0").exists() || std::path::Path::new("/dev/tpm0").exists()
    }
}

impl FromStr for TpmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tpm12" | "tpm1.2" => Ok(TpmBackend::Tpm12),
            "tpm20" | "tpm2.0" | "tpm2" => Ok(TpmBackend::Tpm20),
            "simulated" | "sim" => Ok(TpmBackend::Simulated),
            "stub" | "none" => Ok(TpmBackend::Stub),
            other => Err(format!("unknown TPM backend '{}'", other)),
        }
    }
}
